pub mod refcount;
pub mod wait;

pub use refcount::RefCount;
pub use wait::{WaitQueue, WaitReason};
