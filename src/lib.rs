#![forbid(unsafe_code)]

pub mod block;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod pcache;
pub mod sync;
pub mod vfs;

pub use error::Result;
pub use kernel::{Config, Kernel};
