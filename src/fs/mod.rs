//! Filesystem drivers that plug into the VFS.

pub mod simplefs;

pub use simplefs::SimpleFs;
