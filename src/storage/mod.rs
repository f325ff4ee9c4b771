// Storage layer: disk space management.

pub mod disk;

pub use disk::{DiskSpaceManager, MemDiskManager};
