// Buffer pool management.

pub mod manager;

pub use manager::{BufferConfig, BufferManager, FlushListener, PageHandle};
