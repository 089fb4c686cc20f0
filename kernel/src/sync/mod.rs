//! Synchronization Primitives
//!
//! Safe synchronization and global state management for Rust 2024 edition.

pub mod once_lock;
pub mod wait_queue;

pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use wait_queue::{WaitQueue, WakeMode};
