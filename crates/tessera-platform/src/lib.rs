//! # Tessera Platform
//!
//! Platform abstraction layer for the Tessera residency manager.
//!
//! This crate provides:
//! - **FileSystem**: positional async reads against one shared handle, and
//!   async file writing for tooling
//! - **Runtime**: construction of the background I/O runtime tile loads run on

pub mod filesystem;

pub use filesystem::{AsyncFileHandle, RandomAccessFile};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Read of {len} bytes at offset {offset} is outside a {file_len}-byte file")]
    OutOfRange { offset: u64, len: usize, file_len: u64 },

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Build the multi-threaded runtime background I/O runs on
pub fn io_runtime(worker_threads: usize) -> PlatformResult<tokio::runtime::Runtime> {
    let worker_threads = worker_threads.max(1);
    log::debug!("Starting I/O runtime with {} workers", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("tessera-io")
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Number of worker threads to use when the caller has no preference
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .min(8)
}
