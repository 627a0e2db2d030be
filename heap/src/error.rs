use thiserror::Error;

/// Conditions the collector reports back to the mutator.
///
/// Everything else (nursery exhaustion, threshold-driven major collections)
/// is handled internally and never surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    #[error("out of memory: the system refused {size} bytes")]
    OutOfMemory { size: usize },

    /// Soft out-of-memory: the heap limit was reached. A second occurrence
    /// without relief aborts the process.
    #[error("heap limit exceeded: {used} bytes in use, limit is {limit} bytes")]
    HeapLimitExceeded { used: usize, limit: usize },

    #[error("allocation size overflow: {length} items of {item_size} bytes")]
    SizeOverflow { length: usize, item_size: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("invalid type `{name}`: {reason}")]
    InvalidType { name: String, reason: &'static str },
}

pub type GcResult<T> = Result<T, GcError>;

/// Aborts after an unrecoverable collector failure.
#[cold]
#[inline(never)]
pub fn fatal_error(msg: &str) -> ! {
    log::error!(target: "gc", "fatal: {msg}");
    eprintln!("fatal garbage collector error: {msg}");
    std::process::abort()
}
