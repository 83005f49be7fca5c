use thiserror::Error;

/// Errors surfaced by public engine operations.
///
/// Out-of-space during emission is handled internally by pushing a fresh
/// slab and never reaches callers; label-resolution failures are
/// programming errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no mapping obtainable within ±2 GiB of {near:#x}")]
    NearAllocation { near: u64 },

    #[error("guest page not readable at {addr:#x}")]
    PageUnreadable { addr: u64 },

    #[error("thread is not being followed")]
    NotFollowing,

    #[error("thread {0} is already being followed")]
    AlreadyFollowing(u64),

    #[error("thread {0} no longer exists")]
    ThreadVanished(u64),

    #[error("operation not supported on this platform")]
    Unsupported,

    #[error(transparent)]
    Os(#[from] std::io::Error),
}
