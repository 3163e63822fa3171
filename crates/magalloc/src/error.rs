use thiserror::Error;

/// Failures of the virtual-memory substrate.
///
/// These never cross the allocator surface: the binned, large and arena
/// tiers translate them into `None` (plus growth-failure bookkeeping where
/// applicable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("address space reservation failed")]
    ReserveFailed,

    #[error("page commit failed (out of memory)")]
    CommitFailed,

    #[error("page protection change failed")]
    ProtectFailed,

    #[error("byte range out of region bounds or misaligned")]
    InvalidParameters,
}
