//! magalloc -- tiered byte allocator for a game engine's hot path.
//!
//! Three tiers sit on a common virtual-memory substrate:
//!
//! - [`BinnedAllocator`]: small objects (<= 4 KiB) served from fixed size
//!   classes, with per-thread magazines in front of a global intrusive
//!   free list and backoff-gated block growth.
//! - [`LargeAllocator`]: page-granular allocations with arbitrary alignment
//!   and optional guard pages, identified by a header magic.
//! - [`Arena`] / [`FrameArena`]: monotonic bump allocation over a single
//!   reservation, reset wholesale at frame boundaries.
//!
//! Allocation never blocks on other allocations and never panics on memory
//! pressure; exhaustion is reported as `None` and growth retries are gated
//! by an exponential backoff per size class.

pub mod alloc_api;
pub mod arena;
pub mod binned;
pub mod debug;
pub mod error;
pub mod large;
pub mod magazine;
pub mod util;
pub mod vm;

pub use alloc_api::{default_allocator, OwnedBuf, RawAllocator};
pub use arena::{with_frame_arena, Arena, FrameArena};
pub use binned::{global, BinnedAllocator};
pub use error::VmError;
pub use large::LargeAllocator;
pub use vm::{Protection, VmRegion};
