//! Error types for DMA allocation

use core::fmt;

/// Errors that can occur during DMA pool operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No contiguous run of free frames large enough for the request
    Exhausted {
        requested_frames: usize,
        free_frames: usize,
    },
    /// Zero-length allocation requested
    ZeroSize,
    /// Request exceeds the pool's total capacity
    TooLarge {
        requested_frames: usize,
        total_frames: usize,
    },
    /// Buffer does not belong to this pool
    ForeignBuffer,
    /// Pool region is not page-aligned or too small
    BadRegion,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                requested_frames,
                free_frames,
            } => write!(
                f,
                "pool exhausted: {requested_frames} contiguous frames requested, {free_frames} free"
            ),
            Self::ZeroSize => write!(f, "zero-length allocation"),
            Self::TooLarge {
                requested_frames,
                total_frames,
            } => write!(
                f,
                "request of {requested_frames} frames exceeds pool of {total_frames}"
            ),
            Self::ForeignBuffer => write!(f, "buffer does not belong to this pool"),
            Self::BadRegion => write!(f, "pool region unaligned or too small"),
        }
    }
}
