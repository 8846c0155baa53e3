//! Virtio Driver Errors
//!
//! One error enum for the whole driver stack: transport probing, queue
//! construction, request submission and completion. Variants carry the
//! values a caller needs to log a useful message, nothing more.

use core::fmt;

use pinion_dma::DmaError;

/// Errors reported by the virtio transport, virtqueues and device clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// The MMIO region does not contain a usable virtio device.
    InvalidDevice {
        /// What check failed (bad magic, unsupported version, ...)
        reason: &'static str,
    },
    /// The selected queue index is not provided by the device, or is
    /// already set up.
    QueueNotAvail {
        /// Queue index that was selected
        index: u16,
    },
    /// Not enough free descriptors for the request.
    ///
    /// The queue is left untouched; the caller may retry after reaping
    /// completions.
    QueueFull {
        /// Descriptors the request needs
        needed: u16,
        /// Descriptors currently free
        free: u16,
    },
    /// A request parameter is malformed (empty buffer list, misaligned
    /// length, out-of-range sector, ...).
    InvalidArgument {
        /// What was wrong with the argument
        reason: &'static str,
    },
    /// DMA memory for rings or request buffers could not be allocated.
    OutOfMemory,
    /// The device did not complete a request within the configured
    /// timeout. The descriptors and buffers of the request stay
    /// allocated; see [`crate::blk::VirtioBlk`] for why.
    Timeout,
    /// The device completed a request with a non-OK status byte.
    Io {
        /// Device status byte from the request footer
        status: u8,
    },
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDevice { reason } => write!(f, "Invalid virtio device: {reason}"),
            Self::QueueNotAvail { index } => write!(f, "Virtqueue {index} not available"),
            Self::QueueFull { needed, free } => {
                write!(f, "Virtqueue full: need {needed} descriptors, {free} free")
            }
            Self::InvalidArgument { reason } => write!(f, "Invalid argument: {reason}"),
            Self::OutOfMemory => write!(f, "Out of DMA memory"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Io { status } => write!(f, "Device I/O error (status {status})"),
        }
    }
}

impl From<DmaError> for VirtioError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::ZeroSize => Self::InvalidArgument {
                reason: "zero-sized DMA allocation",
            },
            _ => Self::OutOfMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let e = VirtioError::QueueFull { needed: 3, free: 1 };
        let mut buf = [0u8; 64];
        let s = write_to(&mut buf, format_args!("{e}"));
        assert_eq!(s, "Virtqueue full: need 3 descriptors, 1 free");

        let e = VirtioError::Io { status: 1 };
        let s = write_to(&mut buf, format_args!("{e}"));
        assert_eq!(s, "Device I/O error (status 1)");
    }

    #[test]
    fn test_dma_error_conversion() {
        assert_eq!(
            VirtioError::from(DmaError::Exhausted {
                requested_frames: 4,
                free_frames: 1
            }),
            VirtioError::OutOfMemory
        );
        assert!(matches!(
            VirtioError::from(DmaError::ZeroSize),
            VirtioError::InvalidArgument { .. }
        ));
    }

    fn write_to<'a>(buf: &'a mut [u8], args: fmt::Arguments<'_>) -> &'a str {
        struct Cursor<'b> {
            buf: &'b mut [u8],
            len: usize,
        }
        impl fmt::Write for Cursor<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                let bytes = s.as_bytes();
                self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
                self.len += bytes.len();
                Ok(())
            }
        }
        let mut cursor = Cursor { buf, len: 0 };
        fmt::Write::write_fmt(&mut cursor, args).unwrap();
        let len = cursor.len;
        core::str::from_utf8(&buf[..len]).unwrap()
    }
}
