//! Host-side error types for the virtio-gpu device model.
//!
//! These cover failures of the device model itself (transport problems,
//! malformed descriptor chains, construction errors). Guest-visible command
//! failures are *not* errors in this sense; they travel back to the guest as
//! wire response codes (`VIRTIO_GPU_RESP_ERR_*` in [`crate::protocol`]).

use core::fmt;

/// Main device-model error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "device errors must be handled, not silently discarded"]
pub enum GpuError {
    /// A second device instance was constructed in the same process.
    AlreadyExists { device: &'static str },

    /// The transport handed back a descriptor chain the device cannot use.
    MalformedChain { reason: &'static str },

    /// A chain segment was smaller than the structure expected in it.
    ShortSegment { need: usize, got: usize },

    /// The transport failed while fetching a chain.
    TransportBroken { queue: &'static str },

    /// Pixel buffer allocation failed (zero dimension or size overflow).
    OutOfMemory { width: u32, height: u32 },

    /// A guest-supplied format has no host layout.
    UnsupportedFormat { format: u32 },

    /// A config-space access fell outside the register file.
    InvalidConfigAccess { offset: usize, size: usize },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::AlreadyExists { device } => {
                write!(f, "only one {} device can be created", device)
            }
            GpuError::MalformedChain { reason } => {
                write!(f, "malformed descriptor chain: {}", reason)
            }
            GpuError::ShortSegment { need, got } => {
                write!(f, "chain segment too small: need {} bytes, got {}", need, got)
            }
            GpuError::TransportBroken { queue } => {
                write!(f, "transport error on {} queue", queue)
            }
            GpuError::OutOfMemory { width, height } => {
                write!(f, "could not allocate {}x{} pixel buffer", width, height)
            }
            GpuError::UnsupportedFormat { format } => {
                write!(f, "unsupported guest pixel format {}", format)
            }
            GpuError::InvalidConfigAccess { offset, size } => {
                write!(f, "config access out of range: offset {} size {}", offset, size)
            }
        }
    }
}

impl std::error::Error for GpuError {}
