//! Host pixel buffers
//!
//! A resource's pixels live in a host-owned [`PixelBuffer`] shared between
//! the queue pump (which fills it from guest backing) and the display
//! backend (which reads it while presenting). Sharing is an [`Arc`]: the
//! strong count plays the role the reference implementation gave to manual
//! image ref/unref around surface publication -- pixels cannot be freed
//! while the display still holds a surface over them.

use std::sync::Arc;

use crate::error::GpuError;
use crate::protocol::{
    VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM, VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM,
    VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM, VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM,
    VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM, VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM,
    VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM, VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM,
};

/// Host-side pixel layout of a resource.
///
/// Guest formats name bytes in memory order; host layouts name channels in
/// packed little-endian order, so each guest format maps to its byte-swapped
/// host counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPixelFormat {
    X8R8G8B8,
    A8R8G8B8,
    B8G8R8X8,
    B8G8R8A8,
    X8B8G8R8,
    A8B8G8R8,
    R8G8B8X8,
    R8G8B8A8,
}

impl HostPixelFormat {
    /// Map a guest-visible format code to its host layout.
    pub fn from_guest(format: u32) -> Result<Self, GpuError> {
        match format {
            VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM => Ok(Self::X8R8G8B8),
            VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM => Ok(Self::A8R8G8B8),
            VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM => Ok(Self::B8G8R8X8),
            VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM => Ok(Self::B8G8R8A8),
            VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM => Ok(Self::X8B8G8R8),
            VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM => Ok(Self::A8B8G8R8),
            VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM => Ok(Self::R8G8B8X8),
            VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM => Ok(Self::R8G8B8A8),
            other => Err(GpuError::UnsupportedFormat { format: other }),
        }
    }

    /// Bytes per pixel. All supported layouts are 32-bit.
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// A reference-counted rectangular pixel array in a fixed host layout.
///
/// Geometry is immutable after allocation; the byte store sits behind a
/// `spin::Mutex` because the pump writes rows into it while the display
/// worker may be reading it out for presentation.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    stride: usize,
    format: HostPixelFormat,
    pixels: spin::Mutex<Box<[u8]>>,
}

/// Shared handle to a pixel buffer. Cloning is the "ref", dropping the
/// "unref".
pub type SharedImage = Arc<PixelBuffer>;

impl PixelBuffer {
    /// Allocate a zeroed `width` x `height` buffer.
    ///
    /// Fails on degenerate dimensions or a `stride * height` overflow; the
    /// caller surfaces that as the out-of-memory wire error.
    pub fn new(width: u32, height: u32, format: HostPixelFormat) -> Result<SharedImage, GpuError> {
        let oom = GpuError::OutOfMemory { width, height };
        if width == 0 || height == 0 {
            return Err(oom);
        }
        let stride = (width as usize)
            .checked_mul(format.bytes_per_pixel())
            .ok_or(oom)?;
        let size = stride.checked_mul(height as usize).ok_or(oom)?;
        if size > isize::MAX as usize {
            return Err(oom);
        }
        Ok(Arc::new(Self {
            width,
            height,
            stride,
            format,
            pixels: spin::Mutex::new(vec![0u8; size].into_boxed_slice()),
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn format(&self) -> HostPixelFormat {
        self.format
    }

    /// Lock and access the pixel bytes.
    pub fn pixels(&self) -> spin::MutexGuard<'_, Box<[u8]>> {
        self.pixels.lock()
    }
}

impl core::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
