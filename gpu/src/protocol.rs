//! VirtIO GPU wire protocol (2D subset)
//!
//! Command and response types, numeric constants, and `#[repr(C)]` wire
//! structures for the virtio-gpu control queue. All multi-byte fields are
//! little-endian per the virtio specification.
//!
//! Every structure that crosses the guest/host boundary derives the
//! `zerocopy` marker traits so untrusted request bytes are parsed with
//! `FromBytes::read_from_bytes`/`read_from_prefix` and responses are
//! serialized with `IntoBytes::as_bytes` — no manual transmutes.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// ============================================================================
// Queues
// ============================================================================

/// Control queue index (all 2D commands and responses).
pub const VIRTIO_GPU_CONTROLQ: u16 = 0;
/// Cursor queue index (drained; cursor commands are not implemented).
pub const VIRTIO_GPU_CURSORQ: u16 = 1;
/// Number of virtqueues exposed by the device.
pub const VIRTIO_GPU_QNUM: usize = 2;

/// Ring size of both virtqueues.
pub const VIRTIO_GPU_RINGSZ: u16 = 64;
/// Maximum number of segments accepted in one descriptor chain.
pub const VIRTIO_GPU_MAXSEGS: usize = 256;

// ============================================================================
// Feature bits and device events
// ============================================================================

bitflags! {
    /// Virtio feature bits relevant to this device.
    ///
    /// Bit positions follow the virtio specification: transport bits live in
    /// the 32..63 range, device bits below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureBits: u64 {
        /// Modern (non-transitional) transport.
        const VERSION_1 = 1 << 32;
        /// Device supports EDID queries.
        const EDID = 1 << 1;
        /// Resource UUID assignment (not advertised).
        const RESOURCE_UUID = 1 << 2;
        /// Blob resources (not advertised).
        const RESOURCE_BLOB = 1 << 3;
        /// Context init for 3D (not advertised).
        const CONTEXT_INIT = 1 << 4;
    }
}

/// Feature set advertised to the guest.
pub const VIRTIO_GPU_HOSTCAPS: u64 = FeatureBits::VERSION_1.bits() | FeatureBits::EDID.bits();

/// Config-space event bit: the display reported a mode change.
pub const VIRTIO_GPU_EVENT_DISPLAY: u32 = 1 << 0;

// ============================================================================
// PCI identity (consumed by the bus glue, not by the core)
// ============================================================================

/// Virtio vendor id (Red Hat).
pub const VIRTIO_VENDOR: u16 = 0x1AF4;
/// Modern virtio-gpu PCI device id.
pub const VIRTIO_DEV_GPU: u16 = 0x1050;
/// Virtio device type number for GPU (subsystem device id).
pub const VIRTIO_TYPE_GPU: u16 = 16;
/// PCI revision advertised.
pub const VIRTIO_GPU_REVISION: u8 = 1;
/// PCI class: display controller.
pub const PCIC_DISPLAY: u8 = 0x03;
/// PCI subclass: other display controller.
pub const PCIS_DISPLAY_OTHER: u8 = 0x80;

// ============================================================================
// Command and response types
// ============================================================================

// --- 2D commands ---

/// Get display info (returns display modes for all scanouts)
pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
/// Create a 2D resource (host-side pixel buffer)
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
/// Destroy a 2D resource
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x0102;
/// Bind a resource to a display output
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
/// Flush a resource region to the display
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
/// Copy guest backing bytes into the host pixel buffer
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
/// Attach a guest scatter list as resource backing
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
/// Detach the guest backing from a resource
pub const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x0107;
/// Get capability set info (3D; not implemented)
pub const VIRTIO_GPU_CMD_GET_CAPSET_INFO: u32 = 0x0108;
/// Get capability set data (3D; not implemented)
pub const VIRTIO_GPU_CMD_GET_CAPSET: u32 = 0x0109;
/// Get EDID data for a scanout
pub const VIRTIO_GPU_CMD_GET_EDID: u32 = 0x010A;

// --- cursor commands (accepted on the cursor queue, not implemented) ---

/// Update the cursor image
pub const VIRTIO_GPU_CMD_UPDATE_CURSOR: u32 = 0x0300;
/// Move the cursor
pub const VIRTIO_GPU_CMD_MOVE_CURSOR: u32 = 0x0301;

// --- success responses ---

/// Success, no data payload
pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
/// Success, display info payload
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
/// Success, capset info payload (not emitted)
pub const VIRTIO_GPU_RESP_OK_CAPSET_INFO: u32 = 0x1102;
/// Success, capset data payload (not emitted)
pub const VIRTIO_GPU_RESP_OK_CAPSET: u32 = 0x1103;
/// Success, EDID data payload
pub const VIRTIO_GPU_RESP_OK_EDID: u32 = 0x1104;

// --- error responses ---

/// Error: unspecified (unknown command, unsupported format, generic failure)
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
/// Error: pixel buffer allocation failed
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
/// Error: invalid scanout id (reserved; single scanout advertised)
pub const VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
/// Error: unknown or duplicate resource id
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
/// Error: invalid context id (reserved; never emitted)
pub const VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
/// Error: rectangle out of bounds
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

// ============================================================================
// Guest pixel formats
// ============================================================================

pub const VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM: u32 = 2;
pub const VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM: u32 = 3;
pub const VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM: u32 = 4;
pub const VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM: u32 = 67;
pub const VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM: u32 = 68;
pub const VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM: u32 = 121;
pub const VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM: u32 = 134;

// ============================================================================
// Control header
// ============================================================================

/// Maximum scanouts representable in a display-info reply.
pub const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

bitflags! {
    /// Flags carried in the control header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u32 {
        /// The guest wants `fence_id` echoed in the response header.
        const FENCE = 1 << 0;
        /// `ring_idx` is meaningful (multi-queue extension; unused here).
        const INFO_RING_IDX = 1 << 1;
    }
}

/// Control header -- common 24-byte prefix of every command and response.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default)]
pub struct VirtioGpuCtrlHdr {
    /// Command or response type
    pub hdr_type: u32,
    /// Raw flag bits (see [`CtrlFlags`])
    pub flags: u32,
    /// Fence id, echoed in the reply when the fence flag is set
    pub fence_id: u64,
    /// 3D rendering context id (always 0 for 2D)
    pub ctx_id: u32,
    /// Ring index (multi-queue extension)
    pub ring_idx: u8,
    /// Padding to maintain alignment
    pub padding: [u8; 3],
}

impl VirtioGpuCtrlHdr {
    /// Byte size of the header on the wire.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Typed view of the raw flag bits. Unknown bits are dropped.
    pub fn ctrl_flags(&self) -> CtrlFlags {
        CtrlFlags::from_bits_truncate(self.flags)
    }

    /// Build a zeroed response header carrying `resp_type`.
    pub fn response(resp_type: u32) -> Self {
        Self {
            hdr_type: resp_type,
            ..Self::default()
        }
    }
}

// ============================================================================
// Command payloads
// ============================================================================

/// Rectangle within a resource.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioGpuRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl VirtioGpuRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when the rectangle lies fully inside a `width` x `height`
    /// resource. Sums are widened to `u64` so hostile coordinates cannot
    /// wrap around.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x <= width
            && self.y <= height
            && self.width <= width
            && self.height <= height
            && u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }
}

/// GET_EDID request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuGetEdid {
    pub hdr: VirtioGpuCtrlHdr,
    /// Scanout to query EDID for
    pub scanout: u32,
    pub padding: u32,
}

/// GET_EDID response.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuRespEdid {
    pub hdr: VirtioGpuCtrlHdr,
    /// Number of valid EDID bytes (one 128-byte block)
    pub size: u32,
    pub padding: u32,
    /// Raw EDID data; bytes past `size` are zero
    pub edid: [u8; 1024],
}

impl Default for VirtioGpuRespEdid {
    fn default() -> Self {
        Self {
            hdr: VirtioGpuCtrlHdr::default(),
            size: 0,
            padding: 0,
            edid: [0; 1024],
        }
    }
}

/// One display mode in a GET_DISPLAY_INFO response.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default)]
pub struct VirtioGpuDisplayOne {
    /// Active display rectangle (position and size)
    pub r: VirtioGpuRect,
    /// Non-zero when this scanout is enabled
    pub enabled: u32,
    pub flags: u32,
}

/// GET_DISPLAY_INFO response.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default)]
pub struct VirtioGpuRespDisplayInfo {
    pub hdr: VirtioGpuCtrlHdr,
    /// Display modes; only `pmodes[0]` is populated (one scanout)
    pub pmodes: [VirtioGpuDisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
}

/// RESOURCE_CREATE_2D request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuResourceCreate2d {
    pub hdr: VirtioGpuCtrlHdr,
    /// Guest-chosen non-zero resource id
    pub resource_id: u32,
    /// Guest pixel format (`VIRTIO_GPU_FORMAT_*`)
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

/// RESOURCE_UNREF request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuResourceUnref {
    pub hdr: VirtioGpuCtrlHdr,
    pub resource_id: u32,
    pub padding: u32,
}

/// One guest scatter-list element in RESOURCE_ATTACH_BACKING.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuMemEntry {
    /// Guest-physical address of the backing range
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    pub padding: u32,
}

impl VirtioGpuMemEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// RESOURCE_ATTACH_BACKING request header; `nr_entries` mem entries follow
/// across the remaining request segments.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuResourceAttachBacking {
    pub hdr: VirtioGpuCtrlHdr,
    pub resource_id: u32,
    pub nr_entries: u32,
}

/// RESOURCE_DETACH_BACKING request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuResourceDetachBacking {
    pub hdr: VirtioGpuCtrlHdr,
    pub resource_id: u32,
    pub padding: u32,
}

/// SET_SCANOUT request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuSetScanout {
    pub hdr: VirtioGpuCtrlHdr,
    /// Clip rectangle within the resource
    pub r: VirtioGpuRect,
    pub scanout_id: u32,
    /// Resource to bind; 0 unbinds the scanout
    pub resource_id: u32,
}

/// TRANSFER_TO_HOST_2D request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuTransferToHost2d {
    pub hdr: VirtioGpuCtrlHdr,
    /// Destination rectangle within the resource
    pub r: VirtioGpuRect,
    /// Byte offset into the guest backing
    pub offset: u64,
    pub resource_id: u32,
    pub padding: u32,
}

/// RESOURCE_FLUSH request.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct VirtioGpuResourceFlush {
    pub hdr: VirtioGpuCtrlHdr,
    pub r: VirtioGpuRect,
    pub resource_id: u32,
    pub padding: u32,
}

// ============================================================================
// Config space
// ============================================================================

/// Config-space register file (16 bytes, little-endian).
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default)]
pub struct VirtioGpuConfig {
    /// Pending device events (read-only; `VIRTIO_GPU_EVENT_*`)
    pub events_read: u32,
    /// Write-to-clear mask for `events_read`
    pub events_clear: u32,
    /// Number of scanouts (fixed at 1)
    pub num_scanouts: u32,
    /// Number of capability sets (fixed at 0)
    pub num_capsets: u32,
}

impl VirtioGpuConfig {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Byte offset of `events_clear`, the only writable register.
    pub const EVENTS_CLEAR_OFFSET: usize = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_values() {
        assert_eq!(VIRTIO_GPU_CMD_GET_DISPLAY_INFO, 0x0100);
        assert_eq!(VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING, 0x0107);
        assert_eq!(VIRTIO_GPU_CMD_GET_EDID, 0x010A);
        assert_eq!(VIRTIO_GPU_CMD_UPDATE_CURSOR, 0x0300);
        assert_eq!(VIRTIO_GPU_RESP_OK_NODATA, 0x1100);
        assert_eq!(VIRTIO_GPU_RESP_OK_EDID, 0x1104);
        assert_eq!(VIRTIO_GPU_RESP_ERR_UNSPEC, 0x1200);
        assert_eq!(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER, 0x1205);
    }

    #[test]
    fn test_ctrl_hdr_size() {
        // Virtio spec: control header is 24 bytes
        assert_eq!(VirtioGpuCtrlHdr::SIZE, 24);
    }

    #[test]
    fn test_wire_struct_sizes() {
        assert_eq!(core::mem::size_of::<VirtioGpuRect>(), 16);
        assert_eq!(core::mem::size_of::<VirtioGpuDisplayOne>(), 24);
        assert_eq!(core::mem::size_of::<VirtioGpuRespDisplayInfo>(), 24 + 16 * 24);
        assert_eq!(core::mem::size_of::<VirtioGpuResourceCreate2d>(), 40);
        assert_eq!(core::mem::size_of::<VirtioGpuResourceUnref>(), 32);
        assert_eq!(VirtioGpuMemEntry::SIZE, 16);
        assert_eq!(core::mem::size_of::<VirtioGpuResourceAttachBacking>(), 32);
        assert_eq!(core::mem::size_of::<VirtioGpuSetScanout>(), 48);
        assert_eq!(core::mem::size_of::<VirtioGpuTransferToHost2d>(), 56);
        assert_eq!(core::mem::size_of::<VirtioGpuResourceFlush>(), 48);
        assert_eq!(core::mem::size_of::<VirtioGpuGetEdid>(), 32);
        assert_eq!(core::mem::size_of::<VirtioGpuRespEdid>(), 24 + 8 + 1024);
        assert_eq!(VirtioGpuConfig::SIZE, 16);
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = VirtioGpuCtrlHdr {
            hdr_type: VIRTIO_GPU_CMD_RESOURCE_FLUSH,
            flags: CtrlFlags::FENCE.bits(),
            fence_id: 0xDEAD_BEEF,
            ctx_id: 0,
            ring_idx: 0,
            padding: [0; 3],
        };
        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), VirtioGpuCtrlHdr::SIZE);
        let parsed = VirtioGpuCtrlHdr::read_from_bytes(bytes).unwrap();
        assert_eq!(parsed.hdr_type, VIRTIO_GPU_CMD_RESOURCE_FLUSH);
        assert!(parsed.ctrl_flags().contains(CtrlFlags::FENCE));
        assert_eq!(parsed.fence_id, 0xDEAD_BEEF);
    }

    #[test]
    fn test_rect_bounds() {
        let rect = VirtioGpuRect::new(3, 0, 2, 2);
        assert!(!rect.fits_within(4, 2));
        assert!(VirtioGpuRect::new(0, 0, 4, 2).fits_within(4, 2));
        assert!(VirtioGpuRect::new(4, 2, 0, 0).fits_within(4, 2));
        // Widened sums must not wrap
        assert!(!VirtioGpuRect::new(u32::MAX, 0, 2, 2).fits_within(u32::MAX, u32::MAX));
    }

    #[test]
    fn test_hostcaps() {
        assert_eq!(VIRTIO_GPU_HOSTCAPS, (1u64 << 32) | (1 << 1));
    }
}
