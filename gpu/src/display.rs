//! Display backend seam
//!
//! The display backend owns the output surface (a window, a framebuffer, a
//! remote viewer) and the bottom-half worker thread the queue pump runs on.
//! The device model drives it through [`DisplayBackend`] and never blocks
//! on presentation: `surface_set`/`surface_update` hand over a shared image
//! reference and return.

use lazy_static::lazy_static;

use crate::image::{HostPixelFormat, SharedImage};

/// Size of the EDID reply buffer on the wire.
pub const EDID_MAX_SIZE: usize = 1024;
/// Size of one EDID block; this device reports exactly one.
pub const EDID_BLOCK_SIZE: usize = 128;

/// Geometry of the display output, as reported to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub xoff: u32,
    pub yoff: u32,
    pub width: u32,
    pub height: u32,
}

/// A published view of a resource's pixels.
///
/// The embedded [`SharedImage`] clone is the display's reference: the pixel
/// buffer stays alive until the backend drops the surface, however long
/// presentation takes.
#[derive(Debug, Clone)]
pub struct Surface {
    pub image: SharedImage,
    /// Origin of the damaged region (flush) or 0,0 (scanout bind).
    pub x: u32,
    pub y: u32,
    /// Full resource dimensions.
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel row.
    pub stride: usize,
    pub format: HostPixelFormat,
}

/// Work the device asks the display worker to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BhTask {
    /// Drain the control queue (calls back into
    /// `VirtioGpu::process_control_queue`).
    ControlQueue,
    /// Drain the cursor queue.
    CursorQueue,
}

/// Interface the device model consumes; implemented by the VMM's display
/// stack.
///
/// All methods may be called only from the bottom-half worker, except
/// `submit_bh` which the transport invokes from vCPU context on a queue
/// notification.
pub trait DisplayBackend: Send {
    /// Current output geometry.
    fn display_info(&self) -> DisplayInfo;

    /// Write one EDID block describing the output into `edid`
    /// (`edid.len() == EDID_BLOCK_SIZE`). Backends without real monitor
    /// data can serve [`fallback_edid`].
    fn read_edid(&self, edid: &mut [u8]);

    /// Bind the scanout to `surface`, or unbind it with `None`.
    fn surface_set(&mut self, surface: Option<Surface>);

    /// Present a damaged region of the currently bound surface.
    fn surface_update(&mut self, surface: Surface);

    /// Schedule `task` on the display worker thread.
    fn submit_bh(&self, task: BhTask);
}

lazy_static! {
    /// A minimal EDID 1.4 block advertising a 1024x768@60 preferred mode,
    /// for backends that have no monitor EDID to forward.
    static ref FALLBACK_EDID: [u8; EDID_BLOCK_SIZE] = build_fallback_edid();
}

/// One valid EDID block with a correct checksum.
pub fn fallback_edid() -> &'static [u8; EDID_BLOCK_SIZE] {
    &FALLBACK_EDID
}

fn build_fallback_edid() -> [u8; EDID_BLOCK_SIZE] {
    let mut edid = [0u8; EDID_BLOCK_SIZE];

    // Fixed header pattern
    edid[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);

    // Manufacturer id "VGP" in compressed 5-bit letters: V=22, G=7, P=16
    // => 0b10110_00111_10000 = 0x58F0
    edid[8] = 0x58;
    edid[9] = 0xF0;

    // Product code, serial, week/year of manufacture
    edid[10] = 0x01;
    edid[17] = 30; // 1990 + 30

    // EDID 1.4, digital input
    edid[18] = 1;
    edid[19] = 4;
    edid[20] = 0x80;
    // Gamma 2.2, features: RGB + preferred timing
    edid[23] = 120;
    edid[24] = 0x0A;

    // Established timings: 640x480@60, 800x600@60, 1024x768@60
    edid[35] = 0x21;
    edid[36] = 0x08;

    // Standard timings unused
    for i in 0..8 {
        edid[38 + i * 2] = 0x01;
        edid[38 + i * 2 + 1] = 0x01;
    }

    // Detailed timing descriptor: 1024x768@60 (65 MHz pixel clock, VESA)
    let dtd = 54;
    edid[dtd] = 0x64;
    edid[dtd + 1] = 0x19;
    edid[dtd + 2] = 0x00; // hactive low (1024)
    edid[dtd + 3] = 0x40; // hblank low (320)
    edid[dtd + 4] = 0x41; // hactive/hblank high
    edid[dtd + 5] = 0x00; // vactive low (768)
    edid[dtd + 6] = 0x26; // vblank low (38)
    edid[dtd + 7] = 0x30; // vactive/vblank high
    edid[dtd + 8] = 0x18; // hsync offset 24
    edid[dtd + 9] = 0x88; // hsync width 136
    edid[dtd + 10] = 0x36; // vsync offset 3, width 6
    edid[dtd + 17] = 0x13; // separate sync, +H +V

    // Monitor name descriptor
    edid[72..90].copy_from_slice(&[
        0x00, 0x00, 0x00, 0xFC, 0x00, b'v', b'g', b'p', b'u', b'-', b'd', b'm', b'\n', b' ',
        b' ', b' ', b' ', b' ',
    ]);

    // Remaining descriptors: dummy
    for base in [90usize, 108] {
        edid[base + 3] = 0x10;
    }

    // No extension blocks; checksum makes the block sum to 0 mod 256
    let sum: u8 = edid.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    edid[127] = 0u8.wrapping_sub(sum);
    edid
}
