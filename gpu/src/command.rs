//! Control-queue command decoding and handlers
//!
//! Every descriptor chain carries one command: a 24-byte control header in
//! the first segment, the fixed request payload behind it, and a writable
//! reply segment at the end of the chain. [`Command`] is the per-chain view;
//! the `cmd_*` methods on [`VirtioGpu`] are the handlers, one per command
//! type, each ending in the shared reply epilogue of [`Command::complete`].

use std::sync::Arc;

use log::{debug, error, info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::device::VirtioGpu;
use crate::display::{Surface, EDID_BLOCK_SIZE};
use crate::error::GpuError;
use crate::image::{HostPixelFormat, PixelBuffer};
use crate::memory::GuestSlice;
use crate::protocol::*;
use crate::queue::DescChain;
use crate::resource::Resource2d;

/// A pending command: parsed header plus the chain it arrived on.
pub(crate) struct Command<'a> {
    /// Request control header from the first segment.
    pub hdr: VirtioGpuCtrlHdr,
    chain: &'a DescChain,
    /// Bytes written into the reply segment; reported to the transport on
    /// chain release.
    pub iolen: u32,
}

/// Reply structures all begin with a control header the epilogue fills in.
pub(crate) trait WireReply: IntoBytes + Immutable {
    fn hdr_mut(&mut self) -> &mut VirtioGpuCtrlHdr;
}

impl WireReply for VirtioGpuCtrlHdr {
    fn hdr_mut(&mut self) -> &mut VirtioGpuCtrlHdr {
        self
    }
}

impl WireReply for VirtioGpuRespDisplayInfo {
    fn hdr_mut(&mut self) -> &mut VirtioGpuCtrlHdr {
        &mut self.hdr
    }
}

impl WireReply for VirtioGpuRespEdid {
    fn hdr_mut(&mut self) -> &mut VirtioGpuCtrlHdr {
        &mut self.hdr
    }
}

impl<'a> Command<'a> {
    pub(crate) fn new(hdr: VirtioGpuCtrlHdr, chain: &'a DescChain) -> Self {
        Self {
            hdr,
            chain,
            iolen: 0,
        }
    }

    /// Read the fixed request structure from the first segment.
    fn read_req<T: FromBytes>(&self) -> Result<T, GpuError> {
        self.chain.read_obj(0)
    }

    /// Shared reply epilogue: propagate the fence, serialize, copy into the
    /// last (writable) segment, record the written length.
    ///
    /// A chain without a usable reply segment gets no response; the pump
    /// still releases it with `iolen == 0` so the ring cannot stall.
    fn complete<R: WireReply>(&mut self, mut resp: R) {
        if self.hdr.ctrl_flags().contains(CtrlFlags::FENCE) {
            let hdr = resp.hdr_mut();
            hdr.flags |= CtrlFlags::FENCE.bits();
            hdr.fence_id = self.hdr.fence_id;
        }
        let bytes = resp.as_bytes();
        let Some(seg) = self.chain.reply_seg() else {
            error!("chain has no writable reply segment");
            self.iolen = 0;
            return;
        };
        if seg.slice.len() < bytes.len() {
            error!(
                "reply segment too small: need {} bytes, got {}",
                bytes.len(),
                seg.slice.len()
            );
            self.iolen = 0;
            return;
        }
        self.iolen = seg.slice.write(0, bytes) as u32;
    }

    /// Reply with a bare header carrying `resp_type`.
    fn complete_nodata(&mut self, resp_type: u32) {
        self.complete(VirtioGpuCtrlHdr::response(resp_type));
    }
}

/// Unknown or unimplemented command: all-zero header reply with the unspec
/// error, fence still honored. Also serves every cursor-queue command.
pub(crate) fn cmd_unspec(cmd: &mut Command) {
    info!("unspec command {:#06x} received", cmd.hdr.hdr_type);
    cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
}

impl VirtioGpu {
    /// Dispatch one control-queue command to its handler.
    pub(crate) fn dispatch_control(&mut self, cmd: &mut Command) {
        match cmd.hdr.hdr_type {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => self.cmd_get_display_info(cmd),
            VIRTIO_GPU_CMD_GET_EDID => self.cmd_get_edid(cmd),
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => self.cmd_resource_create_2d(cmd),
            VIRTIO_GPU_CMD_RESOURCE_UNREF => self.cmd_resource_unref(cmd),
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => self.cmd_resource_attach_backing(cmd),
            VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => self.cmd_resource_detach_backing(cmd),
            VIRTIO_GPU_CMD_SET_SCANOUT => self.cmd_set_scanout(cmd),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => self.cmd_transfer_to_host_2d(cmd),
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => self.cmd_resource_flush(cmd),
            _ => cmd_unspec(cmd),
        }
    }

    /// GET_DISPLAY_INFO: report the backend's geometry as scanout 0.
    fn cmd_get_display_info(&mut self, cmd: &mut Command) {
        let info = self.display.display_info();
        let mut resp = VirtioGpuRespDisplayInfo {
            hdr: VirtioGpuCtrlHdr::response(VIRTIO_GPU_RESP_OK_DISPLAY_INFO),
            ..Default::default()
        };
        resp.pmodes[0].enabled = 1;
        resp.pmodes[0].r = VirtioGpuRect::new(info.xoff, info.yoff, info.width, info.height);
        cmd.complete(resp);
    }

    /// GET_EDID: one 128-byte block from the backend.
    ///
    /// The requested scanout index is accepted without validation; the
    /// single backend serves scanout 0 regardless.
    fn cmd_get_edid(&mut self, cmd: &mut Command) {
        let _req: VirtioGpuGetEdid = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("get_edid: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };
        let mut resp = VirtioGpuRespEdid {
            hdr: VirtioGpuCtrlHdr::response(VIRTIO_GPU_RESP_OK_EDID),
            size: EDID_BLOCK_SIZE as u32,
            ..Default::default()
        };
        self.display.read_edid(&mut resp.edid[..EDID_BLOCK_SIZE]);
        cmd.complete(resp);
    }

    /// RESOURCE_CREATE_2D: allocate a host pixel buffer for a fresh id.
    fn cmd_resource_create_2d(&mut self, cmd: &mut Command) {
        let req: VirtioGpuResourceCreate2d = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("resource_create_2d: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        if req.resource_id == 0 || self.resources.find(req.resource_id).is_some() {
            debug!("resource {} already exists", req.resource_id);
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        }

        let format = match HostPixelFormat::from_guest(req.format) {
            Ok(format) => format,
            Err(e) => {
                error!("resource {}: {}", req.resource_id, e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        let image = match PixelBuffer::new(req.width, req.height, format) {
            Ok(image) => image,
            Err(e) => {
                error!("could not create resource {}: {}", req.resource_id, e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY);
            }
        };

        let resource = Resource2d {
            id: req.resource_id,
            width: req.width,
            height: req.height,
            format,
            image,
            backing: None,
        };
        if self.resources.insert(resource).is_err() {
            // Checked above; unreachable without a concurrent mutator.
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        }
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }

    /// RESOURCE_UNREF: drop the resource; the display keeps its own image
    /// ref until any published surface is consumed.
    fn cmd_resource_unref(&mut self, cmd: &mut Command) {
        let req: VirtioGpuResourceUnref = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("resource_unref: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };
        match self.resources.remove(req.resource_id) {
            Some(_) => cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA),
            None => {
                error!("illegal resource id {}", req.resource_id);
                cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID)
            }
        }
    }

    /// RESOURCE_ATTACH_BACKING: translate the guest scatter list and store
    /// it as the resource's backing.
    ///
    /// The entry array follows the fixed request and may be spread across
    /// any number of request segments. An entry the mapper cannot translate
    /// degrades to a zero-length range that transfers skip.
    fn cmd_resource_attach_backing(&mut self, cmd: &mut Command) {
        let req: VirtioGpuResourceAttachBacking = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("resource_attach_backing: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        if self.resources.find(req.resource_id).is_none() {
            error!("illegal resource id {}", req.resource_id);
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        }

        let Some(payload_len) = (req.nr_entries as usize).checked_mul(VirtioGpuMemEntry::SIZE)
        else {
            warn!("resource {}: entry count overflows", req.resource_id);
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
        };
        let payload = match cmd.chain.gather_payload(payload_len) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("resource {}: backing entries truncated: {}", req.resource_id, e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        // The gathered bytes have no alignment guarantee; decode each entry
        // by copy.
        let mut backing = Vec::with_capacity(payload.len() / VirtioGpuMemEntry::SIZE);
        for chunk in payload.chunks_exact(VirtioGpuMemEntry::SIZE) {
            let entry = match VirtioGpuMemEntry::read_from_bytes(chunk) {
                Ok(entry) => entry,
                Err(_) => {
                    warn!("resource {}: backing entries did not parse", req.resource_id);
                    return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
                }
            };
            let range = self
                .mem
                .host_range(entry.addr, entry.length)
                .unwrap_or_else(GuestSlice::empty);
            backing.push(range);
        }

        if let Some(res) = self.resources.find_mut(req.resource_id) {
            res.backing = Some(backing);
        }
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }

    /// RESOURCE_DETACH_BACKING: drop the backing vector. Succeeds even for
    /// unknown resources.
    fn cmd_resource_detach_backing(&mut self, cmd: &mut Command) {
        let req: VirtioGpuResourceDetachBacking = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("resource_detach_backing: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };
        if let Some(res) = self.resources.find_mut(req.resource_id) {
            res.backing = None;
        }
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }

    /// SET_SCANOUT: bind a resource to the output, or unbind with id 0.
    fn cmd_set_scanout(&mut self, cmd: &mut Command) {
        let req: VirtioGpuSetScanout = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("set_scanout: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        // resource_id 0 is the unbind request; it can never be in the table,
        // so a failed lookup covers both the unbind and unknown-id cases.
        let surface = match self.resources.find(req.resource_id) {
            None => None,
            Some(res) => {
                if !req.r.fits_within(res.width, res.height) {
                    error!("scanout bound outside underlying resource");
                    return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
                }
                Some(Surface {
                    image: Arc::clone(&res.image),
                    x: 0,
                    y: 0,
                    width: res.width,
                    height: res.height,
                    stride: res.image.stride(),
                    format: res.format,
                })
            }
        };

        self.scanout_resource = surface.as_ref().map_or(0, |_| req.resource_id);
        self.display.surface_set(surface);
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }

    /// TRANSFER_TO_HOST_2D: copy rectangle rows from the guest scatter list
    /// into the host pixel buffer.
    fn cmd_transfer_to_host_2d(&mut self, cmd: &mut Command) {
        let req: VirtioGpuTransferToHost2d = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("transfer_to_host_2d: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        let Some(res) = self.resources.find(req.resource_id) else {
            error!("illegal resource id {}", req.resource_id);
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        };
        if !req.r.fits_within(res.width, res.height) {
            error!("transfer bounds outside resource");
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let stride = res.image.stride();
        let bpp = res.format.bytes_per_pixel();
        let backing = res.backing.as_deref().unwrap_or(&[]);
        let row_bytes = req.r.width as usize * bpp;
        let mut pixels = res.image.pixels();

        for h in 0..req.r.height {
            // Logical offset of this row within the linearized backing.
            // Saturation is safe: an offset past every scatter element
            // simply copies nothing, matching the walk below.
            let mut src_offset = req
                .offset
                .saturating_add(stride as u64 * u64::from(h));
            let dst_offset = (req.r.y + h) as usize * stride + req.r.x as usize * bpp;
            let mut done = 0usize;

            for seg in backing {
                if seg.is_empty() {
                    continue;
                }
                let seg_len = seg.len() as u64;
                if src_offset < seg_len {
                    let take = (row_bytes - done).min((seg_len - src_offset) as usize);
                    let dst = &mut pixels[dst_offset + done..dst_offset + done + take];
                    done += seg.read(src_offset as usize, dst);
                    src_offset = 0;
                    if done >= row_bytes {
                        break;
                    }
                } else {
                    src_offset -= seg_len;
                }
            }
        }

        drop(pixels);
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }

    /// RESOURCE_FLUSH: present a damaged region of the resource.
    fn cmd_resource_flush(&mut self, cmd: &mut Command) {
        let req: VirtioGpuResourceFlush = match cmd.read_req() {
            Ok(req) => req,
            Err(e) => {
                warn!("resource_flush: {}", e);
                return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_UNSPEC);
            }
        };

        let Some(res) = self.resources.find(req.resource_id) else {
            error!("illegal resource id {}", req.resource_id);
            return cmd.complete_nodata(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
        };

        let surface = Surface {
            image: Arc::clone(&res.image),
            x: req.r.x,
            y: req.r.y,
            width: res.width,
            height: res.height,
            stride: res.image.stride(),
            format: res.format,
        };
        self.display.surface_update(surface);
        cmd.complete_nodata(VIRTIO_GPU_RESP_OK_NODATA);
    }
}
