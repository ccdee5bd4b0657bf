//! VirtIO GPU device model
//!
//! The device-side half of the split driver: owns the resource table and the
//! config registers, consumes descriptor chains from the transport, and
//! publishes pixel surfaces to the display backend.
//!
//! ## Threading
//!
//! All command processing runs on the display's bottom-half worker. A queue
//! notification from vCPU context only calls [`VirtioGpu::notify_queue`],
//! which schedules the matching pump on that worker; no command logic runs
//! on vCPU context. The transport's own device mutex is taken by the
//! transport layer around these entry points -- the core never holds it
//! across calls into the display.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use zerocopy::IntoBytes;

use crate::command::{cmd_unspec, Command};
use crate::display::{BhTask, DisplayBackend};
use crate::error::GpuError;
use crate::memory::GuestMemory;
use crate::protocol::{
    VirtioGpuConfig, VirtioGpuCtrlHdr, VIRTIO_GPU_CONTROLQ, VIRTIO_GPU_CURSORQ,
    VIRTIO_GPU_EVENT_DISPLAY, VIRTIO_GPU_HOSTCAPS, VIRTIO_GPU_MAXSEGS,
};
use crate::queue::{DescChain, VirtQueue};
use crate::resource::ResourceTable;

/// Number of live devices in this process. The reference device model
/// supports exactly one instance per VMM.
static DEVICE_COUNT: AtomicU32 = AtomicU32::new(0);

/// The virtio-gpu device model core.
pub struct VirtioGpu {
    /// Config-space register file.
    pub(crate) cfg: VirtioGpuConfig,
    /// Feature bits accepted by the guest driver.
    pub(crate) negotiated_features: u64,
    /// Raw device status from the transport's set-status callback.
    pub(crate) status: u64,
    /// Live 2D resources.
    pub(crate) resources: ResourceTable,
    /// Resource currently bound to the single scanout (0 = unbound).
    pub(crate) scanout_resource: u32,
    /// Guest-physical address translation.
    pub(crate) mem: Arc<dyn GuestMemory>,
    control_q: Box<dyn VirtQueue>,
    cursor_q: Box<dyn VirtQueue>,
    /// Display backend. Declared last: surfaces it may still hold drop
    /// after the queues, and the handle closes only at the very end of
    /// teardown.
    pub(crate) display: Box<dyn DisplayBackend>,
}

impl VirtioGpu {
    /// Create the device. Fails if another instance is alive in this
    /// process.
    pub fn new(
        mem: Arc<dyn GuestMemory>,
        control_q: Box<dyn VirtQueue>,
        cursor_q: Box<dyn VirtQueue>,
        display: Box<dyn DisplayBackend>,
    ) -> Result<Self, GpuError> {
        if DEVICE_COUNT
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("only one virtio-gpu device can be created");
            return Err(GpuError::AlreadyExists {
                device: "virtio-gpu",
            });
        }

        info!("virtio-gpu device created");
        Ok(Self {
            cfg: VirtioGpuConfig {
                events_read: 0,
                events_clear: 0,
                num_scanouts: 1,
                num_capsets: 0,
            },
            negotiated_features: 0,
            status: 0,
            resources: ResourceTable::new(),
            scanout_resource: 0,
            mem,
            control_q,
            cursor_q,
            display,
        })
    }

    // ---- Transport callbacks ----

    /// Feature bits offered to the guest.
    pub fn device_features(&self) -> u64 {
        VIRTIO_GPU_HOSTCAPS
    }

    /// Store the feature set the guest driver negotiated.
    pub fn apply_features(&mut self, negotiated: u64) {
        debug!("driver negotiated feature bits {:#x}", negotiated);
        self.negotiated_features = negotiated;
    }

    /// Record the device status written by the guest.
    pub fn set_status(&mut self, status: u64) {
        debug!("setting device status {:#x}", status);
        self.status = status;
    }

    /// Reset: discard every resource and unbind the scanout. The transport
    /// re-initializes its rings around this call.
    pub fn reset(&mut self) {
        debug!("resetting virtio-gpu device");
        self.resources.clear();
        self.scanout_resource = 0;
        self.display.surface_set(None);
        self.cfg.events_read = 0;
        self.cfg.events_clear = 0;
    }

    // ---- Config space ----

    /// Read `size` bytes of config space at `offset`, little-endian.
    pub fn cfg_read(&self, offset: usize, size: usize) -> Result<u32, GpuError> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= VirtioGpuConfig::SIZE && size <= 4)
            .ok_or(GpuError::InvalidConfigAccess { offset, size })?;
        let mut out = [0u8; 4];
        out[..size].copy_from_slice(&self.cfg.as_bytes()[offset..end]);
        Ok(u32::from_le_bytes(out))
    }

    /// Write config space. Only `events_clear` is writable: the written
    /// mask clears bits from both `events_read` and `events_clear`.
    pub fn cfg_write(&mut self, offset: usize, size: usize, value: u32) -> Result<(), GpuError> {
        if offset
            .checked_add(size)
            .filter(|end| *end <= VirtioGpuConfig::SIZE && size <= 4)
            .is_none()
        {
            return Err(GpuError::InvalidConfigAccess { offset, size });
        }
        if offset == VirtioGpuConfig::EVENTS_CLEAR_OFFSET && size == 4 {
            self.cfg.events_read &= !value;
            self.cfg.events_clear &= !value;
        } else {
            warn!("write to read-only config register at offset {}", offset);
        }
        Ok(())
    }

    /// The display reported a mode change: latch the event bit for the
    /// guest. Config-interrupt routing is the bus glue's job.
    pub fn display_event(&mut self) {
        self.cfg.events_read |= VIRTIO_GPU_EVENT_DISPLAY;
    }

    // ---- Observers ----

    /// Feature bits the guest driver accepted.
    pub fn negotiated_features(&self) -> u64 {
        self.negotiated_features
    }

    /// Last device status written by the guest.
    pub fn status(&self) -> u64 {
        self.status
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Id of the resource bound to the scanout, 0 when unbound.
    pub fn scanout_resource(&self) -> u32 {
        self.scanout_resource
    }

    // ---- Queue processing ----

    /// Queue-notification entry point, called from vCPU context. Schedules
    /// the matching pump on the display worker.
    pub fn notify_queue(&self, queue: u16) {
        match queue {
            VIRTIO_GPU_CONTROLQ => self.display.submit_bh(BhTask::ControlQueue),
            VIRTIO_GPU_CURSORQ => self.display.submit_bh(BhTask::CursorQueue),
            other => warn!("notification for unknown queue {}", other),
        }
    }

    /// Control-queue pump body. Runs on the display worker; drains every
    /// ready chain, writes responses, releases chains in FIFO order, then
    /// signals the queue.
    pub fn process_control_queue(&mut self) {
        while self.control_q.has_descs() {
            let chain = match self.control_q.get_chain(VIRTIO_GPU_MAXSEGS) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("control queue: {}", e);
                    return;
                }
            };
            let iolen = self.execute_control_chain(&chain);
            self.control_q.release_chain(chain.idx, iolen);
        }
        self.control_q.end_chains(true);
    }

    /// Decode and run one control chain, returning the reply length. A
    /// chain whose first segment cannot even hold the header produces no
    /// response; it is still released (with zero length) by the caller.
    fn execute_control_chain(&mut self, chain: &DescChain) -> u32 {
        let hdr = match chain.read_obj::<VirtioGpuCtrlHdr>(0) {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("dropping malformed chain: {}", e);
                return 0;
            }
        };
        let mut cmd = Command::new(hdr, chain);
        self.dispatch_control(&mut cmd);
        cmd.iolen
    }

    /// Cursor-queue pump body. Cursor commands are not implemented; every
    /// chain is answered by the unspec handler (fence still honored).
    pub fn process_cursor_queue(&mut self) {
        while self.cursor_q.has_descs() {
            let chain = match self.cursor_q.get_chain(VIRTIO_GPU_MAXSEGS) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    error!("cursor queue: {}", e);
                    return;
                }
            };
            let iolen = match chain.read_obj::<VirtioGpuCtrlHdr>(0) {
                Ok(hdr) => {
                    let mut cmd = Command::new(hdr, &chain);
                    cmd_unspec(&mut cmd);
                    cmd.iolen
                }
                Err(e) => {
                    error!("dropping malformed cursor chain: {}", e);
                    0
                }
            };
            self.cursor_q.release_chain(chain.idx, iolen);
        }
        self.cursor_q.end_chains(true);
    }
}

impl Drop for VirtioGpu {
    fn drop(&mut self) {
        // Resources first; the display field drops last by declaration
        // order, so any surface it still holds outlives the table teardown.
        self.resources.clear();
        DEVICE_COUNT.fetch_sub(1, Ordering::AcqRel);
    }
}
