//! Shared mock harness for the device-model integration tests: an
//! in-memory transport queue, a fixed guest-memory map, and a recording
//! display backend.

#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use virtio_gpu_dm::display::{fallback_edid, BhTask, DisplayBackend, DisplayInfo, Surface};
use virtio_gpu_dm::error::GpuError;
use virtio_gpu_dm::memory::{GuestMemory, GuestSlice};
use virtio_gpu_dm::protocol::*;
use virtio_gpu_dm::queue::{ChainSeg, DescChain, VirtQueue};
use virtio_gpu_dm::VirtioGpu;

use zerocopy::{FromBytes, Immutable, IntoBytes};

// ============================================================================
// Segment buffers
// ============================================================================

/// A chain-segment buffer the device reads or writes through raw pointers
/// while the test later inspects the contents.
pub struct SegBuf {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: tests are single-threaded around the device; the pump's writes and
// the test's reads never overlap in time.
unsafe impl Send for SegBuf {}
// SAFETY: see Send above.
unsafe impl Sync for SegBuf {}

impl SegBuf {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(bytes.into_boxed_slice()),
        })
    }

    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::new(vec![0u8; len])
    }

    fn guest_slice(&self) -> GuestSlice {
        // SAFETY: the boxed storage lives as long as this SegBuf; the queue
        // state retains every SegBuf of a popped chain until the test ends.
        unsafe {
            let buf = &mut *self.data.get();
            GuestSlice::new(buf.as_mut_ptr(), buf.len())
        }
    }

    /// Snapshot of the buffer contents.
    pub fn bytes(&self) -> Vec<u8> {
        // SAFETY: no device access is in flight when the test inspects.
        unsafe { (*self.data.get()).to_vec() }
    }

    /// Parse a wire structure from the start of the buffer.
    pub fn parse<T: FromBytes>(&self) -> T {
        let bytes = self.bytes();
        T::read_from_bytes(&bytes[..core::mem::size_of::<T>()]).unwrap()
    }
}

// ============================================================================
// Mock transport queue
// ============================================================================

struct PreparedChain {
    idx: u16,
    segs: Vec<(Arc<SegBuf>, bool)>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PreparedChain>,
    /// Chains handed to the device; retained so their buffers stay alive.
    live: Vec<PreparedChain>,
    released: Vec<(u16, u32)>,
    signals: Vec<bool>,
}

/// In-memory virtqueue: the test pushes prepared chains, the device drains
/// them, the test inspects releases and interrupt signals.
#[derive(Clone, Default)]
pub struct MockQueue {
    state: Arc<spin::Mutex<QueueState>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chain(&self, idx: u16, segs: Vec<(Arc<SegBuf>, bool)>) {
        self.state
            .lock()
            .pending
            .push_back(PreparedChain { idx, segs });
    }

    pub fn released(&self) -> Vec<(u16, u32)> {
        self.state.lock().released.clone()
    }

    pub fn signals(&self) -> usize {
        self.state.lock().signals.len()
    }
}

impl VirtQueue for MockQueue {
    fn has_descs(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    fn get_chain(&mut self, max_segs: usize) -> Result<Option<DescChain>, GpuError> {
        let mut state = self.state.lock();
        let Some(prepared) = state.pending.pop_front() else {
            return Ok(None);
        };
        let segs = prepared
            .segs
            .iter()
            .take(max_segs)
            .map(|(buf, writable)| ChainSeg {
                slice: buf.guest_slice(),
                writable: *writable,
            })
            .collect();
        let chain = DescChain {
            idx: prepared.idx,
            segs,
        };
        state.live.push(prepared);
        Ok(Some(chain))
    }

    fn release_chain(&mut self, idx: u16, iolen: u32) {
        self.state.lock().released.push((idx, iolen));
    }

    fn end_chains(&mut self, interrupt: bool) {
        self.state.lock().signals.push(interrupt);
    }
}

// ============================================================================
// Mock guest memory
// ============================================================================

struct MemRegion {
    gpa: u64,
    buf: Box<[u8]>,
}

/// Fixed guest-physical memory map backed by host allocations.
#[derive(Default)]
pub struct MockMemory {
    regions: Vec<MemRegion>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, gpa: u64, bytes: Vec<u8>) -> Self {
        self.regions.push(MemRegion {
            gpa,
            buf: bytes.into_boxed_slice(),
        });
        self
    }
}

impl GuestMemory for MockMemory {
    fn host_range(&self, gpa: u64, len: u32) -> Option<GuestSlice> {
        if len == 0 {
            return Some(GuestSlice::empty());
        }
        for region in &self.regions {
            let end = region.gpa + region.buf.len() as u64;
            if gpa >= region.gpa && gpa + u64::from(len) <= end {
                let off = (gpa - region.gpa) as usize;
                // SAFETY: the boxed region lives in the Arc<MockMemory> held
                // by the device for its whole lifetime; the device only
                // reads backing ranges.
                return Some(unsafe {
                    GuestSlice::new(region.buf.as_ptr().add(off) as *mut u8, len as usize)
                });
            }
        }
        None
    }
}

// ============================================================================
// Mock display backend
// ============================================================================

#[derive(Default)]
pub struct DisplayState {
    /// Arguments of every surface_set call (true = bound, false = unbound).
    pub sets: Vec<bool>,
    /// Last bound surface, if any.
    pub surface: Option<Surface>,
    pub updates: Vec<Surface>,
    pub tasks: Vec<BhTask>,
}

/// Recording display backend reporting a fixed 1024x768 output.
#[derive(Clone)]
pub struct MockDisplay {
    pub state: Arc<spin::Mutex<DisplayState>>,
    info: DisplayInfo,
}

impl Default for MockDisplay {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            info: DisplayInfo {
                xoff: 0,
                yoff: 0,
                width: 1024,
                height: 768,
            },
        }
    }
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplayBackend for MockDisplay {
    fn display_info(&self) -> DisplayInfo {
        self.info
    }

    fn read_edid(&self, edid: &mut [u8]) {
        edid.copy_from_slice(&fallback_edid()[..edid.len()]);
    }

    fn surface_set(&mut self, surface: Option<Surface>) {
        let mut state = self.state.lock();
        state.sets.push(surface.is_some());
        state.surface = surface;
    }

    fn surface_update(&mut self, surface: Surface) {
        self.state.lock().updates.push(surface);
    }

    fn submit_bh(&self, task: BhTask) {
        self.state.lock().tasks.push(task);
    }
}

// ============================================================================
// Test bench
// ============================================================================

/// A device wired to mocks, with handles kept for inspection.
pub struct TestBench {
    pub gpu: VirtioGpu,
    pub ctrl: MockQueue,
    pub cursor: MockQueue,
    pub display: MockDisplay,
    next_idx: u16,
}

impl TestBench {
    pub fn new() -> Self {
        Self::with_memory(MockMemory::new())
    }

    pub fn with_memory(mem: MockMemory) -> Self {
        let mem = Arc::new(mem);
        let ctrl = MockQueue::new();
        let cursor = MockQueue::new();
        let display = MockDisplay::new();
        // The device is a process-wide singleton and tests run in parallel;
        // wait for our turn.
        let gpu = loop {
            match VirtioGpu::new(
                Arc::clone(&mem) as Arc<dyn GuestMemory>,
                Box::new(ctrl.clone()),
                Box::new(cursor.clone()),
                Box::new(display.clone()),
            ) {
                Ok(gpu) => break gpu,
                Err(GpuError::AlreadyExists { .. }) => std::thread::yield_now(),
                Err(e) => panic!("device creation failed: {}", e),
            }
        };
        Self {
            gpu,
            ctrl,
            cursor,
            display,
            next_idx: 0,
        }
    }

    fn alloc_idx(&mut self) -> u16 {
        let idx = self.next_idx;
        self.next_idx += 1;
        idx
    }

    /// Queue a two-segment command chain (request + reply) on the control
    /// queue, returning the reply buffer.
    pub fn push_cmd<T: IntoBytes + Immutable>(&mut self, req: &T, resp_len: usize) -> Arc<SegBuf> {
        let idx = self.alloc_idx();
        let req_buf = SegBuf::new(req.as_bytes().to_vec());
        let resp_buf = SegBuf::zeroed(resp_len);
        self.ctrl
            .push_chain(idx, vec![(req_buf, false), (Arc::clone(&resp_buf), true)]);
        resp_buf
    }

    /// Queue a raw multi-segment chain on the control queue.
    pub fn push_raw(&mut self, segs: Vec<(Arc<SegBuf>, bool)>) {
        let idx = self.alloc_idx();
        self.ctrl.push_chain(idx, segs);
    }

    /// Run one control-queue drain cycle.
    pub fn pump(&mut self) {
        self.gpu.process_control_queue();
    }

    // ---- Command constructors ----

    pub fn create_2d(&mut self, id: u32, format: u32, width: u32, height: u32) -> Arc<SegBuf> {
        let req = VirtioGpuResourceCreate2d {
            hdr: hdr(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D),
            resource_id: id,
            format,
            width,
            height,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    pub fn unref(&mut self, id: u32) -> Arc<SegBuf> {
        let req = VirtioGpuResourceUnref {
            hdr: hdr(VIRTIO_GPU_CMD_RESOURCE_UNREF),
            resource_id: id,
            padding: 0,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    /// Attach backing with the entry array in a single extra segment.
    pub fn attach_backing(&mut self, id: u32, entries: &[(u64, u32)]) -> Arc<SegBuf> {
        let mut payload = Vec::new();
        for (addr, length) in entries {
            let entry = VirtioGpuMemEntry {
                addr: *addr,
                length: *length,
                padding: 0,
            };
            payload.extend_from_slice(entry.as_bytes());
        }
        self.attach_backing_raw(id, entries.len() as u32, vec![payload])
    }

    /// Attach backing with the serialized entry array split across the
    /// given request segments.
    pub fn attach_backing_raw(
        &mut self,
        id: u32,
        nr_entries: u32,
        payload_segs: Vec<Vec<u8>>,
    ) -> Arc<SegBuf> {
        let req = VirtioGpuResourceAttachBacking {
            hdr: hdr(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING),
            resource_id: id,
            nr_entries,
        };
        let resp_buf = SegBuf::zeroed(VirtioGpuCtrlHdr::SIZE);
        let mut segs = vec![(SegBuf::new(req.as_bytes().to_vec()), false)];
        for payload in payload_segs {
            segs.push((SegBuf::new(payload), false));
        }
        segs.push((Arc::clone(&resp_buf), true));
        self.push_raw(segs);
        resp_buf
    }

    pub fn detach_backing(&mut self, id: u32) -> Arc<SegBuf> {
        let req = VirtioGpuResourceDetachBacking {
            hdr: hdr(VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING),
            resource_id: id,
            padding: 0,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    pub fn set_scanout(&mut self, scanout_id: u32, id: u32, r: VirtioGpuRect) -> Arc<SegBuf> {
        let req = VirtioGpuSetScanout {
            hdr: hdr(VIRTIO_GPU_CMD_SET_SCANOUT),
            r,
            scanout_id,
            resource_id: id,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    pub fn transfer(&mut self, id: u32, r: VirtioGpuRect, offset: u64) -> Arc<SegBuf> {
        let req = VirtioGpuTransferToHost2d {
            hdr: hdr(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D),
            r,
            offset,
            resource_id: id,
            padding: 0,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    pub fn flush(&mut self, id: u32, r: VirtioGpuRect) -> Arc<SegBuf> {
        let req = VirtioGpuResourceFlush {
            hdr: hdr(VIRTIO_GPU_CMD_RESOURCE_FLUSH),
            r,
            resource_id: id,
            padding: 0,
        };
        self.push_cmd(&req, VirtioGpuCtrlHdr::SIZE)
    }

    /// Snapshot of the pixels behind the currently bound scanout surface.
    pub fn scanout_pixels(&self) -> Vec<u8> {
        let state = self.display.state.lock();
        let surface = state.surface.as_ref().expect("no surface bound");
        let pixels = surface.image.pixels().to_vec();
        pixels
    }
}

/// Bare request header for `cmd_type`.
pub fn hdr(cmd_type: u32) -> VirtioGpuCtrlHdr {
    VirtioGpuCtrlHdr {
        hdr_type: cmd_type,
        ..Default::default()
    }
}

/// Request header with the fence flag set.
pub fn fenced_hdr(cmd_type: u32, fence_id: u64) -> VirtioGpuCtrlHdr {
    VirtioGpuCtrlHdr {
        hdr_type: cmd_type,
        flags: CtrlFlags::FENCE.bits(),
        fence_id,
        ..Default::default()
    }
}

/// Response type in a reply buffer.
pub fn resp_type(buf: &SegBuf) -> u32 {
    buf.parse::<VirtioGpuCtrlHdr>().hdr_type
}
