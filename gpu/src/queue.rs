//! Descriptor-chain transport seam
//!
//! The descriptor-ring machinery (available/used rings, interrupt raising,
//! MSI-X routing) lives in the VMM's transport layer. The device model only
//! consumes chains: an ordered list of host-visible byte ranges, each marked
//! device-readable or device-writable, fetched and released through the
//! [`VirtQueue`] trait.
//!
//! By convention the first segment of a chain carries the 24-byte control
//! header (plus the fixed request payload) and the last segment is the
//! device-writable reply buffer.

use zerocopy::FromBytes;

use crate::error::GpuError;
use crate::memory::GuestSlice;

/// One segment of a descriptor chain: a host byte range plus its direction.
#[derive(Debug, Clone, Copy)]
pub struct ChainSeg {
    /// Host-accessible bytes for this descriptor.
    pub slice: GuestSlice,
    /// True when the device may write this segment (reply buffers).
    pub writable: bool,
}

/// A fetched descriptor chain, owned by the device until released.
#[derive(Debug)]
pub struct DescChain {
    /// Ring index of the chain head, echoed back in `release_chain`.
    pub idx: u16,
    /// Chain segments in descriptor order.
    pub segs: Vec<ChainSeg>,
}

impl DescChain {
    /// Read a `T` from the start of segment `seg`.
    ///
    /// Fails when the chain has no such segment or the segment is shorter
    /// than `T`; request structures never span segments.
    pub fn read_obj<T: FromBytes>(&self, seg: usize) -> Result<T, GpuError> {
        let seg = self
            .segs
            .get(seg)
            .ok_or(GpuError::MalformedChain {
                reason: "missing request segment",
            })?;
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        let got = seg.slice.read(0, &mut buf);
        if got < buf.len() {
            return Err(GpuError::ShortSegment {
                need: buf.len(),
                got,
            });
        }
        T::read_from_bytes(&buf).map_err(|_| GpuError::MalformedChain {
            reason: "request bytes did not parse",
        })
    }

    /// Gather exactly `len` request bytes from segments `[1 .. n-1]`
    /// (everything between the header segment and the reply segment).
    ///
    /// Variable-length requests (the attach-backing scatter list) arrive
    /// spread across however many descriptors the guest felt like using.
    pub fn gather_payload(&self, len: usize) -> Result<Vec<u8>, GpuError> {
        // `len` comes from an untrusted count; grow only by what the chain
        // actually carries.
        let mut buf = Vec::new();
        if self.segs.len() >= 2 {
            for seg in &self.segs[1..self.segs.len() - 1] {
                let remaining = len - buf.len();
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(seg.slice.len());
                let start = buf.len();
                buf.resize(start + take, 0);
                let got = seg.slice.read(0, &mut buf[start..]);
                buf.truncate(start + got);
            }
        }
        if buf.len() < len {
            return Err(GpuError::ShortSegment {
                need: len,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    /// The reply segment (last in the chain), if it is device-writable.
    pub fn reply_seg(&self) -> Option<&ChainSeg> {
        self.segs.last().filter(|seg| seg.writable)
    }
}

/// Abstract virtqueue as seen from the device side.
///
/// Implemented by the VMM transport over its descriptor rings; implemented
/// over plain vectors in the test harness.
pub trait VirtQueue: Send {
    /// True when the guest has made at least one chain available.
    fn has_descs(&self) -> bool;

    /// Fetch the next available chain, reading at most `max_segs` segments.
    ///
    /// `Ok(None)` means the queue is currently empty. `Err` means the ring
    /// itself is corrupt; the caller abandons the current drain cycle.
    fn get_chain(&mut self, max_segs: usize) -> Result<Option<DescChain>, GpuError>;

    /// Return a chain to the guest, reporting how many bytes the device
    /// wrote into its writable segments.
    fn release_chain(&mut self, idx: u16, iolen: u32);

    /// End the drain cycle, raising a guest interrupt if requested and
    /// appropriate.
    fn end_chains(&mut self, interrupt: bool);
}
