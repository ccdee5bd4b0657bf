//! virtio-gpu device model library
//!
//! The command-processing core of a paravirtualized 2D graphics device for a
//! userspace VMM: descriptor-chain dispatch, the 2D resource model
//! (creation, guest-memory backing, host-side pixel transfer, scanout
//! binding, flush), and the response protocol including fences.
//!
//! ## Architecture
//!
//! - [`protocol`]: the virtio-gpu wire format (2D subset)
//! - [`queue`]: descriptor chains and the abstract transport seam
//! - [`memory`]: guest-physical to host translation with carried bounds
//! - [`image`] / [`resource`]: ref-counted pixel buffers and the id-keyed
//!   resource table
//! - [`display`]: the display backend seam (surfaces, EDID, bottom halves)
//! - `command`: header decode, dispatch, one handler per command
//! - `device`: config space, reset, the serialized queue pumps
//!
//! The transport (descriptor rings, interrupts, PCI plumbing) and the
//! display implementation are external collaborators; both are consumed
//! through traits so the core can be exercised hermetically in tests.

pub mod display;
pub mod error;
pub mod image;
pub mod memory;
pub mod protocol;
pub mod queue;
pub mod resource;

mod command;
mod device;

pub use device::VirtioGpu;
pub use error::GpuError;
