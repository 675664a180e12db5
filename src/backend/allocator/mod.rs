//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around buffer creation
//! and handling:
//!
//! - [`stream`] allocates buffers as views onto persistent per-plane
//!   presentation streams.
//! - [`format`] holds the format/modifier tables negotiation works on.
//! - [`Swapchain`] recycles a fixed set of buffers for one output and
//!   tracks their age for damage computation.

pub mod format;
pub mod stream;

mod swapchain;
pub use swapchain::{Slot, Swapchain, SLOT_CAP};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use super::{BufferCaps, PlaneId};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}

/// Interface to create Buffers
pub trait Allocator {
    /// Buffer type produced by this allocator
    type Buffer: Buffer;
    /// Error type thrown if allocations fail
    type Error: std::error::Error + 'static;

    /// Capability classes of the buffers this allocator produces.
    fn buffer_caps(&self) -> BufferCaps;

    /// Try to create a buffer with the given dimensions and pixel format.
    ///
    /// `plane` names the display plane the buffer is destined for.
    /// Allocators whose buffers are views onto a per-plane presentation
    /// surface require it; allocators producing free-standing buffers may
    /// ignore it.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
        plane: Option<PlaneId>,
    ) -> Result<Self::Buffer, Self::Error>;
}
