//! Backend helpers for presentation-surface management.
//!
//! Collection of common traits and implementations around buffer
//! allocation, recycling and hand-off to a display:
//!
//! - [`allocator`] handles buffer creation, the per-plane stream pool and
//!   the [`Swapchain`](allocator::Swapchain) helper.
//! - [`renderer`] is the small rendering surface the output layer drives.
//! - [`stream`] is the capability-context boundary the stream allocator is
//!   built on.

pub mod allocator;
pub mod renderer;
pub mod stream;

bitflags::bitflags! {
    /// Buffer capability classes shared between a display backend, a
    /// renderer and an allocator.
    ///
    /// An output can only be set up for rendering when the allocator has at
    /// least one class in common with both the display backend and the
    /// renderer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferCaps: u32 {
        /// Buffers backed by CPU-addressable memory.
        const DATA_PTR = 1;
        /// Buffers that can travel as dma-buf descriptors.
        const DMABUF = 2;
        /// Buffers multiplexed onto a persistent per-plane presentation
        /// stream.
        const STREAM = 4;
    }
}

/// Stable identifier of a display plane (a primary or overlay scan-out
/// slot) as addressed by the display backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneId(pub u32);
