//! Renderer boundary.
//!
//! The texture and draw layers live outside this crate; the negotiation
//! and probe paths only need the small surface below: binding a target
//! buffer, answering which formats can be rendered to, and painting the
//! empty probe frame used to pre-validate mode-setting commits.

use crate::backend::allocator::format::FormatSet;
use crate::backend::allocator::{Buffer, Fourcc};
use crate::backend::BufferCaps;

/// Rendering api consumed by the output layer.
pub trait Renderer {
    /// Buffer type this renderer can bind as a render target.
    type Buffer: Buffer;

    /// Capability classes of buffers this renderer can render to.
    fn buffer_caps(&self) -> BufferCaps;

    /// Bind rendering to `buffer`, or unbind with `None`.
    ///
    /// Returns `false` if the renderer rejects the buffer.
    fn bind(&mut self, buffer: Option<&Self::Buffer>) -> bool;

    /// The formats this renderer can render to.
    fn render_formats(&self) -> &FormatSet;

    /// Start a render pass at the given dimensions.
    fn begin(&mut self, width: u32, height: u32);

    /// Clear the bound buffer to `color`.
    fn clear(&mut self, color: [f32; 4]);

    /// Finish the render pass.
    fn end(&mut self);

    /// The format pixel read-back prefers, when the renderer supports
    /// reading pixels at all.
    fn preferred_read_format(&self) -> Option<Fourcc> {
        None
    }
}
