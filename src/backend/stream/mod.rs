//! Capability context consumed by stream-backed allocation.
//!
//! Bringing up the graphics context (display initialization, extension
//! discovery, image import machinery) happens outside this crate. What the
//! allocator and output layers need from it is small and is captured by the
//! [`StreamContext`] trait: make the context current, bring per-plane
//! presentation surfaces up and down, latch frames on the consumer end, and
//! answer format/modifier capability queries.
//!
//! Optional feature groups are exposed as typed handles
//! ([`StreamContext::modifier_query`]) instead of a bag of nullable
//! function slots, so callers branch on capability presence exactly once.

use std::fmt;
use std::os::unix::io::OwnedFd;

use smallvec::SmallVec;
use tracing::{debug, info, trace};

use super::allocator::format::FormatSet;
use super::allocator::{Fourcc, Modifier};
use super::PlaneId;

/// Maximum number of memory planes a single imported image may span.
pub const MAX_IMAGE_PLANES: usize = 4;

/// One memory plane backing an imported image.
#[derive(Debug)]
pub struct MemoryPlane {
    /// File descriptor of the backing memory.
    pub fd: OwnedFd,
    /// Byte offset of this plane inside the backing memory.
    pub offset: u32,
    /// Row pitch in bytes.
    pub stride: u32,
}

/// Description of an external memory buffer to import as a renderable
/// image.
#[derive(Debug)]
pub struct ImageDescription {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: Fourcc,
    /// Layout modifier shared by all planes.
    pub modifier: Modifier,
    /// The memory planes.
    pub planes: SmallVec<[MemoryPlane; MAX_IMAGE_PLANES]>,
}

/// Attributes of a consumer-side frame acquire.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcquireAttributes {
    /// Request a flip-completion event from the display for this frame.
    pub flip_event: bool,
}

/// Explicit modifier support reported for a single format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierProperties {
    /// The layout modifier.
    pub modifier: Modifier,
    /// The layout can only be sampled from, not rendered to.
    pub external_only: bool,
}

/// Optional feature group: explicit modifier enumeration.
pub trait ModifierQuery {
    /// All explicit modifiers the device supports for `format`.
    fn modifiers(&self, format: Fourcc) -> Vec<ModifierProperties>;
}

/// Error classes of [`StreamContext::acquire_frame`].
#[derive(Debug, thiserror::Error)]
pub enum AcquireFrameError<E: std::error::Error + 'static> {
    /// The presentation resource is temporarily busy; retrying may
    /// succeed.
    #[error("the presentation stream is busy")]
    Busy,
    /// Any other context error. Not retried.
    #[error(transparent)]
    Context(E),
}

/// Connection to the GPU/display subsystem.
///
/// All operations are driven from the compositor thread that owns the
/// context.
pub trait StreamContext: fmt::Debug {
    /// Native presentation surface bound to one display plane.
    type Surface: fmt::Debug;
    /// Imported renderable image.
    type Image: fmt::Debug;
    /// Error type of the underlying graphics api.
    type Error: std::error::Error + 'static;

    /// Make the context current on the calling thread.
    fn make_current(&self) -> Result<(), Self::Error>;
    /// Release the context from the calling thread.
    fn unset_current(&self) -> Result<(), Self::Error>;

    /// Bring up a native presentation surface for `plane` at the given
    /// size.
    fn create_plane_surface(
        &self,
        plane: PlaneId,
        width: u32,
        height: u32,
    ) -> Result<Self::Surface, Self::Error>;

    /// Tear down a native presentation surface.
    fn destroy_plane_surface(&self, surface: Self::Surface);

    /// Latch the most recent producer frame on the consumer end of
    /// `surface`.
    fn acquire_frame(
        &self,
        surface: &Self::Surface,
        attribs: &AcquireAttributes,
    ) -> Result<(), AcquireFrameError<Self::Error>>;

    /// Import an external memory descriptor as a renderable image.
    fn import_image(&self, description: &ImageDescription) -> Result<Self::Image, Self::Error>;

    /// The pixel formats the device reports.
    fn formats(&self) -> Vec<Fourcc>;

    /// Explicit modifier enumeration, when the device exposes it.
    fn modifier_query(&self) -> Option<&dyn ModifierQuery>;
}

/// Format sets collected from a [`StreamContext`] at initialization time.
#[derive(Debug, Default, Clone)]
pub struct RenderFormats {
    /// Formats usable for sampling.
    pub texture: FormatSet,
    /// Formats usable as render targets.
    pub render: FormatSet,
    /// Whether any format reported explicit modifiers.
    pub has_modifiers: bool,
}

impl RenderFormats {
    /// Query `ctx` for its supported formats and build the texture and
    /// render sets.
    ///
    /// The implicit modifier is always recorded for every reported format.
    /// A format without an explicit modifier list additionally gets the
    /// linear layout, assuming the driver supports it if it doesn't
    /// explicitly say otherwise. External-only modifiers are kept out of
    /// the render set. Setting `STRAND_NO_MODIFIERS=1` in the environment
    /// suppresses explicit modifiers entirely.
    pub fn query<C: StreamContext>(ctx: &C) -> RenderFormats {
        let no_modifiers = std::env::var("STRAND_NO_MODIFIERS")
            .map(|value| value == "1")
            .unwrap_or(false);
        if no_modifiers {
            info!("STRAND_NO_MODIFIERS set, disabling explicit modifiers");
        }

        let mut formats = RenderFormats::default();
        for fourcc in ctx.formats() {
            let modifiers = if no_modifiers {
                Vec::new()
            } else {
                ctx.modifier_query()
                    .map(|query| query.modifiers(fourcc))
                    .unwrap_or_default()
            };

            // The implicit layout is always available.
            formats.texture.add(fourcc, Modifier::Invalid);
            formats.render.add(fourcc, Modifier::Invalid);

            if modifiers.is_empty() {
                // Assume the linear layout is supported if the driver
                // doesn't explicitly say otherwise.
                formats.texture.add(fourcc, Modifier::Linear);
                formats.render.add(fourcc, Modifier::Linear);
            }

            for properties in &modifiers {
                formats.texture.add(fourcc, properties.modifier);
                if !properties.external_only {
                    formats.render.add(fourcc, properties.modifier);
                }
                trace!(
                    format = ?fourcc,
                    modifier = ?properties.modifier,
                    external_only = properties.external_only,
                    "Supported format modifier"
                );
            }

            formats.has_modifiers |= !modifiers.is_empty();
        }

        debug!(
            formats = formats.texture.len(),
            has_modifiers = formats.has_modifiers,
            "Collected device formats"
        );
        formats
    }
}
