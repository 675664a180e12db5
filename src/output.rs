//! Output render state and per-commit format negotiation.
//!
//! An [`Output`] ties an [`Allocator`], a [`DisplayBackend`] and (per call)
//! a [`Renderer`] together. Every attempt to render or test a commit runs
//! the same machine: resolve the target geometry from the pending state,
//! pick a pixel format by intersecting the renderer's formats with what the
//! display can scan out, verify or replace the swapchain, and hand the
//! renderer the next buffer along with its age.
//!
//! Commits that light an output up or change its mode or render format are
//! pre-validated with a throwaway cleared buffer when the display exposes a
//! test operation ([`Output::ensure_buffer`]). Explicit modifiers are
//! preferred and only forced off after such a test fails, never guessed
//! from capability bits alone, since implicit-layout buffers trade away
//! compression and tiling.

use std::fmt;

use tracing::{debug, error};

use crate::backend::allocator::format::FormatSet;
use crate::backend::allocator::stream::{PresentError, StreamAllocator, StreamBuffer};
use crate::backend::allocator::{Allocator, Buffer, Fourcc, Modifier, Slot, Swapchain};
use crate::backend::renderer::Renderer;
use crate::backend::stream::{AcquireAttributes, StreamContext};
use crate::backend::{BufferCaps, PlaneId};

bitflags::bitflags! {
    /// Which fields of an [`OutputState`] are staged for the next commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFields: u32 {
        /// Output enablement changes.
        const ENABLED = 1;
        /// The display mode changes.
        const MODE = 2;
        /// The render format changes.
        const RENDER_FORMAT = 4;
        /// A buffer rides this commit.
        const BUFFER = 8;
    }
}

impl Default for StateFields {
    fn default() -> StateFields {
        StateFields::empty()
    }
}

/// A display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Vertical refresh rate in millihertz.
    pub refresh: u32,
}

/// Pending state for the next commit of an output.
///
/// Values are staged with the setters; the [`committed`](OutputState::committed)
/// mask records which fields the commit carries.
#[derive(Debug, Default, Clone)]
pub struct OutputState {
    committed: StateFields,
    enabled: bool,
    mode: Option<Mode>,
    render_format: Option<Fourcc>,
}

impl OutputState {
    /// An empty pending state.
    pub fn new() -> OutputState {
        Default::default()
    }

    /// Stage an enablement change.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.committed |= StateFields::ENABLED;
        self.enabled = enabled;
    }

    /// Stage a mode change.
    pub fn set_mode(&mut self, mode: Mode) {
        self.committed |= StateFields::MODE;
        self.mode = Some(mode);
    }

    /// Stage a render format change.
    pub fn set_render_format(&mut self, format: Fourcc) {
        self.committed |= StateFields::RENDER_FORMAT;
        self.render_format = Some(format);
    }

    pub(crate) fn attach_buffer(&mut self) {
        self.committed |= StateFields::BUFFER;
    }

    /// The staged field mask.
    pub fn committed(&self) -> StateFields {
        self.committed
    }

    /// Staged enablement.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Staged mode.
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Staged render format.
    pub fn render_format(&self) -> Option<Fourcc> {
        self.render_format
    }
}

/// Pre-flight commit validation, an optional display capability.
pub trait CommitTest<B: Buffer> {
    /// Whether the display would accept `state`, with `buffer` when one
    /// rides the commit.
    fn test(&self, state: &OutputState, buffer: Option<&B>) -> bool;
}

/// Display backend an output presents through.
pub trait DisplayBackend<B: Buffer> {
    /// Capability classes of buffers the display can scan out.
    fn buffer_caps(&self) -> BufferCaps;

    /// The primary plane of the output, when it is plane-addressable.
    fn primary_plane(&self) -> Option<PlaneId>;

    /// Formats the display can scan out, or `None` when unconstrained.
    fn display_formats(&self) -> Option<FormatSet>;

    /// The pre-flight test operation, when the display exposes one.
    fn commit_test(&self) -> Option<&dyn CommitTest<B>>;
}

/// Errors of [`Output::new`].
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The display backend and the allocator have no buffer capability in
    /// common.
    #[error("output backend and allocator buffer capabilities don't match")]
    IncompatibleBackend,
    /// The renderer and the allocator have no buffer capability in common.
    #[error("renderer and allocator buffer capabilities don't match")]
    IncompatibleRenderer,
}

/// Errors of the per-commit negotiation and render paths.
#[derive(Debug, thiserror::Error)]
pub enum FrameError<E: std::error::Error + 'static> {
    /// The renderer cannot render to the requested format.
    #[error("format {0:?} is not supported by the renderer")]
    NoSupportedRendererFormat(Fourcc),
    /// The display cannot scan out the requested format.
    #[error("format {0:?} is not supported by the display")]
    NoSupportedDisplayFormat(Fourcc),
    /// Renderer and display share no modifier for the format.
    #[error("no common modifiers between renderer and display for format {0:?}")]
    NoCommonModifiers(Fourcc),
    /// Modifiers are disallowed and the implicit layout is unsupported.
    #[error("implicit modifiers are not supported for format {0:?}")]
    NoImplicitModifier(Fourcc),
    /// All swapchain slots are in flight.
    #[error("no free slots in the swapchain")]
    NoFreeSlots,
    /// The renderer refused to bind the buffer.
    #[error("the renderer refused to bind the buffer")]
    BindRejected,
    /// The display rejected the tested configuration.
    #[error("the display rejected the tested output configuration")]
    TestFailed,
    /// Buffer allocation failed.
    #[error(transparent)]
    Allocator(E),
}

/// Render state of one output.
///
/// At most one back buffer is attached at a time and exactly one swapchain
/// is live; the swapchain is replaced, never mutated, whenever geometry,
/// format or modifier policy change. Attaching a second back buffer
/// without clearing the first is a contract violation.
pub struct Output<A, D>
where
    A: Allocator + Clone,
    D: DisplayBackend<A::Buffer>,
{
    name: String,
    allocator: A,
    backend: D,
    enabled: bool,
    current_mode: Option<Mode>,
    render_format: Fourcc,
    swapchain: Option<Swapchain<A>>,
    back_buffer: Option<Slot<A::Buffer>>,
    attach_render_locks: u32,
}

impl<A, D> fmt::Debug for Output<A, D>
where
    A: Allocator + Clone,
    D: DisplayBackend<A::Buffer>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("current_mode", &self.current_mode)
            .field("render_format", &self.render_format)
            .field("has_back_buffer", &self.back_buffer.is_some())
            .field("attach_render_locks", &self.attach_render_locks)
            .finish_non_exhaustive()
    }
}

impl<A, D> Output<A, D>
where
    A: Allocator + Clone,
    D: DisplayBackend<A::Buffer>,
{
    /// Bind an allocator, a display backend and a renderer together for
    /// rendering to this output.
    ///
    /// Fails when the buffer capabilities of the three collaborators don't
    /// overlap.
    pub fn new<R>(
        name: impl Into<String>,
        allocator: A,
        backend: D,
        renderer: &R,
    ) -> Result<Output<A, D>, InitError>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        if !backend.buffer_caps().intersects(allocator.buffer_caps()) {
            error!("output backend and allocator buffer capabilities don't match");
            return Err(InitError::IncompatibleBackend);
        }
        if !renderer.buffer_caps().intersects(allocator.buffer_caps()) {
            error!("renderer and allocator buffer capabilities don't match");
            return Err(InitError::IncompatibleRenderer);
        }

        Ok(Output {
            name: name.into(),
            allocator,
            backend,
            enabled: false,
            current_mode: None,
            render_format: Fourcc::Xrgb8888,
            swapchain: None,
            back_buffer: None,
            attach_render_locks: 0,
        })
    }

    /// The output's name, used for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The display backend this output presents through.
    pub fn backend(&self) -> &D {
        &self.backend
    }

    /// Whether the output is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The currently committed mode.
    pub fn current_mode(&self) -> Option<Mode> {
        self.current_mode
    }

    /// The render format new swapchains target.
    pub fn render_format(&self) -> Fourcc {
        self.render_format
    }

    /// The live swapchain, if one has been negotiated.
    pub fn swapchain(&self) -> Option<&Swapchain<A>> {
        self.swapchain.as_ref()
    }

    /// Resolution the next commit will present at.
    pub fn pending_resolution(&self, state: &OutputState) -> (u32, u32) {
        if state.committed.contains(StateFields::MODE) {
            if let Some(mode) = state.mode {
                return (mode.width, mode.height);
            }
        }
        self.current_mode
            .map_or((0, 0), |mode| (mode.width, mode.height))
    }

    /// Fold a successfully committed state into the output.
    pub fn state_committed(&mut self, state: &OutputState) {
        if state.committed.contains(StateFields::ENABLED) {
            self.enabled = state.enabled;
        }
        if state.committed.contains(StateFields::MODE) {
            self.current_mode = state.mode;
        }
        if state.committed.contains(StateFields::RENDER_FORMAT) {
            if let Some(format) = state.render_format {
                self.render_format = format;
            }
        }
    }

    /// Toggle the direct scan-out lock.
    ///
    /// While at least one lock is held, compositors must render through
    /// [`attach_render`](Output::attach_render) instead of scanning client
    /// buffers out directly.
    pub fn lock_attach_render(&mut self, lock: bool) {
        if lock {
            self.attach_render_locks += 1;
        } else {
            assert!(
                self.attach_render_locks > 0,
                "attach-render lock released more often than taken"
            );
            self.attach_render_locks -= 1;
        }
        debug!(
            "{} direct scan-out on output '{}' (locks: {})",
            if lock { "Disabling" } else { "Enabling" },
            self.name,
            self.attach_render_locks
        );
    }

    /// How often direct scan-out is currently locked out.
    pub fn attach_render_locks(&self) -> u32 {
        self.attach_render_locks
    }

    fn render_format_for(&self, state: &OutputState) -> Fourcc {
        if state.committed.contains(StateFields::RENDER_FORMAT) {
            state.render_format.unwrap_or(self.render_format)
        } else {
            self.render_format
        }
    }

    fn pick_format<R>(
        &self,
        renderer: &R,
        display_formats: Option<&FormatSet>,
        fourcc: Fourcc,
    ) -> Result<Vec<Modifier>, FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        let Some(render_modifiers) = renderer.render_formats().get(fourcc) else {
            debug!("Renderer doesn't support format {:?}", fourcc);
            return Err(FrameError::NoSupportedRendererFormat(fourcc));
        };

        let modifiers = match display_formats {
            Some(display_formats) => {
                let Some(display_modifiers) = display_formats.get(fourcc) else {
                    debug!("Output doesn't support format {:?}", fourcc);
                    return Err(FrameError::NoSupportedDisplayFormat(fourcc));
                };
                display_modifiers
                    .iter()
                    .filter(|modifier| render_modifiers.contains(modifier))
                    .copied()
                    .collect::<Vec<_>>()
            }
            // The output can display any format.
            None => render_modifiers.to_vec(),
        };

        if modifiers.is_empty() {
            debug!(
                "Failed to intersect display and render modifiers for format {:?} on output '{}'",
                fourcc, self.name
            );
            return Err(FrameError::NoCommonModifiers(fourcc));
        }
        Ok(modifiers)
    }

    /// Ensure the output has a suitable swapchain. The swapchain is
    /// re-created if necessary.
    ///
    /// If `allow_modifiers` is set to true, the swapchain's format may use
    /// explicit modifiers. If set to false, the swapchain's format is
    /// guaranteed not to use them.
    fn ensure_swapchain<R>(
        &mut self,
        renderer: &R,
        state: &OutputState,
        allow_modifiers: bool,
    ) -> Result<(), FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        let (width, height) = self.pending_resolution(state);
        let fourcc = self.render_format_for(state);
        let display_formats = self.backend.display_formats();
        let mut modifiers = self.pick_format(renderer, display_formats.as_ref(), fourcc)?;

        if let Some(swapchain) = &self.swapchain {
            if swapchain.width() == width
                && swapchain.height() == height
                && swapchain.fourcc() == fourcc
                && (allow_modifiers || swapchain.is_implicit_only())
            {
                // no change, keep the existing swapchain
                return Ok(());
            }
        }

        debug!(
            "Choosing primary buffer format {:?} for output '{}'",
            fourcc, self.name
        );

        if !allow_modifiers && !matches!(modifiers.as_slice(), [Modifier::Invalid]) {
            if !modifiers.contains(&Modifier::Invalid) {
                debug!("Implicit modifiers not supported");
                return Err(FrameError::NoImplicitModifier(fourcc));
            }
            modifiers = vec![Modifier::Invalid];
        }

        let plane = self.backend.primary_plane();
        let swapchain = Swapchain::new(
            self.allocator.clone(),
            width,
            height,
            fourcc,
            modifiers,
            plane,
        );

        // The old swapchain's outstanding buffers stay alive through their
        // own slots while they drain.
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn attach_back_buffer<R>(
        &mut self,
        renderer: &mut R,
        state: &OutputState,
    ) -> Result<u8, FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        assert!(
            self.back_buffer.is_none(),
            "a back buffer is already attached to output '{}'",
            self.name
        );

        self.ensure_swapchain(renderer, state, true)?;
        let swapchain = self
            .swapchain
            .as_mut()
            .expect("the swapchain was just ensured");

        let slot = swapchain
            .acquire()
            .map_err(FrameError::Allocator)?
            .ok_or(FrameError::NoFreeSlots)?;
        let age = slot.age();

        if !renderer.bind(Some(&*slot)) {
            return Err(FrameError::BindRejected);
        }

        self.back_buffer = Some(slot);
        Ok(age)
    }

    /// Attach the next render buffer to `state` and bind the renderer to
    /// it.
    ///
    /// Returns the buffer age of the attached buffer: 0 for a freshly
    /// allocated buffer (full repaint required), 1 for the buffer of the
    /// previous frame, 2 for double-buffered contents from two frames
    /// back. Use it to compute the minimal damage region to redraw.
    #[profiling::function]
    pub fn attach_render<R>(
        &mut self,
        renderer: &mut R,
        state: &mut OutputState,
    ) -> Result<u8, FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        let age = self.attach_back_buffer(renderer, state)?;
        state.attach_buffer();
        Ok(age)
    }

    /// Unbind and release the attached back buffer, if any.
    pub fn clear_back_buffer<R>(&mut self, renderer: &mut R)
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        let Some(slot) = self.back_buffer.take() else {
            return;
        };
        renderer.bind(None);
        drop(slot);
    }

    /// Report the buffer of the last commit as presented, so buffer ages
    /// stay truthful.
    pub fn buffer_submitted(&mut self, slot: &Slot<A::Buffer>) {
        if let Some(swapchain) = &self.swapchain {
            swapchain.submitted(slot);
        }
    }

    /// Take the attached back buffer for submission to the display.
    ///
    /// The caller keeps the returned slot alive until the display is done
    /// with the buffer.
    pub fn take_back_buffer(&mut self) -> Option<Slot<A::Buffer>> {
        self.back_buffer.take()
    }

    fn attach_empty_back_buffer<R>(
        &mut self,
        renderer: &mut R,
        state: &OutputState,
    ) -> Result<(), FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        debug_assert!(!state.committed.contains(StateFields::BUFFER));

        self.attach_back_buffer(renderer, state)?;

        let (width, height) = self.pending_resolution(state);
        renderer.begin(width, height);
        renderer.clear([0.0, 0.0, 0.0, 0.0]);
        renderer.end();

        Ok(())
    }

    fn run_commit_test(&self, state: &OutputState, with_buffer: bool) -> Option<bool> {
        let tester = self.backend.commit_test()?;
        if with_buffer {
            // A shallow copy of the state with the back buffer riding
            // along.
            let mut probe = state.clone();
            probe.attach_buffer();
            Some(tester.test(&probe, self.back_buffer.as_deref()))
        } else {
            Some(tester.test(state, None))
        }
    }

    /// Make sure a commit that lights the output up or changes its mode or
    /// render format carries a buffer the display accepts.
    ///
    /// When the display insists on a buffer, a throwaway cleared back
    /// buffer is attached and pre-validated; if that test fails for a
    /// swapchain using explicit modifiers, the whole negotiation is
    /// retried once with modifiers forced off. Returns `true` when such an
    /// empty buffer was attached (clear it after the commit), `false` when
    /// nothing had to be done. On an error the commit must not proceed as
    /// tested.
    #[profiling::function]
    pub fn ensure_buffer<R>(
        &mut self,
        renderer: &mut R,
        state: &OutputState,
    ) -> Result<bool, FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        // Only lighting up an output or changing its mode or render format
        // requires a buffer to ride along.
        let needs_new_buffer = (state.committed.contains(StateFields::ENABLED) && state.enabled)
            || state
                .committed
                .intersects(StateFields::MODE | StateFields::RENDER_FORMAT);
        if !needs_new_buffer || state.committed.contains(StateFields::BUFFER) {
            return Ok(false);
        }

        // If the display doesn't insist on a buffer for this state, don't
        // bother allocating one.
        match self.run_commit_test(state, false) {
            None | Some(true) => return Ok(false),
            Some(false) => {}
        }

        debug!("Attaching empty buffer to output for modeset");

        self.attach_empty_back_buffer(renderer, state)?;
        if self.run_commit_test(state, true) == Some(true) {
            return Ok(true);
        }

        self.clear_back_buffer(renderer);

        if self
            .swapchain
            .as_ref()
            .map_or(true, |swapchain| swapchain.is_implicit_only())
        {
            return Err(FrameError::TestFailed);
        }

        // The test failed for a buffer which has modifiers, try disabling
        // modifiers to see if that makes a difference.
        debug!("Output modeset test failed, retrying without modifiers");

        self.ensure_swapchain(renderer, state, false)?;
        self.attach_empty_back_buffer(renderer, state)?;
        if self.run_commit_test(state, true) == Some(true) {
            return Ok(true);
        }

        self.clear_back_buffer(renderer);
        Err(FrameError::TestFailed)
    }

    /// The pixel format read-back prefers on this output, or `None` when
    /// the renderer cannot read pixels at all.
    pub fn preferred_read_format<R>(
        &mut self,
        renderer: &mut R,
        state: &OutputState,
    ) -> Result<Option<Fourcc>, FrameError<A::Error>>
    where
        R: Renderer<Buffer = A::Buffer>,
    {
        self.attach_back_buffer(renderer, state)?;
        let format = renderer.preferred_read_format();
        self.clear_back_buffer(renderer);
        Ok(format)
    }
}

impl<C, D> Output<StreamAllocator<C>, D>
where
    C: StreamContext,
    D: DisplayBackend<StreamBuffer<C>>,
{
    /// Ask the primary plane's stream to latch the most recent frame for
    /// presentation, requesting a flip-completion event.
    ///
    /// Blocks with a bounded retry while the stream is busy; see
    /// [`StreamPlane::try_acquire`](crate::backend::allocator::stream::StreamPlane::try_acquire).
    #[profiling::function]
    pub fn present(&self) -> Result<(), PresentError<C::Error>> {
        let Some(plane) = self.backend.primary_plane() else {
            return Err(PresentError::NoPlane);
        };
        if self.swapchain.is_none() {
            return Err(PresentError::NoSwapchain);
        }

        let attribs = AcquireAttributes { flip_event: true };
        self.allocator.present(plane, &attribs)
    }
}
