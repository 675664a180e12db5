//! Stream-backed buffer allocation.
//!
//! [`StreamAllocator`] multiplexes buffer requests onto a small pool of
//! persistent presentation surfaces, one per display plane. Native surfaces
//! are expensive to bring up and plane identifiers are a small stable set,
//! so pool members are cached and reference counted across frames rather
//! than recreated per frame.
//!
//! Logical ownership (the lock count) and native-surface presence
//! (active/disposed) are tracked independently:
//! [`dispose_planes`](StreamAllocator::dispose_planes) and
//! [`recreate_planes`](StreamAllocator::recreate_planes) exist because a
//! privilege loss (e.g. a session/VT switch) invalidates every native
//! surface at once without destroying the logical bindings that in-flight
//! buffers still hold.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::backend::stream::{AcquireAttributes, AcquireFrameError, StreamContext};
use crate::backend::{BufferCaps, PlaneId};

/// Upper bound of consumer acquire attempts per presented frame.
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 10;

/// Delay between two acquire attempts on a busy stream.
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

type PlaneMap<C> = RefCell<HashMap<PlaneId, Rc<StreamPlane<C>>>>;

/// Allocator multiplexing buffer requests onto per-plane presentation
/// streams.
///
/// Cloning is cheap and yields another handle onto the same pool, so a
/// [`Swapchain`](super::Swapchain) can own its allocator while the
/// presentation path keeps one for frame latching.
///
/// The pool must only be mutated from the compositor thread, and never
/// reentrantly (e.g. allocating from inside a dispose sweep).
#[derive(Debug)]
pub struct StreamAllocator<C: StreamContext> {
    ctx: Rc<C>,
    planes: Rc<PlaneMap<C>>,
}

impl<C: StreamContext> Clone for StreamAllocator<C> {
    fn clone(&self) -> StreamAllocator<C> {
        StreamAllocator {
            ctx: self.ctx.clone(),
            planes: self.planes.clone(),
        }
    }
}

/// Errors thrown by [`StreamAllocator`] when creating buffers.
#[derive(Debug, thiserror::Error)]
pub enum StreamAllocatorError<E: std::error::Error + 'static> {
    /// Stream buffers are views onto a per-plane surface; allocating one
    /// without a target plane is unsupported.
    #[error("stream buffers require a target display plane")]
    NoTargetPlane,
    /// Bringing up the native surface failed. The half-built resource was
    /// not inserted into the pool.
    #[error("failed to set up the stream surface for plane {plane:?}")]
    SurfaceSetup {
        /// The plane the surface was requested for.
        plane: PlaneId,
        /// Underlying context error.
        #[source]
        source: E,
    },
}

/// Errors thrown when latching a frame through a stream plane.
#[derive(Debug, thiserror::Error)]
pub enum PresentError<E: std::error::Error + 'static> {
    /// The output is not addressable through a display plane.
    #[error("the output is not addressable through a display plane")]
    NoPlane,
    /// No swapchain has been negotiated for the output yet.
    #[error("no swapchain has been negotiated for the output")]
    NoSwapchain,
    /// No pool member is bound to the requested plane.
    #[error("no stream plane registered for plane {0:?}")]
    UnknownPlane(PlaneId),
    /// The plane's native surface is currently disposed.
    #[error("stream plane {0:?} has no active surface")]
    Inactive(PlaneId),
    /// The stream stayed busy for every bounded acquire attempt.
    #[error("stream busy after {} acquire attempts", MAX_ACQUIRE_ATTEMPTS)]
    Busy,
    /// Any other error reported by the capability context.
    #[error(transparent)]
    Context(E),
}

#[derive(Debug)]
enum SurfaceState<S> {
    Uninitialized,
    Active(S),
    Disposed,
}

/// A persistent presentation surface bound to one display plane.
///
/// The lock count tracks logical ownership and is a plain counter, all
/// increments and decrements happen on the compositor thread. Whether the
/// native surface is currently alive is tracked independently, so a
/// disposed member keeps its references across a privilege loss and can be
/// rebuilt later. Width and height are immutable for the resource's
/// lifetime; a size change produces a new resource.
#[derive(Debug)]
pub struct StreamPlane<C: StreamContext> {
    id: PlaneId,
    width: u32,
    height: u32,
    locks: Cell<u32>,
    busy: Cell<bool>,
    surface: RefCell<SurfaceState<C::Surface>>,
    ctx: Rc<C>,
    pool: Weak<PlaneMap<C>>,
}

impl<C: StreamContext> StreamPlane<C> {
    /// The plane this surface is bound to.
    pub fn id(&self) -> PlaneId {
        self.id
    }

    /// Width the surface was created with.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height the surface was created with.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of live buffers referencing this surface.
    pub fn locks(&self) -> u32 {
        self.locks.get()
    }

    /// Whether the native surface is currently alive.
    pub fn is_active(&self) -> bool {
        matches!(*self.surface.borrow(), SurfaceState::Active(_))
    }

    /// Whether the last acquire attempt left the stream busy.
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    fn lock(&self) {
        self.locks.set(self.locks.get() + 1);
    }

    fn unlock(this: &Rc<StreamPlane<C>>) {
        let locks = this.locks.get();
        assert!(locks > 0, "stream plane released more often than locked");
        this.locks.set(locks - 1);
        if locks > 1 {
            return;
        }

        info!(
            plane = ?this.id,
            "Destroying stream plane, {}x{}", this.width, this.height
        );
        this.dispose();
        if let Some(pool) = this.pool.upgrade() {
            let mut planes = pool.borrow_mut();
            // An unlinked predecessor must not tear out its successor.
            if planes.get(&this.id).is_some_and(|member| Rc::ptr_eq(member, this)) {
                planes.remove(&this.id);
            }
        }
    }

    fn bring_up(&self) -> Result<(), C::Error> {
        let surface = self.ctx.create_plane_surface(self.id, self.width, self.height)?;
        *self.surface.borrow_mut() = SurfaceState::Active(surface);
        Ok(())
    }

    fn dispose(&self) {
        if let SurfaceState::Active(surface) = self.surface.replace(SurfaceState::Disposed) {
            self.ctx.destroy_plane_surface(surface);
        }
    }

    fn is_disposed(&self) -> bool {
        matches!(*self.surface.borrow(), SurfaceState::Disposed)
    }

    /// Latch the most recent producer frame on the consumer end of the
    /// stream.
    ///
    /// A busy stream is retried with a fixed one-second backoff, up to
    /// [`MAX_ACQUIRE_ATTEMPTS`] attempts total; any other error aborts
    /// immediately. The call blocks the compositor thread while it
    /// retries, which in the pathological case adds up to roughly nine
    /// seconds.
    pub fn try_acquire(&self, attribs: &AcquireAttributes) -> Result<(), PresentError<C::Error>> {
        self.try_acquire_with(attribs, ACQUIRE_RETRY_DELAY)
    }

    fn try_acquire_with(
        &self,
        attribs: &AcquireAttributes,
        delay: Duration,
    ) -> Result<(), PresentError<C::Error>> {
        let state = self.surface.borrow();
        let SurfaceState::Active(surface) = &*state else {
            return Err(PresentError::Inactive(self.id));
        };

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            match self.ctx.acquire_frame(surface, attribs) {
                Ok(()) => {
                    self.busy.set(false);
                    return Ok(());
                }
                Err(AcquireFrameError::Busy) => {
                    self.busy.set(true);
                    if attempt == MAX_ACQUIRE_ATTEMPTS {
                        error!(
                            plane = ?self.id,
                            "Max number of stream acquire attempts ({}) has been exceeded",
                            MAX_ACQUIRE_ATTEMPTS
                        );
                        return Err(PresentError::Busy);
                    }
                    info!(
                        plane = ?self.id,
                        attempt,
                        "Stream is busy, retrying after {:?}", delay
                    );
                    std::thread::sleep(delay);
                }
                Err(AcquireFrameError::Context(err)) => {
                    error!(plane = ?self.id, ?err, "Stream acquire failed");
                    self.busy.set(false);
                    return Err(PresentError::Context(err));
                }
            }
        }
        unreachable!("the acquire loop returns within the attempt bound")
    }
}

/// A locked view onto a plane's presentation surface.
///
/// Every allocation locks its plane once; dropping the buffer releases the
/// lock exactly once, and the last release tears the surface down and
/// removes the pool entry.
#[derive(Debug)]
pub struct StreamBuffer<C: StreamContext> {
    plane: Rc<StreamPlane<C>>,
    format: Format,
}

impl<C: StreamContext> StreamBuffer<C> {
    /// The plane resource backing this buffer.
    pub fn plane(&self) -> &StreamPlane<C> {
        &self.plane
    }
}

impl<C: StreamContext> Buffer for StreamBuffer<C> {
    fn width(&self) -> u32 {
        self.plane.width
    }

    fn height(&self) -> u32 {
        self.plane.height
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl<C: StreamContext> Drop for StreamBuffer<C> {
    fn drop(&mut self) {
        debug!(
            "Destroying {}x{} stream buffer",
            self.plane.width, self.plane.height
        );
        StreamPlane::unlock(&self.plane);
    }
}

impl<C: StreamContext> StreamAllocator<C> {
    /// Create an allocator with an empty plane pool on top of `ctx`.
    pub fn new(ctx: C) -> StreamAllocator<C> {
        debug!("Created stream allocator");
        StreamAllocator {
            ctx: Rc::new(ctx),
            planes: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// The capability context this allocator was created on.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// The pool member currently bound to `plane`, if any.
    pub fn plane_for_id(&self, plane: PlaneId) -> Option<Rc<StreamPlane<C>>> {
        self.planes.borrow().get(&plane).cloned()
    }

    fn find_or_create_plane(
        &self,
        width: u32,
        height: u32,
        id: PlaneId,
    ) -> Result<Rc<StreamPlane<C>>, StreamAllocatorError<C::Error>> {
        if let Some(plane) = self.plane_for_id(id) {
            if plane.width == width && plane.height == height {
                info!(plane = ?id, "Found allocated stream plane, {}x{}", width, height);
                return Ok(plane);
            }
            // Size changes are not supported in place. Unlink the member;
            // in-flight buffers keep the old surface alive until their
            // locks drain, it is just no longer discoverable.
            warn!(
                plane = ?id,
                "Stream plane size differs, {}x{} -> {}x{}, a new plane will be created",
                plane.width, plane.height, width, height
            );
            self.planes.borrow_mut().remove(&id);
        }

        let plane = Rc::new(StreamPlane {
            id,
            width,
            height,
            locks: Cell::new(0),
            busy: Cell::new(false),
            surface: RefCell::new(SurfaceState::Uninitialized),
            ctx: self.ctx.clone(),
            pool: Rc::downgrade(&self.planes),
        });
        plane.bring_up().map_err(|source| {
            error!(plane = ?id, "Stream surface setup failed");
            StreamAllocatorError::SurfaceSetup { plane: id, source }
        })?;
        info!(plane = ?id, "Stream surface for plane ({}x{}) has been set up", width, height);
        self.planes.borrow_mut().insert(id, plane.clone());
        Ok(plane)
    }

    /// Tear down the native surface of every active pool member.
    ///
    /// Bookkeeping records, lock counts and pool membership are untouched,
    /// so [`recreate_planes`](Self::recreate_planes) can bring the
    /// surfaces back once the privilege is regained. Members that are
    /// already disposed are skipped, making the call idempotent.
    pub fn dispose_planes(&self) {
        info!("Disposing stream planes");
        for plane in self.planes.borrow().values() {
            if plane.is_active() {
                plane.dispose();
                info!(plane = ?plane.id, "Stream plane has been disposed");
            }
        }
    }

    /// Rebuild the native surface of every disposed pool member at its
    /// recorded plane and size.
    ///
    /// Best-effort: failures are logged per plane and do not abort the
    /// sweep.
    pub fn recreate_planes(&self) {
        info!("Recreating stream planes");
        for plane in self.planes.borrow().values() {
            if plane.is_disposed() {
                if let Err(err) = plane.bring_up() {
                    warn!(plane = ?plane.id, ?err, "Failed to recreate stream surface");
                }
            }
        }
    }

    /// Latch the most recent frame of the stream bound to `plane` for
    /// presentation.
    pub fn present(
        &self,
        plane: PlaneId,
        attribs: &AcquireAttributes,
    ) -> Result<(), PresentError<C::Error>> {
        let plane = self
            .plane_for_id(plane)
            .ok_or(PresentError::UnknownPlane(plane))?;
        plane.try_acquire(attribs)
    }
}

impl<C: StreamContext> Allocator for StreamAllocator<C> {
    type Buffer = StreamBuffer<C>;
    type Error = StreamAllocatorError<C::Error>;

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::STREAM
    }

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        _modifiers: &[Modifier],
        plane: Option<PlaneId>,
    ) -> Result<StreamBuffer<C>, StreamAllocatorError<C::Error>> {
        // Every stream buffer is just a view onto the one real stream of
        // its display plane.
        let plane = plane.ok_or(StreamAllocatorError::NoTargetPlane)?;
        let plane = self.find_or_create_plane(width, height, plane)?;
        plane.lock();
        debug!("Allocated {}x{} stream buffer", width, height);
        Ok(StreamBuffer {
            plane,
            format: Format {
                code: fourcc,
                modifier: Modifier::Invalid,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test context failure")]
    struct TestError;

    #[derive(Debug, Clone, Copy)]
    enum Acquire {
        Latch,
        Busy,
        Fail,
    }

    #[derive(Debug, Default)]
    struct TestContext {
        created: Cell<u32>,
        destroyed: Cell<u32>,
        fail_create: Cell<bool>,
        acquired: Cell<u32>,
        acquire_script: RefCell<Vec<Acquire>>,
    }

    #[derive(Debug)]
    struct TestSurface;

    impl StreamContext for TestContext {
        type Surface = TestSurface;
        type Image = ();
        type Error = TestError;

        fn make_current(&self) -> Result<(), TestError> {
            Ok(())
        }

        fn unset_current(&self) -> Result<(), TestError> {
            Ok(())
        }

        fn create_plane_surface(
            &self,
            _plane: PlaneId,
            _width: u32,
            _height: u32,
        ) -> Result<TestSurface, TestError> {
            if self.fail_create.get() {
                return Err(TestError);
            }
            self.created.set(self.created.get() + 1);
            Ok(TestSurface)
        }

        fn destroy_plane_surface(&self, _surface: TestSurface) {
            self.destroyed.set(self.destroyed.get() + 1);
        }

        fn acquire_frame(
            &self,
            _surface: &TestSurface,
            _attribs: &AcquireAttributes,
        ) -> Result<(), AcquireFrameError<TestError>> {
            self.acquired.set(self.acquired.get() + 1);
            let mut script = self.acquire_script.borrow_mut();
            let outcome = if script.is_empty() {
                Acquire::Latch
            } else {
                script.remove(0)
            };
            match outcome {
                Acquire::Latch => Ok(()),
                Acquire::Busy => Err(AcquireFrameError::Busy),
                Acquire::Fail => Err(AcquireFrameError::Context(TestError)),
            }
        }

        fn import_image(
            &self,
            _description: &crate::backend::stream::ImageDescription,
        ) -> Result<(), TestError> {
            Ok(())
        }

        fn formats(&self) -> Vec<Fourcc> {
            Vec::new()
        }

        fn modifier_query(&self) -> Option<&dyn crate::backend::stream::ModifierQuery> {
            None
        }
    }

    const PLANE: PlaneId = PlaneId(42);

    fn allocator() -> StreamAllocator<TestContext> {
        StreamAllocator::new(TestContext::default())
    }

    fn buffer(
        alloc: &mut StreamAllocator<TestContext>,
        width: u32,
        height: u32,
        plane: PlaneId,
    ) -> StreamBuffer<TestContext> {
        alloc
            .create_buffer(width, height, Fourcc::Xrgb8888, &[], Some(plane))
            .expect("allocation failed")
    }

    #[test]
    fn surface_created_once_per_cold_period() {
        let mut alloc = allocator();

        let first = buffer(&mut alloc, 1920, 1080, PLANE);
        let second = buffer(&mut alloc, 1920, 1080, PLANE);
        assert_eq!(alloc.context().created.get(), 1);
        assert_eq!(first.plane().locks(), 2);

        drop(first);
        assert_eq!(alloc.context().destroyed.get(), 0);
        assert!(alloc.plane_for_id(PLANE).is_some());

        drop(second);
        assert_eq!(alloc.context().destroyed.get(), 1);
        assert!(alloc.plane_for_id(PLANE).is_none());

        // A fresh acquisition after the pool went cold creates the
        // surface again.
        let _third = buffer(&mut alloc, 1920, 1080, PLANE);
        assert_eq!(alloc.context().created.get(), 2);
    }

    #[test]
    fn no_target_plane_is_rejected() {
        let mut alloc = allocator();
        let result = alloc.create_buffer(640, 480, Fourcc::Xrgb8888, &[], None);
        assert!(matches!(result, Err(StreamAllocatorError::NoTargetPlane)));
    }

    #[test]
    fn failed_setup_leaves_no_pool_entry() {
        let mut alloc = allocator();
        alloc.context().fail_create.set(true);
        let result = alloc.create_buffer(640, 480, Fourcc::Xrgb8888, &[], Some(PLANE));
        assert!(matches!(
            result,
            Err(StreamAllocatorError::SurfaceSetup { plane: PLANE, .. })
        ));
        assert!(alloc.plane_for_id(PLANE).is_none());
        assert_eq!(alloc.context().created.get(), 0);
    }

    #[test]
    fn size_change_unlinks_the_old_plane() {
        let mut alloc = allocator();

        let old = buffer(&mut alloc, 1920, 1080, PLANE);
        let new = buffer(&mut alloc, 1280, 720, PLANE);
        assert_eq!(alloc.context().created.get(), 2);

        // The pool now resolves to the new resource only.
        let member = alloc.plane_for_id(PLANE).unwrap();
        assert_eq!(member.width(), 1280);
        assert_eq!(member.locks(), 1);

        // Draining the unlinked predecessor does not affect the successor.
        drop(old);
        assert_eq!(alloc.context().destroyed.get(), 1);
        let member = alloc.plane_for_id(PLANE).unwrap();
        assert!(member.is_active());
        assert_eq!(member.locks(), 1);

        drop(new);
        assert_eq!(alloc.context().destroyed.get(), 2);
        assert!(alloc.plane_for_id(PLANE).is_none());
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut alloc = allocator();
        let buffer = buffer(&mut alloc, 800, 600, PLANE);

        alloc.dispose_planes();
        alloc.dispose_planes();

        assert_eq!(alloc.context().destroyed.get(), 1);
        let member = alloc.plane_for_id(PLANE).unwrap();
        assert!(!member.is_active());
        assert_eq!(member.locks(), 1);
        drop(buffer);
    }

    #[test]
    fn recreate_restores_surviving_planes_only() {
        let mut alloc = allocator();
        let keep = buffer(&mut alloc, 800, 600, PlaneId(1));
        let gone = buffer(&mut alloc, 800, 600, PlaneId(2));

        alloc.dispose_planes();
        // Fully released while disposed: removed from the pool, no native
        // teardown (the surface is already gone).
        drop(gone);
        assert!(alloc.plane_for_id(PlaneId(2)).is_none());

        alloc.recreate_planes();
        assert!(alloc.plane_for_id(PlaneId(1)).unwrap().is_active());
        // Two initial setups plus exactly one recreation.
        assert_eq!(alloc.context().created.get(), 3);
        drop(keep);
    }

    #[test]
    fn recreate_failure_does_not_abort_the_sweep() {
        let mut alloc = allocator();
        let a = buffer(&mut alloc, 800, 600, PlaneId(1));
        let b = buffer(&mut alloc, 800, 600, PlaneId(2));

        alloc.dispose_planes();
        alloc.context().fail_create.set(true);
        alloc.recreate_planes();
        assert!(!alloc.plane_for_id(PlaneId(1)).unwrap().is_active());
        assert!(!alloc.plane_for_id(PlaneId(2)).unwrap().is_active());

        alloc.context().fail_create.set(false);
        alloc.recreate_planes();
        assert!(alloc.plane_for_id(PlaneId(1)).unwrap().is_active());
        assert!(alloc.plane_for_id(PlaneId(2)).unwrap().is_active());
        drop((a, b));
    }

    #[test]
    fn acquire_succeeds_on_the_last_attempt() {
        let mut alloc = allocator();
        let buffer = buffer(&mut alloc, 800, 600, PLANE);
        *alloc.context().acquire_script.borrow_mut() = vec![Acquire::Busy; 9];

        let plane = alloc.plane_for_id(PLANE).unwrap();
        plane
            .try_acquire_with(&AcquireAttributes::default(), Duration::ZERO)
            .expect("acquire should succeed on the tenth attempt");
        assert_eq!(alloc.context().acquired.get(), 10);
        assert!(!plane.is_busy());
        drop(buffer);
    }

    #[test]
    fn acquire_gives_up_after_the_attempt_bound() {
        let mut alloc = allocator();
        let buffer = buffer(&mut alloc, 800, 600, PLANE);
        *alloc.context().acquire_script.borrow_mut() = vec![Acquire::Busy; 12];

        let plane = alloc.plane_for_id(PLANE).unwrap();
        let result = plane.try_acquire_with(&AcquireAttributes::default(), Duration::ZERO);
        assert!(matches!(result, Err(PresentError::Busy)));
        // No eleventh call is made.
        assert_eq!(alloc.context().acquired.get(), 10);
        assert!(plane.is_busy());
        drop(buffer);
    }

    #[test]
    fn acquire_aborts_on_other_errors() {
        let mut alloc = allocator();
        let buffer = buffer(&mut alloc, 800, 600, PLANE);
        *alloc.context().acquire_script.borrow_mut() = vec![Acquire::Busy, Acquire::Fail];

        let plane = alloc.plane_for_id(PLANE).unwrap();
        let result = plane.try_acquire_with(&AcquireAttributes::default(), Duration::ZERO);
        assert!(matches!(result, Err(PresentError::Context(_))));
        assert_eq!(alloc.context().acquired.get(), 2);
        drop(buffer);
    }

    #[test]
    fn present_requires_a_known_plane() {
        let alloc = allocator();
        let result = alloc.present(PLANE, &AcquireAttributes::default());
        assert!(matches!(result, Err(PresentError::UnknownPlane(PLANE))));
    }

    #[test]
    fn acquire_on_a_disposed_plane_is_rejected() {
        let mut alloc = allocator();
        let buffer = buffer(&mut alloc, 800, 600, PLANE);
        alloc.dispose_planes();

        let result = alloc.present(PLANE, &AcquireAttributes::default());
        assert!(matches!(result, Err(PresentError::Inactive(PLANE))));
        assert_eq!(alloc.context().acquired.get(), 0);
        drop(buffer);
    }
}
