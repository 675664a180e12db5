use std::ops::Deref;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use crate::backend::allocator::{Allocator, Buffer, Fourcc, Modifier};
use crate::backend::PlaneId;

/// Number of buffers a swapchain rotates through.
pub const SLOT_CAP: usize = 4;

/// Swapchain handling a fixed set of re-usable buffers e.g. for scan-out.
///
/// A swapchain binds one negotiated (format, size) pair to a rotating
/// sequence of presentable buffers for one output. All you tell it is
/// *"give me the next free buffer"* (by calling [`acquire`](Swapchain::acquire));
/// you hold on to the returned [`Slot`] during rendering and presentation
/// and drop it once the buffer is displayed. Buffers are allocated lazily
/// and re-used efficiently by the swapchain.
///
/// Each slot carries a [buffer age](Slot::age) so the renderer knows which
/// damage has to be repainted. Report presented buffers back via
/// [`submitted`](Swapchain::submitted) to keep the ages truthful.
///
/// A swapchain is never resized or re-formatted in place; negotiation
/// replaces it wholesale, and outstanding slots keep the old buffers alive
/// while they drain.
#[derive(Debug)]
pub struct Swapchain<A: Allocator> {
    /// Allocator used by the swapchain.
    pub allocator: A,

    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,
    plane: Option<PlaneId>,

    slots: [Arc<InternalSlot<A::Buffer>>; SLOT_CAP],
}

/// Slot of a swapchain containing an allocated buffer and its age.
///
/// The buffer is marked for re-use once all copies are dropped. Holding on
/// to this struct will block the buffer in the swapchain.
#[derive(Debug)]
pub struct Slot<B: Buffer>(Arc<InternalSlot<B>>);

#[derive(Debug)]
struct InternalSlot<B: Buffer> {
    buffer: Option<B>,
    acquired: AtomicBool,
    age: AtomicU8,
}

impl<B: Buffer> Slot<B> {
    /// Buffer age of the slot's contents.
    ///
    /// 0 means the buffer was freshly allocated and its contents are
    /// undefined, 1 means it holds the contents of the previous frame, 2
    /// the contents of the frame before that.
    pub fn age(&self) -> u8 {
        self.0.age.load(Ordering::SeqCst)
    }
}

impl<B: Buffer> Default for InternalSlot<B> {
    fn default() -> InternalSlot<B> {
        InternalSlot {
            buffer: None,
            acquired: AtomicBool::new(false),
            age: AtomicU8::new(0),
        }
    }
}

impl<B: Buffer> Deref for Slot<B> {
    type Target = B;
    fn deref(&self) -> &B {
        Option::as_ref(&self.0.buffer).unwrap()
    }
}

impl<B: Buffer> Drop for Slot<B> {
    fn drop(&mut self) {
        self.0.acquired.store(false, Ordering::SeqCst);
    }
}

impl<A: Allocator> Swapchain<A> {
    /// Create a new swapchain with the desired allocator, dimensions and
    /// pixel format for the created buffers, bound to `plane` when the
    /// target output is plane-addressable.
    ///
    /// An empty modifier list means buffers use the implicit layout.
    pub fn new(
        allocator: A,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: Vec<Modifier>,
        plane: Option<PlaneId>,
    ) -> Swapchain<A> {
        Swapchain {
            allocator,
            width,
            height,
            fourcc,
            modifiers,
            plane,
            slots: Default::default(),
        }
    }

    /// Acquire a new slot from the swapchain, if one is still free.
    ///
    /// The swapchain has an internal maximum of four re-usable buffers.
    /// This function returns the first free one.
    pub fn acquire(&mut self) -> Result<Option<Slot<A::Buffer>>, A::Error> {
        if let Some(free_slot) = self
            .slots
            .iter_mut()
            .find(|slot| !slot.acquired.swap(true, Ordering::SeqCst))
        {
            if free_slot.buffer.is_none() {
                match self.allocator.create_buffer(
                    self.width,
                    self.height,
                    self.fourcc,
                    &self.modifiers,
                    self.plane,
                ) {
                    Ok(buffer) => {
                        let slot = Arc::get_mut(free_slot)
                            .expect("acquired was false, but the slot is still referenced");
                        slot.buffer = Some(buffer);
                    }
                    Err(err) => {
                        free_slot.acquired.store(false, Ordering::SeqCst);
                        return Err(err);
                    }
                }
            }
            return Ok(Some(Slot(free_slot.clone())));
        }

        // no free slots
        Ok(None)
    }

    /// Mark a slot as submitted for presentation.
    ///
    /// Resets the slot's age to 1 and bumps every other slot that has been
    /// presented before, which is what keeps the age-based damage hints
    /// truthful. Slots not managed by this swapchain are ignored.
    pub fn submitted(&self, slot: &Slot<A::Buffer>) {
        if !self.slots.iter().any(|s| Arc::ptr_eq(s, &slot.0)) {
            return;
        }
        slot.0.age.store(1, Ordering::SeqCst);
        for other in self.slots.iter().filter(|s| !Arc::ptr_eq(s, &slot.0)) {
            let age = other.age.load(Ordering::SeqCst);
            if age > 0 {
                other.age.store(age.saturating_add(1), Ordering::SeqCst);
            }
        }
    }

    /// Width of the buffers this swapchain produces.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the buffers this swapchain produces.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format of the buffers this swapchain produces.
    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    /// The accepted modifier list.
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// The display plane this swapchain is bound to, if any.
    pub fn plane(&self) -> Option<PlaneId> {
        self.plane
    }

    /// Whether this swapchain produces implicit-layout buffers only.
    pub fn is_implicit_only(&self) -> bool {
        matches!(self.modifiers.as_slice(), [] | [Modifier::Invalid])
    }
}
