//! Allocation engine and object lifecycle.
//!
//! [`Ref<T>`] is the payload pointer handed to clients: a copyable typed
//! handle whose header sits immediately before it in memory. Lifecycle is
//! explicit acquire/release discipline on the header's atomic reference
//! count; there is deliberately no `Drop` glue on `Ref`, because terminal
//! release must report the observed count and aliases of a released handle
//! stay inspectable through [`Ref::is_valid`].
//!
//! Payload fields are not protected by the runtime. The only discipline on
//! offer is the per-object monitor of lockable descriptors.

use std::alloc::Layout;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::process::abort;
use std::ptr::{self, NonNull};
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

use log::trace;

use crate::allocator::{AllocError, allocator};
use crate::descriptor::{Descriptor, Reclaim};
use crate::header::{Header, HeaderFlags, header, header_ptr, prefix_length};
use crate::monitor::Monitor;

/// A soft limit on the reference count. Blowing past it means a runaway
/// acquire loop; the process aborts rather than risk a wrapped count.
const MAX_REFERENCES: usize = isize::MAX as usize;

/// Reference-counted handle to an instance payload.
///
/// `Ref` is `Copy`: it is a pointer, not an owner. Copies are aliases and do
/// not touch the reference count; only [`acquire`](Ref::acquire) and
/// [`release`](Ref::release) do.
#[repr(transparent)]
pub struct Ref<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: a Ref is a shared pointer to T plus a header of atomics and a
// monitor; it is as thread-portable as the payload itself.
unsafe impl<T: Send + Sync> Send for Ref<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for Ref<T> {}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

// ── construction ──────────────────────────────────────────────────────

/// Allocate and header-initialize an instance of `descriptor`, payload
/// uninitialized (or zeroed). Reference count starts at 1.
pub(crate) fn create_raw(
    descriptor: &'static Descriptor,
    zeroed: bool,
) -> Result<NonNull<u8>, AllocError> {
    let prefix = prefix_length(descriptor.alignment());
    let size = prefix
        .checked_add(descriptor.size())
        .ok_or_else(|| AllocError::new(descriptor.size(), descriptor.alignment()))?;
    let align = descriptor.alignment();
    let layout =
        Layout::from_size_align(size, align).map_err(|_| AllocError::new(size, align))?;

    let origin = if zeroed {
        allocator().allocate_zeroed(layout)
    } else {
        allocator().allocate(layout)
    }
    .ok_or_else(|| AllocError::new(size, align))?;

    // SAFETY: the prefix lies inside the fresh allocation and the payload
    // base lands on `align`.
    unsafe {
        let obj = NonNull::new_unchecked(origin.as_ptr().add(prefix));
        header_ptr(obj).write(Header::new(descriptor, HeaderFlags::ALLOCATED));
        trace!("created {} instance at {:p}", descriptor.name(), obj);
        Ok(obj)
    }
}

impl<T> Ref<T> {
    #[inline]
    fn from_obj(obj: NonNull<u8>) -> Self {
        Self {
            ptr: obj.cast::<T>(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn raw(&self) -> NonNull<u8> {
        self.ptr.cast::<u8>()
    }

    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: a Ref always points at a payload with a header in front;
        // validation catches released instances before they are dispatched.
        unsafe { header(self.raw()) }
    }

    /// Allocate a new instance of `descriptor` holding `value`.
    ///
    /// Traps if the descriptor's declared extent cannot hold a `T`.
    pub fn create(descriptor: &'static Descriptor, value: T) -> Result<Ref<T>, AllocError> {
        assert!(
            descriptor.size() >= size_of::<T>() && descriptor.alignment() >= align_of::<T>(),
            "descriptor {} cannot hold the payload type",
            descriptor.name()
        );
        let obj = create_raw(descriptor, false)?;
        // SAFETY: freshly allocated payload of sufficient extent.
        unsafe { obj.cast::<T>().write(value) };
        Ok(Self::from_obj(obj))
    }

    /// Allocate a new instance with a zero-filled payload.
    ///
    /// # Safety
    ///
    /// All-zero bytes must be a valid `T`.
    pub unsafe fn create_zeroed(descriptor: &'static Descriptor) -> Result<Ref<T>, AllocError> {
        assert!(
            descriptor.size() >= size_of::<T>() && descriptor.alignment() >= align_of::<T>(),
            "descriptor {} cannot hold the payload type",
            descriptor.name()
        );
        let obj = create_raw(descriptor, true)?;
        Ok(Self::from_obj(obj))
    }

    /// Overlay a header onto externally supplied memory at `origin`. The
    /// runtime does not take ownership: terminal release finalizes the
    /// instance but never frees the origin.
    ///
    /// Traps if `origin` is not aligned to the descriptor's alignment.
    ///
    /// # Safety
    ///
    /// The region at `origin` must span at least
    /// `prefix_length(descriptor.alignment()) + descriptor.size()` bytes,
    /// stay allocated for the instance's whole lifetime, and its payload
    /// bytes must already be a valid `T`.
    pub unsafe fn wrap(origin: NonNull<u8>, descriptor: &'static Descriptor) -> Ref<T> {
        assert_eq!(
            origin.as_ptr() as usize % descriptor.alignment(),
            0,
            "wrapped origin must satisfy the descriptor alignment"
        );
        let prefix = prefix_length(descriptor.alignment());
        // SAFETY: the caller guarantees the region covers prefix + payload.
        unsafe {
            let obj = NonNull::new_unchecked(origin.as_ptr().add(prefix));
            header_ptr(obj).write(Header::new(descriptor, HeaderFlags::empty()));
            trace!("wrapped {} instance at {:p}", descriptor.name(), obj);
            Ref::from_obj(obj)
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────

    /// Atomically take another reference. Returns the same pointer.
    pub fn acquire(&self) -> Ref<T> {
        self.assert_valid();
        let old = self.header().references().fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFERENCES {
            abort();
        }
        *self
    }

    /// Atomically drop one reference and return the remaining count. The
    /// count reaching zero destroys the instance: the resolved destructor
    /// may veto reclamation and take the memory over, otherwise the
    /// resolved destroy runs and the engine reclaims.
    ///
    /// Releasing an already-dead instance traps.
    pub fn release(self) -> usize {
        self.assert_valid();
        let old = self.header().references().fetch_sub(1, Ordering::Release);
        if old == 1 {
            fence(Ordering::Acquire);
            // SAFETY: the count hit zero, so this thread holds the only
            // remaining reference.
            unsafe { destruct(self.raw()) };
            0
        } else {
            old - 1
        }
    }

    pub fn reference_count(&self) -> usize {
        self.header().reference_count()
    }

    /// Invoke the resolved copy operation: a new instance with reference
    /// count 1 (byte copy under the same descriptor unless overridden).
    pub fn copy(&self) -> Result<Ref<T>, AllocError> {
        self.assert_valid();
        let op = self.descriptor().copy_op();
        // SAFETY: self is valid; the op contract returns a fresh instance.
        let obj = unsafe { op(self.raw())? };
        Ok(Self::from_obj(obj))
    }

    // ── dispatch ──────────────────────────────────────────────────

    pub fn descriptor(&self) -> &'static Descriptor {
        self.header().descriptor()
    }

    /// Structural equality. Referential identity short-circuits; otherwise
    /// both instances must carry the exact same descriptor — a shared
    /// ancestor is not enough — before the resolved equals runs.
    pub fn equals(&self, other: &Ref<T>) -> bool {
        self.assert_valid();
        other.assert_valid();
        if self.ptr == other.ptr {
            return true;
        }
        if !ptr::eq(self.descriptor(), other.descriptor()) {
            return false;
        }
        // SAFETY: both valid, same descriptor.
        unsafe { self.descriptor().equals_op()(self.raw(), other.raw()) }
    }

    /// Ordering, resolved from this instance's chain only; `other` need not
    /// share the descriptor.
    pub fn compare(&self, other: &Ref<T>) -> CmpOrdering {
        self.assert_valid();
        other.assert_valid();
        // SAFETY: both operands are valid.
        unsafe { self.descriptor().compare_op()(self.raw(), other.raw()) }
    }

    pub fn hash_code(&self) -> u64 {
        self.assert_valid();
        // SAFETY: self is valid.
        unsafe { self.descriptor().hash_code_op()(self.raw()) }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.assert_valid();
        // SAFETY: self is valid.
        unsafe { self.descriptor().to_json_op()(self.raw()) }
    }

    /// Print the resolved representation to stdout at `indent`.
    pub fn display(&self, indent: usize) {
        self.assert_valid();
        // SAFETY: self is valid.
        unsafe { self.descriptor().display_op()(self.raw(), indent) }
    }

    /// Replace the instance's descriptor in place — the type-punning escape
    /// hatch pool collaborators use to recycle payload memory under another
    /// logical type. Returns the previous descriptor.
    ///
    /// Traps if the new descriptor moves the payload (different prefix),
    /// changes lockability, or resizes a runtime-owned allocation.
    ///
    /// # Safety
    ///
    /// The runtime does not synchronize this. The caller must serialize it
    /// against every concurrent dispatch on the same instance, and the
    /// payload bytes must be valid for the new descriptor's type.
    pub unsafe fn set_descriptor(&self, descriptor: &'static Descriptor) -> &'static Descriptor {
        self.assert_valid();
        // SAFETY: exclusive header access is the caller's obligation here.
        let hdr = unsafe { &mut *header_ptr(self.raw()) };
        let current = hdr.descriptor();
        assert_eq!(
            descriptor.is_lockable(),
            current.is_lockable(),
            "type punning cannot change lockability"
        );
        assert_eq!(
            prefix_length(descriptor.alignment()),
            prefix_length(current.alignment()),
            "type punning cannot move the payload"
        );
        if hdr.is_allocated() {
            assert_eq!(
                descriptor.size(),
                current.size(),
                "type punning a runtime-owned allocation cannot change its extent"
            );
        }
        hdr.replace_descriptor(descriptor)
    }

    // ── validity ──────────────────────────────────────────────────

    /// Guard marker intact, reference count positive, descriptor present,
    /// monitor present iff lockable. A released alias reports false for as
    /// long as the underlying memory stays mapped and unreused.
    pub fn is_valid(&self) -> bool {
        self.header().is_valid()
    }

    /// Trap unless [`is_valid`](Self::is_valid).
    pub fn assert_valid(&self) {
        if !self.is_valid() {
            panic!("invalid object at {:p}: corrupted or already released", self.ptr);
        }
    }

    // ── monitor ───────────────────────────────────────────────────

    /// Block until this instance's monitor is owned by the calling thread.
    /// Returns false without blocking when the descriptor is not lockable.
    /// Taking a monitor the calling thread already owns traps.
    pub fn lock(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => {
                monitor.lock();
                true
            }
            None => false,
        }
    }

    /// Non-blocking lock; false when contended or not lockable.
    pub fn try_lock(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => monitor.try_lock(),
            None => false,
        }
    }

    /// Release the monitor. Traps when the calling thread does not hold it;
    /// false when the descriptor is not lockable.
    pub fn unlock(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => {
                monitor.unlock();
                true
            }
            None => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.assert_valid();
        self.header().monitor().is_some_and(Monitor::is_locked)
    }

    /// Release the monitor, block until notified, reacquire. The caller
    /// must hold the lock. False when the descriptor is not lockable.
    pub fn wait(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => {
                monitor.wait();
                true
            }
            None => false,
        }
    }

    /// Like [`wait`](Self::wait) with a timeout; true when notified, false
    /// on timeout or when not lockable.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => monitor.wait_for(timeout),
            None => false,
        }
    }

    /// Like [`wait_for`](Self::wait_for) with an absolute deadline.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => monitor.wait_until(deadline),
            None => false,
        }
    }

    /// Wake one waiter; the lock stays held. False when not lockable.
    pub fn notify(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => {
                monitor.notify();
                true
            }
            None => false,
        }
    }

    /// Wake every waiter; the lock stays held. False when not lockable.
    pub fn notify_all(&self) -> bool {
        self.assert_valid();
        match self.header().monitor() {
            Some(monitor) => {
                monitor.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

// ── destruction ───────────────────────────────────────────────────────

/// Run the two-tier destroy contract after the count hit zero.
///
/// # Safety
///
/// `obj` must be a valid instance whose reference count just reached zero;
/// the caller holds the only remaining reference.
unsafe fn destruct(obj: NonNull<u8>) {
    // SAFETY: exclusive access per the function contract.
    unsafe {
        let descriptor = header(obj).descriptor();
        if let Some(destructor) = descriptor.destructor_op() {
            let mut slot = Some(obj);
            match destructor(&mut slot) {
                Reclaim::Now => reclaim(obj),
                Reclaim::Taken => {
                    trace!("destructor took over {} instance at {:p}", descriptor.name(), obj);
                }
            }
        } else {
            if let Some(destroy) = descriptor.destroy_op() {
                destroy(obj);
            }
            reclaim(obj);
        }
    }
}

/// Invalidate the header and, for runtime-owned memory, hand the origin
/// back to the allocator collaborator.
///
/// # Safety
///
/// `obj` must be an exclusively held instance past its destroy phase.
unsafe fn reclaim(obj: NonNull<u8>) {
    // SAFETY: exclusive access per the function contract.
    unsafe {
        let hdr = &mut *header_ptr(obj);
        let descriptor = hdr.descriptor();
        let allocated = hdr.is_allocated();
        hdr.invalidate();
        trace!(
            "reclaimed {} instance at {:p} (allocated: {allocated})",
            descriptor.name(),
            obj
        );
        if allocated {
            let prefix = prefix_length(descriptor.alignment());
            let origin = NonNull::new_unchecked(obj.as_ptr().sub(prefix));
            let layout = Layout::from_size_align_unchecked(
                prefix + descriptor.size(),
                descriptor.alignment(),
            );
            allocator().deallocate(origin, layout);
        }
    }
}

// ── std trait sugar ───────────────────────────────────────────────────

impl<T> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a Ref points at an initialized payload of type T.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Ref<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see Deref; concurrent payload mutation is guarded by the
        // object monitor, which is the caller's discipline.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_code());
    }
}

impl<T> fmt::Display for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.assert_valid();
        // SAFETY: self is valid.
        let text = unsafe { self.descriptor().to_string_op()(self.raw()) };
        f.write_str(&text)
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.debug_struct("Ref")
                .field("ptr", &self.ptr)
                .field("descriptor", &self.descriptor().name())
                .field("references", &self.reference_count())
                .finish()
        } else {
            f.debug_struct("Ref")
                .field("ptr", &self.ptr)
                .field("state", &"invalid")
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{RawAllocator, SystemAllocator, install_allocator};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Wrap target: 8-aligned scratch with plenty of room for prefix + payload.
    #[repr(align(8))]
    struct Scratch([u8; 512]);

    impl Scratch {
        fn new() -> Box<Self> {
            Box::new(Scratch([0; 512]))
        }

        fn origin(&mut self) -> NonNull<u8> {
            NonNull::new(self.0.as_mut_ptr()).unwrap()
        }
    }

    static PAIR: Descriptor = Descriptor::for_type::<[u64; 2]>("pair");

    #[test]
    fn fresh_instance_has_one_reference() {
        init_logs();
        let obj = Ref::create(&PAIR, [1u64, 2]).unwrap();
        assert_eq!(obj.reference_count(), 1);
        assert!(obj.is_valid());
        assert_eq!(obj.release(), 0);
    }

    #[test]
    fn acquire_release_balances() {
        let obj = Ref::create(&PAIR, [3u64, 4]).unwrap();
        let alias = obj.acquire();
        assert_eq!(obj.reference_count(), 2);
        assert_eq!(alias.release(), 1);
        assert_eq!(obj.reference_count(), 1);
        assert_eq!(obj.release(), 0);
    }

    #[test]
    fn deref_reads_and_writes_payload() {
        let mut obj = Ref::create(&PAIR, [7u64, 9]).unwrap();
        assert_eq!(obj[0], 7);
        obj[1] = 11;
        assert_eq!(*obj, [7, 11]);
        obj.release();
    }

    #[test]
    fn create_zeroed_clears_payload() {
        // SAFETY: all-zero [u64; 2] is valid.
        let obj: Ref<[u64; 2]> = unsafe { Ref::create_zeroed(&PAIR) }.unwrap();
        assert_eq!(*obj, [0, 0]);
        obj.release();
    }

    #[test]
    fn oversized_descriptor_reports_allocation_failure() {
        static HUGE: Descriptor = Descriptor::new("huge", isize::MAX as usize, 8);
        let result = Ref::<u8>::create(&HUGE, 0);
        let err = result.unwrap_err();
        assert!(err.size() > isize::MAX as usize / 2);
    }

    // ── destruction ───────────────────────────────────────────────

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_destroy(_obj: NonNull<u8>) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    static COUNTED: Descriptor =
        Descriptor::for_type::<u64>("counted").with_destroy(count_destroy);

    #[test]
    fn terminal_release_destroys_exactly_once() {
        let obj = Ref::create(&COUNTED, 5u64).unwrap();
        for _ in 0..4 {
            obj.acquire();
        }
        assert_eq!(obj.reference_count(), 5);
        for expected in (1..5).rev() {
            assert_eq!(obj.release(), expected);
            assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
        }
        assert_eq!(obj.release(), 0);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }

    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }
    }

    static TRACKED: Descriptor = Descriptor::for_type::<Tracked>("tracked");

    #[test]
    fn for_type_descriptor_runs_drop_glue_on_destroy() {
        let obj = Ref::create(&TRACKED, Tracked).unwrap();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 0);
        obj.release();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "invalid object")]
    fn release_after_terminal_release_traps() {
        let mut scratch = Scratch::new();
        // SAFETY: scratch covers prefix + payload and outlives the instance.
        let obj: Ref<u64> = unsafe { Ref::wrap(scratch.origin(), &PLAIN_WORD) };
        assert_eq!(obj.release(), 0);
        // The alias still points at mapped memory, but the guard is dead.
        let _ = obj.release();
    }

    #[test]
    fn released_alias_is_invalid_but_inspectable() {
        let mut scratch = Scratch::new();
        // SAFETY: scratch covers prefix + payload and outlives the instance.
        let obj: Ref<u64> = unsafe { Ref::wrap(scratch.origin(), &PLAIN_WORD) };
        let alias = obj;
        obj.release();
        assert!(!alias.is_valid());
    }

    // ── wrap ──────────────────────────────────────────────────────

    static PLAIN_WORD: Descriptor = Descriptor::for_type::<u64>("plain-word");

    #[test]
    fn wrap_places_payload_at_prefix() {
        let mut scratch = Scratch::new();
        let origin = scratch.origin();
        // SAFETY: scratch covers prefix + payload and outlives the instance.
        let obj: Ref<u64> = unsafe { Ref::wrap(origin, &PLAIN_WORD) };
        assert_eq!(
            obj.as_ptr() as usize,
            origin.as_ptr() as usize + prefix_length(PLAIN_WORD.alignment())
        );
        assert_eq!(obj.reference_count(), 1);
        obj.release();
        // The buffer is still ours to reuse; release never freed it.
        scratch.0[0] = 0xFF;
    }

    // ── dispatch ──────────────────────────────────────────────────

    unsafe fn hash_to_seven(_obj: NonNull<u8>) -> u64 {
        7
    }

    static HASH_ONLY: Descriptor = Descriptor::for_type::<[u64; 2]>("hash-only")
        .with_parent(&PAIR)
        .with_hash_code(hash_to_seven);

    #[test]
    fn unoverridden_operations_inherit_through_the_chain() {
        let obj = Ref::create(&HASH_ONLY, [1u64, 2]).unwrap();
        assert_eq!(obj.hash_code(), 7);
        // to_string falls through hash-only and pair to the default form.
        let text = obj.to_string();
        assert!(text.contains("hash-only"), "got: {text}");
        assert!(text.contains("references"), "got: {text}");
        obj.release();
    }

    static LEFT: Descriptor = Descriptor::for_type::<[u64; 2]>("left").with_parent(&PAIR);
    static RIGHT: Descriptor = Descriptor::for_type::<[u64; 2]>("right").with_parent(&PAIR);

    #[test]
    fn equals_requires_descriptor_identity_but_compare_does_not() {
        let a = Ref::create(&LEFT, [1u64, 2]).unwrap();
        let b = Ref::create(&RIGHT, [1u64, 2]).unwrap();
        let c = Ref::create(&LEFT, [1u64, 2]).unwrap();

        // Identical bytes, sibling descriptors: never equal.
        assert!(!a.equals(&b));
        // Same descriptor, identical bytes: equal.
        assert!(a.equals(&c));
        assert!(a.equals(&a), "referential identity short-circuits");
        // Ordering resolves from the left operand only and sees equal bytes.
        assert_eq!(a.compare(&b), CmpOrdering::Equal);

        let d = Ref::create(&RIGHT, [1u64, 3]).unwrap();
        assert_eq!(a.compare(&d), CmpOrdering::Less);

        a.release();
        b.release();
        c.release();
        d.release();
    }

    #[test]
    fn copy_yields_fresh_equal_instance() {
        let obj = Ref::create(&PAIR, [21u64, 42]).unwrap();
        let dup = obj.copy().unwrap();
        assert_eq!(dup.reference_count(), 1);
        assert!(!std::ptr::eq(obj.as_ptr(), dup.as_ptr()));
        assert!(obj.equals(&dup));
        assert_eq!(*dup, [21, 42]);
        obj.release();
        dup.release();
    }

    #[test]
    fn default_json_names_descriptor_and_header() {
        let obj = Ref::create(&PAIR, [0u64, 0]).unwrap();
        let json = obj.to_json();
        assert_eq!(json["descriptor"], "pair");
        assert_eq!(json["size"], 16);
        assert_eq!(json["referenceCount"], 1);
        obj.display(2); // smoke: default display prints the string form
        obj.release();
    }

    // ── type punning ──────────────────────────────────────────────

    static POOL_SLOT: Descriptor = Descriptor::for_type::<[u64; 2]>("pool-slot");
    static MESSAGE: Descriptor = Descriptor::for_type::<[u64; 2]>("message");

    #[test]
    fn set_descriptor_swaps_type_identity_in_place() {
        let obj = Ref::create(&MESSAGE, [5u64, 6]).unwrap();
        // SAFETY: identical layouts, no concurrent dispatch on obj.
        let previous = unsafe { obj.set_descriptor(&POOL_SLOT) };
        assert!(std::ptr::eq(previous, &MESSAGE));
        assert!(std::ptr::eq(obj.descriptor(), &POOL_SLOT));
        assert_eq!(*obj, [5, 6], "payload survives the pun");
        obj.release();
    }

    #[test]
    #[should_panic(expected = "lockability")]
    fn set_descriptor_refuses_lockability_change() {
        static LOCKING_SLOT: Descriptor =
            Descriptor::for_type::<[u64; 2]>("locking-slot").lockable();
        let obj = Ref::create(&MESSAGE, [0u64, 0]).unwrap();
        // SAFETY: serialized; the call itself is expected to trap.
        let _ = unsafe { obj.set_descriptor(&LOCKING_SLOT) };
    }

    // ── destructor veto ───────────────────────────────────────────

    static TAKEN_AT: AtomicUsize = AtomicUsize::new(0);

    unsafe fn take_over(slot: &mut Option<NonNull<u8>>) -> Reclaim {
        let obj = slot.take().expect("slot holds the object pointer");
        TAKEN_AT.store(obj.as_ptr() as usize, Ordering::SeqCst);
        Reclaim::Taken
    }

    static POOLED: Descriptor =
        Descriptor::for_type::<u64>("pooled").with_destructor(take_over);

    #[test]
    fn vetoing_destructor_takes_the_memory_over() {
        let mut scratch = Scratch::new();
        // SAFETY: scratch covers prefix + payload and outlives the instance.
        let obj: Ref<u64> = unsafe { Ref::wrap(scratch.origin(), &POOLED) };
        let addr = obj.as_ptr() as usize;
        assert_eq!(obj.release(), 0);
        assert_eq!(TAKEN_AT.load(Ordering::SeqCst), addr);
    }

    // ── monitor surface ───────────────────────────────────────────

    static GATE: Descriptor = Descriptor::for_type::<u64>("gate").lockable();

    #[test]
    fn monitor_calls_on_non_lockable_objects_fail_quietly() {
        let obj = Ref::create(&PAIR, [0u64, 0]).unwrap();
        assert!(!obj.lock());
        assert!(!obj.try_lock());
        assert!(!obj.unlock());
        assert!(!obj.is_locked());
        assert!(!obj.wait_for(Duration::from_millis(1)));
        assert!(!obj.notify());
        assert!(!obj.notify_all());
        obj.release();
    }

    #[test]
    fn lockable_object_guards_payload_across_threads() {
        let obj = Ref::create(&GATE, 0u64).unwrap();
        let mut joins = Vec::new();
        for _ in 0..4 {
            let mut alias = obj.acquire();
            joins.push(thread::spawn(move || {
                for _ in 0..100 {
                    assert!(alias.lock());
                    *alias += 1;
                    alias.unlock();
                }
                alias.release();
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert!(obj.lock());
        assert_eq!(*obj, 400);
        obj.unlock();
        obj.release();
    }

    #[test]
    fn wait_for_times_out_on_object_monitor() {
        let obj = Ref::create(&GATE, 0u64).unwrap();
        assert!(obj.lock());
        assert!(!obj.wait_for(Duration::from_millis(20)));
        assert!(obj.is_locked(), "lock reacquired after timeout");
        obj.unlock();
        obj.release();
    }

    #[test]
    fn notify_wakes_object_waiter() {
        let obj = Ref::create(&GATE, 0u64).unwrap();
        let woke = Arc::new(AtomicUsize::new(0));
        let woke2 = woke.clone();
        let alias = obj.acquire();

        let waiter = thread::spawn(move || {
            alias.lock();
            while *alias == 0 {
                alias.wait();
            }
            woke2.fetch_add(1, Ordering::SeqCst);
            alias.unlock();
            alias.release();
        });

        let mut setter = obj;
        while woke.load(Ordering::SeqCst) == 0 {
            if setter.try_lock() {
                *setter = 1;
                setter.notify();
                setter.unlock();
            }
            thread::sleep(Duration::from_millis(5));
        }
        waiter.join().unwrap();
        obj.release();
    }

    // ── installed allocator ───────────────────────────────────────

    /// Delegating counter keyed on an alignment no other test uses, so
    /// unrelated allocations do not disturb the counts.
    struct CountingAllocator {
        allocations: AtomicUsize,
        frees: AtomicUsize,
    }

    const COUNTED_ALIGN: usize = 256;

    impl RawAllocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            if layout.align() == COUNTED_ALIGN {
                self.allocations.fetch_add(1, Ordering::SeqCst);
            }
            SystemAllocator.allocate(layout)
        }

        fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
            if layout.align() == COUNTED_ALIGN {
                self.allocations.fetch_add(1, Ordering::SeqCst);
            }
            SystemAllocator.allocate_zeroed(layout)
        }

        unsafe fn reallocate(
            &self,
            ptr: NonNull<u8>,
            old: Layout,
            new_size: usize,
        ) -> Option<NonNull<u8>> {
            // SAFETY: forwarded caller contract.
            unsafe { SystemAllocator.reallocate(ptr, old, new_size) }
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            if layout.align() == COUNTED_ALIGN {
                self.frees.fetch_add(1, Ordering::SeqCst);
            }
            // SAFETY: forwarded caller contract.
            unsafe { SystemAllocator.deallocate(ptr, layout) }
        }
    }

    static COUNTING: CountingAllocator = CountingAllocator {
        allocations: AtomicUsize::new(0),
        frees: AtomicUsize::new(0),
    };

    static WIDE: Descriptor = Descriptor::new("wide", 64, COUNTED_ALIGN);

    #[test]
    fn installed_allocator_sees_creates_but_not_wraps() {
        init_logs();
        assert!(install_allocator(&COUNTING), "no other test installs");
        assert!(!install_allocator(&COUNTING), "second install is refused");

        let obj = Ref::<[u8; 64]>::create(&WIDE, [0; 64]).unwrap();
        assert_eq!(COUNTING.allocations.load(Ordering::SeqCst), 1);
        assert_eq!(COUNTING.frees.load(Ordering::SeqCst), 0);
        obj.release();
        assert_eq!(COUNTING.frees.load(Ordering::SeqCst), 1);

        // Wrapped instances never touch the collaborator.
        #[repr(align(256))]
        struct WideScratch([u8; 1024]);
        let mut scratch = WideScratch([0; 1024]);
        let origin = NonNull::new(scratch.0.as_mut_ptr()).unwrap();
        // SAFETY: scratch covers prefix + payload and outlives the instance.
        let wrapped: Ref<[u8; 64]> = unsafe { Ref::wrap(origin, &WIDE) };
        wrapped.release();
        assert_eq!(COUNTING.allocations.load(Ordering::SeqCst), 1);
        assert_eq!(COUNTING.frees.load(Ordering::SeqCst), 1);
    }
}
