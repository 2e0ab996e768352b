//! The hidden per-instance header.
//!
//! Every instance is laid out as `origin .. header .. payload`: the header
//! occupies the bytes immediately before the payload pointer handed to
//! callers, and the origin sits `prefix_length(align)` bytes before the
//! payload so the payload base satisfies the descriptor's alignment.
//!
//! ```text
//! origin                          payload ("object pointer")
//! │ ← padding → │ ←── Header ──→ │ ←── descriptor.size bytes ──→ │
//! │ ←────── prefix_length(align) ──────→ │
//! ```
//!
//! The guard marker doubles as a use-after-release detector: reclamation
//! overwrites it, so a stale alias fails validation instead of silently
//! dispatching into freed state (as long as the memory itself survives).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::descriptor::Descriptor;
use crate::monitor::Monitor;

/// Marks a live header. Chosen to be implausible as payload bytes.
const GUARD_LIVE: u64 = 0x0B1E_C770_0B1E_C770;
/// Written over the guard at reclamation time.
const GUARD_DEAD: u64 = 0xDEAD_0B1E_DEAD_0B1E;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HeaderFlags: u8 {
        /// The runtime owns the backing memory and frees it on destruction.
        /// Absent for headers overlaid onto externally supplied memory.
        const ALLOCATED = 1 << 0;
    }
}

/// Fixed-layout record preceding every payload.
#[repr(C)]
pub(crate) struct Header {
    guard: u64,
    references: AtomicUsize,
    descriptor: *const Descriptor,
    flags: HeaderFlags,
    monitor: Option<Monitor>,
}

// repr(C) rounds the struct size up to its alignment, so a payload aligned
// to at least align_of::<Header>() keeps the header in front aligned too.
const _: () = assert!(size_of::<Header>() % align_of::<Header>() == 0);

/// Smallest multiple of `align` that covers the header, i.e. the distance
/// from origin to payload. `align` must be a power of two no smaller than
/// the minimum object alignment (pointer size or the header's own
/// alignment, whichever is larger).
pub fn prefix_length(align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size_of::<Header>().next_multiple_of(align)
}

/// Shared view of the header preceding `obj`.
///
/// # Safety
///
/// `obj` must point at the payload of an instance whose header is intact or
/// at least still mapped (validation of released instances reads it too).
#[inline]
pub(crate) unsafe fn header<'a>(obj: NonNull<u8>) -> &'a Header {
    // SAFETY: the header ends exactly where the payload begins.
    unsafe { &*header_ptr(obj) }
}

/// Raw pointer to the header preceding `obj`; see [`header`] for the
/// contract.
#[inline]
pub(crate) unsafe fn header_ptr(obj: NonNull<u8>) -> *mut Header {
    // SAFETY: forwarded caller contract.
    unsafe { obj.as_ptr().sub(size_of::<Header>()).cast::<Header>() }
}

impl Header {
    pub(crate) fn new(descriptor: &'static Descriptor, flags: HeaderFlags) -> Self {
        Self {
            guard: GUARD_LIVE,
            references: AtomicUsize::new(1),
            descriptor,
            flags,
            monitor: descriptor.is_lockable().then(Monitor::new),
        }
    }

    #[inline]
    pub(crate) fn references(&self) -> &AtomicUsize {
        &self.references
    }

    #[inline]
    pub(crate) fn reference_count(&self) -> usize {
        self.references.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn descriptor(&self) -> &'static Descriptor {
        debug_assert!(!self.descriptor.is_null());
        // SAFETY: the descriptor pointer is non-null for the whole life of
        // the instance and only ever replaced with another static reference.
        unsafe { &*self.descriptor }
    }

    /// Replace the descriptor in place and return the previous one. The
    /// caller serializes this against concurrent dispatch.
    pub(crate) fn replace_descriptor(&mut self, descriptor: &'static Descriptor) -> &'static Descriptor {
        let previous = self.descriptor();
        self.descriptor = descriptor;
        previous
    }

    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        self.flags.contains(HeaderFlags::ALLOCATED)
    }

    #[inline]
    pub(crate) fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    /// Kill the guard marker and drop the embedded monitor. After this the
    /// header fails [`is_valid`](Self::is_valid) for good.
    pub(crate) fn invalidate(&mut self) {
        self.guard = GUARD_DEAD;
        self.monitor = None;
    }

    /// Guard intact, reference count positive, descriptor present, monitor
    /// present exactly when the descriptor is lockable.
    pub(crate) fn is_valid(&self) -> bool {
        self.guard == GUARD_LIVE
            && self.reference_count() > 0
            && !self.descriptor.is_null()
            && self.descriptor().is_lockable() == self.monitor.is_some()
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("live", &(self.guard == GUARD_LIVE))
            .field("references", &self.reference_count())
            .field("descriptor", &self.descriptor().name())
            .field("allocated", &self.is_allocated())
            .field("lockable", &self.monitor.is_some())
            .finish()
    }
}
