//! Pluggable raw-memory collaborator.
//!
//! The runtime never assumes a specific allocator. A process installs one
//! implementation of [`RawAllocator`] at most once; until then every request
//! falls through to [`SystemAllocator`], which forwards to `std::alloc`.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use log::debug;
use once_cell::sync::OnceCell;

/// Raw allocate/zero/reallocate/free contract consumed by the allocation
/// engine. Implementations must be usable from any thread.
pub trait RawAllocator: Sync {
    /// Allocate `layout.size()` bytes at `layout.align()`. Returns `None`
    /// when the request cannot be satisfied.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Like [`allocate`](Self::allocate) with the returned bytes zero-filled.
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Grow or shrink an existing allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `old` and not yet
    /// freed. On success the old pointer is invalid.
    unsafe fn reallocate(&self, ptr: NonNull<u8>, old: Layout, new_size: usize)
    -> Option<NonNull<u8>>;

    /// Return an allocation to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for `layout` and not
    /// yet freed.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Default collaborator over the Rust global allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout is non-zero sized.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout is non-zero sized.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), old, new_size) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

static SYSTEM: SystemAllocator = SystemAllocator;
static INSTALLED: OnceCell<&'static dyn RawAllocator> = OnceCell::new();

/// Install the process-wide allocator collaborator.
///
/// Succeeds at most once; returns false if an allocator was already
/// installed. Objects allocated before the install are still reclaimed
/// through the installed allocator, so a replacement must be able to free
/// memory obtained from [`SystemAllocator`] (delegating wrappers are fine).
pub fn install_allocator(allocator: &'static dyn RawAllocator) -> bool {
    let installed = INSTALLED.set(allocator).is_ok();
    if installed {
        debug!("installed process-wide object allocator");
    }
    installed
}

/// The currently effective allocator collaborator.
pub(crate) fn allocator() -> &'static dyn RawAllocator {
    INSTALLED.get().copied().unwrap_or(&SYSTEM)
}

/// Instance allocation failed: the collaborator returned null or the
/// requested extent does not form a representable layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    size: usize,
    align: usize,
}

impl AllocError {
    pub(crate) fn new(size: usize, align: usize) -> Self {
        Self { size, align }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.align
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation of {} bytes (alignment {}) failed",
            self.size, self.align
        )
    }
}

impl std::error::Error for AllocError {}
