//! Per-type descriptors and virtual-operation dispatch.
//!
//! A [`Descriptor`] is the static record a subtype registers with the
//! runtime: payload size and alignment, a lockable flag, up to nine
//! operation pointers, and a link to a parent descriptor. Parent links form
//! a singly linked chain ending at the base descriptor, and dispatch walks
//! that chain at call time: the first non-empty slot wins. The base
//! descriptor guarantees a default for every operation except `destroy` and
//! `destructor`, which stay empty unless some ancestor supplies them.
//!
//! Descriptors are normally `static` items built with the `const` methods
//! below. Dynamically built descriptors go through [`Descriptor::into_static`]
//! and are reclaimed by their creator once the last instance is gone.

use std::cmp::Ordering;
use std::fmt;
use std::mem::needs_drop;
use std::ptr::NonNull;

use crate::allocator::AllocError;

/// Whether the allocation engine should reclaim memory after a destructor
/// ran, or the destructor took the memory over (buffer pools do this to
/// recycle payloads instead of freeing them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Proceed with automatic reclamation.
    Now,
    /// The destructor owns the memory; the engine does nothing further.
    Taken,
}

/// Finalize the payload before reclamation. Reclamation always follows.
pub type DestroyOp = unsafe fn(obj: NonNull<u8>);

/// Veto-capable finalizer. Receives the pointer slot by reference and may
/// take it; returning [`Reclaim::Taken`] makes the destructor solely
/// responsible for the backing memory.
pub type DestructorOp = unsafe fn(obj: &mut Option<NonNull<u8>>) -> Reclaim;

/// Produce a new instance with reference count 1.
pub type CopyOp = unsafe fn(obj: NonNull<u8>) -> Result<NonNull<u8>, AllocError>;

/// Payload equality. Only ever invoked on two instances sharing the exact
/// same descriptor; referential identity was already ruled out.
pub type EqualsOp = unsafe fn(a: NonNull<u8>, b: NonNull<u8>) -> bool;

/// Payload ordering, resolved from the left operand's chain only.
pub type CompareOp = unsafe fn(a: NonNull<u8>, b: NonNull<u8>) -> Ordering;

/// Payload hash.
pub type HashCodeOp = unsafe fn(obj: NonNull<u8>) -> u64;

/// Human-readable representation.
pub type ToStringOp = unsafe fn(obj: NonNull<u8>) -> String;

/// JSON representation.
pub type ToJsonOp = unsafe fn(obj: NonNull<u8>) -> serde_json::Value;

/// Print a representation to stdout at the given indentation depth.
pub type DisplayOp = unsafe fn(obj: NonNull<u8>, indent: usize);

/// Operation slots of one descriptor. Empty slots defer to the parent chain.
#[derive(Clone, Copy, Default)]
pub(crate) struct OpTable {
    pub(crate) destroy: Option<DestroyOp>,
    pub(crate) destructor: Option<DestructorOp>,
    pub(crate) copy: Option<CopyOp>,
    pub(crate) equals: Option<EqualsOp>,
    pub(crate) compare: Option<CompareOp>,
    pub(crate) hash_code: Option<HashCodeOp>,
    pub(crate) to_string: Option<ToStringOp>,
    pub(crate) to_json: Option<ToJsonOp>,
    pub(crate) display: Option<DisplayOp>,
}

impl OpTable {
    pub(crate) const EMPTY: Self = Self {
        destroy: None,
        destructor: None,
        copy: None,
        equals: None,
        compare: None,
        hash_code: None,
        to_string: None,
        to_json: None,
        display: None,
    };
}

/// Static per-type record: payload extent, operation table, parent link.
pub struct Descriptor {
    pub(crate) name: &'static str,
    pub(crate) size: usize,
    pub(crate) align: usize,
    pub(crate) lockable: bool,
    pub(crate) parent: Option<&'static Descriptor>,
    pub(crate) ops: OpTable,
}

/// Smallest alignment any instance payload may declare: at least pointer
/// size, and enough to keep the header in front of it aligned.
pub(crate) const fn min_object_alignment() -> usize {
    let ptr = size_of::<usize>();
    let hdr = align_of::<crate::header::Header>();
    if ptr > hdr { ptr } else { hdr }
}

impl Descriptor {
    /// A descriptor for a `size`-byte payload at `align`. The parent
    /// defaults to the base descriptor.
    ///
    /// Traps unless `align` is a power of two no smaller than
    /// [`min_object_alignment`].
    pub const fn new(name: &'static str, size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "object alignment must be a power of two");
        assert!(
            align >= min_object_alignment(),
            "object alignment must be at least the pointer size and the header alignment"
        );
        Self {
            name,
            size,
            align,
            lockable: false,
            parent: Some(&BASE),
            ops: OpTable::EMPTY,
        }
    }

    /// A descriptor whose extent matches the Rust type `T`. When `T` has
    /// drop glue the `destroy` slot is pre-filled with [`drop_payload`] so
    /// terminal release runs it.
    pub const fn for_type<T>(name: &'static str) -> Self {
        let align = {
            let a = align_of::<T>();
            let m = min_object_alignment();
            if a > m { a } else { m }
        };
        let mut descriptor = Self::new(name, size_of::<T>(), align);
        if needs_drop::<T>() {
            descriptor.ops.destroy = Some(drop_payload::<T>);
        }
        descriptor
    }

    /// The root of every descriptor chain.
    pub fn base() -> &'static Descriptor {
        &BASE
    }

    // ── const builder ──────────────────────────────────────────────

    pub const fn with_parent(mut self, parent: &'static Descriptor) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Declare instances lockable; their headers carry a monitor.
    pub const fn lockable(mut self) -> Self {
        self.lockable = true;
        self
    }

    pub const fn with_destroy(mut self, op: DestroyOp) -> Self {
        self.ops.destroy = Some(op);
        self
    }

    pub const fn with_destructor(mut self, op: DestructorOp) -> Self {
        self.ops.destructor = Some(op);
        self
    }

    pub const fn with_copy(mut self, op: CopyOp) -> Self {
        self.ops.copy = Some(op);
        self
    }

    pub const fn with_equals(mut self, op: EqualsOp) -> Self {
        self.ops.equals = Some(op);
        self
    }

    pub const fn with_compare(mut self, op: CompareOp) -> Self {
        self.ops.compare = Some(op);
        self
    }

    pub const fn with_hash_code(mut self, op: HashCodeOp) -> Self {
        self.ops.hash_code = Some(op);
        self
    }

    pub const fn with_to_string(mut self, op: ToStringOp) -> Self {
        self.ops.to_string = Some(op);
        self
    }

    pub const fn with_to_json(mut self, op: ToJsonOp) -> Self {
        self.ops.to_json = Some(op);
        self
    }

    pub const fn with_display(mut self, op: DisplayOp) -> Self {
        self.ops.display = Some(op);
        self
    }

    // ── accessors ──────────────────────────────────────────────────

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn is_lockable(&self) -> bool {
        self.lockable
    }

    pub fn parent(&self) -> Option<&'static Descriptor> {
        self.parent
    }

    // ── dynamic descriptors ────────────────────────────────────────

    /// Promote a dynamically built descriptor to static lifetime.
    pub fn into_static(self) -> &'static Descriptor {
        Box::leak(Box::new(self))
    }

    /// Reclaim a descriptor obtained from [`into_static`](Self::into_static).
    ///
    /// # Safety
    ///
    /// `descriptor` must come from `into_static`, no instance carrying it may
    /// be alive, and no other descriptor may name it as parent.
    pub unsafe fn reclaim_static(descriptor: &'static Descriptor) {
        // SAFETY: by contract the reference is a leaked Box and unreachable
        // from any live object or chain.
        drop(unsafe { Box::from_raw(descriptor as *const Descriptor as *mut Descriptor) });
    }

    // ── dispatch resolution ────────────────────────────────────────

    /// Walk the chain from `self` toward the base until a slot is filled.
    fn resolve<F: Copy>(&self, pick: fn(&OpTable) -> Option<F>) -> Option<F> {
        let mut current = Some(self);
        while let Some(descriptor) = current {
            if let Some(op) = pick(&descriptor.ops) {
                return Some(op);
            }
            current = descriptor.parent;
        }
        None
    }

    pub(crate) fn destroy_op(&self) -> Option<DestroyOp> {
        self.resolve(|t| t.destroy)
    }

    pub(crate) fn destructor_op(&self) -> Option<DestructorOp> {
        self.resolve(|t| t.destructor)
    }

    pub(crate) fn copy_op(&self) -> CopyOp {
        self.resolve(|t| t.copy).unwrap_or(defaults::copy)
    }

    pub(crate) fn equals_op(&self) -> EqualsOp {
        self.resolve(|t| t.equals).unwrap_or(defaults::equals)
    }

    pub(crate) fn compare_op(&self) -> CompareOp {
        self.resolve(|t| t.compare).unwrap_or(defaults::compare)
    }

    pub(crate) fn hash_code_op(&self) -> HashCodeOp {
        self.resolve(|t| t.hash_code).unwrap_or(defaults::hash_code)
    }

    pub(crate) fn to_string_op(&self) -> ToStringOp {
        self.resolve(|t| t.to_string).unwrap_or(defaults::to_string)
    }

    pub(crate) fn to_json_op(&self) -> ToJsonOp {
        self.resolve(|t| t.to_json).unwrap_or(defaults::to_json)
    }

    pub(crate) fn display_op(&self) -> DisplayOp {
        self.resolve(|t| t.display).unwrap_or(defaults::display)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("lockable", &self.lockable)
            .field("parent", &self.parent.map(|p| p.name))
            .finish()
    }
}

/// Destroy operation that runs the payload type's drop glue in place.
///
/// # Safety
///
/// Only usable on descriptors whose instances hold an initialized `T`.
pub unsafe fn drop_payload<T>(obj: NonNull<u8>) {
    // SAFETY: by contract the payload is a valid T, about to be reclaimed.
    unsafe { obj.cast::<T>().drop_in_place() }
}

/// Root of every chain: byte-wise defaults over the declared payload extent.
static BASE: Descriptor = Descriptor {
    name: "object",
    size: 0,
    align: min_object_alignment(),
    lockable: false,
    parent: None,
    ops: OpTable {
        destroy: None,
        destructor: None,
        copy: Some(defaults::copy),
        equals: Some(defaults::equals),
        compare: Some(defaults::compare),
        hash_code: Some(defaults::hash_code),
        to_string: Some(defaults::to_string),
        to_json: Some(defaults::to_json),
        display: Some(defaults::display),
    },
};

mod defaults {
    use std::cmp::Ordering;
    use std::ptr::{self, NonNull};

    use std::hash::BuildHasher;

    use ahash::RandomState;
    use once_cell::sync::Lazy;
    use serde_json::json;

    use crate::allocator::AllocError;
    use crate::header::header;
    use crate::object::create_raw;

    // Fixed seeds keep hash codes stable within a process run.
    static HASH_STATE: Lazy<RandomState> =
        Lazy::new(|| RandomState::with_seeds(0x243F_6A88, 0x85A3_08D3, 0x1319_8A2E, 0x0370_7344));

    /// # Safety
    /// `obj` must be a valid object pointer.
    unsafe fn payload<'a>(obj: NonNull<u8>) -> &'a [u8] {
        // SAFETY: the header precedes every valid object and its descriptor
        // declares the payload extent.
        unsafe {
            let size = header(obj).descriptor().size;
            std::slice::from_raw_parts(obj.as_ptr(), size)
        }
    }

    pub(super) unsafe fn copy(obj: NonNull<u8>) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: source is valid; the clone shares its descriptor, so the
        // extents match exactly.
        unsafe {
            let descriptor = header(obj).descriptor();
            let clone = create_raw(descriptor, false)?;
            ptr::copy_nonoverlapping(obj.as_ptr(), clone.as_ptr(), descriptor.size);
            Ok(clone)
        }
    }

    pub(super) unsafe fn equals(a: NonNull<u8>, b: NonNull<u8>) -> bool {
        // SAFETY: both operands are valid and share a descriptor.
        unsafe { payload(a) == payload(b) }
    }

    pub(super) unsafe fn compare(a: NonNull<u8>, b: NonNull<u8>) -> Ordering {
        // SAFETY: dispatch resolved from `a`; `b` must span at least as many
        // bytes, which is the caller's obligation for heterogeneous operands.
        unsafe { payload(a).cmp(payload(b)) }
    }

    pub(super) unsafe fn hash_code(obj: NonNull<u8>) -> u64 {
        // SAFETY: obj is a valid object pointer.
        unsafe { HASH_STATE.hash_one(payload(obj)) }
    }

    pub(super) unsafe fn to_string(obj: NonNull<u8>) -> String {
        // SAFETY: obj is a valid object pointer.
        unsafe {
            let hdr = header(obj);
            let descriptor = hdr.descriptor();
            format!(
                "{} @ {:p} [{} bytes, {} references]",
                descriptor.name,
                obj,
                descriptor.size,
                hdr.reference_count()
            )
        }
    }

    pub(super) unsafe fn to_json(obj: NonNull<u8>) -> serde_json::Value {
        // SAFETY: obj is a valid object pointer.
        unsafe {
            let hdr = header(obj);
            let descriptor = hdr.descriptor();
            json!({
                "descriptor": descriptor.name,
                "size": descriptor.size,
                "alignment": descriptor.align,
                "lockable": descriptor.lockable,
                "referenceCount": hdr.reference_count(),
            })
        }
    }

    pub(super) unsafe fn display(obj: NonNull<u8>, indent: usize) {
        // SAFETY: obj is a valid object pointer.
        let text = unsafe { to_string(obj) };
        let pad = " ".repeat(indent);
        println!("{pad}{text}");
    }
}
