//! Reference-counted object runtime with header-before-payload instances.
//!
//! Every instance is a payload pointer whose bookkeeping lives in the bytes
//! immediately before it: guard marker, atomic reference count, descriptor
//! pointer, flags, and an optional monitor. Subtypes register a static
//! [`Descriptor`] carrying their extent and virtual operations; dispatch
//! walks the descriptor's parent chain to the base descriptor. Clients hold
//! [`Ref<T>`] handles and drive lifetime explicitly through
//! [`Ref::acquire`] and [`Ref::release`].
//!
//! ```
//! use plinth::{Descriptor, Ref};
//!
//! static POINT: Descriptor = Descriptor::for_type::<[i64; 2]>("point");
//!
//! let p = Ref::create(&POINT, [3i64, 4]).unwrap();
//! let q = p.acquire();
//! assert_eq!(p.reference_count(), 2);
//! assert_eq!(q.release(), 1);
//! assert_eq!(p.release(), 0);
//! ```

mod allocator;
mod descriptor;
mod header;
mod monitor;
mod object;

pub use allocator::{AllocError, RawAllocator, SystemAllocator, install_allocator};
pub use descriptor::{
    CompareOp, CopyOp, Descriptor, DestroyOp, DestructorOp, DisplayOp, EqualsOp, HashCodeOp,
    Reclaim, ToJsonOp, ToStringOp, drop_payload,
};
pub use header::prefix_length;
pub use object::Ref;
