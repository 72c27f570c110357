// Memory management: a slab cache feeding per-fiber bump regions.
//
// Two layers. The slab cache keeps a free list of fixed-size slabs and
// enforces the optional process-wide memory limit. A region is a bump
// allocator carved out of slabs; a fiber allocates request scratch from
// its region and releases everything at once at the request boundary.

pub mod region;
pub mod slab;

pub use region::Region;
pub use slab::{SlabCache, SLAB_SIZE};
