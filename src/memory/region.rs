// Region: a bump allocator over slabs.
//
// Allocation carves bytes off the head slab; a full head links a new
// slab at the front. `used`/`truncate` give mark/release semantics: a
// caller records the watermark, allocates freely, then truncates back,
// releasing every slab linked since the mark. Regions belong to one
// fiber and are reset at request boundaries; they are not Sync.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::slab::{Slab, SlabCache, SLAB_SIZE};

struct RegionSlab {
    mem: Slab,
    /// Bump offset within this slab.
    off: usize,
    /// Value of `used` when this slab was linked.
    base: usize,
}

struct RegionInner {
    slabs: Vec<RegionSlab>,
    used: usize,
}

pub struct Region {
    cache: Arc<SlabCache>,
    inner: RefCell<RegionInner>,
}

impl Region {
    pub fn new(cache: Arc<SlabCache>) -> Region {
        Region {
            cache,
            inner: RefCell::new(RegionInner {
                slabs: Vec::new(),
                used: 0,
            }),
        }
    }

    /// Total bytes handed out since the last reset. Pass the returned
    /// watermark to `truncate` to release everything allocated after it.
    pub fn used(&self) -> usize {
        self.inner.borrow().used
    }

    /// Allocate `size` contiguous bytes, zero-initialised.
    ///
    /// The pointer stays valid until `truncate` releases past its
    /// watermark or `reset` runs: slabs are boxed and never move, and
    /// bump allocation never overwrites earlier bytes.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let mut inner = self.inner.borrow_mut();
        let fits_head = inner
            .slabs
            .last()
            .map(|head| head.mem.len() - head.off >= size)
            .unwrap_or(false);
        if !fits_head {
            let used = inner.used;
            let mem = self.cache.get(size)?;
            inner.slabs.push(RegionSlab {
                mem,
                off: 0,
                base: used,
            });
        }
        let head = inner.slabs.last_mut().unwrap();
        let ptr = unsafe { head.mem.as_mut_ptr().add(head.off) };
        head.off += size;
        inner.used += size;
        Ok(NonNull::new(ptr).unwrap())
    }

    /// Copy `src` into the region and return the copy.
    pub fn dup(&self, src: &[u8]) -> Result<NonNull<u8>> {
        let dst = self.alloc(src.len())?;
        if !src.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len());
            }
        }
        Ok(dst)
    }

    /// Release every slab linked after `mark` and restore
    /// `used() == mark`. `mark` must come from an earlier `used` call.
    pub fn truncate(&self, mark: usize) {
        let mut inner = self.inner.borrow_mut();
        assert!(mark <= inner.used, "truncate past the allocation head");
        while let Some(head) = inner.slabs.last() {
            if head.base < mark {
                break;
            }
            let head = inner.slabs.pop().unwrap();
            self.cache.put(head.mem);
        }
        if let Some(head) = inner.slabs.last_mut() {
            head.off = mark - head.base;
        }
        inner.used = mark;
    }

    /// Release everything. Run at every request boundary.
    pub fn reset(&self) {
        self.truncate(0);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_mark() {
        let region = Region::new(SlabCache::new());
        let mark0 = region.used();
        let a = region.alloc(100).unwrap();
        let b = region.alloc(28).unwrap();
        assert_eq!(region.used(), 128);
        // Contiguous carving off the head slab.
        assert_eq!(unsafe { a.as_ptr().add(100) }, b.as_ptr());
        region.truncate(mark0);
        assert_eq!(region.used(), 0);
    }

    #[test]
    fn truncate_releases_later_slabs() {
        let cache = SlabCache::new();
        let region = Region::new(cache.clone());
        region.alloc(64).unwrap();
        let mark = region.used();
        // Force a second slab.
        region.alloc(SLAB_SIZE).unwrap();
        region.alloc(32).unwrap();
        region.truncate(mark);
        assert_eq!(region.used(), mark);
        // The head slab survives and keeps serving.
        region.alloc(16).unwrap();
        assert_eq!(region.used(), mark + 16);
    }

    #[test]
    fn dup_copies() {
        let region = Region::new(SlabCache::new());
        let ptr = region.dup(b"scratch").unwrap();
        let copy = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 7) };
        assert_eq!(copy, b"scratch");
    }

    #[test]
    fn earlier_pointers_survive_growth() {
        let region = Region::new(SlabCache::new());
        let early = region.dup(b"stay").unwrap();
        for _ in 0..8 {
            region.alloc(SLAB_SIZE / 2).unwrap();
        }
        let bytes = unsafe { std::slice::from_raw_parts(early.as_ptr(), 4) };
        assert_eq!(bytes, b"stay");
    }
}
