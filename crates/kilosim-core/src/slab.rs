//! Slab arena for weave-phase events.
//!
//! Events produced in the bound phase live until the weave phase consumes
//! them; freeing them one by one would thrash the allocator. Instead,
//! allocations bump-point into fixed-capacity slabs that carry a
//! live-element count and recycle themselves wholesale once their last
//! element is freed. Elements are addressed by (slab, index) handles, so
//! there is no pointer arithmetic to get wrong.

/// Handle to an element in a [`SlabArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabHandle {
    slab: u32,
    idx: u32,
}

struct Slab<T> {
    elems: Vec<Option<T>>,
    live: u32,
}

impl<T> Slab<T> {
    fn new(cap: usize) -> Self {
        Slab {
            elems: Vec::with_capacity(cap),
            live: 0,
        }
    }

    fn full(&self, cap: usize) -> bool {
        self.elems.len() >= cap
    }

    fn clear(&mut self) {
        debug_assert_eq!(self.live, 0);
        self.elems.clear();
    }
}

/// Fixed-slab bump allocator with whole-slab recycling.
pub struct SlabArena<T> {
    slabs: Vec<Slab<T>>,
    cur: u32,
    free_slabs: Vec<u32>,
    slab_cap: usize,
}

impl<T> SlabArena<T> {
    pub fn new(slab_cap: usize) -> Self {
        assert!(slab_cap > 0);
        SlabArena {
            slabs: vec![Slab::new(slab_cap)],
            cur: 0,
            free_slabs: Vec::new(),
            slab_cap,
        }
    }

    pub fn alloc(&mut self, value: T) -> SlabHandle {
        if self.slabs[self.cur as usize].full(self.slab_cap) {
            self.cur = match self.free_slabs.pop() {
                Some(s) => s,
                None => {
                    self.slabs.push(Slab::new(self.slab_cap));
                    (self.slabs.len() - 1) as u32
                }
            };
        }
        let slab = &mut self.slabs[self.cur as usize];
        slab.elems.push(Some(value));
        slab.live += 1;
        SlabHandle {
            slab: self.cur,
            idx: (slab.elems.len() - 1) as u32,
        }
    }

    pub fn get(&self, h: SlabHandle) -> &T {
        self.slabs[h.slab as usize].elems[h.idx as usize]
            .as_ref()
            .expect("use after free")
    }

    /// Remove the element. When the slab's last live element goes, the
    /// slab is cleared and recycled.
    pub fn free(&mut self, h: SlabHandle) -> T {
        let slab = &mut self.slabs[h.slab as usize];
        let v = slab.elems[h.idx as usize]
            .take()
            .expect("double free");
        assert!(slab.live > 0);
        slab.live -= 1;
        if slab.live == 0 && h.slab != self.cur {
            slab.clear();
            self.free_slabs.push(h.slab);
        }
        v
    }

    /// Number of slabs ever allocated (capacity metric, not live count).
    pub fn num_slabs(&self) -> usize {
        self.slabs.len()
    }

    pub fn live_in_slab(&self, slab: u32) -> u32 {
        self.slabs[slab as usize].live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_get_free_roundtrip() {
        let mut arena: SlabArena<u64> = SlabArena::new(4);
        let h = arena.alloc(42);
        assert_eq!(*arena.get(h), 42);
        assert_eq!(arena.free(h), 42);
    }

    #[test]
    fn slabs_recycle_when_drained() {
        let mut arena: SlabArena<u32> = SlabArena::new(2);
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        // Slab 0 is full; the next alloc opens slab 1.
        let c = arena.alloc(3);
        assert_eq!(arena.num_slabs(), 2);
        arena.free(a);
        arena.free(b);
        // Slab 0 is empty and no longer current: it must be reusable.
        arena.free(c);
        let d = arena.alloc(4);
        let e = arena.alloc(5);
        let f = arena.alloc(6);
        assert_eq!(arena.num_slabs(), 2, "drained slabs are reused, not leaked");
        assert_eq!((*arena.get(d), *arena.get(e), *arena.get(f)), (4, 5, 6));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught() {
        let mut arena: SlabArena<u8> = SlabArena::new(8);
        let h = arena.alloc(7);
        arena.free(h);
        arena.free(h);
    }

    #[test]
    fn live_counts_track_elements() {
        let mut arena: SlabArena<u8> = SlabArena::new(8);
        let hs: Vec<_> = (0..5).map(|i| arena.alloc(i)).collect();
        assert_eq!(arena.live_in_slab(0), 5);
        for h in hs {
            arena.free(h);
        }
        assert_eq!(arena.live_in_slab(0), 0);
    }
}
