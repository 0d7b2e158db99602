//! The cache hierarchy: arrays, coherence controllers, replacement and
//! partitioning policies.

pub mod arrays;
pub mod cc;
pub mod lookahead;
pub mod part;
pub mod repl;
pub mod umon;

use std::sync::{Arc, Mutex};

use crate::cache::arrays::CacheArray;
use crate::cache::cc::CoherenceCtrl;
use crate::cache::lookahead::LookaheadPartitioner;
use crate::mem::{Address, InvReq, MemObject, MemReq, MesiState};
use crate::stats::StatGroup;

/// A cache level. Terminal caches (L1s) sit at the bottom of the
/// hierarchy and have no children; non-terminal caches keep directory
/// state for theirs.
pub struct Cache {
    name: String,
    acc_lat: u64,
    inv_lat: u64,
    cc: CoherenceCtrl,
    array: Mutex<CacheArray>,
    partitioner: Option<Mutex<LookaheadPartitioner>>,
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        cc: CoherenceCtrl,
        array: CacheArray,
        acc_lat: u64,
        inv_lat: u64,
    ) -> Self {
        Cache {
            name: name.into(),
            acc_lat,
            inv_lat,
            cc,
            array: Mutex::new(array),
            partitioner: None,
        }
    }

    pub fn with_partitioner(mut self, partitioner: LookaheadPartitioner) -> Self {
        self.partitioner = Some(Mutex::new(partitioner));
        self
    }

    /// Wire this cache's parents. `child_id` is our index among each
    /// parent's children.
    pub fn set_parents(&self, child_id: u32, parents: Vec<Arc<dyn MemObject>>, rtts: Vec<u32>) {
        self.cc.set_parents(child_id, parents, rtts);
        self.refresh_repl_view();
    }

    pub fn set_children(&self, children: Vec<Arc<Cache>>, rtts: Vec<u32>) {
        self.cc.set_children(children, rtts);
        self.refresh_repl_view();
    }

    fn refresh_repl_view(&self) {
        if let Some(view) = self.cc.try_view() {
            self.array.lock().unwrap().repl.set_cc_view(view);
        }
    }

    pub fn init_stats(&self, parent: &mut StatGroup) {
        let mut g = StatGroup::new(self.name.clone(), "Cache stats");
        self.cc.init_stats(&mut g);
        let mut arr = self.array.lock().unwrap();
        arr.init_stats(&mut g);
        arr.repl.init_stats(&mut g);
        parent.add_group(g);
    }

    /// Invalidate or downgrade a line on behalf of a parent.
    pub fn invalidate(&self, req: &InvReq, writeback: &mut bool) -> u64 {
        self.cc.start_inv();
        let line_id = self.array.lock().unwrap().probe(req.line_addr);
        let resp_cycle = req.cycle + self.inv_lat;
        self.cc.process_inv(req, line_id, writeback, resp_cycle)
    }

    /// Rerun the partitioner against the current miss curves. Driven by a
    /// periodic phase event.
    pub fn repartition(&self) {
        if let Some(partitioner) = &self.partitioner {
            let mut arr = self.array.lock().unwrap();
            if let Some(pp) = arr.repl.as_partitioned() {
                partitioner.lock().unwrap().partition(pp);
            }
        }
    }

    /// Debug/test probe: the MESI state of a line, if present.
    pub fn line_state(&self, line_addr: Address) -> Option<MesiState> {
        let id = self.array.lock().unwrap().probe(line_addr)?;
        Some(self.cc.state(id))
    }

    /// Debug/test probe: how many children share a line.
    pub fn line_sharers(&self, line_addr: Address) -> u32 {
        match self.array.lock().unwrap().probe(line_addr) {
            Some(id) => self.cc.num_sharers(id),
            None => 0,
        }
    }
}

impl MemObject for Cache {
    fn access(&self, req: &mut MemReq) -> u64 {
        let mut resp_cycle = req.cycle;
        let skip = self.cc.start_access(req);
        if !skip {
            let update_replacement = req.acc_type.is_get();
            let mut line_id = self
                .array
                .lock()
                .unwrap()
                .lookup(req.line_addr, req, update_replacement);
            resp_cycle += self.acc_lat;

            if line_id.is_none() && self.cc.should_allocate(req) {
                // Make space: pick a victim, drive the eviction through
                // both controllers, then commit the new tag. Evictions
                // stay off the critical path.
                let (victim, wb_addr) = self.array.lock().unwrap().preinsert(req.line_addr, req);
                self.cc.process_eviction(req, wb_addr, victim, resp_cycle);
                self.array.lock().unwrap().postinsert(req.line_addr, req, victim);
                line_id = Some(victim);
            }
            resp_cycle = self.cc.process_access(req, line_id, resp_cycle);
        }
        self.cc.end_access(req);
        assert!(resp_cycle >= req.cycle);
        resp_cycle
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::repl::{LruPolicy, ReplPolicy};
    use crate::hash::HashFamily;
    use crate::mem::{AccessFlags, AccessType, MemReq, MesiEntry, SimpleMemory};

    fn terminal(name: &str, lines: u32, assoc: u32) -> Cache {
        Cache::new(
            name,
            CoherenceCtrl::terminal(name, lines),
            CacheArray::set_assoc(
                lines,
                assoc,
                ReplPolicy::Lru(LruPolicy::new(lines, false)),
                HashFamily::Identity,
            ),
            1,
            1,
        )
    }

    fn shared_l2(name: &str, lines: u32, assoc: u32) -> Cache {
        Cache::new(
            name,
            CoherenceCtrl::full(name, lines, false),
            CacheArray::set_assoc(
                lines,
                assoc,
                // Plain LRU: the inclusion tests need victims picked by
                // age alone, not sharer counts.
                ReplPolicy::Lru(LruPolicy::new(lines, false)),
                HashFamily::Identity,
            ),
            5,
            2,
        )
    }

    struct Hierarchy {
        l1a: Arc<Cache>,
        l1b: Arc<Cache>,
        l2: Arc<Cache>,
    }

    fn build() -> Hierarchy {
        let mem: Arc<dyn MemObject> = Arc::new(SimpleMemory::new(100, "mem"));
        let l2 = Arc::new(shared_l2("l2", 32, 4));
        let l1a = Arc::new(terminal("l1a", 8, 2));
        let l1b = Arc::new(terminal("l1b", 8, 2));
        l2.set_children(vec![Arc::clone(&l1a), Arc::clone(&l1b)], vec![5, 5]);
        l2.set_parents(0, vec![mem], vec![10]);
        l1a.set_parents(0, vec![Arc::clone(&l2) as Arc<dyn MemObject>], vec![2]);
        l1b.set_parents(1, vec![Arc::clone(&l2) as Arc<dyn MemObject>], vec![2]);
        Hierarchy { l1a, l1b, l2 }
    }

    fn access(cache: &Cache, addr: Address, acc_type: AccessType, src: u32) -> u64 {
        access_flags(cache, addr, acc_type, src, AccessFlags::empty())
    }

    fn access_flags(
        cache: &Cache,
        addr: Address,
        acc_type: AccessType,
        src: u32,
        flags: AccessFlags,
    ) -> u64 {
        let entry = MesiEntry::default();
        let mut req = MemReq {
            line_addr: addr,
            acc_type,
            child_id: 0,
            state: &entry,
            cycle: 0,
            child_lock: None,
            initial_state: entry.get(),
            src_id: src,
            flags,
        };
        cache.access(&mut req)
    }

    /// Present-in-child states for a line, ordered [l1a, l1b].
    fn child_states(h: &Hierarchy, addr: Address) -> Vec<Option<MesiState>> {
        vec![h.l1a.line_state(addr), h.l1b.line_state(addr)]
    }

    fn sharer_sum(h: &Hierarchy, addr: Address) -> u32 {
        child_states(h, addr)
            .into_iter()
            .flatten()
            .filter(|&s| s != MesiState::I)
            .count() as u32
    }

    #[test]
    fn first_reader_gets_exclusive() {
        let h = build();
        let miss = access(&h.l1a, 0x104, AccessType::Gets, 0);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::E));
        assert_eq!(h.l2.line_sharers(0x104), 1);
        let hit = access(&h.l1a, 0x104, AccessType::Gets, 0);
        assert!(miss > hit, "miss latency {miss} must exceed hit latency {hit}");
    }

    #[test]
    fn second_reader_downgrades_owner() {
        let h = build();
        access(&h.l1a, 0x104, AccessType::Gets, 0);
        access(&h.l1b, 0x104, AccessType::Gets, 1);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::S));
        assert_eq!(h.l1b.line_state(0x104), Some(MesiState::S));
        assert_eq!(h.l2.line_sharers(0x104), 2);
    }

    #[test]
    fn writer_invalidates_other_sharers() {
        let h = build();
        access(&h.l1a, 0x104, AccessType::Gets, 0);
        access(&h.l1b, 0x104, AccessType::Gets, 1);
        access(&h.l1a, 0x104, AccessType::Getx, 0);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::M));
        assert_eq!(h.l1b.line_state(0x104), Some(MesiState::I));
        assert_eq!(h.l2.line_sharers(0x104), 1);
    }

    #[test]
    fn sharer_counts_match_child_states() {
        let h = build();
        for (addr, t, src) in [
            (0x104u64, AccessType::Gets, 0u32),
            (0x104, AccessType::Gets, 1),
            (0x208, AccessType::Getx, 1),
            (0x104, AccessType::Getx, 0),
            (0x208, AccessType::Gets, 0),
        ] {
            let c = if src == 0 { &h.l1a } else { &h.l1b };
            access(c, addr, t, src);
            for probe in [0x104u64, 0x208] {
                assert_eq!(
                    h.l2.line_sharers(probe),
                    sharer_sum(&h, probe),
                    "sharer mismatch on {probe:#x} after {t} {addr:#x}"
                );
            }
        }
    }

    #[test]
    fn dirty_line_writes_back_on_l1_eviction() {
        let h = build();
        // Identity hashing: 0x104, 0x108, 0x10c all land in l1 set 0
        // (8 lines, 2 ways -> 4 sets).
        access(&h.l1a, 0x104, AccessType::Getx, 0);
        access(&h.l1a, 0x108, AccessType::Gets, 0);
        access(&h.l1a, 0x10c, AccessType::Gets, 0);
        // 0x104 was LRU and dirty; it must be PUTX'd up and its l1 slot
        // reused.
        assert_eq!(h.l1a.line_state(0x104), None);
        assert_eq!(h.l2.line_state(0x104), Some(MesiState::M));
        assert_eq!(h.l2.line_sharers(0x104), 0);
    }

    #[test]
    fn l2_eviction_enforces_inclusion() {
        let h = build();
        // l2 set 0 (32 lines, 4 ways -> 8 sets): addresses = 0 mod 8.
        access(&h.l1a, 0x8, AccessType::Gets, 0);
        assert_eq!(h.l1a.line_state(0x8), Some(MesiState::E));
        // Four more lines in l2 set 0 push 0x8 out of l2.
        for addr in [0x10u64, 0x18, 0x20, 0x28] {
            access(&h.l1b, addr, AccessType::Gets, 1);
        }
        // 0x8 was the oldest line in the set and is gone from l2.
        assert_eq!(h.l2.line_state(0x8), None);
        // Inclusion: the child's copy was invalidated with it.
        assert_eq!(h.l1a.line_state(0x8), Some(MesiState::I));
    }

    #[test]
    fn noexcl_read_is_granted_shared() {
        let h = build();
        access_flags(&h.l1a, 0x104, AccessType::Gets, 0, AccessFlags::NOEXCL);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::S));
    }

    #[test]
    fn upgrade_miss_from_shared() {
        let h = build();
        access(&h.l1a, 0x104, AccessType::Gets, 0);
        access(&h.l1b, 0x104, AccessType::Gets, 1);
        // l1b upgrades from S; l1a must drop its copy.
        access(&h.l1b, 0x104, AccessType::Getx, 1);
        assert_eq!(h.l1b.line_state(0x104), Some(MesiState::M));
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::I));
    }

    #[test]
    fn fwd_leaves_shared_state_alone() {
        let h = build();
        access(&h.l1a, 0x104, AccessType::Gets, 0);
        access(&h.l1b, 0x104, AccessType::Gets, 1);
        let req = InvReq {
            line_addr: 0x104,
            inv_type: crate::mem::InvType::Fwd,
            cycle: 50,
            src_id: 0,
        };
        let mut wb = false;
        h.l1a.invalidate(&req, &mut wb);
        assert!(!wb);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::S));
    }

    #[test]
    fn downgrade_of_dirty_owner_reports_writeback() {
        let h = build();
        access(&h.l1a, 0x104, AccessType::Getx, 0);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::M));
        // A read from the sibling forces INVX; the dirty data surfaces
        // and l2 ends up holding it dirty.
        access(&h.l1b, 0x104, AccessType::Gets, 1);
        assert_eq!(h.l1a.line_state(0x104), Some(MesiState::S));
        assert_eq!(h.l1b.line_state(0x104), Some(MesiState::S));
        assert_eq!(h.l2.line_state(0x104), Some(MesiState::M));
    }
}
