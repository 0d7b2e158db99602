//! Cache arrays: tag storage and victim selection.
//!
//! Two organizations: a classic set-associative array, and the
//! skew-associative ZCache, which hashes each way independently and gains
//! effective associativity by relocating lines along a replacement chain
//! found with a BFS walk over the tags.
//!
//! Insertions are two-phase: `preinsert` picks the victim (the coherence
//! controller then drives the eviction, possibly unlocking the cache), and
//! `postinsert` commits the new tag.

use crate::cache::repl::{Candidates, ReplPolicy};
use crate::hash::HashFamily;
use crate::mem::{Address, MemReq};
use crate::stats::{Counter, StatGroup};

/// A cache array plus its replacement policy and hash family.
pub struct CacheArray {
    kind: ArrayKind,
    pub repl: ReplPolicy,
    hash: HashFamily,
}

enum ArrayKind {
    SetAssoc(SetAssocArray),
    Z(ZArray),
}

impl CacheArray {
    pub fn set_assoc(num_lines: u32, assoc: u32, repl: ReplPolicy, hash: HashFamily) -> Self {
        let num_sets = num_lines / assoc;
        assert_eq!(num_sets * assoc, num_lines);
        assert!(
            num_sets.is_power_of_two(),
            "must have a power-of-2 number of sets, got {num_sets}"
        );
        CacheArray {
            kind: ArrayKind::SetAssoc(SetAssocArray {
                tags: vec![0; num_lines as usize],
                assoc,
                set_mask: (num_sets - 1) as u64,
            }),
            repl,
            hash,
        }
    }

    pub fn zcache(num_lines: u32, ways: u32, cands: u32, repl: ReplPolicy, hash: HashFamily) -> Self {
        assert!(ways > 1, "zcaches need >= 2 ways to work");
        assert!(cands >= ways, "candidates < ways does not make sense in a zcache");
        assert_eq!(num_lines % ways, 0, "line count must be a multiple of ways");
        let num_sets = num_lines / ways;
        assert!(
            num_sets.is_power_of_two(),
            "must have a power-of-2 number of sets, got {num_sets}"
        );
        CacheArray {
            kind: ArrayKind::Z(ZArray {
                ways,
                cands,
                num_sets,
                set_mask: (num_sets - 1) as u64,
                // Linear mapping to start; swaps scramble it over time.
                lookup: (0..num_lines).collect(),
                tags: vec![0; num_lines as usize],
                swap_chain: Vec::new(),
                last_cand_idx: 0,
                stat_swaps: Counter::new(),
            }),
            repl,
            hash,
        }
    }

    pub fn init_stats(&self, parent: &mut StatGroup) {
        if let ArrayKind::Z(z) = &self.kind {
            let mut g = StatGroup::new("array", "ZArray stats");
            g.append_counter("swaps", "Block swaps in replacement process", z.stat_swaps.clone());
            parent.add_group(g);
        }
    }

    /// Find `line_addr`; on a hit, optionally update the replacement
    /// policy (GETs do, PUTs don't).
    pub fn lookup(&mut self, line_addr: Address, req: &MemReq, update_replacement: bool) -> Option<u32> {
        let hit = match &self.kind {
            ArrayKind::SetAssoc(a) => a.lookup(&self.hash, line_addr),
            ArrayKind::Z(z) => z.lookup(&self.hash, line_addr),
        };
        if let Some(id) = hit {
            if update_replacement {
                self.repl.update(id, req);
            }
        }
        hit
    }

    /// Pick the victim slot for `line_addr`. Returns the slot and the
    /// address it currently holds (0 if empty).
    pub fn preinsert(&mut self, line_addr: Address, req: &MemReq) -> (u32, Address) {
        match &mut self.kind {
            ArrayKind::SetAssoc(a) => a.preinsert(&self.hash, &mut self.repl, line_addr, req),
            ArrayKind::Z(z) => z.preinsert(&self.hash, &mut self.repl, line_addr, req),
        }
    }

    /// Commit `line_addr` into the slot chosen by `preinsert`.
    pub fn postinsert(&mut self, line_addr: Address, req: &MemReq, line_id: u32) {
        match &mut self.kind {
            ArrayKind::SetAssoc(a) => {
                self.repl.replaced(line_id);
                a.tags[line_id as usize] = line_addr;
                self.repl.update(line_id, req);
            }
            ArrayKind::Z(z) => z.postinsert(&mut self.repl, line_addr, req, line_id),
        }
    }

    /// Find `line_addr` without touching the replacement policy. Used by
    /// the invalidation path and debug probes.
    pub fn probe(&self, line_addr: Address) -> Option<u32> {
        match &self.kind {
            ArrayKind::SetAssoc(a) => a.lookup(&self.hash, line_addr),
            ArrayKind::Z(z) => z.lookup(&self.hash, line_addr),
        }
    }

    /// Address held by a slot (0 if empty). For tests and trace dumps.
    pub fn line_addr(&self, line_id: u32) -> Address {
        match &self.kind {
            ArrayKind::SetAssoc(a) => a.tags[line_id as usize],
            ArrayKind::Z(z) => z.tags[line_id as usize],
        }
    }

    #[cfg(test)]
    fn z(&self) -> &ZArray {
        match &self.kind {
            ArrayKind::Z(z) => z,
            _ => panic!("not a zcache"),
        }
    }
}

struct SetAssocArray {
    tags: Vec<Address>,
    assoc: u32,
    set_mask: u64,
}

impl SetAssocArray {
    fn lookup(&self, hash: &HashFamily, line_addr: Address) -> Option<u32> {
        let set = (hash.hash(0, line_addr) & self.set_mask) as u32;
        let first = set * self.assoc;
        (first..first + self.assoc).find(|&id| self.tags[id as usize] == line_addr)
    }

    fn preinsert(
        &mut self,
        hash: &HashFamily,
        repl: &mut ReplPolicy,
        line_addr: Address,
        req: &MemReq,
    ) -> (u32, Address) {
        let set = (hash.hash(0, line_addr) & self.set_mask) as u32;
        let first = set * self.assoc;
        let candidate = repl.rank_cands(req, Candidates::Range(first..first + self.assoc));
        (candidate, self.tags[candidate as usize])
    }
}

#[derive(Clone, Copy)]
struct ZWalkInfo {
    pos: u32,
    line_id: u32,
    parent: i32,
}

struct ZArray {
    ways: u32,
    cands: u32,
    num_sets: u32,
    set_mask: u64,
    /// Position (way * numSets + hash) -> line id. Always a permutation.
    lookup: Vec<u32>,
    tags: Vec<Address>,
    /// Positions along the relocation chain, victim first.
    swap_chain: Vec<u32>,
    /// Candidate index of the victim; timing models use it to schedule
    /// the walk's array accesses.
    last_cand_idx: u32,
    stat_swaps: Counter,
}

impl ZArray {
    fn pos_of(&self, hash: &HashFamily, way: u32, line_addr: Address) -> u32 {
        way * self.num_sets + (hash.hash(way, line_addr) & self.set_mask) as u32
    }

    fn lookup(&self, hash: &HashFamily, line_addr: Address) -> Option<u32> {
        // A zero line address here means the traced program dereferenced
        // page 0; catch it instead of corrupting the walk.
        assert!(line_addr != 0, "ZArray lookup with line address 0");
        for w in 0..self.ways {
            let line_id = self.lookup[self.pos_of(hash, w, line_addr) as usize];
            if self.tags[line_id as usize] == line_addr {
                return Some(line_id);
            }
        }
        None
    }

    fn preinsert(
        &mut self,
        hash: &HashFamily,
        repl: &mut ReplPolicy,
        line_addr: Address,
        req: &MemReq,
    ) -> (u32, Address) {
        let mut candidates: Vec<ZWalkInfo> = Vec::with_capacity((self.cands + self.ways) as usize);
        let mut all_valid = true;

        // Seeds: the line's own positions in each way.
        for w in 0..self.ways {
            let pos = self.pos_of(hash, w, line_addr);
            let line_id = self.lookup[pos as usize];
            candidates.push(ZWalkInfo {
                pos,
                line_id,
                parent: -1,
            });
            all_valid &= self.tags[line_id as usize] != 0;
        }

        // Expand the fringe BFS-style: each valid candidate's line could
        // move to its position in any other way, yielding new candidates.
        let mut fringe_start = 0usize;
        while candidates.len() < self.cands as usize && all_valid {
            let fringe_id = candidates[fringe_start].line_id;
            let fringe_addr = self.tags[fringe_id as usize];
            debug_assert!(fringe_addr != 0);
            for w in 0..self.ways {
                let pos = self.pos_of(hash, w, fringe_addr);
                let line_id = self.lookup[pos as usize];
                if line_id != fringe_id {
                    candidates.push(ZWalkInfo {
                        pos,
                        line_id,
                        parent: fringe_start as i32,
                    });
                    all_valid &= self.tags[line_id as usize] != 0;
                }
            }
            fringe_start += 1;
        }
        candidates.truncate(self.cands as usize);

        let ids: Vec<u32> = candidates.iter().map(|c| c.line_id).collect();
        let best = repl.rank_cands(req, Candidates::List(&ids));

        // Earliest candidate index for the winner; the minimum matters if
        // the walk looped back to the same line.
        let min_idx = candidates
            .iter()
            .position(|c| c.line_id == best)
            .expect("victim not among candidates");
        self.last_cand_idx = min_idx as u32;

        self.swap_chain.clear();
        let mut idx = min_idx as i32;
        while idx >= 0 {
            self.swap_chain.push(candidates[idx as usize].pos);
            idx = candidates[idx as usize].parent;
        }
        debug_assert!(self.swap_chain.len() as u32 <= self.cands / self.ways + 2);

        (best, self.tags[best as usize])
    }

    fn postinsert(&mut self, repl: &mut ReplPolicy, line_addr: Address, req: &MemReq, line_id: u32) {
        // Rotate the lookup array along the swap chain; the tag storage
        // positions of the relocated lines do not move.
        assert_eq!(self.lookup[self.swap_chain[0] as usize], line_id);
        for i in 0..self.swap_chain.len() - 1 {
            self.lookup[self.swap_chain[i] as usize] = self.lookup[self.swap_chain[i + 1] as usize];
        }
        // The chain was built victim-first, so the last slot is where the
        // incoming line lands.
        let last = *self.swap_chain.last().unwrap();
        self.lookup[last as usize] = line_id;

        repl.replaced(line_id);
        self.tags[line_id as usize] = line_addr;
        repl.update(line_id, req);

        self.stat_swaps.add(self.swap_chain.len() as u64 - 1);
    }
}
