//! Replacement policies.
//!
//! A policy is driven by the cache array through three hooks: `update` on
//! hits and fills, `rank_cands` to pick a victim among replacement
//! candidates, and `replaced` once the victim is gone. All known policies
//! live in one [`ReplPolicy`] enum so dispatch stays in one place and the
//! race assumptions of each hook are easy to audit.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cache::cc::CcView;
use crate::cache::part::{VantagePolicy, WayPartPolicy};
use crate::mem::{AccessType, MemReq};
use crate::stats::{Counter, StatGroup};

/// Replacement candidates handed to `rank_cands`.
///
/// Set-associative arrays pass a contiguous line-id range; skew-associative
/// arrays pass the line ids collected by the tag walk.
pub enum Candidates<'a> {
    Range(std::ops::Range<u32>),
    List(&'a [u32]),
}

impl Candidates<'_> {
    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Candidates::Range(r) => Box::new(r.clone()),
            Candidates::List(l) => Box::new(l.iter().copied()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Candidates::Range(r) => r.len(),
            Candidates::List(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All replacement policies, selected by name at configuration time.
pub enum ReplPolicy {
    Lru(LruPolicy),
    TreeLru(TreeLruPolicy),
    Nru(NruPolicy),
    Rand(RandPolicy),
    Lfu(LfuPolicy),
    WayPart(WayPartPolicy),
    Vantage(VantagePolicy),
    /// Wraps another policy and profiles simulation-order violations.
    ProfViol(Box<ProfViolPolicy>),
}

impl ReplPolicy {
    pub fn set_cc_view(&mut self, view: CcView) {
        match self {
            ReplPolicy::Lru(p) => p.view = Some(view),
            ReplPolicy::Lfu(p) => p.view = Some(view),
            ReplPolicy::TreeLru(p) => p.inner.view = Some(view),
            ReplPolicy::ProfViol(p) => p.inner.set_cc_view(view),
            // NRU, random, and the partitioned policies track their own
            // validity and ignore sharers.
            _ => {}
        }
    }

    pub fn update(&mut self, id: u32, req: &MemReq) {
        match self {
            ReplPolicy::Lru(p) => p.update(id),
            ReplPolicy::TreeLru(p) => p.inner.update(id),
            ReplPolicy::Nru(p) => p.update(id),
            ReplPolicy::Rand(_) => {}
            ReplPolicy::Lfu(p) => p.update(id),
            ReplPolicy::WayPart(p) => p.update(id, req),
            ReplPolicy::Vantage(p) => p.update(id, req),
            ReplPolicy::ProfViol(p) => p.update(id, req),
        }
    }

    pub fn replaced(&mut self, id: u32) {
        match self {
            ReplPolicy::Lru(p) => p.replaced(id),
            ReplPolicy::TreeLru(p) => p.inner.replaced(id),
            ReplPolicy::Nru(p) => p.replaced(id),
            ReplPolicy::Rand(_) => {}
            ReplPolicy::Lfu(p) => p.replaced(id),
            ReplPolicy::WayPart(p) => p.replaced(id),
            ReplPolicy::Vantage(p) => p.replaced(id),
            ReplPolicy::ProfViol(p) => p.replaced(id),
        }
    }

    pub fn rank_cands(&mut self, req: &MemReq, cands: Candidates) -> u32 {
        assert!(!cands.is_empty(), "ranking an empty candidate list");
        match self {
            ReplPolicy::Lru(p) => p.rank(&cands),
            ReplPolicy::TreeLru(p) => p.rank(&cands),
            ReplPolicy::Nru(p) => p.rank(&cands),
            ReplPolicy::Rand(p) => p.rank(&cands),
            ReplPolicy::Lfu(p) => p.rank(&cands),
            ReplPolicy::WayPart(p) => p.rank(req, &cands),
            ReplPolicy::Vantage(p) => p.rank(req, &cands),
            ReplPolicy::ProfViol(p) => p.rank(req, &cands),
        }
    }

    /// Partitioned policies expose their target-size knob; `None` for the
    /// rest.
    pub fn as_partitioned(&mut self) -> Option<PartitionedPolicy<'_>> {
        match self {
            ReplPolicy::WayPart(p) => Some(PartitionedPolicy::Way(p)),
            ReplPolicy::Vantage(p) => Some(PartitionedPolicy::Vantage(p)),
            ReplPolicy::ProfViol(p) => p.inner.as_partitioned(),
            _ => None,
        }
    }

    pub fn init_stats(&mut self, parent: &mut StatGroup) {
        match self {
            ReplPolicy::WayPart(p) => p.init_stats(parent),
            ReplPolicy::Vantage(p) => p.init_stats(parent),
            ReplPolicy::ProfViol(p) => {
                p.init_stats(parent);
                p.inner.init_stats(parent);
            }
            _ => {}
        }
    }
}

/// Mutable view over a partitioned policy, for the partitioner.
pub enum PartitionedPolicy<'a> {
    Way(&'a mut WayPartPolicy),
    Vantage(&'a mut VantagePolicy),
}

/// Plain LRU, sharers-aware: lines with sharers down the hierarchy are
/// kept over lines nobody shares.
pub struct LruPolicy {
    timestamp: u64,
    array: Vec<u64>,
    sharers_aware: bool,
    pub(crate) view: Option<CcView>,
}

impl LruPolicy {
    pub fn new(num_lines: u32, sharers_aware: bool) -> Self {
        LruPolicy {
            timestamp: 1,
            array: vec![0; num_lines as usize],
            sharers_aware,
            view: None,
        }
    }

    fn update(&mut self, id: u32) {
        self.array[id as usize] = self.timestamp;
        self.timestamp += 1;
    }

    fn replaced(&mut self, id: u32) {
        self.array[id as usize] = 0;
    }

    /// Higher score = least evictable: validity first, then sharers, then
    /// recency.
    fn score(&self, id: u32) -> u64 {
        let sharers = match (&self.view, self.sharers_aware) {
            (Some(v), true) => v.num_sharers(id) as u64,
            _ => 0,
        };
        let valid = self.view.as_ref().map_or(true, |v| v.is_valid(id));
        sharers * self.timestamp + self.array[id as usize] * valid as u64
    }

    fn rank(&self, cands: &Candidates) -> u32 {
        let mut best = u32::MAX;
        let mut best_score = u64::MAX;
        for id in cands.iter() {
            let s = self.score(id);
            if s < best_score {
                best = id;
                best_score = s;
            }
        }
        best
    }
}

/// Tree pseudo-LRU over the candidate list. Inefficient (it reuses full
/// LRU timestamps for what needs a few bits) but simple.
pub struct TreeLruPolicy {
    inner: LruPolicy,
}

impl TreeLruPolicy {
    pub fn new(num_lines: u32, num_cands: u32) -> Self {
        assert!(
            num_cands.is_power_of_two(),
            "tree LRU needs a power-of-2 candidate count, got {num_cands}"
        );
        TreeLruPolicy {
            inner: LruPolicy::new(num_lines, true),
        }
    }

    fn rank(&self, cands: &Candidates) -> u32 {
        let list: Vec<u32> = cands.iter().collect();
        let mut start = 0usize;
        let mut end = list.len();
        while end - start > 1 {
            let pivot = start + (end - start) / 2;
            let t1 = list[start..pivot]
                .iter()
                .map(|&id| self.inner.array[id as usize])
                .max()
                .unwrap_or(0);
            let t2 = list[pivot..end]
                .iter()
                .map(|&id| self.inner.array[id as usize])
                .max()
                .unwrap_or(0);
            if t1 > t2 {
                start = pivot;
            } else {
                end = pivot;
            }
        }
        list[start]
    }
}

/// 2-bit not-recently-used (Seznec, "A new Case for Skew-Associativity").
pub struct NruPolicy {
    array: Vec<u32>,
    num_lines: u32,
    young_lines: u32,
}

impl NruPolicy {
    pub fn new(num_lines: u32) -> Self {
        NruPolicy {
            array: vec![0; num_lines as usize],
            num_lines,
            young_lines: 0,
        }
    }

    fn update(&mut self, id: u32) {
        self.young_lines += 1 - (self.array[id as usize] >> 1);
        self.array[id as usize] |= 0x2;
        if self.young_lines >= self.num_lines / 2 {
            for v in &mut self.array {
                *v >>= 1;
            }
            self.young_lines = 0;
        }
    }

    fn replaced(&mut self, id: u32) {
        self.array[id as usize] = 0;
    }

    fn rank(&self, cands: &Candidates) -> u32 {
        let mut best_val = u32::MAX;
        let mut ties: Vec<u32> = Vec::new();
        for id in cands.iter() {
            let v = self.array[id as usize];
            if v < best_val {
                best_val = v;
                ties.clear();
                ties.push(id);
            } else if v == best_val {
                ties.push(id);
            }
        }
        // young_lines sort-of-randomizes among ties.
        ties[self.young_lines as usize % ties.len()]
    }
}

/// Uniform random victim selection.
pub struct RandPolicy {
    rng: SmallRng,
}

impl RandPolicy {
    pub fn new(seed: u64) -> Self {
        RandPolicy {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn rank(&mut self, cands: &Candidates) -> u32 {
        let list: Vec<u32> = cands.iter().collect();
        list[self.rng.random_range(0..list.len())]
    }
}

/// LFU with a center-of-mass timestamp, so old heavy hitters eventually
/// age out.
pub struct LfuPolicy {
    timestamp: u64,
    array: Vec<LfuInfo>,
    pub(crate) view: Option<CcView>,
}

#[derive(Clone, Copy, Default)]
struct LfuInfo {
    ts: u64,
    acc: u64,
}

impl LfuPolicy {
    pub fn new(num_lines: u32) -> Self {
        LfuPolicy {
            timestamp: 1,
            array: vec![LfuInfo::default(); num_lines as usize],
            view: None,
        }
    }

    fn update(&mut self, id: u32) {
        let e = &mut self.array[id as usize];
        e.ts = (e.acc * e.ts + self.timestamp) / (e.acc + 1);
        e.acc += 1;
        // Larger steps keep resolution through the successive divisions.
        self.timestamp += 1000;
    }

    fn replaced(&mut self, id: u32) {
        self.array[id as usize].acc = 0;
    }

    /// Returns true when `a` is more evictable than `b`.
    fn more_evictable(&self, a: u32, b: u32) -> bool {
        let (va, vb) = match &self.view {
            Some(v) => (v.is_valid(a), v.is_valid(b)),
            None => (true, true),
        };
        if va != vb {
            return !va;
        }
        let (sa, sb) = match &self.view {
            Some(v) => (v.num_sharers(a), v.num_sharers(b)),
            None => (0, 0),
        };
        if (sa == 0) != (sb == 0) {
            return sa == 0;
        }
        let ia = self.array[a as usize];
        let ib = self.array[b as usize];
        if ia.acc == 0 {
            return true;
        }
        if ib.acc == 0 {
            return false;
        }
        // Inverse frequency, higher is better to evict.
        let inv_a = (self.timestamp - ia.ts) / ia.acc;
        let inv_b = (self.timestamp - ib.ts) / ib.acc;
        inv_a > inv_b
    }

    fn rank(&self, cands: &Candidates) -> u32 {
        let mut best: Option<u32> = None;
        for id in cands.iter() {
            best = match best {
                None => Some(id),
                Some(b) if self.more_evictable(id, b) => Some(id),
                Some(b) => Some(b),
            };
        }
        best.unwrap()
    }
}

/// Profiles read/write simulation-order violations on top of another
/// policy: RAW means a read was simulated before the write that precedes
/// it in real time, and so on.
pub struct ProfViolPolicy {
    pub(crate) inner: ReplPolicy,
    acc_times: Vec<AccTimes>,
    repl_cycle: u64,
    prof_raw: Counter,
    prof_war: Counter,
    prof_rar: Counter,
    prof_waw: Counter,
    prof_aae: Counter,
    prof_no_viol_acc: Counter,
    prof_no_viol_ev: Counter,
}

#[derive(Clone, Copy, Default)]
struct AccTimes {
    read: u64,
    write: u64,
}

impl ProfViolPolicy {
    pub fn new(num_lines: u32, inner: ReplPolicy) -> Self {
        ProfViolPolicy {
            inner,
            acc_times: vec![AccTimes::default(); num_lines as usize],
            repl_cycle: 0,
            prof_raw: Counter::new(),
            prof_war: Counter::new(),
            prof_rar: Counter::new(),
            prof_waw: Counter::new(),
            prof_aae: Counter::new(),
            prof_no_viol_acc: Counter::new(),
            prof_no_viol_ev: Counter::new(),
        }
    }

    fn init_stats(&self, parent: &mut StatGroup) {
        parent.append_counter("vRAW", "RAW violations (R simulated before preceding W)", self.prof_raw.clone());
        parent.append_counter("vWAR", "WAR violations (W simulated before preceding R)", self.prof_war.clone());
        parent.append_counter("vRAR", "RAR violations (R simulated before preceding R)", self.prof_rar.clone());
        parent.append_counter("vWAW", "WAW violations (W simulated before preceding W)", self.prof_waw.clone());
        parent.append_counter("vAAE", "Access simulated before preceding eviction", self.prof_aae.clone());
        parent.append_counter("noViolAcc", "Accesses without order violations", self.prof_no_viol_acc.clone());
        parent.append_counter("noViolEv", "Evictions without AAE violations", self.prof_no_viol_ev.clone());
    }

    fn update(&mut self, id: u32, req: &MemReq) {
        self.inner.update(id, req);

        let read = req.acc_type == AccessType::Gets;
        let cycle = req.cycle;
        let t = self.acc_times[id as usize];
        if cycle < t.read.max(t.write) {
            let read_viol = if cycle < t.read.min(t.write) {
                t.read < t.write // the closer access determines the kind
            } else {
                cycle < t.read
            };
            match (read, read_viol) {
                (true, true) => self.prof_rar.inc(),
                (true, false) => self.prof_raw.inc(),
                (false, true) => self.prof_war.inc(),
                (false, false) => self.prof_waw.inc(),
            }
        } else {
            self.prof_no_viol_acc.inc();
        }

        let t = &mut self.acc_times[id as usize];
        if read {
            t.read = t.read.max(cycle);
        } else {
            t.write = t.write.max(cycle);
        }
    }

    fn replaced(&mut self, id: u32) {
        self.inner.replaced(id);
        let t = self.acc_times[id as usize];
        if self.repl_cycle < t.read.max(t.write) {
            self.prof_aae.inc();
        } else {
            self.prof_no_viol_ev.inc();
        }
        self.acc_times[id as usize] = AccTimes::default();
    }

    fn rank(&mut self, req: &MemReq, cands: &Candidates) -> u32 {
        self.repl_cycle = req.cycle;
        let list: Vec<u32> = cands.iter().collect();
        self.inner.rank_cands(req, Candidates::List(&list))
    }
}
