//! Partitioned replacement policies: strict way partitioning and Vantage
//! (managed/unmanaged regions with aperture-controlled demotions).

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cache::repl::Candidates;
use crate::cache::umon::{MissCurveSource, UMonMonitor};
use crate::mem::{Address, MemReq};
use crate::stats::{Counter, StatGroup};

/// Maps a request to its partition. Partitions follow the requesting
/// core, folded into the configured partition count.
pub struct CorePartMapper {
    num_partitions: u32,
}

impl CorePartMapper {
    pub fn new(num_partitions: u32) -> Self {
        assert!(num_partitions > 0);
        CorePartMapper { num_partitions }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn get_partition(&self, req: &MemReq) -> u32 {
        req.src_id % self.num_partitions
    }
}

#[derive(Default)]
struct PartProf {
    hits: Counter,
    misses: Counter,
    self_evictions: Counter,
    ext_evictions: Counter,
}

#[derive(Clone, Copy)]
struct WayLine {
    addr: Address,
    /// Timestamp, > 0 while the line is in the cache.
    ts: u64,
    p: u32,
}

/// Assigns cache ways to partitions; replacements only consider ways the
/// requester's partition owns.
pub struct WayPartPolicy {
    mapper: CorePartMapper,
    monitor: UMonMonitor,
    partitions: u32,
    total_size: u32,
    ways: u32,
    part_sizes: Vec<u64>,
    part_targets: Vec<u64>,
    prof: Vec<PartProf>,
    lines: Vec<WayLine>,
    /// Owning partition of each way.
    way_part_index: Vec<u32>,
    /// In test mode the policy degrades to plain LRU.
    test_mode: bool,
    timestamp: u64,
    incoming_part: u32,
    incoming_addr: Address,
}

impl WayPartPolicy {
    pub fn new(
        mapper: CorePartMapper,
        monitor: UMonMonitor,
        num_lines: u32,
        ways: u32,
        test_mode: bool,
    ) -> Self {
        let partitions = mapper.num_partitions();
        let way_size = num_lines / ways;
        assert_eq!(way_size * ways, num_lines, "no partial ways");
        let mut part_targets = vec![0u64; partitions as usize];
        let mut way_part_index = vec![0u32; ways as usize];
        for w in 0..ways {
            // Initial round-robin assignment; the partitioner has no
            // profiling information yet.
            let p = w * partitions / ways;
            way_part_index[w as usize] = p;
            part_targets[p as usize] += way_size as u64;
        }
        let mut part_sizes = vec![0u64; partitions as usize];
        part_sizes[0] = num_lines as u64; // empty lines all count as partition 0
        WayPartPolicy {
            mapper,
            monitor,
            partitions,
            total_size: num_lines,
            ways,
            part_sizes,
            part_targets,
            prof: (0..partitions).map(|_| PartProf::default()).collect(),
            lines: vec![
                WayLine {
                    addr: 0,
                    ts: 0,
                    p: 0,
                };
                num_lines as usize
            ],
            way_part_index,
            test_mode,
            timestamp: 1,
            incoming_part: 0,
            incoming_addr: 0,
        }
    }

    pub fn monitor(&self) -> &UMonMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut UMonMonitor {
        &mut self.monitor
    }

    pub fn partition_size(&self, p: u32) -> u64 {
        self.part_sizes[p as usize]
    }

    pub fn target_size(&self, p: u32) -> u64 {
        self.part_targets[p as usize]
    }

    pub fn init_stats(&mut self, parent: &mut StatGroup) {
        let mut parts = StatGroup::new("part", "Partition stats").irregular();
        for p in 0..self.partitions as usize {
            let mut g = StatGroup::new(format!("part-{p}"), "Partition stats");
            g.append_counter("hits", "Hits", self.prof[p].hits.clone());
            g.append_counter("misses", "Misses", self.prof[p].misses.clone());
            g.append_counter("selfEvs", "Evictions caused by us", self.prof[p].self_evictions.clone());
            g.append_counter("extEvs", "Evictions caused by others", self.prof[p].ext_evictions.clone());
            parts.add_group(g);
        }
        parent.add_group(parts);
    }

    pub fn update(&mut self, id: u32, _req: &MemReq) {
        let e = self.lines[id as usize];
        if e.ts > 0 {
            // Hit.
            self.prof[e.p as usize].hits.inc();
        } else {
            // Post-miss fill: the old line is gone, this slot is empty.
            let old = e.p;
            let new = self.incoming_part;
            if old != new {
                self.part_sizes[old as usize] -= 1;
                self.prof[old as usize].ext_evictions.inc();
                self.part_sizes[new as usize] += 1;
            } else {
                self.prof[old as usize].self_evictions.inc();
            }
            self.prof[new as usize].misses.inc();
            self.lines[id as usize].p = new;
        }
        self.lines[id as usize].ts = self.timestamp;
        self.timestamp += 1;

        let e = self.lines[id as usize];
        self.monitor.access(e.p, e.addr);
    }

    pub fn rank(&mut self, req: &MemReq, cands: &Candidates) -> u32 {
        self.incoming_part = self.mapper.get_partition(req);
        self.incoming_addr = req.line_addr;
        let inc = self.incoming_part;
        let mut best: Option<u32> = None;
        for (way, id) in cands.iter().enumerate() {
            let way = way as u32 % self.ways;
            if !(self.test_mode || self.way_part_index[way as usize] == inc) {
                continue; // not a way we may fill
            }
            best = match best {
                None => Some(id),
                Some(b) => {
                    let c = self.lines[id as usize];
                    let cur = self.lines[b as usize];
                    let c_in = c.p == inc;
                    let cur_in = cur.p == inc;
                    let c_wins = if self.test_mode || (c_in && cur_in) || (!c_in && !cur_in) {
                        c.ts < cur.ts
                    } else {
                        // Prefer evicting our own partition's lines.
                        c_in
                    };
                    Some(if c_wins { id } else { b })
                }
            };
        }
        best.unwrap_or_else(|| {
            panic!(
                "partition {inc} owns no candidate way (ways {:?})",
                self.way_part_index
            )
        })
    }

    pub fn replaced(&mut self, id: u32) {
        self.lines[id as usize].ts = 0;
        self.lines[id as usize].addr = self.incoming_addr;
    }

    /// Apply a bucket allocation. Way partitioning uses way-granular
    /// buckets, so `granularity` must equal the way count.
    pub fn set_partition_sizes(&mut self, allocs: &[u32], granularity: u32) {
        assert_eq!(granularity, self.ways, "way partitioning needs way-granular buckets");
        assert_eq!(allocs.iter().sum::<u32>(), self.ways);
        let mut cur_way = 0usize;
        for (p, &ways_p) in allocs.iter().enumerate() {
            self.part_targets[p] = self.total_size as u64 * ways_p as u64 / self.ways as u64;
            for _ in 0..ways_p {
                self.way_part_index[cur_way] = p as u32;
                cur_way += 1;
            }
        }
        assert_eq!(cur_way, self.ways as usize);
    }
}

struct VantagePart {
    size: u64,
    target_size: u64,
    long_term_target: u64,
    extended_size: u64,
    /// Per-partition coarse-grain timestamp (CurrentTS).
    cur_bts: u64,
    /// Hits on the current timestamp (AccessCounter).
    cur_bts_hits: u64,
    /// Setpoint coarse-grain timestamp (SetpointTS).
    setpoint_bts: u64,
    cur_interval_ins: u32,
    cur_interval_dems: u32,
    cur_interval_cands: u32,
    hits: Counter,
    misses: Counter,
    demotions: Counter,
    evictions: Counter,
}

impl VantagePart {
    fn new() -> Self {
        VantagePart {
            size: 0,
            target_size: 0,
            long_term_target: 0,
            extended_size: 0,
            cur_bts: 0,
            cur_bts_hits: 0,
            setpoint_bts: 0,
            cur_interval_ins: 0,
            cur_interval_dems: 0,
            cur_interval_cands: 0,
            hits: Counter::new(),
            misses: Counter::new(),
            demotions: Counter::new(),
            evictions: Counter::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct VantageLine {
    addr: Address,
    ts: u64,
    /// Coarse-grain per-partition timestamp at last touch.
    bts: u64,
    /// Current partition; `partitions` means the unmanaged region.
    p: u32,
    /// Original partition: unchanged when the line is demoted.
    op: u32,
}

/// Vantage replacement (Sanchez and Kozyrakis, ISCA 2011): partitions get
/// setpoint timestamps; candidate sweeps demote over-quota lines to an
/// unmanaged region instead of evicting, and feedback keeps the demotion
/// rate at aperture * candidate-rate.
pub struct VantagePolicy {
    mapper: CorePartMapper,
    monitor: UMonMonitor,
    /// Managed partitions; index `partitions` is the unmanaged region.
    partitions: u32,
    total_size: u32,
    parts: Vec<VantagePart>,
    lines: Vec<VantageLine>,
    timestamp: u64,
    part_slack: f64,
    max_aperture: f64,
    smooth_transients: bool,
    rng: SmallRng,
    incoming_addr: Address,
    prof_promotions: Counter,
}

impl VantagePolicy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mapper: CorePartMapper,
        monitor: UMonMonitor,
        num_lines: u32,
        part_portion_pct: u32,
        part_slack_pct: u32,
        max_aperture_pct: u32,
        smooth_transients: bool,
    ) -> Self {
        assert!(part_portion_pct <= 100 && part_slack_pct <= 100 && max_aperture_pct <= 100);
        let partitions = mapper.num_partitions();
        let part_portion = part_portion_pct as f64 / 100.0;
        let target_managed = (num_lines as f64 * part_portion) as u64;

        let mut parts: Vec<VantagePart> = (0..=partitions).map(|_| VantagePart::new()).collect();
        for p in parts.iter_mut().take(partitions as usize) {
            p.target_size = target_managed / partitions as u64;
            p.long_term_target = p.target_size;
        }
        // The unmanaged region starts with everything.
        parts[partitions as usize].size = num_lines as u64;
        parts[partitions as usize].extended_size = num_lines as u64;

        VantagePolicy {
            mapper,
            monitor,
            partitions,
            total_size: num_lines,
            parts,
            lines: vec![
                VantageLine {
                    addr: 0,
                    ts: 0,
                    bts: 0,
                    p: partitions,
                    op: partitions,
                };
                num_lines as usize
            ],
            timestamp: 1,
            part_slack: part_slack_pct as f64 / 100.0,
            max_aperture: max_aperture_pct as f64 / 100.0,
            smooth_transients,
            rng: SmallRng::seed_from_u64(0xABCDE563F),
            incoming_addr: 0,
            prof_promotions: Counter::new(),
        }
    }

    pub fn monitor(&self) -> &UMonMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut UMonMonitor {
        &mut self.monitor
    }

    pub fn partition_size(&self, p: u32) -> u64 {
        self.parts[p as usize].size
    }

    pub fn target_size(&self, p: u32) -> u64 {
        self.parts[p as usize].target_size
    }

    pub fn demotions(&self, p: u32) -> u64 {
        self.parts[p as usize].demotions.get()
    }

    pub fn promotions(&self) -> u64 {
        self.prof_promotions.get()
    }

    pub fn init_stats(&mut self, parent: &mut StatGroup) {
        let mut rp = StatGroup::new("part", "Vantage replacement policy stats").irregular();
        rp.append_counter("ffaProms", "Promotions from unmanaged region", self.prof_promotions.clone());
        for p in 0..=self.partitions as usize {
            let mut g = StatGroup::new(format!("part-{p}"), "Partition stats");
            g.append_counter("hits", "Hits", self.parts[p].hits.clone());
            g.append_counter("misses", "Misses", self.parts[p].misses.clone());
            g.append_counter("dems", "Demotions", self.parts[p].demotions.clone());
            g.append_counter("evs", "Evictions", self.parts[p].evictions.clone());
            rp.add_group(g);
        }
        parent.add_group(rp);
    }

    pub fn update(&mut self, id: u32, req: &MemReq) {
        let unmanaged = self.partitions;
        let e = self.lines[id as usize];
        if e.ts > 0 {
            if e.p == unmanaged {
                // Unmanaged-region hit: promote to the requester's
                // partition right away.
                let p = self.mapper.get_partition(req);
                self.lines[id as usize].p = p;
                self.prof_promotions.inc();
                self.parts[p as usize].cur_interval_ins += 1;
                self.parts[p as usize].size += 1;
                self.parts[unmanaged as usize].size -= 1;
            }
            self.lines[id as usize].ts = self.timestamp;
            self.timestamp += 1;
            let p = self.lines[id as usize].p;
            self.parts[p as usize].hits.inc();
        } else {
            // Post-miss fill; the previous line has been replaced.
            self.lines[id as usize].ts = self.timestamp;
            self.timestamp += 1;
            let old_p = e.p as usize;
            let old_op = e.op as usize;
            self.parts[old_p].size -= 1;
            self.parts[old_p].evictions.inc();
            self.parts[old_op].extended_size -= 1;

            let p = self.mapper.get_partition(req);
            self.lines[id as usize].p = p;
            self.lines[id as usize].op = p;
            self.parts[p as usize].cur_interval_ins += 1;
            self.parts[p as usize].size += 1;
            self.parts[p as usize].extended_size += 1;
            self.parts[p as usize].misses.inc();

            if self.parts[p as usize].target_size < self.parts[p as usize].long_term_target {
                assert!(self.smooth_transients);
                // Growing partitions earn their quota one line per
                // insertion, funded by somebody over their long-term
                // target.
                self.parts[p as usize].target_size += 1;
                self.take_one_line();
            }
        }

        let e = self.lines[id as usize];
        self.monitor.access(e.p, e.addr);

        // Advance the coarse-grain timestamp every size/16 hits.
        let part = &mut self.parts[e.p as usize];
        self.lines[id as usize].bts = part.cur_bts;
        part.cur_bts_hits += 1;
        if part.cur_bts_hits >= part.size / 16 {
            part.cur_bts += 1;
            part.setpoint_bts += 1;
            part.cur_bts_hits = 0;
        }
    }

    pub fn rank(&mut self, req: &MemReq, cands: &Candidates) -> u32 {
        self.incoming_addr = req.line_addr;
        let unmanaged = self.partitions;
        let list: Vec<u32> = cands.iter().collect();

        // Demotion sweep: push over-quota lines older than their
        // partition's setpoint into the unmanaged region.
        for &id in &list {
            let e = self.lines[id as usize];
            if e.ts == 0 || e.p == unmanaged {
                continue;
            }
            let p = e.p as usize;
            if self.parts[p].size <= self.parts[p].target_size {
                continue; // below target, nothing to demote
            }

            if e.bts <= self.parts[p].setpoint_bts {
                self.parts[p].demotions.inc();
                self.parts[p].size -= 1;
                self.lines[id as usize].p = unmanaged;
                self.parts[unmanaged as usize].size += 1;
                self.parts[p].cur_interval_dems += 1;
                // Extended size and op are untouched by demotion.
            }

            self.parts[p].cur_interval_cands += 1;
            if self.parts[p].cur_interval_cands >= 256 {
                self.adjust_setpoint(p);
            }
        }

        // Eviction: empty slots first, then strictly prefer unmanaged
        // lines, LRU within each class.
        let mut best = list[0];
        for &id in &list {
            let e = self.lines[id as usize];
            if e.ts == 0 {
                best = id;
                break;
            }
            let b = self.lines[best as usize];
            let e_unm = e.p == unmanaged;
            let b_unm = b.p == unmanaged;
            if e_unm && !b_unm {
                best = id;
            } else if e_unm == b_unm && e.ts < b.ts {
                best = id;
            }
        }
        best
    }

    /// Proportional feedback: drive the demotion rate toward
    /// aperture * candidate-rate by nudging the setpoint timestamp.
    fn adjust_setpoint(&mut self, p: usize) {
        let part = &mut self.parts[p];
        let max_sz = part.target_size as f64 * (1.0 + self.part_slack);
        let cur_sz = part.size as f64;
        let aperture = if cur_sz >= max_sz {
            self.max_aperture
        } else {
            let slope = self.max_aperture / (max_sz - part.target_size as f64);
            slope * (cur_sz - part.target_size as f64)
        };

        if aperture > 0.0 {
            let shrink = part.cur_interval_dems as f64;
            let wanted = aperture * part.cur_interval_cands as f64;
            if shrink < wanted {
                if part.setpoint_bts < part.cur_bts {
                    part.setpoint_bts += 1;
                }
            } else if shrink > wanted && part.setpoint_bts > 0 {
                part.setpoint_bts -= 1;
            }
        }

        part.cur_interval_cands = 0;
        part.cur_interval_ins = 0;
        part.cur_interval_dems = 0;
    }

    pub fn replaced(&mut self, id: u32) {
        let e = &mut self.lines[id as usize];
        e.ts = 0;
        e.bts = 0;
        e.addr = self.incoming_addr;
    }

    /// Apply a bucket allocation scaled by `granularity`.
    pub fn set_partition_sizes(&mut self, allocs: &[u32], granularity: u32) {
        let mut lines_to_take = 0u64;
        for (p, &alloc) in allocs.iter().enumerate() {
            let s = self.total_size as u64 * alloc as u64 / granularity as u64;
            if self.smooth_transients {
                self.parts[p].long_term_target = s;
                if s > self.parts[p].target_size {
                    // Growing: move the short-term target only as far as
                    // current occupancy + 1.
                    let new_target = self.parts[p]
                        .target_size
                        .max(self.parts[p].long_term_target.min(self.parts[p].size + 1));
                    lines_to_take += new_target - self.parts[p].target_size;
                    self.parts[p].target_size = new_target;
                }
            } else {
                self.parts[p].target_size = s;
                self.parts[p].long_term_target = s;
            }
        }
        for _ in 0..lines_to_take {
            self.take_one_line();
        }
    }

    /// Shave one line of short-term target from a random partition that
    /// sits above its long-term target, weighted by the overshoot.
    fn take_one_line(&mut self) {
        assert!(self.smooth_transients);
        let mut lines_left = 0u64;
        for p in 0..self.partitions as usize {
            lines_left += self.parts[p]
                .target_size
                .saturating_sub(self.parts[p].long_term_target);
        }
        assert!(lines_left > 0, "no partition has spare target to take from");
        let pick = self.rng.random_range(0..lines_left);
        let mut cur = 0u64;
        for p in 0..self.partitions as usize {
            let over = self.parts[p]
                .target_size
                .saturating_sub(self.parts[p].long_term_target);
            cur += over;
            if over > 0 && pick < cur {
                self.parts[p].target_size -= 1;
                return;
            }
        }
        unreachable!("weighted pick fell through");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{AccessFlags, AccessType, MesiEntry, MesiState};

    fn req_for<'a>(entry: &'a MesiEntry, addr: Address, src: u32) -> MemReq<'a> {
        MemReq {
            line_addr: addr,
            acc_type: AccessType::Gets,
            child_id: 0,
            state: entry,
            cycle: 0,
            child_lock: None,
            initial_state: MesiState::I,
            src_id: src,
            flags: AccessFlags::empty(),
        }
    }

    fn way_policy(partitions: u32, lines: u32, ways: u32) -> WayPartPolicy {
        WayPartPolicy::new(
            CorePartMapper::new(partitions),
            UMonMonitor::new(lines, lines.min(64), 4, partitions, ways),
            lines,
            ways,
            false,
        )
    }

    #[test]
    fn waypart_only_fills_owned_ways() {
        let entry = MesiEntry::default();
        let mut p = way_policy(2, 8, 4);
        // Default round-robin: ways 0-1 -> partition 0, ways 2-3 -> 1.
        let req0 = req_for(&entry, 0x10, 0);
        let v = p.rank(&req0, &Candidates::Range(0..4));
        assert!(v < 2, "partition 0 must fill ways 0/1, got way {v}");
        let req1 = req_for(&entry, 0x20, 1);
        let v = p.rank(&req1, &Candidates::Range(0..4));
        assert!((2..4).contains(&v));
    }

    #[test]
    fn waypart_tracks_partition_sizes() {
        let entry = MesiEntry::default();
        let mut p = way_policy(2, 8, 4);
        let req = req_for(&entry, 0x40, 1);
        let v = p.rank(&req, &Candidates::Range(0..4));
        p.replaced(v);
        p.update(v, &req); // fill
        assert_eq!(p.partition_size(1), 1);
        assert_eq!(p.partition_size(0), 7);
    }

    #[test]
    fn waypart_reassignment_moves_ways() {
        let entry = MesiEntry::default();
        let mut p = way_policy(2, 8, 4);
        p.set_partition_sizes(&[3, 1], 4);
        assert_eq!(p.target_size(0), 6);
        assert_eq!(p.target_size(1), 2);
        let req1 = req_for(&entry, 0x20, 1);
        let v = p.rank(&req1, &Candidates::Range(0..4));
        assert_eq!(v, 3, "partition 1 now owns only way 3");
    }

    fn fill_vantage(p: &mut VantagePolicy, entry: &MesiEntry, n: u32, src: u32) -> Vec<u32> {
        let mut filled = Vec::new();
        for i in 0..n {
            let req = req_for(entry, 0x1000 + i as u64, src);
            let v = p.rank(&req, &Candidates::Range(0..8));
            p.replaced(v);
            p.update(v, &req);
            filled.push(v);
        }
        filled
    }

    fn vantage_policy() -> VantagePolicy {
        VantagePolicy::new(
            CorePartMapper::new(1),
            UMonMonitor::new(64, 64, 4, 1, 8),
            8,
            90,
            10,
            40,
            false,
        )
    }

    #[test]
    fn below_target_partition_never_demotes() {
        let entry = MesiEntry::default();
        let mut p = vantage_policy();
        // Target is 90% of 8 lines = 7; fill only 4.
        fill_vantage(&mut p, &entry, 4, 0);
        let req = req_for(&entry, 0x9000, 0);
        p.rank(&req, &Candidates::Range(0..8));
        assert_eq!(p.demotions(0), 0);
    }

    #[test]
    fn over_quota_lines_demote_and_promote_on_hit() {
        let entry = MesiEntry::default();
        let mut p = vantage_policy();
        let filled = fill_vantage(&mut p, &entry, 8, 0);
        // Shrink the partition to nothing; every line is now over quota.
        p.set_partition_sizes(&[0], 8);
        let req = req_for(&entry, 0x9000, 0);
        p.rank(&req, &Candidates::Range(0..8));
        assert!(p.demotions(0) > 0, "sweep must demote over-quota lines");
        assert!(p.partition_size(0) < 8);

        // A hit on a demoted line promotes it back immediately.
        let before = p.partition_size(0);
        let hit_req = req_for(&entry, 0x1000, 0);
        p.update(filled[0], &hit_req);
        assert_eq!(p.promotions(), 1);
        assert_eq!(p.partition_size(0), before + 1);
    }

    #[test]
    fn eviction_prefers_unmanaged_lines() {
        let entry = MesiEntry::default();
        let mut p = vantage_policy();
        fill_vantage(&mut p, &entry, 8, 0);
        p.set_partition_sizes(&[0], 8);
        let req = req_for(&entry, 0x9000, 0);
        // First sweep demotes; second sweep must evict from the
        // unmanaged region.
        p.rank(&req, &Candidates::Range(0..8));
        let victim = p.rank(&req, &Candidates::Range(0..8));
        assert_eq!(p.lines[victim as usize].p, p.partitions);
    }

    #[test]
    fn smooth_transients_grow_one_line_at_a_time() {
        let entry = MesiEntry::default();
        let mut p = VantagePolicy::new(
            CorePartMapper::new(2),
            UMonMonitor::new(64, 64, 4, 2, 8),
            16,
            100,
            10,
            40,
            true,
        );
        // Both start at a target of 8; give everything to partition 0.
        p.set_partition_sizes(&[16, 0], 16);
        // Short-term targets do not jump: partition 0 is empty, so it
        // keeps its old target and only the long-term goal moves.
        assert_eq!(p.target_size(0), 8);
        assert_eq!(p.parts[0].long_term_target, 16);
        assert_eq!(p.target_size(1), 8);
        assert_eq!(p.parts[1].long_term_target, 0);

        // A fill for partition 0 earns one line of target, funded by
        // taking one from the shrinking partition.
        let req = req_for(&entry, 0x5000, 0);
        let v = p.rank(&req, &Candidates::Range(0..8));
        p.replaced(v);
        p.update(v, &req);
        assert_eq!(p.target_size(0), 9);
        assert_eq!(p.target_size(1), 7);
    }
}
