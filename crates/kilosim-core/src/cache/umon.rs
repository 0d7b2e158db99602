//! Utility monitors: small sampled tag arrays that produce per-partition
//! miss curves (Qureshi and Patt, ISCA 2006).
//!
//! Each UMon is a fully associative-per-set LRU tag store over a sampled
//! slice of the address space. Way-granular hit counters give the stack
//! distance histogram, from which misses-at-allocation follows directly.

use crate::hash::HashFamily;
use crate::mem::Address;

/// One utility monitor: miss curve over `buckets` ways.
pub struct UMon {
    buckets: u32,
    set_mask: u64,
    sample_mask: u64,
    sample_shift: u32,
    /// Per set, most-recent-first tag stack, at most `buckets` deep.
    tag_sets: Vec<Vec<Address>>,
    cur_way_hits: Vec<u64>,
    cur_misses: u64,
    hash: HashFamily,
}

impl UMon {
    /// `bank_lines` is the size of the monitored cache (lines),
    /// `umon_lines` the monitor's own tag capacity, `buckets` its ways.
    pub fn new(bank_lines: u32, umon_lines: u32, buckets: u32) -> Self {
        assert!(buckets > 0 && umon_lines >= buckets);
        let sets = umon_lines / buckets;
        assert!(sets.is_power_of_two(), "UMon sets must be a power of 2");
        let sampling_factor = (bank_lines / umon_lines).max(1);
        assert!(
            sampling_factor.is_power_of_two(),
            "UMon sampling factor must be a power of 2"
        );
        UMon {
            buckets,
            set_mask: (sets - 1) as u64,
            sample_mask: (sampling_factor - 1) as u64,
            sample_shift: sampling_factor.trailing_zeros(),
            tag_sets: (0..sets).map(|_| Vec::with_capacity(buckets as usize)).collect(),
            cur_way_hits: vec![0; buckets as usize],
            cur_misses: 0,
            hash: HashFamily::h3(1, 0x5A1E5),
        }
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    pub fn access(&mut self, line_addr: Address) {
        let h = self.hash.hash(0, line_addr);
        if h & self.sample_mask != 0 {
            return; // not in the sampled slice
        }
        let set = ((h >> self.sample_shift) & self.set_mask) as usize;
        let stack = &mut self.tag_sets[set];
        if let Some(way) = stack.iter().position(|&a| a == line_addr) {
            self.cur_way_hits[way] += 1;
            let tag = stack.remove(way);
            stack.insert(0, tag);
        } else {
            self.cur_misses += 1;
            stack.insert(0, line_addr);
            stack.truncate(self.buckets as usize);
        }
    }

    pub fn num_accesses(&self) -> u64 {
        self.cur_misses + self.cur_way_hits.iter().sum::<u64>()
    }

    /// Misses this interval if the partition had been given `w` ways, for
    /// w in `0..=buckets`. The LRU stack property makes hits beyond the
    /// allocation into misses.
    pub fn miss_curve(&self) -> Vec<u64> {
        let mut curve = vec![0; self.buckets as usize + 1];
        let mut tail: u64 = self.cur_way_hits.iter().sum();
        for w in 0..=self.buckets as usize {
            curve[w] = self.cur_misses + tail;
            if w < self.buckets as usize {
                tail -= self.cur_way_hits[w];
            }
        }
        curve
    }

    pub fn start_next_interval(&mut self) {
        self.cur_way_hits.iter_mut().for_each(|h| *h = 0);
        self.cur_misses = 0;
        for s in &mut self.tag_sets {
            s.clear();
        }
    }
}

/// Per-partition miss information consumed by a partitioner. Buckets are
/// in the partitioner's granularity, not necessarily the monitor's ways.
pub trait MissCurveSource {
    fn num_partitions(&self) -> u32;
    /// Miss-curve buckets per partition (curves have `buckets + 1` points).
    fn buckets(&self) -> u32;
    /// Misses of `partition` at an allocation of `bucket` buckets.
    /// Out-of-range buckets clamp to the last point.
    fn misses(&self, partition: u32, bucket: u32) -> u64;
    fn num_accesses(&self, partition: u32) -> u64;
    fn reset(&mut self);
    /// Snapshot the curves before a partitioning decision reads them.
    fn freeze(&mut self) {}
}

/// Maintains one UMon per partition and resamples their curves into the
/// partitioner's bucket granularity.
pub struct UMonMonitor {
    monitors: Vec<UMon>,
    buckets: u32,
    miss_cache: Vec<Vec<u64>>,
    miss_cache_valid: bool,
}

impl UMonMonitor {
    pub fn new(
        num_lines: u32,
        umon_lines: u32,
        umon_buckets: u32,
        num_partitions: u32,
        buckets: u32,
    ) -> Self {
        assert!(num_partitions > 0);
        UMonMonitor {
            monitors: (0..num_partitions)
                .map(|_| UMon::new(num_lines, umon_lines, umon_buckets))
                .collect(),
            buckets,
            miss_cache: vec![Vec::new(); num_partitions as usize],
            miss_cache_valid: false,
        }
    }

    pub fn access(&mut self, partition: u32, line_addr: Address) {
        self.monitors[partition as usize].access(line_addr);
        self.miss_cache_valid = false;
    }

    /// Up- or downsample a monitor's way-granular curve into
    /// `buckets + 1` points.
    fn resample(&self, partition: u32) -> Vec<u64> {
        let monitor = &self.monitors[partition as usize];
        let umon = monitor.miss_curve();
        let umon_buckets = monitor.buckets();
        let buckets = self.buckets;
        let mut out = vec![0; buckets as usize + 1];
        if umon_buckets >= buckets {
            assert!(umon_buckets % buckets == 0);
            let ratio = (umon_buckets / buckets) as usize;
            for j in 0..buckets as usize {
                out[j] = umon[j * ratio];
            }
            out[buckets as usize] = umon[umon_buckets as usize];
        } else {
            assert!(buckets % umon_buckets == 0);
            let ratio = (buckets / umon_buckets) as usize;
            for j in 0..umon_buckets as usize {
                out[ratio * j] = umon[j];
                let m0 = umon[j] as f64;
                let m1 = umon[j + 1] as f64;
                for k in 1..ratio {
                    let frac = k as f64 / ratio as f64;
                    out[ratio * j + k] = (m0 * (1.0 - frac) + m1 * frac) as u64;
                }
            }
            out[buckets as usize] = umon[umon_buckets as usize];
        }
        out
    }

    fn fill_cache(&mut self) {
        if !self.miss_cache_valid {
            for p in 0..self.monitors.len() {
                self.miss_cache[p] = self.resample(p as u32);
            }
            self.miss_cache_valid = true;
        }
    }
}

impl MissCurveSource for UMonMonitor {
    fn num_partitions(&self) -> u32 {
        self.monitors.len() as u32
    }

    fn buckets(&self) -> u32 {
        self.buckets
    }

    fn misses(&self, partition: u32, bucket: u32) -> u64 {
        assert!(
            self.miss_cache_valid,
            "miss curves read while being updated"
        );
        let curve = &self.miss_cache[partition as usize];
        let b = (bucket as usize).min(curve.len() - 1);
        curve[b]
    }

    fn num_accesses(&self, partition: u32) -> u64 {
        self.monitors[partition as usize].num_accesses()
    }

    fn reset(&mut self) {
        for m in &mut self.monitors {
            m.start_next_interval();
        }
        self.miss_cache_valid = false;
    }

    fn freeze(&mut self) {
        self.fill_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_curve_is_monotone_nonincreasing() {
        let mut umon = UMon::new(1024, 1024, 8);
        // A looping scan over 16 lines: some stack depth structure.
        for round in 0..50u64 {
            for i in 0..16u64 {
                umon.access(i * 64 + (round & 1));
            }
        }
        let curve = umon.miss_curve();
        assert_eq!(curve.len(), 9);
        for w in curve.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert_eq!(curve[0], umon.num_accesses());
    }

    #[test]
    fn hot_line_hits_way_zero() {
        let mut umon = UMon::new(64, 64, 4);
        umon.access(0xAB);
        for _ in 0..9 {
            umon.access(0xAB);
        }
        let curve = umon.miss_curve();
        // One miss, nine hits at stack depth 0.
        assert_eq!(curve[0], 10);
        assert_eq!(curve[1], 1);
    }

    #[test]
    fn interval_reset_clears_counts() {
        let mut umon = UMon::new(64, 64, 4);
        umon.access(0x1);
        umon.start_next_interval();
        assert_eq!(umon.num_accesses(), 0);
        assert!(umon.miss_curve().iter().all(|&m| m == 0));
    }

    #[test]
    fn monitor_resamples_to_partitioner_buckets() {
        let mut mon = UMonMonitor::new(256, 256, 4, 2, 8);
        for i in 0..32u64 {
            mon.access(0, i);
        }
        mon.freeze();
        // 4 umon ways upsampled to 8 buckets: 9 curve points, clamped
        // reads past the end.
        let last = mon.misses(0, 8);
        assert_eq!(mon.misses(0, 100), last);
        assert_eq!(mon.misses(1, 0), 0);
    }
}
