//! Greedy lookahead partitioning (Qureshi and Patt, ISCA 2006).
//!
//! Each decision epoch, the partitioner walks the monitors' miss curves
//! and repeatedly awards buckets to the partition with the highest
//! marginal utility, where utility is misses saved over running cacheless.
//! The new allocation replaces the old one only when it is at least 2 %
//! better, so tiny utility wobbles do not thrash the partitions.

use log::debug;

use crate::cache::repl::PartitionedPolicy;
use crate::cache::umon::MissCurveSource;

/// Best marginal utility for `part` at allocation `alloc`, over every
/// feasible extra-bucket count up to `balance`. Returns (utility, count).
fn max_marginal_utility(
    monitor: &dyn MissCurveSource,
    part: u32,
    alloc: u32,
    balance: u32,
) -> (f64, u32) {
    let mut max_mu = -1.0;
    let mut max_mu_alloc = 0;
    for extra in 1..=balance {
        let saved = monitor
            .misses(part, alloc)
            .saturating_sub(monitor.misses(part, alloc + extra));
        let mu = saved as f64 / extra as f64;
        if mu > max_mu {
            max_mu = mu;
            max_mu_alloc = extra;
        }
    }
    (max_mu, max_mu_alloc)
}

/// Utility of an allocation: misses saved over not having a cache at all.
pub fn total_utility(monitor: &dyn MissCurveSource, allocs: &[u32]) -> u64 {
    let mut no_cache = 0u64;
    let mut with_parts = 0u64;
    for (p, &a) in allocs.iter().enumerate() {
        no_cache += monitor.misses(p as u32, 0);
        with_parts += monitor.misses(p as u32, a);
    }
    no_cache - with_parts
}

/// Greedy lookahead allocation of `buckets` buckets among the monitor's
/// partitions. Every partition starts at `min_alloc`; `forbidden`
/// partitions never grow past it.
pub fn compute_best_partitioning(
    monitor: &dyn MissCurveSource,
    buckets: u32,
    min_alloc: u32,
    forbidden: Option<&[bool]>,
) -> Vec<u32> {
    let parts = monitor.num_partitions();
    let mut allocs = vec![min_alloc; parts as usize];
    assert!(min_alloc * parts <= buckets, "min allocations exceed the budget");
    let mut balance = buckets - min_alloc * parts;

    while balance > 0 {
        let mut max_mu = -1.0;
        let mut max_mu_part = parts; // illegal until someone wins
        let mut max_mu_alloc = 0;
        for p in 0..parts {
            if forbidden.is_some_and(|f| f[p as usize]) {
                continue;
            }
            let (mu, extra) = max_marginal_utility(monitor, p, allocs[p as usize], balance);
            if mu > max_mu {
                max_mu = mu;
                max_mu_part = p;
                max_mu_alloc = extra;
            }
        }
        assert!(max_mu_part < parts, "no partition can absorb the balance");
        allocs[max_mu_part as usize] += max_mu_alloc;
        balance -= max_mu_alloc;
    }
    allocs
}

/// Periodic repartitioning driver: computes the best allocation, adopts
/// it if it beats the current one by more than 2 %, pushes the sizes into
/// the replacement policy, and starts a new monitoring interval.
pub struct LookaheadPartitioner {
    buckets: u32,
    min_alloc: u32,
    forbidden: Option<Vec<bool>>,
    cur_allocs: Vec<u32>,
}

impl LookaheadPartitioner {
    pub fn new(num_partitions: u32, buckets: u32, min_alloc: u32) -> Self {
        assert!(buckets > 0, "need nonzero partition buckets");
        LookaheadPartitioner {
            buckets,
            min_alloc,
            forbidden: None,
            cur_allocs: vec![0; num_partitions as usize],
        }
    }

    pub fn forbid(&mut self, partition: u32) {
        let parts = self.cur_allocs.len();
        self.forbidden
            .get_or_insert_with(|| vec![false; parts])[partition as usize] = true;
    }

    pub fn cur_allocs(&self) -> &[u32] {
        &self.cur_allocs
    }

    pub fn partition(&mut self, mut policy: PartitionedPolicy) {
        match &mut policy {
            PartitionedPolicy::Way(p) => p.monitor_mut().freeze(),
            PartitionedPolicy::Vantage(p) => p.monitor_mut().freeze(),
        }
        let monitor: &dyn MissCurveSource = match &policy {
            PartitionedPolicy::Way(p) => p.monitor(),
            PartitionedPolicy::Vantage(p) => p.monitor(),
        };
        let best = compute_best_partitioning(
            monitor,
            self.buckets,
            self.min_alloc,
            self.forbidden.as_deref(),
        );

        let new_utility = total_utility(monitor, &best);
        let cur_utility = total_utility(monitor, &self.cur_allocs);
        // Must improve by 2%; always switch when nothing useful has been
        // recorded yet.
        let switch = cur_utility == 0 || new_utility > 102 * cur_utility / 100;
        if switch {
            debug!(
                "lookahead: switching allocation, new util {new_utility}, old util {cur_utility}"
            );
            self.cur_allocs = best;
        } else {
            debug!(
                "lookahead: keeping allocation, new util {new_utility}, old util {cur_utility}"
            );
        }

        match policy {
            PartitionedPolicy::Way(p) => {
                p.set_partition_sizes(&self.cur_allocs, self.buckets);
                p.monitor_mut().reset();
            }
            PartitionedPolicy::Vantage(p) => {
                p.set_partition_sizes(&self.cur_allocs, self.buckets);
                p.monitor_mut().reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic monitor with closed-form miss curves.
    struct CurveMonitor {
        curves: Vec<Vec<u64>>,
        buckets: u32,
    }

    impl MissCurveSource for CurveMonitor {
        fn num_partitions(&self) -> u32 {
            self.curves.len() as u32
        }
        fn buckets(&self) -> u32 {
            self.buckets
        }
        fn misses(&self, partition: u32, bucket: u32) -> u64 {
            let c = &self.curves[partition as usize];
            c[(bucket as usize).min(c.len() - 1)]
        }
        fn num_accesses(&self, partition: u32) -> u64 {
            self.curves[partition as usize][0]
        }
        fn reset(&mut self) {}
    }

    fn spec_monitor() -> CurveMonitor {
        // Two 8-way monitors under a 10-bucket granularity:
        // M0 = 100 - 10a (steep), M1 = 100 - a (shallow).
        CurveMonitor {
            curves: vec![
                (0..=8).map(|a| 100 - 10 * a).collect(),
                (0..=8).map(|a| 100 - a).collect(),
            ],
            buckets: 10,
        }
    }

    #[test]
    fn steep_curve_wins_most_buckets() {
        let mon = spec_monitor();
        let allocs = compute_best_partitioning(&mon, 10, 0, None);
        assert_eq!(allocs, vec![8, 2]);
    }

    #[test]
    fn beats_uniform_division() {
        let mon = spec_monitor();
        let allocs = compute_best_partitioning(&mon, 10, 0, None);
        assert!(total_utility(&mon, &allocs) >= total_utility(&mon, &[5, 5]));
    }

    #[test]
    fn min_alloc_is_honored() {
        let mon = spec_monitor();
        let allocs = compute_best_partitioning(&mon, 10, 1, None);
        assert!(allocs.iter().all(|&a| a >= 1));
        assert_eq!(allocs.iter().sum::<u32>(), 10);
    }

    #[test]
    fn forbidden_partition_stays_at_min() {
        let mon = spec_monitor();
        let allocs = compute_best_partitioning(&mon, 10, 1, Some(&[false, true]));
        assert_eq!(allocs[1], 1);
        assert_eq!(allocs.iter().sum::<u32>(), 10);
    }
}
