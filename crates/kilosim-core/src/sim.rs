//! System construction and the phase-driven simulation loop.
//!
//! One host thread per simulated core runs bound phases through the
//! shared cache hierarchy; the phase barrier gates them, and whichever
//! thread completes a phase drives the serial weave replay, the phase
//! event queue, and the termination checks before releasing the next
//! phase.
//!
//! The cores here are synthetic: seeded address-stream generators with a
//! configurable working set and read mix. They stand in for the binary
//! instrumentation front-end, which is deliberately out of scope.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::barrier::{Barrier, SyncOutcome};
use crate::cache::arrays::CacheArray;
use crate::cache::cc::CoherenceCtrl;
use crate::cache::lookahead::LookaheadPartitioner;
use crate::cache::part::{CorePartMapper, VantagePolicy, WayPartPolicy};
use crate::cache::repl::{
    LfuPolicy, LruPolicy, NruPolicy, ProfViolPolicy, RandPolicy, ReplPolicy, TreeLruPolicy,
};
use crate::cache::umon::UMonMonitor;
use crate::cache::Cache;
use crate::config::{Config, ConfigError};
use crate::ddr::DdrMemory;
use crate::event::{AdaptiveEvent, EventQueue, PeriodicEvent};
use crate::hash::HashFamily;
use crate::mem::{AccessFlags, AccessType, Address, MemObject, MemReq, MesiEntry, SimpleMemory};
use crate::network::Network;
use crate::stats::{dump_text, Counter, JsonStatsWriter, StatGroup};
use crate::trace::{AccessRecord, AccessTraceWriter};
use crate::weave::{collect_records, PhaseRecord, RecorderSet, WeaveScheduler};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Init(String),
}

impl From<String> for InitError {
    fn from(s: String) -> Self {
        InitError::Init(s)
    }
}

/// Per-core synthetic workload parameters.
struct WorkloadCfg {
    working_set_lines: u64,
    /// Loads per thousand accesses; the rest are stores.
    read_permille: u32,
    seed: u64,
}

/// An in-order synthetic core: one access per cycle, stalled for the
/// full (uncontended) latency of each.
pub struct SyntheticCore {
    id: u32,
    l1: Arc<Cache>,
    rng: SmallRng,
    working_set_lines: u64,
    read_permille: u32,
    entry: MesiEntry,
    cycle: u64,
    prof_cycles: Counter,
    prof_instrs: Counter,
    records: Vec<PhaseRecord>,
}

impl SyntheticCore {
    fn new(id: u32, l1: Arc<Cache>, w: &WorkloadCfg) -> Self {
        SyntheticCore {
            id,
            l1,
            rng: SmallRng::seed_from_u64(w.seed ^ (id as u64).wrapping_mul(0x9E37_79B9)),
            working_set_lines: w.working_set_lines,
            read_permille: w.read_permille,
            entry: MesiEntry::default(),
            cycle: 0,
            prof_cycles: Counter::new(),
            prof_instrs: Counter::new(),
            records: Vec::new(),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn init_stats(&self, parent: &mut StatGroup) {
        let mut g = StatGroup::new(format!("core-{}", self.id), "Core stats");
        g.append_counter("cycles", "Simulated cycles", self.prof_cycles.clone());
        g.append_counter("instrs", "Simulated instructions", self.prof_instrs.clone());
        parent.add_group(g);
    }

    /// Advance through one bound phase: issue accesses until the phase's
    /// cycle budget is spent, collecting timing records on the way.
    fn run_phase(
        &mut self,
        phase_cycles: u64,
        recorders: &RecorderSet,
        trace: Option<&Mutex<Option<AccessTraceWriter>>>,
    ) {
        let target = self.cycle + phase_cycles;
        while self.cycle < target {
            // Working sets are per-core slices of the address space, with
            // a shared band at the bottom for coherence traffic.
            let slot = self.rng.random_range(0..self.working_set_lines);
            let line_addr: Address = if slot < self.working_set_lines / 8 {
                0x10_0000 + slot
            } else {
                0x40_0000 + (self.id as u64) * self.working_set_lines + slot
            };
            let acc_type = if self.rng.random_range(0..1000) < self.read_permille {
                AccessType::Gets
            } else {
                AccessType::Getx
            };

            let mut req = MemReq {
                line_addr,
                acc_type,
                child_id: 0,
                state: &self.entry,
                cycle: self.cycle,
                child_lock: None,
                initial_state: crate::mem::MesiState::I,
                src_id: self.id,
                flags: AccessFlags::empty(),
            };
            let resp = self.l1.access(&mut req);
            let latency = (resp - self.cycle).max(1);

            if let Some(tw) = trace {
                let rec = AccessRecord {
                    line_addr,
                    req_cycle: self.cycle,
                    latency: latency as u32,
                    child_id: self.id as u16,
                    acc_type,
                };
                if let Some(w) = tw.lock().unwrap().as_mut() {
                    // Trace I/O failures should not kill the run mid-phase.
                    if let Err(e) = w.write(&rec) {
                        log::error!("core {}: trace write failed: {e}", self.id);
                    }
                }
            }

            collect_records(recorders, self.id, &mut self.records);

            self.cycle += latency;
            self.prof_cycles.add(latency);
            self.prof_instrs.inc();
        }
    }

    /// Weave feedback: stretch this core's clock by the contention the
    /// replay discovered.
    fn apply_weave_slack(&mut self, extra_cycles: u64) {
        self.cycle += extra_cycles;
        self.prof_cycles.add(extra_cycles);
    }
}

/// Everything a run needs, built from a config file.
pub struct Simulator {
    phase_length: u64,
    max_phases: u64,

    barrier: Arc<Barrier>,
    cores: Vec<Mutex<SyntheticCore>>,
    recorders: Arc<RecorderSet>,

    weave: Mutex<WeaveScheduler>,
    events: Mutex<EventQueue>,
    terminate: Arc<AtomicBool>,

    stats: Mutex<StatGroup>,
    json_stats: Option<Mutex<JsonStatsWriter>>,
    text_stats_path: Option<PathBuf>,
    trace: Option<Mutex<Option<AccessTraceWriter>>>,

    prof_phases: Counter,
    total_instrs: Counter,
}

/// What a finished run reports back.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SimSummary {
    pub phases: u64,
    pub instrs: u64,
    pub max_core_cycle: u64,
}

impl Simulator {
    pub fn from_config(cfg: &Config) -> Result<Arc<Simulator>, InitError> {
        let phase_length = cfg.get_u64("sim.phaseLength", 10_000)?;
        let parallel_threads = cfg.get_u32("sim.parallelThreads", 0)?;
        let max_phases = cfg.get_u64("sim.maxPhases", 100)?;
        let strict_config = cfg.get_bool("sim.strictConfig", false)?;
        let seed = cfg.get_u64("sim.seed", 0xBA77_137)?;

        let num_cores = cfg.get_u32("sys.cores.count", 4)?;
        let parallel_threads = if parallel_threads == 0 {
            num_cores
        } else {
            parallel_threads
        };
        let line_bits = cfg.get_u32("sys.lineBits", 6)?;
        let line_size = 1u32 << line_bits;
        let freq_mhz = cfg.get_u32("sys.frequency", 2000)?;

        let network = match cfg.get_str("sys.networkFile", "")? {
            ref s if s.is_empty() => None,
            s => Some(
                Network::from_file(Path::new(&s))
                    .map_err(|e| InitError::Init(format!("network file {s}: {e}")))?,
            ),
        };
        let net_rtt = |src: &str, dst: &str| network.as_ref().map_or(0, |n| n.rtt(src, dst));

        // Memory: one or more DDR channels, or a fixed-latency stand-in.
        let recorders = Arc::new(RecorderSet::new(num_cores));
        let mem_type = cfg.get_str("sys.mem.type", "DDR3")?;
        let channels = cfg.get_u32("sys.mem.channels", 1)?;
        let mut mems: Vec<Arc<DdrMemory>> = Vec::new();
        let mut mem_objs: Vec<Arc<dyn MemObject>> = Vec::new();
        match mem_type.as_str() {
            "Simple" => {
                let lat = cfg.get_u64("sys.mem.latency", 100)?;
                for i in 0..channels {
                    mem_objs.push(Arc::new(SimpleMemory::new(lat, format!("mem-{i}"))));
                }
            }
            "DDR3" => {
                let tech = cfg.get_str("sys.mem.tech", "DDR3-1333-CL10")?;
                let mapping = cfg.get_str("sys.mem.addrMapping", "col:rank:bank")?;
                let col_size = cfg.get_u32("sys.mem.colSize", 2048)?;
                let ranks = cfg.get_u32("sys.mem.ranksPerChannel", 1)?;
                let banks = cfg.get_u32("sys.mem.banksPerRank", 8)?;
                let ctl_lat = cfg.get_u64("sys.mem.controllerLatency", 40)?;
                let queue_depth = cfg.get_u32("sys.mem.queueDepth", 16)? as usize;
                let row_hit_limit = cfg.get_u64("sys.mem.rowHitLimit", 4)?;
                let deferred = cfg.get_bool("sys.mem.deferredWrites", true)?;
                let closed_page = cfg.get_bool("sys.mem.closedPage", false)?;
                for i in 0..channels {
                    let mem = Arc::new(DdrMemory::new(
                        line_size,
                        col_size,
                        ranks,
                        banks,
                        freq_mhz,
                        &tech,
                        &mapping,
                        ctl_lat,
                        queue_depth,
                        row_hit_limit,
                        deferred,
                        closed_page,
                        i,
                        format!("mem-{i}"),
                    )?);
                    mem.set_recorders(Arc::clone(&recorders));
                    mem_objs.push(Arc::clone(&mem) as Arc<dyn MemObject>);
                    mems.push(mem);
                }
            }
            other => return Err(InitError::Init(format!("unknown memory type {other}"))),
        }

        // Shared L2 (the last-level cache here).
        let l2_lines = (cfg.get_u64("sys.caches.l2.size", 1 << 20)? >> line_bits) as u32;
        let l2 = Arc::new(build_cache(
            cfg,
            "sys.caches.l2",
            "l2",
            l2_lines,
            num_cores,
            seed,
            false,
        )?);

        // Per-core terminal L1s.
        let l1_lines = (cfg.get_u64("sys.caches.l1d.size", 32 << 10)? >> line_bits) as u32;
        let mut l1s = Vec::new();
        for i in 0..num_cores {
            let l1 = Arc::new(build_cache(
                cfg,
                "sys.caches.l1d",
                &format!("l1d-{i}"),
                l1_lines,
                num_cores,
                seed ^ (i as u64 + 1),
                true,
            )?);
            l1s.push(l1);
        }

        // Wire the tree, leaves last so every view lands.
        let l2_rtts: Vec<u32> = (0..mem_objs.len())
            .map(|i| net_rtt("l2", &format!("mem-{i}")))
            .collect();
        l2.set_children(
            l1s.clone(),
            (0..num_cores).map(|i| net_rtt("l2", &format!("l1d-{i}"))).collect(),
        );
        l2.set_parents(0, mem_objs, l2_rtts);
        for (i, l1) in l1s.iter().enumerate() {
            let rtt = net_rtt(&format!("l1d-{i}"), "l2");
            l1.set_parents(i as u32, vec![Arc::clone(&l2) as Arc<dyn MemObject>], vec![rtt]);
        }

        // Cores: process<i> groups override the sys.cores defaults, so
        // heterogeneous workloads stay expressible.
        let mut cores = Vec::new();
        for i in 0..num_cores {
            let pgroup = format!("process{i}");
            let group = if cfg.has(&pgroup) { pgroup } else { "sys.cores".to_string() };
            let w = WorkloadCfg {
                working_set_lines: cfg.get_u64(&format!("{group}.workingSetLines"), 8192)?,
                read_permille: cfg.get_u32(&format!("{group}.readPermille"), 700)?,
                seed: cfg.get_u64(&format!("{group}.seed"), seed)?,
            };
            cores.push(Mutex::new(SyntheticCore::new(i, Arc::clone(&l1s[i as usize]), &w)));
        }

        let trace = match cfg.get_str("sim.traceFile", "")? {
            ref s if s.is_empty() => None,
            s => Some(Mutex::new(Some(
                AccessTraceWriter::create(Path::new(&s), num_cores)
                    .map_err(|e| InitError::Init(format!("trace file {s}: {e}")))?,
            ))),
        };
        let json_stats = match cfg.get_str("sim.statsFile", "")? {
            ref s if s.is_empty() => None,
            s => {
                let compact = cfg.get_bool("sim.compactStats", false)?;
                Some(Mutex::new(
                    JsonStatsWriter::create(Path::new(&s), compact)
                        .map_err(|e| InitError::Init(format!("stats file {s}: {e}")))?,
                ))
            }
        };
        let text_stats_path = match cfg.get_str("sim.textStatsFile", "")? {
            ref s if s.is_empty() => None,
            s => Some(PathBuf::from(s)),
        };

        // Statistics tree.
        let mut root = StatGroup::new("sim", "Simulation stats");
        let prof_phases = root.add_counter("phases", "Completed phases");
        let total_instrs = root.add_counter("instrs", "Total simulated instructions");
        for l1 in &l1s {
            l1.init_stats(&mut root);
        }
        l2.init_stats(&mut root);
        for mem in &mems {
            mem.init_stats(&mut root);
        }
        for core in &cores {
            core.lock().unwrap().init_stats(&mut root);
        }

        let terminate = Arc::new(AtomicBool::new(false));
        let mut events = EventQueue::new();

        // Periodic stats dumps ride the event queue.
        let stats_interval = cfg.get_u64("sim.statsPhaseInterval", 0)?;

        // Periodic repartitioning, if the LLC is partitioned.
        let part_interval = cfg.get_u64("sys.caches.l2.partitionInterval", 0)?;
        if part_interval > 0 {
            let l2_ev = Arc::clone(&l2);
            events.insert(
                Box::new(PeriodicEvent::new(part_interval, move |_| l2_ev.repartition())),
                0,
                part_interval,
            );
        }

        // Instruction-count termination via an adaptive event.
        let max_instrs = cfg.get_u64("sim.maxInstrs", 0)?;
        if max_instrs > 0 {
            let counter = total_instrs.clone();
            let flag = Arc::clone(&terminate);
            let max_rate = num_cores as u64 * phase_length;
            let (ev, delay) = AdaptiveEvent::new(
                move || counter.get(),
                move || flag.store(true, Ordering::SeqCst),
                max_instrs,
                max_rate,
            );
            events.insert(Box::new(ev), 0, delay);
        }

        cfg.finalize(strict_config)?;

        let sim = Arc::new(Simulator {
            phase_length,
            max_phases,
            barrier: Arc::new(Barrier::new(parallel_threads, num_cores as usize, seed)),
            cores,
            recorders,
            weave: Mutex::new(WeaveScheduler::new(mems)),
            events: Mutex::new(events),
            terminate,
            stats: Mutex::new(root),
            json_stats,
            text_stats_path,
            trace,
            prof_phases,
            total_instrs,
        });

        if stats_interval > 0 {
            let s = Arc::clone(&sim);
            sim.events.lock().unwrap().insert(
                Box::new(PeriodicEvent::new(stats_interval, move |phase| {
                    s.dump_stats(phase);
                })),
                0,
                stats_interval,
            );
        }

        Ok(sim)
    }

    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Run to completion: spawns one host thread per core and drives
    /// phases until a termination condition fires.
    pub fn run(self: &Arc<Self>) -> SimSummary {
        thread::scope(|scope| {
            for tid in 0..self.cores.len() as u32 {
                let sim = Arc::clone(self);
                scope.spawn(move || sim.core_loop(tid));
            }
        });

        let phases = self.barrier.phase();
        self.finish(phases);
        SimSummary {
            phases,
            instrs: self.total_instrs.get(),
            max_core_cycle: self
                .cores
                .iter()
                .map(|c| c.lock().unwrap().cycle())
                .max()
                .unwrap_or(0),
        }
    }

    fn core_loop(&self, tid: u32) {
        self.barrier.join(tid);
        loop {
            if self.terminate.load(Ordering::SeqCst) {
                if let Some(pe) = self.barrier.leave(tid) {
                    self.end_of_phase(pe.phase);
                    self.barrier.start_next_phase(pe);
                }
                return;
            }
            {
                let mut core = self.cores[tid as usize].lock().unwrap();
                core.run_phase(self.phase_length, &self.recorders, self.trace.as_ref());
            }
            match self.barrier.sync(tid) {
                SyncOutcome::NextPhase => {}
                SyncOutcome::EndOfPhase(pe) => {
                    self.end_of_phase(pe.phase);
                    self.barrier.start_next_phase(pe);
                    self.barrier.wait_scheduled(tid);
                }
            }
        }
    }

    /// Runs in exactly one thread per phase, with every other simulated
    /// thread parked at the barrier.
    fn end_of_phase(&self, phase: u64) {
        // Weave: replay the phase's records in global order and feed the
        // contention back into the cores.
        let mut all_records: Vec<PhaseRecord> = Vec::new();
        for core in &self.cores {
            let mut core = core.lock().unwrap();
            all_records.append(&mut core.records);
        }
        if !all_records.is_empty() {
            let adjusted = self.weave.lock().unwrap().run_phase(&all_records);
            let mut extra = vec![0u64; self.cores.len()];
            for (r, &adj) in all_records.iter().zip(&adjusted) {
                extra[r.core as usize] += adj.saturating_sub(r.record.resp_cycle);
            }
            for (i, &e) in extra.iter().enumerate() {
                if e > 0 {
                    self.cores[i].lock().unwrap().apply_weave_slack(e);
                }
            }
        }

        self.prof_phases.inc();
        let instrs: u64 = self
            .cores
            .iter()
            .map(|c| c.lock().unwrap().prof_instrs.get())
            .sum();
        self.total_instrs.set(instrs);

        self.events.lock().unwrap().tick(phase);

        if phase + 1 >= self.max_phases {
            self.terminate.store(true, Ordering::SeqCst);
        }
    }

    fn dump_stats(&self, phase: u64) {
        let stats = self.stats.lock().unwrap();
        if let Some(w) = &self.json_stats {
            if let Err(e) = w.lock().unwrap().dump(&stats, phase) {
                log::error!("stats dump failed: {e}");
            }
        }
    }

    /// Final flushes: counters to disk, trace closed with its finished
    /// attribute set.
    fn finish(&self, phases: u64) {
        self.dump_stats(phases);
        if let Some(w) = &self.json_stats {
            let _ = w.lock().unwrap().flush();
        }
        if let Some(path) = &self.text_stats_path {
            let stats = self.stats.lock().unwrap();
            if let Err(e) = dump_text(path, &stats) {
                log::error!("text stats dump failed: {e}");
            }
        }
        if let Some(trace) = &self.trace {
            if let Some(w) = trace.lock().unwrap().take() {
                if let Err(e) = w.finish() {
                    log::error!("trace close failed: {e}");
                }
            }
        }
        info!(
            "simulation done: {phases} phases, {} instrs",
            self.total_instrs.get()
        );
    }
}

/// Build one cache level from its config group.
fn build_cache(
    cfg: &Config,
    group: &str,
    name: &str,
    num_lines: u32,
    num_cores: u32,
    seed: u64,
    terminal: bool,
) -> Result<Cache, InitError> {
    let assoc = cfg.get_u32(&format!("{group}.assoc"), if terminal { 8 } else { 16 })?;
    let acc_lat = cfg.get_u64(&format!("{group}.latency"), if terminal { 4 } else { 27 })?;
    let inv_lat = cfg.get_u64(&format!("{group}.invLatency"), acc_lat.min(8))?;
    let array_type = cfg.get_str(&format!("{group}.array"), "SetAssoc")?;
    let repl_name = cfg.get_str(&format!("{group}.repl"), "LRU")?;
    let non_incl = cfg.get_bool(&format!("{group}.nonInclusiveHack"), false)?;

    let repl = build_repl(cfg, group, &repl_name, num_lines, assoc, num_cores, seed)?;

    let array = match array_type.as_str() {
        "SetAssoc" => CacheArray::set_assoc(num_lines, assoc, repl, HashFamily::h3(1, seed)),
        "Z" => {
            let cands = cfg.get_u32(&format!("{group}.candidates"), 4 * assoc)?;
            CacheArray::zcache(num_lines, assoc, cands, repl, HashFamily::h3(assoc, seed))
        }
        other => return Err(InitError::Init(format!("[{name}] unknown array type {other}"))),
    };

    let cc = if terminal {
        CoherenceCtrl::terminal(name, num_lines)
    } else {
        CoherenceCtrl::full(name, num_lines, non_incl)
    };

    let mut cache = Cache::new(name, cc, array, acc_lat, inv_lat);
    if matches!(repl_name.as_str(), "Vantage" | "WayPart") {
        let buckets = cfg.get_u32(&format!("{group}.partBuckets"), assoc)?;
        let min_alloc = cfg.get_u32(&format!("{group}.partMinAlloc"), 1)?;
        cache = cache.with_partitioner(LookaheadPartitioner::new(num_cores, buckets, min_alloc));
    }
    Ok(cache)
}

fn build_repl(
    cfg: &Config,
    group: &str,
    name: &str,
    num_lines: u32,
    assoc: u32,
    num_cores: u32,
    seed: u64,
) -> Result<ReplPolicy, InitError> {
    let policy = match name {
        "LRU" => ReplPolicy::Lru(LruPolicy::new(num_lines, true)),
        "TreeLRU" => ReplPolicy::TreeLru(TreeLruPolicy::new(num_lines, assoc)),
        "NRU" => ReplPolicy::Nru(NruPolicy::new(num_lines)),
        "Rand" => ReplPolicy::Rand(RandPolicy::new(seed)),
        "LFU" => ReplPolicy::Lfu(LfuPolicy::new(num_lines)),
        "ProfViol" => ReplPolicy::ProfViol(Box::new(ProfViolPolicy::new(
            num_lines,
            ReplPolicy::Lru(LruPolicy::new(num_lines, true)),
        ))),
        "Vantage" | "WayPart" => {
            let umon_lines = cfg.get_u32(&format!("{group}.umonLines"), num_lines.max(64) / 8)?;
            let umon_ways = cfg.get_u32(&format!("{group}.umonWays"), 8)?;
            let buckets = cfg.get_u32(&format!("{group}.partBuckets"), assoc)?;
            let monitor = UMonMonitor::new(num_lines, umon_lines, umon_ways, num_cores, buckets);
            let mapper = CorePartMapper::new(num_cores);
            if name == "Vantage" {
                let portion = cfg.get_u32(&format!("{group}.partPortion"), 90)?;
                let slack = cfg.get_u32(&format!("{group}.partSlack"), 10)?;
                let aperture = cfg.get_u32(&format!("{group}.maxAperture"), 40)?;
                let smooth = cfg.get_bool(&format!("{group}.smoothTransients"), false)?;
                ReplPolicy::Vantage(VantagePolicy::new(
                    mapper, monitor, num_lines, portion, slack, aperture, smooth,
                ))
            } else {
                ReplPolicy::WayPart(WayPartPolicy::new(mapper, monitor, num_lines, assoc, false))
            }
        }
        other => return Err(InitError::Init(format!("unknown replacement policy {other}"))),
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(cfg_body: &str) -> SimSummary {
        let cfg = Config::from_str_named(cfg_body, "test.toml".into()).unwrap();
        let sim = Simulator::from_config(&cfg).unwrap();
        sim.run()
    }

    #[test]
    fn small_system_runs_to_max_phases() {
        let summary = run_with(
            r#"
            [sim]
            phaseLength = 200
            maxPhases = 6

            [sys.cores]
            count = 2
            workingSetLines = 512

            [sys.caches.l1d]
            size = 4096
            [sys.caches.l2]
            size = 32768

            [sys.mem]
            type = "Simple"
            latency = 100
            "#,
        );
        assert_eq!(summary.phases, 6);
        assert!(summary.instrs > 0);
        assert!(summary.max_core_cycle >= 6 * 200);
    }

    #[test]
    fn ddr_system_with_weave_contention() {
        let summary = run_with(
            r#"
            [sim]
            phaseLength = 300
            maxPhases = 4
            parallelThreads = 2

            [sys.cores]
            count = 4
            workingSetLines = 16384

            [sys.caches.l1d]
            size = 2048
            [sys.caches.l2]
            size = 16384

            [sys.mem]
            type = "DDR3"
            tech = "DDR3-1333-CL10"
            "#,
        );
        assert_eq!(summary.phases, 4);
        // A thrashing working set with a tiny L2 must reach memory, and
        // contention must stretch core clocks beyond the bound phases.
        assert!(summary.max_core_cycle > 4 * 300);
    }

    #[test]
    fn zcache_llc_with_vantage_partitioning() {
        let summary = run_with(
            r#"
            [sim]
            phaseLength = 200
            maxPhases = 5

            [sys.cores]
            count = 2
            workingSetLines = 4096

            [sys.caches.l1d]
            size = 2048

            [sys.caches.l2]
            size = 65536
            array = "Z"
            assoc = 4
            candidates = 16
            repl = "Vantage"
            partBuckets = 16
            partitionInterval = 2

            [sys.mem]
            type = "Simple"
            latency = 120
            "#,
        );
        assert_eq!(summary.phases, 5);
        assert!(summary.instrs > 0);
    }

    #[test]
    fn max_instrs_terminates_early() {
        let summary = run_with(
            r#"
            [sim]
            phaseLength = 100
            maxPhases = 1000
            maxInstrs = 500

            [sys.cores]
            count = 2
            workingSetLines = 64

            [sys.caches.l1d]
            size = 4096
            [sys.caches.l2]
            size = 32768

            [sys.mem]
            type = "Simple"
            latency = 50
            "#,
        );
        assert!(summary.phases < 1000);
        assert!(summary.instrs >= 500);
    }

    #[test]
    fn strict_config_rejects_typos() {
        let cfg = Config::from_str_named(
            r#"
            [sim]
            phaseLength = 100
            strictConfig = true
            phaseLenght = 5

            [sys.mem]
            type = "Simple"
            "#,
            "test.toml".into(),
        )
        .unwrap();
        assert!(Simulator::from_config(&cfg).is_err());
    }
}
