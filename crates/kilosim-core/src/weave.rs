//! Weave phase: event recording in the bound phase, serial contention
//! replay at phase boundaries.
//!
//! During the bound phase, memory controllers deposit one
//! [`TimingRecord`] per access into the requesting core's
//! [`EventRecorder`]; the core pops it and appends it to its phase trace.
//! At the phase boundary, a single [`WeaveScheduler`] replays all traces
//! through the shared memory system in global cycle order, producing
//! adjusted response cycles that the cores fold back into their clocks.
//! Contention results are deterministic given the bound-phase record.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ddr::DdrMemory;
use crate::mem::{AccessType, Address};
use crate::slab::{SlabArena, SlabHandle};

/// Weave-side representation of a recorded access.
#[derive(Debug, Clone, Copy)]
pub enum WeaveEventKind {
    MemAccess {
        mem_id: u32,
        addr: Address,
        is_write: bool,
        min_start_cycle: u64,
    },
}

/// One bound-phase access the weave phase must replay.
#[derive(Debug, Clone, Copy)]
pub struct TimingRecord {
    pub addr: Address,
    pub req_cycle: u64,
    pub resp_cycle: u64,
    pub acc_type: AccessType,
    pub start_event: SlabHandle,
    pub end_event: SlabHandle,
}

/// Per-core record buffer plus the slab arena its events live in.
///
/// The demand access of each core instruction holds the single `pending`
/// slot; side requests triggered along the way (eviction writebacks from
/// intermediate levels) land in `side`. The core drains both before it
/// issues its next access.
pub struct EventRecorder {
    src_id: u32,
    arena: SlabArena<WeaveEventKind>,
    pending: Option<TimingRecord>,
    side: Vec<TimingRecord>,
}

const EVENT_SLAB_CAP: usize = 1024;

impl EventRecorder {
    pub fn new(src_id: u32) -> Self {
        EventRecorder {
            src_id,
            arena: SlabArena::new(EVENT_SLAB_CAP),
            pending: None,
            side: Vec::new(),
        }
    }

    pub fn src_id(&self) -> u32 {
        self.src_id
    }

    pub fn alloc_event(&mut self, kind: WeaveEventKind) -> SlabHandle {
        self.arena.alloc(kind)
    }

    /// Consume an event, recycling its slab slot.
    pub fn take_event(&mut self, h: SlabHandle) -> WeaveEventKind {
        self.arena.free(h)
    }

    pub fn push_record(&mut self, rec: TimingRecord) {
        match self.pending {
            None => self.pending = Some(rec),
            Some(_) => self.side.push(rec),
        }
    }

    pub fn pop_record(&mut self) -> Option<TimingRecord> {
        self.pending.take()
    }

    pub fn has_record(&self) -> bool {
        self.pending.is_some() || !self.side.is_empty()
    }
}

/// The per-core recorders, shared between cores and memory controllers.
pub struct RecorderSet {
    recorders: Vec<Mutex<EventRecorder>>,
}

impl RecorderSet {
    pub fn new(num_cores: u32) -> Self {
        RecorderSet {
            recorders: (0..num_cores).map(|i| Mutex::new(EventRecorder::new(i))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    pub fn recorder(&self, src_id: u32) -> MutexGuard<'_, EventRecorder> {
        self.recorders[src_id as usize].lock().unwrap()
    }
}

/// A record pulled out of a recorder, ready for replay.
pub struct PhaseRecord {
    pub core: u32,
    pub record: TimingRecord,
    pub kind: WeaveEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WeaveEv {
    Request {
        mem_id: u32,
        addr: Address,
        is_write: bool,
        /// Index into the phase's record list.
        token: u64,
    },
    Tick {
        mem_id: u32,
    },
}

/// Serial contention replayer. Owns the memory controllers' weave side
/// and their recurring refresh schedule.
pub struct WeaveScheduler {
    mems: Vec<Arc<DdrMemory>>,
    next_refresh: Vec<u64>,
    seq: u64,
}

impl WeaveScheduler {
    pub fn new(mems: Vec<Arc<DdrMemory>>) -> Self {
        let next_refresh = mems.iter().map(|m| m.refresh_interval_sys()).collect();
        WeaveScheduler {
            mems,
            next_refresh,
            seq: 0,
        }
    }

    /// Replay one phase's records in global order. Returns the adjusted
    /// response cycle of each record, index-aligned with the input.
    pub fn run_phase(&mut self, records: &[PhaseRecord]) -> Vec<u64> {
        let mut adjusted: Vec<u64> = records.iter().map(|r| r.record.resp_cycle).collect();

        let mut heap: BinaryHeap<Reverse<(u64, u64, WeaveEv)>> = BinaryHeap::new();
        for (i, r) in records.iter().enumerate() {
            let WeaveEventKind::MemAccess {
                mem_id,
                addr,
                is_write,
                min_start_cycle,
            } = r.kind;
            self.seq += 1;
            heap.push(Reverse((
                min_start_cycle,
                self.seq,
                WeaveEv::Request {
                    mem_id,
                    addr,
                    is_write,
                    token: i as u64,
                },
            )));
        }

        let mut completions = Vec::new();
        while let Some(Reverse((cycle, _, ev))) = heap.pop() {
            // Interleave refreshes that are due by now.
            for (m, next) in self.next_refresh.iter_mut().enumerate() {
                while *next <= cycle {
                    self.mems[m].refresh(*next);
                    *next += self.mems[m].refresh_interval_sys();
                }
            }

            match ev {
                WeaveEv::Request {
                    mem_id,
                    addr,
                    is_write,
                    token,
                } => {
                    let mem = &self.mems[mem_id as usize];
                    let token = if is_write { None } else { Some(token) };
                    if let Some(tick_at) = mem.enqueue(addr, is_write, cycle, token) {
                        self.seq += 1;
                        heap.push(Reverse((tick_at, self.seq, WeaveEv::Tick { mem_id })));
                    }
                }
                WeaveEv::Tick { mem_id } => {
                    let mem = &self.mems[mem_id as usize];
                    completions.clear();
                    let next = mem.tick(cycle, &mut completions);
                    for c in &completions {
                        if let Some(tok) = c.token {
                            adjusted[tok as usize] = mem.done_sys_cycle(c);
                        }
                    }
                    if let Some(tick_at) = next {
                        self.seq += 1;
                        heap.push(Reverse((tick_at, self.seq, WeaveEv::Tick { mem_id })));
                    }
                }
            }
        }

        adjusted
    }
}

/// Pop one record off a recorder (demand access first, then any side
/// writebacks, oldest first) and resolve its weave event.
pub fn collect_record(recorders: &RecorderSet, core: u32) -> Option<PhaseRecord> {
    let mut rec = recorders.recorder(core);
    let record = rec.pop_record()?;
    let kind = rec.take_event(record.start_event);
    if !rec.side.is_empty() {
        let next = rec.side.remove(0);
        rec.pending = Some(next);
    }
    Some(PhaseRecord { core, record, kind })
}

/// Drain every record a core accumulated into `out`.
pub fn collect_records(recorders: &RecorderSet, core: u32, out: &mut Vec<PhaseRecord>) {
    while let Some(rec) = collect_record(recorders, core) {
        out.push(rec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{AccessFlags, MemObject, MemReq, MesiEntry, MesiState};

    fn test_mem(mem_id: u32) -> Arc<DdrMemory> {
        Arc::new(
            DdrMemory::new(
                64, 2048, 1, 8, 2000, "DDR3-1333-CL10", "col:rank:bank",
                10, 16, 4, true, false, mem_id, format!("mem-{mem_id}"),
            )
            .unwrap(),
        )
    }

    fn bound_access(
        mem: &DdrMemory,
        recorders: &RecorderSet,
        core: u32,
        addr: Address,
        acc_type: AccessType,
        cycle: u64,
    ) -> PhaseRecord {
        let entry = MesiEntry::default();
        let mut req = MemReq {
            line_addr: addr,
            acc_type,
            child_id: 0,
            state: &entry,
            cycle,
            child_lock: None,
            initial_state: MesiState::I,
            src_id: core,
            flags: AccessFlags::empty(),
        };
        mem.access(&mut req);
        collect_record(recorders, core).expect("access must leave a record")
    }

    #[test]
    fn recorder_holds_one_record() {
        let recorders = RecorderSet::new(1);
        let mut rec = recorders.recorder(0);
        let ev = rec.alloc_event(WeaveEventKind::MemAccess {
            mem_id: 0,
            addr: 1,
            is_write: false,
            min_start_cycle: 0,
        });
        rec.push_record(TimingRecord {
            addr: 1,
            req_cycle: 0,
            resp_cycle: 10,
            acc_type: AccessType::Gets,
            start_event: ev,
            end_event: ev,
        });
        assert!(rec.has_record());
        assert!(rec.pop_record().is_some());
        assert!(rec.pop_record().is_none());
    }

    #[test]
    fn contention_pushes_responses_apart() {
        let recorders = Arc::new(RecorderSet::new(2));
        let mem = test_mem(0);
        mem.set_recorders(Arc::clone(&recorders));

        // Two cores read different rows of the same bank at the same
        // cycle: the uncontended bound latency cannot hold for both.
        let r0 = bound_access(&mem, &recorders, 0, 0x0, AccessType::Gets, 1000);
        let r1 = bound_access(&mem, &recorders, 1, 0x1 << 12, AccessType::Gets, 1000);
        let bound_resp = r0.record.resp_cycle;
        assert_eq!(r1.record.resp_cycle, bound_resp);

        let mut weave = WeaveScheduler::new(vec![Arc::clone(&mem)]);
        let adjusted = weave.run_phase(&[r0, r1]);
        let (first, second) = (adjusted[0].min(adjusted[1]), adjusted[0].max(adjusted[1]));
        assert!(second > first, "same-bank conflicts must serialize");
        assert!(
            second > bound_resp,
            "the loser must see more than the uncontended latency"
        );
    }

    #[test]
    fn uncontended_replay_stays_near_bound_latency() {
        let recorders = Arc::new(RecorderSet::new(1));
        let mem = test_mem(0);
        mem.set_recorders(Arc::clone(&recorders));

        let r = bound_access(&mem, &recorders, 0, 0x40, AccessType::Gets, 5000);
        let bound_resp = r.record.resp_cycle;
        let mut weave = WeaveScheduler::new(vec![Arc::clone(&mem)]);
        let adjusted = weave.run_phase(&[r]);
        // One isolated read costs at most the row activation (tRCD, not
        // part of the bound-phase minimum) plus translation rounding over
        // the bound estimate.
        assert!(adjusted[0] >= bound_resp);
        assert!(
            adjusted[0] - bound_resp <= 40,
            "adjusted {} vs bound {bound_resp}",
            adjusted[0]
        );
    }

    #[test]
    fn writes_keep_their_bound_response() {
        let recorders = Arc::new(RecorderSet::new(1));
        let mem = test_mem(0);
        mem.set_recorders(Arc::clone(&recorders));

        let r = bound_access(&mem, &recorders, 0, 0x80, AccessType::Putx, 2000);
        let bound_resp = r.record.resp_cycle;
        let mut weave = WeaveScheduler::new(vec![Arc::clone(&mem)]);
        let adjusted = weave.run_phase(&[r]);
        assert_eq!(adjusted[0], bound_resp);
    }
}
