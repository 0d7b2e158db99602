//! Phase barrier with join-leave semantics and parallelism control.
//!
//! Threads can join or leave the barrier at any point in time; threads in
//! the barrier call [`Barrier::sync`] at the end of each bound phase and
//! synchronize with every other participant. The barrier also limits how
//! many threads run simultaneously to the configured `parallel_threads`.
//!
//! End of phase is surfaced as a [`PhaseEnd`] token handed to exactly one
//! caller of `sync` or `leave`. That caller runs the end-of-phase work
//! (weave phase, event queue, stats) and then calls
//! [`Barrier::start_next_phase`]; the barrier holds every other thread
//! blocked on its sentinel word until then.

use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::locks::FutexWord;

/// Scheduling state of one simulated thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Not on the run list.
    Offline,
    /// On the run list, blocked until scheduled this phase.
    Waiting,
    /// Scheduled and executing its bound phase.
    Running,
    /// Left the barrier (e.g. blocked in a syscall); still on the run
    /// list until the next compaction pass.
    Left,
}

/// Proof that a phase just completed. Handed to exactly one caller, which
/// must pass it back to [`Barrier::start_next_phase`] after running the
/// end-of-phase work.
#[must_use = "the phase will not advance until start_next_phase is called"]
pub struct PhaseEnd {
    /// Index of the phase that just completed.
    pub phase: u64,
}

/// Outcome of a [`Barrier::sync`] call.
pub enum SyncOutcome {
    /// The thread was rescheduled and is running the next phase.
    NextPhase,
    /// This thread completed the phase. Run end-of-phase work, call
    /// [`Barrier::start_next_phase`], then [`Barrier::wait_scheduled`].
    EndOfPhase(PhaseEnd),
}

struct ThreadInfo {
    state: ThreadState,
    /// Run-list slot this thread last occupied (for same-phase rejoin).
    last_idx: usize,
}

struct BarrierState {
    threads: Vec<ThreadInfo>,
    run_list: Vec<u32>,
    /// First run-list slot the wake loop has not visited this phase.
    cur_idx: usize,
    running: u32,
    left: u32,
    /// Completed phases; also the LEFT→OFFLINE compaction cadence counter.
    phase: u64,
    /// A PhaseEnd token is outstanding; scheduling is frozen until
    /// start_next_phase.
    ended: bool,
    rng: SmallRng,
}

/// Phase barrier. One instance gates the whole simulated thread population.
pub struct Barrier {
    parallel_threads: u32,
    state: Mutex<BarrierState>,
    words: Box<[FutexWord]>,
}

/// Counts of threads per state, for invariant checks and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSnapshot {
    pub run_list_len: usize,
    pub running: u32,
    pub waiting: u32,
    pub left: u32,
    pub phase: u64,
}

impl Barrier {
    pub fn new(parallel_threads: u32, max_threads: usize, seed: u64) -> Self {
        assert!(parallel_threads > 0, "parallel_threads must be nonzero");
        let threads = (0..max_threads)
            .map(|_| ThreadInfo {
                state: ThreadState::Offline,
                last_idx: 0,
            })
            .collect();
        let words = (0..max_threads).map(|_| FutexWord::new()).collect();
        Barrier {
            parallel_threads,
            state: Mutex::new(BarrierState {
                threads,
                run_list: Vec::with_capacity(max_threads),
                cur_idx: 0,
                running: 0,
                left: 0,
                phase: 0,
                ended: false,
                rng: SmallRng::seed_from_u64(seed),
            }),
            words,
        }
    }

    /// Completed phases so far.
    pub fn phase(&self) -> u64 {
        self.state.lock().unwrap().phase
    }

    pub fn snapshot(&self) -> BarrierSnapshot {
        let st = self.state.lock().unwrap();
        BarrierSnapshot {
            run_list_len: st.run_list.len(),
            running: st.running,
            waiting: st.run_list.len() as u32 - st.running - st.left,
            left: st.left,
            phase: st.phase,
        }
    }

    /// Enter the barrier. Caller must be OFFLINE or LEFT. Returns once the
    /// thread has been scheduled into the current (or next) phase.
    pub fn join(&self, tid: u32) {
        {
            let mut st = self.state.lock().unwrap();
            let t = tid as usize;
            match st.threads[t].state {
                ThreadState::Offline => {
                    st.run_list.push(tid);
                    let idx = st.run_list.len() - 1;
                    st.threads[t].last_idx = idx;
                }
                ThreadState::Left => {
                    st.left -= 1;
                    // If we already ran in this phase, reschedule ourselves
                    // into it: swap with the slot at the wake cursor so we
                    // are picked next.
                    let last_idx = st.threads[t].last_idx;
                    if st.cur_idx > last_idx {
                        st.cur_idx -= 1;
                        let cur = st.cur_idx;
                        debug_assert_eq!(st.run_list[last_idx], tid);
                        let other = st.run_list[cur];
                        st.run_list[last_idx] = other;
                        st.run_list[cur] = tid;
                        st.threads[other as usize].last_idx = last_idx;
                        st.threads[t].last_idx = cur;
                    }
                }
                s => panic!("join: thread {tid} in state {s:?}"),
            }
            st.threads[t].state = ThreadState::Waiting;
            self.words[t].arm();
            // A join can never complete a phase: it only adds a waiter.
            self.wake_runnable(&mut st);
        }
        self.words[tid as usize].wait_while_armed(tid);
        debug_assert_eq!(
            self.state.lock().unwrap().threads[tid as usize].state,
            ThreadState::Running
        );
    }

    /// Exit the barrier. Caller state must be RUNNING or WAITING. May
    /// complete the phase, in which case the caller receives the
    /// [`PhaseEnd`] token and must drive `start_next_phase`.
    pub fn leave(&self, tid: u32) -> Option<PhaseEnd> {
        let mut st = self.state.lock().unwrap();
        let t = tid as usize;
        match st.threads[t].state {
            ThreadState::Running => {
                st.threads[t].state = ThreadState::Left;
                st.left += 1;
                st.running -= 1;
                self.wake_runnable(&mut st);
                self.check_phase_end(&mut st)
            }
            ThreadState::Waiting => {
                st.threads[t].state = ThreadState::Left;
                st.left += 1;
                None
            }
            s => panic!("leave: thread {tid} in state {s:?}"),
        }
    }

    /// End-of-phase synchronization point, called from a RUNNING thread.
    pub fn sync(&self, tid: u32) -> SyncOutcome {
        let end = {
            let mut st = self.state.lock().unwrap();
            let t = tid as usize;
            assert_eq!(
                st.threads[t].state,
                ThreadState::Running,
                "sync: thread {tid} not running"
            );
            self.words[t].arm();
            st.threads[t].state = ThreadState::Waiting;
            st.running -= 1;
            self.wake_runnable(&mut st);
            self.check_phase_end(&mut st)
        };
        match end {
            Some(pe) => SyncOutcome::EndOfPhase(pe),
            None => {
                self.wait_scheduled(tid);
                SyncOutcome::NextPhase
            }
        }
    }

    /// Advance to the next phase: compact LEFT entries periodically,
    /// reshuffle the run list when it exceeds the parallelism cap, rewind
    /// the wake cursor, and wake the first batch of threads.
    pub fn start_next_phase(&self, _token: PhaseEnd) {
        let mut st = self.state.lock().unwrap();
        assert!(st.ended, "start_next_phase without a completed phase");
        st.ended = false;
        st.cur_idx = 0;

        st.phase += 1;
        if st.phase % 32 == 1 {
            // Sweep LEFT threads back to OFFLINE. Threads gone for good
            // stop costing run-list traversals; threads in a syscall will
            // simply rejoin.
            let mut idx = 0;
            let mut new_size = st.run_list.len();
            while idx < new_size {
                let wtid = st.run_list[idx] as usize;
                if st.threads[wtid].state == ThreadState::Left {
                    st.threads[wtid].state = ThreadState::Offline;
                    let last = st.run_list[new_size - 1];
                    st.run_list[idx] = last;
                    st.threads[last as usize].last_idx = idx;
                    new_size -= 1;
                } else {
                    idx += 1;
                }
            }
            debug_assert_eq!(st.run_list.len() - new_size, st.left as usize);
            st.left = 0;
            st.run_list.truncate(new_size);
        }

        if (self.parallel_threads as usize) < st.run_list.len() {
            // Fisher-Yates shuffle to avoid systemic scheduling bias and
            // persistent cache-contention hotspots.
            for i in (1..st.run_list.len()).rev() {
                let j = st.rng.random_range(0..=i);
                st.run_list.swap(i, j);
                let itid = st.run_list[i] as usize;
                let jtid = st.run_list[j] as usize;
                st.threads[itid].last_idx = i;
                st.threads[jtid].last_idx = j;
            }
        }

        self.wake_runnable(&mut st);
    }

    /// Block until this thread is scheduled. Used by the thread that drove
    /// the end-of-phase work after `start_next_phase`.
    pub fn wait_scheduled(&self, tid: u32) {
        self.words[tid as usize].wait_while_armed(tid);
        debug_assert_eq!(
            self.state.lock().unwrap().threads[tid as usize].state,
            ThreadState::Running
        );
    }

    /// Wake WAITING threads in run-list order until the parallelism cap is
    /// reached or the list is exhausted. No-op while a phase end is being
    /// processed.
    fn wake_runnable(&self, st: &mut BarrierState) {
        if st.ended {
            return;
        }
        while st.running < self.parallel_threads && st.cur_idx < st.run_list.len() {
            let idx = st.cur_idx;
            st.cur_idx += 1;
            let wtid = st.run_list[idx] as usize;
            if st.threads[wtid].state == ThreadState::Waiting {
                // State must change before the word flips, or the woken
                // thread could observe itself as WAITING.
                st.threads[wtid].state = ThreadState::Running;
                st.threads[wtid].last_idx = idx;
                st.running += 1;
                self.words[wtid].clear_and_wake();
            }
        }
    }

    fn check_phase_end(&self, st: &mut BarrierState) -> Option<PhaseEnd> {
        if st.cur_idx == st.run_list.len() && st.running == 0 && !st.ended {
            if st.left as usize == st.run_list.len() {
                // Everyone left; the phase stays open until someone rejoins.
                return None;
            }
            st.ended = true;
            return Some(PhaseEnd { phase: st.phase });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Tracks how many threads are inside their bound phase at once.
    struct RunGauge {
        cur: AtomicU32,
        max: AtomicU32,
    }

    impl RunGauge {
        fn new() -> Self {
            RunGauge {
                cur: AtomicU32::new(0),
                max: AtomicU32::new(0),
            }
        }

        fn enter(&self) {
            let v = self.cur.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(v, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.cur.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn run_phases(num_threads: u32, parallel: u32, phases: u64) -> (Arc<RunGauge>, Arc<Barrier>) {
        let barrier = Arc::new(Barrier::new(parallel, num_threads as usize, 0xBA77));
        let gauge = Arc::new(RunGauge::new());

        let mut handles = Vec::new();
        for tid in 0..num_threads {
            let barrier = Arc::clone(&barrier);
            let gauge = Arc::clone(&gauge);
            handles.push(thread::spawn(move || {
                barrier.join(tid);
                let first = barrier.phase();
                let mut executed = 0u64;
                loop {
                    gauge.enter();
                    executed += 1;
                    let done = barrier.phase() >= phases;
                    gauge.exit();
                    if done {
                        if let Some(pe) = barrier.leave(tid) {
                            barrier.start_next_phase(pe);
                        }
                        return (first, executed);
                    }
                    match barrier.sync(tid) {
                        SyncOutcome::NextPhase => {}
                        SyncOutcome::EndOfPhase(pe) => {
                            barrier.start_next_phase(pe);
                            barrier.wait_scheduled(tid);
                        }
                    }
                }
            }));
        }
        for h in handles {
            let (first, executed) = h.join().unwrap();
            // No phase skipped, none run twice: a thread that joined in
            // phase `first` runs every phase through the final one exactly
            // once.
            assert!(first <= phases);
            assert_eq!(executed, phases - first + 1);
        }
        (gauge, barrier)
    }

    #[test]
    fn parallelism_cap_is_respected() {
        let (gauge, _) = run_phases(8, 2, 20);
        assert!(gauge.max.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn every_phase_runs_exactly_once_per_thread() {
        let (_, barrier) = run_phases(6, 3, 25);
        assert_eq!(barrier.phase(), 25);
    }

    #[test]
    fn unbounded_parallelism() {
        let (gauge, barrier) = run_phases(4, 8, 3);
        assert!(gauge.max.load(Ordering::SeqCst) <= 4);
        assert_eq!(barrier.phase(), 3);
    }

    #[test]
    fn counts_balance_at_all_times() {
        let barrier = Arc::new(Barrier::new(2, 8, 1));
        let mut handles = Vec::new();
        for tid in 0..8u32 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.join(tid);
                for _ in 0..10 {
                    let snap = barrier.snapshot();
                    assert!(snap.running <= 2);
                    assert_eq!(
                        snap.run_list_len as u32,
                        snap.running + snap.waiting + snap.left
                    );
                    match barrier.sync(tid) {
                        SyncOutcome::NextPhase => {}
                        SyncOutcome::EndOfPhase(pe) => {
                            barrier.start_next_phase(pe);
                            barrier.wait_scheduled(tid);
                        }
                    }
                }
                if let Some(pe) = barrier.leave(tid) {
                    barrier.start_next_phase(pe);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn leave_and_rejoin_does_not_skip_or_repeat_phases() {
        let barrier = Arc::new(Barrier::new(1, 2, 7));
        let runs_a = Arc::new(AtomicU64::new(0));
        let phases = 40;

        let b = Arc::clone(&barrier);
        let ra = Arc::clone(&runs_a);
        // Thread 0 leaves and rejoins within the same phase, every phase,
        // simulating a thread that bounces through quick syscalls.
        let h0 = thread::spawn(move || {
            b.join(0);
            loop {
                ra.fetch_add(1, Ordering::SeqCst);
                if b.phase() >= phases {
                    if let Some(pe) = b.leave(0) {
                        b.start_next_phase(pe);
                    }
                    return;
                }
                if let Some(pe) = b.leave(0) {
                    b.start_next_phase(pe);
                }
                b.join(0); // same-phase rejoin path
                match b.sync(0) {
                    SyncOutcome::NextPhase => {}
                    SyncOutcome::EndOfPhase(pe) => {
                        b.start_next_phase(pe);
                        b.wait_scheduled(0);
                    }
                }
            }
        });

        let b = Arc::clone(&barrier);
        let h1 = thread::spawn(move || {
            b.join(1);
            loop {
                if b.phase() >= phases {
                    if let Some(pe) = b.leave(1) {
                        b.start_next_phase(pe);
                    }
                    return;
                }
                match b.sync(1) {
                    SyncOutcome::NextPhase => {}
                    SyncOutcome::EndOfPhase(pe) => {
                        b.start_next_phase(pe);
                        b.wait_scheduled(1);
                    }
                }
            }
        });

        h0.join().unwrap();
        h1.join().unwrap();
        // Thread 0 executed each phase exactly once despite the
        // leave/rejoin churn.
        let completed = barrier.phase();
        assert_eq!(runs_a.load(Ordering::SeqCst), completed + 1);
    }

    #[test]
    fn compaction_recycles_left_threads() {
        let barrier = Arc::new(Barrier::new(4, 4, 3));
        // A second thread joins, leaves for good, and must eventually be
        // compacted off the run list while thread 0 keeps phasing.
        let b = Arc::clone(&barrier);
        let h2 = thread::spawn(move || {
            b.join(1);
            if let Some(pe) = b.leave(1) {
                b.start_next_phase(pe);
            }
        });
        h2.join().unwrap();

        let b = Arc::clone(&barrier);
        let h = thread::spawn(move || {
            b.join(0);
            // Enough phases to cross at least one 32-phase sweep.
            for _ in 0..70 {
                match b.sync(0) {
                    SyncOutcome::NextPhase => {}
                    SyncOutcome::EndOfPhase(pe) => {
                        b.start_next_phase(pe);
                        b.wait_scheduled(0);
                    }
                }
            }
            let snap = b.snapshot();
            let _ = b.leave(0);
            snap
        });
        let snap = h.join().unwrap();
        assert_eq!(snap.left, 0, "LEFT entries must be swept to OFFLINE");
        assert_eq!(snap.run_list_len, 1);
    }
}
