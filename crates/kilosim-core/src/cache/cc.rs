//! MESI coherence controllers.
//!
//! A coherence controller is split in two. The BOTTOM controller keeps
//! this cache's state with respect to the level above and issues accesses
//! upward; the TOP controller keeps directory state (sharer sets) for the
//! level below and issues invalidations downward. The naming is
//! protocol-centric: between any two cache levels there is a top CC above
//! and a bottom CC below.
//!
//! Locking: an access locks the top CC first, then the bottom CC, after
//! releasing the requesting child's lock (hand-over-hand only goes
//! downward; going up drops the lock, and the resulting races are resolved
//! in exactly one place, [`check_mesi_race`]). Invalidations take only the
//! bottom CC lock, so every top-entry mutation happens under it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::cache::Cache;
use crate::locks::FutexLock;
use crate::mem::{
    AccessFlags, AccessType, Address, InvReq, InvType, MemObject, MemReq, MesiEntry, MesiState,
};
use crate::stats::{Counter, StatGroup};

/// Sharer-set width: one bit per child in a single atomic word.
pub const MAX_CACHE_CHILDREN: usize = 64;

/// Directory entry of the top controller: sharer bitset plus exclusive
/// bit. Mutated only under the bottom CC lock; atomics make the
/// cross-thread reads (replacement-policy queries) well-defined.
#[derive(Debug, Default)]
pub struct TopEntry {
    sharers: AtomicU64,
    exclusive: AtomicBool,
}

impl TopEntry {
    fn clear(&self) {
        self.sharers.store(0, Ordering::Relaxed);
        self.exclusive.store(false, Ordering::Relaxed);
    }

    fn is_empty(&self) -> bool {
        self.sharers.load(Ordering::Relaxed) == 0
    }

    pub fn num_sharers(&self) -> u32 {
        self.sharers.load(Ordering::Relaxed).count_ones()
    }

    /// Exactly one sharer holding the line in E or M.
    fn is_exclusive(&self) -> bool {
        self.num_sharers() == 1 && self.exclusive.load(Ordering::Relaxed)
    }

    fn has(&self, child: u32) -> bool {
        self.sharers.load(Ordering::Relaxed) & (1 << child) != 0
    }

    fn add(&self, child: u32) {
        let w = self.sharers.load(Ordering::Relaxed) | (1 << child);
        self.sharers.store(w, Ordering::Relaxed);
    }

    fn remove(&self, child: u32) {
        let w = self.sharers.load(Ordering::Relaxed) & !(1 << child);
        self.sharers.store(w, Ordering::Relaxed);
    }

    fn set_exclusive(&self, v: bool) {
        self.exclusive.store(v, Ordering::Relaxed);
    }

    fn sharer_ids(&self) -> impl Iterator<Item = u32> {
        let mut w = self.sharers.load(Ordering::Relaxed);
        std::iter::from_fn(move || {
            if w == 0 {
                None
            } else {
                let c = w.trailing_zeros();
                w &= w - 1;
                Some(c)
            }
        })
    }
}

/// Lock-free state queries for replacement policies.
#[derive(Clone)]
pub struct CcView {
    mesi: Arc<[MesiEntry]>,
    top: Option<Arc<[TopEntry]>>,
}

impl CcView {
    pub fn is_valid(&self, line_id: u32) -> bool {
        self.mesi[line_id as usize].is_valid()
    }

    pub fn num_sharers(&self, line_id: u32) -> u32 {
        self.top
            .as_ref()
            .map_or(0, |t| t[line_id as usize].num_sharers())
    }
}

struct BccProf {
    gets_hit: Counter,
    getx_hit: Counter,
    gets_miss: Counter,
    getx_miss_im: Counter,
    getx_miss_sm: Counter,
    puts: Counter,
    putx: Counter,
    inv: Counter,
    invx: Counter,
    fwd: Counter,
    get_next_level_lat: Counter,
    get_net_lat: Counter,
}

impl BccProf {
    fn new() -> Self {
        BccProf {
            gets_hit: Counter::new(),
            getx_hit: Counter::new(),
            gets_miss: Counter::new(),
            getx_miss_im: Counter::new(),
            getx_miss_sm: Counter::new(),
            puts: Counter::new(),
            putx: Counter::new(),
            inv: Counter::new(),
            invx: Counter::new(),
            fwd: Counter::new(),
            get_next_level_lat: Counter::new(),
            get_net_lat: Counter::new(),
        }
    }

    fn init_stats(&self, parent: &mut StatGroup) {
        parent.append_counter("hGETS", "GETS hits", self.gets_hit.clone());
        parent.append_counter("hGETX", "GETX hits", self.getx_hit.clone());
        parent.append_counter("mGETS", "GETS misses", self.gets_miss.clone());
        parent.append_counter("mGETXIM", "GETX I->M misses", self.getx_miss_im.clone());
        parent.append_counter("mGETXSM", "GETX S->M misses (upgrade misses)", self.getx_miss_sm.clone());
        parent.append_counter("PUTS", "Clean evictions (from lower level)", self.puts.clone());
        parent.append_counter("PUTX", "Dirty evictions (from lower level)", self.putx.clone());
        parent.append_counter("INV", "Invalidates (from upper level)", self.inv.clone());
        parent.append_counter("INVX", "Downgrades (from upper level)", self.invx.clone());
        parent.append_counter("FWD", "Forwards (from upper level)", self.fwd.clone());
        parent.append_counter("latGETnl", "GET request latency on next level", self.get_next_level_lat.clone());
        parent.append_counter("latGETnet", "GET request latency on network to next level", self.get_net_lat.clone());
    }
}

/// Bottom controller: this cache's MESI state toward its parents.
pub struct MesiBottomCc {
    state: Arc<[MesiEntry]>,
    parents: Vec<Arc<dyn MemObject>>,
    parent_rtts: Vec<u32>,
    self_id: u32,
    non_incl_hack: bool,
    pub lock: FutexLock,
    prof: BccProf,
}

impl MesiBottomCc {
    pub fn new(
        num_lines: u32,
        self_id: u32,
        non_incl_hack: bool,
        parents: Vec<Arc<dyn MemObject>>,
        parent_rtts: Vec<u32>,
    ) -> Self {
        assert!(!parents.is_empty());
        assert_eq!(parents.len(), parent_rtts.len());
        MesiBottomCc {
            state: (0..num_lines).map(|_| MesiEntry::default()).collect::<Vec<_>>().into(),
            parents,
            parent_rtts,
            self_id,
            non_incl_hack,
            lock: FutexLock::new(),
            prof: BccProf::new(),
        }
    }

    fn states(&self) -> Arc<[MesiEntry]> {
        Arc::clone(&self.state)
    }

    pub fn is_valid(&self, line_id: u32) -> bool {
        self.state[line_id as usize].is_valid()
    }

    pub fn is_exclusive(&self, line_id: u32) -> bool {
        self.state[line_id as usize].is_exclusive()
    }

    fn parent_id(&self, line_addr: Address) -> usize {
        (line_addr % self.parents.len() as u64) as usize
    }

    /// Issue a GET to the parent; the parent's top CC writes our new
    /// state through the request.
    fn fetch(
        &self,
        line_addr: Address,
        acc_type: AccessType,
        cycle: u64,
        src_id: u32,
        flags: AccessFlags,
        entry: &MesiEntry,
    ) -> u64 {
        let p = self.parent_id(line_addr);
        let mut req = MemReq {
            line_addr,
            acc_type,
            child_id: self.self_id,
            state: entry,
            cycle,
            child_lock: Some(&self.lock),
            initial_state: entry.get(),
            src_id,
            flags,
        };
        let next_level_lat = self.parents[p].access(&mut req) - cycle;
        let net_lat = self.parent_rtts[p] as u64;
        self.prof.get_next_level_lat.add(next_level_lat);
        self.prof.get_net_lat.add(net_lat);
        cycle + next_level_lat + net_lat
    }

    pub fn process_access(
        &self,
        line_addr: Address,
        line_id: u32,
        acc_type: AccessType,
        cycle: u64,
        src_id: u32,
        flags: AccessFlags,
    ) -> u64 {
        let entry = &self.state[line_id as usize];
        let mut resp_cycle = cycle;
        match acc_type {
            AccessType::Puts => {
                // Clean writeback from below; line must be resident.
                assert!(entry.is_valid());
                self.prof.puts.inc();
            }
            AccessType::Putx => {
                assert!(entry.is_valid());
                if entry.get() == MesiState::E {
                    // Silent transition to dirty; the data is now modified.
                    entry.set(MesiState::M);
                }
                self.prof.putx.inc();
            }
            AccessType::Gets => {
                if entry.get() == MesiState::I {
                    resp_cycle = self.fetch(line_addr, AccessType::Gets, cycle, src_id, flags, entry);
                    assert!(entry.is_valid());
                    self.prof.gets_miss.inc();
                } else {
                    self.prof.gets_hit.inc();
                }
            }
            AccessType::Getx => match entry.get() {
                MesiState::I => {
                    resp_cycle = self.fetch(line_addr, AccessType::Getx, cycle, src_id, flags, entry);
                    assert_eq!(entry.get(), MesiState::M);
                    self.prof.getx_miss_im.inc();
                }
                MesiState::S => {
                    // Upgrade miss: the parent invalidates the other
                    // sharers and grants M.
                    resp_cycle = self.fetch(line_addr, AccessType::Getx, cycle, src_id, flags, entry);
                    assert_eq!(entry.get(), MesiState::M);
                    self.prof.getx_miss_sm.inc();
                }
                MesiState::E => {
                    entry.set(MesiState::M);
                    self.prof.getx_hit.inc();
                }
                MesiState::M => {
                    self.prof.getx_hit.inc();
                }
            },
        }
        resp_cycle
    }

    /// Write the evicted line back to the parent if it needs it.
    pub fn process_eviction(
        &self,
        wb_line_addr: Address,
        line_id: u32,
        lower_level_writeback: bool,
        cycle: u64,
        src_id: u32,
    ) -> u64 {
        let entry = &self.state[line_id as usize];
        if lower_level_writeback {
            // An invalidation below surfaced dirty data; the writeback
            // must carry it even if our copy was clean.
            assert!(entry.is_valid());
            entry.set(MesiState::M);
        }
        let mut resp_cycle = cycle;
        match entry.get() {
            MesiState::I => {} // nothing to do
            MesiState::S | MesiState::E => {
                resp_cycle = self.put(wb_line_addr, AccessType::Puts, cycle, src_id, entry);
            }
            MesiState::M => {
                resp_cycle = self.put(wb_line_addr, AccessType::Putx, cycle, src_id, entry);
            }
        }
        assert_eq!(entry.get(), MesiState::I);
        resp_cycle
    }

    fn put(
        &self,
        line_addr: Address,
        acc_type: AccessType,
        cycle: u64,
        src_id: u32,
        entry: &MesiEntry,
    ) -> u64 {
        let p = self.parent_id(line_addr);
        let mut req = MemReq {
            line_addr,
            acc_type,
            child_id: self.self_id,
            state: entry,
            cycle,
            child_lock: Some(&self.lock),
            initial_state: entry.get(),
            src_id,
            flags: AccessFlags::empty(),
        };
        self.parents[p].access(&mut req)
    }

    /// The top CC induced a writeback on an access (a downgraded child
    /// held dirty data); reflect that we now hold the line dirty.
    pub fn process_writeback_on_access(&self, line_id: u32, _acc_type: AccessType) {
        let entry = &self.state[line_id as usize];
        assert!(entry.is_valid());
        if entry.get() == MesiState::E {
            entry.set(MesiState::M);
        }
    }

    pub fn process_inval(&self, line_id: u32, inv_type: InvType, req_writeback: &mut bool) {
        let entry = &self.state[line_id as usize];
        let state = entry.get();
        assert!(state != MesiState::I, "invalidation of an invalid line");
        match inv_type {
            InvType::Fwd => {
                assert_eq!(state, MesiState::S, "FWD is only valid on S lines");
                self.prof.fwd.inc();
            }
            InvType::Invx => {
                assert!(entry.is_exclusive());
                if state == MesiState::M {
                    *req_writeback = true;
                }
                entry.set(MesiState::S);
                self.prof.invx.inc();
            }
            InvType::Inv => {
                if state == MesiState::M {
                    *req_writeback = true;
                }
                entry.set(MesiState::I);
                self.prof.inv.inc();
            }
        }
    }

    /// Pass a writeback through to the parent for a line we never
    /// recorded (non-inclusive operation only).
    pub fn process_non_inclusive_writeback(
        &self,
        line_addr: Address,
        acc_type: AccessType,
        cycle: u64,
        state: &MesiEntry,
        src_id: u32,
        flags: AccessFlags,
    ) -> u64 {
        assert!(self.non_incl_hack, "lost inclusion on line {line_addr:#x}");
        assert!(acc_type.is_put());
        let p = self.parent_id(line_addr);
        let mut req = MemReq {
            line_addr,
            acc_type,
            child_id: self.self_id,
            state,
            cycle,
            child_lock: Some(&self.lock),
            initial_state: state.get(),
            src_id,
            flags: flags | AccessFlags::NONINCLWB,
        };
        self.parents[p].access(&mut req)
    }
}

/// Top controller: directory state for the children below.
pub struct MesiTopCc {
    entries: Arc<[TopEntry]>,
    children: Vec<Arc<Cache>>,
    child_rtts: Vec<u32>,
    non_incl_hack: bool,
    pub lock: FutexLock,
}

impl MesiTopCc {
    pub fn new(
        num_lines: u32,
        non_incl_hack: bool,
        children: Vec<Arc<Cache>>,
        child_rtts: Vec<u32>,
    ) -> Self {
        assert!(children.len() <= MAX_CACHE_CHILDREN, "too many children for the sharer bitset");
        assert_eq!(children.len(), child_rtts.len());
        MesiTopCc {
            entries: (0..num_lines).map(|_| TopEntry::default()).collect::<Vec<_>>().into(),
            children,
            child_rtts,
            non_incl_hack,
            lock: FutexLock::new(),
        }
    }

    fn entries(&self) -> Arc<[TopEntry]> {
        Arc::clone(&self.entries)
    }

    pub fn num_sharers(&self, line_id: u32) -> u32 {
        self.entries[line_id as usize].num_sharers()
    }

    /// Send invalidations or downgrades for a line to the sharing
    /// children, except `skip_child` (the requester on a GETX). Returns
    /// the completion cycle and whether dirty data surfaced.
    fn send_invalidates(
        &self,
        line_addr: Address,
        line_id: u32,
        inv_type: InvType,
        skip_child: Option<u32>,
        cycle: u64,
        src_id: u32,
    ) -> (u64, bool) {
        let e = &self.entries[line_id as usize];
        let mut max_cycle = cycle;
        let mut writeback = false;
        if inv_type == InvType::Invx && !e.is_exclusive() {
            // Nothing below holds exclusive permission; no downgrade
            // traffic needed.
            return (max_cycle, false);
        }
        for c in e.sharer_ids() {
            if skip_child == Some(c) {
                continue;
            }
            let req = InvReq {
                line_addr,
                inv_type,
                cycle,
                src_id,
            };
            let mut child_wb = false;
            let resp = self.children[c as usize].invalidate(&req, &mut child_wb);
            max_cycle = max_cycle.max(resp + self.child_rtts[c as usize] as u64);
            writeback |= child_wb;
            if inv_type == InvType::Inv {
                e.remove(c);
            }
        }
        (max_cycle, writeback)
    }

    /// Invalidate all children for an eviction of `wb_line_addr`.
    pub fn process_eviction(
        &self,
        wb_line_addr: Address,
        line_id: u32,
        cycle: u64,
        src_id: u32,
    ) -> (u64, bool) {
        let e = &self.entries[line_id as usize];
        if e.is_empty() {
            return (cycle, false);
        }
        let (resp, wb) =
            self.send_invalidates(wb_line_addr, line_id, InvType::Inv, None, cycle, src_id);
        e.clear();
        (resp, wb)
    }

    /// Directory side of an access: adjust the sharer set, invalidate or
    /// downgrade other children, and grant the requester its new state.
    /// `have_exclusive` says whether this cache itself holds the line in
    /// E/M; without it, a GETS can only be granted S.
    #[allow(clippy::too_many_arguments)]
    pub fn process_access(
        &self,
        line_addr: Address,
        line_id: u32,
        acc_type: AccessType,
        child_id: u32,
        have_exclusive: bool,
        child_state: &MesiEntry,
        cycle: u64,
        src_id: u32,
        flags: AccessFlags,
    ) -> (u64, bool) {
        let e = &self.entries[line_id as usize];
        let mut resp_cycle = cycle;
        let mut induced_wb = false;
        match acc_type {
            AccessType::Puts | AccessType::Putx => {
                if !e.has(child_id) {
                    // A PUT from a child we never recorded: legal only in
                    // non-inclusive operation.
                    assert!(
                        self.non_incl_hack,
                        "PUT from child {child_id} with no sharer record for {line_addr:#x}"
                    );
                    child_state.set(MesiState::I);
                } else if acc_type == AccessType::Putx && flags.contains(AccessFlags::PUTX_KEEPEXCL)
                {
                    // Pure writeback: the child keeps the line, clean.
                    assert!(e.is_exclusive());
                    child_state.set(MesiState::E);
                } else {
                    e.remove(child_id);
                    if e.is_empty() {
                        e.set_exclusive(false);
                    }
                    child_state.set(MesiState::I);
                }
            }
            AccessType::Gets => {
                if e.is_empty() {
                    if flags.contains(AccessFlags::NOEXCL) || !have_exclusive {
                        e.add(child_id);
                        child_state.set(MesiState::S);
                    } else {
                        e.set_exclusive(true);
                        e.add(child_id);
                        child_state.set(MesiState::E);
                    }
                } else if e.is_exclusive() {
                    // Downgrade the owner, then share.
                    let (c, wb) = self.send_invalidates(
                        line_addr,
                        line_id,
                        InvType::Invx,
                        None,
                        cycle,
                        src_id,
                    );
                    resp_cycle = c;
                    induced_wb = wb;
                    e.set_exclusive(false);
                    e.add(child_id);
                    child_state.set(MesiState::S);
                } else {
                    e.add(child_id);
                    child_state.set(MesiState::S);
                }
            }
            AccessType::Getx => {
                if !e.is_empty() && !(e.has(child_id) && e.num_sharers() == 1) {
                    // Invalidate every other sharer.
                    let (c, wb) = self.send_invalidates(
                        line_addr,
                        line_id,
                        InvType::Inv,
                        Some(child_id),
                        cycle,
                        src_id,
                    );
                    resp_cycle = c;
                    induced_wb = wb;
                }
                e.clear();
                e.add(child_id);
                e.set_exclusive(true);
                child_state.set(MesiState::M);
            }
        }
        (resp_cycle, induced_wb)
    }

    /// Forward an invalidation from above to the children.
    pub fn process_inval(
        &self,
        line_addr: Address,
        line_id: u32,
        inv_type: InvType,
        cycle: u64,
        src_id: u32,
    ) -> (u64, bool) {
        let e = &self.entries[line_id as usize];
        match inv_type {
            InvType::Fwd => (cycle, false), // directory read; children keep their copies
            InvType::Invx => {
                let (resp, wb) =
                    self.send_invalidates(line_addr, line_id, InvType::Invx, None, cycle, src_id);
                e.set_exclusive(false);
                (resp, wb)
            }
            InvType::Inv => {
                let (resp, wb) =
                    self.send_invalidates(line_addr, line_id, InvType::Inv, None, cycle, src_id);
                e.clear();
                (resp, wb)
            }
        }
    }
}

/// Resolve a race with an intervening invalidation. This is the ONLY code
/// that deals with coherence races; the controllers assume the situation
/// is stable once both locks are held. May rewrite the request type.
/// Returns true when the access should be skipped entirely.
pub fn check_mesi_race(req: &mut MemReq) -> bool {
    let state = req.state.get();
    if state == req.initial_state {
        return false;
    }
    match req.acc_type {
        AccessType::Puts | AccessType::Putx => {
            if state == MesiState::I {
                // Already invalidated; the eviction is moot.
                true
            } else {
                // Downgraded under us; the PUT proceeds, but the line is
                // no longer exclusive.
                assert_eq!(state, MesiState::S);
                if req.acc_type == AccessType::Putx {
                    req.acc_type = AccessType::Puts;
                }
                false
            }
        }
        AccessType::Getx => {
            // The line was S and got invalidated: still a valid GETX,
            // just not an upgrade miss anymore.
            assert_eq!(req.initial_state, MesiState::S);
            assert_eq!(state, MesiState::I);
            false
        }
        AccessType::Gets => {
            panic!("GETS raced with an invalidation (line {:#x})", req.line_addr)
        }
    }
}

/// Integrated controller: the terminal variant has no children and never
/// sees PUTs from below.
pub enum CoherenceCtrl {
    Full(MesiCc),
    Terminal(MesiCc),
}

pub struct MesiCc {
    name: String,
    num_lines: u32,
    non_incl_hack: bool,
    bcc: OnceLock<MesiBottomCc>,
    tcc: OnceLock<MesiTopCc>,
}

impl CoherenceCtrl {
    pub fn full(name: impl Into<String>, num_lines: u32, non_incl_hack: bool) -> Self {
        CoherenceCtrl::Full(MesiCc {
            name: name.into(),
            num_lines,
            non_incl_hack,
            bcc: OnceLock::new(),
            tcc: OnceLock::new(),
        })
    }

    pub fn terminal(name: impl Into<String>, num_lines: u32) -> Self {
        CoherenceCtrl::Terminal(MesiCc {
            name: name.into(),
            num_lines,
            non_incl_hack: false,
            bcc: OnceLock::new(),
            tcc: OnceLock::new(),
        })
    }

    fn inner(&self) -> &MesiCc {
        match self {
            CoherenceCtrl::Full(cc) | CoherenceCtrl::Terminal(cc) => cc,
        }
    }

    fn bcc(&self) -> &MesiBottomCc {
        self.inner().bcc.get().expect("parents not set")
    }

    fn tcc(&self) -> Option<&MesiTopCc> {
        match self {
            CoherenceCtrl::Full(cc) => Some(cc.tcc.get().expect("children not set")),
            CoherenceCtrl::Terminal(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner().name
    }

    pub fn set_parents(
        &self,
        child_id: u32,
        parents: Vec<Arc<dyn MemObject>>,
        parent_rtts: Vec<u32>,
    ) {
        let cc = self.inner();
        let bcc = MesiBottomCc::new(cc.num_lines, child_id, cc.non_incl_hack, parents, parent_rtts);
        if cc.bcc.set(bcc).is_err() {
            panic!("[{}] parents already set", cc.name);
        }
    }

    pub fn set_children(&self, children: Vec<Arc<Cache>>, child_rtts: Vec<u32>) {
        match self {
            CoherenceCtrl::Full(cc) => {
                let tcc = MesiTopCc::new(cc.num_lines, cc.non_incl_hack, children, child_rtts);
                if cc.tcc.set(tcc).is_err() {
                    panic!("[{}] children already set", cc.name);
                }
            }
            CoherenceCtrl::Terminal(cc) => {
                panic!("[{}] terminal caches cannot have children", cc.name)
            }
        }
    }

    /// Lock-free state view for the replacement policy.
    pub fn view(&self) -> CcView {
        self.try_view().expect("controller not fully wired")
    }

    pub fn init_stats(&self, parent: &mut StatGroup) {
        self.bcc().prof.init_stats(parent);
    }

    /// Initial locking and race resolution; returns true if the access
    /// should be skipped. May rewrite the request.
    pub fn start_access(&self, req: &mut MemReq) -> bool {
        match self {
            CoherenceCtrl::Full(_) => {}
            CoherenceCtrl::Terminal(_) => {
                assert!(req.acc_type.is_get(), "terminal cache got a {}", req.acc_type)
            }
        }
        // Hand-over-hand only goes downward: release the child before
        // taking our own locks, accepting (and resolving) the races this
        // opens.
        if let Some(cl) = req.child_lock {
            cl.unlock();
        }
        if let Some(tcc) = self.tcc() {
            tcc.lock.lock();
        }
        self.bcc().lock.lock();
        check_mesi_race(req)
    }

    /// Relock the child (if any) before releasing our own locks.
    pub fn end_access(&self, req: &MemReq) {
        if let Some(cl) = req.child_lock {
            cl.lock();
        }
        self.bcc().lock.unlock();
        if let Some(tcc) = self.tcc() {
            tcc.lock.unlock();
        }
    }

    /// Whether a missing line should be allocated. PUT misses mean lost
    /// inclusion, fatal unless non-inclusive operation is allowed.
    pub fn should_allocate(&self, req: &MemReq) -> bool {
        if req.acc_type.is_get() {
            return true;
        }
        match self {
            CoherenceCtrl::Full(cc) => {
                if !cc.non_incl_hack {
                    panic!(
                        "[{}] lost inclusion on line {:#x}, type {}, childId {}, childState {}",
                        cc.name,
                        req.line_addr,
                        req.acc_type,
                        req.child_id,
                        req.state.get()
                    );
                }
                false
            }
            CoherenceCtrl::Terminal(cc) => {
                panic!("[{}] terminal cache received a PUT", cc.name)
            }
        }
    }

    pub fn process_eviction(
        &self,
        trigger: &MemReq,
        wb_line_addr: Address,
        line_id: u32,
        start_cycle: u64,
    ) -> u64 {
        let mut lower_level_wb = false;
        let mut cycle = start_cycle;
        if let Some(tcc) = self.tcc() {
            let (c, wb) = tcc.process_eviction(wb_line_addr, line_id, start_cycle, trigger.src_id);
            cycle = c;
            lower_level_wb = wb;
        }
        self.bcc()
            .process_eviction(wb_line_addr, line_id, lower_level_wb, cycle, trigger.src_id)
    }

    pub fn process_access(&self, req: &MemReq, line_id: Option<u32>, start_cycle: u64) -> u64 {
        let bcc = self.bcc();
        let non_incl_wb =
            line_id.is_none() || (req.acc_type.is_put() && !bcc.is_valid(line_id.unwrap()));
        if non_incl_wb {
            // Only a non-inclusive writeback can miss here; bypass to the
            // parent.
            assert!(req.acc_type.is_put());
            return bcc.process_non_inclusive_writeback(
                req.line_addr,
                req.acc_type,
                start_cycle,
                req.state,
                req.src_id,
                req.flags,
            );
        }
        let line_id = line_id.unwrap();

        // Prefetches only touch the bottom CC; the demand access will
        // pull the line further down. The flag never propagates up.
        let is_prefetch = req.is(AccessFlags::PREFETCH);
        assert!(!is_prefetch || req.acc_type == AccessType::Gets);
        let flags = req.flags - AccessFlags::PREFETCH;

        let mut resp_cycle = bcc.process_access(
            req.line_addr,
            line_id,
            req.acc_type,
            start_cycle,
            req.src_id,
            flags,
        );
        if let Some(tcc) = self.tcc() {
            if !is_prefetch {
                let (c, induced_wb) = tcc.process_access(
                    req.line_addr,
                    line_id,
                    req.acc_type,
                    req.child_id,
                    bcc.is_exclusive(line_id),
                    req.state,
                    resp_cycle,
                    req.src_id,
                    flags,
                );
                resp_cycle = c;
                if induced_wb {
                    bcc.process_writeback_on_access(line_id, req.acc_type);
                }
            }
        }
        resp_cycle
    }

    /// Invalidations lock only the bottom CC: the top lock serializes
    /// upward accesses, and those already hold the bottom lock when they
    /// touch directory state.
    pub fn start_inv(&self) {
        self.bcc().lock.lock();
    }

    pub fn process_inv(
        &self,
        req: &InvReq,
        line_id: Option<u32>,
        writeback: &mut bool,
        start_cycle: u64,
    ) -> u64 {
        let mut resp_cycle = start_cycle;
        if let Some(line_id) = line_id {
            if let Some(tcc) = self.tcc() {
                let (c, wb) =
                    tcc.process_inval(req.line_addr, line_id, req.inv_type, start_cycle, req.src_id);
                resp_cycle = c;
                *writeback |= wb;
            }
            self.bcc().process_inval(line_id, req.inv_type, writeback);
        } else {
            assert!(
                self.inner().non_incl_hack,
                "[{}] invalidation for a line not present",
                self.inner().name
            );
        }
        self.bcc().lock.unlock();
        resp_cycle
    }

    pub fn num_sharers(&self, line_id: u32) -> u32 {
        self.tcc().map_or(0, |t| t.num_sharers(line_id))
    }

    pub fn is_valid(&self, line_id: u32) -> bool {
        self.bcc().is_valid(line_id)
    }

    pub fn is_exclusive(&self, line_id: u32) -> bool {
        self.bcc().is_exclusive(line_id)
    }

    pub fn state(&self, line_id: u32) -> MesiState {
        self.bcc().state[line_id as usize].get()
    }

    /// Like [`CoherenceCtrl::view`], but `None` until both sides of the
    /// controller are wired.
    pub fn try_view(&self) -> Option<CcView> {
        let bcc = self.inner().bcc.get()?;
        let top = match self {
            CoherenceCtrl::Full(cc) => Some(cc.tcc.get()?.entries()),
            CoherenceCtrl::Terminal(_) => None,
        };
        Some(CcView {
            mesi: bcc.states(),
            top,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race_req<'a>(
        entry: &'a MesiEntry,
        acc_type: AccessType,
        initial: MesiState,
    ) -> MemReq<'a> {
        MemReq {
            line_addr: 0x40,
            acc_type,
            child_id: 0,
            state: entry,
            cycle: 0,
            child_lock: None,
            initial_state: initial,
            src_id: 0,
            flags: AccessFlags::empty(),
        }
    }

    #[test]
    fn put_after_invalidation_is_skipped() {
        let entry = MesiEntry::new(MesiState::I);
        let mut req = race_req(&entry, AccessType::Putx, MesiState::M);
        assert!(check_mesi_race(&mut req));
    }

    #[test]
    fn putx_after_downgrade_becomes_puts() {
        let entry = MesiEntry::new(MesiState::S);
        let mut req = race_req(&entry, AccessType::Putx, MesiState::M);
        assert!(!check_mesi_race(&mut req));
        assert_eq!(req.acc_type, AccessType::Puts);
    }

    #[test]
    fn getx_losing_upgrade_race_stays_a_miss() {
        let entry = MesiEntry::new(MesiState::I);
        let mut req = race_req(&entry, AccessType::Getx, MesiState::S);
        assert!(!check_mesi_race(&mut req));
        assert_eq!(req.acc_type, AccessType::Getx);
    }

    #[test]
    fn no_race_passes_through() {
        let entry = MesiEntry::new(MesiState::I);
        let mut req = race_req(&entry, AccessType::Gets, MesiState::I);
        assert!(!check_mesi_race(&mut req));
    }

    #[test]
    #[should_panic(expected = "GETS raced")]
    fn gets_race_is_a_bug() {
        let entry = MesiEntry::new(MesiState::S);
        let mut req = race_req(&entry, AccessType::Gets, MesiState::I);
        check_mesi_race(&mut req);
    }

    #[test]
    fn top_entry_sharer_bookkeeping() {
        let e = TopEntry::default();
        assert!(e.is_empty());
        e.add(3);
        e.add(17);
        assert_eq!(e.num_sharers(), 2);
        assert!(e.has(3) && e.has(17) && !e.has(4));
        assert_eq!(e.sharer_ids().collect::<Vec<_>>(), vec![3, 17]);
        e.set_exclusive(true);
        assert!(!e.is_exclusive(), "two sharers can never be exclusive");
        e.remove(17);
        assert!(e.is_exclusive());
        e.clear();
        assert!(e.is_empty() && e.num_sharers() == 0);
    }
}
