//! Type and interface definitions shared by all memory hierarchy objects.
//!
//! Requests ([`MemReq`]) travel from lower to upper levels of the hierarchy
//! (core → L1 → L2 → memory); invalidations ([`InvReq`]) travel the other
//! way. Coherence state lives in per-line [`MesiEntry`] atomics so that a
//! child can hand its parent a reference to its own state entry while the
//! parent resolves coherence races centrally.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::locks::FutexLock;

/// Plain 64-bit machine address. Cache operations take *line* addresses,
/// i.e. the address shifted right by the line-size bits.
pub type Address = u64;

/// Request types that proceed from lower to upper levels of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Get line, exclusive permission not needed (processor load).
    Gets,
    /// Get line, exclusive permission needed (store or atomic).
    Getx,
    /// Clean writeback (lower cache evicts an unmodified line).
    Puts,
    /// Dirty writeback (lower cache evicts a modified line).
    Putx,
}

impl AccessType {
    pub fn is_get(self) -> bool {
        matches!(self, AccessType::Gets | AccessType::Getx)
    }

    pub fn is_put(self) -> bool {
        matches!(self, AccessType::Puts | AccessType::Putx)
    }

    /// Stable wire encoding used by trace files.
    pub fn to_u16(self) -> u16 {
        match self {
            AccessType::Gets => 0,
            AccessType::Getx => 1,
            AccessType::Puts => 2,
            AccessType::Putx => 3,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(AccessType::Gets),
            1 => Some(AccessType::Getx),
            2 => Some(AccessType::Puts),
            3 => Some(AccessType::Putx),
            _ => None,
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Gets => write!(f, "GETS"),
            AccessType::Getx => write!(f, "GETX"),
            AccessType::Puts => write!(f, "PUTS"),
            AccessType::Putx => write!(f, "PUTX"),
        }
    }
}

/// Invalidation types, issued from upper to lower levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    /// Fully invalidate the line.
    Inv,
    /// Downgrade: drop exclusive access, a non-exclusive copy may stay.
    Invx,
    /// Send up the data without invalidating. Only valid on S lines.
    Fwd,
}

impl fmt::Display for InvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvType::Inv => write!(f, "INV"),
            InvType::Invx => write!(f, "INVX"),
            InvType::Fwd => write!(f, "FWD"),
        }
    }
}

/// Coherence states of the MESI protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MesiState {
    I = 0,
    S = 1,
    E = 2,
    M = 3,
}

impl MesiState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MesiState::I,
            1 => MesiState::S,
            2 => MesiState::E,
            3 => MesiState::M,
            _ => panic!("invalid MESI encoding {v}"),
        }
    }
}

impl fmt::Display for MesiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MesiState::I => write!(f, "I"),
            MesiState::S => write!(f, "S"),
            MesiState::E => write!(f, "E"),
            MesiState::M => write!(f, "M"),
        }
    }
}

/// A per-line MESI state cell.
///
/// Stored atomically so that a parent may write a child's state through a
/// shared reference during an upward access while invalidations race in.
/// All writes happen under the owning controller's lock; the atomic only
/// makes the cross-level sharing well-defined, it is not a synchronization
/// point by itself.
#[derive(Debug)]
pub struct MesiEntry(AtomicU8);

impl MesiEntry {
    pub fn new(s: MesiState) -> Self {
        MesiEntry(AtomicU8::new(s as u8))
    }

    pub fn get(&self) -> MesiState {
        MesiState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, s: MesiState) {
        self.0.store(s as u8, Ordering::Relaxed);
    }

    pub fn is_valid(&self) -> bool {
        self.get() != MesiState::I
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.get(), MesiState::E | MesiState::M)
    }
}

impl Default for MesiEntry {
    fn default() -> Self {
        MesiEntry::new(MesiState::I)
    }
}

bitflags! {
    /// Request flags. Flags propagate across levels, though not to
    /// evictions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Instruction fetch. Informative; ifetches should also set NOEXCL.
        const IFETCH = 1 << 1;
        /// Do not hand back E on a GETS (MSI behavior for this line).
        const NOEXCL = 1 << 2;
        /// Non-inclusive writeback: do not assume the line was recorded
        /// at the lower level.
        const NONINCLWB = 1 << 3;
        /// Non-relinquishing PUTX: keep the requester's E state instead of
        /// clearing its sharer bit (a pure writeback).
        const PUTX_KEEPEXCL = 1 << 4;
        /// Prefetch GETS. Only set at the level that issues the prefetch.
        const PREFETCH = 1 << 5;
    }
}

/// A memory request, built by a child and handed to one of its parents.
///
/// `state` points into the child's own line-state array; the parent's top
/// controller writes the child's new state through it. `initial_state` is
/// the state sampled when the request was built; a mismatch at the parent
/// means an invalidation raced in and is resolved in `start_access`.
pub struct MemReq<'a> {
    pub line_addr: Address,
    pub acc_type: AccessType,
    pub child_id: u32,
    pub state: &'a MesiEntry,
    /// Cycle at which the request arrives at the component.
    pub cycle: u64,
    /// Child's bottom-controller lock, released by the parent on entry and
    /// reacquired before the parent unlocks itself (hand-over-hand).
    pub child_lock: Option<&'a FutexLock>,
    pub initial_state: MesiState,
    /// Requester core id, used for event recording and contention.
    pub src_id: u32,
    pub flags: AccessFlags,
}

impl MemReq<'_> {
    pub fn is(&self, f: AccessFlags) -> bool {
        self.flags.contains(f)
    }
}

/// Invalidation or downgrade request, issued by a parent to a child.
#[derive(Debug, Clone, Copy)]
pub struct InvReq {
    pub line_addr: Address,
    pub inv_type: InvType,
    pub cycle: u64,
    pub src_id: u32,
}

/// Anything a cache can have as a parent: another cache or a memory
/// controller. Returns the response cycle.
pub trait MemObject: Send + Sync {
    fn access(&self, req: &mut MemReq) -> u64;
    fn name(&self) -> &str;
}

/// Fixed-latency memory, the simplest terminal parent. Useful as a main
/// memory stand-in when DDR timing is not under study.
pub struct SimpleMemory {
    latency: u64,
    name: String,
}

impl SimpleMemory {
    pub fn new(latency: u64, name: impl Into<String>) -> Self {
        SimpleMemory {
            latency,
            name: name.into(),
        }
    }
}

impl MemObject for SimpleMemory {
    fn access(&self, req: &mut MemReq) -> u64 {
        match req.acc_type {
            AccessType::Puts | AccessType::Putx => {
                req.state.set(MesiState::I);
                req.cycle
            }
            AccessType::Gets => {
                let s = if req.is(AccessFlags::NOEXCL) {
                    MesiState::S
                } else {
                    MesiState::E
                };
                req.state.set(s);
                req.cycle + self.latency
            }
            AccessType::Getx => {
                req.state.set(MesiState::M);
                req.cycle + self.latency
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_type_wire_roundtrip() {
        for t in [
            AccessType::Gets,
            AccessType::Getx,
            AccessType::Puts,
            AccessType::Putx,
        ] {
            assert_eq!(AccessType::from_u16(t.to_u16()), Some(t));
        }
        assert_eq!(AccessType::from_u16(9), None);
    }

    #[test]
    fn simple_memory_grants_states() {
        let mem = SimpleMemory::new(100, "mem");
        let entry = MesiEntry::default();
        let mut req = MemReq {
            line_addr: 0x40,
            acc_type: AccessType::Gets,
            child_id: 0,
            state: &entry,
            cycle: 7,
            child_lock: None,
            initial_state: MesiState::I,
            src_id: 0,
            flags: AccessFlags::empty(),
        };
        assert_eq!(mem.access(&mut req), 107);
        assert_eq!(entry.get(), MesiState::E);

        req.acc_type = AccessType::Getx;
        mem.access(&mut req);
        assert_eq!(entry.get(), MesiState::M);

        req.acc_type = AccessType::Gets;
        req.flags = AccessFlags::NOEXCL;
        mem.access(&mut req);
        assert_eq!(entry.get(), MesiState::S);
    }
}
