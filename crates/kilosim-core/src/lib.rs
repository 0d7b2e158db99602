//! # kilosim-core
//!
//! Execution-driven microarchitectural simulation of thousand-core chip
//! multiprocessors.
//!
//! The simulator alternates two phases. In the **bound phase**, one host
//! thread per simulated core advances an uncontended core model through a
//! fixed number of cycles, issuing memory accesses synchronously into a
//! MESI-coherent cache hierarchy; a barrier with join/leave semantics and
//! parallelism control gates the population. In the **weave phase**, a
//! single event-driven scheduler replays the recorded memory events
//! through the shared memory system (an FR-FCFS DDR3 controller with full
//! device timing), turning uncontended estimates into contended response
//! cycles.
//!
//! ## Quick start
//!
//! ```no_run
//! use kilosim_core::config::Config;
//! use kilosim_core::sim::Simulator;
//!
//! let cfg = Config::from_file(std::path::Path::new("sim.toml")).unwrap();
//! let sim = Simulator::from_config(&cfg).unwrap();
//! let summary = sim.run();
//! println!("{} phases, {} instructions", summary.phases, summary.instrs);
//! ```
//!
//! ## Layout
//!
//! - [`barrier`] — phase barrier with join/leave and parallelism control
//! - [`cache`] — arrays (set-associative, ZCache), MESI controllers,
//!   replacement and partitioning policies, utility monitors
//! - [`ddr`] — DDR3 memory controller with FR-FCFS scheduling
//! - [`event`], [`weave`], [`slab`] — phase events, contention replay,
//!   and the slab arena backing it
//! - [`config`], [`stats`], [`trace`], [`network`] — typed configuration,
//!   counter trees, access traces, fixed-delay network model
//! - [`sim`] — system construction and the phase loop

pub mod barrier;
pub mod cache;
pub mod config;
pub mod ddr;
pub mod event;
pub mod hash;
pub mod locks;
pub mod mem;
pub mod network;
pub mod sim;
pub mod slab;
pub mod stats;
pub mod trace;
pub mod weave;

pub use barrier::{Barrier, BarrierSnapshot, PhaseEnd, SyncOutcome, ThreadState};
pub use cache::Cache;
pub use config::{Config, ConfigError};
pub use ddr::DdrMemory;
pub use mem::{AccessFlags, AccessType, Address, InvType, MemObject, MemReq, MesiState};
pub use sim::{SimSummary, Simulator};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
