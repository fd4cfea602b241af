//! Virtual network emulation on Linux network namespaces.
//!
//! A scenario is a [`topology::Topology`] of hosts, switches and routers plus an ordered list of
//! control-plane [`scenario::Action`]s. An [`Emulation`] realizes it on the host: one network
//! namespace per node, one veth pair per link, a bridge per switch, then static routes and
//! link shaping. [`Emulation::teardown`] removes everything it created.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod command;
pub mod console;
pub mod control;
pub mod emulation;
pub mod error;
pub mod fabric;
pub mod ip;
pub mod netem;
pub mod runtime;
pub mod scenario;
pub mod shutdown;
pub mod sysctl;
pub mod topology;

pub use command::{Backend, LinuxBackend, RecordingBackend};
pub use emulation::{Emulation, EmulationConfig};
pub use error::Error;
pub use scenario::{Params, ScenarioRegistry, BUILTIN_SCENARIOS};
pub use shutdown::Shutdown;
