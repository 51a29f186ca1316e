//! Spindrift Mux
//!
//! The multiplexer engine. This crate drives sockets without knowing
//! what they are for:
//! - Readiness interests and poll events (`event`)
//! - The pluggable OS multiplexer behind a trait (`driver`)
//! - The self-pipe wake controller (`controller`)
//! - The two-phase detach coordinator (`detach`)
//! - The deadline-ordered timer queue (`timer`)
//! - The serial executor (`strand`)
//! - The readiness multiplexer (`reactor`) and the completion
//!   multiplexer (`proactor`)
//! - Worker threads and the placement scheduler (`worker`, `scheduler`)
//! - Engine configuration and the counters the engine maintains
//!   (`config`, `metrics`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod config;
pub mod controller;
pub mod detach;
pub mod driver;
pub mod event;
pub mod metrics;
pub mod proactor;
pub mod reactor;
pub mod scheduler;
pub mod strand;
pub mod timer;
pub mod worker;

pub mod prelude {
    pub use crate::config::{EngineConfig, LoadBalancing, ResolverConfig};
    pub use crate::detach::{DetachContext, DetachProgress, DetachState};
    pub use crate::driver::{create_driver, Driver};
    pub use crate::event::{Interest, PollEvent};
    pub use crate::proactor::{Completion, Proactor, ProactorSocket};
    pub use crate::reactor::{Reactor, ReactorSocket, Registration};
    pub use crate::scheduler::Scheduler;
    pub use crate::strand::{Executor, Strand};
    pub use crate::timer::{Timer, TimerCancel, TimerEvent, TimerQueue};
    pub use crate::worker::Worker;
}
