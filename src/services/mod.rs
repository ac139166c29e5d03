//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `current_store` - live "current values" view keyed by (line, unit, object, param)
//! - `decider` - publication decision engine (on-change/interval/hysteresis)
//! - `bus_worker` - per-bus poll loop (plan, read, decode, decide, publish)
//! - `reload` - hot-reload controller (atomic stop/rebuild/start of bus workers)

pub mod bus_worker;
pub mod current_store;
pub mod decider;
pub mod reload;

// Re-export commonly used types
pub use bus_worker::{BusWorker, WriteCommand};
pub use current_store::{CurrentStore, ParamKey, ParamState};
pub use decider::{decide, Decision, DeciderState, PublishIntent};
pub use reload::HotReloadController;
