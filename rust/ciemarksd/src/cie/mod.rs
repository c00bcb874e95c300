//! CIE marks lifecycle: record store, lock aggregation, write gate, review
//! state machine, audit journal and notification hand-off.

pub mod access;
pub mod aggregate;
pub mod audit;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod notify;
pub mod roster;
pub mod store;
pub mod types;
