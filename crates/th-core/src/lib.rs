//! Core of the taskhive orchestration engine.
//!
//! - [`store`]: SQLite-backed durable state (groups, tasks, dependencies,
//!   instances, events, id sequences)
//! - [`board`]: the scheduler proper (claiming, dependency resolution,
//!   failure cascade, cycle detection)
//! - [`instances`]: worker instance registration and liveness
//! - [`event_bus`]: in-process publish/subscribe with bounded history

pub mod board;
pub mod config;
pub mod event_bus;
pub mod instances;
pub mod store;
pub mod types;
