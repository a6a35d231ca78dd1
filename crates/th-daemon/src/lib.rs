//! The taskhive daemon: keeps a pool of agent loops running against the
//! board and corrects the board when workers die.
//!
//! - [`reconciler`]: orphan and stuck-blocked recovery sweeps
//! - [`autoscaler`]: per-role scale up/down policy
//! - [`pool`]: the set of running agent loops
//! - [`metrics`]: event-driven metrics
//! - [`daemon`]: wiring, background loops and graceful shutdown

pub mod autoscaler;
pub mod daemon;
pub mod metrics;
pub mod pool;
pub mod reconciler;
