//! Worker side of taskhive: the per-instance control loop and the state
//! machine that keeps its transitions honest.

pub mod agent_loop;
pub mod state_machine;
