//! Harness: the seams between the orchestration engine and the outside
//! world.
//!
//! - [`executor`]: how a claimed task actually gets worked on
//! - [`routing`]: which follow-on tasks a finished or rejected task spawns
//! - [`shutdown`]: cooperative cancellation and drain coordination

pub mod executor;
pub mod routing;
pub mod shutdown;
