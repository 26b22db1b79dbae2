//! The three selfserve services — request router, agent worker, and
//! integration dispatcher — sharing one binary and selected by
//! subcommand.

pub mod api;
pub mod cors;
pub mod dispatcher;
pub mod state;
pub mod turn_queue;
pub mod worker;
