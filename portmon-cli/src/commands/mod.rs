//! Command implementations for the portmon CLI

pub mod replay;
pub mod stress;
pub mod watch;
