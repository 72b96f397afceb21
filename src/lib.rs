//! Coordination primitives for a fleet of agents sharing one repository:
//! durable mail, a port-range allocator, a background process registry and
//! agent lifecycle management over git worktrees.

pub mod agent;
pub mod build_info;
pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod logging;
pub mod os;
pub mod output;
pub mod store;
