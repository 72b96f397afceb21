pub mod agents;
pub mod atomic;
pub mod lock;
pub mod mail;
pub mod ports;
pub mod processes;
pub mod repo;
