pub mod config;
pub mod dns;
pub mod mitm;
pub mod passthrough;
pub mod persist;
pub mod stats;
pub mod tracker;
