pub mod config;
pub mod events;
pub mod job;
pub mod queue;
pub mod registry;
pub mod sandbox;
pub mod worker;
