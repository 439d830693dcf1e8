pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod project;
pub mod result;
pub mod role;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod wire;
