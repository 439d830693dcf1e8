pub mod engine;
pub mod event_bus;
pub mod git;
pub mod housekeeping;
pub mod http_store;
pub mod instructions;
pub mod review;
pub mod scheduler;
pub mod steps;
pub mod subprocess;
pub mod worker;
pub mod worktree;
