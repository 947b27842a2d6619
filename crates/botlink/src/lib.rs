pub mod cli;
pub mod config;
pub mod engine;
pub mod shutdown;
pub mod store;
pub mod tracing_init;

// process roles
pub mod gateway;
pub mod session;
pub mod supervisor;
pub mod worker;
