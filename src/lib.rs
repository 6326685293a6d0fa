pub mod config;
pub mod errors;
pub mod foreman_config;
pub mod liveness;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod review;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod state;
pub mod tracker;
pub mod util;
