pub mod config;
pub mod cowork;
pub mod errors;
pub mod logging;
pub mod server;
pub mod util;
pub mod workflow;
