pub mod audit;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod oracle;
pub mod pipeline;
pub mod server;
