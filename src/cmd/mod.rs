//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `convert` | `Convert`        |
//! | `config`  | `Config`         |
//! | `audit`   | `Audit`          |

pub mod audit;
pub mod config;
pub mod convert;
pub mod serve;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use convert::cmd_convert;
pub use serve::cmd_serve;
