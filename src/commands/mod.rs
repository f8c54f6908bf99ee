mod config_cmd;
mod mirror;

pub use config_cmd::ConfigCommand;
pub use mirror::{check, run_service, SchemaCommand};
