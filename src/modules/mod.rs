pub mod config;
pub mod logger;

pub use config::{load_config_files, parse_config_documents, ConfigError};
pub use logger::{init_logger, LogLevel};
