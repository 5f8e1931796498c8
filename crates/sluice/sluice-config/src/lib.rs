mod config;

pub use config::{ConfigError, DataRingConfig, HeaderRingConfig, SluiceConfig};
