use serde::Deserialize;
use sluice_ipc::{Key, MAX_READERS, RingConfig, ShmNamespace};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SluiceConfig {
    /// Namespace directory; `$SLUICE_SHM_DIR` or `/dev/shm` when unset.
    #[serde(default)]
    pub shm_dir: Option<PathBuf>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "defaults::viewer_poll_ms")]
    pub viewer_poll_ms: u64,
    #[serde(default)]
    pub data: DataRingConfig,
    #[serde(default)]
    pub header: HeaderRingConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DataRingConfig {
    /// Base key in hex.
    #[serde(default = "defaults::key")]
    pub key: String,
    #[serde(default = "defaults::data_nbufs")]
    pub nbufs: u64,
    #[serde(default = "defaults::data_bufsz")]
    pub bufsz: u64,
    #[serde(default = "defaults::readers")]
    pub readers: usize,
    /// Accelerator device; omit for host memory.
    #[serde(default)]
    pub device: Option<i32>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HeaderRingConfig {
    #[serde(default = "defaults::header_nbufs")]
    pub nbufs: u64,
    #[serde(default = "defaults::header_bufsz")]
    pub bufsz: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn viewer_poll_ms() -> u64 {
        100
    }

    pub fn key() -> String {
        "dada".into()
    }

    pub fn data_nbufs() -> u64 {
        4
    }

    pub fn data_bufsz() -> u64 {
        4096 * 128
    }

    pub fn readers() -> usize {
        1
    }

    pub fn header_nbufs() -> u64 {
        8
    }

    pub fn header_bufsz() -> u64 {
        4096
    }
}

impl Default for DataRingConfig {
    fn default() -> Self {
        Self {
            key: defaults::key(),
            nbufs: defaults::data_nbufs(),
            bufsz: defaults::data_bufsz(),
            readers: defaults::readers(),
            device: None,
        }
    }
}

impl Default for HeaderRingConfig {
    fn default() -> Self {
        Self {
            nbufs: defaults::header_nbufs(),
            bufsz: defaults::header_bufsz(),
        }
    }
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            shm_dir: None,
            log_level: defaults::log_level(),
            log_file: None,
            viewer_poll_ms: defaults::viewer_poll_ms(),
            data: DataRingConfig::default(),
            header: HeaderRingConfig::default(),
        }
    }
}

impl SluiceConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    /// Parses and validates config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: SluiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.key()?;
        let d = &self.data;
        if d.nbufs == 0 || d.bufsz == 0 {
            return Err(ConfigError::Invalid("data ring needs non-zero nbufs and bufsz".into()));
        }
        if d.readers > MAX_READERS {
            return Err(ConfigError::Invalid(format!(
                "{} readers requested, at most {MAX_READERS} supported",
                d.readers
            )));
        }
        if self.header.nbufs == 0 || self.header.bufsz == 0 {
            return Err(ConfigError::Invalid("header ring needs non-zero nbufs and bufsz".into()));
        }
        Ok(())
    }

    pub fn key(&self) -> Result<Key, ConfigError> {
        self.data
            .key
            .parse()
            .map_err(|e: sluice_ipc::ParseKeyError| ConfigError::Invalid(e.to_string()))
    }

    pub fn namespace(&self) -> ShmNamespace {
        match &self.shm_dir {
            Some(dir) => ShmNamespace::new(dir),
            None => ShmNamespace::from_env(),
        }
    }

    pub fn viewer_poll(&self) -> Duration {
        Duration::from_millis(self.viewer_poll_ms)
    }

    /// Geometry of the data ring. Call on a validated config.
    pub fn data_ring(&self) -> RingConfig {
        let mut cfg = RingConfig::new(self.data.nbufs, self.data.bufsz).readers(self.data.readers);
        if let Some(device) = self.data.device {
            cfg = cfg.on_device(device);
        }
        cfg
    }

    /// Geometry of the header ring, with as many readers as the data ring.
    pub fn header_ring(&self) -> RingConfig {
        RingConfig::new(self.header.nbufs, self.header.bufsz).readers(self.data.readers)
    }
}
