use crate::Key;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding the default namespace directory.
pub const SHM_DIR_ENV: &str = "SLUICE_SHM_DIR";

/// Directory in which keyed segments live.
///
/// Processes must agree on the namespace as well as the key; two rings with
/// the same key in different directories are unrelated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    dir: PathBuf,
}

impl ShmNamespace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$SLUICE_SHM_DIR`, else `/dev/shm`, else the OS temp directory.
    pub fn from_env() -> Self {
        if let Some(dir) = env::var_os(SHM_DIR_ENV) {
            return Self::new(dir);
        }
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            Self::new(shm)
        } else {
            Self::new(env::temp_dir())
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backing file of the segment with `key`.
    pub fn path_of(&self, key: Key) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn exists(&self, key: Key) -> bool {
        self.path_of(key).exists()
    }
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::from_env()
    }
}
