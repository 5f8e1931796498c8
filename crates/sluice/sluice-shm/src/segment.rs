use crate::{Key, ShmError, ShmNamespace};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A keyed, file-backed shared memory segment mapped read-write.
///
/// Dropping a `Segment` only unmaps it; the backing file (and therefore the
/// data) survives until [`Segment::remove`] is called by someone.
pub struct Segment {
    key: Key,
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
}

impl Segment {
    /// Creates a new zero-filled segment of `size` bytes.
    ///
    /// # Errors
    /// [`ShmError::Exists`] if `key` is already in use in `ns`, or
    /// [`ShmError::Create`] if the file cannot be sized or mapped.
    pub fn create(ns: &ShmNamespace, key: Key, size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::Invalid {
                key,
                reason: "zero-sized segment",
            });
        }

        let path = ns.path_of(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => ShmError::Exists { key },
                _ => ShmError::Create { key, size, source },
            })?;

        let mapped = file
            .set_len(size as u64)
            // SAFETY: the file was created exclusively above and is sized to
            // `size`; nobody else can have truncated it yet.
            .and_then(|_| unsafe { MmapMut::map_mut(&file) });

        match mapped {
            Ok(mmap) => {
                tracing::trace!(%key, size, path = %path.display(), "created segment");
                Ok(Self {
                    key,
                    path,
                    _file: file,
                    mmap,
                })
            }
            Err(source) => {
                let _ = fs::remove_file(&path);
                Err(ShmError::Create { key, size, source })
            }
        }
    }

    /// Maps an existing segment in full.
    ///
    /// # Errors
    /// [`ShmError::Missing`] if no segment has `key`, [`ShmError::Invalid`] if
    /// it is empty, or [`ShmError::Attach`] on any other I/O failure.
    pub fn attach(ns: &ShmNamespace, key: Key) -> Result<Self, ShmError> {
        let path = ns.path_of(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ShmError::Missing { key },
                _ => ShmError::Attach { key, source },
            })?;

        let len = file
            .metadata()
            .map_err(|source| ShmError::Attach { key, source })?
            .len();
        if len == 0 {
            return Err(ShmError::Invalid {
                key,
                reason: "segment is empty",
            });
        }

        // SAFETY: the mapping covers the file as it is now; segments are never
        // resized after creation.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::Attach { key, source })?;

        Ok(Self {
            key,
            path,
            _file: file,
            mmap,
        })
    }

    /// Unlinks the segment with `key` without mapping it.
    pub fn unlink(ns: &ShmNamespace, key: Key) -> Result<(), ShmError> {
        fs::remove_file(ns.path_of(key)).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ShmError::Missing { key },
            _ => ShmError::Remove { key, source },
        })
    }

    /// Unlinks the backing file. Existing mappings, including this one, stay
    /// valid until they are dropped.
    pub fn remove(&self) -> Result<(), ShmError> {
        fs::remove_file(&self.path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ShmError::Missing { key: self.key },
            _ => ShmError::Remove {
                key: self.key,
                source,
            },
        })
    }

    /// Pins the mapping into physical RAM.
    pub fn lock(&self) -> Result<(), ShmError> {
        self.mmap
            .lock()
            .map_err(|source| ShmError::Lock { key: self.key, source })
    }

    pub fn unlock(&self) -> Result<(), ShmError> {
        self.mmap
            .unlock()
            .map_err(|source| ShmError::Lock { key: self.key, source })
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Raw pointer to the start of the mapping.
    ///
    /// Shared state inside a segment must only be mutated through atomics
    /// reached from this pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> (tempfile::TempDir, ShmNamespace) {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        (dir, ns)
    }

    #[test]
    fn create_is_exclusive() {
        let (_dir, ns) = namespace();
        let _seg = Segment::create(&ns, Key(0x10), 64).unwrap();
        let err = Segment::create(&ns, Key(0x10), 64).unwrap_err();
        assert!(matches!(err, ShmError::Exists { key } if key == Key(0x10)));
    }

    #[test]
    fn attach_sees_creator_writes() {
        let (_dir, ns) = namespace();
        let mut seg = Segment::create(&ns, Key(0x11), 128).unwrap();
        assert!(seg.as_slice().iter().all(|&b| b == 0));
        seg.as_mut_slice()[7] = 42;

        let other = Segment::attach(&ns, Key(0x11)).unwrap();
        assert_eq!(other.len(), 128);
        assert_eq!(other.as_slice()[7], 42);
    }

    #[test]
    fn attach_missing_reports_key() {
        let (_dir, ns) = namespace();
        let err = Segment::attach(&ns, Key(0x12)).unwrap_err();
        assert!(matches!(err, ShmError::Missing { .. }));
        assert_eq!(err.key(), Key(0x12));
    }

    #[test]
    fn remove_keeps_existing_mapping_alive() {
        let (_dir, ns) = namespace();
        let mut seg = Segment::create(&ns, Key(0x13), 16).unwrap();
        seg.remove().unwrap();
        seg.as_mut_slice()[0] = 1;
        assert_eq!(seg.as_slice()[0], 1);
        assert!(!ns.exists(Key(0x13)));
        assert!(matches!(seg.remove(), Err(ShmError::Missing { .. })));
    }

    #[test]
    fn zero_size_is_rejected() {
        let (_dir, ns) = namespace();
        assert!(matches!(
            Segment::create(&ns, Key(0x14), 0),
            Err(ShmError::Invalid { .. })
        ));
    }
}
