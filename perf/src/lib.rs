use sluice_ipc::{Key, OpenMode, Ring, RingConfig, ShmNamespace, Stream};
use tempfile::TempDir;

// ─── Bench Ring ─────────────────────────────────────────────────────────────

/// A ring in a private namespace directory, destroyed on drop.
pub struct BenchRing {
    _dir: TempDir,
    pub ns: ShmNamespace,
    pub key: Key,
}

impl BenchRing {
    pub fn new(cfg: RingConfig) -> Self {
        let dir = tempfile::Builder::new()
            .prefix("sluice_bench")
            .tempdir()
            .expect("bench namespace dir");
        let ns = ShmNamespace::new(dir.path());
        let key = Key(0xbe4c);
        Ring::create(&ns, key, cfg).expect("create bench ring");
        Self { _dir: dir, ns, key }
    }

    pub fn handle(&self) -> Ring {
        Ring::connect(&self.ns, self.key).expect("connect bench ring")
    }

    pub fn stream(&self, mode: OpenMode) -> Stream {
        let mut stream = Stream::new(self.handle());
        stream.open(mode).expect("open bench stream");
        stream
    }
}

impl Drop for BenchRing {
    fn drop(&mut self) {
        let _ = Ring::destroy_key(&self.ns, self.key);
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Byte `offset` of the test pattern.
#[inline(always)]
pub fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn fill_pattern(buf: &mut [u8], offset: u64) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = pattern(offset + i as u64);
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{}MiB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}KiB", bytes / KB)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_exact_units() {
        assert_eq!(format_bytes(1500), "1500B");
        assert_eq!(format_bytes(4096), "4KiB");
        assert_eq!(format_bytes(1 << 20), "1MiB");
        assert_eq!(format_bytes(3 * 1024 + 1), "3073B");
    }
}
