use sluice_config::{ConfigError, SluiceConfig};
use std::io::Write;

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "viewer_poll_ms = 25\n[data]\nreaders = 2").unwrap();

    let cfg = SluiceConfig::load(file.path().display().to_string()).unwrap();
    assert_eq!(cfg.viewer_poll_ms, 25);
    assert_eq!(cfg.data.readers, 2);
    assert_eq!(cfg.log_level, "info");
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    match SluiceConfig::load(path.display().to_string()) {
        Err(ConfigError::Read { path: p, .. }) => assert!(p.ends_with("absent.toml")),
        other => panic!("expected read error, got {other:?}"),
    }
}
