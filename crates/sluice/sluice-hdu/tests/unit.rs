use sluice_hdu::{AsciiHeader, HDR_SIZE, HduError, HeaderDataUnit};
use sluice_ipc::{Key, OpenMode, Ring, RingConfig, ShmNamespace};
use std::io::{Read, Write};

const KEY: Key = Key(0xdada);

fn setup() -> (tempfile::TempDir, ShmNamespace) {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    HeaderDataUnit::create_rings(&ns, KEY, RingConfig::new(4, 16), RingConfig::new(2, 64)).unwrap();
    (dir, ns)
}

fn unit(ns: &ShmNamespace) -> HeaderDataUnit {
    let mut hdu = HeaderDataUnit::with_key(ns.clone(), KEY);
    hdu.connect().unwrap();
    hdu
}

#[test]
fn header_ring_sits_at_next_key() {
    let (_dir, ns) = setup();
    let hdu = HeaderDataUnit::new(ns.clone());
    assert_eq!(hdu.data_key(), Key::DEFAULT);
    assert_eq!(hdu.header_key(), Key::DEFAULT.next());
    assert!(ns.exists(KEY.next()));
}

#[test]
fn writer_and_reader_exchange_header_and_data() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write_with(OpenMode::WriteImmediate).unwrap();
    let mut header = AsciiHeader::new();
    header.set("SOURCE", "J0437-4715");
    header.set("NCHAN", 1024);
    w.write_header(&header).unwrap();
    w.data().unwrap().write_all(b"observation data, forty bytes long!!!!!!").unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    let got = r.open_header().unwrap();
    assert_eq!(got.get("SOURCE"), Some("J0437-4715"));
    assert_eq!(got.get_parsed::<u32>("NCHAN"), Some(1024));
    assert_eq!(got.get_parsed::<u64>(HDR_SIZE), Some(64));

    let mut data = Vec::new();
    r.data().unwrap().read_to_end(&mut data).unwrap();
    assert_eq!(data, b"observation data, forty bytes long!!!!!!");
    assert!(r.header().is_some());

    r.unlock_read().unwrap();
    assert!(r.header().is_none());
    r.disconnect().unwrap();
}

#[test]
fn default_write_lock_publishes_data_immediately() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write().unwrap();
    let mut header = AsciiHeader::new();
    header.set("OBS", 1);
    w.write_header(&header).unwrap();
    w.data().unwrap().write_all(b"0123456789abcdefXYZ").unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    assert_eq!(r.open_header().unwrap().get("OBS"), Some("1"));
    let mut data = Vec::new();
    r.data().unwrap().read_to_end(&mut data).unwrap();
    assert_eq!(data, b"0123456789abcdefXYZ");
}

#[test]
fn deferred_write_lock_waits_for_start() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write_with(OpenMode::Write).unwrap();
    w.write_header(&AsciiHeader::new()).unwrap();
    let data = w.data().unwrap();
    data.write_all(b"clocked.").unwrap();
    data.start(8).unwrap();
    data.write_all(b"kept").unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    r.open_header().unwrap();
    let mut out = Vec::new();
    r.data().unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, b"kept");
}

#[test]
fn short_hdr_size_truncates_header() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write().unwrap();
    let mut header = AsciiHeader::new();
    header.set(HDR_SIZE, 12);
    header.set("TAIL", "dropped");
    w.write_header(&header).unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    let got = r.open_header().unwrap();
    assert_eq!(got.get_parsed::<u64>(HDR_SIZE), Some(12));
    assert_eq!(got.get("TAIL"), None);
}

#[test]
fn oversized_hdr_size_is_rejected() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write().unwrap();
    let mut header = AsciiHeader::new();
    header.set(HDR_SIZE, 65);
    w.write_header(&header).unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    assert!(matches!(
        r.open_header(),
        Err(HduError::HeaderTooLarge { hdr_size: 65, slot: 64 })
    ));
}

#[test]
fn empty_header_transfer_is_skipped() {
    let (_dir, ns) = setup();

    // A header transfer ended by an empty slot, then a real header.
    let mut raw = Ring::connect(&ns, KEY.next()).unwrap();
    raw.lock_write().unwrap();
    raw.next_write().unwrap();
    raw.mark_filled(0).unwrap();
    raw.unlock_write().unwrap();

    let mut w = unit(&ns);
    w.lock_write().unwrap();
    let mut header = AsciiHeader::new();
    header.set("OBS", 2);
    w.write_header(&header).unwrap();
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    let got = r.open_header().unwrap();
    assert_eq!(got.get("OBS"), Some("2"));
}

#[test]
fn opening_the_next_header_clears_the_previous_one() {
    let (_dir, ns) = setup();

    let mut w = unit(&ns);
    w.lock_write().unwrap();
    for obs in 1..=2 {
        let mut header = AsciiHeader::new();
        header.set("OBS", obs);
        w.write_header(&header).unwrap();
    }
    w.unlock_write().unwrap();

    let mut r = unit(&ns);
    r.lock_read().unwrap();
    assert_eq!(r.open_header().unwrap().get("OBS"), Some("1"));
    assert_eq!(r.header_ring().unwrap().nclear(0), 0);
    assert_eq!(r.open_header().unwrap().get("OBS"), Some("2"));
    assert_eq!(r.header_ring().unwrap().nclear(0), 1);
}

#[test]
fn operations_need_a_connection() {
    let (_dir, ns) = setup();
    let mut hdu = HeaderDataUnit::with_key(ns, KEY);
    assert!(matches!(hdu.lock_read(), Err(HduError::NotConnected { .. })));
    assert!(matches!(hdu.disconnect(), Err(HduError::NotConnected { .. })));

    hdu.connect().unwrap();
    assert!(matches!(hdu.connect(), Err(HduError::AlreadyConnected { .. })));
    assert!(hdu.set_key(Key(1)).is_err());
}

#[test]
fn destroy_rings_removes_both() {
    let (_dir, ns) = setup();
    HeaderDataUnit::destroy_rings(&ns, KEY).unwrap();
    assert!(!ns.exists(KEY));
    assert!(!ns.exists(KEY.next()));
    assert!(matches!(
        HeaderDataUnit::destroy_rings(&ns, KEY),
        Err(HduError::Teardown { .. })
    ));
}
