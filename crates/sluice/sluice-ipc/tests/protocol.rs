//! Protocol behaviour across several handles on one ring.
//!
//! Handles live in threads of this process; each test gets its own
//! namespace directory so keys never collide.

use sluice_ipc::{
    Key, OpenMode, Ring, RingConfig, RingError, SeekProblem, ShmNamespace, Stream,
};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

const KEY: Key = Key(0x5100);

fn namespace() -> (tempfile::TempDir, ShmNamespace) {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    (dir, ns)
}

fn stream(ns: &ShmNamespace, mode: OpenMode) -> Stream {
    let mut s = Stream::new(Ring::connect(ns, KEY).unwrap());
    s.open(mode).unwrap();
    s
}

#[test]
fn only_one_writer_wins() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(2, 16)).unwrap();

    let tried = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ns = ns.clone();
            let tried = Arc::clone(&tried);
            thread::spawn(move || {
                let mut ring = Ring::connect(&ns, KEY).unwrap();
                let won = ring.try_lock_write().is_ok();
                // Hold the permit until both have tried.
                tried.wait();
                won
            })
        })
        .collect();

    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(wins, 1);
}

#[test]
fn writer_blocks_until_slot_is_cleared() {
    let (_dir, ns) = namespace();
    let mut writer = Ring::create(&ns, KEY, RingConfig::new(2, 8)).unwrap();
    writer.lock_write().unwrap();
    for _ in 0..2 {
        writer.next_write().unwrap();
        writer.mark_filled(8).unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let blocked = thread::spawn(move || {
        let index = writer.next_write().unwrap();
        tx.send(index).unwrap();
        writer
    });

    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

    let mut reader = Ring::connect(&ns, KEY).unwrap();
    reader.lock_read().unwrap();
    reader.next_read().unwrap().unwrap();
    reader.mark_cleared().unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    let writer = blocked.join().unwrap();
    assert_eq!(writer.write_count(), 2);
}

#[test]
fn stream_carries_exactly_the_transfer() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"0123456789").unwrap();
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"0123456789");
    assert!(r.eod());
    assert_eq!(r.tell(), 10);
}

#[test]
fn exactly_full_last_slot_still_ends_the_transfer() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"abcdefgh").unwrap();
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"abcdefgh");
    assert!(r.eod());
}

#[test]
fn deferred_start_skips_clocked_bytes() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::Write);
    w.write_all(b"012345678901").unwrap();
    assert_eq!(w.tell(), 12);
    assert_eq!(w.start_minimum(), 0);
    w.start(6).unwrap();
    assert!(w.ring().is_writing());
    w.write_all(b"cdef").unwrap();
    w.stop().unwrap();
    assert!(!w.ring().is_writing());
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"678901cdef");
}

#[test]
fn rejected_start_leaves_the_writer_clocking() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::Write);
    w.write_all(b"0123456789abcdefghijklmn").unwrap();
    assert_eq!(w.start_minimum(), 8);
    assert!(matches!(
        w.start(0),
        Err(RingError::StartExpired { start_buf: 0, min_buf: 2 })
    ));
    assert!(!w.ring().is_writing());

    w.start(w.start_minimum()).unwrap();
    assert!(w.ring().is_writing());
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"89abcdefghijklmn");
}

#[test]
fn immediate_writer_stopped_before_writing_can_defer_its_start() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.stop().unwrap();
    assert_eq!(w.ring().write_xfer(), 0);

    w.start(6).unwrap();
    w.write_all(b"abcdefghijkl").unwrap();
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"ghijkl");
}

#[test]
fn consecutive_transfers_need_a_reader_reset() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"aaaa").unwrap();
    w.stop().unwrap();
    let next = w.tell();
    w.start(next).unwrap();
    w.write_all(b"bb").unwrap();
    w.close().unwrap();
    assert_eq!(w.ring().write_xfer(), 2);

    let mut r = stream(&ns, OpenMode::Read);
    let mut first = Vec::new();
    r.read_to_end(&mut first).unwrap();
    assert_eq!(first, b"aaaa");

    r.reset().unwrap();
    let mut second = Vec::new();
    r.read_to_end(&mut second).unwrap();
    assert_eq!(second, b"bb");
}

#[test]
fn transfer_records_are_reused_across_many_transfers() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    let mut r = stream(&ns, OpenMode::Read);

    for n in 0..20 {
        if n > 0 {
            let next = w.tell();
            w.start(next).unwrap();
        }
        let payload = format!("xfer{n:02}");
        w.write_all(payload.as_bytes()).unwrap();
        w.stop().unwrap();

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload.as_bytes(), "transfer {n}");
        r.reset().unwrap();
    }
    assert_eq!(w.ring().write_xfer(), 20);
    w.close().unwrap();
}

#[test]
fn lock_read_resumes_the_identity_furthest_behind() {
    let (_dir, ns) = namespace();
    let mut w = Ring::create(&ns, KEY, RingConfig::new(4, 4).readers(2)).unwrap();
    w.lock_write().unwrap();
    w.next_write().unwrap();
    w.mark_filled(4).unwrap();

    let mut ahead = Ring::connect(&ns, KEY).unwrap();
    ahead.lock_read().unwrap();
    assert_eq!(ahead.reader_slot(), Some(0));
    ahead.next_read().unwrap().unwrap();
    ahead.mark_cleared().unwrap();
    ahead.unlock_read().unwrap();
    assert_eq!(w.read_count_of(0), 1);
    assert_eq!(w.read_count_of(1), 0);

    let mut lagging = Ring::connect(&ns, KEY).unwrap();
    lagging.lock_read().unwrap();
    assert_eq!(lagging.reader_slot(), Some(1));

    let mut other = Ring::connect(&ns, KEY).unwrap();
    other.lock_read().unwrap();
    assert_eq!(other.reader_slot(), Some(0));
}

#[test]
fn each_reader_sees_every_slot() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(2, 4).readers(2)).unwrap();
    let payload: Vec<u8> = (0..40).collect();

    let readers: Vec<_> = (0..2)
        .map(|n| {
            let ns = ns.clone();
            thread::spawn(move || {
                let mut r = stream(&ns, OpenMode::Read);
                let mut out = Vec::new();
                let mut chunk = [0u8; 3];
                loop {
                    let got = r.read(&mut chunk).unwrap();
                    if got == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..got]);
                    if n == 1 {
                        // The slow reader holds the writer back.
                        thread::sleep(Duration::from_millis(2));
                    }
                }
                out
            })
        })
        .collect();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(&payload).unwrap();
    w.close().unwrap();

    for h in readers {
        assert_eq!(h.join().unwrap(), payload);
    }
}

#[test]
fn reader_identities_are_limited() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(2, 4).readers(2)).unwrap();

    let mut a = Ring::connect(&ns, KEY).unwrap();
    let mut b = Ring::connect(&ns, KEY).unwrap();
    let mut c = Ring::connect(&ns, KEY).unwrap();
    a.lock_read().unwrap();
    b.lock_read().unwrap();
    assert_ne!(a.reader_slot(), b.reader_slot());
    assert!(matches!(c.try_lock_read(), Err(RingError::Busy { .. })));

    a.unlock_read().unwrap();
    c.try_lock_read().unwrap();
}

#[test]
fn viewer_takes_nothing_from_readers() {
    let (_dir, ns) = namespace();
    let mut writer = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();
    writer.lock_write().unwrap();
    for fill in [b'a', b'b'] {
        let i = writer.next_write().unwrap();
        writer.slot_mut(i).fill(fill);
        writer.mark_filled(4).unwrap();
    }

    let mut viewer = Ring::connect(&ns, KEY).unwrap();
    viewer.set_view_poll(Duration::from_millis(1));
    let slot = viewer.next_read().unwrap().unwrap();
    assert_eq!(slot.buf, 1);
    assert_eq!(viewer.slot(slot.index), b"bbbb");

    assert_eq!(writer.nfull(0), 2);
    assert_eq!(writer.nclear(0), 0);

    // The writer still has free slots and is never held up by the viewer.
    writer.next_write().unwrap();
    writer.mark_filled(4).unwrap();
    let slot = viewer.next_read().unwrap().unwrap();
    assert_eq!(slot.buf, 2);
}

#[test]
fn viewer_stops_at_end_of_transfer() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"abcdef").unwrap();
    w.close().unwrap();

    let mut ring = Ring::connect(&ns, KEY).unwrap();
    ring.set_view_poll(Duration::from_millis(1));
    let mut v = Stream::new(ring);
    v.open(OpenMode::View).unwrap();
    let mut out = Vec::new();
    v.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"ef");
    assert!(v.eod());

    // Viewing consumed nothing; the reader still gets all of it.
    let mut r = stream(&ns, OpenMode::Read);
    let mut all = Vec::new();
    r.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"abcdef");
}

#[test]
fn block_api_round_trip() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 8)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    let (index, block) = w.open_block_write().unwrap();
    assert_eq!(index, 0);
    block.copy_from_slice(b"ABCDEFGH");
    w.close_block_write(8).unwrap();

    let (index, block) = w.open_block_write().unwrap();
    assert_eq!(index, 1);
    block[..3].copy_from_slice(b"xyz");
    w.update_block_write(2).unwrap();
    w.close_block_write(1).unwrap();
    assert!(!w.ring().is_writing());
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let (_, block) = r.open_block_read().unwrap().unwrap();
    assert_eq!(block, b"ABCDEFGH");
    r.close_block_read(8).unwrap();
    let (_, block) = r.open_block_read().unwrap().unwrap();
    assert_eq!(block, b"xyz");
    assert!(r.close_block_read(4).is_err());
    r.close_block_read(3).unwrap();
    assert!(r.open_block_read().unwrap().is_none());
}

#[test]
fn seek_and_tell_follow_the_read_position() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"0123456789").unwrap();
    w.close().unwrap();

    let mut r = stream(&ns, OpenMode::Read);
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf).unwrap();
    assert_eq!(r.tell(), 3);

    assert_eq!(r.seek(SeekFrom::Current(-2)).unwrap(), 1);
    let mut two = [0u8; 2];
    r.read_exact(&mut two).unwrap();
    assert_eq!(&two, b"12");

    assert_eq!(r.seek(SeekFrom::Start(6)).unwrap(), 6);
    let mut rest = [0u8; 4];
    r.read_exact(&mut rest).unwrap();
    assert_eq!(&rest, b"6789");
    assert_eq!(r.tell(), 10);

    assert!(matches!(
        r.seek_to(SeekFrom::Current(-1)),
        Err(RingError::Seek {
            detail: SeekProblem::BeforeSlot { back: 1, max: 0 }
        })
    ));
    assert!(r.seek(SeekFrom::End(0)).is_err());
}

#[test]
fn space_left_tracks_the_slowest_reader() {
    let (_dir, ns) = namespace();
    let _owner = Ring::create(&ns, KEY, RingConfig::new(4, 4).readers(2)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    assert_eq!(w.space_left(), 16);
    w.write_all(b"abcdefghij").unwrap();
    // Two slots committed, the third is still open.
    assert_eq!(w.space_left(), 8);
    assert!((w.percent_full() - 0.5).abs() < f64::EPSILON);

    let mut r = stream(&ns, OpenMode::Read);
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).unwrap();
    // The other identity has not moved.
    assert_eq!(w.space_left(), 8);
}

#[test]
fn writer_close_keeps_ring_reusable() {
    let (_dir, ns) = namespace();
    let owner = Ring::create(&ns, KEY, RingConfig::new(4, 4)).unwrap();

    let mut w = stream(&ns, OpenMode::WriteImmediate);
    w.write_all(b"abc").unwrap();
    w.close().unwrap();
    assert!(!owner.writer_locked());

    let stats = owner.stats();
    assert_eq!(stats.nwrite, 1);
    assert_eq!(stats.xfer, 1);
    assert!(!stats.writing);
    assert_eq!(stats.readers[0].full, 1);

    let mut again = Ring::connect(&ns, KEY).unwrap();
    again.try_lock_write().unwrap();
}
