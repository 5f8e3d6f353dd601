//! Open, write, recover, finish: the durability lifecycle of a single
//! file.

use std::io::Read;

use rivulet_aof::geometry::{Geometry, PAGE};
use rivulet_aof::manager::Manager;
use rivulet_aof::recovery::{RecoveryKind, RecoveryOptions, EOF_MAGIC};
use rivulet_aof::{AofError, AofState};

fn manager() -> (tempfile::TempDir, Manager) {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::open_dir(dir.path()).unwrap();
    (dir, manager)
}

#[test]
fn write_sync_close_reopen_recovers_tail() {
    let (_dir, manager) = manager();

    let aof = manager
        .open("t1", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    assert_eq!(aof.write(&[0x01, 0x02, 0x03, 0x04]).unwrap(), 4);
    aof.flush().unwrap();
    aof.sync().unwrap();
    aof.close();
    assert!(manager.is_empty());

    let aof = manager
        .open("t1", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    assert_eq!(aof.size(), 4);
    assert_eq!(aof.recovered().kind, RecoveryKind::Tail);
    assert_eq!(aof.read(0, 4), &[0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn finished_file_reopens_as_eof() {
    let (dir, manager) = manager();

    let aof = manager
        .open("t2", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    let block = vec![0xABu8; 1024];
    for _ in 0..10 {
        aof.write(&block).unwrap();
    }
    aof.finish().unwrap();
    aof.finish().unwrap(); // idempotent
    assert_eq!(aof.state(), AofState::Eof);
    aof.close();

    let aof = manager
        .open("t2", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    assert_eq!(aof.size(), 10240);
    assert_eq!(aof.recovered().kind, RecoveryKind::Eof);
    assert_eq!(aof.state(), AofState::Eof);
    assert!(matches!(aof.write(b"more"), Err(AofError::Full)));

    // The EOF sentinel sits right past the payload on disk.
    let mut raw = Vec::new();
    std::fs::File::open(dir.path().join("t2"))
        .unwrap()
        .read_to_end(&mut raw)
        .unwrap();
    assert_eq!(raw.len(), 10248);
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[10240..10248]);
    assert_eq!(u64::from_le_bytes(word), EOF_MAGIC);
}

#[test]
fn file_grows_in_steps_up_to_the_cap() {
    let (_dir, manager) = manager();
    let geometry = Geometry {
        size_now: PAGE,
        size_upper: PAGE * 4,
        growth_step: PAGE,
    };

    let aof = manager
        .open("grow", geometry, RecoveryOptions::default())
        .unwrap();
    assert_eq!(aof.file_size(), PAGE);

    let payload = vec![7u8; PAGE as usize * 2];
    aof.write(&payload).unwrap();
    assert_eq!(aof.size(), PAGE * 2);
    assert!(aof.file_size() > PAGE * 2);
    assert!(aof.file_size() <= PAGE * 4);

    // A payload that can never fit is rejected outright.
    let huge = vec![7u8; PAGE as usize * 4];
    assert!(matches!(aof.write(&huge), Err(AofError::TooBig { .. })));

    // One that could fit an empty file but not the remaining space is
    // a transient full.
    let too_much = vec![7u8; PAGE as usize * 2];
    assert!(matches!(aof.write(&too_much), Err(AofError::Full)));

    // The first write is still intact.
    assert_eq!(aof.read(0, 16), &[7u8; 16]);
}

#[test]
fn empty_writes_are_rejected() {
    let (_dir, manager) = manager();
    let aof = manager
        .open("empty", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    assert!(matches!(aof.write(&[]), Err(AofError::EmptyData)));
    assert!(matches!(aof.append(0, |_| 0), Err(AofError::EmptyData)));
}

#[test]
fn append_publishes_only_what_was_written() {
    let (_dir, manager) = manager();
    let aof = manager
        .open("zc", Geometry::default(), RecoveryOptions::default())
        .unwrap();

    aof.write(b"header").unwrap();
    let end = aof
        .append(64, |slot| {
            assert_eq!(slot.begin, 6);
            assert_eq!(slot.end, 70);
            assert_eq!(slot.written, b"header");
            slot.tail[..4].copy_from_slice(b"body");
            4
        })
        .unwrap();
    assert_eq!(end, 10);
    assert_eq!(aof.size(), 10);
    assert_eq!(aof.read(0, 10), b"headerbody");
}

#[test]
fn corrupted_file_refuses_to_open() {
    let (dir, manager) = manager();
    std::fs::write(dir.path().join("bad"), b"not a valid log at all!!").unwrap();

    let err = manager
        .open("bad", Geometry::default(), RecoveryOptions::default())
        .unwrap_err();
    assert!(matches!(err, AofError::Corrupted));
    // The failed open leaves no entry behind.
    assert!(manager.is_empty());
}

#[test]
fn eof_recovery_demands_a_finished_file() {
    let (_dir, manager) = manager();
    let eof_only = RecoveryOptions {
        eof: true,
        ..RecoveryOptions::default()
    };

    // Missing file.
    assert!(matches!(
        manager.open("absent", Geometry::default(), eof_only),
        Err(AofError::EmptyFile)
    ));

    // A file still carrying a tail sentinel.
    let aof = manager
        .open("open-ended", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    aof.write(b"data").unwrap();
    aof.sync().unwrap();
    aof.close();
    assert!(matches!(
        manager.open("open-ended", Geometry::default(), eof_only),
        Err(AofError::EmptyFile)
    ));
}

#[test]
fn get_or_create_returns_the_same_instance() {
    let (_dir, manager) = manager();
    let a = manager
        .open("shared", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    let b = manager
        .open("shared", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    assert_eq!(manager.len(), 1);
}

#[test]
fn non_blocking_write_yields_under_contention() {
    let (_dir, manager) = manager();
    let aof = manager
        .open("contended", Geometry::default(), RecoveryOptions::default())
        .unwrap();

    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let writer = {
        let aof = std::sync::Arc::clone(&aof);
        std::thread::spawn(move || {
            aof.append(8, move |slot| {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                slot.tail[..2].copy_from_slice(b"ab");
                2
            })
            .unwrap()
        })
    };

    entered_rx.recv().unwrap();
    // The append closure holds the write mutex right now.
    assert!(matches!(
        aof.write_non_blocking(b"x"),
        Err(AofError::WouldBlock)
    ));
    release_tx.send(()).unwrap();
    assert_eq!(writer.join().unwrap(), 2);

    assert_eq!(aof.write_non_blocking(b"x").unwrap(), 3);
    assert_eq!(aof.read(0, 3), b"abx");
}

#[test]
fn closed_manager_refuses_opens() {
    let (_dir, manager) = manager();
    let aof = manager
        .open("f", Geometry::default(), RecoveryOptions::default())
        .unwrap();
    manager.close();
    manager.close(); // idempotent
    assert!(matches!(
        manager.open("f2", Geometry::default(), RecoveryOptions::default()),
        Err(AofError::Closed)
    ));
    assert!(matches!(aof.write(b"late"), Err(AofError::Closed)));
    assert_eq!(aof.state(), AofState::Closed);
}

#[test]
fn anonymous_open_is_unsupported() {
    let (_dir, manager) = manager();
    assert!(matches!(
        manager.open_anonymous(Geometry::default()),
        Err(AofError::Unsupported(_))
    ));
}

#[test]
fn size_never_regresses_or_passes_file_size() {
    let (_dir, manager) = manager();
    let aof = manager
        .open("mono", Geometry::default(), RecoveryOptions::default())
        .unwrap();

    let mut last = 0;
    for i in 0..200u32 {
        aof.write(&i.to_le_bytes()).unwrap();
        let size = aof.size();
        assert!(size >= last);
        assert!(size <= aof.file_size());
        assert!(aof.file_size() <= aof.geometry().size_upper);
        last = size;
    }
    assert_eq!(last, 800);
}
