//! End-to-end tests over a RAM medium: queue round-trips, transaction
//! rollback, crash recovery, priority eviction, enumeration, and space
//! reclamation.

mod common;

use common::MemDisk;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tofs::{BlockDevice, Error, OpenFlags, Priority, Volume};

/// An 8 KB volume with 1 KB blocks, freshly formatted.
fn small_volume() -> (MemDisk, Volume<MemDisk>) {
    let disk = MemDisk::new(8, 10);
    let mut vol = Volume::new(disk.clone());
    vol.mount(true).unwrap();
    (disk, vol)
}

fn remount(disk: &MemDisk) -> Volume<MemDisk> {
    let mut vol = Volume::new(disk.clone());
    vol.mount(false).unwrap();
    vol
}

fn pair(a: u32, b: u32) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[..4].copy_from_slice(&a.to_le_bytes());
    buf[4..].copy_from_slice(&b.to_le_bytes());
    buf
}

#[test]
fn queue_round_trip() {
    let (_disk, mut vol) = small_volume();

    let w = vol
        .open(b"q", OpenFlags::APPEND | OpenFlags::PRIO_HIGH)
        .unwrap();
    vol.transaction().unwrap();
    for i in 0..10u32 {
        vol.write(w, &pair(i, i * 10)).unwrap();
        vol.write(w, &pair(i, 0)).unwrap();
    }
    vol.commit().unwrap();
    vol.close(w).unwrap();

    let r = vol.open(b"q", OpenFlags::QUEUE).unwrap();
    for i in 0..10u32 {
        assert_eq!(vol.read(r, None).unwrap(), 8, "size peek");
        let mut buf = [0; 8];
        assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 8);
        assert_eq!(buf, pair(i, i * 10));
        assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 8);
        assert_eq!(buf, pair(i, 0));
        vol.bookmark(r).unwrap();
    }
    assert_eq!(vol.read(r, None).unwrap(), 0, "end of file");
    assert_eq!(vol.stat(b"q").unwrap().size, 0);

    // Everything consumed: only the file's metadata records stay live.
    let space = vol.space().unwrap();
    assert!(
        space.live < 64,
        "only metadata should remain live, got {}",
        space.live
    );
}

#[test]
fn rollback_leaves_no_trace() {
    let (disk, mut vol) = small_volume();
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(w, b"committed").unwrap();
    let before = vol.stat(b"f").unwrap().size;

    vol.transaction().unwrap();
    vol.write(w, b"one").unwrap();
    vol.write(w, b"two").unwrap();
    vol.write(w, b"three").unwrap();
    vol.abort().unwrap();

    assert_eq!(vol.stat(b"f").unwrap().size, before);
    vol.close(w).unwrap();
    vol.unmount().unwrap();

    // The next mount sees no trace of the aborted records either.
    let vol = remount(&disk);
    assert_eq!(vol.stat(b"f").unwrap().size, before);
}

#[test]
fn crash_before_commit_rolls_back() {
    let (disk, mut vol) = small_volume();
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(w, b"durable").unwrap();

    vol.transaction().unwrap();
    vol.write(w, b"lost-1").unwrap();
    vol.write(w, b"lost-2").unwrap();
    // Power loss before commit: submitted writes drop.
    disk.crash();

    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"f").unwrap().size, 7);
    let r = vol.open(b"f", OpenFlags::READ).unwrap();
    let mut buf = [0; 16];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 7);
    assert_eq!(&buf[..7], b"durable");
}

#[test]
fn crash_with_durable_tentative_records_rolls_back() {
    let (disk, mut vol) = small_volume();
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(w, b"durable").unwrap();

    vol.transaction().unwrap();
    vol.write(w, b"tentative-1").unwrap();
    vol.write(w, b"tentative-2").unwrap();
    // The records reach the medium, but no commit point does: recovery
    // must flip them dead.
    disk.clone().flush().unwrap();
    disk.crash();

    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"f").unwrap().size, 7);

    // The file keeps working after recovery.
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(w, b"-more").unwrap();
    assert_eq!(vol.stat(b"f").unwrap().size, 12);
    let r = vol.open(b"f", OpenFlags::READ).unwrap();
    let mut buf = [0; 16];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 7);
    assert_eq!(&buf[..7], b"durable");
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 5);
    assert_eq!(&buf[..5], b"-more");
}

#[test]
fn crash_after_commit_keeps_transaction() {
    let (disk, mut vol) = small_volume();
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.transaction().unwrap();
    vol.write(w, b"alpha").unwrap();
    vol.write(w, b"beta").unwrap();
    vol.commit().unwrap();
    // Commit returned, so a crash cannot undo it.
    disk.crash();

    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"f").unwrap().size, 9);
    let r = vol.open(b"f", OpenFlags::READ).unwrap();
    let mut buf = [0; 16];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 5);
    assert_eq!(&buf[..5], b"alpha");
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 4);
    assert_eq!(&buf[..4], b"beta");
}

#[test]
fn bookmark_survives_remount() {
    let (disk, mut vol) = small_volume();
    let w = vol.open(b"q", OpenFlags::APPEND).unwrap();
    for payload in [&b"first"[..], b"second", b"third"] {
        vol.write(w, payload).unwrap();
    }
    let r = vol.open(b"q", OpenFlags::QUEUE).unwrap();
    let mut buf = [0; 16];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 5);
    vol.bookmark(r).unwrap();
    vol.close(r).unwrap();
    vol.close(w).unwrap();
    vol.unmount().unwrap();

    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"q").unwrap().size, 11);
    let r = vol.open(b"q", OpenFlags::QUEUE).unwrap();
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 6);
    assert_eq!(&buf[..6], b"second");
}

#[test]
fn priority_eviction_sacrifices_low_for_high() {
    let (_disk, mut vol) = small_volume();
    let low = vol
        .open(b"low", OpenFlags::APPEND | OpenFlags::PRIO_LOW)
        .unwrap();
    let chunk = [0x55u8; 100];
    let mut low_written = 0u32;
    loop {
        match vol.write(low, &chunk) {
            Ok(()) => low_written += chunk.len() as u32,
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected error while filling: {:?}", e),
        }
    }
    assert!(low_written > 0);
    assert_eq!(vol.stat(b"low").unwrap().size, low_written);

    // A high-priority writer still gets space: a low block is sacrificed
    // and the low file's head advances coherently.
    let high = vol
        .open(b"hi", OpenFlags::APPEND | OpenFlags::PRIO_HIGH)
        .unwrap();
    vol.write(high, &chunk).unwrap();
    assert!(vol.stat(b"low").unwrap().size < low_written);
    assert_eq!(vol.stat(b"hi").unwrap().size, 100);

    // Push high-priority data until even eviction cannot help.
    loop {
        match vol.write(high, &chunk) {
            Ok(()) => {}
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
    // High-priority content is never evicted for a low write.
    let high_size = vol.stat(b"hi").unwrap().size;
    assert_eq!(vol.write(low, &chunk).unwrap_err(), Error::NoSpace);
    assert_eq!(vol.stat(b"hi").unwrap().size, high_size);

    // What survives of the low file is still a coherent suffix.
    let r = vol.open(b"low", OpenFlags::READ).unwrap();
    let remaining = vol.stat(b"low").unwrap().size;
    let mut got = 0;
    let mut buf = [0u8; 128];
    loop {
        let n = vol.read(r, Some(&mut buf)).unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|b| *b == 0x55));
        got += n as u32;
    }
    assert_eq!(got, remaining);
}

#[test]
fn enumeration_lists_live_files() {
    let (_disk, mut vol) = small_volume();
    for (name, payload) in [(&b"a"[..], &b"xx"[..]), (b"b", b"yyy"), (b"c", b"zzzz")] {
        let fd = vol.open(name, OpenFlags::APPEND).unwrap();
        vol.write(fd, payload).unwrap();
        vol.close(fd).unwrap();
    }

    let template = vol.stat(b"a").unwrap();
    let mut infos = [template; 8];
    let n = vol.list_into(&mut infos).unwrap();
    assert_eq!(n, 3);
    let mut names: Vec<Vec<u8>> = infos[..n].iter().map(|i| i.name.as_bytes().to_vec()).collect();
    names.sort();
    assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    let b_info = infos[..n]
        .iter()
        .find(|i| i.name.as_bytes() == b"b")
        .unwrap();
    assert_eq!(b_info.size, 3);

    vol.delete(b"b").unwrap();
    let mut seen = Vec::new();
    vol.list(|info| seen.push(info.name.as_bytes().to_vec()))
        .unwrap();
    seen.sort();
    assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
    assert_eq!(vol.stat(b"b").unwrap_err(), Error::NotFound);
}

#[test]
fn mount_is_idempotent_and_stable() {
    let (disk, mut vol) = small_volume();
    for (name, payload) in [(&b"a"[..], &b"12345"[..]), (b"b", b"678")] {
        let fd = vol.open(name, OpenFlags::APPEND).unwrap();
        vol.write(fd, payload).unwrap();
        vol.close(fd).unwrap();
    }
    // Mount while mounted is a no-op.
    vol.mount(false).unwrap();
    vol.unmount().unwrap();

    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"a").unwrap().size, 5);
    assert_eq!(vol.stat(b"b").unwrap().size, 3);
    vol.unmount().unwrap();

    let vol = remount(&disk);
    assert_eq!(vol.stat(b"a").unwrap().size, 5);
    assert_eq!(vol.stat(b"b").unwrap().size, 3);
}

#[test]
fn queue_cycles_reclaim_space() {
    // Far more data than the medium holds: reclamation must keep up.
    let (_disk, mut vol) = small_volume();
    let w = vol.open(b"q", OpenFlags::APPEND).unwrap();
    let r = vol.open(b"q", OpenFlags::QUEUE).unwrap();
    let chunk = [0xA5u8; 200];
    let mut buf = [0u8; 256];
    for _ in 0..100 {
        vol.write(w, &chunk).unwrap();
        let n = vol.read(r, Some(&mut buf)).unwrap();
        assert_eq!(n, 200);
        assert!(buf[..n].iter().all(|b| *b == 0xA5));
        vol.bookmark(r).unwrap();
        assert_eq!(vol.stat(b"q").unwrap().size, 0);
    }
    let space = vol.space().unwrap();
    assert!(space.live < 300, "dead content must not accumulate");
}

#[test]
fn random_appends_read_back_equal() {
    let (disk, mut vol) = small_volume();
    let mut rng = StdRng::seed_from_u64(0x70F5);
    let w = vol.open(b"data", OpenFlags::APPEND).unwrap();
    let r = vol.open(b"data", OpenFlags::QUEUE).unwrap();

    // Model: the queue of unconsumed records.
    let mut expect: std::collections::VecDeque<Vec<u8>> = Default::default();
    for step in 0..400 {
        if rng.gen_bool(0.55) || expect.is_empty() {
            let len = rng.gen_range(1..=64);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            match vol.write(w, &payload) {
                Ok(()) => expect.push_back(payload),
                Err(Error::NoSpace) => {
                    // Consume everything and reclaim.
                    let mut buf = [0u8; 64];
                    while let Some(want) = expect.pop_front() {
                        let n = vol.read(r, Some(&mut buf)).unwrap();
                        assert_eq!(&buf[..n], &want[..]);
                    }
                    vol.bookmark(r).unwrap();
                }
                Err(e) => panic!("step {}: {:?}", step, e),
            }
        } else {
            let want = expect.pop_front().unwrap();
            assert_eq!(vol.read(r, None).unwrap(), want.len());
            let mut buf = [0u8; 64];
            let n = vol.read(r, Some(&mut buf)).unwrap();
            assert_eq!(&buf[..n], &want[..]);
            if rng.gen_bool(0.5) {
                vol.bookmark(r).unwrap();
            }
        }
    }

    // Whatever the model still holds must read back after a remount.
    let total: usize = expect.iter().map(|v| v.len()).sum();
    vol.close(w).unwrap();
    vol.close(r).unwrap();
    vol.unmount().unwrap();
    let mut vol = remount(&disk);
    assert_eq!(vol.stat(b"data").unwrap().size as usize, total);
    let r = vol.open(b"data", OpenFlags::QUEUE).unwrap();
    for want in expect {
        let mut buf = [0u8; 64];
        let n = vol.read(r, Some(&mut buf)).unwrap();
        assert_eq!(&buf[..n], &want[..]);
    }
    assert_eq!(vol.read(r, None).unwrap(), 0);
}

#[test]
fn open_flag_validation() {
    let (_disk, mut vol) = small_volume();
    assert_eq!(
        vol.open(b"x", OpenFlags::READ | OpenFlags::APPEND).unwrap_err(),
        Error::InvalidFlags
    );
    assert_eq!(vol.open(b"x", OpenFlags::empty()).unwrap_err(), Error::InvalidFlags);
    assert_eq!(
        vol.open(b"x", OpenFlags::APPEND | OpenFlags::PRIO_LOW | OpenFlags::PRIO_HIGH)
            .unwrap_err(),
        Error::InvalidFlags
    );
    assert_eq!(
        vol.open(b"missing", OpenFlags::READ | OpenFlags::DONT_CREATE)
            .unwrap_err(),
        Error::NotFound
    );
    assert_eq!(
        vol.open(b"has/slash", OpenFlags::READ).unwrap_err(),
        Error::InvalidName
    );
    assert_eq!(
        vol.open(b"name-way-too-long", OpenFlags::READ).unwrap_err(),
        Error::NameTooLong
    );
}

#[test]
fn one_append_handle_per_file() {
    let (_disk, mut vol) = small_volume();
    let a = vol.open(b"f", OpenFlags::APPEND).unwrap();
    assert_eq!(vol.open(b"f", OpenFlags::APPEND).unwrap_err(), Error::Busy);
    // Readers are unlimited.
    let _r1 = vol.open(b"f", OpenFlags::READ).unwrap();
    let _r2 = vol.open(b"f", OpenFlags::QUEUE).unwrap();
    vol.close(a).unwrap();
    let _a2 = vol.open(b"f", OpenFlags::APPEND).unwrap();
}

#[test]
fn delete_is_refused_while_open() {
    let (_disk, mut vol) = small_volume();
    let fd = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(fd, b"payload").unwrap();
    assert_eq!(vol.delete(b"f").unwrap_err(), Error::Busy);
    vol.close(fd).unwrap();
    vol.delete(b"f").unwrap();
    assert_eq!(vol.delete(b"f").unwrap_err(), Error::NotFound);
}

#[test]
fn nested_transactions_flatten() {
    let (disk, mut vol) = small_volume();
    let fd = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.transaction().unwrap();
    vol.write(fd, b"outer").unwrap();
    vol.transaction().unwrap();
    vol.write(fd, b"inner").unwrap();
    vol.commit().unwrap();
    // Still open: the inner commit only closed one level.
    vol.write(fd, b"more").unwrap();
    disk.crash();
    let vol2 = remount(&disk);
    assert_eq!(vol2.stat(b"f").unwrap().size, 0, "nothing committed yet");
    drop(vol2);
}

#[test]
fn io_error_poisons_transaction() {
    let (disk, mut vol) = small_volume();
    let fd = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.transaction().unwrap();
    vol.write(fd, b"good").unwrap();

    disk.fail_writes(true);
    assert_eq!(vol.write(fd, b"bad").unwrap_err(), Error::Io);
    disk.fail_writes(false);

    // Only abort may follow.
    assert_eq!(vol.write(fd, b"after").unwrap_err(), Error::TxnAborted);
    assert_eq!(vol.commit().unwrap_err(), Error::TxnAborted);
    vol.abort().unwrap();

    // The volume is usable again.
    vol.write(fd, b"fresh").unwrap();
    assert_eq!(vol.stat(b"f").unwrap().size, 5);
}

#[test]
fn aborted_create_disappears_with_its_handle() {
    let (_disk, mut vol) = small_volume();
    vol.transaction().unwrap();
    let fd = vol.open(b"temp", OpenFlags::APPEND).unwrap();
    vol.write(fd, b"data").unwrap();
    vol.abort().unwrap();

    assert_eq!(vol.stat(b"temp").unwrap_err(), Error::NotFound);
    // The handle died with the file.
    assert_eq!(vol.write(fd, b"x").unwrap_err(), Error::BadHandle);
}

#[test]
fn priority_update_on_reopen_persists() {
    let (disk, mut vol) = small_volume();
    let fd = vol
        .open(b"f", OpenFlags::APPEND | OpenFlags::PRIO_LOW)
        .unwrap();
    vol.write(fd, b"data").unwrap();
    vol.close(fd).unwrap();
    assert_eq!(vol.stat(b"f").unwrap().priority, Priority::Low);

    let fd = vol
        .open(b"f", OpenFlags::READ | OpenFlags::PRIO_HIGH)
        .unwrap();
    vol.close(fd).unwrap();
    assert_eq!(vol.stat(b"f").unwrap().priority, Priority::High);
    vol.unmount().unwrap();

    let vol = remount(&disk);
    assert_eq!(vol.stat(b"f").unwrap().priority, Priority::High);
}

#[test]
fn short_buffer_truncates_and_consumes() {
    let (_disk, mut vol) = small_volume();
    let w = vol.open(b"f", OpenFlags::APPEND).unwrap();
    vol.write(w, b"0123456789").unwrap();
    vol.write(w, b"abc").unwrap();
    let r = vol.open(b"f", OpenFlags::READ).unwrap();
    let mut small = [0u8; 4];
    assert_eq!(vol.read(r, Some(&mut small)).unwrap(), 4);
    assert_eq!(&small, b"0123");
    // The record was consumed despite the truncation.
    assert_eq!(vol.read(r, None).unwrap(), 3);
}

#[test]
fn unformatted_medium_refuses_mount() {
    let disk = MemDisk::new(8, 10);
    let mut vol = Volume::new(disk.clone());
    assert_eq!(vol.mount(false).unwrap_err(), Error::BadFormat);
    // With auto-format it comes up empty.
    vol.mount(true).unwrap();
    let mut n = 0;
    vol.list(|_| n += 1).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn operations_require_mount() {
    let disk = MemDisk::new(8, 10);
    let mut vol = Volume::new(disk);
    assert_eq!(vol.open(b"x", OpenFlags::READ).unwrap_err(), Error::NotMounted);
    assert_eq!(vol.stat(b"x").unwrap_err(), Error::NotMounted);
    assert_eq!(vol.transaction().unwrap_err(), Error::NotMounted);
}
