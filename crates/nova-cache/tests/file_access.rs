use fs2::FileExt;
use nova_cache::{CacheError, LockMode, LockOptions, LockedFileAccess};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn options(timeout: Duration) -> LockOptions {
    LockOptions {
        timeout,
        poll_interval: Duration::from_millis(5),
    }
}

/// A separate open file description behaves like another process's lock.
fn foreign_handle(lock_path: &Path) -> File {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .unwrap()
}

#[test]
fn read_inside_update_keeps_the_exclusive_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let access =
        LockedFileAccess::for_file(tmp.path().join("index.bin"), options(Duration::from_secs(5)))
            .unwrap();

    let nested = access
        .update_file(|| {
            let inner = access.read_file(|| Ok::<_, CacheError>(access.held_mode()))?;
            Ok::<_, CacheError>((inner, access.held_mode()))
        })
        .unwrap();

    assert_eq!(nested, (Some(LockMode::Exclusive), Some(LockMode::Exclusive)));
    assert_eq!(access.held_mode(), None);
}

#[test]
fn concurrent_readers_overlap() {
    let tmp = tempfile::tempdir().unwrap();
    let access = Arc::new(
        LockedFileAccess::for_file(tmp.path().join("index.bin"), options(Duration::from_secs(10)))
            .unwrap(),
    );
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let access = access.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                access
                    .read_file(|| {
                        // Both readers must be inside their actions at the same time.
                        barrier.wait();
                        Ok::<_, CacheError>(())
                    })
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn update_waits_for_active_readers() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("index.bin");
    let reader_access =
        Arc::new(LockedFileAccess::for_file(&path, options(Duration::from_secs(10))).unwrap());
    let writer_access =
        Arc::new(LockedFileAccess::for_file(&path, options(Duration::from_secs(10))).unwrap());
    let active_readers = Arc::new(AtomicUsize::new(0));
    let (inside_tx, inside_rx) = mpsc::channel();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let access = reader_access.clone();
            let active = active_readers.clone();
            let inside_tx = inside_tx.clone();
            thread::spawn(move || {
                access
                    .read_file(|| {
                        active.fetch_add(1, Ordering::SeqCst);
                        inside_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(100));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(())
                    })
                    .unwrap();
            })
        })
        .collect();

    inside_rx.recv().unwrap();
    let seen_by_writer = writer_access
        .update_file(|| Ok::<_, CacheError>(active_readers.load(Ordering::SeqCst)))
        .unwrap();
    assert_eq!(seen_by_writer, 0);

    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn lock_held_by_another_thread_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("index.bin");
    let holder =
        Arc::new(LockedFileAccess::for_file(&path, options(Duration::from_secs(10))).unwrap());
    let waiter = LockedFileAccess::for_file(&path, options(Duration::from_millis(100))).unwrap();
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder_thread = {
        let holder = holder.clone();
        thread::spawn(move || {
            holder
                .update_file(|| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok::<_, CacheError>(())
                })
                .unwrap();
        })
    };

    locked_rx.recv().unwrap();
    let err = waiter.read_file(|| Ok::<_, CacheError>(())).unwrap_err();
    assert!(err.is_lock_timeout(), "unexpected error: {err}");

    release_tx.send(()).unwrap();
    holder_thread.join().unwrap();
    waiter.read_file(|| Ok::<_, CacheError>(())).unwrap();
}

#[test]
fn lock_held_by_another_process_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let access = LockedFileAccess::for_file(
        tmp.path().join("index.bin"),
        options(Duration::from_millis(100)),
    )
    .unwrap();

    let foreign = foreign_handle(access.lock_path());
    FileExt::lock_exclusive(&foreign).unwrap();

    let err = access.read_file(|| Ok::<_, CacheError>(())).unwrap_err();
    match err {
        CacheError::LockTimeout { mode, .. } => assert_eq!(mode, LockMode::Shared),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(access.held_mode(), None);

    FileExt::unlock(&foreign).unwrap();
    access.update_file(|| Ok::<_, CacheError>(())).unwrap();
}

#[test]
fn failed_update_is_detected_by_the_next_reader() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("index.bin");
    let access = LockedFileAccess::for_file(&path, options(Duration::from_secs(5))).unwrap();

    let err = access
        .update_file(|| Err::<(), _>(CacheError::Io(std::io::Error::other("disk full"))))
        .unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));

    let reopened = LockedFileAccess::for_file(&path, options(Duration::from_secs(5))).unwrap();
    let err = reopened.read_file(|| Ok::<_, CacheError>(())).unwrap_err();
    assert!(err.is_integrity_violation(), "unexpected error: {err}");
    let err = reopened.update_file(|| Ok::<_, CacheError>(())).unwrap_err();
    assert!(err.is_integrity_violation(), "unexpected error: {err}");

    // Replacing the content wholesale doesn't care about prior state and cleans it up.
    reopened.write_file(|| Ok::<_, CacheError>(())).unwrap();
    reopened.read_file(|| Ok::<_, CacheError>(())).unwrap();
}

#[test]
fn closed_access_rejects_further_use() {
    let tmp = tempfile::tempdir().unwrap();
    let access =
        LockedFileAccess::for_file(tmp.path().join("index.bin"), options(Duration::from_secs(5)))
            .unwrap();
    access.read_file(|| Ok::<_, CacheError>(())).unwrap();

    access.close();

    for result in [
        access.read_file(|| Ok::<_, CacheError>(())),
        access.update_file(|| Ok::<_, CacheError>(())),
        access.write_file(|| Ok::<_, CacheError>(())),
    ] {
        assert!(matches!(result, Err(CacheError::LockClosed { .. })));
    }
}

#[test]
fn escalation_keeps_out_other_process_writers_while_waiting() {
    let tmp = tempfile::tempdir().unwrap();
    let access = Arc::new(
        LockedFileAccess::for_file(tmp.path().join("index.bin"), options(Duration::from_secs(10)))
            .unwrap(),
    );
    let foreign = foreign_handle(access.lock_path());
    FileExt::lock_shared(&foreign).unwrap();
    let (inside_tx, inside_rx) = mpsc::channel();

    let reader = {
        let access = access.clone();
        thread::spawn(move || {
            access.read_file(|| {
                inside_tx.send(()).unwrap();
                // Blocks on the other process's shared lock until it lets go.
                access.update_file(|| Ok::<_, CacheError>(access.held_mode()))
            })
        })
    };

    inside_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(200));
    let foreign_got_exclusive = FileExt::try_lock_exclusive(&foreign).is_ok();
    assert!(
        !foreign_got_exclusive,
        "another process took the exclusive lock while a reader was active"
    );

    FileExt::unlock(&foreign).unwrap();
    let inner = reader.join().unwrap().unwrap();
    assert_eq!(inner, Some(LockMode::Exclusive));
    assert_eq!(access.held_mode(), None);
}

#[test]
fn waiting_on_another_process_does_not_block_other_threads() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("index.bin");
    let access =
        Arc::new(LockedFileAccess::for_file(&path, options(Duration::from_secs(10))).unwrap());
    let observer = LockedFileAccess::for_file(&path, options(Duration::from_secs(10))).unwrap();
    let foreign = foreign_handle(access.lock_path());
    FileExt::lock_exclusive(&foreign).unwrap();

    let waiter = {
        let access = access.clone();
        thread::spawn(move || access.update_file(|| Ok::<_, CacheError>(())))
    };

    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    assert_eq!(observer.held_mode(), None);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "lock state stayed busy while polling: {:?}",
        started.elapsed()
    );

    FileExt::unlock(&foreign).unwrap();
    waiter.join().unwrap().unwrap();
}
