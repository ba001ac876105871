use crate::cache_dir::DEFAULT_LOCK_TIMEOUT;
use crate::error::CacheError;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Name of the lock file created inside directory targets.
pub const DIRECTORY_LOCK_FILE_NAME: &str = "cache.lock";

const STATE_CLEAN: u8 = 0;
const STATE_DIRTY: u8 = 1;
/// Bytes 1..9 of the lock file count exclusive acquisitions across processes.
const GENERATION_OFFSET: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Directory,
}

#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Upper bound on how long an acquisition (or escalation) may block.
    pub timeout: Duration,
    /// Delay between attempts while another process holds the OS lock.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Synchronises access to a file (or a directory of related files) with other
/// threads and other processes.
///
/// Every handle for the same target shares one in-process lock state, keyed by
/// the lock file path. Cross-process exclusion uses an OS advisory lock on that
/// lock file. Reentrancy is tracked per thread: a thread already holding a
/// sufficient lock runs nested actions without touching the lock.
///
/// The first byte of the lock file records whether the last exclusive holder
/// finished cleanly. Actions run under [`LockedFileAccess::read_file`] and
/// [`LockedFileAccess::update_file`] refuse to start on a file target left dirty.
///
/// OS locks can't always be converted atomically, so escalating a shared lock
/// keeps re-taking it between attempts and fails with
/// [`CacheError::EscalationConflict`] if another process wrote in the meantime.
#[derive(Debug)]
pub struct LockedFileAccess {
    target: PathBuf,
    kind: TargetKind,
    options: LockOptions,
    lock: Arc<ProcessLock>,
    closed: AtomicBool,
}

impl LockedFileAccess {
    /// Guards the file at `path`; the lock file is `<path>.lock`.
    pub fn for_file(path: impl AsRef<Path>, options: LockOptions) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let parent = std::fs::canonicalize(parent)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::other("lock target has no file name"))?;

        let mut lock_name = file_name.to_os_string();
        lock_name.push(".lock");
        let lock_path = parent.join(lock_name);
        Ok(Self::new(
            parent.join(file_name),
            TargetKind::File,
            lock_path,
            options,
        ))
    }

    /// Guards a directory of related files. Integrity is never checked for
    /// directory targets.
    pub fn for_directory(dir: impl AsRef<Path>, options: LockOptions) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let dir = std::fs::canonicalize(dir.as_ref())?;
        let lock_path = dir.join(DIRECTORY_LOCK_FILE_NAME);
        Ok(Self::new(dir, TargetKind::Directory, lock_path, options))
    }

    fn new(target: PathBuf, kind: TargetKind, lock_path: PathBuf, options: LockOptions) -> Self {
        Self {
            target,
            kind,
            options,
            lock: process_lock_for_path(&lock_path),
            closed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock.lock_path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// The lock level the calling thread currently holds on this target.
    pub fn held_mode(&self) -> Option<LockMode> {
        self.lock
            .state
            .lock()
            .holders
            .get(&thread::current().id())
            .copied()
    }

    /// Runs `action` under at least a shared lock.
    ///
    /// If the calling thread already holds a lock, the level is left unchanged.
    pub fn read_file<T, E>(&self, action: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        self.run_locked(LockMode::Shared, true, action)
    }

    /// Runs `action` under an exclusive lock, escalating a held shared lock and
    /// reverting to it afterwards. If `action` fails the target stays marked as
    /// uncleanly unlocked.
    pub fn update_file<T, E>(&self, action: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        self.run_locked(LockMode::Exclusive, true, action)
    }

    /// Same locking as [`LockedFileAccess::update_file`] without the integrity
    /// check, for callers that replace the content wholesale.
    pub fn write_file<T, E>(&self, action: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        self.run_locked(LockMode::Exclusive, false, action)
    }

    /// Closes this handle. Later calls fail with [`CacheError::LockClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock.state.lock();
        if state.holders.is_empty() {
            if let Some(file) = state.file.take() {
                let _ = FileExt::unlock(&file);
            }
            state.os_mode = None;
        }
        tracing::debug!(
            target = "nova.cache",
            path = %self.target.display(),
            "closed cache lock"
        );
    }

    fn run_locked<T, E>(
        &self,
        mode: LockMode,
        check_integrity: bool,
        action: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::LockClosed {
                path: self.target.clone(),
            }
            .into());
        }

        let held = self.lock.acquire(mode, &self.options)?;
        let scope = LockScope {
            access: self,
            previous: held.previous,
            active: held.acquired,
        };

        let must_check = held.acquired && check_integrity && self.kind == TargetKind::File;
        if must_check && !self.lock.is_clean()? {
            return Err(CacheError::IntegrityViolation {
                path: self.target.clone(),
            }
            .into());
        }

        // Only the scope that took the exclusive lock tracks integrity.
        let tracks_integrity = held.acquired && mode == LockMode::Exclusive;
        if tracks_integrity {
            self.lock.set_clean(false)?;
        }

        let result = action();

        if tracks_integrity && result.is_ok() {
            self.lock.set_clean(true)?;
        }
        scope.release()?;
        result
    }
}

struct Held {
    previous: Option<LockMode>,
    acquired: bool,
}

/// Restores the thread's previous lock level, including on unwind.
struct LockScope<'a> {
    access: &'a LockedFileAccess,
    previous: Option<LockMode>,
    active: bool,
}

impl LockScope<'_> {
    fn release(mut self) -> Result<(), CacheError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.access
            .lock
            .release(self.previous, &self.access.options)
    }
}

impl Drop for LockScope<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self
            .access
            .lock
            .release(self.previous, &self.access.options)
        {
            tracing::warn!(
                target = "nova.cache",
                path = %self.access.target.display(),
                error = %err,
                "failed to release cache lock"
            );
        }
    }
}

#[derive(Debug)]
struct ProcessLock {
    lock_path: PathBuf,
    state: Mutex<LockState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    holders: HashMap<ThreadId, LockMode>,
    waiting_exclusive: usize,
    file: Option<File>,
    os_mode: Option<LockMode>,
}

impl LockState {
    fn desired_os_mode(&self) -> Option<LockMode> {
        if self.holders.values().any(|mode| *mode == LockMode::Exclusive) {
            Some(LockMode::Exclusive)
        } else if self.holders.is_empty() {
            None
        } else {
            Some(LockMode::Shared)
        }
    }

    fn is_blocked(&self, me: ThreadId, mode: LockMode) -> bool {
        match mode {
            // Waiting writers block new readers so escalation can't starve.
            LockMode::Shared => {
                self.waiting_exclusive > 0
                    || self
                        .holders
                        .iter()
                        .any(|(id, held)| *id != me && *held == LockMode::Exclusive)
            }
            LockMode::Exclusive => self.holders.keys().any(|id| *id != me),
        }
    }
}

impl ProcessLock {
    fn acquire(&self, mode: LockMode, options: &LockOptions) -> Result<Held, CacheError> {
        let me = thread::current().id();
        let deadline = Instant::now() + options.timeout;
        let mut state = self.state.lock();

        let previous = state.holders.get(&me).copied();
        if previous == Some(LockMode::Exclusive) || previous == Some(mode) {
            return Ok(Held {
                previous,
                acquired: false,
            });
        }

        if mode == LockMode::Exclusive {
            state.waiting_exclusive += 1;
        }
        let mut waited = Ok(());
        while state.is_blocked(me, mode) {
            if Instant::now() >= deadline {
                waited = Err(self.timeout_error(mode, options));
                break;
            }
            self.changed.wait_until(&mut state, deadline);
        }
        if mode == LockMode::Exclusive {
            state.waiting_exclusive -= 1;
        }
        if let Err(err) = waited {
            drop(state);
            self.changed.notify_all();
            return Err(err);
        }

        state.holders.insert(me, mode);
        let desired = state.desired_os_mode();
        if let Err(err) = self.sync_os_lock(&mut state, desired, deadline, options) {
            match previous {
                Some(previous) => state.holders.insert(me, previous),
                None => state.holders.remove(&me),
            };
            let restore = state.desired_os_mode();
            if let Err(restore_err) =
                self.sync_os_lock(&mut state, restore, Instant::now() + options.timeout, options)
            {
                tracing::warn!(
                    target = "nova.cache",
                    path = %self.lock_path.display(),
                    error = %restore_err,
                    "failed to restore cache lock after failed acquisition"
                );
            }
            drop(state);
            self.changed.notify_all();
            return Err(err);
        }

        tracing::trace!(
            target = "nova.cache",
            path = %self.lock_path.display(),
            %mode,
            escalated = previous.is_some(),
            "acquired cache lock"
        );
        Ok(Held {
            previous,
            acquired: true,
        })
    }

    fn release(&self, previous: Option<LockMode>, options: &LockOptions) -> Result<(), CacheError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match previous {
            Some(mode) => state.holders.insert(me, mode),
            None => state.holders.remove(&me),
        };
        let desired = state.desired_os_mode();
        let deadline = Instant::now() + options.timeout;
        let result = self.sync_os_lock(&mut state, desired, deadline, options);
        drop(state);
        self.changed.notify_all();
        result
    }

    /// Moves the OS lock to `desired`. Called with the state mutex held; the
    /// mutex is released while waiting between attempts.
    fn sync_os_lock(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        desired: Option<LockMode>,
        deadline: Instant,
        options: &LockOptions,
    ) -> Result<(), CacheError> {
        if state.os_mode == desired {
            return Ok(());
        }

        let Some(mode) = desired else {
            if let Some(file) = state.file.as_ref() {
                if let Err(err) = FileExt::unlock(file) {
                    tracing::debug!(
                        target = "nova.cache",
                        path = %self.lock_path.display(),
                        error = %err,
                        "failed to unlock cache lock file"
                    );
                }
            }
            state.os_mode = None;
            return Ok(());
        };

        if state.file.is_none() {
            state.file = Some(open_lock_file(&self.lock_path)?);
        }
        let file = self.lock_file(state)?;

        // Generation seen under the shared lock; any writer that gets in bumps it.
        let escalating = mode == LockMode::Exclusive && state.os_mode == Some(LockMode::Shared);
        let escalating_from = if escalating {
            Some(read_generation(&file)?)
        } else {
            None
        };

        loop {
            match try_lock(&file, mode) {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    if let Some(observed) = escalating_from {
                        self.retake_shared(state, &file, observed)?;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        if escalating_from.is_none() {
                            // A failed conversion may have dropped the old lock.
                            let _ = FileExt::unlock(&file);
                            state.os_mode = None;
                        }
                        return Err(self.timeout_error(mode, options));
                    }
                    let pause = options.poll_interval.min(deadline - now);
                    self.changed.wait_for(state, pause);
                }
                Err(err) => {
                    let _ = FileExt::unlock(&file);
                    state.os_mode = None;
                    return Err(err.into());
                }
            }
        }

        if mode == LockMode::Exclusive {
            if let Some(observed) = escalating_from {
                if read_generation(&file)? != observed {
                    state.os_mode = match try_lock(&file, LockMode::Shared) {
                        Ok(()) => Some(LockMode::Shared),
                        Err(_) => {
                            let _ = FileExt::unlock(&file);
                            None
                        }
                    };
                    return Err(self.escalation_conflict());
                }
            }
            bump_generation(&file)?;
        }
        state.os_mode = Some(mode);
        Ok(())
    }

    /// Restores the shared lock after a failed conversion attempt. Fails if it
    /// can't be re-taken or a writer got in while it was gone.
    fn retake_shared(
        &self,
        state: &mut LockState,
        file: &File,
        observed: u64,
    ) -> Result<(), CacheError> {
        if let Err(err) = try_lock(file, LockMode::Shared) {
            state.os_mode = None;
            return Err(if is_contended(&err) {
                self.escalation_conflict()
            } else {
                err.into()
            });
        }
        if read_generation(file)? != observed {
            return Err(self.escalation_conflict());
        }
        Ok(())
    }

    /// A second handle to the lock file, so the state mutex can be released
    /// while polling. Locks taken through it belong to the same open file
    /// description.
    fn lock_file(&self, state: &LockState) -> Result<File, CacheError> {
        match state.file.as_ref() {
            Some(file) => Ok(file.try_clone()?),
            None => Err(io::Error::other("lock file unavailable").into()),
        }
    }

    fn is_clean(&self) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        let Some(file) = state.file.as_mut() else {
            return Ok(true);
        };
        file.seek(SeekFrom::Start(0))?;
        let mut marker = [0_u8; 1];
        let read = file.read(&mut marker)?;
        Ok(read == 0 || marker[0] != STATE_DIRTY)
    }

    fn set_clean(&self, clean: bool) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&[if clean { STATE_CLEAN } else { STATE_DIRTY }])?;
        file.sync_data()?;
        Ok(())
    }

    fn escalation_conflict(&self) -> CacheError {
        CacheError::EscalationConflict {
            path: self.lock_path.clone(),
        }
    }

    fn timeout_error(&self, mode: LockMode, options: &LockOptions) -> CacheError {
        CacheError::LockTimeout {
            path: self.lock_path.clone(),
            mode,
            timeout: options.timeout,
        }
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    }
}

fn read_generation(mut file: &File) -> io::Result<u64> {
    file.seek(SeekFrom::Start(GENERATION_OFFSET))?;
    let mut bytes = [0_u8; 8];
    match file.read_exact(&mut bytes) {
        Ok(()) => Ok(u64::from_le_bytes(bytes)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(err),
    }
}

fn bump_generation(mut file: &File) -> io::Result<()> {
    let next = read_generation(file)?.wrapping_add(1);
    file.seek(SeekFrom::Start(GENERATION_OFFSET))?;
    file.write_all(&next.to_le_bytes())
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn open_lock_file(path: &Path) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

fn process_lock_for_path(lock_path: &Path) -> Arc<ProcessLock> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<ProcessLock>>>> = OnceLock::new();
    let mut locks = PROCESS_LOCKS.get_or_init(Default::default).lock();
    locks
        .entry(lock_path.to_path_buf())
        .or_insert_with(|| {
            Arc::new(ProcessLock {
                lock_path: lock_path.to_path_buf(),
                state: Mutex::new(LockState::default()),
                changed: Condvar::new(),
            })
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn handles_for_the_same_target_share_lock_state() {
        let tmp = tempfile::tempdir().unwrap();
        let a = LockedFileAccess::for_file(tmp.path().join("index.bin"), quick()).unwrap();
        let b = LockedFileAccess::for_file(tmp.path().join("index.bin"), quick()).unwrap();

        a.update_file(|| {
            assert_eq!(b.held_mode(), Some(LockMode::Exclusive));
            Ok::<_, CacheError>(())
        })
        .unwrap();
        assert_eq!(b.held_mode(), None);
    }

    #[test]
    fn escalation_reverts_to_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let access = LockedFileAccess::for_file(tmp.path().join("index.bin"), quick()).unwrap();

        access
            .read_file(|| {
                assert_eq!(access.held_mode(), Some(LockMode::Shared));
                access.update_file(|| {
                    assert_eq!(access.held_mode(), Some(LockMode::Exclusive));
                    Ok::<_, CacheError>(())
                })?;
                assert_eq!(access.held_mode(), Some(LockMode::Shared));
                Ok::<_, CacheError>(())
            })
            .unwrap();
        assert_eq!(access.held_mode(), None);
    }

    #[test]
    fn escalation_fails_if_another_process_wrote_meanwhile() {
        let tmp = tempfile::tempdir().unwrap();
        let options = LockOptions {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        };
        let access = LockedFileAccess::for_file(tmp.path().join("index.bin"), options).unwrap();
        let foreign = open_lock_file(access.lock_path()).unwrap();
        FileExt::lock_shared(&foreign).unwrap();

        let writer = {
            let foreign = foreign.try_clone().unwrap();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                // What another process's exclusive holder leaves behind.
                bump_generation(&foreign).unwrap();
            })
        };

        let err = access
            .read_file(|| {
                let err = access
                    .update_file(|| Ok::<_, CacheError>(()))
                    .unwrap_err();
                assert_eq!(access.held_mode(), Some(LockMode::Shared));
                Ok::<_, CacheError>(err)
            })
            .unwrap();
        assert!(err.is_escalation_conflict(), "unexpected error: {err}");
        writer.join().unwrap();

        FileExt::unlock(&foreign).unwrap();
        access.update_file(|| Ok::<_, CacheError>(())).unwrap();
    }

    #[test]
    fn exclusive_acquisitions_advance_the_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let access = LockedFileAccess::for_file(tmp.path().join("index.bin"), quick()).unwrap();
        let lock_file_handle = || open_lock_file(access.lock_path()).unwrap();

        access.update_file(|| Ok::<_, CacheError>(())).unwrap();
        assert_eq!(read_generation(&lock_file_handle()).unwrap(), 1);
        access.read_file(|| Ok::<_, CacheError>(())).unwrap();
        access.write_file(|| Ok::<_, CacheError>(())).unwrap();
        assert_eq!(read_generation(&lock_file_handle()).unwrap(), 2);
        access.read_file(|| Ok::<_, CacheError>(())).unwrap();
    }

    #[test]
    fn directory_targets_never_report_integrity_violations() {
        let tmp = tempfile::tempdir().unwrap();
        let access = LockedFileAccess::for_directory(tmp.path().join("root"), quick()).unwrap();

        let _ = access.update_file(|| Err::<(), _>(CacheError::MissingHomeDir));
        access.read_file(|| Ok::<_, CacheError>(())).unwrap();
        assert!(tmp.path().join("root").join(DIRECTORY_LOCK_FILE_NAME).is_file());
    }

    #[test]
    fn panicking_action_releases_the_lock_and_leaves_target_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.bin");
        let access = LockedFileAccess::for_file(&path, quick()).unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = access.update_file(|| -> Result<(), CacheError> { panic!("boom") });
        }));
        assert!(panicked.is_err());
        assert_eq!(access.held_mode(), None);

        let err = access.read_file(|| Ok::<_, CacheError>(())).unwrap_err();
        assert!(err.is_integrity_violation(), "unexpected error: {err}");
    }
}
