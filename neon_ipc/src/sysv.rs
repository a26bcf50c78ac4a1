//! Thin owning wrappers over System V message queues, shared memory segments
//! and semaphores.
//!
//! Every wrapper holds only the kernel identifier. Dropping one does not
//! destroy the kernel object; call `remove()` for that.

use libc::{c_int, c_void, key_t};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::slice;
use tracing::{debug, error};

/// Project id passed to `ftok` for every channel key.
pub const IPC_PROJECT_ID: c_int = 65;

const MODE_MASK: u32 = 0o777;

fn check(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Derive the SysV key for `path`.
///
/// With `create_anchor`, a missing anchor file is created empty first;
/// otherwise a missing file is an error.
pub fn ipc_key(path: &Path, create_anchor: bool) -> io::Result<key_t> {
    if create_anchor && !path.exists() {
        OpenOptions::new().write(true).create(true).open(path)?;
        debug!(path = %path.display(), "Created IPC key anchor file");
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), IPC_PROJECT_ID) };
    if key == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Message queues
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MessageQueue {
    id: c_int,
}

impl MessageQueue {
    /// Create the queue if needed and set its permission bits to `mode`.
    pub fn create(key: key_t, mode: u32) -> io::Result<Self> {
        let id = check(unsafe { libc::msgget(key, libc::IPC_CREAT | mode as c_int) })?;
        let queue = Self { id };
        queue.set_mode(mode)?;
        Ok(queue)
    }

    /// Open an existing queue.
    pub fn open(key: key_t) -> io::Result<Self> {
        let id = check(unsafe { libc::msgget(key, 0) })?;
        Ok(Self { id })
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn stat(&self) -> io::Result<libc::msqid_ds> {
        let mut ds: libc::msqid_ds = unsafe { mem::zeroed() };
        check(unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) })?;
        Ok(ds)
    }

    pub fn mode(&self) -> io::Result<u32> {
        Ok(self.stat()?.msg_perm.mode as u32 & MODE_MASK)
    }

    pub fn set_mode(&self, mode: u32) -> io::Result<()> {
        let mut ds = self.stat()?;
        ds.msg_perm.mode = (mode & MODE_MASK) as _;
        check(unsafe { libc::msgctl(self.id, libc::IPC_SET, &mut ds) })?;
        Ok(())
    }

    /// Number of messages waiting.
    pub fn pending(&self) -> io::Result<u64> {
        Ok(self.stat()?.msg_qnum as u64)
    }

    /// Pid of the most recent sender, but only while the queue is empty.
    ///
    /// Right after a receive this identifies the sender of the message just
    /// taken, provided nothing else reads the queue. Once another message is
    /// waiting, `msg_lspid` may belong to that later sender instead.
    pub fn sole_sender(&self) -> io::Result<Option<i32>> {
        let ds = self.stat()?;
        Ok((ds.msg_qnum == 0).then_some(ds.msg_lspid))
    }

    pub fn remove(&self) -> io::Result<()> {
        check(unsafe { libc::msgctl(self.id, libc::IPC_RMID, ptr::null_mut()) })?;
        debug!(msqid = self.id, "Removed message queue");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared memory
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SharedMemory {
    id: c_int,
    size: usize,
}

impl SharedMemory {
    /// Create a segment of at least `size` bytes and set its mode.
    pub fn create(key: key_t, size: usize, mode: u32) -> io::Result<Self> {
        let id = check(unsafe { libc::shmget(key, size, libc::IPC_CREAT | mode as c_int) })?;
        let segment = Self { id, size };
        segment.set_mode(mode)?;
        Ok(segment)
    }

    /// Open an existing segment; the size is read back from the kernel.
    pub fn open(key: key_t) -> io::Result<Self> {
        let id = check(unsafe { libc::shmget(key, 0, 0) })?;
        let mut segment = Self { id, size: 0 };
        segment.size = segment.stat()?.shm_segsz as usize;
        Ok(segment)
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stat(&self) -> io::Result<libc::shmid_ds> {
        let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
        check(unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) })?;
        Ok(ds)
    }

    pub fn mode(&self) -> io::Result<u32> {
        Ok(self.stat()?.shm_perm.mode as u32 & MODE_MASK)
    }

    pub fn set_mode(&self, mode: u32) -> io::Result<()> {
        let mut ds = self.stat()?;
        ds.shm_perm.mode = (mode & MODE_MASK) as _;
        check(unsafe { libc::shmctl(self.id, libc::IPC_SET, &mut ds) })?;
        Ok(())
    }

    /// Map the segment into this process until the returned guard drops.
    pub fn attach(&self) -> io::Result<Attachment> {
        let addr = unsafe { libc::shmat(self.id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Attachment {
            addr: addr.cast::<u8>(),
            len: self.size,
        })
    }

    /// Mark the segment for destruction once every process has detached.
    pub fn remove(&self) -> io::Result<()> {
        check(unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) })?;
        debug!(shmid = self.id, "Removed shared memory segment");
        Ok(())
    }
}

/// A mapped shared memory segment; detached on drop.
#[derive(Debug)]
pub struct Attachment {
    addr: *mut u8,
    len: usize,
}

impl Attachment {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if unsafe { libc::shmdt(self.addr as *const c_void) } == -1 {
            error!(error = %io::Error::last_os_error(), "shmdt failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Semaphores
// ---------------------------------------------------------------------------

/// A set holding one binary semaphore, used as the mailbox lock.
#[derive(Debug)]
pub struct Semaphore {
    id: c_int,
}

impl Semaphore {
    /// Create the set if needed and set its permission bits to `mode`.
    ///
    /// Only a freshly created semaphore is initialised to 1 (unlocked). An
    /// existing one keeps its value so a lock held across a broker restart
    /// stays held.
    pub fn create(key: key_t, mode: u32) -> io::Result<Self> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | mode as c_int;
        let sem = match check(unsafe { libc::semget(key, 1, flags) }) {
            Ok(id) => {
                check(unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as c_int) })?;
                debug!(semid = id, "Created semaphore set");
                Self { id }
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::open(key)?,
            Err(e) => return Err(e),
        };
        sem.set_mode(mode)?;
        Ok(sem)
    }

    pub fn open(key: key_t) -> io::Result<Self> {
        let id = check(unsafe { libc::semget(key, 1, 0) })?;
        Ok(Self { id })
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn stat(&self) -> io::Result<libc::semid_ds> {
        let mut ds: libc::semid_ds = unsafe { mem::zeroed() };
        let buf = &mut ds as *mut libc::semid_ds;
        check(unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, buf) })?;
        Ok(ds)
    }

    pub fn mode(&self) -> io::Result<u32> {
        Ok(self.stat()?.sem_perm.mode as u32 & MODE_MASK)
    }

    pub fn set_mode(&self, mode: u32) -> io::Result<()> {
        let mut ds = self.stat()?;
        ds.sem_perm.mode = (mode & MODE_MASK) as _;
        let buf = &mut ds as *mut libc::semid_ds;
        check(unsafe { libc::semctl(self.id, 0, libc::IPC_SET, buf) })?;
        Ok(())
    }

    /// Current semaphore value; 1 when unlocked.
    pub fn value(&self) -> io::Result<i32> {
        check(unsafe { libc::semctl(self.id, 0, libc::GETVAL) })
    }

    /// Block until the lock is taken.
    pub fn acquire(&self) -> io::Result<SemaphoreGuard<'_>> {
        loop {
            match self.op(-1, 0) {
                Ok(()) => return Ok(SemaphoreGuard { sem: self }),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the lock if it is free; `None` when another process holds it.
    pub fn try_acquire(&self) -> io::Result<Option<SemaphoreGuard<'_>>> {
        match self.op(-1, libc::IPC_NOWAIT) {
            Ok(()) => Ok(Some(SemaphoreGuard { sem: self })),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self) -> io::Result<()> {
        check(unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) })?;
        debug!(semid = self.id, "Removed semaphore set");
        Ok(())
    }

    // SEM_UNDO lets the kernel roll the operation back if the holder dies
    fn op(&self, delta: i16, extra_flags: c_int) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: (libc::SEM_UNDO | extra_flags) as i16,
        };
        check(unsafe { libc::semop(self.id, &mut op, 1) })?;
        Ok(())
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.op(1, 0) {
            error!(semid = self.sem.id, error = %e, "Failed to release semaphore");
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ipc_key_creates_anchor() {
        let dir = tempdir().unwrap();
        let anchor = dir.path().join("anchor");

        assert!(ipc_key(&anchor, false).is_err());
        let key = ipc_key(&anchor, true).unwrap();
        assert!(anchor.exists());
        assert_eq!(ipc_key(&anchor, false).unwrap(), key);
    }

    #[test]
    fn test_queue_mode_round_trip() {
        let dir = tempdir().unwrap();
        let key = ipc_key(&dir.path().join("queue"), true).unwrap();

        let queue = MessageQueue::create(key, 0o600).unwrap();
        assert_eq!(queue.mode().unwrap(), 0o600);
        queue.set_mode(0o666).unwrap();
        assert_eq!(queue.mode().unwrap(), 0o666);
        assert_eq!(queue.pending().unwrap(), 0);

        let reopened = MessageQueue::open(key).unwrap();
        assert_eq!(reopened.id(), queue.id());
        queue.remove().unwrap();
        assert!(MessageQueue::open(key).is_err());
    }

    #[test]
    fn test_shared_memory_attach_write_read() {
        let dir = tempdir().unwrap();
        let key = ipc_key(&dir.path().join("shm"), true).unwrap();

        let segment = SharedMemory::create(key, 64, 0o600).unwrap();
        assert_eq!(segment.mode().unwrap(), 0o600);
        {
            let mut attached = segment.attach().unwrap();
            attached.as_mut_slice()[..3].copy_from_slice(b"abc");
        }
        let other = SharedMemory::open(key).unwrap();
        assert_eq!(other.size(), 64);
        assert_eq!(&other.attach().unwrap().as_slice()[..3], b"abc");
        segment.remove().unwrap();
    }

    #[test]
    fn test_semaphore_lock_cycle() {
        let dir = tempdir().unwrap();
        let key = ipc_key(&dir.path().join("sem"), true).unwrap();

        let sem = Semaphore::create(key, 0o600).unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        {
            let _guard = sem.acquire().unwrap();
            assert_eq!(sem.value().unwrap(), 0);
            assert!(sem.try_acquire().unwrap().is_none());
        }
        assert_eq!(sem.value().unwrap(), 1);
        assert!(sem.try_acquire().unwrap().is_some());
        assert_eq!(sem.value().unwrap(), 1);
        assert_eq!(proc_sem_perms(sem.id()), Some(0o600));
        sem.remove().unwrap();
    }

    #[test]
    fn test_semaphore_recreate_applies_mode() {
        let dir = tempdir().unwrap();
        let key = ipc_key(&dir.path().join("sem_mode"), true).unwrap();

        let sem = Semaphore::create(key, 0o666).unwrap();
        assert_eq!(sem.mode().unwrap(), 0o666);

        let again = Semaphore::create(key, 0o600).unwrap();
        assert_eq!(again.id(), sem.id());
        assert_eq!(again.mode().unwrap(), 0o600);
        assert_eq!(proc_sem_perms(sem.id()), Some(0o600));
        sem.remove().unwrap();
    }

    #[test]
    fn test_semaphore_recreate_keeps_held_lock() {
        let dir = tempdir().unwrap();
        let key = ipc_key(&dir.path().join("sem_held"), true).unwrap();

        let sem = Semaphore::create(key, 0o600).unwrap();
        {
            let _guard = sem.acquire().unwrap();
            let again = Semaphore::create(key, 0o600).unwrap();
            assert_eq!(again.value().unwrap(), 0);
            assert!(again.try_acquire().unwrap().is_none());
        }
        assert_eq!(sem.value().unwrap(), 1);
        sem.remove().unwrap();
    }

    // Columns: key semid perms nsems ...
    fn proc_sem_perms(semid: c_int) -> Option<u32> {
        let table = std::fs::read_to_string("/proc/sysvipc/sem").ok()?;
        table.lines().skip(1).find_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.get(1)?.parse::<c_int>().ok()? == semid {
                u32::from_str_radix(cols.get(2)?, 8).ok()
            } else {
                None
            }
        })
    }
}
