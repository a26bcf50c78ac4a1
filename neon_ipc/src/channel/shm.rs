//! Shared memory mailbox channel.
//!
//! A single SysV segment holds at most one message. Writers overwrite it and
//! the broker empties it after reading. A companion semaphore under the same
//! key serialises both sides: producers wait for it, the broker only tries it
//! and skips the tick when a writer holds it.

use super::ChannelDriver;
use crate::cipher::PayloadCipher;
use crate::error::{ChannelError, ChannelResult};
use crate::framing::{read_c_string, read_length_prefixed, write_c_string, write_length_prefixed};
use crate::message::{Message, MAX_MESSAGE_SIZE};
use crate::sysv::{ipc_key, Semaphore, SharedMemory};
use shared_utils::config::{ChannelKind, Framing, SecurityLevel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Handle to the provisioned segment and its lock.
#[derive(Debug)]
pub struct ShmChannel {
    path: PathBuf,
    segment: SharedMemory,
    lock: Semaphore,
}

impl ShmChannel {
    /// Create the segment and its semaphore keyed by `path`, set the
    /// segment mode from `level` and reset the lock to unlocked.
    pub fn provision(
        path: impl AsRef<Path>,
        size: usize,
        level: SecurityLevel,
    ) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mode = level.mode();
        let key =
            ipc_key(&path, true).map_err(ChannelError::provisioning(ChannelKind::Shm, "ftok"))?;
        let segment = SharedMemory::create(key, size, mode)
            .map_err(ChannelError::provisioning(ChannelKind::Shm, "shmget"))?;
        let lock = Semaphore::create(key, mode)
            .map_err(ChannelError::provisioning(ChannelKind::Shm, "semget"))?;

        info!(
            path = %path.display(),
            shmid = segment.id(),
            semid = lock.id(),
            size,
            %level,
            "Shared memory channel ready"
        );
        Ok(Self {
            path,
            segment,
            lock,
        })
    }

    /// Open the existing segment and semaphore keyed by `path`.
    pub fn open(path: impl AsRef<Path>) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let key = ipc_key(&path, false).map_err(ChannelError::sys("ftok"))?;
        let segment = SharedMemory::open(key).map_err(ChannelError::sys("shmget"))?;
        let lock = Semaphore::open(key).map_err(ChannelError::sys("semget"))?;
        Ok(Self {
            path,
            segment,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.segment.size()
    }

    /// Permission bits of the segment.
    pub fn mode(&self) -> ChannelResult<u32> {
        self.segment
            .mode()
            .map_err(ChannelError::sys("shmctl(IPC_STAT)"))
    }

    /// Semaphore value; 1 means unlocked.
    pub fn lock_value(&self) -> ChannelResult<i32> {
        self.lock.value().map_err(ChannelError::sys("semctl(GETVAL)"))
    }

    /// Remove the segment and the semaphore. Both are attempted; the first
    /// failure is returned.
    pub fn remove(&self) -> ChannelResult<()> {
        let segment = self
            .segment
            .remove()
            .map_err(ChannelError::sys("shmctl(IPC_RMID)"));
        let lock = self
            .lock
            .remove()
            .map_err(ChannelError::sys("semctl(IPC_RMID)"));
        segment.and(lock)
    }
}

fn read_region(region: &[u8], framing: Framing) -> ChannelResult<Option<Vec<u8>>> {
    let content = match framing {
        Framing::Raw => read_c_string(region),
        Framing::LengthPrefixed => read_length_prefixed(region)?,
    };
    match content {
        Some(bytes) if bytes.len() > MAX_MESSAGE_SIZE => Err(ChannelError::MalformedPayload(
            format!(
                "shared memory holds {} bytes (max {MAX_MESSAGE_SIZE})",
                bytes.len()
            ),
        )),
        Some(bytes) => Ok(Some(bytes.to_vec())),
        None => Ok(None),
    }
}

/// Broker-side reader of the mailbox.
#[derive(Debug)]
pub struct ShmDriver {
    channel: ShmChannel,
    security: SecurityLevel,
    framing: Framing,
    cipher: Arc<dyn PayloadCipher>,
}

impl ShmDriver {
    pub fn new(
        channel: ShmChannel,
        security: SecurityLevel,
        framing: Framing,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            channel,
            security,
            framing,
            cipher,
        }
    }

    pub fn channel(&self) -> &ShmChannel {
        &self.channel
    }

    /// Read and clear the region under the lock. `None` when the region is
    /// empty or a writer holds the lock.
    fn take(&self) -> ChannelResult<Option<Vec<u8>>> {
        let Some(_lock) = self
            .channel
            .lock
            .try_acquire()
            .map_err(ChannelError::sys("semop"))?
        else {
            debug!("Shared memory locked by a writer, skipping");
            return Ok(None);
        };
        let mut region = self
            .channel
            .segment
            .attach()
            .map_err(ChannelError::sys("shmat"))?;

        let taken = read_region(region.as_slice(), self.framing);
        // Malformed content is cleared as well so it is reported only once
        if !matches!(taken, Ok(None)) {
            region.as_mut_slice().fill(0);
        }
        taken
    }
}

impl ChannelDriver for ShmDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Shm
    }

    fn security(&self) -> SecurityLevel {
        self.security
    }

    fn poll(&mut self) -> ChannelResult<Option<Message>> {
        let Some(ciphertext) = self.take()? else {
            return Ok(None);
        };
        trace!(bytes = ciphertext.len(), "Took shared memory message");
        let payload = self.cipher.decrypt(&ciphertext)?;
        Ok(Some(Message::new(ChannelKind::Shm, self.security, payload)))
    }

    fn remove(&self) -> ChannelResult<()> {
        self.channel.remove()
    }
}

/// Writer side of the mailbox.
#[derive(Debug)]
pub struct ShmProducer {
    channel: ShmChannel,
    framing: Framing,
    cipher: Arc<dyn PayloadCipher>,
}

impl ShmProducer {
    pub fn open(
        path: impl AsRef<Path>,
        framing: Framing,
        cipher: Arc<dyn PayloadCipher>,
    ) -> ChannelResult<Self> {
        Ok(Self {
            channel: ShmChannel::open(path)?,
            framing,
            cipher,
        })
    }

    pub fn channel(&self) -> &ShmChannel {
        &self.channel
    }

    /// Encrypt `text` and store it, replacing any message not yet taken.
    ///
    /// In raw framing the ciphertext must not contain NUL bytes. With the XOR
    /// cipher that rules out any text byte equal to the key byte it lines up
    /// with; `"Test message 0"` under the default key is one such text.
    pub fn send(&self, text: &[u8]) -> ChannelResult<()> {
        let ciphertext = self.cipher.encrypt(text)?;
        if ciphertext.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MalformedPayload(format!(
                "message of {} bytes exceeds the {} byte limit",
                ciphertext.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if self.framing == Framing::Raw {
            if let Some(offset) = ciphertext.iter().position(|&b| b == 0) {
                return Err(ChannelError::MalformedPayload(format!(
                    "ciphertext has a NUL byte at offset {offset} and cannot be stored \
                     with raw framing; set framing = \"length-prefixed\" under \
                     [channels.shm]"
                )));
            }
        }

        let _lock = self
            .channel
            .lock
            .acquire()
            .map_err(ChannelError::sys("semop"))?;
        let mut region = self
            .channel
            .segment
            .attach()
            .map_err(ChannelError::sys("shmat"))?;
        match self.framing {
            Framing::Raw => write_c_string(region.as_mut_slice(), &ciphertext)?,
            Framing::LengthPrefixed => write_length_prefixed(region.as_mut_slice(), &ciphertext)?,
        }
        trace!(bytes = ciphertext.len(), "Wrote shared memory message");
        Ok(())
    }
}
