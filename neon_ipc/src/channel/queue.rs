//! SysV message queue channel.
//!
//! Every message is a type-1 frame whose body carries the ciphertext, its
//! length, the sender's pid and the sender's declared name. Text-only bodies
//! of exactly [`MAX_MESSAGE_SIZE`] bytes, as older writers send them, are
//! still accepted.

use super::ChannelDriver;
use crate::cipher::PayloadCipher;
use crate::error::{ChannelError, ChannelResult};
use crate::framing::read_c_string;
use crate::message::{Message, MAX_MESSAGE_SIZE};
use crate::registry::{truncate_name, MAX_NAME_LEN};
use crate::sysv::{ipc_key, MessageQueue};
use libc::{c_long, c_void};
use shared_utils::config::{ChannelKind, SecurityLevel};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// `mtype` of every broker message.
pub const QUEUE_MESSAGE_TYPE: c_long = 1;

/// Bytes reserved for the sender name, NUL terminator included.
pub const SENDER_NAME_SIZE: usize = MAX_NAME_LEN + 1;

/// Frame body as stored in the queue.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueueBody {
    pub text: [u8; MAX_MESSAGE_SIZE],
    pub len: u32,
    pub sender_pid: i32,
    pub sender_name: [u8; SENDER_NAME_SIZE],
}

/// Size of the body passed to `msgsnd`/`msgrcv`.
pub const BODY_SIZE: usize = mem::size_of::<QueueBody>();

#[repr(C)]
struct QueueFrame {
    mtype: c_long,
    body: QueueBody,
}

impl QueueFrame {
    fn empty() -> Self {
        Self {
            mtype: 0,
            body: QueueBody {
                text: [0; MAX_MESSAGE_SIZE],
                len: 0,
                sender_pid: 0,
                sender_name: [0; SENDER_NAME_SIZE],
            },
        }
    }
}

// Text-only frame sent by older writers
#[repr(C)]
#[allow(dead_code)]
struct LegacyFrame {
    mtype: c_long,
    text: [u8; MAX_MESSAGE_SIZE],
}

/// Handle to the provisioned queue.
#[derive(Debug)]
pub struct QueueChannel {
    path: PathBuf,
    queue: MessageQueue,
}

impl QueueChannel {
    /// Create the queue keyed by `path` (anchor file created if absent) and
    /// set its mode from `level`.
    pub fn provision(path: impl AsRef<Path>, level: SecurityLevel) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let key =
            ipc_key(&path, true).map_err(ChannelError::provisioning(ChannelKind::Queue, "ftok"))?;
        let queue = MessageQueue::create(key, level.mode())
            .map_err(ChannelError::provisioning(ChannelKind::Queue, "msgget"))?;

        info!(
            path = %path.display(),
            msqid = queue.id(),
            %level,
            "Queue channel ready"
        );
        Ok(Self { path, queue })
    }

    /// Open the existing queue keyed by `path`.
    pub fn open(path: impl AsRef<Path>) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let key = ipc_key(&path, false).map_err(ChannelError::sys("ftok"))?;
        let queue = MessageQueue::open(key).map_err(ChannelError::sys("msgget"))?;
        Ok(Self { path, queue })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> ChannelResult<u32> {
        self.queue.mode().map_err(ChannelError::sys("msgctl(IPC_STAT)"))
    }

    /// Messages waiting in the queue.
    pub fn pending(&self) -> ChannelResult<u64> {
        self.queue
            .pending()
            .map_err(ChannelError::sys("msgctl(IPC_STAT)"))
    }

    pub fn remove(&self) -> ChannelResult<()> {
        self.queue
            .remove()
            .map_err(ChannelError::sys("msgctl(IPC_RMID)"))
    }

    /// Receive one type-1 frame without waiting; returns the body size.
    fn receive(&self, frame: &mut QueueFrame) -> ChannelResult<Option<usize>> {
        let received = unsafe {
            libc::msgrcv(
                self.queue.id(),
                frame as *mut QueueFrame as *mut c_void,
                BODY_SIZE,
                QUEUE_MESSAGE_TYPE,
                libc::IPC_NOWAIT,
            )
        };
        if received >= 0 {
            return Ok(Some(received as usize));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOMSG) | Some(libc::EINTR) => Ok(None),
            Some(libc::E2BIG) => {
                // Take the oversized message off the queue so it cannot jam it
                unsafe {
                    libc::msgrcv(
                        self.queue.id(),
                        frame as *mut QueueFrame as *mut c_void,
                        BODY_SIZE,
                        QUEUE_MESSAGE_TYPE,
                        libc::IPC_NOWAIT | libc::MSG_NOERROR,
                    )
                };
                Err(ChannelError::MalformedPayload(format!(
                    "queue message larger than {BODY_SIZE} bytes discarded"
                )))
            }
            _ => Err(ChannelError::Sys {
                op: "msgrcv",
                source: err,
            }),
        }
    }

    fn send_bytes<T>(&self, frame: &T, size: usize) -> ChannelResult<()> {
        loop {
            let ret = unsafe {
                libc::msgsnd(
                    self.queue.id(),
                    frame as *const T as *const c_void,
                    size,
                    0,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ChannelError::Sys {
                    op: "msgsnd",
                    source: err,
                });
            }
        }
    }

    fn sole_sender(&self) -> ChannelResult<Option<i32>> {
        self.queue
            .sole_sender()
            .map_err(ChannelError::sys("msgctl(IPC_STAT)"))
    }
}

/// Broker-side reader of the queue.
#[derive(Debug)]
pub struct QueueDriver {
    channel: QueueChannel,
    security: SecurityLevel,
    cipher: Arc<dyn PayloadCipher>,
}

impl QueueDriver {
    pub fn new(
        channel: QueueChannel,
        security: SecurityLevel,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            channel,
            security,
            cipher,
        }
    }

    pub fn channel(&self) -> &QueueChannel {
        &self.channel
    }

    fn decode(&self, body: &QueueBody, size: usize) -> ChannelResult<Message> {
        if size == BODY_SIZE {
            let len = body.len as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(ChannelError::MalformedPayload(format!(
                    "queue frame declares {len} bytes (max {MAX_MESSAGE_SIZE})"
                )));
            }
            let payload = self.cipher.decrypt(&body.text[..len])?;
            let name = read_c_string(&body.sender_name)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
            return Ok(Message::new(ChannelKind::Queue, self.security, payload)
                .with_sender(body.sender_pid, name));
        }

        if size == MAX_MESSAGE_SIZE {
            let text = read_c_string(&body.text).unwrap_or_default();
            let payload = self.cipher.decrypt(text)?;
            let message = Message::new(ChannelKind::Queue, self.security, payload);
            // Text-only frames carry no identity of their own
            return Ok(match self.channel.sole_sender()? {
                Some(pid) => {
                    debug!(pid, "Accepted text-only queue frame");
                    message.with_sender(pid, None)
                }
                None => {
                    debug!("Accepted text-only queue frame from an unknown sender");
                    message
                }
            });
        }

        Err(ChannelError::MalformedPayload(format!(
            "unexpected queue frame of {size} bytes"
        )))
    }
}

impl ChannelDriver for QueueDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Queue
    }

    fn security(&self) -> SecurityLevel {
        self.security
    }

    fn poll(&mut self) -> ChannelResult<Option<Message>> {
        let mut frame = QueueFrame::empty();
        match self.channel.receive(&mut frame)? {
            Some(size) => {
                debug_assert_eq!(frame.mtype, QUEUE_MESSAGE_TYPE);
                self.decode(&frame.body, size).map(Some)
            }
            None => Ok(None),
        }
    }

    fn remove(&self) -> ChannelResult<()> {
        self.channel.remove()
    }
}

/// Writer side of the queue.
#[derive(Debug)]
pub struct QueueProducer {
    channel: QueueChannel,
    cipher: Arc<dyn PayloadCipher>,
    pid: i32,
    name: String,
}

impl QueueProducer {
    /// Open the existing queue at `path`, identifying as `name`.
    pub fn open(
        path: impl AsRef<Path>,
        name: &str,
        cipher: Arc<dyn PayloadCipher>,
    ) -> ChannelResult<Self> {
        Ok(Self {
            channel: QueueChannel::open(path)?,
            cipher,
            pid: nix::unistd::getpid().as_raw(),
            name: truncate_name(name),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Encrypt and enqueue one frame carrying our pid and name.
    pub fn send(&self, text: &[u8]) -> ChannelResult<()> {
        let ciphertext = self.cipher.encrypt(text)?;
        if ciphertext.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MalformedPayload(format!(
                "message of {} bytes exceeds the {} byte limit",
                ciphertext.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut frame = QueueFrame::empty();
        frame.mtype = QUEUE_MESSAGE_TYPE;
        frame.body.text[..ciphertext.len()].copy_from_slice(&ciphertext);
        frame.body.len = ciphertext.len() as u32;
        frame.body.sender_pid = self.pid;
        frame.body.sender_name[..self.name.len()].copy_from_slice(self.name.as_bytes());

        self.channel.send_bytes(&frame, BODY_SIZE)
    }

    /// Enqueue a text-only frame the way older writers do: NUL-terminated
    /// ciphertext and no sender identity.
    pub fn send_legacy(&self, text: &[u8]) -> ChannelResult<()> {
        let ciphertext = self.cipher.encrypt(text)?;
        if ciphertext.len() >= MAX_MESSAGE_SIZE {
            return Err(ChannelError::MalformedPayload(format!(
                "message of {} bytes does not fit a text-only frame",
                ciphertext.len()
            )));
        }
        if ciphertext.contains(&0) {
            return Err(ChannelError::MalformedPayload(
                "ciphertext contains a NUL byte and cannot travel as text".to_string(),
            ));
        }

        let mut frame = LegacyFrame {
            mtype: QUEUE_MESSAGE_TYPE,
            text: [0; MAX_MESSAGE_SIZE],
        };
        frame.text[..ciphertext.len()].copy_from_slice(&ciphertext);
        self.channel.send_bytes(&frame, MAX_MESSAGE_SIZE)
    }
}
