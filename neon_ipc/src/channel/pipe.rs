//! Named pipe (FIFO) channel.
//!
//! The broker opens the FIFO read-only and non-blocking for each poll and
//! closes it again, so it never holds the pipe between ticks. In raw framing
//! a read may return several writes at once or part of one; use
//! length-prefixed framing when message boundaries matter.

use super::ChannelDriver;
use crate::cipher::PayloadCipher;
use crate::error::{ChannelError, ChannelResult};
use crate::framing::{encode_frame, FrameDecoder};
use crate::message::{trim_at_nul, Message, MAX_MESSAGE_SIZE};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use shared_utils::config::{ChannelKind, Framing, SecurityLevel};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

const LINGER_POLL: Duration = Duration::from_millis(5);

/// Handle to the FIFO on disk.
#[derive(Debug, Clone)]
pub struct PipeChannel {
    path: PathBuf,
}

impl PipeChannel {
    /// Create the FIFO if absent and set its mode from `level`.
    pub fn provision(path: impl AsRef<Path>, level: SecurityLevel) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mode = level.mode();

        match mkfifo(&path, Mode::from_bits_truncate(mode as _)) {
            Ok(()) => debug!(path = %path.display(), "Created FIFO"),
            Err(nix::errno::Errno::EEXIST) => {
                debug!(path = %path.display(), "FIFO already exists")
            }
            Err(errno) => {
                return Err(ChannelError::provisioning(ChannelKind::Pipe, "mkfifo")(
                    io::Error::from(errno),
                ))
            }
        }

        let channel = Self::open(&path).map_err(|e| match e {
            ChannelError::Sys { source, .. } => {
                ChannelError::provisioning(ChannelKind::Pipe, "verify FIFO")(source)
            }
            other => other,
        })?;
        fs::set_permissions(&path, Permissions::from_mode(mode))
            .map_err(ChannelError::provisioning(ChannelKind::Pipe, "chmod"))?;

        info!(
            path = %path.display(),
            %level,
            mode = %format!("{:o}", mode),
            "Pipe channel ready"
        );
        Ok(channel)
    }

    /// Refer to an existing FIFO.
    pub fn open(path: impl AsRef<Path>) -> ChannelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = fs::metadata(&path).map_err(ChannelError::sys("stat FIFO"))?;
        if !metadata.file_type().is_fifo() {
            return Err(ChannelError::Sys {
                op: "stat FIFO",
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} exists but is not a FIFO", path.display()),
                ),
            });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Permission bits of the FIFO.
    pub fn mode(&self) -> ChannelResult<u32> {
        let metadata = fs::metadata(&self.path).map_err(ChannelError::sys("stat FIFO"))?;
        Ok(metadata.permissions().mode() & 0o777)
    }

    pub fn remove(&self) -> ChannelResult<()> {
        fs::remove_file(&self.path).map_err(ChannelError::sys("unlink FIFO"))?;
        debug!(path = %self.path.display(), "Removed FIFO");
        Ok(())
    }

    /// One non-blocking read of up to [`MAX_MESSAGE_SIZE`] bytes.
    fn read_chunk(&self) -> ChannelResult<Option<Vec<u8>>> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(ChannelError::sys("open FIFO"))?;

        let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
        match file.read(&mut buffer) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buffer.truncate(n);
                Ok(Some(buffer))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(ChannelError::Sys {
                op: "read FIFO",
                source: e,
            }),
        }
    }
}

/// Broker-side reader of the pipe.
#[derive(Debug)]
pub struct PipeDriver {
    channel: PipeChannel,
    security: SecurityLevel,
    framing: Framing,
    cipher: Arc<dyn PayloadCipher>,
    decoder: FrameDecoder,
    /// Complete frames read ahead of the current poll
    pending: VecDeque<Vec<u8>>,
}

impl PipeDriver {
    pub fn new(
        channel: PipeChannel,
        security: SecurityLevel,
        framing: Framing,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            channel,
            security,
            framing,
            cipher,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn channel(&self) -> &PipeChannel {
        &self.channel
    }

    fn message(&self, payload: Vec<u8>) -> Message {
        Message::new(ChannelKind::Pipe, self.security, payload)
    }

    fn next_frame(&mut self) -> ChannelResult<Option<Message>> {
        match self.pending.pop_front() {
            Some(frame) => {
                let payload = self.cipher.decrypt(&frame)?;
                Ok(Some(self.message(payload)))
            }
            None => Ok(None),
        }
    }
}

impl ChannelDriver for PipeDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pipe
    }

    fn security(&self) -> SecurityLevel {
        self.security
    }

    fn poll(&mut self) -> ChannelResult<Option<Message>> {
        if !self.pending.is_empty() {
            return self.next_frame();
        }

        let Some(chunk) = self.channel.read_chunk()? else {
            return Ok(None);
        };
        trace!(bytes = chunk.len(), "Read from pipe");

        match self.framing {
            Framing::Raw => {
                let payload = trim_at_nul(self.cipher.decrypt(&chunk)?);
                Ok(Some(self.message(payload)))
            }
            Framing::LengthPrefixed => {
                let frames = self.decoder.decode(&chunk)?;
                self.pending.extend(frames);
                self.next_frame()
            }
        }
    }

    fn remove(&self) -> ChannelResult<()> {
        self.channel.remove()
    }
}

/// Writer side of the pipe.
#[derive(Debug)]
pub struct PipeProducer {
    path: PathBuf,
    file: File,
    framing: Framing,
    cipher: Arc<dyn PayloadCipher>,
}

impl PipeProducer {
    /// Open the FIFO for writing. Blocks until a reader has it open.
    pub fn open(
        path: impl AsRef<Path>,
        framing: Framing,
        cipher: Arc<dyn PayloadCipher>,
    ) -> ChannelResult<Self> {
        let channel = PipeChannel::open(path)?;
        let file = Self::open_writer(channel.path())?;
        Ok(Self {
            path: channel.path,
            file,
            framing,
            cipher,
        })
    }

    fn open_writer(path: &Path) -> ChannelResult<File> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(ChannelError::sys("open FIFO for writing"))
    }

    /// Encrypt and write one message.
    pub fn send(&mut self, text: &[u8]) -> ChannelResult<()> {
        let bytes = match self.framing {
            Framing::Raw => {
                let mut terminated = Vec::with_capacity(text.len() + 1);
                terminated.extend_from_slice(text);
                terminated.push(0);
                let ciphertext = self.cipher.encrypt(&terminated)?;
                if ciphertext.len() > MAX_MESSAGE_SIZE {
                    return Err(ChannelError::MalformedPayload(format!(
                        "message of {} bytes exceeds the {} byte pipe read size",
                        ciphertext.len(),
                        MAX_MESSAGE_SIZE
                    )));
                }
                ciphertext
            }
            Framing::LengthPrefixed => encode_frame(&self.cipher.encrypt(text)?)?,
        };

        match self.file.write_all(&bytes) {
            Ok(()) => {}
            // The last reader closed between our open and this write
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(path = %self.path.display(), "Pipe reader went away, reopening");
                self.file = Self::open_writer(&self.path)?;
                self.file
                    .write_all(&bytes)
                    .map_err(ChannelError::sys("write FIFO"))?;
            }
            Err(e) => {
                return Err(ChannelError::Sys {
                    op: "write FIFO",
                    source: e,
                })
            }
        }
        trace!(bytes = bytes.len(), "Wrote to pipe");
        Ok(())
    }

    /// Bytes written but not yet read.
    pub fn unread(&self) -> ChannelResult<usize> {
        let mut unread: libc::c_int = 0;
        let fd = self.file.as_raw_fd();
        let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut unread as *mut libc::c_int) };
        if ret == -1 {
            return Err(ChannelError::Sys {
                op: "ioctl FIONREAD",
                source: io::Error::last_os_error(),
            });
        }
        Ok(unread as usize)
    }

    /// Wait until the FIFO is drained or `timeout` passes.
    ///
    /// Data still buffered when the last writer and reader close is lost, so
    /// short-lived writers call this before exiting. Returns whether the
    /// FIFO drained in time.
    pub fn linger(&self, timeout: Duration) -> ChannelResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.unread()? == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(LINGER_POLL);
        }
    }
}
