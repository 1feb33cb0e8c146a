use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::conduit::{map_io, Conduit, MIN_IO_TICK};
use crate::error::{Result, TransportError};

/// Listening end of a Unix domain stream socket.
///
/// The socket file is created on bind and removed on drop, but only while
/// the path still names the inode we created — a replacement socket bound
/// by a newer process is left alone.
pub struct StreamListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    cleanup_on_drop: bool,
}

impl StreamListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the path already holds a socket it is removed first (stale socket
    /// cleanup); any other file type is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode on the socket path.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale sockets, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
            } else {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode,
            cleanup_on_drop: true,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<StreamConduit> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!("accepted connection");
        Ok(StreamConduit::new(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Some((expected_dev, expected_ino)) = self.created_inode {
                if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                    if metadata.file_type().is_socket()
                        && metadata.dev() == expected_dev
                        && metadata.ino() == expected_ino
                    {
                        debug!(path = ?self.path, "cleaning up socket file");
                        let _ = std::fs::remove_file(&self.path);
                    } else {
                        debug!(
                            path = ?self.path,
                            "socket path identity changed; skipping cleanup"
                        );
                    }
                }
            }
        }
    }
}

/// Connect to a listening Unix domain stream socket (blocking).
pub fn connect(path: impl AsRef<Path>) -> Result<StreamConduit> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
        target: path.display().to_string(),
        source: e,
    })?;
    debug!(?path, "connected to unix domain socket");
    Ok(StreamConduit::new(stream))
}

/// A connected Unix stream socket as a [`Conduit`].
///
/// Per-call timeouts are applied through the socket's read/write timeout
/// options. `cancel` shuts the socket down, releasing a blocked reader with
/// [`TransportError::Closed`].
pub struct StreamConduit {
    stream: UnixStream,
}

impl StreamConduit {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl Conduit for StreamConduit {
    fn send(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.stream
            .set_write_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        match (&self.stream).write(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(map_io(e)),
        }
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream
            .set_read_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        match (&self.stream).read(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(map_io(e)),
        }
    }

    fn ready(&self, timeout: Duration) -> Result<bool> {
        self.stream
            .set_read_timeout(Some(timeout.max(MIN_IO_TICK)))?;
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            // EOF is readable: a recv will return Closed without blocking.
            Ok(_) => Ok(true),
            Err(e) => match map_io(e) {
                TransportError::Timeout => Ok(false),
                other => Err(other),
            },
        }
    }

    fn flush(&self) -> Result<()> {
        (&self.stream).flush().map_err(map_io)
    }

    fn cancel(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn kind(&self) -> &'static str {
        "unix-stream"
    }
}

fn bind_err(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Bind {
        target: path.display().to_string(),
        source,
    }
}
