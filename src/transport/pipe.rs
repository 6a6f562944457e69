//! Platform-specific pipe implementation.
//!
//! - Unix: Unix Domain Socket, one file per pipe name
//! - Windows: Named Pipe
//!
//! Both pipes of a link are unidirectional. The acceptor only ever reads and
//! the connector only ever writes, so the unused half is dropped right after
//! the connection is established.
//!
//! # Example
//!
//! ```ignore
//! use pipelink::transport::{connect_pipe, PipeAddress, PipeListener};
//!
//! let address = PipeAddress::local("EchoService_SERVER_PIPE");
//! let mut listener = PipeListener::bind(&address).await?;
//! let reader = listener.accept().await?;
//! ```

use std::path::PathBuf;
#[cfg(unix)]
use std::time::Duration;

use crate::error::Result;

/// Host value meaning "this machine".
pub const LOCAL_HOST: &str = ".";

/// A named pipe, optionally on another host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeAddress {
    name: String,
    host: String,
}

impl PipeAddress {
    /// A pipe on the local machine.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: LOCAL_HOST.to_string(),
        }
    }

    /// A pipe on `host`.
    ///
    /// On Windows the host is a machine name (`.` for local). On Unix it is
    /// the directory holding the socket file (`.` selects the temp dir).
    pub fn on_host(name: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: name.into(),
            host: if host.is_empty() { LOCAL_HOST.to_string() } else { host },
        }
    }

    /// The pipe name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host (or socket directory on Unix).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Platform path of the pipe.
    ///
    /// Format:
    /// - Unix: `{host dir or temp dir}/{name}.sock`
    /// - Windows: `\\{host}\pipe\{name}`
    pub fn path(&self) -> PathBuf {
        #[cfg(unix)]
        {
            let dir = if self.host == LOCAL_HOST {
                std::env::temp_dir()
            } else {
                PathBuf::from(&self.host)
            };
            dir.join(format!("{}.sock", self.name))
        }

        #[cfg(windows)]
        {
            PathBuf::from(format!(r"\\{}\pipe\{}", self.host, self.name))
        }
    }
}

impl std::fmt::Display for PipeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host == LOCAL_HOST {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.host)
        }
    }
}

/// Generate a pipe-name token unique to this process and call.
///
/// Format: `{pid}-{random hex}`
pub fn generate_pipe_token() -> String {
    format!("{}-{:x}", std::process::id(), rand_u64())
}

/// Simple random u64 using system time, process ID and a call counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    (nanos ^ seq.rotate_left(32)).wrapping_mul(0x517cc1b727220a95) ^ pid
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{UnixListener, UnixStream};

    /// Read side of an accepted connection.
    pub type PipeReader = OwnedReadHalf;

    /// Write side of an established connection.
    pub type PipeWriter = OwnedWriteHalf;

    /// Unix Domain Socket listener.
    pub struct PipeListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PipeListener {
        /// Bind to the socket path of `address`.
        ///
        /// Removes any stale socket file at the path before binding.
        pub async fn bind(address: &PipeAddress) -> Result<Self> {
            let path = address.path();
            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            let listener = UnixListener::bind(&path)?;

            Ok(Self { listener, path })
        }

        /// Accept a single connection and keep only its read half.
        pub async fn accept(&mut self) -> Result<PipeReader> {
            let (stream, _addr) = self.listener.accept().await?;
            let (reader, _writer) = stream.into_split();
            Ok(reader)
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Open a write-only connection to a listening pipe (single attempt).
    pub async fn connect_pipe(address: &PipeAddress) -> std::io::Result<PipeWriter> {
        let stream = UnixStream::connect(address.path()).await?;
        let (_reader, writer) = stream.into_split();
        Ok(writer)
    }

    /// Whether a failed connect means "no listener yet" and is worth retrying.
    pub fn is_retryable_connect_error(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        )
    }

    /// Poll interval while the peer still has unread bytes queued.
    const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

    /// Wait until the peer has read everything written on `writer`.
    ///
    /// Bytes written to a stream socket stay charged to the sender until the
    /// receiver consumes them, so the send queue reaching zero means drained.
    pub async fn wait_for_drain(writer: &PipeWriter) -> std::io::Result<()> {
        while unread_bytes(writer)? > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn unread_bytes(writer: &PipeWriter) -> std::io::Result<usize> {
        use std::os::fd::AsRawFd;

        let fd = writer.as_ref().as_raw_fd();
        let mut queued: libc::c_int = 0;
        // SAFETY: `fd` is an open socket owned by `writer`, and TIOCOUTQ
        // (SIOCOUTQ) stores a single c_int through the pointer.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued as *mut libc::c_int) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(queued.max(0) as usize)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn unread_bytes(writer: &PipeWriter) -> std::io::Result<usize> {
        use std::os::fd::AsRawFd;

        let fd = writer.as_ref().as_raw_fd();
        let mut queued: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `fd` is an open socket owned by `writer`; `queued` and `len`
        // describe a buffer of exactly one c_int.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NWRITE,
                &mut queued as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(queued.max(0) as usize)
    }

    // No portable unsent-queue query; a completed flush is the best signal.
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    fn unread_bytes(_writer: &PipeWriter) -> std::io::Result<usize> {
        Ok(0)
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// ERROR_PIPE_BUSY: every instance is connected to another client.
    const ERROR_PIPE_BUSY: i32 = 231;

    /// Read side of an accepted connection.
    pub type PipeReader = NamedPipeServer;

    /// Write side of an established connection.
    pub type PipeWriter = NamedPipeClient;

    /// Windows Named Pipe listener, inbound only, one instance.
    pub struct PipeListener {
        path: PathBuf,
        pending: Option<NamedPipeServer>,
    }

    impl PipeListener {
        /// Create the first pipe instance so connectors can find it.
        pub async fn bind(address: &PipeAddress) -> Result<Self> {
            let path = address.path();
            let server = Self::create_instance(&path, true)?;

            Ok(Self {
                path,
                pending: Some(server),
            })
        }

        fn create_instance(path: &PathBuf, first: bool) -> std::io::Result<NamedPipeServer> {
            ServerOptions::new()
                .first_pipe_instance(first)
                .access_inbound(true)
                .access_outbound(false)
                .max_instances(1)
                .create(path)
        }

        /// Wait for a client on the pending instance.
        ///
        /// The next instance is created lazily, after the previous connection
        /// has been dropped, since only one instance may exist at a time.
        pub async fn accept(&mut self) -> Result<PipeReader> {
            let server = match self.pending.take() {
                Some(server) => server,
                None => Self::create_instance(&self.path, false)?,
            };

            server.connect().await?;
            Ok(server)
        }
    }

    /// Open a write-only connection to a listening pipe (single attempt).
    pub async fn connect_pipe(address: &PipeAddress) -> std::io::Result<PipeWriter> {
        ClientOptions::new()
            .read(false)
            .write(true)
            .open(address.path())
    }

    /// Whether a failed connect means "no listener yet" and is worth retrying.
    pub fn is_retryable_connect_error(err: &std::io::Error) -> bool {
        err.kind() == std::io::ErrorKind::NotFound || err.raw_os_error() == Some(ERROR_PIPE_BUSY)
    }

    /// Wait until the server end has read everything written on `writer`.
    ///
    /// `FlushFileBuffers` on a pipe handle blocks until the peer drains it, so
    /// it runs on the blocking pool.
    pub async fn wait_for_drain(writer: &PipeWriter) -> std::io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::FlushFileBuffers;

        let handle = writer.as_raw_handle() as usize;
        tokio::task::spawn_blocking(move || {
            // SAFETY: the handle belongs to `writer`, which the caller keeps
            // open until this future resolves or the connection is dropped.
            let ok = unsafe { FlushFileBuffers(handle as HANDLE) };
            if ok == 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(())
            }
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{
    connect_pipe, is_retryable_connect_error, wait_for_drain, PipeListener, PipeReader,
    PipeWriter,
};

#[cfg(windows)]
pub use windows_impl::{
    connect_pipe, is_retryable_connect_error, wait_for_drain, PipeListener, PipeReader,
    PipeWriter,
};
