//! Target addresses and the local-socket listener.
//!
//! Two attachment strategies exist:
//! - TCP: the tooling dials `host:port` where the debuggee listens
//! - Local socket: the tooling listens on a path and the debuggee dials in
//!
//! # Example
//!
//! ```
//! use debug_wire::transport::Target;
//!
//! let tcp: Target = "tcp://localhost:3768".parse().unwrap();
//! assert_eq!(tcp, Target::tcp("localhost", 3768));
//!
//! let local: Target = "socket:/tmp/app-debug.sock".parse().unwrap();
//! assert!(local.is_local());
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DebugWireError, Result};

/// Where to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Dial a TCP server.
    Tcp { host: String, port: u16 },
    /// Listen on a local socket path for the debuggee to connect.
    Local(PathBuf),
}

impl Target {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Target::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Target::Local(path.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local(_))
    }

    /// Parse `tcp://host:port`, `host:port`, `socket:/path` or `unix:/path`.
    pub fn parse(s: &str) -> Result<Self> {
        for scheme in ["socket:", "unix:", "local:"] {
            if let Some(path) = s.strip_prefix(scheme) {
                let path = path.strip_prefix("//").unwrap_or(path);
                if path.is_empty() {
                    return Err(DebugWireError::InvalidTarget(format!(
                        "missing socket path in {:?}",
                        s
                    )));
                }
                return Ok(Target::Local(PathBuf::from(path)));
            }
        }

        let authority = s.strip_prefix("tcp://").unwrap_or(s);
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            DebugWireError::InvalidTarget(format!("expected host:port, got {:?}", s))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DebugWireError::InvalidTarget(format!(
                "missing host in {:?}",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DebugWireError::InvalidTarget(format!("invalid port in {:?}", s)))?;

        Ok(Target::tcp(host, port))
    }
}

impl FromStr for Target {
    type Err = DebugWireError;

    fn from_str(s: &str) -> Result<Self> {
        Target::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Target::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Target::Local(path) => write!(f, "socket:{}", path.display()),
        }
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tokio::net::{UnixListener, UnixStream};

    /// Listening local socket.
    ///
    /// Removes its socket file on drop, unless another listener has since
    /// been bound to the same path.
    pub struct LocalServer {
        listener: UnixListener,
        path: PathBuf,
        /// Device and inode of the socket file this server created.
        file_id: (u64, u64),
    }

    fn file_id(path: &Path) -> std::io::Result<(u64, u64)> {
        let metadata = std::fs::symlink_metadata(path)?;
        Ok((metadata.dev(), metadata.ino()))
    }

    impl LocalServer {
        /// Bind to a socket path, replacing any stale socket file.
        pub fn bind(path: &Path) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;
            let file_id = file_id(path)?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
                file_id,
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<UnixStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for LocalServer {
        fn drop(&mut self) {
            match file_id(&self.path) {
                Ok(id) if id == self.file_id => {
                    let _ = std::fs::remove_file(&self.path);
                }
                Ok(_) => tracing::debug!(
                    "Leaving {} to the listener that replaced it",
                    self.path.display()
                ),
                Err(_) => {}
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::LocalServer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_forms() {
        let cases = [
            ("tcp://127.0.0.1:3768", Target::tcp("127.0.0.1", 3768)),
            ("localhost:1", Target::tcp("localhost", 1)),
            ("[::1]:9000", Target::tcp("::1", 9000)),
        ];
        for (text, expected) in cases {
            assert_eq!(Target::parse(text).unwrap(), expected);
        }
    }

    #[test]
    fn test_parse_local_forms() {
        let cases = [
            ("socket:/tmp/a.sock", Target::local("/tmp/a.sock")),
            ("unix:///tmp/b.sock", Target::local("/tmp/b.sock")),
        ];
        for (text, expected) in cases {
            assert_eq!(Target::parse(text).unwrap(), expected);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Target::parse("no-port").is_err());
        assert!(Target::parse("host:99999").is_err());
        assert!(Target::parse(":80").is_err());
        assert!(Target::parse("socket:").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["tcp://example.org:80", "tcp://[::1]:9000", "socket:/tmp/x.sock"] {
            let target: Target = text.parse().unwrap();
            assert_eq!(target.to_string(), text);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_server_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.sock");

        let server = LocalServer::bind(&path).unwrap();
        assert!(path.exists());
        assert_eq!(server.path(), path.as_path());

        drop(server);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_server_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let _server = LocalServer::bind(&path).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_listener_keeps_its_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.sock");

        let old = LocalServer::bind(&path).unwrap();
        let new = LocalServer::bind(&path).unwrap();

        drop(old);
        assert!(path.exists());
        tokio::net::UnixStream::connect(&path).await.unwrap();
        new.accept().await.unwrap();

        drop(new);
        assert!(!path.exists());
    }
}
