//! Best-effort probe of an endpoint's ssh server identification banner.
//!
//! During early boot the unlock prompt is served by dropbear from the
//! initramfs; once the system is up, OpenSSH answers instead. Reading the
//! first line of the version exchange tells us which stage the machine is in
//! before we commit a connection attempt. Purely informational: probe
//! failures never influence the state machine.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::destination::Endpoint;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// What kind of ssh server answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// dropbear, as shipped in the initramfs; the unlock prompt stage.
    Dropbear,
    /// OpenSSH; the machine has (re)booted fully.
    OpenSsh,
    /// Something else speaking SSH-2.0.
    Other,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Dropbear => write!(f, "dropbear (initramfs)"),
            ServerType::OpenSsh => write!(f, "OpenSSH (booted)"),
            ServerType::Other => write!(f, "other ssh server"),
        }
    }
}

/// Classify a server identification line.
pub fn identify(first_line: &str) -> Option<ServerType> {
    if first_line.starts_with("SSH-2.0-dropbear") {
        Some(ServerType::Dropbear)
    } else if first_line.contains("SSH-2.0-OpenSSH") {
        Some(ServerType::OpenSsh)
    } else if first_line.contains("SSH-2.0") {
        Some(ServerType::Other)
    } else {
        None
    }
}

/// Connect to the endpoint and classify the server from its banner line.
/// Bounded by [`PROBE_TIMEOUT`].
pub async fn server_type(endpoint: &Endpoint) -> io::Result<Option<ServerType>> {
    let banner = timeout(PROBE_TIMEOUT, first_banner_line(endpoint))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "banner probe timed out"))??;
    Ok(identify(&banner))
}

async fn first_banner_line(endpoint: &Endpoint) -> io::Result<String> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    let mut lines = BufReader::new(stream).lines();
    lines.next_line().await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a banner line",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn identifies_known_banners() {
        assert_eq!(
            identify("SSH-2.0-dropbear_2022.83"),
            Some(ServerType::Dropbear)
        );
        assert_eq!(
            identify("SSH-2.0-OpenSSH_9.6p1 Debian-3"),
            Some(ServerType::OpenSsh)
        );
        assert_eq!(identify("SSH-2.0-libssh_0.10"), Some(ServerType::Other));
        assert_eq!(identify("HTTP/1.1 400 Bad Request"), None);
    }

    #[tokio::test]
    async fn probes_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"SSH-2.0-dropbear_2022.83\r\n")
                .await
                .unwrap();
        });

        let endpoint = Endpoint {
            user: "root".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        };
        assert_eq!(
            server_type(&endpoint).await.unwrap(),
            Some(ServerType::Dropbear)
        );
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        // Port 1 on localhost is expected to refuse.
        let endpoint = Endpoint {
            user: "root".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        assert!(server_type(&endpoint).await.is_err());
    }
}
