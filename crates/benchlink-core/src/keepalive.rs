//! TCP keepalive tuning.
//!
//! Connections in this crate are long-lived and mostly idle, so a silently
//! dead peer would otherwise hold a handler task forever. Probes are tuned
//! well below the kernel defaults: first probe after [`IDLE_SECS`], then one
//! every [`INTERVAL_SECS`], and the connection is declared dead after
//! [`PROBE_COUNT`] unanswered probes.

#[cfg(target_os = "linux")]
pub const IDLE_SECS: u32 = 10;
#[cfg(target_os = "linux")]
pub const INTERVAL_SECS: u32 = 10;
#[cfg(target_os = "linux")]
pub const PROBE_COUNT: u32 = 3;

/// Enable and tune keepalive probing on a connected TCP socket.
///
/// Works on both blocking and tokio sockets. On non-Linux Unix platforms
/// only SO_KEEPALIVE is enabled; elsewhere this is a no-op.
#[cfg(unix)]
pub fn set_keepalive<F: std::os::fd::AsFd>(socket: &F) -> crate::error::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(socket, sockopt::KeepAlive, &true).map_err(sockopt_error)?;
    #[cfg(target_os = "linux")]
    {
        setsockopt(socket, sockopt::TcpKeepIdle, &IDLE_SECS).map_err(sockopt_error)?;
        setsockopt(socket, sockopt::TcpKeepInterval, &INTERVAL_SECS).map_err(sockopt_error)?;
        setsockopt(socket, sockopt::TcpKeepCount, &PROBE_COUNT).map_err(sockopt_error)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_keepalive<F>(_socket: &F) -> crate::error::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sockopt_error(errno: nix::errno::Errno) -> crate::error::Error {
    crate::error::Error::Io {
        message: format!("setsockopt failed: {errno}"),
        source: Some(std::io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_keepalive_on_connected_pair() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        set_keepalive(&client).unwrap();
        set_keepalive(&server).unwrap();
    }

    #[test]
    fn test_set_keepalive_on_std_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        set_keepalive(&client).unwrap();
    }
}
