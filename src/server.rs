//! Collector sinks for the sandboxed runtime
//!
//! The bootstrap inherits outbound connections to a console socket and a
//! logs socket, and sends xray segments over UDP. These servers just drain
//! whatever arrives; nothing parses the streams.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UdpSocket, UnixListener, UnixStream};

pub struct UnixServer {
    path: PathBuf,
    listener: UnixListener,
}

impl UnixServer {
    pub fn bind(path: &Path) -> io::Result<UnixServer> {
        Ok(UnixServer {
            path: path.to_path_buf(),
            listener: UnixListener::bind(path)?,
        })
    }

    /// Accept loop; each connection is drained on its own task
    pub async fn serve<H, Fut>(&self, handler: H) -> io::Result<()>
    where
        H: Fn(UnixStream) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            let (conn, _) = self.listener.accept().await?;
            tokio::spawn(handler(conn));
        }
    }

    /// Unlink the socket path
    pub fn close(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Print every line from the runtime's console, prefixed
pub async fn console_conn(conn: UnixStream) {
    let mut lines = BufReader::new(conn).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        println!("console: {}", line);
    }
}

/// Runtime log stream: printed under --debug, silently drained otherwise
pub async fn logs_conn(conn: UnixStream, debug: bool) {
    if debug {
        let mut lines = BufReader::new(conn).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("logs: {}", line);
        }
    } else {
        let mut conn = conn;
        let _ = tokio::io::copy(&mut conn, &mut tokio::io::sink()).await;
    }
}

pub struct UdpServer {
    socket: UdpSocket,
}

impl UdpServer {
    pub async fn bind(addr: &str) -> io::Result<UdpServer> {
        Ok(UdpServer {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    /// Drain packets forever, handing each to `handler`
    pub async fn serve<H>(&self, handler: H) -> io::Result<()>
    where
        H: Fn(&[u8]),
    {
        let mut buf = [0u8; 4096];
        loop {
            let (n, _) = self.socket.recv_from(&mut buf).await?;
            handler(&buf[..n]);
        }
    }
}
