//! Single-listener protocol multiplexer.
//!
//! The accept loop peeks at the first bytes of every connection and hands
//! it to the gRPC server (HTTP/2 preface) or the metrics server (HTTP/1.x
//! request line). Anything else is closed. Peeking never consumes bytes, so
//! the chosen server sees the stream from its first byte.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// HTTP/2 client connection preface (RFC 9113 §3.4).
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How long a connection may stay silent before it is dropped unclassified.
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(5);

const PEEK_LEN: usize = H2_PREFACE.len();
const PEEK_RETRY: Duration = Duration::from_millis(10);
const MAX_METHOD_LEN: usize = 16;
const CHANNEL_CAPACITY: usize = 64;

/// Protocol detected on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
    Http1,
    Unknown,
}

/// Classify a connection from the bytes seen so far.
///
/// Returns `None` when more bytes are needed to decide.
pub fn classify(prefix: &[u8]) -> Option<Protocol> {
    if prefix.is_empty() {
        return None;
    }
    if prefix.starts_with(H2_PREFACE) {
        return Some(Protocol::Grpc);
    }
    if H2_PREFACE.starts_with(prefix) {
        return None;
    }

    // HTTP/1.x request line: an upper-case method token followed by a space.
    for (i, &b) in prefix.iter().enumerate() {
        match b {
            b' ' if i > 0 => return Some(Protocol::Http1),
            b'A'..=b'Z' if i < MAX_METHOD_LEN => {}
            _ => return Some(Protocol::Unknown),
        }
    }
    None
}

/// Receiving side for HTTP/1 connections, usable with [`axum::serve`].
///
/// Once the multiplexer is gone `accept` never resolves; the server is
/// expected to stop through its graceful shutdown signal.
#[derive(Debug)]
pub struct ChannelListener {
    rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for ChannelListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(conn) => conn,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Accept loop that routes connections by protocol.
#[derive(Debug)]
pub struct Multiplexer {
    listener: TcpListener,
    classify_timeout: Duration,
    grpc_tx: mpsc::Sender<TcpStream>,
    http_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
}

impl Multiplexer {
    /// Wrap `listener`. Returns the multiplexer, the gRPC connection stream
    /// and the HTTP/1 listener.
    pub fn new(
        listener: TcpListener,
    ) -> io::Result<(Self, mpsc::Receiver<TcpStream>, ChannelListener)> {
        let local_addr = listener.local_addr()?;
        let (grpc_tx, grpc_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (http_tx, http_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mux = Self {
            listener,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            grpc_tx,
            http_tx,
        };
        let http = ChannelListener {
            rx: http_rx,
            local_addr,
        };
        Ok((mux, grpc_rx, http))
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips. An accept error ends the
    /// loop with that error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "multiplexer accepting connections");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    let grpc_tx = self.grpc_tx.clone();
                    let http_tx = self.http_tx.clone();
                    let timeout = self.classify_timeout;
                    tokio::spawn(route(stream, peer, timeout, grpc_tx, http_tx));
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("multiplexer stopped");
        Ok(())
    }
}

async fn route(
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    grpc_tx: mpsc::Sender<TcpStream>,
    http_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
) {
    let protocol = match tokio::time::timeout(timeout, sniff(&stream)).await {
        Ok(Ok(Some(protocol))) => protocol,
        Ok(Ok(None)) => {
            trace!(%peer, "connection closed before classification");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "peek failed");
            return;
        }
        Err(_) => {
            debug!(%peer, ?timeout, "classification timed out, closing");
            return;
        }
    };

    trace!(%peer, ?protocol, "classified connection");
    let delivered = match protocol {
        Protocol::Grpc => grpc_tx.send(stream).await.is_ok(),
        Protocol::Http1 => http_tx.send((stream, peer)).await.is_ok(),
        Protocol::Unknown => {
            debug!(%peer, "unrecognised protocol, closing");
            return;
        }
    };
    if !delivered {
        debug!(%peer, ?protocol, "server stopped, dropping connection");
    }
}

/// Peek until the prefix classifies. `None` means the peer closed first.
async fn sniff(stream: &TcpStream) -> io::Result<Option<Protocol>> {
    let mut buf = [0u8; PEEK_LEN];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(protocol) = classify(&buf[..n]) {
            return Ok(Some(protocol));
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}
