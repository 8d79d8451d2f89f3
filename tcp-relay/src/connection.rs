//! One accepted TCP connection.
//!
//! A [`Connection`] is split in two: the read half stays with the handler
//! task that owns the connection, and the write half lives in a shared
//! [`Peer`] so the broadcast path can deliver to it. Sends to one peer are
//! serialized by the mutex around its write half.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::debug;

use crate::frame::{self, DEFAULT_MAX_FRAME_LEN, FrameError};

const READ_CHUNK: usize = 4096;

/// Per-connection limits, derived from the relay configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub max_frame_len: usize,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: Some(Duration::from_secs(10)),
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
    #[error("peer closed the connection with {buffered} bytes of a partial frame buffered")]
    Truncated { buffered: usize },
    #[error("no data received for {0:?}")]
    TimedOut(Duration),
    #[error("connection was closed locally")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("write did not complete within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a successful [`Connection::receive`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Bytes),
    EndOfStream,
}

pub struct Connection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    closed: watch::Receiver<bool>,
    peer: Arc<Peer>,
    max_frame_len: usize,
    idle_timeout: Option<Duration>,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr, options: ConnectionOptions) -> Self {
        let (reader, writer) = stream.into_split();
        let (closed_tx, closed) = watch::channel(false);
        let peer = Arc::new(Peer {
            addr,
            writer: Mutex::new(Some(writer)),
            closed: closed_tx,
            max_frame_len: options.max_frame_len,
            write_timeout: options.write_timeout,
        });

        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            closed,
            peer,
            max_frame_len: options.max_frame_len,
            idle_timeout: options.idle_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// The shareable send side of this connection.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Waits for the next complete frame.
    ///
    /// Resolves early with [`ReceiveError::Closed`] once [`Peer::close`] has
    /// been called from anywhere, so an evicted connection stops reading.
    pub async fn receive(&mut self) -> Result<Received, ReceiveError> {
        loop {
            // frames still buffered after a close are dropped, not relayed
            if *self.closed.borrow() {
                return Err(ReceiveError::Closed);
            }
            if let Some(payload) = frame::decode_from(&mut self.buffer, self.max_frame_len)? {
                return Ok(Received::Message(payload));
            }

            let read = select! {
                read = read_more(&mut self.reader, &mut self.buffer, self.idle_timeout) => read?,
                _ = self.closed.wait_for(|closed| *closed) => return Err(ReceiveError::Closed),
            };

            if read == 0 {
                return if self.buffer.is_empty() {
                    Ok(Received::EndOfStream)
                } else {
                    Err(ReceiveError::Truncated {
                        buffered: self.buffer.len(),
                    })
                };
            }
        }
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        self.peer.send(payload).await
    }

    pub async fn close(&self) -> bool {
        self.peer.close().await
    }
}

async fn read_more(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> Result<usize, ReceiveError> {
    let read = reader.read_buf(buffer);
    match idle_timeout {
        Some(limit) => timeout(limit, read)
            .await
            .map_err(|_| ReceiveError::TimedOut(limit))?
            .map_err(ReceiveError::from),
        None => Ok(read.await?),
    }
}

/// Send side of a connection, shared between its handler and the registry.
pub struct Peer {
    addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    max_frame_len: usize,
    write_timeout: Option<Duration>,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Frames and writes one message.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let frame = frame::encode(payload, self.max_frame_len)?;
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(SendError::Closed)?;

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match self.write_timeout {
            Some(limit) => timeout(limit, write)
                .await
                .map_err(|_| SendError::TimedOut(limit))??,
            None => write.await?,
        }
        Ok(())
    }

    /// Shuts down the write half and wakes the owning handler.
    ///
    /// Returns `true` only for the call that actually released the writer.
    pub async fn close(&self) -> bool {
        self.closed.send_replace(true);

        let Some(mut writer) = self.writer.lock().await.take() else {
            return false;
        };
        if let Err(error) = writer.shutdown().await {
            debug!(peer = %self.addr, ?error, "failed to shut down writer cleanly");
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Returns an accepted server-side connection and its client socket.
    pub(crate) async fn loopback_pair(options: ConnectionOptions) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer_addr) = listener.accept().await.expect("accept");
        (Connection::new(stream, peer_addr, options), client)
    }

    #[tokio::test]
    async fn receive_yields_frames_then_end_of_stream() {
        let (mut conn, mut client) = loopback_pair(ConnectionOptions::default()).await;

        frame::write_frame(&mut client, b"hi", 64).await.expect("write");
        frame::write_frame(&mut client, b"", 64).await.expect("write");
        client.shutdown().await.expect("shutdown");

        assert_eq!(
            conn.receive().await.expect("first"),
            Received::Message(Bytes::from_static(b"hi"))
        );
        assert_eq!(
            conn.receive().await.expect("second"),
            Received::Message(Bytes::new())
        );
        assert_eq!(conn.receive().await.expect("eof"), Received::EndOfStream);
    }

    #[tokio::test]
    async fn close_mid_frame_is_truncation() {
        let (mut conn, mut client) = loopback_pair(ConnectionOptions::default()).await;

        client.write_all(&[0, 0, 0, 8, b'p', b'a']).await.expect("write");
        client.shutdown().await.expect("shutdown");

        let result = conn.receive().await;
        assert!(matches!(result, Err(ReceiveError::Truncated { buffered: 6 })));
    }

    #[tokio::test]
    async fn oversized_frame_is_malformed() {
        let options = ConnectionOptions {
            max_frame_len: 4,
            ..ConnectionOptions::default()
        };
        let (mut conn, mut client) = loopback_pair(options).await;

        client.write_all(&[0, 0, 1, 0]).await.expect("write");

        let result = conn.receive().await;
        assert!(matches!(
            result,
            Err(ReceiveError::Malformed(FrameError::TooLarge { len: 256, max: 4 }))
        ));
    }

    #[tokio::test]
    async fn send_delivers_a_frame() {
        let (conn, mut client) = loopback_pair(ConnectionOptions::default()).await;

        conn.send(b"ping").await.expect("send");

        let frame = frame::read_frame(&mut client, 64)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(&frame[..], b"ping");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_sends() {
        let (conn, _client) = loopback_pair(ConnectionOptions::default()).await;

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.peer().is_closed());
        assert!(matches!(conn.send(b"late").await, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn close_wakes_a_pending_receive() {
        let (mut conn, _client) = loopback_pair(ConnectionOptions::default()).await;
        let peer = Arc::clone(conn.peer());

        let pending = tokio::spawn(async move { conn.receive().await });
        tokio::task::yield_now().await;
        peer.close().await;

        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("receive should wake")
            .expect("join");
        assert!(matches!(result, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn close_discards_frames_already_buffered() {
        let (mut conn, mut client) = loopback_pair(ConnectionOptions::default()).await;

        let mut both = BytesMut::new();
        both.extend_from_slice(&frame::encode(b"one", 64).expect("encode"));
        both.extend_from_slice(&frame::encode(b"two", 64).expect("encode"));
        client.write_all(&both).await.expect("write");

        assert_eq!(
            conn.receive().await.expect("first"),
            Received::Message(Bytes::from_static(b"one"))
        );
        conn.close().await;

        let result = conn.receive().await;
        assert!(matches!(result, Err(ReceiveError::Closed)), "{result:?}");
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let options = ConnectionOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ConnectionOptions::default()
        };
        let (mut conn, _client) = loopback_pair(options).await;

        let result = conn.receive().await;
        assert!(matches!(result, Err(ReceiveError::TimedOut(_))));
    }
}
