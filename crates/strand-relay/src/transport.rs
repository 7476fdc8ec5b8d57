//! Secure framed transport shared by relay sessions and clients.
//!
//! A [`Link`] wraps any byte stream (TCP in production, in-memory duplex in
//! tests) and runs two pump tasks:
//!
//! ```text
//!             send() ──► outbound queue ──► write pump ──► encrypt ─► frame ─► stream
//!   serve loop ◄── inbound queue ◄── read pump ◄── FrameDecoder ◄──────────── stream
//! ```
//!
//! The pumps stop when the link is closed or either side of the stream
//! fails. When the read pump stops the inbound queue is dropped, which is how
//! the owning session or client learns that the connection is gone.

use crate::RelayError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use strand_core::codec::{Frame, FrameDecoder, encode_frame};
use strand_core::{MAX_BUFFER_SIZE, Message};
use strand_crypto::noise::TransportCipher;
use strand_crypto::random;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Queue depths and deadlines of a link.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Depth of the outbound and inbound queues
    pub queue_capacity: usize,
    /// Maximum idle time between reads; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Maximum time for one frame write
    pub write_timeout: Option<Duration>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// State shared between the link handle and its pumps.
struct Shared {
    label: String,
    cipher: RwLock<Option<Arc<TransportCipher>>>,
    die: watch::Sender<bool>,
}

impl Shared {
    fn abort(&self) {
        self.die.send_replace(true);
    }

    fn cipher(&self) -> Option<Arc<TransportCipher>> {
        self.cipher.read().ok().and_then(|c| c.clone())
    }

    fn seal(&self, msg: &Message) -> Result<Vec<u8>, RelayError> {
        let nonce = random::nonce_u32();
        let kind = msg.kind();
        let payload = msg.encode_payload()?;
        let payload = if kind.is_handshake() {
            payload
        } else {
            let cipher = self.cipher().ok_or(RelayError::MissingCipher)?;
            cipher.encrypt(u64::from(nonce), &payload)?
        };
        Ok(encode_frame(nonce, kind, &payload)?)
    }
}

/// Handle to a running framed connection.
pub struct Link {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    remote_addr: Option<SocketAddr>,
}

impl Link {
    /// Start the pumps over `stream`.
    ///
    /// Returns the link handle and the queue of inbound frames. Must be
    /// called inside a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        remote_addr: Option<SocketAddr>,
        label: impl Into<String>,
        options: LinkOptions,
    ) -> (Self, mpsc::Receiver<Frame>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (die, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label: label.into(),
            cipher: RwLock::new(None),
            die,
        });

        let capacity = options.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(read_pump(
            shared.clone(),
            reader,
            inbound_tx,
            options.read_timeout,
        ));
        tokio::spawn(write_pump(
            shared.clone(),
            writer,
            outbound_rx,
            options.write_timeout,
        ));

        let link = Self {
            shared,
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            remote_addr,
        };
        (link, inbound_rx)
    }

    /// Queue a message without blocking.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Closed`] if the link is closed
    /// - [`RelayError::SendBufferExceeded`] if the outbound queue is full
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::SendBufferExceeded,
            mpsc::error::TrySendError::Closed(_) => RelayError::Closed,
        })
    }

    /// Install the transport cipher produced by the handshake.
    pub fn set_cipher(&self, cipher: TransportCipher) {
        if let Ok(mut slot) = self.shared.cipher.write() {
            *slot = Some(Arc::new(cipher));
        }
    }

    /// Whether a transport cipher is installed.
    #[must_use]
    pub fn has_cipher(&self) -> bool {
        self.shared.cipher().is_some()
    }

    /// Turn an inbound frame into a message, decrypting non-handshake kinds.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MissingCipher`] if an encrypted frame arrives
    /// before the handshake, or a crypto / decode error.
    pub fn open(&self, frame: &Frame) -> Result<Message, RelayError> {
        if frame.kind.is_handshake() {
            return Ok(Message::decode(frame.kind, &frame.payload)?);
        }
        let cipher = self.shared.cipher().ok_or(RelayError::MissingCipher)?;
        let plaintext = cipher.decrypt(u64::from(frame.nonce), &frame.payload)?;
        Ok(Message::decode(frame.kind, &plaintext)?)
    }

    /// Close the link and stop both pumps.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyClosed`] on every call after the first.
    pub fn close(&self) -> Result<(), RelayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyClosed);
        }
        self.shared.abort();
        Ok(())
    }

    /// Whether [`Link::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to the stop signal of the pumps.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.die.subscribe()
    }

    /// Address of the remote end, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("label", &self.shared.label)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_pump<R>(
    shared: Arc<Shared>,
    mut reader: R,
    inbound: mpsc::Sender<Frame>,
    read_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let mut die = shared.die.subscribe();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];

    'outer: loop {
        if *die.borrow() {
            break;
        }

        let n = tokio::select! {
            _ = die.changed() => break,
            n = read_some(&mut reader, &mut buf, read_timeout) => n,
        };

        let n = match n {
            Ok(0) => {
                tracing::debug!("{}: connection closed by remote", shared.label);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("{}: read failed: {}", shared.label, e);
                break;
            }
        };

        let frames = match decoder.decode(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!("{}: malformed frame: {}", shared.label, e);
                break;
            }
        };

        for frame in frames {
            tokio::select! {
                _ = die.changed() => break 'outer,
                sent = inbound.send(frame) => {
                    if sent.is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }

    shared.abort();
}

async fn read_some<R>(reader: &mut R, buf: &mut [u8], limit: Option<Duration>) -> Result<usize, RelayError>
where
    R: AsyncRead + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| RelayError::Timeout)?
            .map_err(RelayError::from),
        None => reader.read(buf).await.map_err(RelayError::from),
    }
}

async fn write_pump<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    write_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let mut die = shared.die.subscribe();

    loop {
        if *die.borrow() {
            break;
        }

        let msg = tokio::select! {
            _ = die.changed() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let bytes = match shared.seal(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("{}: dropping {:?}: {}", shared.label, msg.kind(), e);
                continue;
            }
        };

        let written = match write_timeout {
            Some(limit) => tokio::time::timeout(limit, writer.write_all(&bytes))
                .await
                .map_err(|_| RelayError::Timeout)
                .and_then(|r| r.map_err(RelayError::from)),
            None => writer.write_all(&bytes).await.map_err(RelayError::from),
        };

        if let Err(e) = written {
            tracing::debug!("{}: write failed: {}", shared.label, e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    shared.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::MessageKind;
    use strand_core::message::{Echo, Handshake};

    fn echo(sequence: u32) -> Message {
        Message::EchoRequest(Echo {
            sequence,
            body: "ping".into(),
        })
    }

    #[tokio::test]
    async fn test_handshake_kinds_travel_in_clear() {
        let (a, b) = tokio::io::duplex(4096);
        let (left, _left_rx) = Link::spawn(a, None, "left", LinkOptions::default());
        let (right, mut right_rx) = Link::spawn(b, None, "right", LinkOptions::default());

        left.send(Message::Handshake(Handshake {
            public_key: vec![1; 32],
            message: vec![2; 8],
            is_primary: true,
        }))
        .unwrap();

        let frame = right_rx.recv().await.unwrap();
        assert_eq!(frame.kind, MessageKind::Handshake);
        let msg = right.open(&frame).unwrap();
        assert!(matches!(msg, Message::Handshake(h) if h.is_primary));
    }

    #[tokio::test]
    async fn test_encrypted_kind_needs_cipher() {
        let (a, b) = tokio::io::duplex(4096);
        let (left, _left_rx) = Link::spawn(a, None, "left", LinkOptions::default());
        let (right, mut right_rx) = Link::spawn(b, None, "right", LinkOptions::default());

        let mut initiator = strand_crypto::noise::NoiseHandshake::initiator().unwrap();
        let mut responder = strand_crypto::noise::NoiseHandshake::responder().unwrap();
        let m1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(&[]).unwrap();
        initiator.read_message(&m2).unwrap();
        left.set_cipher(initiator.into_transport().unwrap());

        left.send(echo(1)).unwrap();
        let frame = right_rx.recv().await.unwrap();
        assert!(matches!(right.open(&frame), Err(RelayError::MissingCipher)));

        right.set_cipher(responder.into_transport().unwrap());
        assert_eq!(right.open(&frame).unwrap(), echo(1));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (a, _b) = tokio::io::duplex(64);
        let (link, mut rx) = Link::spawn(a, None, "link", LinkOptions::default());
        link.close().unwrap();
        assert!(matches!(link.close(), Err(RelayError::AlreadyClosed)));
        assert!(matches!(link.send(echo(1)), Err(RelayError::Closed)));
        // Read pump stops and drops the inbound queue.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_eof_ends_inbound() {
        let (a, b) = tokio::io::duplex(64);
        let (_link, mut rx) = Link::spawn(a, None, "link", LinkOptions::default());
        drop(b);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_buffer_exceeded() {
        // The far end never reads, so the write pump blocks on the first
        // frame and the queue fills up.
        let (a, _b) = tokio::io::duplex(16);
        let options = LinkOptions {
            queue_capacity: 2,
            read_timeout: None,
            write_timeout: None,
        };
        let (link, _rx) = Link::spawn(a, None, "link", options);

        let mut result = Ok(());
        for i in 0..16 {
            result = link.send(Message::Handshake(Handshake {
                public_key: vec![0; 32],
                message: vec![0; 64],
                is_primary: i % 2 == 0,
            }));
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(result, Err(RelayError::SendBufferExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_stops_link() {
        let (a, _b) = tokio::io::duplex(64);
        let options = LinkOptions {
            read_timeout: Some(Duration::from_secs(2)),
            ..LinkOptions::default()
        };
        let (_link, mut rx) = Link::spawn(a, None, "link", options);
        assert!(rx.recv().await.is_none());
    }
}
