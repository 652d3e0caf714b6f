//! The peer link state machine: handshake, request multiplexing,
//! reconnect and subscription replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bosswave_core::Message;
use bosswave_core::UniqueMessageId;
use bosswave_crypto::Vk;
use bosswave_crypto::verify_blob;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PeerError;
use crate::error::Result;
use crate::frame::CMD_END;
use crate::frame::CMD_MESSAGE;
use crate::frame::CMD_RESPONSE;
use crate::frame::CMD_RESULT;
use crate::frame::Frame;
use crate::frame::STATUS_OKAY;
use crate::transport::ConnReader;
use crate::transport::ConnWriter;
use crate::transport::PeerConnection;
use crate::transport::PeerTransport;

/// Backoff between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Length of the connect-time identity proof: `vk32 | sig64`.
const PROOF_LEN: usize = 96;

/// What a streaming request (subscribe/query/list) yields.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message result, parsed but not yet verified.
    Message(Box<Message>),
    /// A list result.
    Uri(String),
    /// The stream ended.
    End,
}

enum StreamKind {
    Messages,
    Uris,
}

/// A long-lived client link to one remote designated router.
pub struct PeerLink {
    expected_vk: Vk,
    transport: Arc<dyn PeerTransport>,
    seqno: AtomicU64,
    writer: tokio::sync::Mutex<ConnWriter>,
    /// In-flight requests by seqno.
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<Option<Frame>>>>,
    /// Active subscriptions by seqno, holding the encoded subscribe
    /// message for replay after reconnect.
    active_subs: Mutex<HashMap<u64, Vec<u8>>>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("expected_vk", &self.expected_vk)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    /// Connect, verify the identity proof and start the receive loop.
    ///
    /// The receive loop holds only a weak handle: once the last
    /// `Arc<PeerLink>` is dropped, the task exits at its next frame,
    /// transport error or reconnect attempt instead of keeping the link
    /// alive forever.
    pub async fn connect(transport: Arc<dyn PeerTransport>, expected_vk: Vk) -> Result<Arc<PeerLink>> {
        let conn = transport.connect().await?;
        let (reader, writer) = Self::handshake(conn, expected_vk).await?;
        let link = Arc::new(PeerLink {
            expected_vk,
            transport,
            seqno: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            active_subs: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Self::rx_loop(Arc::downgrade(&link), reader));
        Ok(link)
    }

    pub fn remote_vk(&self) -> Vk {
        self.expected_vk
    }

    /// Read and check the 96-byte proof: an Ed25519 signature by the
    /// remote VK over the certificate's signature bytes.
    async fn handshake(mut conn: PeerConnection, expected: Vk) -> Result<(ConnReader, ConnWriter)> {
        let mut proof = [0u8; PROOF_LEN];
        conn.reader.read_exact(&mut proof).await?;
        let vk = Vk::from_slice(&proof[..32]).expect("fixed-length proof slice");
        if !verify_blob(&vk, &proof[32..], &conn.cert_signature) {
            return Err(PeerError::BadProof {
                reason: "signature over certificate does not verify".to_string(),
            });
        }
        if vk != expected {
            return Err(PeerError::WrongPeer);
        }
        Ok((conn.reader, conn.writer))
    }

    async fn rx_loop(link: Weak<PeerLink>, mut reader: ConnReader) {
        loop {
            let result = Frame::read_from(&mut reader).await;
            let Some(strong) = link.upgrade() else {
                debug!("peer link dropped, receive loop exiting");
                return;
            };
            match result {
                Ok(frame) => strong.dispatch(frame),
                Err(e) => {
                    warn!(peer = %strong.expected_vk, error = %e, "peer connection lost");
                    strong.fail_point_requests();
                    drop(strong);
                    match Self::reconnect(&link).await {
                        Some(new_reader) => reader = new_reader,
                        None => return,
                    }
                }
            }
        }
    }

    /// Reconnect until the link succeeds or is dropped: attempt, back
    /// off, repeat. On success the writer is swapped and every active
    /// subscription is replayed. Returns `None` once no strong handle to
    /// the link remains.
    async fn reconnect(link: &Weak<PeerLink>) -> Option<ConnReader> {
        loop {
            let strong = link.upgrade()?;
            match strong.transport.connect().await {
                Ok(conn) => match Self::handshake(conn, strong.expected_vk).await {
                    Ok((reader, writer)) => {
                        *strong.writer.lock().await = writer;
                        info!(peer = %strong.expected_vk, "peer reconnected");
                        strong.regen_subs().await;
                        return Some(reader);
                    }
                    Err(e) => {
                        warn!(peer = %strong.expected_vk, error = %e, "peer handshake failed");
                    }
                },
                Err(e) => {
                    debug!(peer = %strong.expected_vk, error = %e, "peer reconnect attempt failed");
                }
            }
            // Back off without pinning the link alive.
            drop(strong);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Re-issue every active subscription under its original seqno.
    async fn regen_subs(&self) {
        let subs: Vec<(u64, Vec<u8>)> = {
            let active = self.active_subs.lock().expect("subs lock poisoned");
            active.iter().map(|(s, m)| (*s, m.clone())).collect()
        };
        for (seqno, encoded) in subs {
            debug!(seqno, "replaying subscription");
            let frame = Frame::new(seqno, CMD_MESSAGE, encoded);
            if let Err(e) = self.send_frame(&frame).await {
                warn!(seqno, error = %e, "subscription replay failed");
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let is_end = frame.cmd == CMD_END;
        let seqno = frame.seqno;
        let sender = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            pending.get(&seqno).cloned()
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(Some(frame));
            }
            None => debug!(seqno, cmd = frame.cmd, "dropping frame for unknown seqno"),
        }
        if is_end {
            self.unregister(seqno);
            self.active_subs.lock().expect("subs lock poisoned").remove(&seqno);
        }
    }

    /// Fail in-flight point requests; streams backed by an active
    /// subscription survive for replay.
    fn fail_point_requests(&self) {
        let subs = self.active_subs.lock().expect("subs lock poisoned");
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.retain(|seqno, tx| {
            if subs.contains_key(seqno) {
                true
            } else {
                let _ = tx.send(None);
                false
            }
        });
    }

    fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn register(&self, seqno: u64) -> mpsc::UnboundedReceiver<Option<Frame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().expect("pending lock poisoned").insert(seqno, tx);
        rx
    }

    fn unregister(&self, seqno: u64) {
        self.pending.lock().expect("pending lock poisoned").remove(&seqno);
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame.write_to(&mut *writer).await
    }

    /// Send a message expecting a single status response.
    async fn point_request(&self, msg: &Message) -> Result<()> {
        let seqno = self.next_seqno();
        let mut rx = self.register(seqno);
        let outcome = async {
            self.send_frame(&Frame::new(seqno, CMD_MESSAGE, msg.encoded.clone())).await?;
            let frame = rx.recv().await.flatten().ok_or(PeerError::Disconnected)?;
            let (code, message) = frame.parse_status()?;
            if code == STATUS_OKAY {
                Ok(())
            } else {
                Err(PeerError::Status { code, message })
            }
        }
        .await;
        self.unregister(seqno);
        outcome
    }

    /// Forward a publish or persist to the peer.
    pub async fn publish(&self, msg: &Message) -> Result<()> {
        self.point_request(msg).await
    }

    /// Forward an unsubscribe to the peer. The subscription's own stream
    /// receives its end event when the remote sends `CMD_END`.
    pub async fn unsubscribe(&self, msg: &Message) -> Result<()> {
        self.point_request(msg).await
    }

    /// Forward a subscribe (or tap). Returns the remote subscription id
    /// and the event stream. The stream survives reconnects: the link
    /// replays the subscription and keeps delivering, without a duplicate
    /// end event.
    pub async fn subscribe(&self, msg: &Message) -> Result<(UniqueMessageId, mpsc::UnboundedReceiver<PeerEvent>)> {
        let seqno = self.next_seqno();
        let mut rx = self.register(seqno);
        self.send_frame(&Frame::new(seqno, CMD_MESSAGE, msg.encoded.clone())).await.inspect_err(|_| {
            self.unregister(seqno);
        })?;

        let frame = match rx.recv().await.flatten() {
            Some(f) => f,
            None => {
                self.unregister(seqno);
                return Err(PeerError::Disconnected);
            }
        };
        let (code, message) = frame.parse_status()?;
        if code != STATUS_OKAY {
            self.unregister(seqno);
            return Err(PeerError::Status { code, message });
        }
        if frame.body.len() < 18 {
            self.unregister(seqno);
            return Err(PeerError::BadFrame {
                reason: "subscribe status lacks a subscription id".to_string(),
            });
        }
        let umid = UniqueMessageId {
            mid: u64::from_le_bytes(frame.body[2..10].try_into().expect("status slice")),
            sig: u64::from_le_bytes(frame.body[10..18].try_into().expect("status slice")),
        };

        self.active_subs.lock().expect("subs lock poisoned").insert(seqno, msg.encoded.clone());
        Ok((umid, Self::stream_events(rx, StreamKind::Messages, true)))
    }

    /// Forward a query (or tap-query). The stream ends after the result
    /// set; a disconnect mid-stream ends it early.
    pub async fn query(&self, msg: &Message) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        self.stream_request(msg, StreamKind::Messages).await
    }

    /// Forward a list. Results are child URIs.
    pub async fn list(&self, msg: &Message) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        self.stream_request(msg, StreamKind::Uris).await
    }

    async fn stream_request(&self, msg: &Message, kind: StreamKind) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        let seqno = self.next_seqno();
        let mut rx = self.register(seqno);
        self.send_frame(&Frame::new(seqno, CMD_MESSAGE, msg.encoded.clone())).await.inspect_err(|_| {
            self.unregister(seqno);
        })?;
        let frame = match rx.recv().await.flatten() {
            Some(f) => f,
            None => {
                self.unregister(seqno);
                return Err(PeerError::Disconnected);
            }
        };
        let (code, message) = frame.parse_status()?;
        if code != STATUS_OKAY {
            self.unregister(seqno);
            return Err(PeerError::Status { code, message });
        }
        Ok(Self::stream_events(rx, kind, false))
    }

    /// Translate raw frames into peer events on a fresh channel.
    ///
    /// `survives_drop` distinguishes subscriptions (which ride out a
    /// disconnect waiting for replay) from finite result streams (which
    /// end early).
    fn stream_events(
        mut rx: mpsc::UnboundedReceiver<Option<Frame>>,
        kind: StreamKind,
        survives_drop: bool,
    ) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, out) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(frame) = item else {
                    if survives_drop {
                        continue;
                    }
                    let _ = tx.send(PeerEvent::End);
                    return;
                };
                match frame.cmd {
                    CMD_RESULT => match kind {
                        StreamKind::Messages => match Message::decode(&frame.body) {
                            Ok(m) => {
                                let _ = tx.send(PeerEvent::Message(Box::new(m)));
                            }
                            Err(e) => {
                                info!(error = %e, "dropping malformed peer result");
                            }
                        },
                        StreamKind::Uris => {
                            let _ = tx.send(PeerEvent::Uri(String::from_utf8_lossy(&frame.body).into_owned()));
                        }
                    },
                    CMD_END => {
                        let _ = tx.send(PeerEvent::End);
                        return;
                    }
                    // A replayed subscribe's fresh status frame.
                    CMD_RESPONSE => debug!("ignoring status frame on established stream"),
                    other => debug!(cmd = other, "ignoring unexpected frame on stream"),
                }
            }
            // Sender side vanished without an end frame.
            let _ = tx.send(PeerEvent::End);
        });
        out
    }
}
