//! Per-connection session engine.
//!
//! Each accepted socket gets one `Session` task. The task owns the read half
//! and an accumulating buffer; the shared [`SessionHandle`] carries the write
//! half (behind an async mutex so frames never interleave), the bound IMEI,
//! and the FIFO of outstanding Codec 12 requests the dispatcher pairs
//! responses against.
//!
//! State machine:
//!
//! ```text
//! Connecting -> Authenticating -> Streaming -> Closing -> Terminated
//! ```
//!
//! `Connecting` lasts until the first bytes arrive. The handshake decides
//! `Streaming` (ack 0x01) or `Closing` (ack 0x00). While streaming, AVL
//! batches are acknowledged with the record count as a u32 and every record
//! goes to the event sink in ascending timestamp order; Codec 12 responses
//! are offered to the dispatcher before any event is produced. A malformed
//! frame closes the session; the peer is expected to reconnect and start
//! over with a handshake.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::codec::{self, avl, codec12, Decode, FrameKind};
use crate::imei;
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;

use super::admission::AdmissionController;
use super::dispatch::{CommandDispatcher, CommandError, PendingCommand};
use super::events::{EventSink, GatewayEvent};
use super::registry::{BindOutcome, SessionRegistry};
use super::sec_log;

/// Handshake accept / reject bytes on the wire.
const ACK_ACCEPT: [u8; 1] = [0x01];
const ACK_REJECT: [u8; 1] = [0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Streaming,
    Closing,
    Terminated,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The shareable face of a session: everything the registry and the command
/// dispatcher touch. The read loop stays private to the session task.
pub struct SessionHandle {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub opened_at: DateTime<Utc>,
    imei: RwLock<Option<String>>,
    state: RwLock<SessionState>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<VecDeque<PendingCommand>>,
}

impl SessionHandle {
    fn new(peer: SocketAddr, writer: BoxedWriter) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            opened_at: Utc::now(),
            imei: RwLock::new(None),
            state: RwLock::new(SessionState::Connecting),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Handle with a discarding writer, for exercising the registry and
    /// dispatcher without a socket.
    #[cfg(test)]
    pub(crate) fn detached(peer: SocketAddr) -> Arc<Self> {
        Self::new(peer, Box::new(tokio::io::sink()))
    }

    pub fn imei(&self) -> Option<String> {
        self.imei.read().expect("imei lock poisoned").clone()
    }

    fn set_imei(&self, imei: &str) {
        *self.imei.write().expect("imei lock poisoned") = Some(imei.to_string());
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Write one frame, whole. The async mutex is the serialization point
    /// for acks and dispatched commands alike.
    pub(crate) async fn write_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Enqueue a pending command and write its frame under the same write
    /// lock, so queue order always matches wire order. The queue entry is
    /// rolled back if the write fails.
    pub(crate) async fn dispatch_command(
        &self,
        entry: PendingCommand,
        frame: &[u8],
        limit: usize,
    ) -> Result<(), CommandError> {
        let entry_id = entry.id;
        let mut writer = self.writer.lock().await;
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.len() >= limit {
                return Err(CommandError::PipelineFull { limit });
            }
            pending.push_back(entry);
        }
        let wrote = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = wrote {
            self.remove_pending(entry_id);
            return Err(CommandError::WriteError(e.to_string()));
        }
        Ok(())
    }

    pub(crate) fn pop_pending(&self) -> Option<PendingCommand> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .pop_front()
    }

    pub(crate) fn remove_pending(&self, id: u64) -> Option<PendingCommand> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let pos = pending.iter().position(|p| p.id == id)?;
        pending.remove(pos)
    }

    pub(crate) fn drain_pending(&self) -> Vec<PendingCommand> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .drain(..)
            .collect()
    }

    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Collaborators threaded into every session by the listener.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub admission: Arc<AdmissionController>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sink: Arc<dyn EventSink>,
    pub max_frame_bytes: usize,
}

/// The owning side of one connection: read half, buffer, collaborators.
pub(crate) struct Session {
    handle: Arc<SessionHandle>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    ctx: SessionContext,
    shutdown: watch::Receiver<bool>,
    buf: BytesMut,
}

impl Session {
    /// Pair a handle with its read task. Generic over the transport so tests
    /// can drive a session through an in-memory duplex pipe.
    pub(crate) fn attach<R, W>(
        reader: R,
        writer: W,
        peer: SocketAddr,
        ctx: SessionContext,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<SessionHandle>, Session)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = SessionHandle::new(peer, Box::new(writer));
        let session = Session {
            handle: Arc::clone(&handle),
            reader: Box::new(reader),
            ctx,
            shutdown,
            buf: BytesMut::with_capacity(4096),
        };
        (handle, session)
    }

    pub(crate) async fn run(mut self) {
        metrics::inc_sessions_opened();
        debug!("session {} opened from {}", self.handle.id, self.handle.peer);
        self.ctx.sink.emit(GatewayEvent::SessionOpened {
            session_id: self.handle.id,
            peer: self.handle.peer,
        });
        let reason = self.read_loop().await;
        self.teardown(reason).await;
    }

    async fn read_loop(&mut self) -> &'static str {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    return "shutdown";
                }
                read = self.reader.read_buf(&mut self.buf) => {
                    match read {
                        Ok(0) => return "peer_closed",
                        Ok(_) => {
                            if self.handle.state() == SessionState::Connecting {
                                self.handle.set_state(SessionState::Authenticating);
                            }
                            if let Err(reason) = self.drain_frames().await {
                                return reason;
                            }
                        }
                        Err(e) => {
                            warn!(
                                "session {} read error from {}: {}",
                                self.handle.id, self.handle.peer, e
                            );
                            return "io_error";
                        }
                    }
                }
            }
        }
    }

    /// Decode every complete frame currently buffered. The retained suffix
    /// always starts at the first unconsumed byte.
    async fn drain_frames(&mut self) -> Result<(), &'static str> {
        loop {
            if self.buf.is_empty() {
                return Ok(());
            }
            match self.handle.state() {
                SessionState::Authenticating => match codec::decode_handshake(&self.buf) {
                    Ok(Decode::Incomplete) => return Ok(()),
                    Ok(Decode::Complete { value, consumed }) => {
                        self.buf.advance(consumed);
                        self.finish_handshake(value).await?;
                    }
                    Err(e) => {
                        warn!(
                            "session {} bad handshake from {}: {} ({})",
                            self.handle.id,
                            self.handle.peer,
                            e,
                            hex_snippet(&self.buf, 24)
                        );
                        let _ = self.handle.write_frame(&ACK_REJECT).await;
                        metrics::inc_handshakes_rejected();
                        return Err("protocol_error");
                    }
                },
                SessionState::Streaming => {
                    match codec::classify(&self.buf, self.ctx.max_frame_bytes) {
                        FrameKind::NeedMoreBytes => return Ok(()),
                        FrameKind::AvlBatch => self.consume_avl().await?,
                        FrameKind::Codec12Response => self.consume_response().await?,
                        FrameKind::Handshake | FrameKind::Malformed => {
                            warn!(
                                "session {} imei={} unparseable stream bytes: {}",
                                self.handle.id,
                                self.handle.imei().unwrap_or_default(),
                                hex_snippet(&self.buf, 24)
                            );
                            return Err("protocol_error");
                        }
                    }
                }
                // Closing/Terminated: late bytes are dropped with the buffer.
                _ => return Ok(()),
            }
        }
    }

    async fn finish_handshake(&mut self, candidate: String) -> Result<(), &'static str> {
        let cfg = self.ctx.admission.config();
        if let Err(e) = imei::validate(&candidate, cfg.imei_allow_enabled, &cfg.imei_allow_list) {
            sec_log!(
                "handshake rejected imei={} source={} reason={}",
                escape_log(&candidate),
                self.handle.peer,
                e
            );
            metrics::inc_handshakes_rejected();
            let _ = self.handle.write_frame(&ACK_REJECT).await;
            return Err("handshake_rejected");
        }

        // Registry first: if another session owns the IMEI the incumbent
        // wins and this connection goes away without touching admission.
        if self.ctx.registry.bind(&candidate, &self.handle) == BindOutcome::Conflict {
            sec_log!(
                "duplicate session for imei={} source={}; existing binding kept",
                candidate,
                self.handle.peer
            );
            metrics::inc_handshakes_rejected();
            let _ = self.handle.write_frame(&ACK_REJECT).await;
            return Err("duplicate_imei");
        }

        if let Err(d) = self
            .ctx
            .admission
            .evaluate_bind(self.handle.peer.ip(), &candidate)
        {
            self.ctx.registry.unbind(&candidate, &self.handle);
            sec_log!(
                "bind denied imei={} source={} reason={}",
                candidate,
                self.handle.peer,
                d
            );
            metrics::inc_admission_denials();
            let _ = self.handle.write_frame(&ACK_REJECT).await;
            return Err("per_source_cap");
        }

        self.handle.set_imei(&candidate);
        if self.handle.write_frame(&ACK_ACCEPT).await.is_err() {
            return Err("write_error");
        }
        self.handle.set_state(SessionState::Streaming);
        metrics::inc_handshakes_accepted();
        info!(
            "session {} authenticated imei={} source={}",
            self.handle.id, candidate, self.handle.peer
        );
        self.ctx.sink.emit(GatewayEvent::Authenticated {
            imei: candidate,
            session_id: self.handle.id,
        });
        Ok(())
    }

    async fn consume_avl(&mut self) -> Result<(), &'static str> {
        let batch = match avl::decode_avl(&self.buf, self.ctx.max_frame_bytes) {
            Ok(Decode::Incomplete) => return Ok(()),
            Ok(Decode::Complete { value, consumed }) => {
                self.buf.advance(consumed);
                value
            }
            Err(e) => {
                warn!(
                    "session {} imei={} malformed AVL batch: {}",
                    self.handle.id,
                    self.handle.imei().unwrap_or_default(),
                    e
                );
                return Err("protocol_error");
            }
        };

        let imei = self.handle.imei().unwrap_or_default();
        if !batch.crc_ok {
            metrics::inc_crc_mismatches();
            warn!(
                "session {} imei={} AVL CRC mismatch; keeping {} record(s)",
                self.handle.id, imei, batch.quantity
            );
        }

        // Devices read this as "records persisted": the count, not a length.
        let ack = (batch.quantity as u32).to_be_bytes();
        if self.handle.write_frame(&ack).await.is_err() {
            return Err("write_error");
        }
        metrics::add_avl_records(batch.records.len() as u64);

        let mut records = batch.records;
        records.sort_by_key(|r| r.timestamp);
        for record in records {
            self.ctx.sink.emit(GatewayEvent::AvlRecord {
                imei: imei.clone(),
                record,
            });
        }
        Ok(())
    }

    async fn consume_response(&mut self) -> Result<(), &'static str> {
        let response = match codec12::decode_response(&self.buf, self.ctx.max_frame_bytes) {
            Ok(Decode::Incomplete) => return Ok(()),
            Ok(Decode::Complete { value, consumed }) => {
                self.buf.advance(consumed);
                value
            }
            Err(e) => {
                warn!(
                    "session {} imei={} malformed command response: {}",
                    self.handle.id,
                    self.handle.imei().unwrap_or_default(),
                    e
                );
                return Err("protocol_error");
            }
        };

        let imei = self.handle.imei().unwrap_or_default();
        if !response.crc_ok {
            metrics::inc_crc_mismatches();
            warn!(
                "session {} imei={} command response CRC mismatch; delivering text",
                self.handle.id, imei
            );
        }

        // The dispatcher sees the response before any event is produced.
        let solicited = self.ctx.dispatcher.on_response(&self.handle, &response.text);
        if !solicited {
            debug!(
                "session {} imei={} unsolicited response: {}",
                self.handle.id,
                imei,
                escape_log(&response.text)
            );
        }
        self.ctx.sink.emit(GatewayEvent::CommandResponse {
            imei,
            text: response.text,
            solicited,
        });
        Ok(())
    }

    async fn teardown(mut self, reason: &'static str) {
        self.handle.set_state(SessionState::Closing);
        let imei = self.handle.imei();
        if let Some(ref imei) = imei {
            self.ctx.registry.unbind(imei, &self.handle);
            self.ctx.admission.release(self.handle.peer.ip(), imei);
        }
        self.ctx.dispatcher.on_session_closed(&self.handle);
        self.handle.shutdown_writer().await;
        self.buf.clear();

        info!(
            "session {} closed imei={} source={} reason={}",
            self.handle.id,
            imei.as_deref().unwrap_or("-"),
            self.handle.peer,
            reason
        );
        self.ctx.sink.emit(GatewayEvent::SessionClosed {
            imei,
            session_id: self.handle.id,
            reason: reason.to_string(),
        });
        metrics::inc_sessions_closed();
        self.handle.set_state(SessionState::Terminated);
    }
}
