//! The observer seam between the session engine and the outside world.
//!
//! The core never dials outbound connections; everything a bus publisher,
//! webhook forwarder, or dashboard needs arrives through one [`EventSink`].
//! Sinks must not block the session read loop — the channel adapter below is
//! the expected shape for anything that does real I/O.

use std::net::SocketAddr;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::AvlRecord;
use crate::logutil::escape_log;

/// Everything the core reports. Tagged for JSON consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    SessionOpened {
        session_id: Uuid,
        peer: SocketAddr,
    },
    Authenticated {
        imei: String,
        session_id: Uuid,
    },
    AvlRecord {
        imei: String,
        record: AvlRecord,
    },
    CommandResponse {
        imei: String,
        text: String,
        solicited: bool,
    },
    SessionClosed {
        imei: Option<String>,
        session_id: Uuid,
        reason: String,
    },
}

/// Observer contract. Implementations must return quickly; a slow sink
/// back-pressures the session that emitted the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Adapter pushing events onto an unbounded channel; the consumer side is
/// free to batch, publish, or drop at its own pace.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: GatewayEvent) {
        // A closed receiver means the host is shutting down; drop silently.
        let _ = self.tx.send(event);
    }
}

/// Fallback sink for running the gateway without a bus attached.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::SessionOpened { session_id, peer } => {
                info!("session {session_id} opened from {peer}");
            }
            GatewayEvent::Authenticated { imei, session_id } => {
                info!("session {session_id} authenticated as {imei}");
            }
            GatewayEvent::AvlRecord { imei, record } => {
                info!(
                    "avl imei={imei} ts={} prio={} lat={:.7} lng={:.7} speed={} sats={} event={}",
                    record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    record.priority,
                    record.fix.latitude,
                    record.fix.longitude,
                    record.fix.speed,
                    record.fix.satellites,
                    record.event_id
                );
            }
            GatewayEvent::CommandResponse {
                imei,
                text,
                solicited,
            } => {
                info!(
                    "response imei={imei} solicited={solicited} text={}",
                    escape_log(text)
                );
            }
            GatewayEvent::SessionClosed {
                imei,
                session_id,
                reason,
            } => {
                info!(
                    "session {session_id} closed imei={} reason={reason}",
                    imei.as_deref().unwrap_or("-")
                );
            }
        }
    }
}
