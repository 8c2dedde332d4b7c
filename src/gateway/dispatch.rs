//! Command dispatch: the `send(imei, text, timeout)` surface consumed by the
//! bus subscriber and the admin plane.
//!
//! Codec 12 carries no correlation id, so pairing is strictly FIFO per
//! session: the oldest outstanding request claims the next response frame.
//! That contract only holds if the pipeline stays shallow, so in-flight
//! commands per session are capped and excess callers get a back-pressure
//! error instead of a queue slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::codec::codec12;
use crate::logutil::escape_log;
use crate::metrics;

use super::registry::SessionRegistry;
use super::session::SessionHandle;

/// Ways a dispatched command can fail. `Response` text rides the `Ok` arm.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("device is not connected")]
    DeviceNotConnected,

    #[error("too many commands in flight (limit {limit})")]
    PipelineFull { limit: usize },

    #[error("no response before the deadline")]
    Timeout,

    #[error("socket write failed: {0}")]
    WriteError(String),

    #[error("session closed before the device replied")]
    SessionGone,
}

/// One outstanding request, owned by its session's FIFO queue.
pub(crate) struct PendingCommand {
    pub(crate) id: u64,
    pub(crate) tx: oneshot::Sender<Result<String, CommandError>>,
}

pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    max_inflight: usize,
    default_timeout: Duration,
    next_id: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        max_inflight: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            max_inflight,
            default_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Frame `text` as a Codec 12 request, write it to the device bound to
    /// `imei`, and wait for the FIFO-paired response.
    ///
    /// The pending entry is enqueued and the frame written under the
    /// session's write lock, so concurrent callers cannot interleave queue
    /// order with wire order.
    pub async fn send(
        &self,
        imei: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let session = self
            .registry
            .lookup(imei)
            .ok_or(CommandError::DeviceNotConnected)?;

        let frame = codec12::encode_request(text);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        session
            .dispatch_command(PendingCommand { id, tx }, &frame, self.max_inflight)
            .await?;
        metrics::inc_commands_dispatched();
        debug!(
            "command {id} -> imei={imei} bytes={} text={}",
            frame.len(),
            escape_log(text)
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving: the session tore down.
            Ok(Err(_)) => Err(CommandError::SessionGone),
            Err(_) => {
                session.remove_pending(id);
                metrics::inc_command_timeouts();
                warn!("command {id} to imei={imei} timed out");
                Err(CommandError::Timeout)
            }
        }
    }

    /// Pair a decoded Codec 12 response with the oldest outstanding request
    /// on `session`. Returns whether the response was solicited; callers
    /// forward unsolicited text to the event sink.
    pub(crate) fn on_response(&self, session: &SessionHandle, text: &str) -> bool {
        match session.pop_pending() {
            Some(entry) => {
                metrics::inc_commands_completed();
                let _ = entry.tx.send(Ok(text.to_string()));
                true
            }
            None => {
                metrics::inc_unsolicited_responses();
                false
            }
        }
    }

    /// Fail every outstanding request on a session that is going away.
    pub(crate) fn on_session_closed(&self, session: &SessionHandle) {
        for entry in session.drain_pending() {
            let _ = entry.tx.send(Err(CommandError::SessionGone));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::SessionHandle;

    fn dispatcher() -> (CommandDispatcher, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        (
            CommandDispatcher::new(Arc::clone(&registry), 2, Duration::from_secs(30)),
            registry,
        )
    }

    #[tokio::test]
    async fn send_without_session_is_device_not_connected() {
        let (dispatcher, _registry) = dispatcher();
        let err = dispatcher
            .send("353691844288760", "getver", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::DeviceNotConnected);
    }

    #[tokio::test]
    async fn responses_pair_fifo() {
        let (dispatcher, registry) = dispatcher();
        let session = SessionHandle::detached("127.0.0.1:50001".parse().unwrap());
        registry.bind("353691844288760", &session);

        let dispatcher = Arc::new(dispatcher);
        let a = tokio::spawn({
            let d = Arc::clone(&dispatcher);
            let d2 = Arc::clone(&dispatcher);
            async move {
                let first = d.send("353691844288760", "A", Duration::from_secs(5));
                let second = d2.send("353691844288760", "B", Duration::from_secs(5));
                tokio::join!(first, second)
            }
        });
        // Let both commands enqueue before replying
        tokio::time::sleep(Duration::from_millis(50)).await;
        let looked_up = registry.lookup("353691844288760").unwrap();
        assert_eq!(looked_up.pending_len(), 2);

        // FIFO: first reply resolves the first command
        assert!(dispatcher.on_response(&looked_up, "ra"));
        assert!(dispatcher.on_response(&looked_up, "rb"));
        let (first, second) = a.await.unwrap();
        assert_eq!(first.unwrap(), "ra");
        assert_eq!(second.unwrap(), "rb");
    }

    #[tokio::test]
    async fn pipeline_depth_is_bounded() {
        let (dispatcher, registry) = dispatcher();
        let session = SessionHandle::detached("127.0.0.1:50002".parse().unwrap());
        registry.bind("353691844288760", &session);
        let dispatcher = Arc::new(dispatcher);

        let mut waiting = Vec::new();
        for cmd in ["one", "two"] {
            let d = Arc::clone(&dispatcher);
            waiting.push(tokio::spawn(async move {
                d.send("353691844288760", cmd, Duration::from_secs(5)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = dispatcher
            .send("353691844288760", "three", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::PipelineFull { limit: 2 });

        // Unblock the queued commands so the spawned tasks finish
        dispatcher.on_response(&session, "r1");
        dispatcher.on_response(&session, "r2");
        for task in waiting {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_entry() {
        let (dispatcher, registry) = dispatcher();
        let session = SessionHandle::detached("127.0.0.1:50003".parse().unwrap());
        registry.bind("353691844288760", &session);

        let err = dispatcher
            .send("353691844288760", "slow", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
        assert_eq!(session.pending_len(), 0);
        // A late response is now unsolicited
        assert!(!dispatcher.on_response(&session, "late"));
    }

    #[tokio::test]
    async fn teardown_fails_outstanding_commands() {
        let (dispatcher, registry) = dispatcher();
        let session = SessionHandle::detached("127.0.0.1:50004".parse().unwrap());
        registry.bind("353691844288760", &session);
        let dispatcher = Arc::new(dispatcher);

        let task = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                d.send("353691844288760", "doomed", Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.on_session_closed(&session);
        assert_eq!(task.await.unwrap().unwrap_err(), CommandError::SessionGone);
    }
}
