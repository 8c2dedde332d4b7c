//! The device-facing gateway: listener, admission, sessions, registry, and
//! command dispatch, composed as explicit collaborators.
//!
//! ```text
//! ┌──────────┐   accept   ┌─────────┐  frames  ┌───────────┐
//! │ Listener  │──────────→│ Session │─────────→│ Event sink │
//! └──────────┘            └─────────┘          └───────────┘
//!       │ evaluate_open        │ bind/lookup
//! ┌──────────┐            ┌─────────┐   send   ┌────────────┐
//! │ Admission │            │ Registry │←────────│ Dispatcher │
//! └──────────┘            └─────────┘          └────────────┘
//! ```
//!
//! Nothing in here owns an outbound connection; bus publishers and webhook
//! forwarders subscribe through [`events::EventSink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::Config;
use crate::metrics;

pub mod admission;
pub mod dispatch;
pub mod events;
pub mod registry;
pub mod session;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionUpdate};
pub use dispatch::{CommandDispatcher, CommandError};
pub use events::{ChannelSink, EventSink, GatewayEvent, LogSink};
pub use registry::{BindOutcome, SessionRegistry};
pub use session::{SessionHandle, SessionState};

macro_rules! sec_log {
    ($($arg:tt)*) => { log::warn!(target: "security", $($arg)*); };
}
pub(crate) use sec_log;

use session::{Session, SessionContext};

/// Cloneable trigger for stopping a running gateway from another task.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// The composed gateway. `new` wires the collaborators, `bind` claims the
/// TCP port, `run` serves until ctrl-c or a [`ShutdownTrigger`] fires.
pub struct GatewayServer {
    config: Config,
    admission: Arc<AdmissionController>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    sink: Arc<dyn EventSink>,
    listener: Option<TcpListener>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            config.commands.max_inflight,
            Duration::from_millis(config.commands.default_timeout_ms),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            admission,
            registry,
            dispatcher,
            sink,
            listener: None,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Bind the device-facing port. Returns the bound address so callers can
    /// use port 0 and discover the ephemeral port.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.gateway.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.gateway.bind))?;
        let addr = listener.local_addr().context("listener has no local address")?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Dispatch surface for bus subscribers and the admin plane.
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Accept loop. Each admitted socket gets its own session task; denied
    /// sockets are dropped before a session ever exists.
    pub async fn run(mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("bind() must be called before run()")?;
        info!(
            "gateway listening on {} (max {} devices/source)",
            listener.local_addr()?,
            self.admission.config().max_devices_per_source
        );

        let sweep_secs = self.config.admission.sweep_interval_secs.max(1);
        let mut sweep = tokio::time::interval(Duration::from_secs(sweep_secs));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => {
                            // Transient accept failures (EMFILE and friends)
                            // must not take the listener down.
                            error!("accept failed: {e}");
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.admission.sweep();
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    break;
                }
            }
        }

        drop(listener);
        // Sessions observe the watch flip, fail their pending commands with
        // SessionGone, and tear down on their own.
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let snap = metrics::snapshot();
        info!(
            "gateway stopped: {} sessions served, {} AVL records, {} commands",
            snap.sessions_opened, snap.avl_records, snap.commands_dispatched
        );
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(denial) = self.admission.evaluate_open(peer.ip()) {
            sec_log!("connection denied source={peer} reason={denial}");
            metrics::inc_admission_denials();
            drop(stream);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("set_nodelay failed for {peer}: {e}");
        }
        let ctx = SessionContext {
            admission: Arc::clone(&self.admission),
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            sink: Arc::clone(&self.sink),
            max_frame_bytes: self.config.gateway.max_frame_bytes,
        };
        let (read_half, write_half) = stream.into_split();
        let (_handle, session) =
            Session::attach(read_half, write_half, peer, ctx, self.shutdown_rx.clone());
        tokio::spawn(session.run());
    }
}
