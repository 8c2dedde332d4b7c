//! Connection admission: per-source rate limiting, soft-bans, device caps,
//! and the allow-lists consulted during the handshake.
//!
//! State is keyed by source IP. Entries are created lazily on first contact
//! and pruned by the periodic sweep once their window, ban, and device set
//! have all drained. Critical sections hold the map lock only for counter
//! updates; nothing here touches a socket.
//!
//! Configuration is runtime-mutable through [`AdmissionController::update`];
//! readers always see a consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Tunables. Defaults: 5-minute window, 5 attempts, 10 devices per source,
/// 1-hour soft ban, both allow-lists disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_window: u32,
    #[serde(default = "default_max_devices")]
    pub max_devices_per_source: usize,
    #[serde(default = "default_soft_ban_ms")]
    pub soft_ban_ms: u64,
    #[serde(default)]
    pub imei_allow_enabled: bool,
    #[serde(default)]
    pub imei_allow_list: HashSet<String>,
    #[serde(default)]
    pub source_allow_enabled: bool,
    #[serde(default)]
    pub source_allow_list: HashSet<String>,
    /// Cadence of the background prune task, seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_rate_window_ms() -> u64 {
    300_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_devices() -> usize {
    10
}
fn default_soft_ban_ms() -> u64 {
    3_600_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_window_ms: default_rate_window_ms(),
            max_attempts_per_window: default_max_attempts(),
            max_devices_per_source: default_max_devices(),
            soft_ban_ms: default_soft_ban_ms(),
            imei_allow_enabled: false,
            imei_allow_list: HashSet::new(),
            source_allow_enabled: false,
            source_allow_list: HashSet::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Partial runtime update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionUpdate {
    pub rate_window_ms: Option<u64>,
    pub max_attempts_per_window: Option<u32>,
    pub max_devices_per_source: Option<usize>,
    pub soft_ban_ms: Option<u64>,
    pub imei_allow_enabled: Option<bool>,
    pub imei_allow_list: Option<HashSet<String>>,
    pub source_allow_enabled: Option<bool>,
    pub source_allow_list: Option<HashSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OpenDenial {
    #[error("banned")]
    Banned,
    #[error("not_allowed")]
    NotAllowed,
    #[error("too_many_attempts")]
    TooManyAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindDenial {
    #[error("per_source_cap")]
    PerSourceCap,
}

#[derive(Debug)]
struct SourceState {
    window_start: Instant,
    attempts: u32,
    banned_until: Option<Instant>,
    devices: HashSet<String>,
}

impl SourceState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            attempts: 0,
            banned_until: None,
            devices: HashSet::new(),
        }
    }
}

pub struct AdmissionController {
    config: RwLock<AdmissionConfig>,
    sources: Mutex<HashMap<IpAddr, SourceState>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config: RwLock::new(config),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Consistent view of the current tunables.
    pub fn config(&self) -> AdmissionConfig {
        self.config.read().expect("admission config poisoned").clone()
    }

    /// Apply a partial update atomically.
    pub fn update(&self, update: AdmissionUpdate) {
        let mut cfg = self.config.write().expect("admission config poisoned");
        if let Some(v) = update.rate_window_ms {
            cfg.rate_window_ms = v;
        }
        if let Some(v) = update.max_attempts_per_window {
            cfg.max_attempts_per_window = v;
        }
        if let Some(v) = update.max_devices_per_source {
            cfg.max_devices_per_source = v;
        }
        if let Some(v) = update.soft_ban_ms {
            cfg.soft_ban_ms = v;
        }
        if let Some(v) = update.imei_allow_enabled {
            cfg.imei_allow_enabled = v;
        }
        if let Some(v) = update.imei_allow_list {
            cfg.imei_allow_list = v;
        }
        if let Some(v) = update.source_allow_enabled {
            cfg.source_allow_enabled = v;
        }
        if let Some(v) = update.source_allow_list {
            cfg.source_allow_list = v;
        }
    }

    /// Gate a fresh TCP connection from `source`.
    pub fn evaluate_open(&self, source: IpAddr) -> Result<(), OpenDenial> {
        self.evaluate_open_at(source, Instant::now())
    }

    fn evaluate_open_at(&self, source: IpAddr, now: Instant) -> Result<(), OpenDenial> {
        let cfg = self.config();
        let mut sources = self.sources.lock().expect("admission map poisoned");
        let state = sources.entry(source).or_insert_with(|| SourceState::new(now));

        if let Some(until) = state.banned_until {
            if now < until {
                return Err(OpenDenial::Banned);
            }
            state.banned_until = None;
        }

        if cfg.source_allow_enabled && !cfg.source_allow_list.contains(&source.to_string()) {
            return Err(OpenDenial::NotAllowed);
        }

        if now.duration_since(state.window_start) >= Duration::from_millis(cfg.rate_window_ms) {
            state.window_start = now;
            state.attempts = 0;
        }
        state.attempts += 1;
        if state.attempts > cfg.max_attempts_per_window {
            state.banned_until = Some(now + Duration::from_millis(cfg.soft_ban_ms));
            return Err(OpenDenial::TooManyAttempts);
        }
        Ok(())
    }

    /// Gate the handshake binding of `imei` from `source`; on success the
    /// IMEI is recorded against the source and the attempt counter resets.
    pub fn evaluate_bind(&self, source: IpAddr, imei: &str) -> Result<(), BindDenial> {
        let cfg = self.config();
        let mut sources = self.sources.lock().expect("admission map poisoned");
        let state = sources
            .entry(source)
            .or_insert_with(|| SourceState::new(Instant::now()));
        if !state.devices.contains(imei) && state.devices.len() >= cfg.max_devices_per_source {
            return Err(BindDenial::PerSourceCap);
        }
        state.devices.insert(imei.to_string());
        state.attempts = 0;
        Ok(())
    }

    /// Forget the binding of `imei` to `source` after session teardown.
    pub fn release(&self, source: IpAddr, imei: &str) {
        self.release_at(source, imei, Instant::now())
    }

    fn release_at(&self, source: IpAddr, imei: &str, now: Instant) {
        let cfg = self.config();
        let mut sources = self.sources.lock().expect("admission map poisoned");
        if let Some(state) = sources.get_mut(&source) {
            state.devices.remove(imei);
            let window_expired = now.duration_since(state.window_start)
                >= Duration::from_millis(cfg.rate_window_ms);
            let ban_expired = state.banned_until.map(|t| now >= t).unwrap_or(true);
            if state.devices.is_empty() && window_expired && ban_expired {
                sources.remove(&source);
            }
        }
    }

    /// Prune expired windows and bans. Called from the gateway's periodic
    /// sweep; safe to call at any cadence.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) {
        let cfg = self.config();
        let window = Duration::from_millis(cfg.rate_window_ms);
        let mut sources = self.sources.lock().expect("admission map poisoned");
        sources.retain(|_, state| {
            if let Some(until) = state.banned_until {
                if now >= until {
                    state.banned_until = None;
                }
            }
            let window_live = now.duration_since(state.window_start) < window;
            !state.devices.is_empty() || window_live || state.banned_until.is_some()
        });
    }

    /// Number of tracked sources (diagnostics).
    pub fn tracked_sources(&self) -> usize {
        self.sources.lock().expect("admission map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    fn controller(window_ms: u64, attempts: u32) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            rate_window_ms: window_ms,
            max_attempts_per_window: attempts,
            soft_ban_ms: window_ms,
            ..AdmissionConfig::default()
        })
    }

    #[test]
    fn sixth_open_trips_the_ban() {
        let ctrl = controller(300_000, 5);
        let now = Instant::now();
        for i in 0..5 {
            assert!(ctrl.evaluate_open_at(src(1), now).is_ok(), "attempt {i}");
        }
        assert_eq!(
            ctrl.evaluate_open_at(src(1), now),
            Err(OpenDenial::TooManyAttempts)
        );
        // While banned the denial reason changes
        assert_eq!(
            ctrl.evaluate_open_at(src(1), now + Duration::from_secs(1)),
            Err(OpenDenial::Banned)
        );
        // Another source is unaffected
        assert!(ctrl.evaluate_open_at(src(2), now).is_ok());
    }

    #[test]
    fn ban_decays_after_expiry() {
        let ctrl = controller(1_000, 1);
        let now = Instant::now();
        assert!(ctrl.evaluate_open_at(src(1), now).is_ok());
        assert_eq!(
            ctrl.evaluate_open_at(src(1), now),
            Err(OpenDenial::TooManyAttempts)
        );
        let later = now + Duration::from_millis(1_500);
        // Ban and window have both lapsed; source starts a fresh window
        assert!(ctrl.evaluate_open_at(src(1), later).is_ok());
    }

    #[test]
    fn window_roll_resets_attempts() {
        let ctrl = controller(1_000, 2);
        let now = Instant::now();
        assert!(ctrl.evaluate_open_at(src(1), now).is_ok());
        assert!(ctrl.evaluate_open_at(src(1), now).is_ok());
        let next_window = now + Duration::from_millis(1_001);
        assert!(ctrl.evaluate_open_at(src(1), next_window).is_ok());
    }

    #[test]
    fn successful_bind_resets_attempts() {
        let ctrl = controller(300_000, 3);
        let now = Instant::now();
        ctrl.evaluate_open_at(src(1), now).unwrap();
        ctrl.evaluate_open_at(src(1), now).unwrap();
        ctrl.evaluate_bind(src(1), "353691844288760").unwrap();
        // Counter restarted: three more opens fit in the same window
        for _ in 0..3 {
            assert!(ctrl.evaluate_open_at(src(1), now).is_ok());
        }
    }

    #[test]
    fn per_source_device_cap() {
        let ctrl = AdmissionController::new(AdmissionConfig {
            max_devices_per_source: 2,
            ..AdmissionConfig::default()
        });
        ctrl.evaluate_bind(src(1), "353691844288760").unwrap();
        ctrl.evaluate_bind(src(1), "356307042441013").unwrap();
        assert_eq!(
            ctrl.evaluate_bind(src(1), "350000000000019"),
            Err(BindDenial::PerSourceCap)
        );
        // Rebinding an already-recorded IMEI is fine
        assert!(ctrl.evaluate_bind(src(1), "353691844288760").is_ok());
        // Releasing frees a slot
        ctrl.release(src(1), "356307042441013");
        assert!(ctrl.evaluate_bind(src(1), "350000000000019").is_ok());
    }

    #[test]
    fn source_allow_list_gates_opens() {
        let mut cfg = AdmissionConfig::default();
        cfg.source_allow_enabled = true;
        cfg.source_allow_list.insert("192.0.2.1".to_string());
        let ctrl = AdmissionController::new(cfg);
        assert!(ctrl.evaluate_open(src(1)).is_ok());
        assert_eq!(ctrl.evaluate_open(src(9)), Err(OpenDenial::NotAllowed));
    }

    #[test]
    fn sweep_prunes_idle_sources() {
        let ctrl = controller(1_000, 5);
        let now = Instant::now();
        ctrl.evaluate_open_at(src(1), now).unwrap();
        ctrl.evaluate_bind(src(2), "353691844288760").unwrap();
        assert_eq!(ctrl.tracked_sources(), 2);
        ctrl.sweep_at(now + Duration::from_millis(2_000));
        // src(1) had an expired window and no devices; src(2) keeps its device
        assert_eq!(ctrl.tracked_sources(), 1);
        ctrl.release_at(src(2), "353691844288760", now + Duration::from_millis(2_000));
        assert_eq!(ctrl.tracked_sources(), 0);
    }

    #[test]
    fn runtime_update_applies_partially() {
        let ctrl = AdmissionController::new(AdmissionConfig::default());
        ctrl.update(AdmissionUpdate {
            max_attempts_per_window: Some(1),
            imei_allow_enabled: Some(true),
            ..AdmissionUpdate::default()
        });
        let cfg = ctrl.config();
        assert_eq!(cfg.max_attempts_per_window, 1);
        assert!(cfg.imei_allow_enabled);
        // Untouched fields keep defaults
        assert_eq!(cfg.rate_window_ms, 300_000);
    }
}
