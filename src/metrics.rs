//! Process-wide gateway counters.
//! Plain atomics with a snapshot accessor; a Prometheus exposition layer can
//! sit on top of this later without touching call sites.

use std::sync::atomic::{AtomicU64, Ordering};

static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_REJECTED: AtomicU64 = AtomicU64::new(0);
static ADMISSION_DENIALS: AtomicU64 = AtomicU64::new(0);
static AVL_RECORDS: AtomicU64 = AtomicU64::new(0);
static CRC_MISMATCHES: AtomicU64 = AtomicU64::new(0);
static COMMANDS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static COMMAND_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static UNSOLICITED_RESPONSES: AtomicU64 = AtomicU64::new(0);

pub fn inc_sessions_opened() {
    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sessions_closed() {
    SESSIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handshakes_accepted() {
    HANDSHAKES_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handshakes_rejected() {
    HANDSHAKES_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_admission_denials() {
    ADMISSION_DENIALS.fetch_add(1, Ordering::Relaxed);
}
pub fn add_avl_records(n: u64) {
    AVL_RECORDS.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_crc_mismatches() {
    CRC_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_dispatched() {
    COMMANDS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_completed() {
    COMMANDS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_command_timeouts() {
    COMMAND_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unsolicited_responses() {
    UNSOLICITED_RESPONSES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub handshakes_accepted: u64,
    pub handshakes_rejected: u64,
    pub admission_denials: u64,
    pub avl_records: u64,
    pub crc_mismatches: u64,
    pub commands_dispatched: u64,
    pub commands_completed: u64,
    pub command_timeouts: u64,
    pub unsolicited_responses: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
        sessions_closed: SESSIONS_CLOSED.load(Ordering::Relaxed),
        handshakes_accepted: HANDSHAKES_ACCEPTED.load(Ordering::Relaxed),
        handshakes_rejected: HANDSHAKES_REJECTED.load(Ordering::Relaxed),
        admission_denials: ADMISSION_DENIALS.load(Ordering::Relaxed),
        avl_records: AVL_RECORDS.load(Ordering::Relaxed),
        crc_mismatches: CRC_MISMATCHES.load(Ordering::Relaxed),
        commands_dispatched: COMMANDS_DISPATCHED.load(Ordering::Relaxed),
        commands_completed: COMMANDS_COMPLETED.load(Ordering::Relaxed),
        command_timeouts: COMMAND_TIMEOUTS.load(Ordering::Relaxed),
        unsolicited_responses: UNSOLICITED_RESPONSES.load(Ordering::Relaxed),
    }
}
