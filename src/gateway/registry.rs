//! IMEI-keyed session registry.
//!
//! One authoritative map from IMEI to the live session for that device, plus
//! the inverse map by session id. `bind` is an atomic test-and-set: when an
//! IMEI is already occupied the incumbent wins and the caller must close the
//! newcomer. `unbind` only evicts when the stored occupant is the session
//! that asked, so a late teardown can never remove a newer binding. No
//! operation blocks on socket I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::session::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// Another session already owns this IMEI; the caller closes itself.
    Conflict,
}

#[derive(Default)]
struct Maps {
    by_imei: HashMap<String, Arc<SessionHandle>>,
    by_id: HashMap<Uuid, Arc<SessionHandle>>,
}

pub struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Register `session` as the owner of `imei`. Fails with `Conflict` when
    /// a different live session already holds the binding.
    pub fn bind(&self, imei: &str, session: &Arc<SessionHandle>) -> BindOutcome {
        let mut maps = self.maps.lock().expect("registry mutex poisoned");
        if let Some(existing) = maps.by_imei.get(imei) {
            if existing.id != session.id {
                return BindOutcome::Conflict;
            }
        }
        maps.by_imei.insert(imei.to_string(), Arc::clone(session));
        maps.by_id.insert(session.id, Arc::clone(session));
        BindOutcome::Bound
    }

    /// Remove the binding for `imei` if and only if `session` is the current
    /// occupant. A mismatch is a no-op.
    pub fn unbind(&self, imei: &str, session: &SessionHandle) {
        let mut maps = self.maps.lock().expect("registry mutex poisoned");
        let owns = maps
            .by_imei
            .get(imei)
            .map(|s| s.id == session.id)
            .unwrap_or(false);
        if owns {
            maps.by_imei.remove(imei);
        }
        maps.by_id.remove(&session.id);
    }

    /// The dispatcher's read path.
    pub fn lookup(&self, imei: &str) -> Option<Arc<SessionHandle>> {
        self.maps
            .lock()
            .expect("registry mutex poisoned")
            .by_imei
            .get(imei)
            .cloned()
    }

    pub fn lookup_id(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        self.maps
            .lock()
            .expect("registry mutex poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    /// Number of authenticated sessions.
    pub fn len(&self) -> usize {
        self.maps.lock().expect("registry mutex poisoned").by_imei.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
