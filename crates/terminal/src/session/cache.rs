// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry of authorized sessions, keyed by tag UID.
//!
//! Entries expire lazily: a lookup that finds an expired entry evicts it and
//! reports a miss. There is no sweep; revocation takes effect when the next
//! tap re-probes the cloud.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use ntag424::Uid;

use super::token::TokenSession;

struct Entry {
    session: Arc<TokenSession>,
    expires_at: Option<Instant>,
}

/// UID → owned session. Short critical sections only.
#[derive(Default)]
pub struct SessionCache {
    inner: Mutex<HashMap<Uid, Entry>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) the session for `uid`, replacing any prior
    /// entry. Returns the shared handle observers may keep.
    pub fn register(&self, uid: Uid, session: TokenSession, now: Instant) -> Arc<TokenSession> {
        let expires_at = session.expires_in_secs.map(|secs| now + Duration::from_secs(secs));
        let session = Arc::new(session);
        let mut inner = self.inner.lock();
        debug!(%uid, session_id = %session.session_id, "session registered");
        inner.insert(uid, Entry { session: Arc::clone(&session), expires_at });
        session
    }

    /// Look up the live session for `uid`, evicting it if expired.
    pub fn get(&self, uid: Uid, now: Instant) -> Option<Arc<TokenSession>> {
        let mut inner = self.inner.lock();
        match inner.get(&uid) {
            Some(entry) if entry.expires_at.is_none_or(|at| now < at) => {
                Some(Arc::clone(&entry.session))
            }
            Some(_) => {
                debug!(%uid, "expired session evicted");
                inner.remove(&uid);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: Uid = Uid([1, 2, 3, 4, 5, 6, 7]);

    fn session(id: &str, expires_in_secs: Option<u64>) -> TokenSession {
        TokenSession {
            session_id: id.into(),
            user_id: "u-1".into(),
            display_name: "Kim".into(),
            permissions: ["p_lathe".to_string()].into_iter().collect(),
            expires_in_secs,
        }
    }

    #[test]
    fn register_then_get() {
        let cache = SessionCache::new();
        let now = Instant::now();
        let handle = cache.register(UID, session("s-1", None), now);
        let got = cache.get(UID, now).unwrap();
        assert!(Arc::ptr_eq(&handle, &got));
    }

    #[test]
    fn reregistration_replaces() {
        let cache = SessionCache::new();
        let now = Instant::now();
        cache.register(UID, session("s-1", None), now);
        cache.register(UID, session("s-2", None), now);
        assert_eq!(cache.get(UID, now).unwrap().session_id, "s-2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup() {
        let cache = SessionCache::new();
        let now = Instant::now();
        cache.register(UID, session("s-1", Some(60)), now);

        assert!(cache.get(UID, now + Duration::from_secs(59)).is_some());
        assert!(cache.get(UID, now + Duration::from_secs(61)).is_none());
        // Evicted, not merely hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_uid_misses() {
        let cache = SessionCache::new();
        assert!(cache.get(UID, Instant::now()).is_none());
    }
}
