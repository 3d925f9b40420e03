use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::target::Network;
use crate::traffic::TrafficCounters;

/// Global counter for generating unique stream keys
static STREAM_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a local stream, used to key its session
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StreamKey(u64);

impl StreamKey {
    /// Allocate a key no other live stream holds
    pub fn next() -> Self {
        Self(STREAM_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observability record for one relayed flow
#[derive(Debug)]
pub struct Session {
    pub process_name: String,
    pub network: Network,
    pub client_addr: String,
    pub target_addr: String,
    pub started_at: SystemTime,
    counters: TrafficCounters,
}

impl Session {
    /// Create a session with zeroed counters, started now
    pub fn new(
        process_name: impl Into<String>,
        network: Network,
        client_addr: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            network,
            client_addr: client_addr.into(),
            target_addr: target_addr.into(),
            started_at: SystemTime::now(),
            counters: TrafficCounters::default(),
        }
    }

    pub fn add_upload(&self, n: u64) {
        self.counters.add_tx(n);
    }

    pub fn add_download(&self, n: u64) {
        self.counters.add_rx(n);
    }

    pub fn upload_bytes(&self) -> u64 {
        self.counters.tx()
    }

    pub fn download_bytes(&self) -> u64 {
        self.counters.rx()
    }

    /// Get the age of this session
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

/// Registry of live sessions keyed by local stream
pub trait SessionStater: Send + Sync {
    fn add_session(&self, key: StreamKey, session: Arc<Session>);
    fn remove_session(&self, key: StreamKey);
}

/// In-memory session registry
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<StreamKey, Arc<Session>>>,
}

/// Aggregate counters over all live sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTotals {
    pub sessions: usize,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: StreamKey) -> Option<Arc<Session>> {
        self.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sessions ordered by key
    pub fn snapshot(&self) -> Vec<(StreamKey, Arc<Session>)> {
        let mut sessions: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, session)| (*key, Arc::clone(session)))
            .collect();
        sessions.sort_by_key(|(key, _)| *key);
        sessions
    }

    pub fn totals(&self) -> SessionTotals {
        let sessions = self.lock();
        sessions.values().fold(
            SessionTotals {
                sessions: sessions.len(),
                ..SessionTotals::default()
            },
            |mut totals, session| {
                totals.upload_bytes += session.upload_bytes();
                totals.download_bytes += session.download_bytes();
                totals
            },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStater for SessionTable {
    fn add_session(&self, key: StreamKey, session: Arc<Session>) {
        self.lock().insert(key, session);
    }

    fn remove_session(&self, key: StreamKey) {
        self.lock().remove(&key);
    }
}
