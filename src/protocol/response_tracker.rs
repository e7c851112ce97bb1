use crate::core::transport::SessionKey;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identifies an asynchronous call: command ids are only unique per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCallKey {
    pub session: SessionKey,
    pub command_id: i64,
}

impl PendingCallKey {
    pub fn new(session: SessionKey, command_id: i64) -> Self {
        Self { session, command_id }
    }
}

/// Tracking record for a handler call that has not replied yet
#[derive(Debug)]
pub struct PendingCall {
    pub method: String,
    pub started: Instant,
    waiter: Option<JoinHandle<()>>,
}

impl PendingCall {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Configuration for the response tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Limit per session
    pub max_pending_calls: usize,
    pub reply_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_pending_calls: 1000,
            reply_timeout: Duration::from_secs(30),
        }
    }
}

/// Response tracker error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResponseTrackerError {
    #[error("Command id {command_id} is already pending")]
    DuplicateCommandId { command_id: i64 },

    #[error("Too many pending calls: maximum {max} calls per client allowed")]
    PendingCallsLimit { max: usize },
}

/// Owns every in-flight asynchronous call, keyed by transport, client and command id
#[derive(Debug)]
pub struct ResponseTracker {
    pending: Mutex<HashMap<PendingCallKey, PendingCall>>,
    config: TrackerConfig,
}

impl ResponseTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking a call
    pub fn track_call(&self, key: PendingCallKey, method: &str) -> Result<(), ResponseTrackerError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(ResponseTrackerError::DuplicateCommandId { command_id: key.command_id });
        }
        let in_session = pending.keys().filter(|k| k.session == key.session).count();
        if in_session >= self.config.max_pending_calls {
            return Err(ResponseTrackerError::PendingCallsLimit { max: self.config.max_pending_calls });
        }
        pending.insert(
            key,
            PendingCall {
                method: method.to_string(),
                started: Instant::now(),
                waiter: None,
            },
        );
        Ok(())
    }

    /// Associate the task waiting for the reply so it can be aborted on disconnect
    pub fn attach_waiter(&self, key: &PendingCallKey, waiter: JoinHandle<()>) {
        if let Some(call) = self.pending.lock().get_mut(key) {
            call.waiter = Some(waiter);
        }
    }

    /// Remove a call once its reply (or timeout) is ready to send.
    /// `None` means the session went away and nothing must be sent.
    pub fn complete_call(&self, key: &PendingCallKey) -> Option<PendingCall> {
        self.pending.lock().remove(key)
    }

    pub fn is_pending(&self, key: &PendingCallKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Drop every call of a session, aborting their waiters
    pub fn release_session(&self, session: &SessionKey) -> usize {
        let released: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingCallKey> = pending.keys().filter(|k| k.session == *session).copied().collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        for call in &released {
            debug!("Releasing pending call {} for disconnected client {}", call.method, session.client_id);
            if let Some(waiter) = &call.waiter {
                waiter.abort();
            }
        }
        released.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn shutdown(&self) {
        for (_, call) in self.pending.lock().drain() {
            if let Some(waiter) = call.waiter {
                waiter.abort();
            }
        }
    }
}
