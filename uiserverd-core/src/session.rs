//! Per-session state shared across connections.
//!
//! Connections attach to a numeric session id via the SESSION command.
//! Data parked under a session (the title, a prepared email controller)
//! outlives a single connection so a follow-up connection can pick it
//! up. A collector task erases data that no connection has referenced
//! for two sweep intervals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::controller::SignEncryptEmailController;

pub struct SessionData {
    title: Mutex<Option<String>>,
    email_controller: Mutex<Option<Arc<SignEncryptEmailController>>>,
}

impl SessionData {
    fn new() -> Arc<SessionData> {
        Arc::new(SessionData {
            title: Mutex::new(None),
            email_controller: Mutex::new(None),
        })
    }

    pub fn title(&self) -> Option<String> {
        self.title.lock().unwrap().clone()
    }

    pub fn set_title(&self, title: Option<String>) {
        *self.title.lock().unwrap() = title;
    }

    /// Parks a prepared controller for a later command in the same
    /// session. Replaces any previous one.
    pub fn set_email_controller(&self, controller: Arc<SignEncryptEmailController>) {
        *self.email_controller.lock().unwrap() = Some(controller);
    }

    pub fn email_controller(&self) -> Option<Arc<SignEncryptEmailController>> {
        self.email_controller.lock().unwrap().clone()
    }

    pub fn take_email_controller(&self) -> Option<Arc<SignEncryptEmailController>> {
        self.email_controller.lock().unwrap().take()
    }
}

struct SessionEntry {
    data: Arc<SessionData>,
    ref_count: u32,
    ripe: bool,
}

struct HandlerState {
    sessions: HashMap<u32, SessionEntry>,
    collector: Option<JoinHandle<()>>,
}

pub struct SessionDataHandler {
    interval: Duration,
    state: Mutex<HandlerState>,
}

impl SessionDataHandler {
    pub fn new(config: &SessionConfig) -> Arc<SessionDataHandler> {
        Self::with_interval(Duration::from_secs(config.gc_interval_secs))
    }

    fn with_interval(interval: Duration) -> Arc<SessionDataHandler> {
        Arc::new(SessionDataHandler {
            interval,
            state: Mutex::new(HandlerState {
                sessions: HashMap::new(),
                collector: None,
            }),
        })
    }

    /// A connection attached to `id`. Keeps the session's data alive
    /// for as long as at least one connection holds it.
    pub fn enter_session(self: &Arc<Self>, id: u32) {
        let mut state = self.state.lock().unwrap();
        let entry = state.sessions.entry(id).or_insert_with(|| SessionEntry {
            data: SessionData::new(),
            ref_count: 0,
            ripe: false,
        });
        entry.ref_count += 1;
        entry.ripe = false;
        trace!("session {id}: entered, {} reference(s)", entry.ref_count);
    }

    /// A connection detached from `id`. Once the last reference is
    /// gone the collector gives the data two sweep intervals before
    /// erasing it.
    pub fn exit_session(self: &Arc<Self>, id: u32) {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.sessions.get_mut(&id) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        trace!("session {id}: exited, {} reference(s)", entry.ref_count);
        if entry.ref_count == 0 {
            entry.ripe = false;
            self.ensure_collector(&mut state);
        }
    }

    pub fn session_data(self: &Arc<Self>, id: u32) -> Arc<SessionData> {
        let mut state = self.state.lock().unwrap();
        let entry = state.sessions.entry(id).or_insert_with(|| SessionEntry {
            data: SessionData::new(),
            ref_count: 0,
            ripe: false,
        });
        Arc::clone(&entry.data)
    }

    fn ensure_collector(self: &Arc<Self>, state: &mut HandlerState) {
        let running = state
            .collector
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        state.collector = Some(tokio::spawn(async move {
            collector_loop(weak, interval).await;
        }));
    }

    /// One sweep. Unreferenced sessions are first marked ripe, then
    /// erased on the following sweep. Returns whether any candidates
    /// remain.
    fn collect(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|id, entry| {
                let erase = entry.ref_count == 0 && entry.ripe;
                if erase {
                    debug!("session {id}: collected");
                }
                !erase
            });
        for entry in state.sessions.values_mut() {
            if entry.ref_count == 0 {
                entry.ripe = true;
            }
        }
        let remaining = state.sessions.values().any(|e| e.ref_count == 0);
        trace!(
            "session sweep: {} erased, {} left",
            before - state.sessions.len(),
            state.sessions.len()
        );
        remaining
    }
}

async fn collector_loop(handler: Weak<SessionDataHandler>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(handler) = handler.upgrade() else {
            return;
        };
        if !handler.collect() {
            return;
        }
    }
}
