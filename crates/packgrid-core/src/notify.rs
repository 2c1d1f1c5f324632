//! Operator notification hub.
//!
//! Components post severity-tagged messages here. The hub mirrors each one
//! to `tracing`, keeps the most recent ones for late observers, and fans
//! them out over a broadcast channel. Posting never fails.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::types::epoch_millis;

/// How many notifications are retained for `recent()`.
pub const HISTORY_LEN: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

/// Which part of the system raised a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Database,
    Engine,
    Scheduler,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Database => "database",
            Component::Engine => "engine",
            Component::Scheduler => "scheduler",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub timestamp: u64,
    pub component: Component,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

struct HubInner {
    history: Mutex<VecDeque<Notification>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<Notification>,
}

/// Cheaply cloneable handle to the shared hub.
#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HISTORY_LEN);
        Self {
            inner: Arc::new(HubInner {
                history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
                next_id: AtomicU64::new(1),
                tx,
            }),
        }
    }

    pub fn post(
        &self,
        component: Component,
        severity: Severity,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let message = message.into();
        match severity {
            Severity::Critical | Severity::Error => {
                error!(%component, ?severity, ?details, "{message}")
            }
            Severity::Warning => warn!(%component, ?details, "{message}"),
        }

        let notification = Notification {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: epoch_millis(),
            component,
            severity,
            message,
            debug: details,
        };

        {
            let mut history = self.inner.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }

        // No subscribers is fine.
        let _ = self.inner.tx.send(notification);
    }

    pub fn critical(&self, component: Component, message: impl Into<String>) {
        self.post(component, Severity::Critical, message, None);
    }

    pub fn error(&self, component: Component, message: impl Into<String>) {
        self.post(component, Severity::Error, message, None);
    }

    pub fn warning(&self, component: Component, message: impl Into<String>) {
        self.post(component, Severity::Warning, message, None);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<Notification> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let hub = NotificationHub::new();
        for i in 0..(HISTORY_LEN + 5) {
            hub.warning(Component::Engine, format!("msg {i}"));
        }
        let recent = hub.recent();
        assert_eq!(recent.len(), HISTORY_LEN);
        assert_eq!(recent[0].message, "msg 5");
        assert_eq!(recent.last().unwrap().message, format!("msg {}", HISTORY_LEN + 4));
    }

    #[tokio::test]
    async fn subscribers_receive_posts() {
        let hub = NotificationHub::new();
        let mut rx = hub.subscribe();
        hub.post(
            Component::Database,
            Severity::Critical,
            "corrupt item",
            Some(serde_json::json!({"file": "x.json"})),
        );
        let got = rx.recv().await.unwrap();
        assert_eq!(got.severity, Severity::Critical);
        assert_eq!(got.component, Component::Database);
        assert_eq!(got.debug.unwrap()["file"], "x.json");
    }

    #[test]
    fn warnings_keep_their_details() {
        let hub = NotificationHub::new();
        hub.post(
            Component::Engine,
            Severity::Warning,
            "unregistered container",
            Some(serde_json::json!({"name": "PG_1_web_0_1_e1_1"})),
        );
        let recent = hub.recent();
        assert_eq!(recent[0].severity, Severity::Warning);
        assert_eq!(recent[0].debug.as_ref().unwrap()["name"], "PG_1_web_0_1_e1_1");
    }
}
