//! Component health registry.
//!
//! One registry is created at startup and shared by handle; the daemon's
//! supervisors write it, `/health` and the state file read it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            status: "starting",
            updated_at: Utc::now(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    started_at: DateTime<Utc>,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started_at: Utc::now(),
                components: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn mark_component_ok(&self, component: &str) {
        self.update(component, |entry| {
            let now = Utc::now();
            entry.status = "ok";
            entry.updated_at = now;
            entry.last_ok = Some(now);
            entry.last_error = None;
        });
    }

    pub fn mark_component_error(&self, component: &str, error: impl ToString) {
        self.update(component, |entry| {
            entry.status = "error";
            entry.updated_at = Utc::now();
            entry.last_error = Some(error.to_string());
        });
    }

    pub fn bump_component_restart(&self, component: &str) {
        self.update(component, |entry| {
            entry.updated_at = Utc::now();
            entry.restart_count = entry.restart_count.saturating_add(1);
        });
    }

    pub fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.inner.components.lock().get(component).cloned()
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let components = self.inner.components.lock().clone();
        let uptime_seconds = (Utc::now() - self.inner.started_at).num_seconds().max(0);
        serde_json::json!({
            "pid": std::process::id(),
            "started_at": self.inner.started_at.to_rfc3339(),
            "uptime_seconds": uptime_seconds,
            "components": components,
        })
    }

    fn update(&self, component: &str, apply: impl FnOnce(&mut ComponentHealth)) {
        let mut components = self.inner.components.lock();
        let entry = components
            .entry(component.to_string())
            .or_insert_with(ComponentHealth::new);
        apply(entry);
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
