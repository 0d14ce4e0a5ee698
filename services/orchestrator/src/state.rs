//! Shared application state for the HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::reconciler::{JobSignal, Reconciler};
use crate::store::JobStore;

/// Cheap-to-clone handle passed to every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: Arc<JobStore>,
    reconciler: Arc<Reconciler>,
    signals: mpsc::Sender<JobSignal>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<JobStore>,
        reconciler: Arc<Reconciler>,
        signals: mpsc::Sender<JobSignal>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                reconciler,
                signals,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Sender feeding webhook signals into the reconcile loop.
    pub fn signals(&self) -> &mpsc::Sender<JobSignal> {
        &self.inner.signals
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.inner.config.webhook_secret.as_deref()
    }
}
