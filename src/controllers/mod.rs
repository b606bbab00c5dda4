use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::Recorder;
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{NamespaceOperatingMode, OperatorConfig};
use crate::manager::{ControllerManager, GroupStatus};
use crate::Metrics;

pub mod configmap;
pub mod factory;
pub mod job;
pub mod namespace;
pub mod pgcluster;
pub mod pgreplica;
pub mod pgtask;
pub mod pod;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub namespace_mode: NamespaceOperatingMode,
    pub groups: Vec<GroupStatus>,
}

impl Diagnostics {
    fn new(namespace_mode: NamespaceOperatingMode) -> Self {
        Self {
            last_event: Utc::now(),
            namespace_mode,
            groups: Vec::new(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    manager: Option<Arc<ControllerManager>>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(config.namespace_mode))),
            registry: prometheus::Registry::default(),
            manager: None,
        }
    }

    pub fn with_manager(mut self, manager: Arc<ControllerManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.diagnostics.read().await.clone();
        if let Some(manager) = &self.manager {
            diagnostics.groups = manager.statuses();
        }
        diagnostics
    }
}

/// Everything a reconciler needs besides its own caches
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    pub config: Arc<OperatorConfig>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, state: &State, metrics: Metrics) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "postgres-operator".into()),
            config: Arc::new(config),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }

    pub async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }
}
