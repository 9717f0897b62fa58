//! Process-wide application context.
//!
//! The monitor, the trace sink, and the active-client registry are naturally
//! process singletons, but Rust has no implicit-singleton idiom worth
//! imitating, so every one of those is instead carried explicitly as a field
//! on [`AppContext`] and threaded through the runtime rather than accessed
//! through a `static`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use llmonpy_providers::LlmClient;
use llmonpy_ratellmiter::RateLimiterMonitor;

use crate::recorder::{NullTraceSink, TraceSink};
use crate::template::TemplateEngine;

/// Default size of the shared step worker pool.
pub const DEFAULT_STEP_POOL_SIZE: usize = 100;

/// Registry of active LLM clients, keyed by the name a `ModelInfo` refers to.
///
/// A client that failed to start (missing API key) is simply absent here,
/// never inserted in the first place rather than filtered out after the fact.
/// Backed by `DashMap` rather than a locked `HashMap`, matching the teacher's
/// own provider registry (`llm-orchestrator-core::executor::providers`) —
/// reads happen from every step-pool worker concurrently.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<dyn LlmClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(name).map(|entry| entry.clone())
    }

    pub fn active_client_names(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Shared process state: the step worker pool, the rate-limiter monitor, the
/// trace sink, the active-client registry, and the prompt template engine.
///
/// Cheap to clone (every field is already `Arc`-backed or a plain value type);
/// callers typically build one `AppContext` at process start and clone it into
/// whatever spawns steps.
#[derive(Clone)]
pub struct AppContext {
    pub step_pool: Arc<Semaphore>,
    pub rate_limiter_monitor: Arc<RateLimiterMonitor>,
    pub trace_sink: Arc<dyn TraceSink>,
    pub clients: Arc<ClientRegistry>,
    pub templates: Arc<TemplateEngine>,
}

impl AppContext {
    pub fn new(clients: ClientRegistry, trace_sink: Arc<dyn TraceSink>) -> Self {
        Self {
            step_pool: Arc::new(Semaphore::new(DEFAULT_STEP_POOL_SIZE)),
            rate_limiter_monitor: RateLimiterMonitor::new(),
            trace_sink,
            clients: Arc::new(clients),
            templates: Arc::new(TemplateEngine::new()),
        }
    }

    pub fn with_step_pool_size(mut self, size: usize) -> Self {
        self.step_pool = Arc::new(Semaphore::new(size));
        self
    }

    /// Swaps in a monitor built ahead of time, e.g. one that provider clients
    /// already registered their limiters with before the context existed.
    pub fn with_monitor(mut self, monitor: Arc<RateLimiterMonitor>) -> Self {
        self.rate_limiter_monitor = monitor;
        self
    }

    /// A context with no persistence and no clients, useful for unit tests
    /// that exercise the runtime/tournament logic against mocked steps.
    pub fn for_tests() -> Self {
        Self::new(ClientRegistry::new(), Arc::new(NullTraceSink))
    }
}
