use orchestrate_engine::WorkflowEngine;
use orchestrate_identity::TrustStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub trust: Arc<TrustStore>,
}

impl AppState {
    pub fn new(engine: WorkflowEngine, trust: Arc<TrustStore>) -> Self {
        Self { engine, trust }
    }
}
