use std::sync::Arc;

use crate::config::Config;
use crate::grading::{GradingPipeline, JudgmentBackend, LlmJudge, SandboxExecutor};
use crate::services::session_engine::SessionEngine;
use crate::storage::SnapshotStore;

pub mod seat_registry;
pub mod session_engine;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: SessionEngine,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SnapshotStore>) -> Self {
        let executor = Arc::new(SandboxExecutor::new(
            config.sandbox_url.clone(),
            config.sandbox_api_key.clone(),
        ));
        let judge: Option<Arc<dyn JudgmentBackend>> = match LlmJudge::from_config(&config) {
            Some(judge) => Some(Arc::new(judge)),
            None => {
                tracing::warn!("no judgment backend configured, grading uses heuristics only");
                None
            }
        };
        let pipeline = Arc::new(GradingPipeline::new(executor, judge));
        let engine = SessionEngine::new(&config, store, pipeline);

        Self {
            config: Arc::new(config),
            engine,
        }
    }
}
