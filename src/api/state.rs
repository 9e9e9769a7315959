use std::sync::Arc;

use crate::runner::RunOrchestrator;
use crate::scheduler::JobScheduler;
use crate::storage::Persistence;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Persistence>,
    pub scheduler: Arc<JobScheduler>,
    pub orchestrator: Arc<RunOrchestrator>,
}
