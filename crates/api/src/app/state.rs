use std::sync::Arc;
use std::time::Duration;

use conreg_infra::jobs::{JobDispatcher, JobProducer};
use conreg_infra::queue::JobQueue;
use conreg_infra::repository::TicketRepository;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<JobDispatcher<Arc<dyn TicketRepository>>>,
    pub producer: Arc<JobProducer<Arc<dyn JobQueue>>>,
    /// Deadline for a synchronous job; same budget the worker gets.
    pub job_timeout: Duration,
    /// `None` rejects every internal request.
    pub internal_api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn TicketRepository>,
        queue: Arc<dyn JobQueue>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher: Arc::new(JobDispatcher::new(repository)),
            producer: Arc::new(JobProducer::new(queue)),
            job_timeout,
            internal_api_key: None,
        }
    }

    pub fn with_internal_api_key(mut self, key: Option<String>) -> Self {
        self.internal_api_key = key.filter(|k| !k.is_empty()).map(Arc::from);
        self
    }
}
