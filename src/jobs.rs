use crate::{
    harvest::{Harvest, HarvestReport},
    models::Platform,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Harvest runs are queued and executed one at a time so two runs never
/// share the same credentials.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
    platforms: Arc<Vec<Platform>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("no harvester is configured for {}", .0.as_str())]
    PlatformNotConfigured(Platform),
    #[error("job worker is not running")]
    QueueClosed,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    platform: Platform,
    start_category_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { report: HarvestReport },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub platform: Platform,
    pub start_category_id: Option<i64>,
    #[serde(flatten)]
    pub state: JobState,
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobInfo>>, id: Uuid, state: JobState) {
    if let Some(info) = statuses.lock().await.get_mut(&id) {
        info.state = state;
    }
}

impl JobQueue {
    pub fn spawn(
        harvesters: HashMap<Platform, Arc<dyn Harvest>>,
        cancel: CancellationToken,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();
        let mut platforms: Vec<Platform> = harvesters.keys().copied().collect();
        platforms.sort();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(harvester) = harvesters.get(&job.platform).cloned() else {
                    continue;
                };
                if cancel.is_cancelled() {
                    let error = "shutting down".to_string();
                    set_state(&statuses_bg, job.id, JobState::Failed { error }).await;
                    continue;
                }
                set_state(&statuses_bg, job.id, JobState::Running).await;
                info!(
                    target = "harvester.jobs",
                    job_id = %job.id,
                    platform = job.platform.as_str(),
                    start_category_id = ?job.start_category_id,
                    "harvest_job_started"
                );

                let report = harvester.run(job.start_category_id, cancel.child_token()).await;
                let state = job_outcome(report);
                match &state {
                    JobState::Failed { error } => {
                        warn!(target = "harvester.jobs", job_id = %job.id, error = %error, "harvest_job_failed")
                    }
                    _ => info!(target = "harvester.jobs", job_id = %job.id, "harvest_job_completed"),
                }
                set_state(&statuses_bg, job.id, state).await;
            }
        });

        (
            Self {
                tx,
                statuses,
                platforms: Arc::new(platforms),
            },
            handle,
        )
    }

    /// Platforms with a configured harvester, sorted.
    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    pub async fn enqueue_harvest(
        &self,
        platform: Platform,
        start_category_id: Option<i64>,
    ) -> Result<Uuid, JobError> {
        if !self.platforms.contains(&platform) {
            return Err(JobError::PlatformNotConfigured(platform));
        }
        let id = Uuid::new_v4();
        self.statuses.lock().await.insert(
            id,
            JobInfo {
                id: id.to_string(),
                platform,
                start_category_id,
                state: JobState::Queued,
            },
        );
        let job = Job {
            id,
            platform,
            start_category_id,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(JobError::QueueClosed);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.statuses.lock().await.get(&id).cloned()
    }
}

/// Nothing completed and something failed: the job failed. Partial
/// failures are reported inside a completed job.
fn job_outcome(report: HarvestReport) -> JobState {
    if report.completed > 0 || report.failed.is_empty() {
        return JobState::Completed { report };
    }
    let first = &report.failed[0];
    JobState::Failed {
        error: format!(
            "{} categories failed; first {}: {}",
            report.failed.len(),
            first.category_id,
            first.error
        ),
    }
}
