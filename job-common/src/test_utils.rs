//! In-memory implementations used by router and worker tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::job::{Job, JobStatus};
use crate::store::{JobStore, NewJob, StoreError, StoreResult};

/// A `JobStore` over a `Vec`, with the same semantics as the Postgres
/// implementation. Ids are assigned monotonically starting at 1.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    jobs: Vec<Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().expect("poisoned store").jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new: NewJob) -> StoreResult<Job> {
        let mut inner = self.inner.lock().expect("poisoned store");
        inner.next_id += 1;
        let job = Job {
            id: inner.next_id,
            name: new.name,
            status: JobStatus::Pending,
            job_type: new.job_type,
            created_at: Utc::now(),
            payload: new.payload.map(sqlx::types::Json),
            response: None,
        };
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: i64) -> StoreResult<Job> {
        let inner = self.inner.lock().expect("poisoned store");
        inner
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().expect("poisoned store");
        let mut jobs = inner.jobs.clone();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }

    async fn mark_processing(&self, id: i64) -> StoreResult<()> {
        self.update(id, |job| job.status = JobStatus::Processing)
    }

    async fn mark_completed(&self, id: i64, response: Option<String>) -> StoreResult<()> {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            if let Some(response) = response {
                job.response = Some(response);
            }
        })
    }

    async fn mark_failed(&self, id: i64) -> StoreResult<()> {
        self.update(id, |job| job.status = JobStatus::Failed)
    }

    async fn update_response(&self, id: i64, response: &str) -> StoreResult<()> {
        let response = response.to_owned();
        self.update(id, move |job| job.response = Some(response.clone()))
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned store");
        inner.jobs.retain(|j| j.id != id);
        Ok(())
    }
}

impl MemoryJobStore {
    fn update(&self, id: i64, f: impl FnOnce(&mut Job)) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned store");
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                f(job);
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }
}
