//! Storage interfaces for pipelines and jobs, plus an in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::job::PipelineJob;
use crate::pipeline::types::Pipeline;

/// Durable store for pipeline definitions.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, RepositoryError>;
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, RepositoryError>;
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<(), RepositoryError>;
    /// Returns whether a pipeline was removed.
    async fn delete_pipeline(&self, id: Uuid) -> Result<bool, RepositoryError>;
}

/// Durable store for job history.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>, RepositoryError>;
    /// Jobs for a pipeline, oldest first.
    async fn list_jobs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineJob>, RepositoryError>;
    async fn save_job(&self, job: &PipelineJob) -> Result<(), RepositoryError>;
    /// Returns how many jobs were removed.
    async fn delete_jobs(&self, pipeline_id: Uuid) -> Result<usize, RepositoryError>;
}

/// Process-local store backing both repository traits.
#[derive(Default)]
pub struct InMemoryRepository {
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
    jobs: RwLock<HashMap<Uuid, PipelineJob>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for InMemoryRepository {
    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, RepositoryError> {
        Ok(self.pipelines.read().await.get(&id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, RepositoryError> {
        let mut pipelines: Vec<Pipeline> = self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<(), RepositoryError> {
        self.pipelines
            .write()
            .await
            .insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn delete_pipeline(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.pipelines.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>, RepositoryError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineJob>, RepositoryError> {
        let mut jobs: Vec<PipelineJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    async fn save_job(&self, job: &PipelineJob) -> Result<(), RepositoryError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete_jobs(&self, pipeline_id: Uuid) -> Result<usize, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.pipeline_id != pipeline_id);
        Ok(before - jobs.len())
    }
}
