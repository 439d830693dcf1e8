//! [`TaskStore`] over the marshal HTTP API.
//!
//! Lets several schedulers share one store served by `marshal serve`.

use anyhow::Context;
use async_trait::async_trait;
use marshal_core::error::StoreError;
use marshal_core::project::{NewProject, Project, ProjectId};
use marshal_core::store::{ClaimRequest, NewTask, TaskFilter, TaskPatch, TaskStore};
use marshal_core::task::{Task, TaskId};
use marshal_core::wire::{API_PREFIX, ErrorBody, MutationBody, RejectBody};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub struct HttpTaskStore {
    client: Client,
    base_url: String,
}

impl HttpTaskStore {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req
            .send()
            .await
            .context(format!("task store at {} unreachable", self.base_url))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text)
            .unwrap_or_else(|_| ErrorBody::new("backend", format!("HTTP {status}: {text}")));
        tracing::debug!(status = %status, kind = %body.kind, "task store refused request");
        Err(body.into_store_error())
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, StoreError> {
        let resp = self.send(req).await?;
        let value = resp
            .json::<T>()
            .await
            .context("malformed task store response")?;
        Ok(value)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, StoreError> {
        self.json(self.client.post(self.url(path)).json(body)).await
    }

    async fn mutate(
        &self,
        id: TaskId,
        op: &str,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.post(
            &format!("/tasks/{}/{op}", id.0),
            &MutationBody {
                expected_version,
                patch,
            },
        )
        .await
    }
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        self.post("/tasks", &new).await
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.json(self.client.get(self.url(&format!("/tasks/{}", id.0))))
            .await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.post("/tasks/search", filter).await
    }

    async fn claim(&self, req: &ClaimRequest) -> Result<Option<Task>, StoreError> {
        let resp = self
            .send(self.client.post(self.url("/tasks/claim")).json(req))
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let task = resp
            .json::<Task>()
            .await
            .context("malformed claim response")?;
        Ok(Some(task))
    }

    async fn submit(&self, id: TaskId, expected_version: u64, patch: TaskPatch) -> Result<Task, StoreError> {
        self.mutate(id, "submit", expected_version, patch).await
    }

    async fn accept(&self, id: TaskId, expected_version: u64, patch: TaskPatch) -> Result<Task, StoreError> {
        self.mutate(id, "accept", expected_version, patch).await
    }

    async fn reject(
        &self,
        id: TaskId,
        expected_version: u64,
        feedback: String,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.post(
            &format!("/tasks/{}/reject", id.0),
            &RejectBody {
                expected_version,
                feedback,
                patch,
            },
        )
        .await
    }

    async fn update(&self, id: TaskId, expected_version: u64, patch: TaskPatch) -> Result<Task, StoreError> {
        self.mutate(id, "update", expected_version, patch).await
    }

    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError> {
        self.post("/projects", &new).await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project, StoreError> {
        self.json(self.client.get(self.url(&format!("/projects/{}", id.0))))
            .await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.json(self.client.get(self.url("/projects"))).await
    }
}
