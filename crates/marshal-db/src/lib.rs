pub mod project_store;
pub mod task_store;

use anyhow::Result;
use async_trait::async_trait;
use marshal_core::error::StoreError;
use marshal_core::project::{NewProject, Project, ProjectId};
use marshal_core::store::{ClaimRequest, Mutation, NewTask, TaskFilter, TaskPatch};
use marshal_core::task::{Task, TaskId};
use project_store::ProjectStore;
use redb::Database;
use std::path::Path;
use std::sync::Arc;
use task_store::TaskStore;

/// Open (or create) the marshal database at the given path.
pub fn open_db(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)?;
    // Ensure all tables exist by doing a write transaction
    let write_txn = db.begin_write()?;
    {
        let _tasks = write_txn.open_table(task_store::TASKS_TABLE)?;
        let _counter = write_txn.open_table(task_store::COUNTER_TABLE)?;
        let _projects = write_txn.open_table(project_store::PROJECTS_TABLE)?;
    }
    write_txn.commit()?;
    Ok(db)
}

/// Shared handle implementing the async store contract over redb.
///
/// redb serializes writers internally, so one `Arc<Database>` can back any
/// number of concurrent callers.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(open_db(path)?)))
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    fn tasks(&self) -> TaskStore<'_> {
        TaskStore::new(&self.db)
    }

    fn projects(&self) -> ProjectStore<'_> {
        ProjectStore::new(&self.db)
    }
}

/// Recover a typed store error carried through `anyhow`.
fn store_err(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(typed) => typed,
        Err(other) => StoreError::Backend(other),
    }
}

#[async_trait]
impl marshal_core::store::TaskStore for RedbStore {
    async fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        self.tasks().insert(new).map_err(store_err)
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.tasks()
            .get(id)
            .map_err(store_err)?
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.tasks().list(filter).map_err(store_err)
    }

    async fn claim(&self, req: &ClaimRequest) -> Result<Option<Task>, StoreError> {
        self.tasks().claim(req).map_err(store_err)
    }

    async fn submit(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.tasks()
            .mutate(id, expected_version, Mutation::Submit, patch)
            .map_err(store_err)
    }

    async fn accept(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.tasks()
            .mutate(id, expected_version, Mutation::Accept, patch)
            .map_err(store_err)
    }

    async fn reject(
        &self,
        id: TaskId,
        expected_version: u64,
        feedback: String,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.tasks()
            .mutate(id, expected_version, Mutation::Reject { feedback }, patch)
            .map_err(store_err)
    }

    async fn update(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        self.tasks()
            .mutate(id, expected_version, Mutation::Update, patch)
            .map_err(store_err)
    }

    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError> {
        self.projects().insert(new).map_err(store_err)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project, StoreError> {
        self.projects()
            .get(id)
            .map_err(store_err)?
            .ok_or(StoreError::ProjectNotFound(id))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.projects().list().map_err(store_err)
    }
}
