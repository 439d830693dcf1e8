use crate::task_store::COUNTER_TABLE;
use anyhow::Result;
use chrono::Utc;
use marshal_core::project::{NewProject, Project, ProjectId, ProjectStatus};
use redb::{Database, ReadableTable, TableDefinition};

/// Projects table: i64 project ID -> JSON-serialized Project.
pub const PROJECTS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("projects");

const NEXT_ID_KEY: &str = "next_project_id";

pub struct ProjectStore<'a> {
    db: &'a Database,
}

impl<'a> ProjectStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, new: NewProject) -> Result<Project> {
        let write_txn = self.db.begin_write()?;
        let project = {
            let mut counter = write_txn.open_table(COUNTER_TABLE)?;
            let next_id = counter.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
            counter.insert(NEXT_ID_KEY, next_id + 1)?;

            let project = Project {
                id: ProjectId(next_id),
                name: new.name,
                shared_branch: new.shared_branch,
                base_branch: new.base_branch,
                status: ProjectStatus::Active,
                created_at: Utc::now(),
            };
            let json = serde_json::to_string(&project)?;
            let mut projects = write_txn.open_table(PROJECTS_TABLE)?;
            projects.insert(next_id, json.as_str())?;
            project
        };
        write_txn.commit()?;
        Ok(project)
    }

    pub fn get(&self, id: ProjectId) -> Result<Option<Project>> {
        let read_txn = self.db.begin_read()?;
        let projects = read_txn.open_table(PROJECTS_TABLE)?;
        match projects.get(id.0)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<Project>> {
        let read_txn = self.db.begin_read()?;
        let projects = read_txn.open_table(PROJECTS_TABLE)?;
        let mut result = Vec::new();
        for entry in projects.iter()? {
            let (_, value) = entry?;
            result.push(serde_json::from_str(value.value())?);
        }
        Ok(result)
    }
}
