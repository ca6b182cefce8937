use crate::models::error::{BackupError, Result};
use crate::models::task::Task;
use crate::repo::sqlite::Database;
use chrono::{DateTime, Utc};
use log::debug;

fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

impl Database {
    /// Insert or replace the stored definition and status of a task.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let definition = serde_json::to_string(task).map_err(|cause| BackupError::Serialization {
            what: format!("task {}", task.id),
            cause,
        })?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO Tasks (ID, Name, Definition, Status, Last_Run, Next_Run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (ID) DO UPDATE SET
                 Name = excluded.Name,
                 Definition = excluded.Definition,
                 Status = excluded.Status,
                 Last_Run = excluded.Last_Run,
                 Next_Run = excluded.Next_Run",
            (
                &task.id,
                &task.name,
                &definition,
                task.status.as_str(),
                to_millis(task.last_run),
                to_millis(task.next_run),
            ),
        )
        .map_err(|cause| BackupError::DatabaseInsert {
            table: "Tasks".to_string(),
            key: task.id.clone(),
            cause,
        })?;
        debug!("Saved task {} ({})", task.id, task.status.as_str());
        Ok(())
    }

    pub fn load_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT ID, Definition FROM Tasks ORDER BY Name, ID")
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "load tasks".to_string(),
                cause,
            })?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "load tasks".to_string(),
                cause,
            })?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "collect task rows".to_string(),
                cause,
            })?;

        rows.into_iter()
            .map(|(id, definition)| {
                serde_json::from_str::<Task>(&definition).map_err(|cause| {
                    BackupError::Serialization {
                        what: format!("task {}", id),
                        cause,
                    }
                })
            })
            .collect()
    }

    /// Remove a task together with its snapshots. Run logs are kept.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn
            .execute("DELETE FROM Tasks WHERE ID = ?1", [task_id])
            .map_err(|cause| BackupError::DatabaseUpdate {
                table: "Tasks".to_string(),
                id: task_id.to_string(),
                cause,
            })?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::destination::Destination;
    use crate::models::task::{TaskDraft, TaskStatus};

    fn task(id: &str, name: &str) -> Task {
        TaskDraft {
            name: name.to_string(),
            sources: vec!["/data/docs".into()],
            destinations: vec![Destination::local("d1", "/mnt/backup")],
            ..TaskDraft::default()
        }
        .into_task(id.to_string())
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let db = Database::open(":memory:").unwrap();
        let t = task("t1", "Docs");
        db.save_task(&t).unwrap();

        let loaded = db.load_tasks().unwrap();
        assert_eq!(loaded, vec![t]);
    }

    #[test]
    fn test_save_task_upserts() {
        let db = Database::open(":memory:").unwrap();
        let mut t = task("t1", "Docs");
        db.save_task(&t).unwrap();

        t.status = TaskStatus::Running;
        t.last_run = Some(Utc::now());
        db.save_task(&t).unwrap();

        let loaded = db.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TaskStatus::Running);
        assert!(loaded[0].last_run.is_some());
    }

    #[test]
    fn test_load_orders_by_name() {
        let db = Database::open(":memory:").unwrap();
        db.save_task(&task("t2", "Zeta")).unwrap();
        db.save_task(&task("t1", "Alpha")).unwrap();

        let names: Vec<String> = db.load_tasks().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }

    #[test]
    fn test_delete_task() {
        let db = Database::open(":memory:").unwrap();
        db.save_task(&task("t1", "Docs")).unwrap();

        assert!(db.delete_task("t1").unwrap());
        assert!(!db.delete_task("t1").unwrap());
        assert!(db.load_tasks().unwrap().is_empty());
    }
}
