use crate::models::error::{BackupError, Result};
use crate::models::run_record::{LogFilter, RunRecord};
use crate::repo::sqlite::Database;
use log::debug;

impl Database {
    /// Append a run record. Records are never updated afterwards.
    pub fn insert_run_record(&self, record: &RunRecord) -> Result<()> {
        let body = serde_json::to_string(record).map_err(|cause| BackupError::Serialization {
            what: format!("run record {}", record.id),
            cause,
        })?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO Run_Logs (ID, Task_ID, Task_Name, Timestamp, Status, Record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &record.id,
                &record.task_id,
                &record.task_name,
                record.timestamp.timestamp_millis(),
                record.status.as_str(),
                &body,
            ),
        )
        .map_err(|cause| BackupError::DatabaseInsert {
            table: "Run_Logs".to_string(),
            key: record.id.clone(),
            cause,
        })?;

        Ok(())
    }

    /// Query run records with optional filtering, newest first
    pub fn query_run_records(&self, filter: &LogFilter) -> Result<Vec<RunRecord>> {
        let conn = self.connection()?;

        // Build dynamic SQL query
        let mut query = String::from("SELECT ID, Record FROM Run_Logs WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(task_id) = &filter.task_id {
            query.push_str(" AND Task_ID = ?");
            params.push(Box::new(task_id.clone()));
        }

        if let Some(since) = filter.since {
            query.push_str(" AND Timestamp >= ?");
            params.push(Box::new(since.timestamp_millis()));
        }

        if let Some(until) = filter.until {
            query.push_str(" AND Timestamp <= ?");
            params.push(Box::new(until.timestamp_millis()));
        }

        if let Some(status) = filter.status {
            query.push_str(" AND Status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }

        query.push_str(" ORDER BY Timestamp DESC, rowid DESC");

        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Box::new(limit as i64));
        }

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&query)
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "query run logs".to_string(),
                cause,
            })?;

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "query run logs".to_string(),
                cause,
            })?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "collect run log rows".to_string(),
                cause,
            })?;

        rows.into_iter()
            .map(|(id, body)| {
                serde_json::from_str::<RunRecord>(&body).map_err(|cause| {
                    BackupError::Serialization {
                        what: format!("run record {}", id),
                        cause,
                    }
                })
            })
            .collect()
    }

    /// Delete all run records
    pub fn delete_all_run_records(&self) -> Result<usize> {
        let conn = self.connection()?;

        let deleted =
            conn.execute("DELETE FROM Run_Logs", [])
                .map_err(|cause| BackupError::DatabaseQuery {
                    operation: "delete run logs".to_string(),
                    cause,
                })?;

        debug!("Deleted {} run records", deleted);
        Ok(deleted)
    }
}
