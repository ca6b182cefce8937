use crate::models::error::{BackupError, Result};
use crate::models::snapshot::{Snapshot, SnapshotEntry, SnapshotKind};
use crate::models::task::BackupType;
use crate::repo::sqlite::Database;
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{OptionalExtension, Transaction};

fn query_err(operation: &str) -> impl FnOnce(rusqlite::Error) -> BackupError + '_ {
    move |cause| BackupError::DatabaseQuery {
        operation: operation.to_string(),
        cause,
    }
}

impl Database {
    pub fn load_snapshot(&self, task_id: &str, kind: SnapshotKind) -> Result<Option<Snapshot>> {
        let conn = self.connection()?;

        let header: Option<(i64, i64, String)> = conn
            .query_row(
                "SELECT ID, Created_At, Backup_Type FROM Snapshots WHERE Task_ID = ?1 AND Kind = ?2",
                (task_id, kind.as_str()),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(query_err("load snapshot"))?;

        let Some((snapshot_id, created_at, backup_type)) = header else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT Relative_Path, File_Size, Modified_Ns, Hash
                 FROM Snapshot_Entries WHERE Snapshot_ID = ?1",
            )
            .map_err(query_err("load snapshot entries"))?;
        let entries = stmt
            .query_map([snapshot_id], |row| {
                Ok(SnapshotEntry {
                    relative_path: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                    modified_ns: row.get(2)?,
                    hash: row.get(3)?,
                })
            })
            .map_err(query_err("load snapshot entries"))?
            .collect::<rusqlite::Result<Vec<SnapshotEntry>>>()
            .map_err(query_err("collect snapshot entries"))?;

        let mut snapshot = Snapshot::from_entries(
            BackupType::parse(&backup_type).unwrap_or(BackupType::Full),
            entries,
        );
        snapshot.taken_at = DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default();
        Ok(Some(snapshot))
    }

    /// Replace the `latest` snapshot and, when given, the `anchor` snapshot
    /// of a task in one transaction. Readers see either the old or the new
    /// pair, never a mix.
    pub fn save_snapshots(
        &self,
        task_id: &str,
        latest: &Snapshot,
        anchor: Option<&Snapshot>,
    ) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(query_err("begin snapshot save"))?;

        write_snapshot(&tx, task_id, SnapshotKind::Latest, latest)?;
        if let Some(anchor) = anchor {
            write_snapshot(&tx, task_id, SnapshotKind::Anchor, anchor)?;
        }

        tx.commit().map_err(query_err("commit snapshot save"))?;
        debug!(
            "Saved snapshot for task {} ({} entries{})",
            task_id,
            latest.len(),
            if anchor.is_some() { ", anchor replaced" } else { "" }
        );
        Ok(())
    }
}

fn write_snapshot(
    tx: &Transaction<'_>,
    task_id: &str,
    kind: SnapshotKind,
    snapshot: &Snapshot,
) -> Result<()> {
    tx.execute(
        "DELETE FROM Snapshots WHERE Task_ID = ?1 AND Kind = ?2",
        (task_id, kind.as_str()),
    )
    .map_err(|cause| BackupError::DatabaseUpdate {
        table: "Snapshots".to_string(),
        id: task_id.to_string(),
        cause,
    })?;

    let snapshot_id: i64 = tx
        .query_row(
            "INSERT INTO Snapshots (Task_ID, Kind, Created_At, Backup_Type)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING ID",
            (
                task_id,
                kind.as_str(),
                snapshot.taken_at.timestamp_millis(),
                snapshot.origin.as_str(),
            ),
            |row| row.get(0),
        )
        .map_err(|cause| BackupError::DatabaseInsert {
            table: "Snapshots".to_string(),
            key: format!("{}/{}", task_id, kind.as_str()),
            cause,
        })?;

    let mut stmt = tx
        .prepare(
            "INSERT INTO Snapshot_Entries (Snapshot_ID, Relative_Path, File_Size, Modified_Ns, Hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(query_err("prepare snapshot entry insert"))?;

    for entry in snapshot.entries.values() {
        stmt.execute((
            snapshot_id,
            &entry.relative_path,
            entry.size as i64,
            entry.modified_ns,
            &entry.hash,
        ))
        .map_err(|cause| BackupError::DatabaseInsert {
            table: "Snapshot_Entries".to_string(),
            key: entry.relative_path.clone(),
            cause,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::destination::Destination;
    use crate::models::task::TaskDraft;

    fn setup() -> Database {
        let db = Database::open(":memory:").unwrap();
        let task = TaskDraft {
            name: "Docs".to_string(),
            sources: vec!["/data/docs".into()],
            destinations: vec![Destination::local("d1", "/mnt/backup")],
            ..TaskDraft::default()
        }
        .into_task("t1".to_string());
        db.save_task(&task).unwrap();
        db
    }

    fn entry(path: &str, hash: &str) -> SnapshotEntry {
        SnapshotEntry {
            relative_path: path.to_string(),
            size: 42,
            modified_ns: 1_700_000_000_123_456_789,
            hash: hash.to_string(),
        }
    }

    #[test]
    fn test_missing_snapshot_loads_as_none() {
        let db = setup();
        assert!(db.load_snapshot("t1", SnapshotKind::Latest).unwrap().is_none());
    }

    #[test]
    fn test_save_latest_and_anchor() {
        let db = setup();
        let full = Snapshot::from_entries(BackupType::Full, vec![entry("docs/a.txt", "h1")]);
        db.save_snapshots("t1", &full, Some(&full)).unwrap();

        let latest = db.load_snapshot("t1", SnapshotKind::Latest).unwrap().unwrap();
        let anchor = db.load_snapshot("t1", SnapshotKind::Anchor).unwrap().unwrap();
        assert_eq!(latest.entries, full.entries);
        assert_eq!(anchor.origin, BackupType::Full);
        assert_eq!(
            latest.get("docs/a.txt").unwrap().modified_ns,
            1_700_000_000_123_456_789
        );
    }

    #[test]
    fn test_incremental_save_keeps_anchor() {
        let db = setup();
        let full = Snapshot::from_entries(BackupType::Full, vec![entry("docs/a.txt", "h1")]);
        db.save_snapshots("t1", &full, Some(&full)).unwrap();

        let incremental = Snapshot::from_entries(
            BackupType::Incremental,
            vec![entry("docs/a.txt", "h2"), entry("docs/b.txt", "h3")],
        );
        db.save_snapshots("t1", &incremental, None).unwrap();

        let latest = db.load_snapshot("t1", SnapshotKind::Latest).unwrap().unwrap();
        let anchor = db.load_snapshot("t1", SnapshotKind::Anchor).unwrap().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest.origin, BackupType::Incremental);
        assert_eq!(anchor.get("docs/a.txt").unwrap().hash, "h1");
        assert_eq!(anchor.len(), 1);
    }

    #[test]
    fn test_deleting_task_cascades_snapshots() {
        let db = setup();
        let full = Snapshot::from_entries(BackupType::Full, vec![entry("docs/a.txt", "h1")]);
        db.save_snapshots("t1", &full, Some(&full)).unwrap();

        db.delete_task("t1").unwrap();
        assert!(db.load_snapshot("t1", SnapshotKind::Latest).unwrap().is_none());
        let orphans: i64 = db
            .connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM Snapshot_Entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
