use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use shared::types::OperationRecord;
use chrono::Utc;

const SELECT_COLUMNS: &str =
    "SELECT timestamp, vm_name, vanity_name, operation, client_ip, zone, status FROM operations";

pub struct OpLogDb {
    conn: Connection,
}

impl OpLogDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                vm_name     TEXT NOT NULL,
                vanity_name TEXT NOT NULL,
                operation   TEXT NOT NULL,
                client_ip   TEXT NOT NULL,
                zone        TEXT NOT NULL,
                status      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_vm ON operations(vm_name);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    pub fn insert(&self, record: &OperationRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO operations (
                    timestamp, vm_name, vanity_name, operation, client_ip, zone, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.timestamp.to_rfc3339(),
                    &record.vm_name,
                    &record.vanity_name,
                    &record.operation,
                    &record.client_ip,
                    &record.zone,
                    &record.status,
                ],
            )
            .context("Failed to insert operation")?;
        Ok(())
    }

    /// Most recent operations first
    pub fn recent(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map(params![limit as i64], Self::row_to_record)
            .context("Failed to query operations")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect operations")?;

        Ok(records)
    }

    /// Most recent operations on one machine first
    pub fn for_vm(&self, vm_name: &str, limit: usize) -> Result<Vec<OperationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE vm_name = ?1 ORDER BY id DESC LIMIT ?2"))
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map(params![vm_name, limit as i64], Self::row_to_record)
            .context("Failed to query operations by VM")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect operations")?;

        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<OperationRecord, rusqlite::Error> {
        let timestamp_str: String = row.get(0)?;
        let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(OperationRecord {
            timestamp,
            vm_name: row.get(1)?,
            vanity_name: row.get(2)?,
            operation: row.get(3)?,
            client_ip: row.get(4)?,
            zone: row.get(5)?,
            status: row.get(6)?,
        })
    }
}
