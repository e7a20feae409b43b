//! Audit trail of machine operations.
//!
//! SQLite connections are not `Sync`, so the database lives on its own
//! thread and is driven through a command channel.

pub mod db;

use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use shared::types::OperationRecord;
use self::db::OpLogDb;

/// Commands sent to the operation log thread
pub enum OpLogCommand {
    Record(OperationRecord, oneshot::Sender<Result<()>>),
    Recent(usize, oneshot::Sender<Result<Vec<OperationRecord>>>),
    ForVm {
        vm_name: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<OperationRecord>>>,
    },
    Shutdown,
}

/// Handle to the operation log thread
#[derive(Clone)]
pub struct OpLogHandle {
    tx: mpsc::Sender<OpLogCommand>,
}

impl OpLogHandle {
    /// Spawn the operation log thread with the given database
    pub fn spawn(db: OpLogDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<OpLogCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    OpLogCommand::Record(record, reply) => {
                        let _ = reply.send(db.insert(&record));
                    }
                    OpLogCommand::Recent(limit, reply) => {
                        let _ = reply.send(db.recent(limit));
                    }
                    OpLogCommand::ForVm { vm_name, limit, reply } => {
                        let _ = reply.send(db.for_vm(&vm_name, limit));
                    }
                    OpLogCommand::Shutdown => {
                        tracing::info!("Operation log thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn record(&self, record: OperationRecord) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OpLogCommand::Record(record, reply)).await?;
        rx.await?
    }

    /// Record without failing the caller; errors are only logged.
    pub async fn record_quietly(&self, record: OperationRecord) {
        let summary = format!("{} {} -> {}", record.operation, record.vm_name, record.status);
        if let Err(e) = self.record(record).await {
            tracing::error!("Failed to log operation {}: {}", summary, e);
        }
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OpLogCommand::Recent(limit, reply)).await?;
        rx.await?
    }

    pub async fn for_vm(&self, vm_name: String, limit: usize) -> Result<Vec<OperationRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OpLogCommand::ForVm { vm_name, limit, reply }).await?;
        rx.await?
    }

    /// Shutdown the operation log thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(OpLogCommand::Shutdown).await?;
        Ok(())
    }
}
