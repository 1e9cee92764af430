//! Retirement archive. When a number is retired its ledger is flattened
//! into self-contained records (names and fees inlined, no foreign ids)
//! and handed to a sink before the live rows disappear.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Ms;

/// One archived booking. Denormalized so it stays readable after the
/// catalog rows it came from are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub key: String,
    pub category_name: String,
    pub provider_name: String,
    pub reserved_at: Ms,
    pub released_at: Option<Ms>,
    pub number_created_at: Ms,
    pub booked_by: String,
    pub released_by: Option<String>,
    pub installation_fee: f64,
    pub maintenance_fee: f64,
    pub vanity_fee: f64,
    pub archived_at: Ms,
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn store(&self, records: Vec<ArchiveRecord>) -> io::Result<()>;
}

/// Appends records as JSON lines to a file. The production default.
pub struct JsonlArchive {
    path: PathBuf,
}

impl JsonlArchive {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ArchiveSink for JsonlArchive {
    async fn store(&self, records: Vec<ArchiveRecord>) -> io::Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let mut buf = Vec::new();
            for record in &records {
                serde_json::to_writer(&mut buf, record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                buf.push(b'\n');
            }
            file.write_all(&buf)?;
            file.sync_all()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryArchive {
    records: Mutex<Vec<ArchiveRecord>>,
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn store(&self, records: Vec<ArchiveRecord>) -> io::Result<()> {
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

impl MemoryArchive {
    pub fn snapshot(&self) -> Vec<ArchiveRecord> {
        self.records.lock().unwrap().clone()
    }
}
