//! Operational notices. Booking and release outcomes are rendered to
//! text and handed to a pluggable sink; delivery is best-effort with
//! bounded retries, and a failed delivery never fails the operation
//! that produced it.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::NotifyConfig;
use crate::model::ReleaseFailure;
use crate::observability;

/// A fixed-width text table for multi-row notices.
#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub title: String,
    pub fields: Vec<(&'static str, String)>,
    pub table: Option<Table>,
}

impl Notice {
    pub fn booked(requester: &str, keys: &[String]) -> Self {
        Self {
            title: "numbers booked".into(),
            fields: vec![
                ("requester", requester.to_string()),
                ("count", keys.len().to_string()),
                ("numbers", keys.join(", ")),
            ],
            table: None,
        }
    }

    pub fn release_failures(failures: &[ReleaseFailure]) -> Self {
        Self {
            title: "release failures".into(),
            fields: vec![("count", failures.len().to_string())],
            table: Some(Table {
                headers: vec!["number", "reference", "reason"],
                rows: failures
                    .iter()
                    .map(|f| {
                        vec![
                            f.key.clone(),
                            f.reference.clone(),
                            f.reason.as_str().to_string(),
                        ]
                    })
                    .collect(),
            }),
        }
    }

    /// Render to plain text: title, `key: value` lines, then the table
    /// with columns padded to their widest cell.
    pub fn render(&self) -> String {
        let mut out = format!("[{}]", self.title);
        for (name, value) in &self.fields {
            out.push('\n');
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
        }
        if let Some(table) = &self.table {
            out.push('\n');
            out.push_str(&render_table(table));
        }
        out
    }
}

fn render_table(table: &Table) -> String {
    let mut widths: Vec<usize> = table.headers.iter().map(|h| h.len()).collect();
    for row in &table.rows {
        for (i, cell) in row.iter().enumerate() {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let render_row = |cells: &[String]| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c:<width$}", width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
    };

    let headers: Vec<String> = table.headers.iter().map(|h| h.to_string()).collect();
    let mut out = render_row(&headers);
    out.push('\n');
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));
    for row in &table.rows {
        out.push('\n');
        out.push_str(render_row(row).trim_end());
    }
    out
}

/// Where rendered notices go. Implementations must be cheap to share.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn deliver(&self, channel: &str, text: &str) -> io::Result<()>;
}

/// Delivers notices to a sink with bounded retries and a fixed delay
/// between attempts.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotifySink>,
    channel: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotifySink>, cfg: &NotifyConfig) -> Self {
        Self {
            sink,
            channel: cfg.channel.clone(),
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay,
        }
    }

    /// Deliver a notice, retrying on failure. Gives up after
    /// `max_retries` attempts; never returns an error.
    pub async fn announce(&self, notice: Notice) {
        let text = notice.render();
        for attempt in 1..=self.max_retries.max(1) {
            match self.sink.deliver(&self.channel, &text).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "notice delivery failed (attempt {attempt}/{}): {e}",
                        self.max_retries
                    );
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        metrics::counter!(observability::NOTIFY_FAILURES_TOTAL).increment(1);
    }
}

/// Sink that writes notices to the log. The production default.
pub struct LogSink;

#[async_trait]
impl NotifySink for LogSink {
    async fn deliver(&self, channel: &str, text: &str) -> io::Result<()> {
        tracing::info!("notice [{channel}]\n{text}");
        Ok(())
    }
}

/// In-memory sink for tests: records every delivery.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NotifySink for MemorySink {
    async fn deliver(&self, channel: &str, text: &str) -> io::Result<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

impl MemorySink {
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<(String, String)> {
        std::mem::take(&mut self.delivered.lock().unwrap())
    }
}
