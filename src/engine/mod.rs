mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::archive::ArchiveSink;
use crate::config::Config;
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedNumberRow = Arc<RwLock<NumberRow>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One transaction: the events commit or vanish together.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    RecordsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches transactions for group
/// commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer its record (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
///
/// A failed group write rolls the file back to its last synced length,
/// so nothing from the failed group is ever replayed. If even the
/// rollback fails the writer is poisoned: every later append is refused
/// until a compaction rewrites the file from live state.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut poisoned = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch, &mut poisoned);
                            handle_non_append(&mut wal, other, &mut poisoned);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch, &mut poisoned);
                }
            }
            other => handle_non_append(&mut wal, other, &mut poisoned),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn poisoned_error() -> io::Error {
    io::Error::other("WAL writer poisoned by an earlier unrecoverable write failure")
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>, poisoned: &mut bool) {
    if *poisoned {
        respond_batch(batch, &Err(poisoned_error()));
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch, poisoned);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend], poisoned: &mut bool) -> io::Result<()> {
    let mut write_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(events) {
            write_err = Some(e);
            break;
        }
    }
    let write_err = match write_err {
        None => match wal.flush_sync() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        },
        Some(e) => e,
    };
    // Nothing from this group may survive on disk: every caller in it
    // is told the batch failed. If the rollback itself fails the file
    // state is unknown, so the writer stops accepting appends.
    if let Err(t) = wal.rollback_unsynced() {
        *poisoned = true;
        tracing::error!("WAL rollback failed after write error ({write_err}): {t}");
    }
    Err(write_err)
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, poisoned: &mut bool) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            // A successful compaction rewrites the whole file from live
            // state, which also recovers a poisoned writer.
            if result.is_ok() {
                *poisoned = false;
            }
            let _ = response.send(result);
        }
        WalCommand::RecordsSinceCompact { response } => {
            let _ = response.send(wal.records_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub(super) rows: Arc<DashMap<u64, SharedNumberRow>>,
    /// Reverse lookup: normalized key → number id.
    pub(super) key_index: Arc<DashMap<String, u64>>,
    pub(super) categories: Arc<DashMap<u32, Category>>,
    pub(super) providers: Arc<DashMap<u32, Provider>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notifier: Notifier,
    pub(super) archive: Arc<dyn ArchiveSink>,
    pub(super) pick_cap: usize,
}

/// Apply an event directly to a NumberRow (no locking — caller holds the lock).
fn apply_to_row(row: &mut NumberRow, event: &Event) {
    match event {
        Event::NumberBooked {
            entry_id,
            requester,
            reserved_at,
            reserved_until,
            ..
        } => {
            row.number.status = NumberStatus::Booked;
            row.number.reserved_until = Some(*reserved_until);
            row.number.updated_at = *reserved_at;
            row.ledger.push(LedgerEntry {
                id: *entry_id,
                requester: requester.clone(),
                reserved_at: *reserved_at,
                released_at: None,
                release_reference: String::new(),
                released_by: None,
            });
        }
        Event::NumberReleased {
            entry_id,
            released_at,
            reference,
            released_by,
            ..
        } => {
            row.number.status = NumberStatus::Released;
            row.number.updated_at = *released_at;
            if let Some(entry) = row.ledger.iter_mut().find(|e| e.id == *entry_id) {
                entry.released_at = Some(*released_at);
                entry.release_reference = reference.clone();
                entry.released_by = Some(released_by.clone());
            }
        }
        Event::NumberExpired { at, .. } => {
            row.number.status = NumberStatus::Expired;
            row.number.updated_at = *at;
        }
        Event::NumberDeactivated { at, .. } => {
            row.number.active = false;
            row.number.updated_at = *at;
        }
        Event::EntryRecorded { entry, .. } => {
            row.ledger.push(entry.clone());
        }
        // Catalog and row lifecycle are handled at the DashMap level, not here
        Event::CategoryAdded { .. }
        | Event::ProviderAdded { .. }
        | Event::NumberAdded { .. }
        | Event::NumberRetired { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: &Path,
        notifier: Notifier,
        archive: Arc<dyn ArchiveSink>,
        pick_cap: usize,
    ) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rows: Arc::new(DashMap::new()),
            key_index: Arc::new(DashMap::new()),
            categories: Arc::new(DashMap::new()),
            providers: Arc::new(DashMap::new()),
            wal_tx,
            notifier,
            archive,
            pick_cap,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            match event {
                Event::CategoryAdded { category } => {
                    engine.categories.insert(category.id, category.clone());
                }
                Event::ProviderAdded { provider } => {
                    engine.providers.insert(provider.id, provider.clone());
                }
                Event::NumberAdded { number } => {
                    engine.key_index.insert(number.key.clone(), number.id);
                    engine
                        .rows
                        .insert(number.id, Arc::new(RwLock::new(NumberRow::new(number.clone()))));
                }
                Event::NumberRetired { id } => {
                    if let Some((_, row)) = engine.rows.remove(id)
                        && let Ok(guard) = row.try_read()
                    {
                        engine.key_index.remove(&guard.number.key);
                    }
                }
                other => {
                    if let Some(id) = event_number_id(other)
                        && let Some(entry) = engine.rows.get(&id)
                    {
                        let row = entry.value().clone();
                        drop(entry);
                        if let Ok(mut guard) = row.try_write() {
                            apply_to_row(&mut guard, other);
                        }
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Build an engine from config: creates the data directory and opens
    /// (or replays) the WAL inside it.
    pub fn with_config(
        cfg: &Config,
        sink: Arc<dyn crate::notify::NotifySink>,
        archive: Arc<dyn ArchiveSink>,
    ) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let notifier = Notifier::new(sink, &cfg.notify);
        Ok(Arc::new(Self::new(
            &cfg.wal_path(),
            notifier,
            archive,
            cfg.pick_cap,
        )?))
    }

    /// Durably commit one transaction, then run `apply` (which owns the
    /// row guards) to bring live state in line with it — as one
    /// non-cancellable unit. The whole sequence runs in its own task and
    /// the caller awaits the JoinHandle; dropping a JoinHandle does not
    /// abort the task, so a caller abandoned mid-await (a timeout
    /// wrapper, say) can never leave a durable batch unapplied.
    pub(super) async fn commit_and_apply<T, F>(
        &self,
        events: Vec<Event>,
        apply: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            if wal_tx
                .send(WalCommand::Append {
                    events,
                    response: tx,
                })
                .await
                .is_err()
            {
                return Err(EngineError::WalError("WAL writer shut down".into()));
            }
            match rx.await {
                Ok(Ok(())) => Ok(apply()),
                Ok(Err(e)) => Err(EngineError::WalError(e.to_string())),
                Err(_) => Err(EngineError::WalError("WAL writer dropped response".into())),
            }
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    pub(super) fn row(&self, id: u64) -> Option<SharedNumberRow> {
        self.rows.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn id_for_key(&self, key: &str) -> Option<u64> {
        self.key_index.get(key).map(|e| *e.value())
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut categories: Vec<Category> =
            self.categories.iter().map(|e| e.value().clone()).collect();
        categories.sort_by_key(|c| c.id);
        for category in categories {
            events.push(Event::CategoryAdded { category });
        }

        let mut providers: Vec<Provider> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        providers.sort_by_key(|p| p.id);
        for provider in providers {
            events.push(Event::ProviderAdded { provider });
        }

        // Snapshot the Arcs first so no DashMap shard guard is held
        // across an await.
        let rows: Vec<SharedNumberRow> = self.rows.iter().map(|e| e.value().clone()).collect();
        for row in rows {
            let guard = row.read().await;
            events.push(Event::NumberAdded {
                number: guard.number.clone(),
            });
            for entry in &guard.ledger {
                events.push(Event::EntryRecorded {
                    id: guard.number.id,
                    entry: entry.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_records_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::RecordsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Extract the number id from an event (for per-row events).
fn event_number_id(event: &Event) -> Option<u64> {
    match event {
        Event::NumberDeactivated { id, .. }
        | Event::NumberBooked { id, .. }
        | Event::NumberReleased { id, .. }
        | Event::NumberExpired { id, .. }
        | Event::EntryRecorded { id, .. } => Some(*id),
        Event::CategoryAdded { .. }
        | Event::ProviderAdded { .. }
        | Event::NumberAdded { .. }
        | Event::NumberRetired { .. } => None,
    }
}
