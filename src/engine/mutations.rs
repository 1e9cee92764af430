use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::archive::ArchiveRecord;
use crate::auth::Identity;
use crate::keys::{is_valid_key, key_ordinal, normalize_key};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;

use super::{Engine, EngineError, apply_to_row, event_number_id};

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn add_category(
        &self,
        id: u32,
        name: String,
        reservation_window_ms: Ms,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("category name too long"));
        }
        if self.categories.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("category {id}")));
        }
        let category = Category {
            id,
            name,
            reservation_window_ms,
        };
        let event = Event::CategoryAdded {
            category: category.clone(),
        };
        let categories = self.categories.clone();
        self.commit_and_apply(vec![event], move || {
            categories.insert(id, category);
        })
        .await
    }

    pub async fn add_provider(&self, id: u32, name: String) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("provider name too long"));
        }
        if self.providers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("provider {id}")));
        }
        let provider = Provider { id, name };
        let event = Event::ProviderAdded {
            provider: provider.clone(),
        };
        let providers = self.providers.clone();
        self.commit_and_apply(vec![event], move || {
            providers.insert(id, provider);
        })
        .await
    }

    /// Register a number in the pool. The raw key is normalized before
    /// validation; returns the normalized key.
    pub async fn add_number(
        &self,
        id: u64,
        raw_key: &str,
        provider_id: u32,
        category_id: u32,
        installation_fee: f64,
        maintenance_fee: f64,
        vanity_fee: f64,
    ) -> Result<String, EngineError> {
        if !self.categories.contains_key(&category_id) {
            return Err(EngineError::UnknownCategory(category_id));
        }
        if !self.providers.contains_key(&provider_id) {
            return Err(EngineError::UnknownProvider(provider_id));
        }
        if self.rows.len() >= MAX_NUMBERS {
            return Err(EngineError::LimitExceeded("pool full"));
        }

        let key = normalize_key(raw_key);
        if key.len() > MAX_KEY_LEN || !is_valid_key(&key) {
            return Err(EngineError::InvalidKey(raw_key.to_string()));
        }
        if self.key_index.contains_key(&key) {
            return Err(EngineError::AlreadyExists(key));
        }
        if self.rows.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("number id {id}")));
        }

        let now = now_ms();
        let number = PhoneNumber {
            id,
            key: key.clone(),
            provider_id,
            category_id,
            status: NumberStatus::Available,
            reserved_until: None,
            active: true,
            installation_fee,
            maintenance_fee,
            vanity_fee,
            created_at: now,
            updated_at: now,
        };
        let event = Event::NumberAdded {
            number: number.clone(),
        };
        let rows = self.rows.clone();
        let key_index = self.key_index.clone();
        let index_key = key.clone();
        self.commit_and_apply(vec![event], move || {
            key_index.insert(index_key, id);
            rows.insert(id, Arc::new(RwLock::new(NumberRow::new(number))));
        })
        .await?;
        Ok(key)
    }

    /// Soft-delete: the number keeps its row and ledger but becomes
    /// invisible to every operation.
    pub async fn deactivate_number(&self, raw_key: &str) -> Result<(), EngineError> {
        let key = normalize_key(raw_key);
        let id = self
            .id_for_key(&key)
            .ok_or_else(|| EngineError::UnknownKey(key.clone()))?;
        let row = self
            .row(id)
            .ok_or_else(|| EngineError::UnknownKey(key.clone()))?;
        let guard = row.write_owned().await;
        if !guard.number.active {
            return Ok(());
        }
        let event = Event::NumberDeactivated { id, at: now_ms() };
        let apply_event = event.clone();
        self.commit_and_apply(vec![event], move || {
            let mut guard = guard;
            apply_to_row(&mut guard, &apply_event);
        })
        .await
    }

    // ── Reservation ──────────────────────────────────────────

    /// Acquire write locks on the given rows in sorted-id order to
    /// prevent deadlocks. Returns guards in that order.
    async fn lock_rows(
        &self,
        ids: &[u64],
    ) -> Result<Vec<OwnedRwLockWriteGuard<NumberRow>>, EngineError> {
        let mut sorted: Vec<u64> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let row = self.row(id).ok_or(EngineError::ResourceUnavailable(id))?;
            guards.push(row.write_owned().await);
        }
        Ok(guards)
    }

    /// Atomically book a specific set of numbers for `requester`.
    /// All-or-nothing: if any number is not bookable, none are booked.
    pub async fn reserve_by_ids(
        &self,
        ids: &[u64],
        requester: &Identity,
    ) -> Result<Vec<String>, EngineError> {
        let start = Instant::now();
        let result = self.reserve_by_ids_inner(ids, requester).await;
        observability::record_op("reserve_by_ids", &result, start);
        result
    }

    async fn reserve_by_ids_inner(
        &self,
        ids: &[u64],
        requester: &Identity,
    ) -> Result<Vec<String>, EngineError> {
        if ids.is_empty() {
            return Err(EngineError::LimitExceeded("empty batch"));
        }
        if ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        if requester.id.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("requester name too long"));
        }

        let guards = self.lock_rows(ids).await?;

        // Phase 1: validate everything under the locks.
        for guard in &guards {
            if !guard.number.active || guard.number.status != NumberStatus::Available {
                return Err(EngineError::ResourceUnavailable(guard.number.id));
            }
        }

        // Phase 2: all bookable — commit one transaction.
        let now = now_ms();
        let mut events = Vec::with_capacity(guards.len());
        for guard in &guards {
            let window = self
                .categories
                .get(&guard.number.category_id)
                .map(|c| c.reservation_window_ms)
                .ok_or(EngineError::UnknownCategory(guard.number.category_id))?;
            events.push(Event::NumberBooked {
                id: guard.number.id,
                entry_id: Ulid::new(),
                requester: requester.id.clone(),
                reserved_at: now,
                reserved_until: now + window,
            });
        }
        let keys: Vec<String> = guards.iter().map(|g| g.number.key.clone()).collect();
        let apply_events = events.clone();
        self.commit_and_apply(events, move || {
            let mut guards = guards;
            for (guard, event) in guards.iter_mut().zip(&apply_events) {
                apply_to_row(guard, event);
            }
        })
        .await?;

        metrics::counter!(observability::NUMBERS_BOOKED_TOTAL).increment(keys.len() as u64);
        self.notifier
            .announce(Notice::booked(&requester.id, &keys))
            .await;
        Ok(keys)
    }

    /// Book up to `quantity` available numbers from a category/provider,
    /// preferring the numerically lowest keys. May return fewer than
    /// requested; returns the booked keys in key order.
    pub async fn reserve_random(
        &self,
        category_id: u32,
        provider_id: u32,
        quantity: usize,
        requester: &Identity,
    ) -> Result<Vec<String>, EngineError> {
        let start = Instant::now();
        let result = self
            .reserve_random_inner(category_id, provider_id, quantity, requester)
            .await;
        observability::record_op("reserve_random", &result, start);
        result
    }

    async fn reserve_random_inner(
        &self,
        category_id: u32,
        provider_id: u32,
        quantity: usize,
        requester: &Identity,
    ) -> Result<Vec<String>, EngineError> {
        if !self.categories.contains_key(&category_id) {
            return Err(EngineError::UnknownCategory(category_id));
        }
        if !self.providers.contains_key(&provider_id) {
            return Err(EngineError::UnknownProvider(provider_id));
        }
        if requester.id.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("requester name too long"));
        }
        let want = quantity.min(self.pick_cap);
        if want == 0 {
            return Ok(Vec::new());
        }

        // Advisory snapshot: try_read skips rows busy in another
        // operation, every candidate is re-verified under its write lock.
        let mut candidates: Vec<(u128, u64)> = Vec::new();
        for entry in self.rows.iter() {
            if let Ok(guard) = entry.value().try_read()
                && guard.number.active
                && guard.number.status == NumberStatus::Available
                && guard.number.category_id == category_id
                && guard.number.provider_id == provider_id
            {
                candidates.push((key_ordinal(&guard.number.key), guard.number.id));
            }
        }
        candidates.sort_unstable();
        candidates.truncate(want);

        let mut ids: Vec<u64> = candidates.iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();

        // Lock in sorted-id order; candidates gone stale since the
        // snapshot are dropped rather than failing the pick.
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = self.row(id) else { continue };
            let guard = row.write_owned().await;
            if guard.number.active
                && guard.number.status == NumberStatus::Available
                && guard.number.category_id == category_id
                && guard.number.provider_id == provider_id
            {
                guards.push(guard);
            }
        }
        if guards.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let window = self
            .categories
            .get(&category_id)
            .map(|c| c.reservation_window_ms)
            .ok_or(EngineError::UnknownCategory(category_id))?;
        let events: Vec<Event> = guards
            .iter()
            .map(|guard| Event::NumberBooked {
                id: guard.number.id,
                entry_id: Ulid::new(),
                requester: requester.id.clone(),
                reserved_at: now,
                reserved_until: now + window,
            })
            .collect();
        let mut keys: Vec<String> = guards.iter().map(|g| g.number.key.clone()).collect();
        let apply_events = events.clone();
        self.commit_and_apply(events, move || {
            let mut guards = guards;
            for (guard, event) in guards.iter_mut().zip(&apply_events) {
                apply_to_row(guard, event);
            }
        })
        .await?;
        keys.sort_by_key(|k| key_ordinal(k));

        metrics::counter!(observability::NUMBERS_BOOKED_TOTAL).increment(keys.len() as u64);
        self.notifier
            .announce(Notice::booked(&requester.id, &keys))
            .await;
        Ok(keys)
    }

    // ── Release ──────────────────────────────────────────────

    /// Release booked numbers. Each pair is `(key, release reference)`.
    /// Per-pair validation: invalid pairs are reported, valid ones
    /// commit together. Requires elevated privilege.
    pub async fn release(
        &self,
        pairs: &[(String, String)],
        releaser: &Identity,
    ) -> Result<ReleaseReport, EngineError> {
        let start = Instant::now();
        let result = self.release_inner(pairs, releaser).await;
        observability::record_op("release", &result, start);
        result
    }

    async fn release_inner(
        &self,
        pairs: &[(String, String)],
        releaser: &Identity,
    ) -> Result<ReleaseReport, EngineError> {
        releaser.ensure_elevated()?;
        if releaser.id.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("releaser name too long"));
        }
        if pairs.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (_, reference) in pairs {
            if reference.len() > MAX_REFERENCE_LEN {
                return Err(EngineError::LimitExceeded("release reference too long"));
            }
        }

        let mut report = ReleaseReport::default();

        // Resolve keys up front; unknown keys fail their pair without
        // touching the rest of the batch.
        let mut resolved: Vec<(String, String, Option<u64>)> = Vec::with_capacity(pairs.len());
        let mut ids: Vec<u64> = Vec::new();
        for (raw_key, reference) in pairs {
            let key = normalize_key(raw_key);
            let id = self.id_for_key(&key);
            if let Some(id) = id {
                ids.push(id);
            }
            resolved.push((key, reference.clone(), id));
        }
        ids.sort_unstable();
        ids.dedup();

        // Lock known rows in sorted-id order. A row retired since the
        // index lookup counts as unknown.
        let mut guards: HashMap<u64, OwnedRwLockWriteGuard<NumberRow>> = HashMap::new();
        for id in ids {
            if let Some(row) = self.row(id) {
                guards.insert(id, row.write_owned().await);
            }
        }

        let now = now_ms();
        let mut events = Vec::new();
        let mut released_in_batch: HashSet<u64> = HashSet::new();

        for (key, reference, id) in resolved {
            let fail = |reason| ReleaseFailure {
                key: key.clone(),
                reference: reference.clone(),
                reason,
            };
            let Some(id) = id else {
                report.failed.push(fail(ReleaseReason::UnknownKey));
                continue;
            };
            let Some(guard) = guards.get(&id) else {
                report.failed.push(fail(ReleaseReason::UnknownKey));
                continue;
            };
            if released_in_batch.contains(&id) {
                report.failed.push(fail(ReleaseReason::DuplicateInBatch));
                continue;
            }
            if !guard.number.active {
                report.failed.push(fail(ReleaseReason::Inactive));
                continue;
            }
            if guard.number.status != NumberStatus::Booked {
                report.failed.push(fail(ReleaseReason::NotBooked));
                continue;
            }
            if !matches!(guard.number.reserved_until, Some(t) if t > now) {
                report.failed.push(fail(ReleaseReason::Expired));
                continue;
            }
            let Some(open) = guard.open_entry() else {
                report.failed.push(fail(ReleaseReason::NoOpenEntry));
                continue;
            };
            events.push(Event::NumberReleased {
                id,
                entry_id: open.id,
                released_at: now,
                reference,
                released_by: releaser.id.clone(),
            });
            released_in_batch.insert(id);
            report.succeeded.push(key);
        }

        if events.is_empty() {
            drop(guards);
        } else {
            let apply_events = events.clone();
            self.commit_and_apply(events, move || {
                let mut guards = guards;
                for event in &apply_events {
                    if let Some(id) = event_number_id(event)
                        && let Some(guard) = guards.get_mut(&id)
                    {
                        apply_to_row(guard, event);
                    }
                }
            })
            .await?;
            metrics::counter!(observability::NUMBERS_RELEASED_TOTAL)
                .increment(report.succeeded.len() as u64);
        }

        if !report.failed.is_empty() {
            self.notifier
                .announce(Notice::release_failures(&report.failed))
                .await;
        }
        Ok(report)
    }

    // ── Retirement ───────────────────────────────────────────

    /// Permanently remove numbers and archive their ledgers.
    /// All-or-nothing: if any key is invalid, unknown, or repeated,
    /// nothing is deleted and the offenders are reported. Requires
    /// elevated privilege.
    pub async fn retire(
        &self,
        raw_keys: &[String],
        releaser: &Identity,
    ) -> Result<RetireReport, EngineError> {
        let start = Instant::now();
        let result = self.retire_inner(raw_keys, releaser).await;
        observability::record_op("retire", &result, start);
        result
    }

    async fn retire_inner(
        &self,
        raw_keys: &[String],
        releaser: &Identity,
    ) -> Result<RetireReport, EngineError> {
        releaser.ensure_elevated()?;
        if releaser.id.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("releaser name too long"));
        }
        if raw_keys.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut report = RetireReport::default();
        let mut targets: Vec<(String, u64)> = Vec::with_capacity(raw_keys.len());
        let mut seen: HashSet<u64> = HashSet::new();

        for raw in raw_keys {
            let key = normalize_key(raw);
            if !is_valid_key(&key) {
                report.invalid.push(raw.clone());
                continue;
            }
            match self.id_for_key(&key) {
                Some(id) if seen.insert(id) => targets.push((key, id)),
                _ => report.invalid.push(raw.clone()),
            }
        }
        if !report.invalid.is_empty() {
            return Ok(report);
        }

        targets.sort_by_key(|(_, id)| *id);
        let mut guards = Vec::with_capacity(targets.len());
        for (key, id) in &targets {
            let Some(row) = self.row(*id) else {
                report.invalid.push(key.clone());
                continue;
            };
            let guard = row.write_owned().await;
            if !guard.number.active {
                report.invalid.push(key.clone());
                continue;
            }
            guards.push(guard);
        }
        if !report.invalid.is_empty() {
            return Ok(report);
        }

        let now = now_ms();
        let mut events = Vec::with_capacity(guards.len());
        let mut records = Vec::new();
        for guard in &guards {
            let n = &guard.number;
            let category_name = self
                .categories
                .get(&n.category_id)
                .map_or_else(|| "unknown".to_string(), |c| c.name.clone());
            let provider_name = self
                .providers
                .get(&n.provider_id)
                .map_or_else(|| "unknown".to_string(), |p| p.name.clone());
            for entry in &guard.ledger {
                records.push(ArchiveRecord {
                    key: n.key.clone(),
                    category_name: category_name.clone(),
                    provider_name: provider_name.clone(),
                    reserved_at: entry.reserved_at,
                    released_at: entry.released_at,
                    number_created_at: n.created_at,
                    booked_by: entry.requester.clone(),
                    released_by: entry.released_by.clone(),
                    installation_fee: n.installation_fee,
                    maintenance_fee: n.maintenance_fee,
                    vanity_fee: n.vanity_fee,
                    archived_at: now,
                });
            }
            events.push(Event::NumberRetired { id: n.id });
        }

        let rows = self.rows.clone();
        let key_index = self.key_index.clone();
        let archive = self.archive.clone();
        report.retired = self
            .commit_and_apply(events, move || {
                let mut retired = Vec::with_capacity(guards.len());
                for mut guard in guards {
                    // Tombstone before unlocking: a task that cloned the
                    // Arc before removal sees a dead row, not a
                    // resurrected one.
                    guard.number.active = false;
                    let id = guard.number.id;
                    let key = guard.number.key.clone();
                    key_index.remove(&key);
                    drop(guard);
                    rows.remove(&id);
                    retired.push(key);
                }
                // The retirement is already durable; a failed archive
                // write is reported, not unwound. Runs in its own task
                // so it is ordered after the removal but still outlives
                // the caller.
                if !records.is_empty() {
                    tokio::spawn(async move {
                        if let Err(e) = archive.store(records).await {
                            tracing::error!("archive write failed after retirement: {e}");
                            metrics::counter!(observability::ARCHIVE_FAILURES_TOTAL).increment(1);
                        }
                    });
                }
                retired
            })
            .await?;
        metrics::counter!(observability::NUMBERS_RETIRED_TOTAL)
            .increment(report.retired.len() as u64);
        Ok(report)
    }

    // ── Expiry sweep ─────────────────────────────────────────

    /// Advisory scan for bookings whose window has elapsed. try_read
    /// skips rows busy in another operation; they'll be caught by the
    /// next sweep.
    pub fn collect_overdue(&self, now: Ms) -> Vec<u64> {
        let mut overdue = Vec::new();
        for entry in self.rows.iter() {
            if let Ok(guard) = entry.value().try_read()
                && guard.number.active
                && guard.number.status == NumberStatus::Booked
                && matches!(guard.number.reserved_until, Some(t) if t <= now)
            {
                overdue.push(guard.number.id);
            }
        }
        overdue
    }

    /// Transition overdue bookings to Expired. Each row is re-verified
    /// under its write lock before the transition commits.
    pub async fn expire_overdue(&self, now: Ms) -> Result<usize, EngineError> {
        let mut expired = 0usize;
        for id in self.collect_overdue(now) {
            let Some(row) = self.row(id) else { continue };
            let guard = row.write_owned().await;
            if !guard.number.active
                || guard.number.status != NumberStatus::Booked
                || !matches!(guard.number.reserved_until, Some(t) if t <= now)
            {
                continue;
            }
            let event = Event::NumberExpired { id, at: now };
            let apply_event = event.clone();
            self.commit_and_apply(vec![event], move || {
                let mut guard = guard;
                apply_to_row(&mut guard, &apply_event);
            })
            .await?;
            expired += 1;
        }
        if expired > 0 {
            metrics::counter!(observability::NUMBERS_EXPIRED_TOTAL).increment(expired as u64);
        }
        Ok(expired)
    }
}
