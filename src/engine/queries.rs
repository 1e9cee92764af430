use crate::keys::{key_ordinal, normalize_key};
use crate::model::*;

use super::{Engine, SharedNumberRow};

impl Engine {
    /// Numbers currently bookable. Advisory count: rows locked by an
    /// in-flight operation are skipped.
    pub fn available_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|entry| {
                entry.value().try_read().is_ok_and(|g| {
                    g.number.active && g.number.status == NumberStatus::Available
                })
            })
            .count()
    }

    /// Page through available numbers in key order, optionally filtered
    /// by provider and category.
    pub async fn list_available(
        &self,
        provider_id: Option<u32>,
        category_id: Option<u32>,
        limit: usize,
        offset: usize,
    ) -> Vec<PhoneNumber> {
        // Snapshot the Arcs first so no DashMap shard guard is held
        // across an await.
        let rows: Vec<SharedNumberRow> = self.rows.iter().map(|e| e.value().clone()).collect();

        let mut matched = Vec::new();
        for row in rows {
            let guard = row.read().await;
            let n = &guard.number;
            if n.active
                && n.status == NumberStatus::Available
                && provider_id.is_none_or(|p| n.provider_id == p)
                && category_id.is_none_or(|c| n.category_id == c)
            {
                matched.push(n.clone());
            }
        }
        matched.sort_by_cached_key(|n| key_ordinal(&n.key));
        matched.into_iter().skip(offset).take(limit).collect()
    }

    /// Current state of one number, by key.
    pub async fn number(&self, raw_key: &str) -> Option<PhoneNumber> {
        let key = normalize_key(raw_key);
        let id = self.id_for_key(&key)?;
        let row = self.row(id)?;
        let guard = row.read().await;
        Some(guard.number.clone())
    }

    /// Full booking history of one number, oldest first.
    pub async fn ledger(&self, raw_key: &str) -> Option<Vec<LedgerEntry>> {
        let key = normalize_key(raw_key);
        let id = self.id_for_key(&key)?;
        let row = self.row(id)?;
        let guard = row.read().await;
        Some(guard.ledger.clone())
    }

    pub fn category(&self, id: u32) -> Option<Category> {
        self.categories.get(&id).map(|e| e.value().clone())
    }

    pub fn provider(&self, id: u32) -> Option<Provider> {
        self.providers.get(&id).map(|e| e.value().clone())
    }
}
