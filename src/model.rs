use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Lifecycle of a pool number. Transitions:
/// `Available → Booked` (reservation, lock-guarded),
/// `Booked → Released` (validated release),
/// `Booked → Expired` (reservation window elapsed, sweep-owned).
/// Released/Expired never return to Available automatically; re-activation
/// is an administrative catalog action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberStatus {
    Available,
    Booked,
    Expired,
    Released,
}

impl NumberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberStatus::Available => "available",
            NumberStatus::Booked => "booked",
            NumberStatus::Expired => "expired",
            NumberStatus::Released => "released",
        }
    }
}

/// A bookable phone-number record. The engine owns `status`,
/// `reserved_until` and `updated_at`; the descriptive fields belong to
/// catalog management and are carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: u64,
    /// The normalized phone number string. Unique across the pool.
    pub key: String,
    pub provider_id: u32,
    pub category_id: u32,
    pub status: NumberStatus,
    /// Upper bound of the current booking's validity. Always populated
    /// when `status == Booked`.
    pub reserved_until: Option<Ms>,
    /// Soft-delete flag. An inactive number is invisible to every
    /// engine operation.
    pub active: bool,
    pub installation_fee: f64,
    pub maintenance_fee: f64,
    pub vanity_fee: f64,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// One booking/release event in a number's history. Created together with
/// the Available→Booked transition; release fields stamped on
/// Booked→Released; removed only when the owning number is retired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub requester: String,
    pub reserved_at: Ms,
    pub released_at: Option<Ms>,
    pub release_reference: String,
    pub released_by: Option<String>,
}

impl LedgerEntry {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }
}

/// Number category. Its reservation window bounds how long a booking of a
/// member number stays valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
    pub reservation_window_ms: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: u32,
    pub name: String,
}

/// A number plus its ledger, guarded by one row lock. Keeping the ledger
/// inside the row means the lock that orders status transitions also
/// orders ledger mutations.
#[derive(Debug, Clone)]
pub struct NumberRow {
    pub number: PhoneNumber,
    pub ledger: Vec<LedgerEntry>,
}

impl NumberRow {
    pub fn new(number: PhoneNumber) -> Self {
        Self {
            number,
            ledger: Vec::new(),
        }
    }

    /// Most recent open (unreleased) ledger entry.
    pub fn open_entry(&self) -> Option<&LedgerEntry> {
        self.ledger.iter().rev().find(|e| e.is_open())
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CategoryAdded {
        category: Category,
    },
    ProviderAdded {
        provider: Provider,
    },
    NumberAdded {
        number: PhoneNumber,
    },
    NumberDeactivated {
        id: u64,
        at: Ms,
    },
    NumberBooked {
        id: u64,
        entry_id: Ulid,
        requester: String,
        reserved_at: Ms,
        reserved_until: Ms,
    },
    NumberReleased {
        id: u64,
        entry_id: Ulid,
        released_at: Ms,
        reference: String,
        released_by: String,
    },
    NumberExpired {
        id: u64,
        at: Ms,
    },
    NumberRetired {
        id: u64,
    },
    /// Compaction snapshot of a historical ledger entry. Inserts the entry
    /// without touching number state.
    EntryRecorded {
        id: u64,
        entry: LedgerEntry,
    },
}

// ── Batch outcome types ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReleaseReason {
    UnknownKey,
    Inactive,
    NotBooked,
    Expired,
    NoOpenEntry,
    DuplicateInBatch,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::UnknownKey => "unknown key",
            ReleaseReason::Inactive => "inactive",
            ReleaseReason::NotBooked => "not booked",
            ReleaseReason::Expired => "reservation window elapsed",
            ReleaseReason::NoOpenEntry => "no open ledger entry",
            ReleaseReason::DuplicateInBatch => "duplicate key in batch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseFailure {
    pub key: String,
    pub reference: String,
    pub reason: ReleaseReason,
}

/// Per-pair release outcome. Failed pairs never abort the batch; the
/// succeeded ones commit together.
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<ReleaseFailure>,
}

/// Retirement outcome. A non-empty `invalid` list means nothing was
/// deleted.
#[derive(Debug, Clone, Default)]
pub struct RetireReport {
    pub retired: Vec<String>,
    pub invalid: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(id: u64, key: &str) -> PhoneNumber {
        PhoneNumber {
            id,
            key: key.into(),
            provider_id: 1,
            category_id: 1,
            status: NumberStatus::Available,
            reserved_until: None,
            active: true,
            installation_fee: 0.0,
            maintenance_fee: 0.0,
            vanity_fee: 0.0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn entry(reserved_at: Ms, released_at: Option<Ms>) -> LedgerEntry {
        LedgerEntry {
            id: Ulid::new(),
            requester: "alice".into(),
            reserved_at,
            released_at,
            release_reference: String::new(),
            released_by: None,
        }
    }

    #[test]
    fn open_entry_picks_most_recent_open() {
        let mut row = NumberRow::new(number(1, "0912000001"));
        row.ledger.push(entry(100, Some(200)));
        row.ledger.push(entry(300, None));
        row.ledger.push(entry(500, None));

        let open = row.open_entry().unwrap();
        assert_eq!(open.reserved_at, 500);
    }

    #[test]
    fn open_entry_none_when_all_closed() {
        let mut row = NumberRow::new(number(1, "0912000001"));
        row.ledger.push(entry(100, Some(200)));
        assert!(row.open_entry().is_none());
    }

    #[test]
    fn status_labels() {
        assert_eq!(NumberStatus::Available.as_str(), "available");
        assert_eq!(NumberStatus::Booked.as_str(), "booked");
        assert_eq!(NumberStatus::Expired.as_str(), "expired");
        assert_eq!(NumberStatus::Released.as_str(), "released");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::NumberBooked {
            id: 7,
            entry_id: Ulid::new(),
            requester: "alice".into(),
            reserved_at: 1_000,
            reserved_until: 260_001_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
