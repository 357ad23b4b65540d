use crate::types::{BatchId, BunkerId, DiplomaId, LogId, TransactionId, UploadId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    ActivatorQso,
    HunterQso,
    B2bConfirmed,
    DiplomaBonus,
    EventBonus,
    Reversal,
}

/// One signed delta per point category. The transaction total is always the
/// sum of the five fields, never stored independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsDelta {
    pub activator: i64,
    pub hunter: i64,
    pub b2b: i64,
    pub event: i64,
    pub diploma: i64,
}

impl PointsDelta {
    pub fn activator(points: i64) -> Self {
        Self {
            activator: points,
            ..Self::default()
        }
    }

    pub fn hunter(points: i64) -> Self {
        Self {
            hunter: points,
            ..Self::default()
        }
    }

    pub fn b2b(points: i64) -> Self {
        Self {
            b2b: points,
            ..Self::default()
        }
    }

    pub fn event(points: i64) -> Self {
        Self {
            event: points,
            ..Self::default()
        }
    }

    pub fn diploma(points: i64) -> Self {
        Self {
            diploma: points,
            ..Self::default()
        }
    }

    pub fn total(&self) -> i64 {
        self.activator + self.hunter + self.b2b + self.event + self.diploma
    }

    pub fn negated(&self) -> Self {
        Self {
            activator: -self.activator,
            hunter: -self.hunter,
            b2b: -self.b2b,
            event: -self.event,
            diploma: -self.diploma,
        }
    }

    pub fn add(&mut self, other: &PointsDelta) {
        self.activator += other.activator;
        self.hunter += other.hunter;
        self.b2b += other.b2b;
        self.event += other.event;
        self.diploma += other.diploma;
    }
}

/// Append-only ledger entry. Point fields, links and provenance never change
/// after creation; only the reversal bookkeeping (`is_reversed`,
/// `reversed_by`, `batch`) is written later, and only by the ledger itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: TransactionId,
    pub user: UserId,
    pub kind: TransactionKind,
    pub delta: PointsDelta,
    pub log: Option<LogId>,
    pub bunker: Option<BunkerId>,
    pub diploma: Option<DiplomaId>,
    pub batch: Option<BatchId>,
    pub reverses: Option<TransactionId>,
    pub reversed_by: Option<TransactionId>,
    pub is_reversed: bool,
    pub reason: String,
    pub notes: String,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl PointsTransaction {
    pub fn total_points(&self) -> i64 {
        self.delta.total()
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user: UserId,
    pub kind: TransactionKind,
    pub delta: PointsDelta,
    pub log: Option<LogId>,
    pub bunker: Option<BunkerId>,
    pub diploma: Option<DiplomaId>,
    pub reason: String,
    pub notes: String,
    pub created_by: Option<UserId>,
}

impl NewTransaction {
    pub fn new(
        user: UserId,
        kind: TransactionKind,
        delta: PointsDelta,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user,
            kind,
            delta,
            log: None,
            bunker: None,
            diploma: None,
            reason: reason.into(),
            notes: String::new(),
            created_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub id: BatchId,
    pub name: String,
    pub description: String,
    pub upload: Option<UploadId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub is_reversed: bool,
    pub reversed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    UnknownTransaction(TransactionId),
    AlreadyReversed(TransactionId),
    ReversalOfReversal(TransactionId),
    UnknownBatch(BatchId),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::UnknownTransaction(id) => write!(f, "unknown transaction {}", id.0),
            LedgerError::AlreadyReversed(id) => write!(f, "transaction {} already reversed", id.0),
            LedgerError::ReversalOfReversal(id) => {
                write!(f, "transaction {} is a reversal; re-award instead", id.0)
            }
            LedgerError::UnknownBatch(id) => write!(f, "unknown batch {}", id.0),
        }
    }
}

impl std::error::Error for LedgerError {}

#[derive(Debug, Default, Clone)]
pub struct Ledger {
    transactions: BTreeMap<TransactionId, PointsTransaction>,
    batches: BTreeMap<BatchId, TransactionBatch>,
    next_transaction: u64,
    next_batch: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, new: NewTransaction, now: DateTime<Utc>) -> TransactionId {
        self.next_transaction += 1;
        let id = TransactionId(self.next_transaction);
        self.transactions.insert(
            id,
            PointsTransaction {
                id,
                user: new.user,
                kind: new.kind,
                delta: new.delta,
                log: new.log,
                bunker: new.bunker,
                diploma: new.diploma,
                batch: None,
                reverses: None,
                reversed_by: None,
                is_reversed: false,
                reason: new.reason,
                notes: new.notes,
                created_by: new.created_by,
                created_at: now,
            },
        );
        id
    }

    pub fn get(&self, id: TransactionId) -> Option<&PointsTransaction> {
        self.transactions.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PointsTransaction> {
        self.transactions.values()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn for_user(&self, user: UserId) -> impl Iterator<Item = &PointsTransaction> {
        self.transactions.values().filter(move |tx| tx.user == user)
    }

    /// Sum of point deltas over the user's effective entries: reversed
    /// originals are excluded together with the reversal entries that undo
    /// them, so the result always equals what incremental folding produced.
    pub fn category_sums(&self, user: UserId) -> PointsDelta {
        let mut sums = PointsDelta::default();
        for tx in self.for_user(user) {
            if tx.is_reversed || tx.kind == TransactionKind::Reversal {
                continue;
            }
            sums.add(&tx.delta);
        }
        sums
    }

    pub fn last_transaction_for(&self, user: UserId) -> Option<TransactionId> {
        self.for_user(user).map(|tx| tx.id).max()
    }

    /// Whether hunter points were ever granted to this user for this contact.
    /// Reversed entries count: a reversed award blocks re-awarding.
    pub fn has_hunter_award(&self, user: UserId, log: LogId) -> bool {
        self.transactions.values().any(|tx| {
            tx.user == user && tx.log == Some(log) && tx.kind == TransactionKind::HunterQso
        })
    }

    pub fn find_b2b_award(&self, user: UserId, log: LogId) -> Option<TransactionId> {
        self.transactions.values().find_map(|tx| {
            (tx.user == user
                && tx.log == Some(log)
                && tx.kind == TransactionKind::B2bConfirmed
                && !tx.is_reversed)
                .then_some(tx.id)
        })
    }

    /// Appends the equal-and-opposite reversal entry and links the pair.
    /// The original is never edited beyond the reversal bookkeeping fields.
    pub fn reverse(
        &mut self,
        id: TransactionId,
        reason: impl Into<String>,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<TransactionId, LedgerError> {
        let original = self
            .transactions
            .get(&id)
            .ok_or(LedgerError::UnknownTransaction(id))?;
        if original.is_reversed {
            return Err(LedgerError::AlreadyReversed(id));
        }
        if original.kind == TransactionKind::Reversal {
            return Err(LedgerError::ReversalOfReversal(id));
        }
        let (user, delta, log, bunker, diploma) = (
            original.user,
            original.delta.negated(),
            original.log,
            original.bunker,
            original.diploma,
        );
        let reversal = self.append(
            NewTransaction {
                user,
                kind: TransactionKind::Reversal,
                delta,
                log,
                bunker,
                diploma,
                reason: reason.into(),
                notes: format!("Reverses transaction {}", id.0),
                created_by,
            },
            now,
        );
        if let Some(tx) = self.transactions.get_mut(&reversal) {
            tx.reverses = Some(id);
        }
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.is_reversed = true;
            tx.reversed_by = Some(reversal);
        }
        Ok(reversal)
    }

    pub fn create_batch(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        upload: Option<UploadId>,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> BatchId {
        self.next_batch += 1;
        let id = BatchId(self.next_batch);
        self.batches.insert(
            id,
            TransactionBatch {
                id,
                name: name.into(),
                description: description.into(),
                upload,
                created_by,
                created_at: now,
                is_reversed: false,
                reversed_at: None,
            },
        );
        id
    }

    pub fn batch(&self, id: BatchId) -> Option<&TransactionBatch> {
        self.batches.get(&id)
    }

    pub fn attach_to_batch(
        &mut self,
        tx: TransactionId,
        batch: BatchId,
    ) -> Result<(), LedgerError> {
        if !self.batches.contains_key(&batch) {
            return Err(LedgerError::UnknownBatch(batch));
        }
        let tx = self
            .transactions
            .get_mut(&tx)
            .ok_or(LedgerError::UnknownTransaction(tx))?;
        tx.batch = Some(batch);
        Ok(())
    }

    pub fn batch_members(&self, batch: BatchId) -> Vec<TransactionId> {
        self.transactions
            .values()
            .filter(|tx| tx.batch == Some(batch))
            .map(|tx| tx.id)
            .collect()
    }

    pub fn mark_batch_reversed(
        &mut self,
        id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let batch = self.batches.get_mut(&id).ok_or(LedgerError::UnknownBatch(id))?;
        batch.is_reversed = true;
        batch.reversed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn award(ledger: &mut Ledger, user: UserId, delta: PointsDelta) -> TransactionId {
        ledger.append(
            NewTransaction::new(user, TransactionKind::ActivatorQso, delta, "test award"),
            now(),
        )
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let mut ledger = Ledger::new();
        let a = award(&mut ledger, UserId(1), PointsDelta::activator(1));
        let b = award(&mut ledger, UserId(1), PointsDelta::activator(1));
        assert!(b > a);
    }

    #[test]
    fn reversal_negates_all_five_fields() {
        let mut ledger = Ledger::new();
        let delta = PointsDelta {
            activator: 2,
            hunter: 3,
            b2b: 1,
            event: 4,
            diploma: 5,
        };
        let original = award(&mut ledger, UserId(1), delta);
        let reversal = ledger.reverse(original, "undo", None, now()).unwrap();

        let rev = ledger.get(reversal).unwrap();
        assert_eq!(rev.delta, delta.negated());
        assert_eq!(rev.kind, TransactionKind::Reversal);
        assert_eq!(rev.reverses, Some(original));
        assert_eq!(rev.total_points(), -15);

        let orig = ledger.get(original).unwrap();
        assert!(orig.is_reversed);
        assert_eq!(orig.reversed_by, Some(reversal));
        assert_eq!(orig.delta, delta);
    }

    #[test]
    fn double_reversal_is_rejected() {
        let mut ledger = Ledger::new();
        let id = award(&mut ledger, UserId(1), PointsDelta::activator(1));
        ledger.reverse(id, "first", None, now()).unwrap();
        assert_eq!(
            ledger.reverse(id, "second", None, now()),
            Err(LedgerError::AlreadyReversed(id))
        );
    }

    #[test]
    fn reversal_entries_cannot_be_reversed() {
        let mut ledger = Ledger::new();
        let id = award(&mut ledger, UserId(1), PointsDelta::hunter(1));
        let rev = ledger.reverse(id, "undo", None, now()).unwrap();
        assert_eq!(
            ledger.reverse(rev, "redo", None, now()),
            Err(LedgerError::ReversalOfReversal(rev))
        );
    }

    #[test]
    fn category_sums_skip_reversed_pairs() {
        let mut ledger = Ledger::new();
        let user = UserId(7);
        award(&mut ledger, user, PointsDelta::activator(1));
        let reversed = award(&mut ledger, user, PointsDelta::activator(1));
        award(&mut ledger, user, PointsDelta::hunter(1));
        ledger.reverse(reversed, "bad log", None, now()).unwrap();

        let sums = ledger.category_sums(user);
        assert_eq!(sums.activator, 1);
        assert_eq!(sums.hunter, 1);
        assert_eq!(sums.total(), 2);
    }

    #[test]
    fn batch_links_members_without_touching_deltas() {
        let mut ledger = Ledger::new();
        let a = award(&mut ledger, UserId(1), PointsDelta::activator(1));
        let b = award(&mut ledger, UserId(2), PointsDelta::hunter(1));
        let batch = ledger.create_batch("upload 1", "two transactions", None, None, now());
        ledger.attach_to_batch(a, batch).unwrap();
        ledger.attach_to_batch(b, batch).unwrap();

        let mut members = ledger.batch_members(batch);
        members.sort();
        assert_eq!(members, vec![a, b]);
        assert_eq!(ledger.get(a).unwrap().delta, PointsDelta::activator(1));
    }

    #[test]
    fn has_hunter_award_counts_reversed_entries() {
        let mut ledger = Ledger::new();
        let user = UserId(3);
        let log = LogId(9);
        let mut new = NewTransaction::new(
            user,
            TransactionKind::HunterQso,
            PointsDelta::hunter(1),
            "hunter award",
        );
        new.log = Some(log);
        let id = ledger.append(new, now());
        ledger.reverse(id, "undo", None, now()).unwrap();
        assert!(ledger.has_hunter_award(user, log));
        assert_eq!(ledger.find_b2b_award(user, log), None);
    }
}
