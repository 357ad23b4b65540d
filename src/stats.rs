use crate::ledger::PointsDelta;
use crate::types::{TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user denormalized totals. The ledger is the source of truth for the
/// point fields; the QSO/bunker counters are recountable from the contact
/// log. `reconcile` must always reproduce what incremental folding built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub user: UserId,
    pub activator_points: i64,
    pub hunter_points: i64,
    pub b2b_points: i64,
    pub event_points: i64,
    pub diploma_points: i64,
    pub total_points: i64,
    pub total_activator_qso: u32,
    pub unique_bunkers_activated: u32,
    pub total_hunter_qso: u32,
    pub unique_bunkers_hunted: u32,
    pub activator_b2b_qso: u32,
    pub confirmed_b2b_qso: u32,
    pub last_transaction: Option<TransactionId>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters recomputed from the contact log, independently of the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactTallies {
    pub activator_qso: u32,
    pub unique_bunkers_activated: u32,
    pub hunter_qso: u32,
    pub unique_bunkers_hunted: u32,
    pub activator_b2b_qso: u32,
    pub confirmed_b2b_qso: u32,
}

impl UserStatistics {
    pub fn new(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            activator_points: 0,
            hunter_points: 0,
            b2b_points: 0,
            event_points: 0,
            diploma_points: 0,
            total_points: 0,
            total_activator_qso: 0,
            unique_bunkers_activated: 0,
            total_hunter_qso: 0,
            unique_bunkers_hunted: 0,
            activator_b2b_qso: 0,
            confirmed_b2b_qso: 0,
            last_transaction: None,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold one ledger entry's delta in. Counters are maintained separately
    /// by the awarding paths; reversals only move points.
    pub fn apply_delta(&mut self, tx: TransactionId, delta: &PointsDelta, now: DateTime<Utc>) {
        self.activator_points += delta.activator;
        self.hunter_points += delta.hunter;
        self.b2b_points += delta.b2b;
        self.event_points += delta.event;
        self.diploma_points += delta.diploma;
        self.recompute_total();
        self.last_transaction = Some(tx);
        self.updated_at = now;
    }

    /// Authoritative rebuild from the ledger's category sums and a fresh
    /// recount of the contact log. Idempotent by construction.
    pub fn reconcile(
        &mut self,
        sums: PointsDelta,
        tallies: &ContactTallies,
        last_transaction: Option<TransactionId>,
        now: DateTime<Utc>,
    ) {
        self.activator_points = sums.activator;
        self.hunter_points = sums.hunter;
        self.b2b_points = sums.b2b;
        self.event_points = sums.event;
        self.diploma_points = sums.diploma;
        self.recompute_total();
        self.total_activator_qso = tallies.activator_qso;
        self.unique_bunkers_activated = tallies.unique_bunkers_activated;
        self.total_hunter_qso = tallies.hunter_qso;
        self.unique_bunkers_hunted = tallies.unique_bunkers_hunted;
        self.activator_b2b_qso = tallies.activator_b2b_qso;
        self.confirmed_b2b_qso = tallies.confirmed_b2b_qso;
        self.last_transaction = last_transaction;
        self.last_reconciled_at = Some(now);
        self.updated_at = now;
    }

    fn recompute_total(&mut self) {
        self.total_points = self.activator_points
            + self.hunter_points
            + self.b2b_points
            + self.event_points
            + self.diploma_points;
    }
}
