use crate::ledger::{LedgerError, NewTransaction, PointsDelta, TransactionKind};
use crate::store::Store;
use crate::types::{BatchId, DiplomaId, LogId, TransactionId, UploadId, UserId};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointsError {
    UnknownUser(UserId),
    UnknownLog(LogId),
    UnknownDiploma(DiplomaId),
    NonPositiveAmount(i64),
    Ledger(LedgerError),
}

impl std::fmt::Display for PointsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointsError::UnknownUser(id) => write!(f, "unknown user {}", id.0),
            PointsError::UnknownLog(id) => write!(f, "unknown activation log {}", id.0),
            PointsError::UnknownDiploma(id) => write!(f, "unknown diploma {}", id.0),
            PointsError::NonPositiveAmount(points) => {
                write!(f, "bonus amount must be positive, got {points}")
            }
            PointsError::Ledger(err) => write!(f, "ledger error: {err}"),
        }
    }
}

impl std::error::Error for PointsError {}

impl From<LedgerError> for PointsError {
    fn from(err: LedgerError) -> Self {
        PointsError::Ledger(err)
    }
}

/// Result of reversing a whole batch. Failures are collected per member,
/// never fatal to the rest of the batch.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReversal {
    pub reversed: u32,
    pub errors: Vec<String>,
}

/// Awards the activator one point for a QSO made from the bunker. No-op if
/// this contact already carries an award; the flag on the contact is the
/// idempotency guard.
pub fn award_activator_points(
    store: &mut Store,
    user: UserId,
    log_id: LogId,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<Option<TransactionId>, PointsError> {
    if store.user(user).is_none() {
        return Err(PointsError::UnknownUser(user));
    }
    let log = store
        .log(log_id)
        .ok_or(PointsError::UnknownLog(log_id))?
        .clone();
    if log.points_awarded {
        warn!(log = log_id.0, "activator points already awarded");
        return Ok(None);
    }
    let bunker_ref = store
        .bunker(log.bunker)
        .map(|b| b.reference.as_str().to_string())
        .unwrap_or_default();

    let mut tx = NewTransaction::new(
        user,
        TransactionKind::ActivatorQso,
        PointsDelta::activator(1),
        format!("Activator QSO from {bunker_ref}"),
    );
    tx.log = Some(log_id);
    tx.bunker = Some(log.bunker);
    tx.notes = format!("Mode: {}, Band: {}", log.mode, log.band);
    tx.created_by = created_by;
    let tx_id = store.ledger.append(tx, now);

    if let Some(entry) = store.log_mut(log_id) {
        entry.points_awarded = true;
        entry.points_transaction = Some(tx_id);
    }

    let tallies = store.contact_tallies(user);
    let stats = store.stats_mut(user, now);
    stats.apply_delta(tx_id, &PointsDelta::activator(1), now);
    stats.total_activator_qso += 1;
    stats.unique_bunkers_activated = tallies.unique_bunkers_activated;
    stats.activator_b2b_qso = tallies.activator_b2b_qso;

    info!(user = user.0, log = log_id.0, bunker = %bunker_ref, "awarded activator point");
    Ok(Some(tx_id))
}

/// Awards the hunter one point for working the bunker. No-op when the
/// hunter is the contact's own activator, or when this (user, contact)
/// pair already holds a hunter award.
pub fn award_hunter_points(
    store: &mut Store,
    user: UserId,
    log_id: LogId,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<Option<TransactionId>, PointsError> {
    if store.user(user).is_none() {
        return Err(PointsError::UnknownUser(user));
    }
    let log = store
        .log(log_id)
        .ok_or(PointsError::UnknownLog(log_id))?
        .clone();
    if user == log.activator {
        return Ok(None);
    }
    if store.ledger.has_hunter_award(user, log_id) {
        warn!(user = user.0, log = log_id.0, "hunter points already awarded");
        return Ok(None);
    }
    let bunker_ref = store
        .bunker(log.bunker)
        .map(|b| b.reference.as_str().to_string())
        .unwrap_or_default();
    let activator_call = store
        .user(log.activator)
        .ok_or(PointsError::UnknownUser(log.activator))?
        .callsign
        .clone();

    let mut tx = NewTransaction::new(
        user,
        TransactionKind::HunterQso,
        PointsDelta::hunter(1),
        format!("Hunter QSO with {bunker_ref}"),
    );
    tx.log = Some(log_id);
    tx.bunker = Some(log.bunker);
    tx.notes = format!("Worked {activator_call} at bunker");
    tx.created_by = created_by;
    let tx_id = store.ledger.append(tx, now);

    let tallies = store.contact_tallies(user);
    let stats = store.stats_mut(user, now);
    stats.apply_delta(tx_id, &PointsDelta::hunter(1), now);
    stats.total_hunter_qso += 1;
    stats.unique_bunkers_hunted = tallies.unique_bunkers_hunted;

    info!(user = user.0, log = log_id.0, bunker = %bunker_ref, "awarded hunter point");
    Ok(Some(tx_id))
}

/// Confirms a reciprocal bunker-to-bunker pair and awards one B2B point to
/// each side's activator. Validation failures are non-fatal: the pair is
/// left untouched and `None` is returned.
pub fn confirm_b2b(
    store: &mut Store,
    log1_id: LogId,
    log2_id: LogId,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<Option<(TransactionId, TransactionId)>, PointsError> {
    let log1 = store
        .log(log1_id)
        .ok_or(PointsError::UnknownLog(log1_id))?
        .clone();
    let log2 = store
        .log(log2_id)
        .ok_or(PointsError::UnknownLog(log2_id))?
        .clone();

    if log1.user != log2.activator || log2.user != log1.activator {
        warn!(log1 = log1_id.0, log2 = log2_id.0, "logs are not reciprocal");
        return Ok(None);
    }
    if !store.bunker_pair_consistent(&log1, &log2) {
        warn!(log1 = log1_id.0, log2 = log2_id.0, "logs disagree on bunkers");
        return Ok(None);
    }
    if log1.b2b_confirmed || log2.b2b_confirmed {
        warn!(log1 = log1_id.0, log2 = log2_id.0, "B2B already confirmed");
        return Ok(None);
    }

    let call1 = store
        .user(log1.activator)
        .ok_or(PointsError::UnknownUser(log1.activator))?
        .callsign
        .clone();
    let call2 = store
        .user(log2.activator)
        .ok_or(PointsError::UnknownUser(log2.activator))?
        .callsign
        .clone();
    let ref1 = store
        .bunker(log1.bunker)
        .map(|b| b.reference.as_str().to_string())
        .unwrap_or_default();
    let ref2 = store
        .bunker(log2.bunker)
        .map(|b| b.reference.as_str().to_string())
        .unwrap_or_default();

    if let Some(entry) = store.log_mut(log1_id) {
        entry.b2b_confirmed = true;
        entry.b2b_confirmed_at = Some(now);
        entry.b2b_partner = Some(log2.activator);
        entry.b2b_partner_log = Some(log2_id);
    }
    if let Some(entry) = store.log_mut(log2_id) {
        entry.b2b_confirmed = true;
        entry.b2b_confirmed_at = Some(now);
        entry.b2b_partner = Some(log1.activator);
        entry.b2b_partner_log = Some(log1_id);
    }

    let mut tx1 = NewTransaction::new(
        log1.activator,
        TransactionKind::B2bConfirmed,
        PointsDelta::b2b(1),
        format!("B2B confirmed with {call2}"),
    );
    tx1.log = Some(log1_id);
    tx1.bunker = Some(log1.bunker);
    tx1.notes = format!("Bunkers: {ref1} <-> {ref2}");
    tx1.created_by = created_by;
    let tx1 = store.ledger.append(tx1, now);

    let mut tx2 = NewTransaction::new(
        log2.activator,
        TransactionKind::B2bConfirmed,
        PointsDelta::b2b(1),
        format!("B2B confirmed with {call1}"),
    );
    tx2.log = Some(log2_id);
    tx2.bunker = Some(log2.bunker);
    tx2.notes = format!("Bunkers: {ref2} <-> {ref1}");
    tx2.created_by = created_by;
    let tx2 = store.ledger.append(tx2, now);

    for (activator, tx) in [(log1.activator, tx1), (log2.activator, tx2)] {
        let tallies = store.contact_tallies(activator);
        let stats = store.stats_mut(activator, now);
        stats.apply_delta(tx, &PointsDelta::b2b(1), now);
        stats.activator_b2b_qso = tallies.activator_b2b_qso;
        stats.confirmed_b2b_qso = tallies.confirmed_b2b_qso;
    }

    info!(%call1, %call2, "B2B confirmed");
    Ok(Some((tx1, tx2)))
}

/// Cancels a confirmed B2B pair: reverses both award transactions and
/// clears the confirmation flags. The partner links stay in place so the
/// pairing remains visible after cancellation.
pub fn cancel_b2b(
    store: &mut Store,
    log_id: LogId,
    reason: &str,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<Option<(Option<TransactionId>, Option<TransactionId>)>, PointsError> {
    let log = store
        .log(log_id)
        .ok_or(PointsError::UnknownLog(log_id))?
        .clone();
    if !log.b2b_confirmed {
        return Ok(None);
    }
    let Some(partner_log_id) = log.b2b_partner_log else {
        tracing::error!(log = log_id.0, "B2B confirmed but no partner log");
        return Ok(None);
    };
    let partner = store
        .log(partner_log_id)
        .ok_or(PointsError::UnknownLog(partner_log_id))?
        .clone();

    let award1 = store.ledger.find_b2b_award(log.activator, log_id);
    let award2 = store.ledger.find_b2b_award(partner.activator, partner_log_id);

    let reversal1 = match award1 {
        Some(tx) => Some(reverse_transaction(store, tx, reason, created_by, now)?),
        None => None,
    };
    let reversal2 = match award2 {
        Some(tx) => Some(reverse_transaction(store, tx, reason, created_by, now)?),
        None => None,
    };

    if let Some(entry) = store.log_mut(log_id) {
        entry.b2b_confirmed = false;
        entry.b2b_confirmed_at = None;
    }
    if let Some(entry) = store.log_mut(partner_log_id) {
        entry.b2b_confirmed = false;
        entry.b2b_confirmed_at = None;
    }

    for activator in [log.activator, partner.activator] {
        let tallies = store.contact_tallies(activator);
        let stats = store.stats_mut(activator, now);
        stats.confirmed_b2b_qso = tallies.confirmed_b2b_qso;
    }

    info!(log = log_id.0, partner = partner_log_id.0, %reason, "B2B cancelled");
    Ok(Some((reversal1, reversal2)))
}

/// Awards bonus points for an earned diploma.
pub fn award_diploma_bonus(
    store: &mut Store,
    user: UserId,
    diploma_id: DiplomaId,
    points: i64,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<TransactionId, PointsError> {
    if store.user(user).is_none() {
        return Err(PointsError::UnknownUser(user));
    }
    if points <= 0 {
        return Err(PointsError::NonPositiveAmount(points));
    }
    let diploma = store
        .diploma(diploma_id)
        .ok_or(PointsError::UnknownDiploma(diploma_id))?;
    let serial = diploma.serial.clone();
    let name = store
        .diploma_type(diploma.diploma_type)
        .map(|dt| dt.name.clone())
        .unwrap_or_default();

    let mut tx = NewTransaction::new(
        user,
        TransactionKind::DiplomaBonus,
        PointsDelta::diploma(points),
        format!("Earned diploma: {name}"),
    );
    tx.diploma = Some(diploma_id);
    tx.notes = format!("Diploma #{serial}");
    tx.created_by = created_by;
    let tx_id = store.ledger.append(tx, now);
    store
        .stats_mut(user, now)
        .apply_delta(tx_id, &PointsDelta::diploma(points), now);

    info!(user = user.0, %serial, points, "awarded diploma bonus");
    Ok(tx_id)
}

/// Awards bonus points for a special event.
pub fn award_event_bonus(
    store: &mut Store,
    user: UserId,
    points: i64,
    reason: impl Into<String>,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<TransactionId, PointsError> {
    if store.user(user).is_none() {
        return Err(PointsError::UnknownUser(user));
    }
    if points <= 0 {
        return Err(PointsError::NonPositiveAmount(points));
    }
    let mut tx = NewTransaction::new(
        user,
        TransactionKind::EventBonus,
        PointsDelta::event(points),
        reason,
    );
    tx.created_by = created_by;
    let tx_id = store.ledger.append(tx, now);
    store
        .stats_mut(user, now)
        .apply_delta(tx_id, &PointsDelta::event(points), now);
    Ok(tx_id)
}

/// Groups already-created transactions under one named batch.
pub fn create_batch(
    store: &mut Store,
    name: impl Into<String>,
    transactions: &[TransactionId],
    upload: Option<UploadId>,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<BatchId, PointsError> {
    let name = name.into();
    let batch = store.ledger.create_batch(
        name.clone(),
        format!("Batch of {} transactions", transactions.len()),
        upload,
        created_by,
        now,
    );
    for tx in transactions {
        store.ledger.attach_to_batch(*tx, batch)?;
    }
    info!(%name, count = transactions.len(), "created transaction batch");
    Ok(batch)
}

/// Reverses one transaction and folds the negated delta into the subject's
/// cache row. Fails if the transaction is already reversed.
pub fn reverse_transaction(
    store: &mut Store,
    tx: TransactionId,
    reason: impl Into<String>,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<TransactionId, PointsError> {
    let reversal = store.ledger.reverse(tx, reason, created_by, now)?;
    if let Some(entry) = store.ledger.get(reversal) {
        let (user, delta) = (entry.user, entry.delta);
        store.stats_mut(user, now).apply_delta(reversal, &delta, now);
    }
    info!(original = tx.0, reversal = reversal.0, "reversed transaction");
    Ok(reversal)
}

/// Reverses every non-reversed member of a batch, collecting per-member
/// errors instead of aborting.
pub fn reverse_batch(
    store: &mut Store,
    batch: BatchId,
    reason: &str,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<BatchReversal, PointsError> {
    if store.ledger.batch(batch).is_none() {
        return Err(PointsError::Ledger(LedgerError::UnknownBatch(batch)));
    }
    let members: Vec<TransactionId> = store
        .ledger
        .batch_members(batch)
        .into_iter()
        .filter(|tx| {
            store
                .ledger
                .get(*tx)
                .map(|entry| !entry.is_reversed)
                .unwrap_or(false)
        })
        .collect();

    let mut reversed = 0;
    let mut errors = Vec::new();
    for tx in members {
        match reverse_transaction(store, tx, reason, created_by, now) {
            Ok(_) => reversed += 1,
            Err(err) => errors.push(format!("transaction {}: {err}", tx.0)),
        }
    }
    store.ledger.mark_batch_reversed(batch, now)?;
    info!(batch = batch.0, reversed, failed = errors.len(), "reversed batch");
    Ok(BatchReversal { reversed, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewActivationLog;
    use crate::types::{BunkerId, BunkerRef, Callsign};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn seeded() -> (Store, UserId, UserId, BunkerId) {
        let mut store = Store::new();
        let activator = store
            .create_user(Callsign::new("SP3FCK"), "sp3fck@example.com", now())
            .unwrap();
        let hunter = store
            .create_user(Callsign::new("SP3BLZ"), "sp3blz@example.com", now())
            .unwrap();
        let bunker = store
            .add_bunker(BunkerRef::parse("B/SP-0039").unwrap(), "Fort IX")
            .unwrap();
        (store, activator, hunter, bunker)
    }

    fn contact(store: &mut Store, hunter: UserId, activator: UserId, bunker: BunkerId) -> LogId {
        store
            .insert_log(NewActivationLog::new(hunter, activator, bunker, now()), now())
            .unwrap()
    }

    #[test]
    fn activator_award_is_idempotent() {
        let (mut store, activator, hunter, bunker) = seeded();
        let log = contact(&mut store, hunter, activator, bunker);

        let first = award_activator_points(&mut store, activator, log, None, now()).unwrap();
        assert!(first.is_some());
        let second = award_activator_points(&mut store, activator, log, None, now()).unwrap();
        assert!(second.is_none());

        let stats = store.statistics(activator).unwrap();
        assert_eq!(stats.activator_points, 1);
        assert_eq!(stats.total_activator_qso, 1);
        assert_eq!(stats.unique_bunkers_activated, 1);
        assert_eq!(store.ledger.len(), 1);

        let entry = store.log(log).unwrap();
        assert!(entry.points_awarded);
        assert_eq!(entry.points_transaction, first);
    }

    #[test]
    fn hunter_award_skips_self_and_duplicates() {
        let (mut store, activator, hunter, bunker) = seeded();
        let log = contact(&mut store, hunter, activator, bunker);

        assert!(award_hunter_points(&mut store, activator, log, None, now())
            .unwrap()
            .is_none());

        assert!(award_hunter_points(&mut store, hunter, log, None, now())
            .unwrap()
            .is_some());
        assert!(award_hunter_points(&mut store, hunter, log, None, now())
            .unwrap()
            .is_none());

        let stats = store.statistics(hunter).unwrap();
        assert_eq!(stats.hunter_points, 1);
        assert_eq!(stats.total_hunter_qso, 1);
        assert_eq!(stats.unique_bunkers_hunted, 1);
    }

    fn b2b_pair(store: &mut Store, a: UserId, b: UserId) -> (LogId, LogId) {
        let bunker_a = store
            .add_bunker(BunkerRef::parse("B/SP-0041").unwrap(), "Fort A")
            .unwrap();
        let bunker_b = store
            .add_bunker(BunkerRef::parse("B/SP-0042").unwrap(), "Fort B")
            .unwrap();
        let mut log_a = NewActivationLog::new(b, a, bunker_a, now());
        log_a.is_b2b = true;
        log_a.partner_bunker = BunkerRef::parse("B/SP-0042");
        let log_a = store.insert_log(log_a, now()).unwrap();

        let mut log_b = NewActivationLog::new(a, b, bunker_b, now() + Duration::minutes(1));
        log_b.is_b2b = true;
        log_b.partner_bunker = BunkerRef::parse("B/SP-0041");
        let log_b = store.insert_log(log_b, now()).unwrap();
        (log_a, log_b)
    }

    #[test]
    fn confirm_b2b_awards_both_activators_and_links_logs() {
        let (mut store, a, b, _) = seeded();
        let (log_a, log_b) = b2b_pair(&mut store, a, b);

        let pair = confirm_b2b(&mut store, log_a, log_b, None, now()).unwrap();
        assert!(pair.is_some());

        let entry_a = store.log(log_a).unwrap();
        assert!(entry_a.b2b_confirmed);
        assert_eq!(entry_a.b2b_partner, Some(b));
        assert_eq!(entry_a.b2b_partner_log, Some(log_b));

        let entry_b = store.log(log_b).unwrap();
        assert!(entry_b.b2b_confirmed);
        assert_eq!(entry_b.b2b_partner, Some(a));

        assert_eq!(store.statistics(a).unwrap().b2b_points, 1);
        assert_eq!(store.statistics(b).unwrap().b2b_points, 1);
        assert_eq!(store.statistics(a).unwrap().confirmed_b2b_qso, 1);
    }

    #[test]
    fn confirm_b2b_rejects_non_reciprocal_logs() {
        let (mut store, a, b, bunker) = seeded();
        let third = store
            .create_user(Callsign::new("SQ3BMJ"), "sq3bmj@example.com", now())
            .unwrap();
        // Second log names the wrong counterpart.
        let log1 = contact(&mut store, b, a, bunker);
        let log2 = store
            .insert_log(
                NewActivationLog::new(third, b, bunker, now() + Duration::minutes(1)),
                now(),
            )
            .unwrap();

        assert_eq!(confirm_b2b(&mut store, log1, log2, None, now()).unwrap(), None);
        assert!(!store.log(log1).unwrap().b2b_confirmed);
        assert_eq!(store.statistics(a).unwrap().b2b_points, 0);
        assert!(store.ledger.is_empty());
    }

    #[test]
    fn confirm_b2b_rejects_inconsistent_bunkers() {
        let (mut store, a, b, bunker) = seeded();
        let other = store
            .add_bunker(BunkerRef::parse("B/SP-0040").unwrap(), "Fort X")
            .unwrap();
        // Reciprocal users but neither side claims the other's bunker.
        let log1 = contact(&mut store, b, a, bunker);
        let log2 = store
            .insert_log(
                NewActivationLog::new(a, b, other, now() + Duration::minutes(1)),
                now(),
            )
            .unwrap();

        assert_eq!(confirm_b2b(&mut store, log1, log2, None, now()).unwrap(), None);
        assert!(store.ledger.is_empty());
    }

    #[test]
    fn confirm_b2b_accepts_a_shared_bunker() {
        let (mut store, a, b, bunker) = seeded();
        let log1 = contact(&mut store, b, a, bunker);
        let log2 = store
            .insert_log(
                NewActivationLog::new(a, b, bunker, now() + Duration::minutes(1)),
                now(),
            )
            .unwrap();
        assert!(confirm_b2b(&mut store, log1, log2, None, now())
            .unwrap()
            .is_some());
    }

    #[test]
    fn confirm_b2b_twice_is_a_no_op() {
        let (mut store, a, b, _) = seeded();
        let (log_a, log_b) = b2b_pair(&mut store, a, b);
        assert!(confirm_b2b(&mut store, log_a, log_b, None, now())
            .unwrap()
            .is_some());
        assert_eq!(confirm_b2b(&mut store, log_a, log_b, None, now()).unwrap(), None);
        assert_eq!(store.statistics(a).unwrap().b2b_points, 1);
    }

    #[test]
    fn cancel_b2b_reverses_awards_but_keeps_partner_links() {
        let (mut store, a, b, _) = seeded();
        let (log_a, log_b) = b2b_pair(&mut store, a, b);
        confirm_b2b(&mut store, log_a, log_b, None, now()).unwrap();

        let reversals = cancel_b2b(&mut store, log_a, "log withdrawn", None, now())
            .unwrap()
            .expect("pair was confirmed");
        assert!(reversals.0.is_some());
        assert!(reversals.1.is_some());

        let entry_a = store.log(log_a).unwrap();
        assert!(!entry_a.b2b_confirmed);
        assert!(entry_a.b2b_confirmed_at.is_none());
        assert_eq!(entry_a.b2b_partner, Some(b));
        assert_eq!(entry_a.b2b_partner_log, Some(log_b));

        assert_eq!(store.statistics(a).unwrap().b2b_points, 0);
        assert_eq!(store.statistics(b).unwrap().b2b_points, 0);
        assert_eq!(store.statistics(a).unwrap().confirmed_b2b_qso, 0);

        assert_eq!(cancel_b2b(&mut store, log_a, "again", None, now()).unwrap(), None);
    }

    #[test]
    fn reversal_restores_the_cache_total() {
        let (mut store, activator, hunter, bunker) = seeded();
        let log = contact(&mut store, hunter, activator, bunker);
        let before = store.statistics(activator).unwrap().total_points;

        let tx = award_activator_points(&mut store, activator, log, None, now())
            .unwrap()
            .expect("first award");
        assert_eq!(store.statistics(activator).unwrap().total_points, before + 1);

        reverse_transaction(&mut store, tx, "admin correction", None, now()).unwrap();
        assert_eq!(store.statistics(activator).unwrap().total_points, before);

        let err = reverse_transaction(&mut store, tx, "again", None, now()).unwrap_err();
        assert_eq!(err, PointsError::Ledger(LedgerError::AlreadyReversed(tx)));
    }

    #[test]
    fn batch_reversal_collects_errors_without_aborting() {
        let (mut store, activator, hunter, bunker) = seeded();
        let other = store
            .add_bunker(BunkerRef::parse("B/SP-0040").unwrap(), "Fort X")
            .unwrap();
        let log1 = contact(&mut store, hunter, activator, bunker);
        let log2 = contact(&mut store, hunter, activator, other);
        let tx1 = award_activator_points(&mut store, activator, log1, None, now())
            .unwrap()
            .expect("award 1");
        let tx2 = award_activator_points(&mut store, activator, log2, None, now())
            .unwrap()
            .expect("award 2");
        let batch = create_batch(&mut store, "upload 1", &[tx1, tx2], None, None, now()).unwrap();

        // One member already reversed by hand: skipped, not an error.
        reverse_transaction(&mut store, tx1, "manual", None, now()).unwrap();

        let outcome = reverse_batch(&mut store, batch, "withdraw upload", None, now()).unwrap();
        assert_eq!(outcome.reversed, 1);
        assert!(outcome.errors.is_empty());
        assert!(store.ledger.batch(batch).unwrap().is_reversed);
        assert_eq!(store.statistics(activator).unwrap().activator_points, 0);
    }

    #[test]
    fn diploma_and_event_bonuses_require_positive_amounts() {
        let (mut store, activator, _, _) = seeded();
        assert_eq!(
            award_event_bonus(&mut store, activator, 0, "event", None, now()).unwrap_err(),
            PointsError::NonPositiveAmount(0)
        );
        award_event_bonus(&mut store, activator, 5, "field day", None, now()).unwrap();
        assert_eq!(store.statistics(activator).unwrap().event_points, 5);
    }

    #[test]
    fn cache_matches_full_recalculation_after_mixed_history() {
        let (mut store, activator, hunter, bunker) = seeded();
        let other = store
            .add_bunker(BunkerRef::parse("B/SP-0040").unwrap(), "Fort X")
            .unwrap();
        let log1 = contact(&mut store, hunter, activator, bunker);
        let log2 = contact(&mut store, hunter, activator, other);

        award_activator_points(&mut store, activator, log1, None, now()).unwrap();
        let tx = award_activator_points(&mut store, activator, log2, None, now())
            .unwrap()
            .expect("award 2");
        award_hunter_points(&mut store, hunter, log1, None, now()).unwrap();
        award_hunter_points(&mut store, hunter, log2, None, now()).unwrap();
        award_event_bonus(&mut store, activator, 3, "event", None, now()).unwrap();
        reverse_transaction(&mut store, tx, "bad log", None, now()).unwrap();

        for user in [activator, hunter] {
            let incremental = store.statistics(user).unwrap().clone();
            store.reconcile_statistics(user, now()).unwrap();
            let rebuilt = store.statistics(user).unwrap();
            assert_eq!(rebuilt.activator_points, incremental.activator_points);
            assert_eq!(rebuilt.hunter_points, incremental.hunter_points);
            assert_eq!(rebuilt.b2b_points, incremental.b2b_points);
            assert_eq!(rebuilt.event_points, incremental.event_points);
            assert_eq!(rebuilt.diploma_points, incremental.diploma_points);
            assert_eq!(rebuilt.total_points, incremental.total_points);
            assert_eq!(rebuilt.total_hunter_qso, incremental.total_hunter_qso);
            assert_eq!(
                rebuilt.unique_bunkers_hunted,
                incremental.unique_bunkers_hunted
            );
            assert_eq!(
                rebuilt.unique_bunkers_activated,
                incremental.unique_bunkers_activated
            );
        }
    }
}
