use crate::adif;
use crate::diploma;
use crate::points;
use crate::store::{NewActivationLog, Store, StoreError, UploadStatus};
use crate::types::{BatchId, Callsign, TransactionId, UploadId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFailure {
    DuplicateUpload,
    Validation,
    UnknownBunker,
    UnknownActivator,
    PermissionDenied,
}

/// Structured result of one upload. `success == false` always carries a
/// `failure` kind and at least one error message; idempotency no-ops
/// (duplicate contacts, already-awarded points) are counted, not errors.
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub success: bool,
    pub duplicate_upload: bool,
    pub qsos_processed: u32,
    pub qsos_duplicates: u32,
    pub hunters_updated: u32,
    pub b2b_qsos: u32,
    pub bunker_ref: Option<String>,
    pub activator_callsign: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub upload_id: Option<UploadId>,
    pub batch_id: Option<BatchId>,
    pub failure: Option<UploadFailure>,
}

impl UploadOutcome {
    fn failure(kind: UploadFailure, errors: Vec<String>) -> Self {
        Self {
            duplicate_upload: matches!(kind, UploadFailure::DuplicateUpload),
            errors,
            failure: Some(kind),
            ..Self::default()
        }
    }
}

fn fail_upload(store: &mut Store, upload: UploadId, message: &str) {
    if let Some(entry) = store.upload_mut(upload) {
        entry.status = UploadStatus::Failed;
        entry.error_message = message.to_string();
    }
}

/// Imports a raw ADIF log on behalf of `uploader` using the wall clock.
pub fn process_upload(
    store: &mut Store,
    file_text: &str,
    uploader: UserId,
    filename: Option<&str>,
) -> UploadOutcome {
    process_upload_at(store, file_text, uploader, filename, Utc::now())
}

/// Imports a raw ADIF log: checksum dedup, parse and validate, resolve the
/// bunker and activator, check the uploader's authority, then process every
/// contact, batch the created transactions and refresh diploma progress.
pub fn process_upload_at(
    store: &mut Store,
    file_text: &str,
    uploader: UserId,
    filename: Option<&str>,
    now: DateTime<Utc>,
) -> UploadOutcome {
    let filename = filename.unwrap_or("unknown.adi");
    let checksum = hex::encode(Sha256::digest(file_text.as_bytes()));

    let Some(uploader_row) = store.user(uploader).cloned() else {
        return UploadOutcome::failure(
            UploadFailure::Validation,
            vec!["Uploading user is not registered".to_string()],
        );
    };
    if store.has_upload_with_checksum(uploader, &checksum) {
        warn!(user = uploader.0, %filename, "duplicate upload rejected");
        return UploadOutcome::failure(
            UploadFailure::DuplicateUpload,
            vec!["This file has already been uploaded".to_string()],
        );
    }

    let upload_id = store.create_upload(uploader, filename, "ADIF", checksum, now);

    let log = adif::parse(file_text);
    let validation = log.validate();
    if !validation.valid {
        fail_upload(store, upload_id, &validation.errors.join("; "));
        let mut outcome = UploadOutcome::failure(UploadFailure::Validation, validation.errors);
        outcome.upload_id = Some(upload_id);
        return outcome;
    }

    // validate() just passed, so both extractors produce values.
    let (Some(bunker_ref), Some(activator_call)) =
        (log.bunker_reference(), log.activator_callsign())
    else {
        fail_upload(store, upload_id, "incomplete log header");
        let mut outcome = UploadOutcome::failure(
            UploadFailure::Validation,
            vec!["incomplete log header".to_string()],
        );
        outcome.upload_id = Some(upload_id);
        return outcome;
    };

    let Some(bunker) = store.bunker_by_reference(&bunker_ref).map(|b| b.id) else {
        let message = format!("Bunker {bunker_ref} not found in database");
        fail_upload(store, upload_id, &message);
        let mut outcome = UploadOutcome::failure(UploadFailure::UnknownBunker, vec![message]);
        outcome.upload_id = Some(upload_id);
        outcome.bunker_ref = Some(bunker_ref.to_string());
        return outcome;
    };

    let Some(activator) = store.user_by_callsign(&activator_call).map(|u| u.id) else {
        let message = format!("Activator user {activator_call} not found. Please register first.");
        fail_upload(store, upload_id, &message);
        let mut outcome = UploadOutcome::failure(UploadFailure::UnknownActivator, vec![message]);
        outcome.upload_id = Some(upload_id);
        outcome.bunker_ref = Some(bunker_ref.to_string());
        outcome.activator_callsign = Some(activator_call.to_string());
        return outcome;
    };

    if uploader != activator && !uploader_row.is_staff {
        let message = format!(
            "You can only upload logs for your own callsign ({})",
            uploader_row.callsign
        );
        fail_upload(store, upload_id, &message);
        let mut outcome = UploadOutcome::failure(UploadFailure::PermissionDenied, vec![message]);
        outcome.upload_id = Some(upload_id);
        outcome.bunker_ref = Some(bunker_ref.to_string());
        outcome.activator_callsign = Some(activator_call.to_string());
        return outcome;
    }

    let mut warnings: Vec<String> = Vec::new();
    let mut transactions: Vec<TransactionId> = Vec::new();
    let mut hunters: BTreeSet<UserId> = BTreeSet::new();
    let mut processed = 0u32;
    let mut duplicates = 0u32;
    let mut b2b_count = 0u32;

    for contact in &log.contacts {
        let call = contact
            .get("CALL")
            .map(Callsign::new)
            .unwrap_or_else(|| Callsign::new(""));
        if call.is_empty() {
            warnings.push("Missing callsign".to_string());
            continue;
        }
        let Some(started_at) = adif::contact_datetime(contact) else {
            warnings.push(format!("Invalid date/time for {call}"));
            continue;
        };
        let is_b2b = adif::is_b2b_contact(contact);

        let hunter = match store.get_or_create_hunter(&call, now) {
            Ok((id, _created)) => id,
            Err(err) => {
                warnings.push(format!("Error processing QSO {call}: {err}"));
                continue;
            }
        };

        let mut new_log = NewActivationLog::new(hunter, activator, bunker, started_at);
        new_log.upload = Some(upload_id);
        new_log.mode = adif::contact_mode(contact);
        new_log.band = adif::contact_band(contact);
        new_log.freq_khz = adif::contact_freq_khz(contact);
        new_log.is_b2b = is_b2b;
        new_log.partner_bunker = if is_b2b {
            adif::partner_bunker(contact)
        } else {
            None
        };
        // Activator-uploaded contacts are trusted as verified.
        new_log.verified = true;
        new_log.notes = "Imported from ADIF log".to_string();

        let log_id = match store.insert_log(new_log, now) {
            Ok(id) => id,
            Err(StoreError::DuplicateContact) => {
                duplicates += 1;
                continue;
            }
            Err(err) => {
                warnings.push(format!("Error processing QSO {call}: {err}"));
                continue;
            }
        };

        match points::award_activator_points(store, activator, log_id, Some(uploader), now) {
            Ok(Some(tx)) => transactions.push(tx),
            Ok(None) => {}
            Err(err) => warnings.push(format!("Error awarding activator points for {call}: {err}")),
        }
        match points::award_hunter_points(store, hunter, log_id, Some(uploader), now) {
            Ok(Some(tx)) => transactions.push(tx),
            Ok(None) => {}
            Err(err) => warnings.push(format!("Error awarding hunter points for {call}: {err}")),
        }

        if is_b2b {
            b2b_count += 1;
            check_and_award_b2b(store, log_id, uploader, &mut transactions, &mut warnings, now);
        }

        hunters.insert(hunter);
        processed += 1;
    }

    let batch_id = if transactions.is_empty() {
        None
    } else {
        match points::create_batch(
            store,
            format!("ADIF import {filename}"),
            &transactions,
            Some(upload_id),
            Some(uploader),
            now,
        ) {
            Ok(id) => Some(id),
            Err(err) => {
                warnings.push(format!("Failed to create batch: {err}"));
                None
            }
        }
    };

    if let Err(err) = diploma::refresh_user(store, activator, now) {
        warnings.push(format!("Failed to refresh diploma progress: {err}"));
    }
    for hunter in &hunters {
        if let Err(err) = diploma::refresh_user(store, *hunter, now) {
            warnings.push(format!("Failed to refresh diploma progress: {err}"));
        }
    }

    if let Some(entry) = store.upload_mut(upload_id) {
        entry.qso_count = processed + duplicates;
        entry.processed_qso_count = processed;
        entry.status = UploadStatus::Completed;
    }

    info!(
        user = uploader.0,
        %filename,
        processed,
        duplicates,
        b2b = b2b_count,
        "log upload completed"
    );

    UploadOutcome {
        success: true,
        duplicate_upload: false,
        qsos_processed: processed,
        qsos_duplicates: duplicates,
        hunters_updated: hunters.len() as u32,
        b2b_qsos: b2b_count,
        bunker_ref: Some(bunker_ref.to_string()),
        activator_callsign: Some(activator_call.to_string()),
        warnings,
        errors: Vec::new(),
        upload_id: Some(upload_id),
        batch_id,
        failure: None,
    }
}

/// Cross-log confirmation for a freshly created B2B-flagged contact. Runs
/// once per new contact against what already exists, so the second side's
/// upload is what triggers the match.
fn check_and_award_b2b(
    store: &mut Store,
    log_id: crate::types::LogId,
    uploader: UserId,
    transactions: &mut Vec<TransactionId>,
    warnings: &mut Vec<String>,
    now: DateTime<Utc>,
) {
    let Some(current) = store.log(log_id).cloned() else {
        return;
    };
    let Some(reciprocal) = store.find_reciprocal_b2b(&current) else {
        return;
    };
    match points::confirm_b2b(store, log_id, reciprocal, Some(uploader), now) {
        Ok(Some((tx1, tx2))) => {
            transactions.push(tx1);
            transactions.push(tx2);
            let own = store
                .user(current.activator)
                .map(|u| u.callsign.to_string())
                .unwrap_or_default();
            let partner = store
                .log(reciprocal)
                .and_then(|l| store.user(l.activator))
                .map(|u| u.callsign.to_string())
                .unwrap_or_default();
            warnings.push(format!("B2B confirmed between {own} and {partner}!"));
        }
        Ok(None) => {}
        Err(err) => warnings.push(format!("Error confirming B2B: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diploma::{DiplomaCategory, DiplomaRequirements, DiplomaType};
    use crate::types::BunkerRef;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap()
    }

    fn adif_log(activator: &str, my_ref: &str, contacts: &[(&str, &str, Option<&str>)]) -> String {
        let mut text = format!(
            "Test log\n<ADIF_VER:5>3.1.4\n<OPERATOR:{}>{}\n<EOH>\n",
            activator.len(),
            activator
        );
        for (call, time, partner_ref) in contacts {
            text.push_str(&format!(
                "<CALL:{}>{} <QSO_DATE:8>20250601 <TIME_ON:{}>{} <BAND:3>40M <MODE:3>SSB ",
                call.len(),
                call,
                time.len(),
                time
            ));
            text.push_str(&format!("<MY_SIG:6>WWBOTA <MY_SIG_INFO:{}>{} ", my_ref.len(), my_ref));
            if let Some(partner) = partner_ref {
                text.push_str(&format!(
                    "<SIG:6>WWBOTA <SIG_INFO:{}>{} ",
                    partner.len(),
                    partner
                ));
            }
            text.push_str("<EOR>\n");
        }
        text
    }

    fn seeded() -> (Store, UserId) {
        let mut store = Store::new();
        let activator = store
            .create_user(Callsign::new("SP3FCK"), "sp3fck@example.com", now())
            .unwrap();
        store
            .add_bunker(BunkerRef::parse("B/SP-0039").unwrap(), "Fort IX")
            .unwrap();
        store
            .add_bunker(BunkerRef::parse("B/SP-0040").unwrap(), "Fort X")
            .unwrap();
        (store, activator)
    }

    #[test]
    fn upload_awards_activator_and_auto_created_hunters() {
        let (mut store, activator) = seeded();
        let text = adif_log(
            "SP3FCK",
            "B/SP-0039",
            &[("SP3BLZ", "1200", None), ("SQ3BMJ", "1215", None)],
        );

        let outcome = process_upload_at(&mut store, &text, activator, Some("log.adi"), now());
        assert!(outcome.success, "{:?}", outcome.errors);
        assert_eq!(outcome.qsos_processed, 2);
        assert_eq!(outcome.qsos_duplicates, 0);
        assert_eq!(outcome.hunters_updated, 2);
        assert_eq!(outcome.bunker_ref.as_deref(), Some("B/SP-0039"));
        assert_eq!(outcome.activator_callsign.as_deref(), Some("SP3FCK"));
        assert!(outcome.batch_id.is_some());

        let stats = store.statistics(activator).unwrap();
        assert_eq!(stats.total_activator_qso, 2);
        assert_eq!(stats.activator_points, 2);
        assert_eq!(stats.unique_bunkers_activated, 1);

        for call in ["SP3BLZ", "SQ3BMJ"] {
            let hunter = store.user_by_callsign(&Callsign::new(call)).unwrap();
            assert!(hunter.auto_created);
            assert!(!hunter.is_active);
            let stats = store.statistics(hunter.id).unwrap();
            assert_eq!(stats.hunter_points, 1);
            assert_eq!(stats.total_hunter_qso, 1);
        }

        let upload = store.upload(outcome.upload_id.unwrap()).unwrap();
        assert_eq!(upload.status, UploadStatus::Completed);
        assert_eq!(upload.qso_count, 2);
        assert_eq!(upload.processed_qso_count, 2);

        // Two activator and two hunter awards in the batch.
        let members = store.ledger.batch_members(outcome.batch_id.unwrap());
        assert_eq!(members.len(), 4);
    }

    #[test]
    fn reupload_of_identical_content_short_circuits() {
        let (mut store, activator) = seeded();
        let text = adif_log("SP3FCK", "B/SP-0039", &[("SP3BLZ", "1200", None)]);

        let first = process_upload_at(&mut store, &text, activator, Some("log.adi"), now());
        assert!(first.success);
        let ledger_len = store.ledger.len();

        let second = process_upload_at(&mut store, &text, activator, Some("log.adi"), now());
        assert!(!second.success);
        assert!(second.duplicate_upload);
        assert_eq!(second.failure, Some(UploadFailure::DuplicateUpload));
        assert_eq!(second.qsos_processed, 0);
        assert!(second.upload_id.is_none());
        assert_eq!(store.ledger.len(), ledger_len);
    }

    #[test]
    fn same_contacts_in_a_renamed_file_count_as_duplicates() {
        let (mut store, activator) = seeded();
        let text = adif_log("SP3FCK", "B/SP-0039", &[("SP3BLZ", "1200", None)]);
        process_upload_at(&mut store, &text, activator, Some("log.adi"), now());

        // Different bytes (extra comment line), same QSO key.
        let renamed = format!("different preamble\n{text}");
        let outcome = process_upload_at(&mut store, &renamed, activator, Some("log2.adi"), now());
        assert!(outcome.success);
        assert_eq!(outcome.qsos_processed, 0);
        assert_eq!(outcome.qsos_duplicates, 1);
        assert_eq!(store.statistics(activator).unwrap().activator_points, 1);
    }

    #[test]
    fn validation_failure_marks_upload_failed_without_side_effects() {
        let (mut store, activator) = seeded();
        // No MY_SIG_INFO anywhere: no bunker reference.
        let text = "<OPERATOR:6>SP3FCK<EOH><CALL:6>SP3BLZ <QSO_DATE:8>20250601 <TIME_ON:4>1200 <EOR>";

        let outcome = process_upload_at(&mut store, text, activator, None, now());
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(UploadFailure::Validation));
        assert!(outcome.errors.iter().any(|e| e.contains("bunker reference")));

        let upload = store.upload(outcome.upload_id.unwrap()).unwrap();
        assert_eq!(upload.status, UploadStatus::Failed);
        assert!(upload.error_message.contains("bunker reference"));
        assert!(store.ledger.is_empty());
        assert_eq!(store.logs().count(), 0);
    }

    #[test]
    fn unknown_bunker_and_unregistered_activator_are_hard_failures() {
        let (mut store, activator) = seeded();
        let text = adif_log("SP3FCK", "B/SP-9999", &[("SP3BLZ", "1200", None)]);
        let outcome = process_upload_at(&mut store, &text, activator, None, now());
        assert_eq!(outcome.failure, Some(UploadFailure::UnknownBunker));
        assert!(outcome.errors[0].contains("B/SP-9999"));

        let text = adif_log("SP9NEW", "B/SP-0039", &[("SP3BLZ", "1200", None)]);
        let outcome = process_upload_at(&mut store, &text, activator, None, now());
        assert_eq!(outcome.failure, Some(UploadFailure::UnknownActivator));
        assert!(outcome.errors[0].contains("SP9NEW"));
        assert!(store.user_by_callsign(&Callsign::new("SP9NEW")).is_none());
    }

    #[test]
    fn only_the_activator_or_staff_may_upload() {
        let (mut store, _activator) = seeded();
        let stranger = store
            .create_user(Callsign::new("SP5XYZ"), "sp5xyz@example.com", now())
            .unwrap();
        let text = adif_log("SP3FCK", "B/SP-0039", &[("SP3BLZ", "1200", None)]);

        let outcome = process_upload_at(&mut store, &text, stranger, None, now());
        assert_eq!(outcome.failure, Some(UploadFailure::PermissionDenied));
        assert!(outcome.errors[0].contains("SP5XYZ"));
        assert_eq!(store.logs().count(), 0);

        store.promote_to_staff(stranger).unwrap();
        let outcome = process_upload_at(&mut store, &text, stranger, None, now());
        assert!(outcome.success, "{:?}", outcome.errors);
        assert_eq!(outcome.qsos_processed, 1);
    }

    #[test]
    fn bad_records_become_warnings_and_do_not_abort_the_rest() {
        let (mut store, activator) = seeded();
        let text = concat!(
            "<OPERATOR:6>SP3FCK<EOH>\n",
            "<CALL:6>SP3BLZ <QSO_DATE:8>2025BAD1 <TIME_ON:4>1200 ",
            "<MY_SIG_INFO:9>B/SP-0039 <EOR>\n",
            "<CALL:6>SQ3BMJ <QSO_DATE:8>20250601 <TIME_ON:4>1230 ",
            "<MY_SIG_INFO:9>B/SP-0039 <EOR>\n",
        );

        let outcome = process_upload_at(&mut store, text, activator, None, now());
        assert!(outcome.success);
        assert_eq!(outcome.qsos_processed, 1);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("Invalid date/time for SP3BLZ")));
    }

    #[test]
    fn b2b_confirms_only_after_both_sides_uploaded() {
        let (mut store, side_a) = seeded();

        // Side A works SP4ABC from B/SP-0039; the partner claims B/SP-0040.
        let text_a = adif_log("SP3FCK", "B/SP-0039", &[("SP4ABC", "1200", Some("B/SP-0040"))]);
        let outcome_a = process_upload_at(&mut store, &text_a, side_a, Some("a.adi"), now());
        assert!(outcome_a.success, "{:?}", outcome_a.errors);
        assert_eq!(outcome_a.b2b_qsos, 1);

        let side_b = store.user_by_callsign(&Callsign::new("SP4ABC")).unwrap().id;
        assert_eq!(store.statistics(side_a).unwrap().b2b_points, 0);
        assert_eq!(store.statistics(side_b).unwrap().b2b_points, 0);

        // Side B's reciprocal log, 15 minutes later, from B/SP-0040.
        let text_b = adif_log("SP4ABC", "B/SP-0040", &[("SP3FCK", "1215", Some("B/SP-0039"))]);
        let outcome_b = process_upload_at(&mut store, &text_b, side_b, Some("b.adi"), now());
        assert!(outcome_b.success, "{:?}", outcome_b.errors);
        assert!(outcome_b
            .warnings
            .iter()
            .any(|w| w.contains("B2B confirmed")));

        assert_eq!(store.statistics(side_a).unwrap().b2b_points, 1);
        assert_eq!(store.statistics(side_b).unwrap().b2b_points, 1);
        for log in store.logs().collect::<Vec<_>>() {
            assert!(log.b2b_confirmed, "log {} unconfirmed", log.id.0);
            assert!(log.b2b_partner.is_some());
        }
    }

    #[test]
    fn b2b_outside_the_window_stays_unconfirmed() {
        let (mut store, side_a) = seeded();
        let text_a = adif_log("SP3FCK", "B/SP-0039", &[("SP4ABC", "1200", Some("B/SP-0040"))]);
        process_upload_at(&mut store, &text_a, side_a, Some("a.adi"), now());
        let side_b = store.user_by_callsign(&Callsign::new("SP4ABC")).unwrap().id;

        // 31 minutes after side A's contact.
        let text_b = adif_log("SP4ABC", "B/SP-0040", &[("SP3FCK", "1231", Some("B/SP-0039"))]);
        let outcome = process_upload_at(&mut store, &text_b, side_b, Some("b.adi"), now());
        assert!(outcome.success);
        assert_eq!(store.statistics(side_a).unwrap().b2b_points, 0);
        assert!(store.logs().all(|log| !log.b2b_confirmed));
    }

    #[test]
    fn upload_refreshes_diplomas_for_activator_and_hunters() {
        let (mut store, activator) = seeded();
        store.add_diploma_type(DiplomaType {
            name: "First Hunt".to_string(),
            description: String::new(),
            category: DiplomaCategory::Hunter,
            requirements: DiplomaRequirements {
                min_hunter_points: 1,
                ..DiplomaRequirements::default()
            },
            valid_from: None,
            valid_to: None,
            is_active: true,
            display_order: 0,
        });

        let text = adif_log(
            "SP3FCK",
            "B/SP-0039",
            &[("SP3BLZ", "1200", None), ("SQ3BMJ", "1215", None)],
        );
        let outcome = process_upload_at(&mut store, &text, activator, None, now());
        assert!(outcome.success);

        for call in ["SP3BLZ", "SQ3BMJ"] {
            let hunter = store.user_by_callsign(&Callsign::new(call)).unwrap().id;
            let diplomas: Vec<_> = store.diplomas().filter(|d| d.user == hunter).collect();
            assert_eq!(diplomas.len(), 1, "{call} should hold one diploma");
        }
        // Activator hunted nothing; no diploma.
        assert!(store.diplomas().all(|d| d.user != activator));
    }
}
