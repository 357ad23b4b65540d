use crate::diploma::{
    Diploma, DiplomaCatalog, DiplomaCategory, DiplomaProgress, DiplomaType, VerificationEvent,
};
use crate::ledger::Ledger;
use crate::stats::{ContactTallies, UserStatistics};
use crate::types::{
    BunkerId, BunkerRef, Callsign, DiplomaId, DiplomaTypeId, LogId, TransactionId, UploadId, UserId,
};
use chrono::{DateTime, Datelike, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// How far apart two reciprocal B2B contacts may be logged and still confirm.
pub const B2B_WINDOW: Duration = Duration::minutes(30);

const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub callsign: Callsign,
    pub email: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub auto_created: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bunker {
    pub id: BunkerId,
    pub reference: BunkerRef,
    pub name: String,
}

/// One logged QSO. `user` is the non-activator side of the contact,
/// `activator` the bunker-side operator. Mutated only to attach B2B
/// confirmation and points bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationLog {
    pub id: LogId,
    pub user: UserId,
    pub activator: UserId,
    pub bunker: BunkerId,
    /// Bunker the other station claimed to be at, taken from their
    /// signal-info field when the contact was flagged B2B.
    pub partner_bunker: Option<BunkerRef>,
    pub activation_key: Option<String>,
    pub upload: Option<UploadId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub mode: String,
    pub band: String,
    pub freq_khz: Option<u32>,
    pub is_b2b: bool,
    pub b2b_confirmed: bool,
    pub b2b_confirmed_at: Option<DateTime<Utc>>,
    pub b2b_partner: Option<UserId>,
    pub b2b_partner_log: Option<LogId>,
    pub points_awarded: bool,
    pub points_transaction: Option<TransactionId>,
    pub verified: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewActivationLog {
    pub user: UserId,
    pub activator: UserId,
    pub bunker: BunkerId,
    pub partner_bunker: Option<BunkerRef>,
    pub activation_key: Option<String>,
    pub upload: Option<UploadId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub mode: String,
    pub band: String,
    pub freq_khz: Option<u32>,
    pub is_b2b: bool,
    pub verified: bool,
    pub notes: String,
}

impl NewActivationLog {
    pub fn new(user: UserId, activator: UserId, bunker: BunkerId, started_at: DateTime<Utc>) -> Self {
        Self {
            user,
            activator,
            bunker,
            partner_bunker: None,
            activation_key: None,
            upload: None,
            started_at,
            ended_at: None,
            mode: String::new(),
            band: String::new(),
            freq_khz: None,
            is_b2b: false,
            verified: false,
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogUpload {
    pub id: UploadId,
    pub user: UserId,
    pub filename: String,
    pub file_format: String,
    pub checksum: String,
    pub status: UploadStatus,
    pub error_message: String,
    pub qso_count: u32,
    pub processed_qso_count: u32,
    pub uploaded_at: DateTime<Utc>,
}

/// Key handed to an operator so a bunker visit can be checked in without a
/// log upload. Time-limited or permanent, optionally bound to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationKey {
    pub key: String,
    pub bunker: BunkerId,
    pub assigned_to: Option<UserId>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub max_uses: Option<u32>,
    pub times_used: u32,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl ActivationKey {
    /// Random key over an alphabet with the ambiguous O/0/I/1 removed.
    pub fn generate(length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
            .collect()
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        if !self.is_active || self.valid_from > at {
            return false;
        }
        if let Some(until) = self.valid_until {
            if until < at {
                return false;
            }
        }
        match self.max_uses {
            Some(max) => self.times_used < max,
            None => true,
        }
    }

    pub fn can_be_used_by(&self, user: UserId, at: DateTime<Utc>) -> bool {
        if !self.is_valid_at(at) {
            return false;
        }
        match self.assigned_to {
            Some(owner) => owner == user,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidCallsign,
    CallsignTaken(String),
    DuplicateBunker(String),
    DuplicateContact,
    UnknownUser(UserId),
    UnknownBunker(BunkerId),
    UnknownLog(LogId),
    UnknownUpload(UploadId),
    UnknownKey(String),
    KeyNotUsable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidCallsign => write!(f, "callsign must not be empty"),
            StoreError::CallsignTaken(call) => write!(f, "callsign {call} already registered"),
            StoreError::DuplicateBunker(reference) => {
                write!(f, "bunker {reference} already registered")
            }
            StoreError::DuplicateContact => write!(f, "contact already logged"),
            StoreError::UnknownUser(id) => write!(f, "unknown user {}", id.0),
            StoreError::UnknownBunker(id) => write!(f, "unknown bunker {}", id.0),
            StoreError::UnknownLog(id) => write!(f, "unknown activation log {}", id.0),
            StoreError::UnknownUpload(id) => write!(f, "unknown upload {}", id.0),
            StoreError::UnknownKey(key) => write!(f, "unknown activation key {key}"),
            StoreError::KeyNotUsable(key) => write!(f, "activation key {key} not usable"),
        }
    }
}

impl std::error::Error for StoreError {}

/// In-memory tables for everything the engine persists. All multi-step
/// operations validate before the first write, so an error means no state
/// changed.
#[derive(Debug, Default, Clone)]
pub struct Store {
    users: BTreeMap<UserId, User>,
    callsigns: HashMap<String, UserId>,
    bunkers: BTreeMap<BunkerId, Bunker>,
    bunker_refs: HashMap<BunkerRef, BunkerId>,
    logs: BTreeMap<LogId, ActivationLog>,
    log_keys: HashSet<(UserId, BunkerId, UserId, DateTime<Utc>)>,
    uploads: BTreeMap<UploadId, LogUpload>,
    activation_keys: HashMap<String, ActivationKey>,
    stats: BTreeMap<UserId, UserStatistics>,
    diploma_types: BTreeMap<DiplomaTypeId, DiplomaType>,
    diploma_progress: BTreeMap<(UserId, DiplomaTypeId), DiplomaProgress>,
    diplomas: BTreeMap<DiplomaId, Diploma>,
    verifications: Vec<VerificationEvent>,
    pub ledger: Ledger,
    next_user: u64,
    next_bunker: u64,
    next_log: u64,
    next_upload: u64,
    next_diploma_type: u64,
    next_diploma: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- users ----

    /// Registers a user and provisions their statistics row in the same
    /// step. Statistics exist exactly as long as the user does.
    pub fn create_user(
        &mut self,
        callsign: Callsign,
        email: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<UserId, StoreError> {
        self.insert_user(callsign, email.into(), true, false, now)
    }

    fn insert_user(
        &mut self,
        callsign: Callsign,
        email: String,
        is_active: bool,
        auto_created: bool,
        now: DateTime<Utc>,
    ) -> Result<UserId, StoreError> {
        if callsign.is_empty() {
            return Err(StoreError::InvalidCallsign);
        }
        if self.callsigns.contains_key(callsign.as_str()) {
            return Err(StoreError::CallsignTaken(callsign.as_str().to_string()));
        }
        self.next_user += 1;
        let id = UserId(self.next_user);
        self.callsigns.insert(callsign.as_str().to_string(), id);
        self.users.insert(
            id,
            User {
                id,
                callsign,
                email,
                is_active,
                is_staff: false,
                auto_created,
                joined_at: now,
            },
        );
        self.stats.insert(id, UserStatistics::new(id, now));
        Ok(id)
    }

    pub fn promote_to_staff(&mut self, user: UserId) -> Result<(), StoreError> {
        let user = self
            .users
            .get_mut(&user)
            .ok_or(StoreError::UnknownUser(user))?;
        user.is_staff = true;
        Ok(())
    }

    /// Resolves a hunter callsign, registering a placeholder account on a
    /// miss: inactive, flagged auto-created, with a non-routable address.
    /// Returns the id and whether a new account was created.
    pub fn get_or_create_hunter(
        &mut self,
        callsign: &Callsign,
        now: DateTime<Utc>,
    ) -> Result<(UserId, bool), StoreError> {
        if let Some(id) = self.callsigns.get(callsign.as_str()) {
            return Ok((*id, false));
        }
        let email = format!("{}@temp.bota.invalid", callsign.as_str().to_ascii_lowercase());
        let id = self.insert_user(callsign.clone(), email, false, true, now)?;
        Ok((id, true))
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn user_by_callsign(&self, callsign: &Callsign) -> Option<&User> {
        self.callsigns
            .get(callsign.as_str())
            .and_then(|id| self.users.get(id))
    }

    // ---- bunkers ----

    pub fn add_bunker(
        &mut self,
        reference: BunkerRef,
        name: impl Into<String>,
    ) -> Result<BunkerId, StoreError> {
        if self.bunker_refs.contains_key(&reference) {
            return Err(StoreError::DuplicateBunker(reference.as_str().to_string()));
        }
        self.next_bunker += 1;
        let id = BunkerId(self.next_bunker);
        self.bunker_refs.insert(reference.clone(), id);
        self.bunkers.insert(
            id,
            Bunker {
                id,
                reference,
                name: name.into(),
            },
        );
        Ok(id)
    }

    pub fn bunker(&self, id: BunkerId) -> Option<&Bunker> {
        self.bunkers.get(&id)
    }

    pub fn bunker_by_reference(&self, reference: &BunkerRef) -> Option<&Bunker> {
        self.bunker_refs
            .get(reference)
            .and_then(|id| self.bunkers.get(id))
    }

    // ---- contacts ----

    /// Inserts a contact, enforcing the one-record-per
    /// (user, bunker, activator, start time) boundary.
    pub fn insert_log(
        &mut self,
        new: NewActivationLog,
        now: DateTime<Utc>,
    ) -> Result<LogId, StoreError> {
        if !self.users.contains_key(&new.user) {
            return Err(StoreError::UnknownUser(new.user));
        }
        if !self.users.contains_key(&new.activator) {
            return Err(StoreError::UnknownUser(new.activator));
        }
        if !self.bunkers.contains_key(&new.bunker) {
            return Err(StoreError::UnknownBunker(new.bunker));
        }
        let key = (new.user, new.bunker, new.activator, new.started_at);
        if self.log_keys.contains(&key) {
            return Err(StoreError::DuplicateContact);
        }
        self.next_log += 1;
        let id = LogId(self.next_log);
        self.log_keys.insert(key);
        self.logs.insert(
            id,
            ActivationLog {
                id,
                user: new.user,
                activator: new.activator,
                bunker: new.bunker,
                partner_bunker: new.partner_bunker,
                activation_key: new.activation_key,
                upload: new.upload,
                started_at: new.started_at,
                ended_at: new.ended_at,
                mode: new.mode,
                band: new.band,
                freq_khz: new.freq_khz,
                is_b2b: new.is_b2b,
                b2b_confirmed: false,
                b2b_confirmed_at: None,
                b2b_partner: None,
                b2b_partner_log: None,
                points_awarded: false,
                points_transaction: None,
                verified: new.verified,
                notes: new.notes,
                created_at: now,
            },
        );
        Ok(id)
    }

    pub fn log(&self, id: LogId) -> Option<&ActivationLog> {
        self.logs.get(&id)
    }

    pub(crate) fn log_mut(&mut self, id: LogId) -> Option<&mut ActivationLog> {
        self.logs.get_mut(&id)
    }

    pub fn logs(&self) -> impl Iterator<Item = &ActivationLog> {
        self.logs.values()
    }

    /// Whether two contact records describe the same B2B pairing: either
    /// both sit on one bunker (two operators sharing a site) or each side's
    /// claimed partner bunker matches the other's actual bunker.
    pub fn bunker_pair_consistent(&self, a: &ActivationLog, b: &ActivationLog) -> bool {
        if a.bunker == b.bunker {
            return true;
        }
        let (Some(a_ref), Some(b_ref)) = (
            self.bunkers.get(&a.bunker).map(|bk| &bk.reference),
            self.bunkers.get(&b.bunker).map(|bk| &bk.reference),
        ) else {
            return false;
        };
        a.partner_bunker.as_ref() == Some(b_ref) && b.partner_bunker.as_ref() == Some(a_ref)
    }

    /// Searches for the reciprocal half of a B2B contact: roles swapped,
    /// also flagged B2B, a consistent bunker pairing, and logged within the
    /// confirmation window of this contact's start time.
    pub fn find_reciprocal_b2b(&self, current: &ActivationLog) -> Option<LogId> {
        self.logs
            .values()
            .find(|other| {
                other.id != current.id
                    && other.activator == current.user
                    && other.user == current.activator
                    && other.is_b2b
                    && (other.started_at - current.started_at).abs() <= B2B_WINDOW
                    && self.bunker_pair_consistent(current, other)
            })
            .map(|other| other.id)
    }

    // ---- aggregation over the contact log ----

    /// Recounts every contact-derived statistic in one pass. This is the
    /// explicit aggregation contract the cache reconciles against.
    pub fn contact_tallies(&self, user: UserId) -> ContactTallies {
        let mut tallies = ContactTallies::default();
        let mut activated: HashSet<BunkerId> = HashSet::new();
        let mut hunted: HashSet<BunkerId> = HashSet::new();
        for log in self.logs.values() {
            if log.activator == user {
                tallies.activator_qso += 1;
                activated.insert(log.bunker);
                if log.is_b2b {
                    tallies.activator_b2b_qso += 1;
                    if log.b2b_confirmed {
                        tallies.confirmed_b2b_qso += 1;
                    }
                }
            }
            if log.user == user && log.activator != user {
                tallies.hunter_qso += 1;
                hunted.insert(log.bunker);
            }
        }
        tallies.unique_bunkers_activated = activated.len() as u32;
        tallies.unique_bunkers_hunted = hunted.len() as u32;
        tallies
    }

    /// Distinct (bunker, UTC day) pairs worked as activator. One sitting at
    /// one bunker counts once no matter how many QSOs it produced.
    pub fn activation_sessions(&self, user: UserId) -> u32 {
        let mut sessions: HashSet<(BunkerId, chrono::NaiveDate)> = HashSet::new();
        for log in self.logs.values() {
            if log.activator == user {
                sessions.insert((log.bunker, log.started_at.date_naive()));
            }
        }
        sessions.len() as u32
    }

    // ---- statistics ----

    pub fn statistics(&self, user: UserId) -> Option<&UserStatistics> {
        self.stats.get(&user)
    }

    pub(crate) fn stats_mut(&mut self, user: UserId, now: DateTime<Utc>) -> &mut UserStatistics {
        self.stats
            .entry(user)
            .or_insert_with(|| UserStatistics::new(user, now))
    }

    /// Full rebuild of one user's cache row from the ledger and a fresh
    /// contact recount. Scheduled integrity job and on-demand admin action.
    pub fn reconcile_statistics(
        &mut self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.users.contains_key(&user) {
            return Err(StoreError::UnknownUser(user));
        }
        let sums = self.ledger.category_sums(user);
        let last = self.ledger.last_transaction_for(user);
        let tallies = self.contact_tallies(user);
        self.stats_mut(user, now).reconcile(sums, &tallies, last, now);
        Ok(())
    }

    // ---- uploads ----

    pub fn create_upload(
        &mut self,
        user: UserId,
        filename: impl Into<String>,
        file_format: impl Into<String>,
        checksum: impl Into<String>,
        now: DateTime<Utc>,
    ) -> UploadId {
        self.next_upload += 1;
        let id = UploadId(self.next_upload);
        self.uploads.insert(
            id,
            LogUpload {
                id,
                user,
                filename: filename.into(),
                file_format: file_format.into(),
                checksum: checksum.into(),
                status: UploadStatus::Processing,
                error_message: String::new(),
                qso_count: 0,
                processed_qso_count: 0,
                uploaded_at: now,
            },
        );
        id
    }

    pub fn upload(&self, id: UploadId) -> Option<&LogUpload> {
        self.uploads.get(&id)
    }

    pub(crate) fn upload_mut(&mut self, id: UploadId) -> Option<&mut LogUpload> {
        self.uploads.get_mut(&id)
    }

    /// Failed uploads do not block resubmission of the same content.
    pub fn has_upload_with_checksum(&self, user: UserId, checksum: &str) -> bool {
        self.uploads.values().any(|u| {
            u.user == user && u.checksum == checksum && u.status != UploadStatus::Failed
        })
    }

    // ---- activation keys ----

    pub fn issue_key(
        &mut self,
        bunker: BunkerId,
        assigned_to: Option<UserId>,
        valid_from: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        if !self.bunkers.contains_key(&bunker) {
            return Err(StoreError::UnknownBunker(bunker));
        }
        let mut key = ActivationKey::generate(12);
        while self.activation_keys.contains_key(&key) {
            key = ActivationKey::generate(12);
        }
        self.activation_keys.insert(
            key.clone(),
            ActivationKey {
                key: key.clone(),
                bunker,
                assigned_to,
                valid_from,
                valid_until,
                is_active: true,
                max_uses,
                times_used: 0,
                created_by,
                created_at: now,
            },
        );
        Ok(key)
    }

    pub fn activation_key(&self, key: &str) -> Option<&ActivationKey> {
        self.activation_keys.get(key)
    }

    /// Manual key-based check-in: records a self-contact at the key's
    /// bunker and consumes one use of the key.
    pub fn check_in(
        &mut self,
        key: &str,
        user: UserId,
        mode: impl Into<String>,
        band: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<LogId, StoreError> {
        if !self.users.contains_key(&user) {
            return Err(StoreError::UnknownUser(user));
        }
        let entry = self
            .activation_keys
            .get(key)
            .ok_or_else(|| StoreError::UnknownKey(key.to_string()))?;
        if !entry.can_be_used_by(user, now) {
            return Err(StoreError::KeyNotUsable(key.to_string()));
        }
        let bunker = entry.bunker;
        let mut new = NewActivationLog::new(user, user, bunker, now);
        new.activation_key = Some(key.to_string());
        new.mode = mode.into();
        new.band = band.into();
        new.notes = "Key check-in".to_string();
        let log = self.insert_log(new, now)?;
        if let Some(entry) = self.activation_keys.get_mut(key) {
            entry.times_used += 1;
        }
        Ok(log)
    }

    // ---- diplomas ----

    pub fn add_diploma_type(&mut self, definition: DiplomaType) -> DiplomaTypeId {
        self.next_diploma_type += 1;
        let id = DiplomaTypeId(self.next_diploma_type);
        self.diploma_types.insert(id, definition);
        id
    }

    pub fn load_catalog(&mut self, catalog: DiplomaCatalog) -> Vec<DiplomaTypeId> {
        catalog
            .diplomas
            .into_iter()
            .map(|definition| self.add_diploma_type(definition))
            .collect()
    }

    pub fn diploma_type(&self, id: DiplomaTypeId) -> Option<&DiplomaType> {
        self.diploma_types.get(&id)
    }

    pub fn diploma_types(&self) -> impl Iterator<Item = (DiplomaTypeId, &DiplomaType)> {
        self.diploma_types.iter().map(|(id, dt)| (*id, dt))
    }

    pub fn active_diploma_type_ids(&self) -> Vec<DiplomaTypeId> {
        self.diploma_types
            .iter()
            .filter(|(_, dt)| dt.is_active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn progress(&self, user: UserId, diploma_type: DiplomaTypeId) -> Option<&DiplomaProgress> {
        self.diploma_progress.get(&(user, diploma_type))
    }

    pub(crate) fn ensure_progress(
        &mut self,
        user: UserId,
        diploma_type: DiplomaTypeId,
        now: DateTime<Utc>,
    ) -> &mut DiplomaProgress {
        self.diploma_progress
            .entry((user, diploma_type))
            .or_insert_with(|| DiplomaProgress::new(user, diploma_type, now))
    }

    pub fn has_diploma(&self, user: UserId, diploma_type: DiplomaTypeId) -> bool {
        self.diplomas
            .values()
            .any(|d| d.user == user && d.diploma_type == diploma_type)
    }

    pub fn diploma(&self, id: DiplomaId) -> Option<&Diploma> {
        self.diplomas.get(&id)
    }

    pub fn diplomas(&self) -> impl Iterator<Item = &Diploma> {
        self.diplomas.values()
    }

    pub fn diploma_by_serial(&self, serial: &str) -> Option<&Diploma> {
        let wanted = serial.trim().to_ascii_uppercase();
        self.diplomas.values().find(|d| d.serial == wanted)
    }

    pub fn diploma_by_code(&self, code: Uuid) -> Option<&Diploma> {
        self.diplomas.values().find(|d| d.verification_code == code)
    }

    pub fn diplomas_issued_in(&self, category: DiplomaCategory, year: i32) -> u32 {
        self.diplomas
            .values()
            .filter(|d| d.category == category && d.issued_at.year() == year)
            .count() as u32
    }

    pub(crate) fn insert_diploma(&mut self, build: impl FnOnce(DiplomaId) -> Diploma) -> DiplomaId {
        self.next_diploma += 1;
        let id = DiplomaId(self.next_diploma);
        self.diplomas.insert(id, build(id));
        id
    }

    pub(crate) fn record_verification(&mut self, event: VerificationEvent) {
        self.verifications.push(event);
    }

    pub fn verifications(&self) -> &[VerificationEvent] {
        &self.verifications
    }
}
