use crate::store::Store;
use crate::types::{DiplomaId, DiplomaTypeId, UserId};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiplomaCategory {
    Hunter,
    Activator,
    B2b,
    SpecialEvent,
    Cluster,
    Other,
}

impl DiplomaCategory {
    /// Three-letter code used in serial numbers.
    pub fn serial_code(&self) -> &'static str {
        match self {
            DiplomaCategory::Hunter => "HNT",
            DiplomaCategory::Activator => "ACT",
            DiplomaCategory::B2b => "B2B",
            DiplomaCategory::SpecialEvent => "SPE",
            DiplomaCategory::Cluster => "CLU",
            DiplomaCategory::Other => "OTH",
        }
    }
}

/// Threshold dimensions. A zero minimum means the dimension is unset and
/// takes no part in progress or eligibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiplomaRequirements {
    pub min_activator_points: u32,
    pub min_hunter_points: u32,
    pub min_b2b_points: u32,
    pub min_unique_activations: u32,
    pub min_total_activations: u32,
    pub min_unique_hunted: u32,
    pub min_total_hunted: u32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiplomaType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: DiplomaCategory,
    #[serde(default)]
    pub requirements: DiplomaRequirements,
    #[serde(default)]
    pub valid_from: Option<NaiveDate>,
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub display_order: i32,
}

impl DiplomaType {
    pub fn is_time_limited(&self) -> bool {
        self.valid_from.is_some() || self.valid_to.is_some()
    }

    pub fn is_currently_valid(&self, today: NaiveDate) -> bool {
        if let Some(from) = self.valid_from {
            if today < from {
                return false;
            }
        }
        if let Some(to) = self.valid_to {
            if today > to {
                return false;
            }
        }
        true
    }
}

/// Diploma type definitions as loaded from a catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiplomaCatalog {
    pub diplomas: Vec<DiplomaType>,
}

impl DiplomaCatalog {
    pub fn from_yaml_str(input: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }

    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, String> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .map_err(|e| format!("failed to read {}: {}", path_ref.display(), e))?;
        let ext = path_ref
            .extension()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => {
                Self::from_yaml_str(&raw).map_err(|e| format!("yaml parse failed: {}", e))
            }
            "json" => Self::from_json_str(&raw).map_err(|e| format!("json parse failed: {}", e)),
            _ => Err(format!(
                "unsupported catalog extension '{}'; expected .yaml/.yml/.json",
                ext
            )),
        }
    }
}

/// Per-(user, diploma type) snapshot of the threshold dimensions. Derived
/// from current statistics on demand; never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiplomaProgress {
    pub user: UserId,
    pub diploma_type: DiplomaTypeId,
    pub activator_points: u32,
    pub hunter_points: u32,
    pub b2b_points: u32,
    pub unique_activations: u32,
    pub total_activations: u32,
    pub unique_hunted: u32,
    pub total_hunted: u32,
    pub percentage_complete: f64,
    pub is_eligible: bool,
    pub updated_at: DateTime<Utc>,
}

/// Partial update: only supplied dimensions are overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressUpdate {
    pub activator_points: Option<u32>,
    pub hunter_points: Option<u32>,
    pub b2b_points: Option<u32>,
    pub unique_activations: Option<u32>,
    pub total_activations: Option<u32>,
    pub unique_hunted: Option<u32>,
    pub total_hunted: Option<u32>,
}

impl DiplomaProgress {
    pub fn new(user: UserId, diploma_type: DiplomaTypeId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            diploma_type,
            activator_points: 0,
            hunter_points: 0,
            b2b_points: 0,
            unique_activations: 0,
            total_activations: 0,
            unique_hunted: 0,
            total_hunted: 0,
            percentage_complete: 0.0,
            is_eligible: false,
            updated_at: now,
        }
    }

    pub fn update_points(
        &mut self,
        update: ProgressUpdate,
        definition: &DiplomaType,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) {
        if let Some(v) = update.activator_points {
            self.activator_points = v;
        }
        if let Some(v) = update.hunter_points {
            self.hunter_points = v;
        }
        if let Some(v) = update.b2b_points {
            self.b2b_points = v;
        }
        if let Some(v) = update.unique_activations {
            self.unique_activations = v;
        }
        if let Some(v) = update.total_activations {
            self.total_activations = v;
        }
        if let Some(v) = update.unique_hunted {
            self.unique_hunted = v;
        }
        if let Some(v) = update.total_hunted {
            self.total_hunted = v;
        }
        self.calculate_progress(definition, today);
        self.updated_at = now;
    }

    /// Percentage is the unweighted average of the active dimensions'
    /// progress; eligibility requires every active dimension to be met on
    /// its own. Outside a time-limited window the diploma is frozen
    /// un-earnable regardless of the stored values.
    pub fn calculate_progress(&mut self, definition: &DiplomaType, today: NaiveDate) -> f64 {
        if definition.is_time_limited() && !definition.is_currently_valid(today) {
            self.percentage_complete = 0.0;
            self.is_eligible = false;
            return 0.0;
        }

        let req = &definition.requirements;
        let dimensions = [
            (self.activator_points, req.min_activator_points),
            (self.hunter_points, req.min_hunter_points),
            (self.b2b_points, req.min_b2b_points),
            (self.unique_activations, req.min_unique_activations),
            (self.total_activations, req.min_total_activations),
            (self.unique_hunted, req.min_unique_hunted),
            (self.total_hunted, req.min_total_hunted),
        ];

        let mut percentages = Vec::new();
        let mut all_met = true;
        for (current, required) in dimensions {
            if required == 0 {
                continue;
            }
            let pct = (current as f64 / required as f64 * 100.0).min(100.0);
            percentages.push(pct);
            if current < required {
                all_met = false;
            }
        }

        if percentages.is_empty() {
            self.percentage_complete = 100.0;
            self.is_eligible = true;
            return 100.0;
        }

        let avg = percentages.iter().sum::<f64>() / percentages.len() as f64;
        self.percentage_complete = (avg * 100.0).round() / 100.0;
        self.is_eligible = all_met;
        self.percentage_complete
    }
}

/// Issued award. Immutable once created; one per (diploma type, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diploma {
    pub id: DiplomaId,
    pub diploma_type: DiplomaTypeId,
    pub category: DiplomaCategory,
    pub user: UserId,
    pub issued_at: DateTime<Utc>,
    pub serial: String,
    pub verification_code: Uuid,
    pub activator_points_earned: u32,
    pub hunter_points_earned: u32,
    pub b2b_points_earned: u32,
    pub issued_by: Option<UserId>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Number,
    Code,
    Qr,
    Manual,
}

/// Append-only record of a successful diploma lookup. Audit only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub diploma: DiplomaId,
    pub at: DateTime<Utc>,
    pub method: VerificationMethod,
    pub actor: Option<UserId>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiplomaError {
    UnknownType(DiplomaTypeId),
    UnknownUser(UserId),
    AlreadyIssued {
        user: UserId,
        diploma_type: DiplomaTypeId,
    },
}

impl std::fmt::Display for DiplomaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiplomaError::UnknownType(id) => write!(f, "unknown diploma type {}", id.0),
            DiplomaError::UnknownUser(id) => write!(f, "unknown user {}", id.0),
            DiplomaError::AlreadyIssued { user, diploma_type } => write!(
                f,
                "diploma type {} already issued to user {}",
                diploma_type.0, user.0
            ),
        }
    }
}

impl std::error::Error for DiplomaError {}

/// Issues a diploma with the next serial in its category and year. Serial
/// assignment and the insert happen in one store mutation, so two issuances
/// can never race to the same number.
pub fn issue_diploma(
    store: &mut Store,
    diploma_type: DiplomaTypeId,
    user: UserId,
    issued_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<DiplomaId, DiplomaError> {
    let definition = store
        .diploma_type(diploma_type)
        .ok_or(DiplomaError::UnknownType(diploma_type))?;
    let category = definition.category;
    let name = definition.name.clone();
    if store.has_diploma(user, diploma_type) {
        return Err(DiplomaError::AlreadyIssued { user, diploma_type });
    }
    let year = now.year();
    let sequence = store.diplomas_issued_in(category, year) + 1;
    let serial = format!("{}-{}-{:04}", category.serial_code(), year, sequence);
    let snapshot = store.progress(user, diploma_type);
    let (activator, hunter, b2b) = snapshot
        .map(|p| (p.activator_points, p.hunter_points, p.b2b_points))
        .unwrap_or((0, 0, 0));
    let id = store.insert_diploma(|id| Diploma {
        id,
        diploma_type,
        category,
        user,
        issued_at: now,
        serial: serial.clone(),
        verification_code: Uuid::new_v4(),
        activator_points_earned: activator,
        hunter_points_earned: hunter,
        b2b_points_earned: b2b,
        issued_by,
        notes: String::new(),
    });
    tracing::info!(serial = %serial, user = user.0, name = %name, "issued diploma");
    Ok(id)
}

/// Recomputes progress for every active diploma type from the user's
/// current statistics and direct contact counts, issuing any diploma that
/// became eligible and is not yet held. Returns the newly issued ids.
pub fn refresh_user(
    store: &mut Store,
    user: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<DiplomaId>, DiplomaError> {
    let stats = store
        .statistics(user)
        .ok_or(DiplomaError::UnknownUser(user))?
        .clone();
    let sessions = store.activation_sessions(user);
    let tallies = store.contact_tallies(user);
    let today = now.date_naive();
    let mut issued = Vec::new();

    for type_id in store.active_diploma_type_ids() {
        let Some(definition) = store.diploma_type(type_id).cloned() else {
            continue;
        };
        if definition.is_time_limited() && !definition.is_currently_valid(today) {
            continue;
        }
        // Activator progress counts sessions, not raw QSOs: one sitting at
        // one bunker advances an activator diploma by one.
        let update = ProgressUpdate {
            activator_points: Some(sessions),
            hunter_points: Some(stats.total_hunter_qso),
            b2b_points: Some(stats.confirmed_b2b_qso),
            unique_activations: Some(stats.unique_bunkers_activated),
            total_activations: Some(sessions),
            unique_hunted: Some(tallies.unique_bunkers_hunted),
            total_hunted: Some(tallies.unique_bunkers_hunted),
        };
        let progress = store.ensure_progress(user, type_id, now);
        progress.update_points(update, &definition, today, now);
        let eligible = progress.is_eligible;
        if eligible && !store.has_diploma(user, type_id) {
            issued.push(issue_diploma(store, type_id, user, None, now)?);
        }
    }
    Ok(issued)
}

/// Looks a diploma up by serial number or verification code. Every hit is
/// recorded as a verification event; a miss records nothing.
pub fn verify_diploma(
    store: &mut Store,
    query: &str,
    method: VerificationMethod,
    actor: Option<UserId>,
    ip: Option<String>,
    now: DateTime<Utc>,
) -> Option<DiplomaId> {
    let trimmed = query.trim();
    let found = store
        .diploma_by_serial(trimmed)
        .map(|d| d.id)
        .or_else(|| {
            Uuid::parse_str(trimmed)
                .ok()
                .and_then(|code| store.diploma_by_code(code))
                .map(|d| d.id)
        });
    if let Some(diploma) = found {
        store.record_verification(VerificationEvent {
            diploma,
            at: now,
            method,
            actor,
            ip,
        });
    }
    found
}
