//! Parsing of ADIF (.adi) log files: `<NAME:length>value` tagged fields,
//! records terminated by `<EOR>`, an optional header closed by `<EOH>`.

use crate::types::{BunkerRef, Callsign};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub type FieldMap = HashMap<String, String>;

/// The program identifier the other station must send for a contact to
/// count as bunker-to-bunker.
pub const B2B_SIG: &str = "WWBOTA";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLog {
    pub header: FieldMap,
    pub contacts: Vec<FieldMap>,
}

#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Splits the input into header and records and extracts the field map of
/// every record. A record without a callsign field is dropped as malformed.
pub fn parse(text: &str) -> ParsedLog {
    let (header, records_text) = match text.split_once("<EOH>") {
        Some((header_text, rest)) => (parse_fields(header_text), rest),
        None => (FieldMap::new(), text),
    };

    let mut contacts = Vec::new();
    for record in records_text.split("<EOR>") {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let fields = parse_fields(record);
        if fields.contains_key("CALL") {
            contacts.push(fields);
        }
    }

    ParsedLog { header, contacts }
}

/// Scans `<NAME:length>value` tags. Field names are uppercased, values
/// trimmed and truncated to the declared length; a tag without a length
/// (`<EOR>`, `<EOH>`) is not a data field and is skipped.
fn parse_fields(text: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find('>') else {
            break;
        };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        let mut parts = tag.splitn(3, ':');
        let name = parts.next().unwrap_or("");
        let Some(declared) = parts.next().and_then(|len| len.trim().parse::<usize>().ok())
        else {
            continue;
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }

        let value_end = rest.find('<').unwrap_or(rest.len());
        let value: String = rest[..value_end].chars().take(declared).collect();
        fields.insert(name.to_ascii_uppercase(), value.trim().to_string());
    }
    fields
}

impl ParsedLog {
    pub fn count(&self) -> usize {
        self.contacts.len()
    }

    /// First contact whose own signal-info field carries a well-formed
    /// bunker reference.
    pub fn bunker_reference(&self) -> Option<BunkerRef> {
        self.contacts
            .iter()
            .find_map(|contact| contact.get("MY_SIG_INFO").and_then(|v| BunkerRef::parse(v)))
    }

    /// Operator or station callsign, preferring the header and falling back
    /// to the first record.
    pub fn activator_callsign(&self) -> Option<Callsign> {
        let from = |fields: &FieldMap| {
            fields
                .get("OPERATOR")
                .or_else(|| fields.get("STATION_CALLSIGN"))
                .map(Callsign::new)
                .filter(|call| !call.is_empty())
        };
        from(&self.header).or_else(|| self.contacts.first().and_then(from))
    }

    /// Distinct worked callsigns, sorted.
    pub fn hunter_callsigns(&self) -> Vec<Callsign> {
        let mut calls = BTreeSet::new();
        for contact in &self.contacts {
            if let Some(raw) = contact.get("CALL") {
                let call = Callsign::new(raw);
                if !call.is_empty() {
                    calls.insert(call);
                }
            }
        }
        calls.into_iter().collect()
    }

    /// Structural validation for import. Collects every problem instead of
    /// stopping at the first; does not mutate anything.
    pub fn validate(&self) -> LogValidation {
        let mut errors = Vec::new();

        if self.bunker_reference().is_none() {
            errors.push("No valid bunker reference found (MY_SIG_INFO field)".to_string());
        }
        if self.activator_callsign().is_none() {
            errors.push(
                "No activator callsign found (OPERATOR or STATION_CALLSIGN field)".to_string(),
            );
        }
        if self.contacts.is_empty() {
            errors.push("No QSO records found in file".to_string());
        }
        for (index, contact) in self.contacts.iter().enumerate() {
            let number = index + 1;
            if !contact.contains_key("CALL") {
                errors.push(format!("QSO {number}: Missing CALL field"));
            }
            if !contact.contains_key("QSO_DATE") {
                errors.push(format!("QSO {number}: Missing QSO_DATE field"));
            }
            if !contact.contains_key("TIME_ON") {
                errors.push(format!("QSO {number}: Missing TIME_ON field"));
            }
        }

        LogValidation {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Combines the 8-digit date and 4-6 digit time fields into a UTC
/// timestamp. Returns `None` on any malformed input.
pub fn contact_datetime(contact: &FieldMap) -> Option<DateTime<Utc>> {
    let date = contact.get("QSO_DATE")?.trim();
    let mut time = contact.get("TIME_ON")?.trim().to_string();
    while time.len() < 6 {
        time.push('0');
    }
    let stamp = format!("{date}{time}");
    NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// A contact is bunker-to-bunker only when the other station sent the
/// program identifier and a well-formed bunker reference of their own.
pub fn is_b2b_contact(contact: &FieldMap) -> bool {
    let Some(sig) = contact.get("SIG") else {
        return false;
    };
    if !sig.trim().eq_ignore_ascii_case(B2B_SIG) {
        return false;
    }
    partner_bunker(contact).is_some()
}

/// The bunker the other station claimed to be at.
pub fn partner_bunker(contact: &FieldMap) -> Option<BunkerRef> {
    contact.get("SIG_INFO").and_then(|v| BunkerRef::parse(v))
}

pub fn contact_mode(contact: &FieldMap) -> String {
    contact
        .get("MODE")
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

pub fn contact_band(contact: &FieldMap) -> String {
    contact
        .get("BAND")
        .map(|b| b.to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Frequency in kHz, derived from the MHz `FREQ` field.
pub fn contact_freq_khz(contact: &FieldMap) -> Option<u32> {
    contact
        .get("FREQ")
        .and_then(|f| f.trim().parse::<f64>().ok())
        .map(|mhz| (mhz * 1000.0).round() as u32)
}
