//! Core engine for a bunkers-on-the-air awards program: an append-only
//! points ledger with per-user cached statistics, an ADIF log import
//! pipeline with cross-log bunker-to-bunker confirmation, and a diploma
//! eligibility engine with serialized award numbering.

pub mod adif;
pub mod diploma;
pub mod import;
pub mod ledger;
pub mod points;
pub mod stats;
pub mod store;
pub mod types;
