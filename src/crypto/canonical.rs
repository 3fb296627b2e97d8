// Canonical encoding for signed payloads
//
// Compact JSON of plain structs: fields in declaration order, no maps, integers
// only, lowercase hex for digests, UTC RFC 3339 timestamps with microseconds.
// The same payload value always yields the same bytes.

use crate::{EngineError, EngineResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub fn canonical_bytes<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| EngineError::InvalidAttestation(format!("payload not encodable: {}", e)))
}

/// `2026-10-19T08:15:00.123456Z`
pub fn canonical_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
