//! Status map codec: the map travels as a JSON array of entries in the
//! version set's metadata bag.

use crate::core::errors::{GateError, Result};
use crate::model::version_set::VersionSet;
use crate::status::map::{StatusMap, StatusMapEntry};

/// Decode a stored payload. An absent payload is an empty map; a present one
/// that does not parse is [`GateError::CorruptState`], never an empty map.
pub fn decode(version_set: &str, payload: Option<&str>) -> Result<StatusMap> {
    let Some(raw) = payload else {
        return Ok(StatusMap::new());
    };
    let corrupt = |details: String| GateError::CorruptState {
        version_set: version_set.to_string(),
        details,
    };
    let entries: Vec<StatusMapEntry> =
        serde_json::from_str(raw).map_err(|error| corrupt(error.to_string()))?;
    StatusMap::from_entries(entries).map_err(corrupt)
}

/// Encode entries ordered by scenario name.
pub fn encode(map: &StatusMap) -> Result<String> {
    let entries: Vec<&StatusMapEntry> = map.iter().collect();
    Ok(serde_json::to_string(&entries)?)
}

/// Decode the map stored on a version set.
pub fn read_from(version_set: &VersionSet) -> Result<StatusMap> {
    decode(&version_set.id, version_set.status_payload())
}

/// Encode `map` onto a version set.
pub fn write_to(version_set: &mut VersionSet, map: &StatusMap) -> Result<()> {
    let payload = encode(map)?;
    version_set.set_status_payload(payload);
    Ok(())
}
