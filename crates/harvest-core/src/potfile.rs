//! Reader for the engine's result sink.
//!
//! Each line is `<identifier>:<secret>`. Identifiers can contain `:`
//! themselves, so lines are split at the last one. Secrets the engine could
//! not print verbatim are written as `$HEX[...]` and decoded here.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::storage::StorageError;

/// One recovered secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PotEntry {
    pub identifier: String,
    pub secret: String,
}

/// Parses one potfile line. Blank and separator-less lines yield `None`.
pub fn parse_line(line: &str) -> Option<PotEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (identifier, secret) = line.rsplit_once(':')?;
    if identifier.is_empty() {
        return None;
    }

    Some(PotEntry {
        identifier: identifier.to_string(),
        secret: decode_secret(secret),
    })
}

fn decode_secret(raw: &str) -> String {
    raw.strip_prefix("$HEX[")
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|digits| hex::decode(digits).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|| raw.to_string())
}

/// Reads every entry of a potfile. A missing file has no entries.
pub fn read_potfile(path: &Path) -> Result<Vec<PotEntry>, StorageError> {
    if !path.exists() {
        debug!(path = %path.display(), "No potfile yet");
        return Ok(Vec::new());
    }

    let bytes = fs::read(path).map_err(|e| StorageError::io(path, e))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.lines().filter_map(parse_line).collect())
}
