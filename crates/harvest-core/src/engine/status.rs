//! Decoder for the engine's machine-readable status lines.
//!
//! The engine interleaves log text with JSON status objects, sometimes on
//! the same line. [`parse`] finds the first JSON object in a line that looks
//! like a status report and maps it onto a [`ProgressSnapshot`]. Anything
//! else yields `None`.

use serde_json::{Map, Value};

/// Coarse engine state reported in a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Running,
    Exhausted,
    Recovered,
    Error,
}

impl LifecycleState {
    fn from_code(code: u64) -> Self {
        match code {
            5 => Self::Exhausted,
            6 => Self::Recovered,
            7 | 10 | 11 | 13 => Self::Error,
            _ => Self::Running,
        }
    }

    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "exhausted" => Self::Exhausted,
            "cracked" | "recovered" => Self::Recovered,
            "aborted" | "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

/// One compute device in a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceReading {
    /// Candidates per second
    pub speed: u64,
    /// Degrees Celsius; engines report -1 when the sensor is unavailable
    pub temperature: i64,
    /// Percent
    pub utilization: u64,
}

/// Point-in-time progress of an engine run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub engine_session_name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub progress_numerator: u64,
    /// Zero when the engine does not know the total yet
    pub progress_denominator: u64,
    /// (recovered items, recovered subgroups)
    pub recovered_count: (u64, u64),
    pub devices: Vec<DeviceReading>,
}

impl ProgressSnapshot {
    /// Completed fraction in `0.0..=1.0`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.progress_denominator == 0 {
            return None;
        }
        Some((self.progress_numerator as f64 / self.progress_denominator as f64).min(1.0))
    }

    /// Combined speed of all devices.
    pub fn total_speed(&self) -> u64 {
        self.devices.iter().map(|d| d.speed).sum()
    }

    pub fn recovered(&self) -> u64 {
        self.recovered_count.0
    }
}

const STATUS_KEYS: &[&str] = &["progress", "recovered", "recovered_hashes", "status"];

/// Parses one line of engine output.
///
/// Never fails: lines without a recognisable status object return `None`.
pub fn parse(line: &str) -> Option<ProgressSnapshot> {
    line.match_indices('{')
        .filter_map(|(start, _)| first_object(&line[start..]))
        .find(|obj| STATUS_KEYS.iter().any(|key| obj.contains_key(*key)))
        .map(|obj| snapshot_from(&obj))
}

/// Decodes the JSON object at the start of `text`, ignoring whatever follows.
fn first_object(text: &str) -> Option<Map<String, Value>> {
    let mut values = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match values.next() {
        Some(Ok(Value::Object(map))) => Some(map),
        _ => None,
    }
}

fn snapshot_from(obj: &Map<String, Value>) -> ProgressSnapshot {
    let (progress_numerator, progress_denominator) = pair(obj.get("progress"));
    let recovered_count = pair(obj.get("recovered_hashes").or_else(|| obj.get("recovered")));

    let lifecycle_state = match obj.get("status") {
        Some(Value::String(label)) => LifecycleState::from_label(label),
        Some(other) => uint(Some(other)).map_or(LifecycleState::Running, LifecycleState::from_code),
        None => LifecycleState::Running,
    };

    let devices = obj
        .get("devices")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_object).map(device_from).collect())
        .unwrap_or_default();

    ProgressSnapshot {
        engine_session_name: obj.get("session").and_then(Value::as_str).map(str::to_string),
        lifecycle_state,
        progress_numerator,
        progress_denominator,
        recovered_count,
        devices,
    }
}

fn device_from(obj: &Map<String, Value>) -> DeviceReading {
    DeviceReading {
        speed: uint(obj.get("speed")).unwrap_or(0),
        temperature: int(obj.get("temp").or_else(|| obj.get("temperature"))).unwrap_or(0),
        utilization: uint(obj.get("util").or_else(|| obj.get("utilization"))).unwrap_or(0),
    }
}

fn pair(value: Option<&Value>) -> (u64, u64) {
    match value.and_then(Value::as_array).map(Vec::as_slice) {
        Some([first, second, ..]) => (uint(Some(first)).unwrap_or(0), uint(Some(second)).unwrap_or(0)),
        Some([first]) => (uint(Some(first)).unwrap_or(0), 0),
        _ => (0, 0),
    }
}

// Engines disagree on number encoding, so accept integers, floats and
// numeric strings alike.
fn uint(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_garbage_is_skipped() {
        assert_eq!(parse("garbage text"), None);
        assert_eq!(parse(""), None);
        assert_eq!(parse("{not json"), None);
        assert_eq!(parse(r#"{"unrelated": 1}"#), None);
    }

    #[test]
    fn test_prefixed_payload() {
        let snap = parse(r#"prefix {"progress":[10,100],"recovered":[0,0]}"#).unwrap();
        assert_eq!(snap.progress_numerator, 10);
        assert_eq!(snap.progress_denominator, 100);
        assert_eq!(snap.recovered(), 0);
        assert_eq!(snap.lifecycle_state, LifecycleState::Running);
        assert!(snap.devices.is_empty());
    }

    #[test]
    fn test_full_status_line() {
        let line = r#"{ "session": "harvest_abc", "guess": {}, "status": 3, "target": "hashes.txt",
            "progress": [2113, 56800235584], "restore_point": 0,
            "recovered_hashes": [1, 4], "recovered_salts": [1, 4],
            "devices": [ { "device_id": 1, "speed": 1200, "temp": 61, "util": 98 },
                         { "device_id": 2, "speed": "800", "temp": -1, "util": 97.0 } ] }"#;
        let snap = parse(line).unwrap();

        assert_eq!(snap.engine_session_name.as_deref(), Some("harvest_abc"));
        assert_eq!(snap.recovered_count, (1, 4));
        assert_eq!(snap.progress_denominator, 56_800_235_584);
        assert_eq!(snap.devices.len(), 2);
        assert_eq!(snap.devices[1].temperature, -1);
        assert_eq!(snap.devices[1].utilization, 97);
        assert_eq!(snap.total_speed(), 2000);
    }

    #[test]
    fn test_trailing_text_and_earlier_braces() {
        let snap = parse(r#"[log {x}] {"progress":[1,2]} trailing"#).unwrap();
        assert_eq!(snap.progress_numerator, 1);
        assert_eq!(snap.recovered_count, (0, 0));
    }

    #[test]
    fn test_status_codes() {
        let state = |code: &str| parse(&format!(r#"{{"status":{code}}}"#)).unwrap().lifecycle_state;
        assert_eq!(state("3"), LifecycleState::Running);
        assert_eq!(state("5"), LifecycleState::Exhausted);
        assert_eq!(state("6"), LifecycleState::Recovered);
        assert_eq!(state("13"), LifecycleState::Error);
        assert_eq!(state(r#""Exhausted""#), LifecycleState::Exhausted);
    }

    #[test]
    fn test_unknown_total() {
        let snap = parse(r#"{"progress":[5,0]}"#).unwrap();
        assert_eq!(snap.fraction(), None);

        let snap = parse(r#"{"progress":[50,200]}"#).unwrap();
        assert_eq!(snap.fraction(), Some(0.25));
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in ".*") {
            let _ = parse(&line);
        }

        #[test]
        fn parse_reads_any_progress_pair(a in any::<u32>(), b in any::<u32>(), prefix in "[a-z :]{0,20}") {
            let snap = parse(&format!(r#"{prefix}{{"progress":[{a},{b}]}}"#)).unwrap();
            prop_assert_eq!(snap.progress_numerator, a as u64);
            prop_assert_eq!(snap.progress_denominator, b as u64);
        }
    }
}
