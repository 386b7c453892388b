#![forbid(unsafe_code)]

//! Structured records for trace tests. Each record names the trace
//! configuration a test ran under and the guard keys its traces produced,
//! so a failing line on stderr can be replayed under the same flags.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use vt_core::TraceConfig;

pub const TRACE_TEST_LOG_SCHEMA: &str = "vtrace.trace-test.v1";

/// Guard keys beyond this many are counted but not listed.
const MAX_LISTED_GUARD_KEYS: usize = 4;

/// Coarse label for the configuration, for filtering logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceProfile {
    Static,
    Dynamic,
    Export,
}

impl TraceProfile {
    #[must_use]
    pub fn of(config: &TraceConfig) -> Self {
        if config.export_mode {
            Self::Export
        } else if config.symbolic_shapes {
            Self::Dynamic
        } else {
            Self::Static
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed { notes: Vec<String> },
    Failed { detail: String },
    Panicked,
}

/// Collects the guard keys a test body computes. Shared by reference so
/// property closures can record from every case.
#[derive(Debug, Default)]
pub struct GuardKeyRecorder {
    keys: RefCell<BTreeSet<String>>,
}

impl GuardKeyRecorder {
    pub fn record(&self, key: impl Into<String>) {
        self.keys.borrow_mut().insert(key.into());
    }

    #[must_use]
    pub fn distinct(&self) -> usize {
        self.keys.borrow().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTestLog {
    pub schema: String,
    pub test_id: String,
    pub fixture_digest: String,
    pub seed: Option<u64>,
    pub profile: TraceProfile,
    pub config: TraceConfig,
    pub distinct_guard_keys: usize,
    pub guard_keys: Vec<String>,
    pub outcome: TestOutcome,
    pub elapsed_ms: u64,
    pub os: String,
    pub timestamp_unix_ms: u64,
}

impl TraceTestLog {
    #[must_use]
    pub fn new(
        test_id: impl Into<String>,
        fixture_digest: impl Into<String>,
        config: &TraceConfig,
    ) -> Self {
        Self {
            schema: TRACE_TEST_LOG_SCHEMA.to_owned(),
            test_id: test_id.into(),
            fixture_digest: fixture_digest.into(),
            seed: capture_proptest_seed(),
            profile: TraceProfile::of(config),
            config: config.clone(),
            distinct_guard_keys: 0,
            guard_keys: Vec::new(),
            outcome: TestOutcome::Panicked,
            elapsed_ms: 0,
            os: std::env::consts::OS.to_owned(),
            timestamp_unix_ms: now_unix_ms_u64(),
        }
    }

    fn absorb(&mut self, recorder: &GuardKeyRecorder) {
        let keys = recorder.keys.borrow();
        self.distinct_guard_keys = keys.len();
        self.guard_keys = keys.iter().take(MAX_LISTED_GUARD_KEYS).cloned().collect();
    }

    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        match &self.outcome {
            TestOutcome::Passed { .. } => None,
            TestOutcome::Failed { detail } => Some(detail),
            TestOutcome::Panicked => Some("panicked"),
        }
    }
}

/// Runs `body` and returns its record without failing the caller.
pub fn trace_test_log<Fixture, F>(
    test_id: &str,
    fixture: &Fixture,
    config: &TraceConfig,
    body: F,
) -> TraceTestLog
where
    Fixture: Serialize,
    F: FnOnce(&GuardKeyRecorder) -> Result<Vec<String>, String>,
{
    let digest = fixture_digest(fixture).unwrap_or_else(|err| format!("unserializable: {err}"));
    let mut log = TraceTestLog::new(test_id, digest, config);
    let recorder = GuardKeyRecorder::default();
    let start = Instant::now();
    log.outcome = match catch_unwind(AssertUnwindSafe(|| body(&recorder))) {
        Ok(Ok(notes)) => TestOutcome::Passed { notes },
        Ok(Err(detail)) => TestOutcome::Failed { detail },
        Err(_) => TestOutcome::Panicked,
    };
    log.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    log.absorb(&recorder);
    log
}

/// Runs `body`, writes its record to stderr as one JSON line and panics
/// when the body failed.
pub fn run_trace_test<Fixture, F>(
    test_id: &str,
    fixture: &Fixture,
    config: &TraceConfig,
    body: F,
) where
    Fixture: Serialize,
    F: FnOnce(&GuardKeyRecorder) -> Result<Vec<String>, String>,
{
    let log = trace_test_log(test_id, fixture, config, body);
    match serde_json::to_string(&log) {
        Ok(line) => eprintln!("{line}"),
        Err(err) => eprintln!("{test_id}: log not serializable: {err}"),
    }
    if let Some(detail) = log.failure() {
        panic!("{test_id}: {detail}");
    }
}

pub fn fixture_digest<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("VT_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["VT_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{
        TRACE_TEST_LOG_SCHEMA, TestOutcome, TraceProfile, TraceTestLog, fixture_digest,
        property_test_case_count, trace_test_log,
    };
    use vt_core::TraceConfig;

    #[test]
    fn fixture_digest_is_deterministic() {
        let fixture = serde_json::json!({ "value": [1, 2, 3], "source": "L['x']" });
        let a = fixture_digest(&fixture).expect("digest");
        let b = fixture_digest(&fixture).expect("digest");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn property_case_count_has_default_floor() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn profile_follows_config_flags() {
        assert_eq!(TraceProfile::of(&TraceConfig::default()), TraceProfile::Static);
        let dynamic = TraceConfig {
            symbolic_shapes: true,
            ..TraceConfig::default()
        };
        assert_eq!(TraceProfile::of(&dynamic), TraceProfile::Dynamic);
        let export = TraceConfig {
            export_mode: true,
            ..dynamic
        };
        assert_eq!(TraceProfile::of(&export), TraceProfile::Export);
    }

    #[test]
    fn guard_keys_are_deduplicated_and_capped() {
        let log = trace_test_log("keys", &"fixture", &TraceConfig::default(), |recorder| {
            for n in [3, 1, 3, 2, 5, 4, 1] {
                recorder.record(format!("vtg-{n}"));
            }
            Ok(vec!["recorded".to_owned()])
        });
        assert_eq!(log.distinct_guard_keys, 5);
        assert_eq!(log.guard_keys, vec!["vtg-1", "vtg-2", "vtg-3", "vtg-4"]);
        assert_eq!(
            log.outcome,
            TestOutcome::Passed {
                notes: vec!["recorded".to_owned()]
            }
        );
        assert_eq!(log.failure(), None);
    }

    #[test]
    fn failures_and_panics_are_captured() {
        let config = TraceConfig::default();
        let failed = trace_test_log("failed", &1_u8, &config, |_| Err("mismatch".to_owned()));
        assert_eq!(failed.failure(), Some("mismatch"));
        let panicked = trace_test_log("panicked", &1_u8, &config, |_| panic!("boom"));
        assert_eq!(panicked.outcome, TestOutcome::Panicked);
    }

    #[test]
    fn log_carries_config_through_json() {
        let config = TraceConfig {
            specialize_numbers: true,
            ..TraceConfig::default()
        };
        let log = TraceTestLog::new("log", "fixture", &config);
        let encoded = serde_json::to_string(&log).expect("serialize");
        let decoded: TraceTestLog = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded.schema, TRACE_TEST_LOG_SCHEMA);
        assert_eq!(decoded.config, config);
        assert_eq!(decoded.profile, TraceProfile::Static);
    }
}
