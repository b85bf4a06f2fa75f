use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod card;

/// Column the remote table uses to decide between insert and replace.
pub const CONFLICT_KEY: &str = "role_id";
pub const DEFAULT_TABLE_NAME: &str = "role_data";
pub const DEFAULT_BATCH_SIZE: i64 = 50;
pub const DEFAULT_SOURCE_FILENAME: &str = "character_v2.json";
pub const UNKNOWN_IDENTITY: &str = "UNKNOWN";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrateError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("batch size must be a positive integer, got {0}")]
    InvalidBatchSize(i64),
    #[error("role_id is missing in data.extensions or data")]
    IdentityMissing,
    #[error("write failed: {0}")]
    WriteFailure(String),
}

/// One row of the flat `role_data` schema.
///
/// Field order matches the column order of the remote table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedRecord {
    pub role_id: String,
    pub spec: Option<String>,
    pub spec_version: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub scenario: Option<String>,
    pub first_mes: Option<String>,
    pub mes_example: Option<String>,
    pub creator: Option<String>,
    pub character_version: Option<String>,
    pub creator_notes: Option<String>,
    pub system_prompt: Option<String>,
    pub post_history_instructions: Option<String>,
    pub alternate_greetings: Value,
    pub character_book: Value,
    pub tags: Value,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub deeplink: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    /// 1-based position in the input file.
    pub index: usize,
    pub identity_hint: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedRecord {
    pub role_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub failures: Vec<FailedRecord>,
    /// True when the batch request failed and records were retried one by one.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub records: Vec<NormalizedRecord>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub table: String,
    pub batch_size: i64,
    pub dry_run: bool,
}

impl Default for MigrationPlan {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE_NAME.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub loaded: usize,
    pub normalized: usize,
    pub accepted: usize,
    pub batches: usize,
    pub degraded_batches: usize,
    pub skipped: Vec<SkippedRecord>,
    pub failed: Vec<FailedRecord>,
    /// First normalized record, only populated for dry runs.
    pub sample: Option<NormalizedRecord>,
}

/// Rows handed to a store in a single upsert request.
///
/// Serializes as a JSON object for `One` and a JSON array for `Many`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum UpsertRows<'a> {
    One(&'a NormalizedRecord),
    Many(&'a [NormalizedRecord]),
}

impl UpsertRows<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(rows) => rows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote table that accepts insert-or-replace writes.
pub trait UpsertStore {
    /// Insert `rows` into `table`, replacing existing rows that share `conflict_key`.
    ///
    /// # Errors
    /// Returns [`MigrateError::WriteFailure`] when the store rejects the write or
    /// cannot be reached.
    fn upsert(
        &mut self,
        table: &str,
        rows: UpsertRows<'_>,
        conflict_key: &str,
    ) -> Result<(), MigrateError>;
}

fn empty_map() -> &'static Map<String, Value> {
    static EMPTY: OnceLock<Map<String, Value>> = OnceLock::new();
    EMPTY.get_or_init(Map::new)
}

/// Resolve a possibly-missing submap to a concrete one; anything that is not an
/// object reads as empty.
fn as_map(value: Option<&Value>) -> &Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => empty_map(),
    }
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::Null => return None,
        other => stringify(other),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn opaque(value: Option<&Value>) -> Value {
    value.cloned().unwrap_or(Value::Null)
}

fn resolve_role_id(data: &Map<String, Value>, extensions: &Map<String, Value>) -> Option<String> {
    [extensions.get(CONFLICT_KEY), data.get(CONFLICT_KEY)]
        .into_iter()
        .flatten()
        .find(|value| is_truthy(value))
        .map(stringify)
}

/// Flatten one nested card into the `role_data` row shape.
///
/// # Errors
/// Returns [`MigrateError::IdentityMissing`] when neither `data.extensions.role_id`
/// nor `data.role_id` holds a usable value.
pub fn normalize(raw: &Value) -> Result<NormalizedRecord, MigrateError> {
    let wrapper = as_map(Some(raw));
    let data = as_map(wrapper.get("data"));
    let extensions = as_map(data.get("extensions"));

    let role_id = resolve_role_id(data, extensions).ok_or(MigrateError::IdentityMissing)?;

    Ok(NormalizedRecord {
        role_id,
        spec: optional_text(wrapper.get("spec")),
        spec_version: optional_text(wrapper.get("spec_version")),
        name: optional_text(data.get("name")),
        description: optional_text(data.get("description")),
        personality: optional_text(data.get("personality")),
        scenario: optional_text(data.get("scenario")),
        first_mes: optional_text(data.get("first_mes")),
        mes_example: optional_text(data.get("mes_example")),
        creator: optional_text(data.get("creator")),
        character_version: optional_text(data.get("character_version")),
        creator_notes: optional_text(data.get("creator_notes")),
        system_prompt: optional_text(data.get("system_prompt")),
        post_history_instructions: optional_text(data.get("post_history_instructions")),
        alternate_greetings: opaque(data.get("alternate_greetings")),
        character_book: opaque(data.get("character_book")),
        tags: opaque(data.get("tags")),
        title: optional_text(extensions.get("title")),
        summary: optional_text(extensions.get("summary")),
        deeplink: optional_text(extensions.get("deeplink")),
        avatar: optional_text(data.get("avatar")),
    })
}

/// Best-effort identifier for reporting a record that could not be normalized.
#[must_use]
pub fn identity_hint(raw: &Value) -> String {
    let data = as_map(as_map(Some(raw)).get("data"));
    let extensions = as_map(data.get("extensions"));
    resolve_role_id(data, extensions).unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

/// Normalize every raw record independently, routing failures to `skipped`.
#[must_use]
pub fn normalize_all(raw_records: &[Value]) -> Normalized {
    let mut normalized = Normalized::default();
    for (offset, raw) in raw_records.iter().enumerate() {
        match normalize(raw) {
            Ok(record) => normalized.records.push(record),
            Err(err) => {
                let skipped = SkippedRecord {
                    index: offset + 1,
                    identity_hint: identity_hint(raw),
                    reason: err.to_string(),
                };
                tracing::warn!(
                    "Skipping record index={} role_id={}: {}",
                    skipped.index,
                    skipped.identity_hint,
                    skipped.reason
                );
                normalized.skipped.push(skipped);
            }
        }
    }
    normalized
}

/// Check a requested batch size and return it as a chunk length.
///
/// # Errors
/// Returns [`MigrateError::InvalidBatchSize`] when `size <= 0`.
pub fn validate_batch_size(size: i64) -> Result<usize, MigrateError> {
    usize::try_from(size)
        .ok()
        .filter(|value| *value > 0)
        .ok_or(MigrateError::InvalidBatchSize(size))
}

/// Split `records` into contiguous chunks of at most `size` elements.
///
/// # Errors
/// Returns [`MigrateError::InvalidBatchSize`] when `size <= 0`.
pub fn chunked<T>(records: &[T], size: i64) -> Result<std::slice::Chunks<'_, T>, MigrateError> {
    let size = validate_batch_size(size)?;
    Ok(records.chunks(size))
}

fn failure_message(err: MigrateError) -> String {
    match err {
        MigrateError::WriteFailure(message) => message,
        other => other.to_string(),
    }
}

/// Write one batch, degrading to one request per record when the batch request fails.
pub fn write_batch(
    store: &mut dyn UpsertStore,
    table: &str,
    batch: &[NormalizedRecord],
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    if batch.is_empty() {
        return outcome;
    }

    match store.upsert(table, UpsertRows::Many(batch), CONFLICT_KEY) {
        Ok(()) => {
            outcome.accepted = batch.len();
            return outcome;
        }
        Err(err) => {
            tracing::warn!(
                "Batch upsert of {} records failed, retrying one at a time: {}",
                batch.len(),
                err
            );
        }
    }

    outcome.degraded = true;
    for record in batch {
        match store.upsert(table, UpsertRows::One(record), CONFLICT_KEY) {
            Ok(()) => {
                outcome.accepted += 1;
                tracing::debug!("Single-record upsert succeeded: role_id={}", record.role_id);
            }
            Err(err) => {
                let error = failure_message(err);
                tracing::error!("Single-record upsert failed role_id={}: {}", record.role_id, error);
                outcome.failures.push(FailedRecord { role_id: record.role_id.clone(), error });
            }
        }
    }
    outcome
}

/// Normalize, batch and write `raw_records` according to `plan`.
///
/// Per-record problems end up in the report; only configuration problems fail
/// the run, and they are detected before any record is processed.
///
/// # Errors
/// Returns [`MigrateError::InvalidBatchSize`] for a non-positive batch size and
/// [`MigrateError::Configuration`] when a write run has no store handle.
pub fn run_migration(
    raw_records: &[Value],
    plan: &MigrationPlan,
    store: Option<&mut dyn UpsertStore>,
) -> Result<MigrationReport, MigrateError> {
    validate_batch_size(plan.batch_size)?;
    let store = match (plan.dry_run, store) {
        (true, _) => None,
        (false, Some(store)) => Some(store),
        (false, None) => {
            return Err(MigrateError::Configuration(
                "a store handle is required unless running in dry-run mode".to_string(),
            ))
        }
    };

    let Normalized { records, skipped } = normalize_all(raw_records);
    tracing::info!(
        "Normalized {} of {} records, skipped {}",
        records.len(),
        raw_records.len(),
        skipped.len()
    );

    let mut report = MigrationReport {
        dry_run: plan.dry_run,
        loaded: raw_records.len(),
        normalized: records.len(),
        accepted: 0,
        batches: 0,
        degraded_batches: 0,
        skipped,
        failed: Vec::new(),
        sample: None,
    };

    let Some(store) = store else {
        tracing::info!("Dry-run mode, nothing written to table {}", plan.table);
        report.sample = records.into_iter().next();
        return Ok(report);
    };

    let total = records.len();
    for batch in chunked(&records, plan.batch_size)? {
        let outcome = write_batch(&mut *store, &plan.table, batch);
        report.batches += 1;
        if outcome.degraded {
            report.degraded_batches += 1;
        }
        report.accepted += outcome.accepted;
        report.failed.extend(outcome.failures);
        tracing::info!("Wrote {}/{} records to {}", report.accepted, total, plan.table);
    }

    Ok(report)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse an input document into raw records; a bare object counts as one record.
///
/// # Errors
/// Returns [`MigrateError::Configuration`] for malformed JSON or a top-level
/// value that is neither an array nor an object.
pub fn parse_raw_records(text: &str) -> Result<Vec<Value>, MigrateError> {
    let content: Value = serde_json::from_str(text)
        .map_err(|err| MigrateError::Configuration(format!("input is not valid JSON: {err}")))?;
    match content {
        Value::Array(items) => Ok(items),
        object @ Value::Object(_) => Ok(vec![object]),
        other => Err(MigrateError::Configuration(format!(
            "input must contain a JSON array or a single object, found {}",
            json_kind(&other)
        ))),
    }
}
