//! Defines a _trigger_, the normalized input of the pipeline. The
//! trigger is built from one of the two event shapes the pipeline
//! listens to: S3 notifications carrying `Records`, and workflow run
//! status changes carrying a `detail` block.

use crate::error::PipelineError;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

/// The S3 event name the pipeline acts upon.
pub const OBJECT_CREATED_PUT: &str = "ObjectCreated:Put";

/// The workflow event type the pipeline acts upon.
pub const RUN_STATUS_CHANGE: &str = "Run Status Change";

/// Look up a dotted path such as `detail.runOutputUri` within a JSON
/// value.
pub fn key_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

fn string_at(value: &Value, path: &str) -> Option<String> {
    key_path(value, path)
        .and_then(Value::as_str)
        .map(String::from)
}

fn required(value: &Value, path: &str) -> Result<String, PipelineError> {
    string_at(value, path).ok_or_else(|| PipelineError::MalformedEvent(format!("No `{}`", path)))
}

fn debug_flag(event: &Value) -> bool {
    event.get("debug").and_then(Value::as_bool).unwrap_or(false)
}

/// An object storage notification record. Only the first record of a
/// batch is considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub region: Option<String>,
    pub time: Option<String>,
    pub event_type: Option<String>,
    pub bucket: String,
    pub key: String,
    pub debug: bool,
}

/// A workflow run status change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusRecord {
    pub account: Option<String>,
    pub region: Option<String>,
    pub source: Option<String>,
    pub time: Option<String>,
    pub event_type: Option<String>,
    pub status: String,
    pub run_output_uri: String,
    pub debug: bool,
}

/// The incoming event, classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEnvelope {
    Storage(StorageRecord),
    RunStatus(RunStatusRecord),
}

/// Which shape a trigger was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Storage,
    RunStatus,
}

/// The canonical options derived from an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOptions {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub bucket: String,
    pub package: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub kind: TriggerKind,
}

impl TriggerKind {
    /// The event type the pipeline acts upon for this shape.
    pub fn accepted_type(self) -> &'static str {
        match self {
            TriggerKind::Storage => OBJECT_CREATED_PUT,
            TriggerKind::RunStatus => RUN_STATUS_CHANGE,
        }
    }
}

impl EventEnvelope {
    /// Classify a raw event by its shape. A `detail` block selects a
    /// run status change, a `Records` array a storage notification.
    pub fn classify(event: &Value) -> Result<Self, PipelineError> {
        if event.get("detail").is_some() {
            let detail = &event["detail"];
            Ok(EventEnvelope::RunStatus(RunStatusRecord {
                account: string_at(event, "account"),
                region: string_at(event, "region"),
                source: string_at(event, "source"),
                time: string_at(event, "time"),
                event_type: string_at(event, "detail-type"),
                status: required(detail, "status").map_err(|_| {
                    PipelineError::MalformedEvent(String::from("No `status` in detail"))
                })?,
                run_output_uri: required(detail, "runOutputUri").map_err(|_| {
                    PipelineError::MalformedEvent(String::from("No `runOutputUri` in detail"))
                })?,
                debug: debug_flag(event),
            }))
        } else if let Some(records) = event.get("Records") {
            let record = records
                .as_array()
                .and_then(|records| records.first())
                .ok_or_else(|| PipelineError::MalformedEvent(String::from("No records in event")))?;
            if record.get("s3").is_none() {
                return Err(PipelineError::MalformedEvent(String::from(
                    "No `s3` in record",
                )));
            }
            Ok(EventEnvelope::Storage(StorageRecord {
                region: string_at(record, "awsRegion"),
                time: string_at(record, "eventTime"),
                event_type: string_at(record, "eventName"),
                bucket: required(record, "s3.bucket.name")?,
                key: required(record, "s3.object.key")?,
                debug: debug_flag(event),
            }))
        } else {
            Err(PipelineError::MalformedEvent(String::from(
                "Neither `detail` nor `Records` in event",
            )))
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            EventEnvelope::Storage(_) => TriggerKind::Storage,
            EventEnvelope::RunStatus(_) => TriggerKind::RunStatus,
        }
    }

    /// The type the event announces, if any.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            EventEnvelope::Storage(record) => record.event_type.as_deref(),
            EventEnvelope::RunStatus(record) => record.event_type.as_deref(),
        }
    }

    /// Derive the canonical options, including the package name. Only
    /// events of the accepted type are expected to carry a key or URI
    /// a package name can be derived from.
    pub fn options(&self) -> Result<PipelineOptions, PipelineError> {
        match self {
            EventEnvelope::Storage(record) => Ok(PipelineOptions {
                event_type: record.event_type.clone(),
                bucket: record.bucket.clone(),
                package: package_from_key(&record.key)?,
                uri: format!("s3://{}/{}", record.bucket, record.key),
                key: Some(record.key.clone()),
                debug: record.debug,
                account: None,
                region: record.region.clone(),
                source: None,
                time: record.time.clone(),
                kind: TriggerKind::Storage,
            }),
            EventEnvelope::RunStatus(record) => {
                let (bucket, package) = split_run_output_uri(&record.run_output_uri)?;
                Ok(PipelineOptions {
                    event_type: record.event_type.clone(),
                    bucket,
                    package,
                    uri: record.run_output_uri.clone(),
                    key: None,
                    debug: record.debug,
                    account: record.account.clone(),
                    region: record.region.clone(),
                    source: record.source.clone(),
                    time: record.time.clone(),
                    kind: TriggerKind::RunStatus,
                })
            }
        }
    }
}

/// The package name of an object key: its last two path segments.
pub fn package_from_key(key: &str) -> Result<String, PipelineError> {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(PipelineError::InvalidPackageName(String::from(key)));
    }
    Ok(segments[segments.len() - 2..].join("/"))
}

/// The bucket and package name of a run output URI of the form
/// `s3://<bucket>/<owner>/<name>/...`.
pub fn split_run_output_uri(uri: &str) -> Result<(String, String), PipelineError> {
    let splits: Vec<&str> = uri.split('/').collect();
    if splits.len() < 5 || splits[2].is_empty() || splits[3..5].iter().any(|s| s.is_empty()) {
        return Err(PipelineError::MalformedEvent(format!(
            "Can't derive a bucket and package from {:?}",
            uri
        )));
    }
    Ok((String::from(splits[2]), splits[3..5].join("/")))
}

/// Parse a raw event into its envelope.
#[instrument(skip(event))]
pub fn parse_event(event: &Value) -> Result<EventEnvelope, PipelineError> {
    let envelope = EventEnvelope::classify(event)?;
    info!(?envelope, "Parsed event");
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(event: &Value) -> PipelineOptions {
        parse_event(event).unwrap().options().unwrap()
    }

    fn storage_event() -> Value {
        json!({
            "Records": [{
                "awsRegion": "us-east-1",
                "eventTime": "2023-12-01T00:00:00.000Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": {"name": "b"},
                    "object": {"key": "pkg/name/out/report.csv"}
                }
            }]
        })
    }

    fn run_status_event() -> Value {
        json!({
            "account": "123456789012",
            "region": "us-east-1",
            "source": "aws.omics",
            "time": "2023-12-01T00:00:00Z",
            "detail-type": "Run Status Change",
            "detail": {
                "status": "COMPLETED",
                "runOutputUri": "s3://bucket/omics-quilt/3395667/out"
            }
        })
    }

    #[test]
    fn storage_record_uses_the_last_two_key_segments() {
        let options = options(&storage_event());
        assert_eq!(options.kind, TriggerKind::Storage);
        assert_eq!(options.bucket, "b");
        assert_eq!(options.package, "out/report.csv");
        assert_eq!(options.uri, "s3://b/pkg/name/out/report.csv");
        assert_eq!(options.key.as_deref(), Some("pkg/name/out/report.csv"));
        assert_eq!(options.event_type.as_deref(), Some(OBJECT_CREATED_PUT));
        assert!(!options.debug);
    }

    #[test]
    fn only_the_first_record_is_used() {
        let mut event = storage_event();
        let second = json!({
            "eventName": "ObjectRemoved:Delete",
            "s3": {"bucket": {"name": "other"}, "object": {"key": "x/y"}}
        });
        event["Records"].as_array_mut().unwrap().push(second);
        let options = options(&event);
        assert_eq!(options.bucket, "b");
    }

    #[test]
    fn run_status_uses_the_two_segments_after_the_bucket() {
        let options = options(&run_status_event());
        assert_eq!(options.kind, TriggerKind::RunStatus);
        assert_eq!(options.bucket, "bucket");
        assert_eq!(options.package, "omics-quilt/3395667");
        assert_eq!(options.uri, "s3://bucket/omics-quilt/3395667/out");
        assert_eq!(options.event_type.as_deref(), Some(RUN_STATUS_CHANGE));
        assert_eq!(options.account.as_deref(), Some("123456789012"));
    }

    #[test]
    fn debug_flag_is_read_from_the_envelope() {
        let mut event = run_status_event();
        event["debug"] = json!(true);
        assert!(options(&event).debug);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let mut event = run_status_event();
        event["detail"].as_object_mut().unwrap().remove("status");
        assert!(matches!(
            parse_event(&event),
            Err(PipelineError::MalformedEvent(_))
        ));

        let mut event = run_status_event();
        event["detail"].as_object_mut().unwrap().remove("runOutputUri");
        assert!(matches!(
            parse_event(&event),
            Err(PipelineError::MalformedEvent(_))
        ));

        assert!(matches!(
            parse_event(&json!({"Records": []})),
            Err(PipelineError::MalformedEvent(_))
        ));
        assert!(matches!(
            parse_event(&json!({"Records": [{"eventName": "ObjectCreated:Put"}]})),
            Err(PipelineError::MalformedEvent(_))
        ));
        assert!(matches!(
            parse_event(&json!({"something": "else"})),
            Err(PipelineError::MalformedEvent(_))
        ));
    }

    #[test]
    fn missing_type_is_kept_absent() {
        let mut event = run_status_event();
        event.as_object_mut().unwrap().remove("detail-type");
        assert_eq!(parse_event(&event).unwrap().event_type(), None);
    }

    #[test]
    fn type_is_known_before_the_package_is_derived() {
        let envelope = parse_event(&json!({
            "Records": [{
                "eventName": "ObjectRemoved:Delete",
                "s3": {"bucket": {"name": "b"}, "object": {"key": "report.csv"}}
            }]
        }))
        .unwrap();
        assert_eq!(envelope.kind(), TriggerKind::Storage);
        assert_eq!(envelope.event_type(), Some("ObjectRemoved:Delete"));
        assert_ne!(envelope.event_type(), Some(envelope.kind().accepted_type()));
        assert!(matches!(
            envelope.options(),
            Err(PipelineError::InvalidPackageName(_))
        ));

        let envelope = parse_event(&json!({
            "detail-type": "Run Created",
            "detail": {"status": "PENDING", "runOutputUri": "s3://bucket/run"}
        }))
        .unwrap();
        assert_eq!(envelope.kind().accepted_type(), RUN_STATUS_CHANGE);
        assert!(matches!(
            envelope.options(),
            Err(PipelineError::MalformedEvent(_))
        ));
    }

    #[test]
    fn short_uris_and_keys_are_rejected() {
        assert!(split_run_output_uri("s3://bucket/only").is_err());
        assert!(package_from_key("single").is_err());
        assert_eq!(package_from_key("a/b/c/").unwrap(), "b/c");
    }

    #[test]
    fn key_paths() {
        let event = run_status_event();
        assert_eq!(
            key_path(&event, "detail.runOutputUri").and_then(Value::as_str),
            Some("s3://bucket/omics-quilt/3395667/out")
        );
        assert!(key_path(&event, "detail.missing.deeper").is_none());
    }
}
