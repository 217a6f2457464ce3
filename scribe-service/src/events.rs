//! Pipeline events exchanged over the broker.
//!
//! Every message on the wire is a JSON object carrying the event fields,
//! a `type` tag and a `schemaVersion`. Payloads without a tag are accepted as
//! the event kind the queue is known to carry.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Schema version written by this build. Readers accept this and older.
pub const SCHEMA_VERSION: u64 = 1;

/// Opaque document identifier, stable across pipeline stages.
///
/// Producers may send a JSON string or integer; both normalize to the string
/// form, which is also the search index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        match RawId::deserialize(deserializer)
            .map_err(|_| D::Error::custom("documentId must be a string or integer"))?
        {
            RawId::Text(text) if text.trim().is_empty() => {
                Err(D::Error::custom("documentId must not be empty"))
            }
            RawId::Text(text) => Ok(Self(text)),
            RawId::Number(number) => Ok(Self(number.to_string())),
        }
    }
}

/// Descriptive metadata captured at upload time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// A newly uploaded document is available for OCR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReady {
    pub document_id: DocumentId,
    pub file_locator: String,
    pub metadata: DocumentMetadata,
}

/// Metadata forwarded with OCR output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrDocumentMetadata {
    #[serde(flatten)]
    pub metadata: DocumentMetadata,
    pub file_locator: String,
}

/// Extracted text plus metadata, ready for indexing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub document_id: DocumentId,
    pub document_metadata: OcrDocumentMetadata,
    #[serde(default)]
    pub ocr_text: String,
}

impl OcrResult {
    pub fn from_ready(event: &DocumentReady, ocr_text: String) -> Self {
        Self {
            document_id: event.document_id.clone(),
            document_metadata: OcrDocumentMetadata {
                metadata: event.metadata.clone(),
                file_locator: event.file_locator.clone(),
            },
            ocr_text,
        }
    }
}

/// Every message that travels through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    DocumentReady(DocumentReady),
    OcrResult(OcrResult),
}

/// Discriminant of [`PipelineEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DocumentReady,
    OcrResult,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::DocumentReady => f.write_str("documentReady"),
            EventKind::OcrResult => f.write_str("ocrResult"),
        }
    }
}

/// Errors raised while decoding a delivery
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Payload is not valid JSON for this event")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Unsupported schema version {found} (max {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },

    #[error("Invalid schemaVersion field")]
    InvalidVersion,

    #[error("Queue carries {expected} events, got {found}")]
    UnexpectedKind { expected: EventKind, found: EventKind },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::DocumentReady(_) => EventKind::DocumentReady,
            PipelineEvent::OcrResult(_) => EventKind::OcrResult,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        match self {
            PipelineEvent::DocumentReady(event) => &event.document_id,
            PipelineEvent::OcrResult(event) => &event.document_id,
        }
    }

    /// Serialize to the versioned wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("schemaVersion".to_string(), SCHEMA_VERSION.into());
        }
        serde_json::to_vec(&value)
    }

    /// Decode a delivery from a queue that carries `expected` events.
    pub fn decode(payload: &[u8], expected: EventKind) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        match object.get("schemaVersion") {
            None => {}
            Some(version) => {
                let found = version.as_u64().ok_or(DecodeError::InvalidVersion)?;
                if found > SCHEMA_VERSION {
                    return Err(DecodeError::UnsupportedVersion {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
        }

        let event = if object.contains_key("type") {
            serde_json::from_value::<PipelineEvent>(value)?
        } else {
            match expected {
                EventKind::DocumentReady => {
                    PipelineEvent::DocumentReady(serde_json::from_value(value)?)
                }
                EventKind::OcrResult => PipelineEvent::OcrResult(serde_json::from_value(value)?),
            }
        };

        if event.kind() != expected {
            return Err(DecodeError::UnexpectedKind {
                expected,
                found: event.kind(),
            });
        }
        Ok(event)
    }
}

impl From<DocumentReady> for PipelineEvent {
    fn from(event: DocumentReady) -> Self {
        PipelineEvent::DocumentReady(event)
    }
}

impl From<OcrResult> for PipelineEvent {
    fn from(event: OcrResult) -> Self {
        PipelineEvent::OcrResult(event)
    }
}
