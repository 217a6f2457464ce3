//! Resolution of logical queue names to broker queues.

use std::collections::HashMap;

use crate::error::{ServiceError, ServiceResult};

const DOCUMENT_READY: &str = "documentreadyqueue";
const OCR_RESULTS: &str = "ocrresultsqueue";
const DEAD_LETTER: &str = "deadletterqueue";

/// Broker queue names for each pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub document_ready: String,
    pub ocr_results: String,
    /// Receives rejected messages; without it rejected messages are dropped
    pub dead_letter: Option<String>,
}

impl QueueNames {
    /// Resolve the configured map.
    ///
    /// Keys match case-insensitively with `_` and `-` ignored, so
    /// `documentReadyQueue` and `DOCUMENT_READY_QUEUE` name the same entry.
    pub fn from_config(queues: &HashMap<String, String>) -> ServiceResult<Self> {
        let normalized: HashMap<String, &str> = queues
            .iter()
            .map(|(key, value)| (normalize(key), value.trim()))
            .collect();

        let required = |key: &str, display: &str| -> ServiceResult<String> {
            match normalized.get(key) {
                Some(name) if !name.is_empty() => Ok((*name).to_string()),
                _ => Err(ServiceError::Config {
                    message: format!("missing required queue name '{display}' in [queues]"),
                }),
            }
        };

        let names = Self {
            document_ready: required(DOCUMENT_READY, "documentReadyQueue")?,
            ocr_results: required(OCR_RESULTS, "ocrResultsQueue")?,
            dead_letter: normalized
                .get(DEAD_LETTER)
                .filter(|name| !name.is_empty())
                .map(|name| (*name).to_string()),
        };

        if names.document_ready == names.ocr_results {
            return Err(ServiceError::Config {
                message: "documentReadyQueue and ocrResultsQueue must differ".to_string(),
            });
        }
        if let Some(dlq) = &names.dead_letter
            && (dlq == &names.document_ready || dlq == &names.ocr_results)
        {
            return Err(ServiceError::Config {
                message: "deadLetterQueue must differ from the work queues".to_string(),
            });
        }

        Ok(names)
    }

    /// Work queues followed by the dead-letter queue, if any
    pub fn all(&self) -> Vec<&str> {
        let mut all = vec![self.document_ready.as_str(), self.ocr_results.as_str()];
        if let Some(dlq) = &self.dead_letter {
            all.push(dlq);
        }
        all
    }
}

fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
