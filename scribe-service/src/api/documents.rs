//! Document upload endpoint.

use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::service::NewDocument;

use super::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub document_id: String,
    pub file_locator: String,
}

/// Store an uploaded file and queue it for OCR.
///
/// Multipart fields: `file` (required), `name`, `author`.
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ServiceResult<(StatusCode, Json<UploadResponse>)> {
    let mut file: Option<(String, bytes::Bytes)> = None;
    let mut name: Option<String> = None;
    let mut author: Option<String> = None;

    let invalid = |e: axum::extract::multipart::MultipartError| ServiceError::InvalidRequest {
        message: e.to_string(),
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("document").to_string();
                let data = field.bytes().await.map_err(invalid)?;
                file = Some((file_name, data));
            }
            "name" => name = Some(field.text().await.map_err(invalid)?),
            "author" => author = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }

    let (file_name, data) = file.ok_or_else(|| ServiceError::InvalidRequest {
        message: "No file provided".to_string(),
    })?;

    let event = state
        .documents
        .submit(NewDocument {
            file_name,
            data,
            name,
            author,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id: event.document_id.to_string(),
            file_locator: event.file_locator,
        }),
    ))
}
