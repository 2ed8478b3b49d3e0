//! Upload endpoints: multi-file form data, multipart sessions, signed URLs
//! and the signed direct bucket write.

use super::blob_handlers::{body_stream, header_str};
use crate::{
    errors::AppError,
    models::{blob::BlobMetadata, data::Location},
    services::{BlobService, bucket::CompletedPart, signer::SignedUpload},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::warn;

/// Outcome for one part of a form-data upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BlobMetadata>,
    /// Error tag when this part failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIdQuery {
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartQuery {
    pub upload_id: String,
    pub part_number: u32,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartStarted {
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SignedWriteQuery {
    pub expires: i64,
    pub signature: String,
}

fn content_type(headers: &HeaderMap) -> &str {
    header_str(headers, header::CONTENT_TYPE).unwrap_or_default()
}

/// POST `/upload/form-data/{workspace}`
///
/// Each file part is stored under its form field name (or its file name when
/// the field is unnamed). A failing part is reported in place; its siblings
/// are still stored.
pub async fn upload_form_data(
    State(service): State<BlobService>,
    Path(workspace): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Vec<UploadOutcome>>, AppError> {
    let mut outcomes = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let key = field
            .name()
            .filter(|n| !n.is_empty())
            .or_else(|| field.file_name())
            .unwrap_or_default()
            .to_string();
        let part_type = field.content_type().unwrap_or_default().to_string();
        let stream = field.map_err(io::Error::other);

        let outcome = match service
            .ingest(&workspace, &key, stream, None, &part_type, None)
            .await
        {
            Ok(metadata) => UploadOutcome {
                key,
                metadata: Some(metadata),
                error: None,
                message: None,
            },
            Err(err) => {
                let app = AppError::from(err);
                warn!(workspace = %workspace, key = %key, error = %app, "form-data part failed");
                UploadOutcome {
                    key,
                    metadata: None,
                    error: Some(app.tag().to_string()),
                    message: Some(app.message),
                }
            }
        };
        outcomes.push(outcome);
    }
    Ok(Json(outcomes))
}

/// POST `/upload/multipart/{workspace}/{name}`
pub async fn start_multipart(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<MultipartStarted>, AppError> {
    let upload_id = service
        .start_multipart(&workspace, &name, content_type(&headers))
        .await?;
    Ok(Json(MultipartStarted { upload_id }))
}

/// PUT `/upload/multipart/{workspace}/{name}/part?uploadId=&partNumber=`
pub async fn upload_part(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    Query(q): Query<PartQuery>,
    body: Body,
) -> Result<Json<CompletedPart>, AppError> {
    let part = service
        .upload_part(&workspace, &name, &q.upload_id, q.part_number, body_stream(body))
        .await?;
    Ok(Json(part))
}

/// POST `/upload/multipart/{workspace}/{name}/complete?uploadId=`
pub async fn complete_multipart(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    Query(q): Query<UploadIdQuery>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<BlobMetadata>, AppError> {
    let metadata = service
        .complete_multipart(&workspace, &name, &q.upload_id, &request.parts)
        .await?;
    Ok(Json(metadata))
}

/// POST `/upload/multipart/{workspace}/{name}/abort?uploadId=`
pub async fn abort_multipart(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    Query(q): Query<UploadIdQuery>,
) -> Result<impl IntoResponse, AppError> {
    service
        .abort_multipart(&workspace, &name, &q.upload_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/upload/signed-url/{workspace}/{name}`
pub async fn create_signed_url(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<SignedUpload>, AppError> {
    let signed = service
        .create_signed_upload(&workspace, &name, content_type(&headers))
        .await?;
    Ok(Json(signed))
}

/// PUT `/upload/signed-url/{workspace}/{name}`
pub async fn complete_signed_url(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
) -> Result<Json<BlobMetadata>, AppError> {
    let metadata = service.complete_signed_upload(&workspace, &name).await?;
    Ok(Json(metadata))
}

/// DELETE `/upload/signed-url/{workspace}/{name}`
pub async fn abort_signed_url(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    service.abort_signed_upload(&workspace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/_bucket/{location}/{key}?expires=&signature=`: the write a signed
/// URL authorizes. Lands in the bucket only; `complete` records it.
pub async fn signed_bucket_write(
    State(service): State<BlobService>,
    Path((location, key)): Path<(String, String)>,
    Query(q): Query<SignedWriteQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let head = service
        .write_signed(
            &Location::new(location),
            &key,
            q.expires,
            &q.signature,
            body_stream(body),
            content_type(&headers),
        )
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", head.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}
