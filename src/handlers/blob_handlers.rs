//! HTTP handlers for reading, writing, deleting and listing blobs.
//! Bodies are streamed in both directions; storage concerns live in
//! `BlobService`.

use crate::{
    errors::AppError,
    models::blob::{BlobInfo, BlobMetadata},
    services::{
        BlobService,
        range::{RangeSpec, content_range},
        retrieve::{BlobBody, BlobContent},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

const CACHE_CONTROL: &str = "public, max-age=86400, must-revalidate";

/// Query params accepted by the workspace listing.
#[derive(Debug, Deserialize)]
pub struct ListBlobsQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBlobsResponse {
    pub blobs: Vec<BlobMetadata>,
    /// Opaque continuation token; absent on the last page.
    pub cursor: Option<String>,
}

/// Request body bytes as an `io::Result` stream.
pub(crate) fn body_stream(
    body: Body,
) -> impl futures::Stream<Item = io::Result<bytes::Bytes>> + Send + 'static {
    body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other))
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// GET `/blob/{workspace}/{*name}`, honoring `Range` and `If-None-Match`.
pub async fn get_blob(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = header_str(&headers, header::RANGE).and_then(RangeSpec::parse);
    let content = service.get(&workspace, &name, range).await?;

    if not_modified(&headers, &content.info) {
        return Ok(not_modified_response(&content.info));
    }

    let BlobContent { info, range, body } = content;
    let length = range.map_or(info.size, |r| r.len());
    let body = match body {
        BlobBody::Buffered(bytes) => Body::from(bytes),
        BlobBody::Stream(stream) => Body::from_stream(stream),
    };

    let mut response = Response::new(body);
    set_blob_headers(response.headers_mut(), &info, length);
    match range {
        Some(range) => {
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = HeaderValue::from_str(&content_range(range, info.size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        None => *response.status_mut() = StatusCode::OK,
    }
    Ok(response)
}

/// HEAD `/blob/{workspace}/{*name}`: same headers as GET but no body.
pub async fn head_blob(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let info = service.head(&workspace, &name).await?;
    if not_modified(&headers, &info) {
        return Ok(not_modified_response(&info));
    }
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_blob_headers(response.headers_mut(), &info, info.size);
    Ok(response)
}

/// DELETE `/blob/{workspace}/{*name}`: soft-delete.
pub async fn delete_blob(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&workspace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/blob/{workspace}/{*name}`: streamed single-blob upload.
///
/// `Content-Length` is the declared size; without it the payload is
/// treated as large.
pub async fn put_blob(
    State(service): State<BlobService>,
    Path((workspace, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<BlobMetadata>, AppError> {
    let declared_size = header_str(&headers, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
    let content_type = header_str(&headers, header::CONTENT_TYPE).unwrap_or_default();
    let last_modified = header_str(&headers, header::LAST_MODIFIED)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc));

    let metadata = service
        .ingest(
            &workspace,
            &name,
            body_stream(body),
            declared_size,
            content_type,
            last_modified,
        )
        .await?;
    Ok(Json(metadata))
}

/// GET `/blob/{workspace}`: active blobs in name order, `?cursor=&limit=`.
pub async fn list_blobs(
    State(service): State<BlobService>,
    Path(workspace): Path<String>,
    Query(q): Query<ListBlobsQuery>,
) -> Result<Json<ListBlobsResponse>, AppError> {
    let after = q.cursor.as_deref().map(decode_cursor);
    let limit = q.limit.unwrap_or(100);
    let page = service.list(&workspace, after.as_deref(), limit).await?;
    Ok(Json(ListBlobsResponse {
        blobs: page.blobs,
        cursor: page.cursor.as_deref().map(encode_cursor),
    }))
}

fn quoted_etag(info: &BlobInfo) -> String {
    format!("\"{}\"", info.etag)
}

fn not_modified(headers: &HeaderMap, info: &BlobInfo) -> bool {
    let Some(candidates) = header_str(headers, header::IF_NONE_MATCH) else {
        return false;
    };
    let etag = quoted_etag(info);
    candidates.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}

fn not_modified_response(info: &BlobInfo) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&quoted_etag(info)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    response
}

fn set_blob_headers(headers: &mut HeaderMap, info: &BlobInfo, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&info.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));

    if let Ok(value) = HeaderValue::from_str(&quoted_etag(info)) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = info.last_modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn encode_cursor(name: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(name)
}

fn decode_cursor(token: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}
