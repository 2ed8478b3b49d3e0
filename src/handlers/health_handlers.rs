//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and every bucket

use crate::services::BlobService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs `SELECT 1` against the metadata store.
/// 2. Performs a write/read/delete probe against each location's bucket.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(service): State<BlobService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite".to_string(), CheckStatus::from(service.db.ping().await));
    for shard in service.locations().shards() {
        checks.insert(
            format!("bucket:{}", shard.location),
            CheckStatus::from(shard.bucket.check_health().await),
        );
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl<E: std::fmt::Display> From<Result<(), E>> for CheckStatus {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => CheckStatus { ok: true, error: None },
            Err(e) => CheckStatus {
                ok: false,
                error: Some(format!("error: {}", e)),
            },
        }
    }
}
