//! Defines routes for blob reads/writes, uploads and health.
//!
//! ## Structure
//! - **Blob endpoints**
//!   - `GET    /blob/{workspace}`: list blobs (`?cursor=&limit=`)
//!   - `PUT    /blob/{workspace}/{*name}`: streamed upload
//!   - `GET    /blob/{workspace}/{*name}`: download, honors `Range`
//!   - `HEAD   /blob/{workspace}/{*name}`: metadata only
//!   - `DELETE /blob/{workspace}/{*name}`: soft-delete
//!
//! - **Upload endpoints**
//!   - `POST   /upload/form-data/{workspace}`: multi-file upload
//!   - `POST   /upload/multipart/{workspace}/{name}`: start, then
//!     `PUT .../part`, `POST .../complete`, `POST .../abort`
//!   - `POST|PUT|DELETE /upload/signed-url/{workspace}/{name}`: signed
//!     create / complete / abort
//!   - `PUT    /_bucket/{location}/{key}`: write authorized by a signed URL
//!
//! The wildcard `*name` allows nested names like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        blob_handlers::{delete_blob, get_blob, head_blob, list_blobs, put_blob},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            abort_multipart, abort_signed_url, complete_multipart, complete_signed_url,
            create_signed_url, signed_bucket_write, start_multipart, upload_form_data,
            upload_part,
        },
    },
    services::BlobService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build and return the router for every endpoint.
///
/// The router carries shared state (`BlobService`) to all handlers. Upload
/// bodies are streamed, so the default body limit is lifted.
pub fn routes() -> Router<BlobService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Blob routes
        .route(
            "/blob/{workspace}/{*name}",
            put(put_blob).get(get_blob).head(head_blob).delete(delete_blob),
        )
        .route("/blob/{workspace}", get(list_blobs))
        // Upload routes
        .route("/upload/form-data/{workspace}", post(upload_form_data))
        .route("/upload/multipart/{workspace}/{name}", post(start_multipart))
        .route("/upload/multipart/{workspace}/{name}/part", put(upload_part))
        .route(
            "/upload/multipart/{workspace}/{name}/complete",
            post(complete_multipart),
        )
        .route("/upload/multipart/{workspace}/{name}/abort", post(abort_multipart))
        .route(
            "/upload/signed-url/{workspace}/{name}",
            post(create_signed_url)
                .put(complete_signed_url)
                .delete(abort_signed_url),
        )
        .route("/_bucket/{location}/{key}", put(signed_bucket_write))
        .layer(DefaultBodyLimit::disable())
}
