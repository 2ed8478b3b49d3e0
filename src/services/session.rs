//! Multipart and signed upload sessions.
//!
//! Sessions live in the `upload` table so that completion survives restarts.
//! Every state change is a compare-and-set, which makes double completion and
//! abort-after-complete detectable instead of racy. A completion that fails
//! after the bucket already holds the object drops back to `created`; calling
//! complete again then finds the object and only redoes the metadata step.

use super::{
    BlobService,
    bucket::{ByteStream, CompletedPart, ObjectHead, PutOptions},
    ensure_target,
    error::{BlobError, BlobResult},
    new_object_key,
    signer::SignedUpload,
};
use crate::models::{
    blob::{BlobMetadata, ResolvedBlob},
    data::Location,
    upload::{UploadKind, UploadSession, UploadState},
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::io;
use tracing::{info, warn};
use uuid::Uuid;

/// Highest part number a multipart upload accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

fn new_session(
    upload_id: String,
    kind: UploadKind,
    workspace: &str,
    name: &str,
    location: &Location,
    content_type: &str,
) -> UploadSession {
    UploadSession {
        upload_id,
        kind,
        workspace: workspace.to_string(),
        name: name.to_string(),
        location: location.clone(),
        filename: new_object_key(),
        content_type: content_type.to_string(),
        state: UploadState::Created,
        created_at: Utc::now(),
        expires_at: None,
    }
}

impl BlobService {
    async fn multipart_session(
        &self,
        workspace: &str,
        name: &str,
        upload_id: &str,
    ) -> BlobResult<UploadSession> {
        self.settings
            .retry
            .run("get upload", || self.db.get_upload(upload_id))
            .await?
            .filter(|s| s.kind == UploadKind::Multipart && s.targets(workspace, name))
            .ok_or_else(|| BlobError::UploadNotFound(upload_id.to_string()))
    }

    async fn signed_session(&self, workspace: &str, name: &str) -> BlobResult<UploadSession> {
        self.settings
            .retry
            .run("get upload", || {
                self.db.latest_upload(UploadKind::Signed, workspace, name)
            })
            .await?
            .ok_or_else(|| BlobError::UploadNotFound(format!("{workspace}/{name}")))
    }

    /// Move `session` from `from` to `to`, or report the state it is really in.
    async fn transition(
        &self,
        session: &UploadSession,
        from: UploadState,
        to: UploadState,
    ) -> BlobResult<()> {
        let id = session.upload_id.as_str();
        let moved = self
            .settings
            .retry
            .run("transition upload", || self.db.transition_upload(id, from, to))
            .await?;
        if moved {
            return Ok(());
        }
        let state = self
            .db
            .get_upload(id)
            .await?
            .map_or(session.state, |current| current.state);
        Err(BlobError::InvalidUploadState {
            upload_id: session.upload_id.clone(),
            state,
        })
    }

    /// Settle a `completing` session according to the outcome of its work.
    async fn finish_completion(
        &self,
        session: &UploadSession,
        outcome: BlobResult<ResolvedBlob>,
    ) -> BlobResult<BlobMetadata> {
        match outcome {
            Ok(stored) => {
                if let Err(err) = self
                    .transition(session, UploadState::Completing, UploadState::Completed)
                    .await
                {
                    warn!(upload_id = %session.upload_id, error = %err, "failed to mark upload completed");
                }
                info!(
                    upload_id = %session.upload_id,
                    workspace = %session.workspace,
                    name = %session.name,
                    hash = %stored.hash,
                    "completed upload"
                );
                Ok(BlobMetadata::from(&stored))
            }
            Err(err) => {
                if let Err(revert) = self
                    .transition(session, UploadState::Completing, UploadState::Created)
                    .await
                {
                    warn!(upload_id = %session.upload_id, error = %revert, "failed to reopen upload");
                }
                Err(err)
            }
        }
    }

    /// Release whatever the bucket holds for `session` and mark it aborted.
    async fn abort_session(&self, session: &UploadSession, from: UploadState) -> BlobResult<()> {
        self.transition(session, from, UploadState::Aborting).await?;
        let shard = self.shard(&session.location)?;
        let released = match session.kind {
            UploadKind::Multipart => {
                self.settings
                    .retry
                    .run("abort multipart", || {
                        shard
                            .bucket
                            .abort_multipart(&session.filename, &session.upload_id)
                    })
                    .await
            }
            UploadKind::Signed => {
                self.spawn_cleanup(shard, session.filename.clone(), "aborted signed upload");
                Ok(())
            }
        };
        if let Err(err) = released {
            if let Err(revert) = self.transition(session, UploadState::Aborting, from).await {
                warn!(upload_id = %session.upload_id, error = %revert, "failed to reopen upload");
            }
            return Err(err);
        }
        self.transition(session, UploadState::Aborting, UploadState::Aborted)
            .await?;
        info!(
            upload_id = %session.upload_id,
            workspace = %session.workspace,
            name = %session.name,
            "aborted upload"
        );
        Ok(())
    }

    /// Abort on behalf of a client: repeating an abort is a no-op, aborting a
    /// completed upload is refused.
    async fn abort_requested(&self, session: UploadSession) -> BlobResult<()> {
        let result = match session.state {
            UploadState::Aborted => return Ok(()),
            UploadState::Created => self.abort_session(&session, UploadState::Created).await,
            state => Err(BlobError::InvalidUploadState {
                upload_id: session.upload_id.clone(),
                state,
            }),
        };
        match result {
            Err(BlobError::InvalidUploadState {
                state: UploadState::Aborted,
                ..
            }) => Ok(()),
            other => other,
        }
    }

    /// Expire a stale session: finish it if its object made it into the
    /// bucket, abort it otherwise. Returns whether the upload was recovered.
    pub(crate) async fn expire_session(&self, session: &UploadSession) -> BlobResult<bool> {
        let shard = self.shard(&session.location)?;
        let object = self
            .settings
            .retry
            .run("head object", || shard.bucket.head(&session.filename))
            .await?;
        if object.is_none() {
            self.abort_session(session, session.state).await?;
            return Ok(false);
        }
        if session.state == UploadState::Created {
            self.transition(session, UploadState::Created, UploadState::Completing)
                .await?;
        }
        let outcome = self
            .reconcile_at(&session.workspace, &session.name, shard, &session.filename)
            .await;
        self.finish_completion(session, outcome).await?;
        Ok(true)
    }

    /// Open a multipart upload for `workspace/name` and return its id.
    pub async fn start_multipart(
        &self,
        workspace: &str,
        name: &str,
        content_type: &str,
    ) -> BlobResult<String> {
        ensure_target(workspace, name)?;
        let shard = self.locations.select(workspace);
        let content_type = if content_type.trim().is_empty() {
            "application/octet-stream"
        } else {
            content_type.trim()
        };

        let mut session = new_session(
            String::new(),
            UploadKind::Multipart,
            workspace,
            name,
            &shard.location,
            content_type,
        );
        session.upload_id = shard
            .bucket
            .create_multipart(&session.filename, content_type)
            .await?;

        if let Err(err) = self.db.insert_upload(&session).await {
            if let Err(abort) = shard
                .bucket
                .abort_multipart(&session.filename, &session.upload_id)
                .await
            {
                warn!(upload_id = %session.upload_id, error = %abort, "failed to release multipart upload");
            }
            return Err(err);
        }
        info!(workspace, name, upload_id = %session.upload_id, "started multipart upload");
        Ok(session.upload_id)
    }

    /// Store one part. Parts may arrive in any order and be re-sent.
    pub async fn upload_part<'a, S>(
        &self,
        workspace: &str,
        name: &str,
        upload_id: &str,
        part_number: u32,
        body: S,
    ) -> BlobResult<CompletedPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(BlobError::bad_request(format!(
                "part number must be between 1 and {MAX_PART_NUMBER}"
            )));
        }
        let session = self.multipart_session(workspace, name, upload_id).await?;
        if session.state != UploadState::Created {
            return Err(BlobError::InvalidUploadState {
                upload_id: session.upload_id,
                state: session.state,
            });
        }
        let shard = self.shard(&session.location)?;
        let body: ByteStream<'a> = Box::pin(body);
        shard
            .bucket
            .upload_part(&session.filename, upload_id, part_number, body)
            .await
    }

    /// Assemble the listed parts and record the result as `workspace/name`.
    pub async fn complete_multipart(
        &self,
        workspace: &str,
        name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<BlobMetadata> {
        let session = self.multipart_session(workspace, name, upload_id).await?;
        self.transition(&session, UploadState::Created, UploadState::Completing)
            .await?;

        let outcome = async {
            let shard = self.shard(&session.location)?;
            let assembled = self
                .settings
                .retry
                .run("head object", || shard.bucket.head(&session.filename))
                .await?
                .is_some();
            if !assembled {
                if parts.is_empty() {
                    return Err(BlobError::bad_request("no parts to complete"));
                }
                shard
                    .bucket
                    .complete_multipart(&session.filename, upload_id, parts)
                    .await?;
            }
            self.reconcile_at(workspace, name, shard, &session.filename)
                .await
        }
        .await;
        self.finish_completion(&session, outcome).await
    }

    pub async fn abort_multipart(&self, workspace: &str, name: &str, upload_id: &str) -> BlobResult<()> {
        let session = self.multipart_session(workspace, name, upload_id).await?;
        self.abort_requested(session).await
    }

    /// Authorize a direct client write for `workspace/name`.
    ///
    /// A still-open earlier authorization for the same name is aborted.
    pub async fn create_signed_upload(
        &self,
        workspace: &str,
        name: &str,
        content_type: &str,
    ) -> BlobResult<SignedUpload> {
        ensure_target(workspace, name)?;
        if let Some(previous) = self
            .db
            .latest_upload(UploadKind::Signed, workspace, name)
            .await?
            .filter(|s| s.state == UploadState::Created)
        {
            if let Err(err) = self.abort_session(&previous, UploadState::Created).await {
                warn!(upload_id = %previous.upload_id, error = %err, "failed to abort replaced signed upload");
            }
        }

        let shard = self.locations.select(workspace);
        let mut session = new_session(
            Uuid::new_v4().simple().to_string(),
            UploadKind::Signed,
            workspace,
            name,
            &shard.location,
            content_type.trim(),
        );
        let signed = self.signer.sign_put(&shard.location, &session.filename);
        session.expires_at = Some(signed.expires_at);
        self.db.insert_upload(&session).await?;
        info!(workspace, name, upload_id = %session.upload_id, "issued signed upload");
        Ok(signed)
    }

    /// Record the object the client wrote through its signed URL.
    pub async fn complete_signed_upload(&self, workspace: &str, name: &str) -> BlobResult<BlobMetadata> {
        let session = self.signed_session(workspace, name).await?;
        if session.state != UploadState::Created {
            return Err(BlobError::InvalidUploadState {
                upload_id: session.upload_id,
                state: session.state,
            });
        }
        self.transition(&session, UploadState::Created, UploadState::Completing)
            .await?;
        let outcome = async {
            let shard = self.shard(&session.location)?;
            self.reconcile_at(workspace, name, shard, &session.filename)
                .await
        }
        .await;
        self.finish_completion(&session, outcome).await
    }

    pub async fn abort_signed_upload(&self, workspace: &str, name: &str) -> BlobResult<()> {
        let session = self.signed_session(workspace, name).await?;
        self.abort_requested(session).await
    }

    /// Accept a write presented with a signed URL.
    ///
    /// The write lands only while its session is still `created`, and only
    /// once: an object already at `key` is never replaced. Without a
    /// `Content-Type` the type declared when the URL was issued is used.
    pub async fn write_signed<'a, S>(
        &self,
        location: &Location,
        key: &str,
        expires: i64,
        signature: &str,
        body: S,
        content_type: &str,
    ) -> BlobResult<ObjectHead>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        if !self
            .signer
            .verify(location, key, expires, signature, Utc::now())
        {
            return Err(BlobError::Forbidden("invalid or expired signature".into()));
        }
        let session = self
            .settings
            .retry
            .run("get upload", || {
                self.db.upload_for_object(UploadKind::Signed, location, key)
            })
            .await?
            .ok_or_else(|| BlobError::Forbidden("no signed upload reserved this object".into()))?;
        if session.state != UploadState::Created {
            return Err(BlobError::InvalidUploadState {
                upload_id: session.upload_id,
                state: session.state,
            });
        }

        let shard = self.shard(location)?;
        let content_type = [content_type.trim(), session.content_type.trim()]
            .into_iter()
            .find(|ct| !ct.is_empty())
            .unwrap_or("application/octet-stream");
        let head = match shard
            .bucket
            .put(key, Box::pin(body), PutOptions::new(content_type).if_absent())
            .await
        {
            Ok(head) => head,
            Err(BlobError::AlreadyExists(_)) => {
                return Err(BlobError::Forbidden("signed upload was already written".into()));
            }
            Err(err) => return Err(err),
        };

        // An abort that ran during the write has already cleaned up; the
        // object written after it would otherwise be left behind.
        let state = self
            .db
            .get_upload(&session.upload_id)
            .await?
            .map_or(session.state, |current| current.state);
        if matches!(state, UploadState::Aborting | UploadState::Aborted) {
            self.spawn_cleanup(shard, key.to_string(), "signed write after abort");
            return Err(BlobError::InvalidUploadState {
                upload_id: session.upload_id,
                state,
            });
        }
        Ok(head)
    }
}
