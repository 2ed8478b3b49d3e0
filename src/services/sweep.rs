//! Mark-and-sweep of unreferenced content and stale upload sessions.
//!
//! A data row is garbage once no active blob points at it and it is older
//! than the grace period. The grace period covers the window in which an
//! upload has inserted its data row but a concurrent dedup hit has not yet
//! linked to it. The row is deleted first and only then its object, so a
//! crash between the two leaves an orphan object, never a dangling row.

use super::{BlobService, error::BlobResult};
use crate::models::upload::UploadKind;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// What one sweep pass did.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub data_rows: usize,
    pub objects: usize,
    pub uploads_recovered: usize,
    pub uploads_aborted: usize,
}

impl BlobService {
    /// Run one full sweep.
    pub async fn sweep(&self) -> BlobResult<SweepReport> {
        let mut report = SweepReport::default();
        self.expire_uploads(&mut report).await?;
        self.collect_garbage(&mut report).await?;
        info!(
            data_rows = report.data_rows,
            objects = report.objects,
            uploads_recovered = report.uploads_recovered,
            uploads_aborted = report.uploads_aborted,
            "sweep finished"
        );
        Ok(report)
    }

    async fn expire_uploads(&self, report: &mut SweepReport) -> BlobResult<()> {
        let now = Utc::now();
        let mut stale = self.db.stale_uploads(UploadKind::Signed, now).await?;
        stale.extend(
            self.db
                .stale_uploads(UploadKind::Multipart, now - self.settings.multipart_ttl)
                .await?,
        );

        for session in stale {
            match self.expire_session(&session).await {
                Ok(true) => report.uploads_recovered += 1,
                Ok(false) => report.uploads_aborted += 1,
                Err(err) => {
                    warn!(upload_id = %session.upload_id, error = %err, "failed to expire upload")
                }
            }
        }
        Ok(())
    }

    async fn collect_garbage(&self, report: &mut SweepReport) -> BlobResult<()> {
        let cutoff = Utc::now() - self.settings.sweep_grace;
        let batch = self.settings.sweep_batch.max(1);
        loop {
            let candidates = self.db.unreferenced_data(cutoff, batch).await?;
            let exhausted = candidates.len() < batch;
            let mut progressed = false;

            for data in candidates {
                // Re-checked under the delete: a blob may have linked meanwhile.
                if !self
                    .db
                    .delete_unreferenced_data(&data.hash, &data.location)
                    .await?
                {
                    continue;
                }
                progressed = true;
                report.data_rows += 1;

                let Some(shard) = self.locations.shard(&data.location) else {
                    warn!(location = %data.location, key = %data.filename, "no bucket for swept object");
                    continue;
                };
                match self
                    .settings
                    .retry
                    .run("delete object", || shard.bucket.delete(&data.filename))
                    .await
                {
                    Ok(()) => report.objects += 1,
                    Err(err) => {
                        warn!(location = %data.location, key = %data.filename, error = %err, "failed to delete swept object")
                    }
                }
            }

            if exhausted || !progressed {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        ServiceSettings,
        bucket::{PutOptions, body},
        testing::{harness_with, small_settings},
    };
    use crate::models::upload::UploadState;
    use bytes::Bytes;
    use chrono::Duration;

    fn no_grace() -> ServiceSettings {
        ServiceSettings {
            sweep_grace: Duration::seconds(-1),
            multipart_ttl: Duration::seconds(-1),
            sweep_batch: 2,
            ..small_settings(64)
        }
    }

    #[tokio::test]
    async fn removes_only_unreferenced_content() {
        let h = harness_with(&["weur"], no_grace()).await;
        let svc = &h.service;
        svc.put_blob("ws", "a", Bytes::from_static(b"shared"), "").await.unwrap();
        svc.put_blob("ws", "b", Bytes::from_static(b"shared"), "").await.unwrap();
        for name in ["x", "y", "z"] {
            svc.put_blob("ws", name, Bytes::from(format!("only {name}")), "")
                .await
                .unwrap();
            svc.delete("ws", name).await.unwrap();
        }
        svc.delete("ws", "a").await.unwrap();

        let report = svc.sweep().await.unwrap();
        assert_eq!(report.data_rows, 3);
        assert_eq!(report.objects, 3);
        assert_eq!(h.data_rows().await, 1);
        assert_eq!(h.object_files(), 1);
        assert_eq!(svc.get_blob("ws", "b").await.unwrap(), Bytes::from_static(b"shared"));

        assert_eq!(svc.sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn grace_period_protects_fresh_content() {
        let h = harness_with(&["weur"], small_settings(64)).await;
        let svc = &h.service;
        svc.put_blob("ws", "a", Bytes::from_static(b"fresh"), "").await.unwrap();
        svc.delete("ws", "a").await.unwrap();

        let report = svc.sweep().await.unwrap();
        assert_eq!(report.data_rows, 0);
        assert_eq!(h.data_rows().await, 1);
    }

    #[tokio::test]
    async fn expires_stale_sessions() {
        let h = harness_with(&["weur"], no_grace()).await;
        let svc = &h.service;

        // An abandoned multipart upload.
        let id = svc.start_multipart("ws", "mp", "").await.unwrap();
        svc.upload_part("ws", "mp", &id, 1, body("part")).await.unwrap();

        // A signed upload whose object arrived but was never completed.
        svc.create_signed_upload("ws", "signed", "").await.unwrap();
        let session = svc
            .db
            .latest_upload(UploadKind::Signed, "ws", "signed")
            .await
            .unwrap()
            .unwrap();
        h.bucket("ws")
            .put(&session.filename, body("arrived"), PutOptions::new("text/plain"))
            .await
            .unwrap();
        sqlx::query("UPDATE upload SET expires_at = ? WHERE upload_id = ?")
            .bind(Utc::now() - Duration::minutes(1))
            .bind(&session.upload_id)
            .execute(&*svc.db.db)
            .await
            .unwrap();

        let report = svc.sweep().await.unwrap();
        assert_eq!(report.uploads_recovered, 1);
        assert_eq!(report.uploads_aborted, 1);

        assert_eq!(
            svc.get_blob("ws", "signed").await.unwrap(),
            Bytes::from_static(b"arrived")
        );
        let aborted = svc.db.get_upload(&id).await.unwrap().unwrap();
        assert_eq!(aborted.state, UploadState::Aborted);
    }
}
