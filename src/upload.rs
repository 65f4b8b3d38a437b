//! Recording upload to the call-history backend.
//!
//! After teardown of a recorded call, the captured audio file is read,
//! base64-encoded, and POSTed as JSON to `/api/calls/save`. The local file
//! is deleted whether or not the upload succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::effects::RecordingArtifact;
use crate::error::CallError;

/// Call identity carried from session start to upload time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecordMeta {
    pub caller_id: String,
    pub receiver_id: String,
    pub start_time: DateTime<Utc>,
    pub ended_by: String,
}

/// A finished, recorded call ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub meta: CallRecordMeta,
    pub end_time: DateTime<Utc>,
    pub artifact: RecordingArtifact,
}

impl CallRecord {
    pub fn new(meta: CallRecordMeta, artifact: RecordingArtifact) -> Self {
        Self {
            meta,
            end_time: Utc::now(),
            artifact,
        }
    }
}

/// Delivers finished call records to persistent storage.
#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(&self, record: &CallRecord) -> Result<(), CallError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveCallBody {
    caller_id: String,
    receiver_id: String,
    start_time: String,
    end_time: String,
    /// `HH:MM:SS`.
    duration: String,
    /// Base64-encoded audio file.
    recording: String,
    file_name: String,
    ended_by: String,
}

fn format_duration(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Uploader backed by the REST API.
pub struct HttpRecordingUploader {
    api_base_url: String,
}

impl HttpRecordingUploader {
    pub fn new(api_base_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            api_base_url: api_base_url.into(),
        })
    }

    fn build_body(record: &CallRecord, audio: &[u8]) -> SaveCallBody {
        let file_name = record
            .artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.mp3".to_string());
        let duration = record
            .end_time
            .signed_duration_since(record.meta.start_time)
            .num_seconds();
        SaveCallBody {
            caller_id: record.meta.caller_id.clone(),
            receiver_id: record.meta.receiver_id.clone(),
            start_time: record.meta.start_time.to_rfc3339(),
            end_time: record.end_time.to_rfc3339(),
            duration: format_duration(duration),
            recording: BASE64.encode(audio),
            file_name,
            ended_by: record.meta.ended_by.clone(),
        }
    }

    async fn post_record(&self, record: &CallRecord) -> Result<(), CallError> {
        let audio = tokio::fs::read(&record.artifact.path)
            .await
            .map_err(|e| CallError::Upload(format!("reading recording file: {e}")))?;

        let body = serde_json::to_vec(&Self::build_body(record, &audio))
            .map_err(|e| CallError::Upload(format!("encoding request body: {e}")))?;
        let url = format!("{}/api/calls/save", self.api_base_url);
        debug!("Uploading recording ({} bytes) to {url}", audio.len());

        let status = tokio::task::spawn_blocking(move || -> Result<u16, CallError> {
            let response = ureq::post(&url)
                .header("Content-Type", "application/json")
                .send(&body[..])
                .map_err(|e| CallError::Upload(e.to_string()))?;
            Ok(response.status().as_u16())
        })
        .await
        .map_err(|e| CallError::Upload(format!("upload task panicked: {e}")))??;

        if !(200..300).contains(&status) {
            return Err(CallError::Upload(format!(
                "server responded with status {status}"
            )));
        }
        debug!("Recording upload accepted with status {status}");
        Ok(())
    }
}

#[async_trait]
impl RecordingUploader for HttpRecordingUploader {
    async fn upload(&self, record: &CallRecord) -> Result<(), CallError> {
        let result = self.post_record(record).await;

        // The artifact is single-use: remove it even when the upload failed.
        if let Err(e) = tokio::fs::remove_file(&record.artifact.path).await {
            warn!(
                "Could not remove recording file {}: {e}",
                record.artifact.path.display()
            );
        }

        result
    }
}
