use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::multipart::{Form, Part};
use serde::Serialize;

use crate::calendar::UploadPayload;
use crate::config::WorkspaceConfig;
use crate::error::{RejectionReason, Result, WorkspaceError};

/// Same ceiling the parse backend enforces.
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;
/// How long a rejection message stays visible.
pub const FILE_REJECTION_TTL: Duration = Duration::from_secs(3);

const CALENDAR_MIME: &str = "text/calendar";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts a `.ics` name (any case) or a `text/calendar` MIME type, within
/// the size ceiling.
pub fn validate_calendar_file(name: &str, mime: Option<&str>, size: u64) -> Result<()> {
    let reject = |reason| WorkspaceError::InvalidFileType {
        name: name.to_string(),
        reason,
    };

    let by_name = name.to_ascii_lowercase().ends_with(".ics");
    let by_mime = mime
        .and_then(|value| value.split(';').next())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(CALENDAR_MIME));
    if !by_name && !by_mime {
        return Err(reject(RejectionReason::NotCalendar));
    }
    if size == 0 {
        return Err(reject(RejectionReason::Empty));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(reject(RejectionReason::TooLarge));
    }
    Ok(())
}

/// A user-visible rejection that dismisses itself after [`FILE_REJECTION_TTL`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRejection {
    pub file_name: String,
    pub message: String,
    pub dismiss_after_ms: u64,
    #[serde(skip)]
    raised_at: Instant,
}

impl FileRejection {
    pub fn new(file_name: impl Into<String>, reason: RejectionReason) -> Self {
        Self {
            file_name: file_name.into(),
            message: reason.message().to_string(),
            dismiss_after_ms: FILE_REJECTION_TTL.as_millis() as u64,
            raised_at: Instant::now(),
        }
    }

    pub fn from_error(err: &WorkspaceError) -> Option<Self> {
        match err {
            WorkspaceError::InvalidFileType { name, reason } => {
                Some(Self::new(name.clone(), *reason))
            }
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.raised_at) >= FILE_REJECTION_TTL
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarFile {
    pub name: String,
    pub mime: Option<String>,
    pub contents: Vec<u8>,
}

impl CalendarFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            contents: contents.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, contents))
    }

    pub fn validate(&self) -> Result<()> {
        validate_calendar_file(&self.name, self.mime.as_deref(), self.contents.len() as u64)
    }
}

/// Client for the parse backend's `POST /api/ics-upload`.
#[derive(Debug, Clone)]
pub struct UploadClient {
    client: reqwest::Client,
    endpoint: String,
}

impl UploadClient {
    pub fn new(backend_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| WorkspaceError::UploadTransport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/ics-upload", backend_url.trim_end_matches('/')),
        })
    }

    pub fn from_config(config: &WorkspaceConfig) -> Result<Self> {
        Self::new(&config.backend_url)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Validates every file first; nothing is sent unless all of them pass.
    pub async fn upload(&self, files: &[CalendarFile]) -> Result<UploadPayload> {
        if files.is_empty() {
            return Err(WorkspaceError::InvalidFileType {
                name: String::new(),
                reason: RejectionReason::Empty,
            });
        }
        for file in files {
            if let Err(err) = file.validate() {
                tracing::warn!(file = %file.name, error = %err, "upload rejected locally");
                return Err(err);
            }
        }

        let mut form = Form::new();
        for file in files {
            let part = Part::bytes(file.contents.clone())
                .file_name(file.name.clone())
                .mime_str(CALENDAR_MIME)
                .map_err(|err| WorkspaceError::UploadTransport(err.to_string()))?;
            form = form.part("ics_files", part);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|err| WorkspaceError::UploadTransport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "parse backend refused upload");
            return Err(WorkspaceError::UploadRejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| WorkspaceError::UploadTransport(err.to_string()))?;
        let payload = match UploadPayload::parse(&body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "parse backend answered without usable events");
                UploadPayload::default()
            }
        };
        tracing::info!(
            files = files.len(),
            results = payload.entries().len(),
            "upload accepted"
        );
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Offset;

    #[test]
    fn accepts_by_extension_or_mime() {
        assert!(validate_calendar_file("fall.ics", None, 10).is_ok());
        assert!(validate_calendar_file("FALL.ICS", Some("application/octet-stream"), 10).is_ok());
        assert!(validate_calendar_file("export", Some("text/calendar; charset=utf-8"), 10).is_ok());
    }

    #[test]
    fn rejects_other_files() {
        let err = validate_calendar_file("notes.txt", Some("text/plain"), 10).unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::InvalidFileType {
                reason: RejectionReason::NotCalendar,
                ..
            }
        ));
        assert!(err.is_user_error());
        assert!(err.to_string().contains("Only .ics files are allowed"));

        assert!(validate_calendar_file("calendar.ics.txt", None, 10).is_err());
    }

    #[test]
    fn size_limits() {
        assert!(validate_calendar_file("a.ics", None, MAX_UPLOAD_BYTES).is_ok());
        let too_big = validate_calendar_file("a.ics", None, MAX_UPLOAD_BYTES + 1).unwrap_err();
        assert!(matches!(
            too_big,
            WorkspaceError::InvalidFileType {
                reason: RejectionReason::TooLarge,
                ..
            }
        ));
        assert!(validate_calendar_file("a.ics", None, 0).is_err());
    }

    #[test]
    fn rejection_expires_after_ttl() {
        let err = validate_calendar_file("notes.txt", None, 1).unwrap_err();
        let rejection = FileRejection::from_error(&err).unwrap();
        assert_eq!(rejection.file_name, "notes.txt");
        assert_eq!(rejection.dismiss_after_ms, 3000);
        assert!(!rejection.is_expired_at(rejection.raised_at));
        assert!(rejection.is_expired_at(rejection.raised_at + FILE_REJECTION_TTL));
        assert!(FileRejection::from_error(&WorkspaceError::EmptyLabel).is_none());
    }

    #[test]
    fn endpoint_is_derived_from_base() {
        let client = UploadClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8000/api/ics-upload");
    }

    #[tokio::test]
    async fn invalid_file_never_reaches_the_network() {
        // Nothing listens on the discard port; a request would fail as transport.
        let client = UploadClient::new("http://127.0.0.1:9").unwrap();
        let files = vec![CalendarFile::new("notes.txt", "hello").with_mime("text/plain")];
        let err = client.upload(&files).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidFileType { .. }));

        let err = client.upload(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::InvalidFileType {
                reason: RejectionReason::Empty,
                ..
            }
        ));
    }

    /// Answers exactly one request with a canned response and returns the base url.
    async fn answer_once(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            // A sized multipart body ends with the closing boundary, a chunked one
            // with the empty last chunk.
            while !request.ends_with(b"--\r\n") && !request.ends_with(b"0\r\n\r\n") {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
            }
            let response = format!(
                concat!(
                    "HTTP/1.1 {status}\r\n",
                    "Content-Type: text/html\r\n",
                    "Content-Length: {length}\r\n",
                    "Connection: close\r\n\r\n",
                    "{body}"
                ),
                status = status,
                length = body.len(),
                body = body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn unreadable_success_body_gives_an_empty_payload() {
        let base = answer_once("200 OK", "<html>oops</html>").await;
        let client = UploadClient::new(&base).unwrap();
        let files = vec![CalendarFile::new("fall.ics", "BEGIN:VCALENDAR")];

        let payload = client.upload(&files).await.unwrap();
        assert!(payload.entries().is_empty());
        assert!(payload.events(chrono::Utc.fix()).is_empty());
    }

    #[tokio::test]
    async fn error_status_is_a_rejection() {
        let base = answer_once("413 Payload Too Large", "too big").await;
        let client = UploadClient::new(&base).unwrap();
        let files = vec![CalendarFile::new("fall.ics", "BEGIN:VCALENDAR")];

        let err = client.upload(&files).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::UploadRejected { status: 413, ref body } if body == "too big"
        ));
        assert!(!err.is_user_error());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let client = UploadClient::new("http://127.0.0.1:9").unwrap();
        let files = vec![CalendarFile::new("fall.ics", "BEGIN:VCALENDAR")];
        let err = client.upload(&files).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::UploadTransport(_)));
    }
}
