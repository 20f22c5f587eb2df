//! Streaming downloads with progress reporting

use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::error::{FetchError, Result};

/// Receives byte-level download progress
pub trait ProgressSink: Send + Sync {
    /// A download of `total` bytes (when known) is starting
    fn started(&self, label: &str, total: Option<u64>);

    /// `downloaded` bytes have been written so far
    fn advanced(&self, downloaded: u64);

    fn finished(&self);
}

/// Shared handle to an optional progress sink
pub type Progress = Option<Arc<dyn ProgressSink>>;

/// Stream a successful response body into `dest`, returning the byte count
///
/// The file is flushed and closed before returning, so callers can move it.
pub async fn stream_to_file(
    response: reqwest::Response,
    dest: &Path,
    label: &str,
    progress: &Progress,
) -> Result<u64> {
    let total = response.content_length();
    if let Some(sink) = progress {
        sink.started(label, total);
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from)?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(sink) = progress {
            sink.advanced(downloaded);
        }
    }

    file.flush().await?;
    drop(file);

    if let Some(sink) = progress {
        sink.finished();
    }
    tracing::debug!("Wrote {} bytes to {}", downloaded, dest.display());
    Ok(downloaded)
}

/// Turn a non-success response into an `HttpError`, reading the body
pub async fn ensure_success(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::HttpError {
        status: status.as_u16(),
        message: format!(
            "Request to {} failed: {}{}",
            url,
            status.canonical_reason().unwrap_or("Unknown"),
            if body.trim().is_empty() {
                String::new()
            } else {
                format!(" {}", body.trim())
            }
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ProgressSink for Recorder {
        fn started(&self, label: &str, total: Option<u64>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("start {} {:?}", label, total));
        }

        fn advanced(&self, _downloaded: u64) {}

        fn finished(&self) {
            self.events.lock().unwrap().push("done".to_string());
        }
    }

    #[tokio::test]
    async fn test_stream_to_file_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 2048]))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file.bin");
        let recorder = Arc::new(Recorder::default());
        let progress: Progress = Some(recorder.clone());

        let response = reqwest::get(format!("{}/file", server.uri())).await.unwrap();
        let written = stream_to_file(response, &dest, "file", &progress).await.unwrap();

        assert_eq!(written, 2048);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 2048);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.first().unwrap(), "start file Some(2048)");
        assert_eq!(events.last().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_ensure_success_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let url = format!("{}/x", server.uri());
        let response = reqwest::get(&url).await.unwrap();
        let err = ensure_success(response, &url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpError { status: 503, .. }));
        assert!(err.is_transient());
        assert!(err.to_string().contains("busy"));
    }
}
