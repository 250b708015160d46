//! HTTP implementation of the transfer primitive, with resume support.
//!
//! This is the transfer client the app ships with:
//! - Resumable downloads via HTTP Range requests
//! - Progress fractions for UI updates
//! - SHA-256 of the delivered bytes for verification
//! - Cooperative cancellation

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::hash_file;
use super::transfer::{
    BoxFuture, ProgressSink, TransferClient, TransferError, TransferOutcome, TransferRequest,
    TransferTask,
};

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// HTTP-based transfer client.
#[derive(Debug, Clone)]
pub struct HttpTransferClient {
    client: Client,
    timeout: Duration,
}

impl Default for HttpTransferClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransferClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, timeout }
    }

    /// The configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl TransferClient for HttpTransferClient {
    fn begin(&self, request: TransferRequest, on_progress: ProgressSink) -> Arc<dyn TransferTask> {
        let token = CancellationToken::new();
        let worker = run_transfer(self.client.clone(), request, on_progress, token.clone());
        let handle = tokio::spawn(worker);

        Arc::new(HttpTransferTask {
            token,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// One in-flight HTTP transfer.
struct HttpTransferTask {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<Option<TransferOutcome>>>>,
}

impl TransferTask for HttpTransferTask {
    fn cancel(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        self.token.cancel();
        Box::pin(async { Ok(()) })
    }

    fn join(&self) -> BoxFuture<'_, Option<TransferOutcome>> {
        let handle = self.handle.lock().take();
        Box::pin(async move {
            match handle {
                Some(handle) => handle.await.ok().flatten(),
                None => None,
            }
        })
    }
}

/// Drive one transfer to its terminal outcome.
async fn run_transfer(
    client: Client,
    request: TransferRequest,
    on_progress: ProgressSink,
    token: CancellationToken,
) -> Option<TransferOutcome> {
    match stream_to_disk(&client, &request, &on_progress, &token).await {
        Ok(outcome) => Some(outcome),
        Err(TransferError::Cancelled) => {
            debug!(url = %request.source_url, "transfer cancelled");
            None
        }
        Err(err) => {
            warn!(url = %request.source_url, error = %err, "transfer failed");
            None
        }
    }
}

async fn stream_to_disk(
    client: &Client,
    request: &TransferRequest,
    on_progress: &ProgressSink,
    token: &CancellationToken,
) -> Result<TransferOutcome, TransferError> {
    let url = &request.source_url;
    let (total_size, supports_range) = query_file_info(client, url).await?;

    // Check existing staging bytes for resume.
    let existing_size = match fs::metadata(&request.destination).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    };
    let start_byte = if existing_size > 0
        && supports_range
        && (total_size == 0 || existing_size < total_size)
    {
        existing_size
    } else {
        0
    };

    let mut file = prepare_destination(&request.destination, start_byte).await?;

    let mut http_request = client.get(url);
    if start_byte > 0 {
        http_request = http_request.header("Range", format!("bytes={}-", start_byte));
    }

    let response = tokio::select! {
        response = http_request.send() => {
            response.map_err(|err| TransferError::Request(err.to_string()))?
        }
        _ = token.cancelled() => return Err(TransferError::Cancelled),
    };

    // 200 OK for fresh downloads, 206 Partial Content for resumes.
    let status = response.status();
    if !status.is_success() && status.as_u16() != 206 {
        return Err(TransferError::Status {
            url: url.clone(),
            status: status.as_u16(),
        });
    }
    let http_status = status.as_u16();

    let mut stream = response.bytes_stream();
    let mut written = start_byte;
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = token.cancelled() => {
                let _ = file.flush().await;
                return Err(TransferError::Cancelled);
            }
        };
        match chunk {
            Some(Ok(bytes)) => {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
                if total_size > 0 {
                    on_progress((written as f64 / total_size as f64).clamp(0.0, 1.0));
                }
            }
            Some(Err(err)) => return Err(TransferError::Request(err.to_string())),
            None => break,
        }
    }
    file.flush().await?;

    // Hash the full staging file so resumed bytes are covered too.
    let content_hash = if request.verify_hash {
        match hash_file(&request.destination).await {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(path = %request.destination.display(), error = %err, "hashing delivered bytes failed");
                None
            }
        }
    } else {
        None
    };

    on_progress(1.0);

    Ok(TransferOutcome {
        temp_path: request.destination.clone(),
        content_hash,
        http_status,
    })
}

/// Query total size and Range support via a HEAD request.
async fn query_file_info(client: &Client, url: &str) -> Result<(u64, bool), TransferError> {
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|err| TransferError::Request(err.to_string()))?;

    if !response.status().is_success() {
        return Err(TransferError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_size = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);

    let supports_range = response
        .headers()
        .get("accept-ranges")
        .map(|value| value.to_str().unwrap_or("") == "bytes")
        .unwrap_or(false);

    Ok((total_size, supports_range))
}

/// Open the staging file for appending (resume) or creation (fresh start).
async fn prepare_destination(destination: &Path, start_byte: u64) -> Result<File, TransferError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    if start_byte > 0 {
        Ok(OpenOptions::new().append(true).open(destination).await?)
    } else {
        Ok(File::create(destination).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default_timeout() {
        let client = HttpTransferClient::default();
        assert_eq!(client.timeout().as_secs(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_client_with_custom_timeout() {
        let client = HttpTransferClient::with_timeout(Duration::from_secs(60));
        assert_eq!(client.timeout().as_secs(), 60);
    }

    #[tokio::test]
    async fn test_prepare_destination_creates_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("nested").join("track.mp3.part");

        let mut file = prepare_destination(&destination, 0).await.expect("prepare");
        file.write_all(b"bytes").await.expect("write");
        file.flush().await.expect("flush");

        assert_eq!(
            tokio::fs::read(&destination).await.expect("read"),
            b"bytes"
        );
    }

    #[tokio::test]
    async fn test_prepare_destination_appends_on_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("track.mp3.part");
        tokio::fs::write(&destination, b"first").await.expect("seed");

        let mut file = prepare_destination(&destination, 5).await.expect("prepare");
        file.write_all(b"-second").await.expect("write");
        file.flush().await.expect("flush");

        assert_eq!(
            tokio::fs::read(&destination).await.expect("read"),
            b"first-second"
        );
    }

    #[tokio::test]
    async fn test_cancelled_task_joins_to_none() {
        let client = HttpTransferClient::with_timeout(Duration::from_secs(2));
        let request = TransferRequest {
            // Nothing should ever answer here; cancellation must still
            // resolve the join promptly.
            source_url: "http://127.0.0.1:9/unreachable.mp3".to_string(),
            destination: std::env::temp_dir().join("earmark-test-cancel.part"),
            verify_hash: false,
        };
        let task = client.begin(request, Arc::new(|_| {}));

        task.cancel().await.expect("cancel");
        assert!(task.join().await.is_none());
    }
}
