//! HTTP downloads from asset mirrors.
//!
//! Files are spread round-robin over the configured base URLs and up to
//! [`DownloadSettings::max_simultaneous`] requests run at once. Bytes are
//! hashed as they arrive, so verification costs nothing once the last chunk
//! is in.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::manager::{
    Batch, DownloadError, DownloadErrorKind, DownloadEvent, DownloadManager, DownloadSettings,
    FileEntry, PendingFile, finalize_checksum,
};

/// Identifier of a request issued by a [`WebService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebError {
    /// The server answered 404.
    #[error("not found")]
    NotFound,
    /// The server answered another error status.
    #[error("HTTP status {0}")]
    Status(u16),
    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Progress of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebEvent {
    /// Body bytes arrived.
    Data {
        /// Request.
        id: RequestId,
        /// Next slice of the body.
        chunk: Vec<u8>,
    },
    /// The body is complete.
    Finished {
        /// Request.
        id: RequestId,
    },
    /// The request failed; no further event follows.
    Failed {
        /// Request.
        id: RequestId,
        /// Reason.
        error: WebError,
    },
}

/// Non-blocking HTTP client.
pub trait WebService {
    /// Start a GET request.
    fn start_request(&mut self, url: &str) -> RequestId;

    /// Next event of any request. Never blocks.
    fn poll(&mut self) -> Option<WebEvent>;

    /// Abort a request; none of its events is reported afterwards.
    fn cancel(&mut self, id: RequestId);
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

struct HttpFile {
    file: PendingFile,
    mirror: usize,
    not_found: usize,
}

struct ActiveRequest {
    pending: HttpFile,
    hasher: Sha1,
    buffer: Vec<u8>,
}

/// Downloads files over HTTP from a set of mirrors.
pub struct HttpDownloadManager<W: WebService> {
    service: W,
    base_urls: Vec<String>,
    settings: DownloadSettings,
    download_url_index: usize,
    queue: VecDeque<HttpFile>,
    active: FxHashMap<RequestId, ActiveRequest>,
    batch: Batch,
}

impl<W: WebService> HttpDownloadManager<W> {
    /// Create a manager fetching from `base_urls` through `service`.
    pub fn new(
        service: W,
        base_urls: Vec<String>,
        settings: DownloadSettings,
    ) -> Result<Self, DownloadError> {
        if base_urls.is_empty() {
            return Err(DownloadError::NoMirrors);
        }
        Ok(Self {
            service,
            base_urls,
            settings,
            download_url_index: 0,
            queue: VecDeque::new(),
            active: FxHashMap::default(),
            batch: Batch::default(),
        })
    }

    /// Number of requests in flight.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The underlying web service.
    pub fn service(&self) -> &W {
        &self.service
    }

    fn launch(&mut self, pending: HttpFile) {
        let url = join_url(
            &self.base_urls[pending.mirror],
            &pending.file.entry.download_path,
        );
        tracing::debug!(%url, "requesting file");
        let id = self.service.start_request(&url);
        self.batch.push(DownloadEvent::Started {
            path: pending.file.entry.download_path.clone(),
        });
        self.active.insert(
            id,
            ActiveRequest {
                pending,
                hasher: Sha1::new(),
                buffer: Vec::new(),
            },
        );
    }

    fn on_data(&mut self, id: RequestId, chunk: Vec<u8>) {
        let Some(request) = self.active.get_mut(&id) else {
            return;
        };
        let entry = &request.pending.file.entry;
        if (request.buffer.len() + chunk.len()) as u64 > entry.expected_size {
            self.service.cancel(id);
            if let Some(request) = self.active.remove(&id) {
                self.fail(request.pending, DownloadErrorKind::SizeMismatch);
            }
            return;
        }

        request.hasher.update(&chunk);
        request.buffer.extend_from_slice(&chunk);
        let progress = DownloadEvent::Progress {
            path: entry.download_path.clone(),
            downloaded: request.buffer.len() as u64,
            total: entry.expected_size,
        };
        self.batch.push(progress);
    }

    fn on_finished(&mut self, id: RequestId) {
        let Some(request) = self.active.remove(&id) else {
            return;
        };
        let entry = &request.pending.file.entry;
        if request.buffer.len() as u64 != entry.expected_size {
            self.fail(request.pending, DownloadErrorKind::SizeMismatch);
            return;
        }
        if finalize_checksum(request.hasher) != entry.checksum {
            self.fail(request.pending, DownloadErrorKind::ChecksumMismatch);
            return;
        }
        self.batch.complete(&request.pending.file.entry, request.buffer);
    }

    fn on_failed(&mut self, id: RequestId, error: WebError) {
        let Some(request) = self.active.remove(&id) else {
            return;
        };
        let mut pending = request.pending;
        tracing::debug!(
            path = %pending.file.entry.download_path,
            mirror = %self.base_urls[pending.mirror],
            %error,
            "request failed"
        );

        if error == WebError::NotFound {
            pending.not_found += 1;
            if pending.not_found < self.base_urls.len() {
                pending.mirror = (pending.mirror + 1) % self.base_urls.len();
                self.queue.push_front(pending);
            } else {
                self.batch
                    .failed(pending.file.entry.download_path, DownloadErrorKind::FileNotFound);
            }
            return;
        }
        self.fail(pending, DownloadErrorKind::TransferFailed);
    }

    fn fail(&mut self, mut pending: HttpFile, kind: DownloadErrorKind) {
        if pending.file.retry(kind, &self.settings) {
            pending.mirror = (pending.mirror + 1) % self.base_urls.len();
            self.queue.push_front(pending);
        } else {
            self.batch.failed(pending.file.entry.download_path, kind);
        }
    }
}

impl<W: WebService> DownloadManager for HttpDownloadManager<W> {
    fn register_file(&mut self, entry: FileEntry) -> Result<(), DownloadError> {
        self.batch.register(&entry.download_path)?;
        let mirror = self.download_url_index % self.base_urls.len();
        self.download_url_index += 1;
        self.queue.push_back(HttpFile {
            file: PendingFile::new(entry),
            mirror,
            not_found: 0,
        });
        Ok(())
    }

    fn start(&mut self) {
        if self.batch.start() {
            tracing::info!(
                files = self.queue.len(),
                mirrors = self.base_urls.len(),
                "starting HTTP downloads"
            );
        }
    }

    fn update(&mut self) {
        if !self.batch.is_started() {
            return;
        }

        while let Some(event) = self.service.poll() {
            match event {
                WebEvent::Data { id, chunk } => self.on_data(id, chunk),
                WebEvent::Finished { id } => self.on_finished(id),
                WebEvent::Failed { id, error } => self.on_failed(id, error),
            }
        }

        while self.active.len() < self.settings.max_simultaneous.max(1) {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            self.launch(pending);
        }
    }

    fn poll_event(&mut self) -> Option<DownloadEvent> {
        self.batch.pop()
    }

    fn is_finished(&self) -> bool {
        self.batch.is_done()
    }
}

impl<W: WebService> Drop for HttpDownloadManager<W> {
    fn drop(&mut self) {
        for id in self.active.keys().copied().collect::<Vec<_>>() {
            self.service.cancel(id);
        }
    }
}
