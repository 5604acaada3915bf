//! Shared download contract and batch bookkeeping.
//!
//! Every strategy follows the same lifecycle: files are registered, then
//! [`DownloadManager::start`] is called once and [`DownloadManager::update`]
//! every frame. Each registered file resolves exactly once, either with a
//! [`DownloadEvent::Finished`] or a terminal [`DownloadEvent::Error`], and a
//! single [`DownloadEvent::AllFinished`] follows the last resolution.

use std::collections::VecDeque;
use std::path::PathBuf;

use rustc_hash::FxHashSet;
use sha1::{Digest, Sha1};
use skirmish_protocol::Checksum;

/// Where a downloaded file ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Hand the bytes to the caller.
    Memory,
    /// Write the bytes to this path, creating parent directories.
    File(PathBuf),
}

/// A file to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Protocol-level key of the file.
    pub download_path: String,
    /// Expected SHA-1 of the content.
    pub checksum: Checksum,
    /// Expected size in bytes.
    pub expected_size: u64,
    /// Output of the download.
    pub destination: Destination,
}

impl FileEntry {
    /// Entry kept in memory once downloaded.
    pub fn in_memory(
        download_path: impl Into<String>,
        checksum: Checksum,
        expected_size: u64,
    ) -> Self {
        Self {
            download_path: download_path.into(),
            checksum,
            expected_size,
            destination: Destination::Memory,
        }
    }

    /// Entry written to `output` once downloaded.
    pub fn to_file(
        download_path: impl Into<String>,
        checksum: Checksum,
        expected_size: u64,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            download_path: download_path.into(),
            checksum,
            expected_size,
            destination: Destination::File(output.into()),
        }
    }
}

/// Content of a verified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishedContent {
    /// Bytes of a [`Destination::Memory`] file.
    Memory(Vec<u8>),
    /// Path of a [`Destination::File`] file.
    File(PathBuf),
}

/// Why a file failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadErrorKind {
    /// The content does not hash to the expected checksum.
    ChecksumMismatch,
    /// No source has the file.
    FileNotFound,
    /// The remote size differs from the expected size.
    SizeMismatch,
    /// The transport failed mid-transfer.
    TransferFailed,
    /// The output file could not be written.
    WriteFailed,
}

impl DownloadErrorKind {
    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch | Self::SizeMismatch | Self::TransferFailed
        )
    }
}

/// Progress notification drained with [`DownloadManager::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// A transfer attempt began.
    Started {
        /// Download path.
        path: String,
    },
    /// Bytes arrived.
    Progress {
        /// Download path.
        path: String,
        /// Bytes received so far.
        downloaded: u64,
        /// Expected size.
        total: u64,
    },
    /// The file was verified.
    Finished {
        /// Download path.
        path: String,
        /// Verified content.
        content: FinishedContent,
    },
    /// The file failed terminally.
    Error {
        /// Download path.
        path: String,
        /// Failure reason.
        kind: DownloadErrorKind,
    },
    /// The caller must send a request for this file to the server.
    Request {
        /// Download path.
        path: String,
    },
    /// Every registered file is resolved.
    AllFinished,
}

/// Errors raised by the download API itself.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Files must be registered before `start`.
    #[error("download already started")]
    AlreadyStarted,
    /// The path is already registered.
    #[error("file {0} is already registered")]
    Duplicate(String),
    /// The HTTP manager needs at least one base URL.
    #[error("no mirror configured")]
    NoMirrors,
}

/// Tunables shared by every manager.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Additional attempts for retryable failures. Default: 0.
    pub max_retries: u32,
    /// Concurrent HTTP requests. Default: 2.
    pub max_simultaneous: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            max_simultaneous: 2,
        }
    }
}

/// Common interface of the download strategies.
pub trait DownloadManager {
    /// Queue a file. Must be called before [`start`](Self::start).
    fn register_file(&mut self, entry: FileEntry) -> Result<(), DownloadError>;

    /// Begin downloading.
    fn start(&mut self);

    /// Drive transfers; call once per frame.
    fn update(&mut self);

    /// Next pending event.
    fn poll_event(&mut self) -> Option<DownloadEvent>;

    /// Returns `true` once every registered file is resolved.
    fn is_finished(&self) -> bool;
}

/// SHA-1 of `data`.
pub fn sha1_checksum(data: &[u8]) -> Checksum {
    finalize_checksum(Sha1::new_with_prefix(data))
}

pub(crate) fn finalize_checksum(hasher: Sha1) -> Checksum {
    let mut checksum = [0u8; 20];
    checksum.copy_from_slice(&hasher.finalize());
    checksum
}

/// Hand verified bytes over to their destination.
pub(crate) fn deliver(
    entry: &FileEntry,
    data: Vec<u8>,
) -> Result<FinishedContent, DownloadErrorKind> {
    match &entry.destination {
        Destination::Memory => Ok(FinishedContent::Memory(data)),
        Destination::File(path) => {
            let written = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(path, &data));
            match written {
                Ok(()) => Ok(FinishedContent::File(path.clone())),
                Err(err) => {
                    tracing::error!(path = %path.display(), %err, "failed to write download");
                    Err(DownloadErrorKind::WriteFailed)
                }
            }
        }
    }
}

/// Per-batch event queue plus the "exactly once" completion tracking.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    events: VecDeque<DownloadEvent>,
    registered: FxHashSet<String>,
    resolved: usize,
    started: bool,
    all_finished_sent: bool,
}

impl Batch {
    pub fn register(&mut self, path: &str) -> Result<(), DownloadError> {
        if self.started {
            return Err(DownloadError::AlreadyStarted);
        }
        if !self.registered.insert(path.to_owned()) {
            return Err(DownloadError::Duplicate(path.to_owned()));
        }
        Ok(())
    }

    /// Returns `false` if the batch was already started.
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.check_done();
        true
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn push(&mut self, event: DownloadEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<DownloadEvent> {
        self.events.pop_front()
    }

    pub fn finished(&mut self, path: String, content: FinishedContent) {
        tracing::info!(%path, "download finished");
        self.events.push_back(DownloadEvent::Finished { path, content });
        self.resolve();
    }

    pub fn failed(&mut self, path: String, kind: DownloadErrorKind) {
        tracing::warn!(%path, ?kind, "download failed");
        self.events.push_back(DownloadEvent::Error { path, kind });
        self.resolve();
    }

    /// Either finish or fail `entry` with already verified `data`.
    pub fn complete(&mut self, entry: &FileEntry, data: Vec<u8>) {
        match deliver(entry, data) {
            Ok(content) => self.finished(entry.download_path.clone(), content),
            Err(kind) => self.failed(entry.download_path.clone(), kind),
        }
    }

    pub fn is_done(&self) -> bool {
        self.started && self.resolved == self.registered.len()
    }

    fn resolve(&mut self) {
        self.resolved += 1;
        self.check_done();
    }

    fn check_done(&mut self) {
        if self.is_done() && !self.all_finished_sent {
            self.all_finished_sent = true;
            self.events.push_back(DownloadEvent::AllFinished);
        }
    }
}

/// A queued file with its retry count.
#[derive(Debug, Clone)]
pub(crate) struct PendingFile {
    pub entry: FileEntry,
    pub attempts: u32,
}

impl PendingFile {
    pub fn new(entry: FileEntry) -> Self {
        Self { entry, attempts: 0 }
    }

    /// Consume one retry if `kind` allows it.
    pub fn retry(&mut self, kind: DownloadErrorKind, settings: &DownloadSettings) -> bool {
        if kind.is_retryable() && self.attempts < settings.max_retries {
            self.attempts += 1;
            tracing::debug!(
                path = %self.entry.download_path,
                ?kind,
                attempt = self.attempts,
                "retrying download"
            );
            true
        } else {
            false
        }
    }
}
