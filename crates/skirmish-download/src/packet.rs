//! Fragment-based downloads over the match session.
//!
//! Files are fetched one at a time. For each file the manager emits a
//! [`DownloadEvent::Request`]; the caller sends the matching
//! [`DownloadClientFileRequest`] and feeds the server's response and
//! fragments back through [`PacketDownloadManager::handle_response`] and
//! [`PacketDownloadManager::handle_fragment`]. A bitset tracks which
//! fragments have arrived, so duplicates and reordering are harmless.

use std::collections::VecDeque;

use fixedbitset::FixedBitSet;
use skirmish_protocol::packets::{
    DownloadClientFileFragment, DownloadClientFileRequest, DownloadClientFileResponse,
    FileResponse,
};

use crate::manager::{
    Batch, DownloadError, DownloadErrorKind, DownloadEvent, DownloadManager, DownloadSettings,
    FileEntry, PendingFile, sha1_checksum,
};

struct Transfer {
    buffer: Vec<u8>,
    fragment_size: u32,
    received: FixedBitSet,
    downloaded: u64,
}

impl Transfer {
    fn new(file_size: u64, fragment_size: u32) -> Self {
        let count = file_size.div_ceil(u64::from(fragment_size.max(1))) as usize;
        Self {
            buffer: vec![0; file_size as usize],
            fragment_size,
            received: FixedBitSet::with_capacity(count),
            downloaded: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.count_ones(..) == self.received.len()
    }

    /// Byte range of fragment `index`, if it exists.
    fn range(&self, index: u32) -> Option<std::ops::Range<usize>> {
        if index as usize >= self.received.len() {
            return None;
        }
        let start = index as usize * self.fragment_size as usize;
        let end = (start + self.fragment_size as usize).min(self.buffer.len());
        Some(start..end)
    }
}

struct InFlight {
    file: PendingFile,
    transfer: Option<Transfer>,
}

/// Downloads files from the match server, one at a time.
pub struct PacketDownloadManager {
    settings: DownloadSettings,
    queue: VecDeque<PendingFile>,
    current: Option<InFlight>,
    batch: Batch,
}

impl PacketDownloadManager {
    /// Create an empty manager.
    pub fn new(settings: DownloadSettings) -> Self {
        Self {
            settings,
            queue: VecDeque::new(),
            current: None,
            batch: Batch::default(),
        }
    }

    /// Request packet for a path announced by a [`DownloadEvent::Request`].
    pub fn request_packet(path: &str) -> DownloadClientFileRequest {
        DownloadClientFileRequest {
            download_path: path.to_owned(),
        }
    }

    /// Path of the file currently being transferred.
    pub fn current_path(&self) -> Option<&str> {
        self.current
            .as_ref()
            .map(|c| c.file.entry.download_path.as_str())
    }

    fn current_for(&mut self, path: &str) -> Option<&mut InFlight> {
        match &mut self.current {
            Some(current) if current.file.entry.download_path == path => Some(current),
            _ => {
                tracing::warn!(%path, "ignoring download packet for a file not in flight");
                None
            }
        }
    }

    /// Feed the server's answer to the current request.
    pub fn handle_response(&mut self, packet: DownloadClientFileResponse) {
        let Some(current) = self.current_for(&packet.download_path) else {
            return;
        };
        if current.transfer.is_some() {
            tracing::warn!(path = %packet.download_path, "duplicate file response");
            return;
        }

        match packet.response {
            FileResponse::NotFound => self.fail(DownloadErrorKind::FileNotFound),
            FileResponse::Found { file_size, .. } if file_size != current.file.entry.expected_size => {
                tracing::warn!(
                    path = %packet.download_path,
                    expected = current.file.entry.expected_size,
                    actual = file_size,
                    "remote size differs"
                );
                self.fail(DownloadErrorKind::SizeMismatch);
            }
            FileResponse::Found { fragment_size: 0, file_size } if file_size > 0 => {
                self.fail(DownloadErrorKind::TransferFailed);
            }
            FileResponse::Found {
                file_size,
                fragment_size,
            } => {
                current.transfer = Some(Transfer::new(file_size, fragment_size));
                if file_size == 0 {
                    self.verify_current();
                }
            }
        }
    }

    /// Feed one fragment of the current file.
    pub fn handle_fragment(&mut self, packet: DownloadClientFileFragment) {
        let Some(current) = self.current_for(&packet.download_path) else {
            return;
        };
        let Some(transfer) = &mut current.transfer else {
            tracing::warn!(path = %packet.download_path, "fragment before file response");
            return;
        };
        let Some(range) = transfer.range(packet.fragment_index) else {
            tracing::warn!(
                path = %packet.download_path,
                index = packet.fragment_index,
                "fragment index out of range"
            );
            return;
        };
        if range.len() != packet.fragment_data.len() {
            tracing::warn!(
                path = %packet.download_path,
                index = packet.fragment_index,
                expected = range.len(),
                actual = packet.fragment_data.len(),
                "fragment has wrong length"
            );
            return;
        }
        if transfer.received.contains(packet.fragment_index as usize) {
            return;
        }

        transfer.buffer[range].copy_from_slice(&packet.fragment_data);
        transfer.received.insert(packet.fragment_index as usize);
        transfer.downloaded += packet.fragment_data.len() as u64;

        let progress = DownloadEvent::Progress {
            path: packet.download_path,
            downloaded: transfer.downloaded,
            total: current.file.entry.expected_size,
        };
        let complete = transfer.is_complete();
        self.batch.push(progress);
        if complete {
            self.verify_current();
        }
    }

    fn verify_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        let file = current.file;
        let Some(transfer) = current.transfer else {
            self.current = Some(InFlight {
                file,
                transfer: None,
            });
            return;
        };

        if sha1_checksum(&transfer.buffer) != file.entry.checksum {
            self.current = Some(InFlight {
                file,
                transfer: None,
            });
            self.fail(DownloadErrorKind::ChecksumMismatch);
            return;
        }
        self.batch.complete(&file.entry, transfer.buffer);
    }

    /// Resolve or requeue the current file after a failure.
    fn fail(&mut self, kind: DownloadErrorKind) {
        let Some(InFlight { mut file, .. }) = self.current.take() else {
            return;
        };
        if file.retry(kind, &self.settings) {
            self.queue.push_front(file);
        } else {
            self.batch.failed(file.entry.download_path, kind);
        }
    }
}

impl DownloadManager for PacketDownloadManager {
    fn register_file(&mut self, entry: FileEntry) -> Result<(), DownloadError> {
        self.batch.register(&entry.download_path)?;
        self.queue.push_back(PendingFile::new(entry));
        Ok(())
    }

    fn start(&mut self) {
        if self.batch.start() {
            tracing::info!(files = self.queue.len(), "starting packet downloads");
        }
    }

    fn update(&mut self) {
        if !self.batch.is_started() || self.current.is_some() {
            return;
        }
        let Some(file) = self.queue.pop_front() else {
            return;
        };
        let path = file.entry.download_path.clone();
        self.batch.push(DownloadEvent::Request { path: path.clone() });
        self.batch.push(DownloadEvent::Started { path });
        self.current = Some(InFlight {
            file,
            transfer: None,
        });
    }

    fn poll_event(&mut self) -> Option<DownloadEvent> {
        self.batch.pop()
    }

    fn is_finished(&self) -> bool {
        self.batch.is_done()
    }
}
