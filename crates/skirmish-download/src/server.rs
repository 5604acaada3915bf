//! Server side of the fragment download protocol.
//!
//! Assets are registered once by download path. A
//! [`DownloadClientFileRequest`] is answered immediately; the fragments are
//! then produced by [`FileFragmentServer::update`], which rotates over the
//! active transfers and stops once the per-update byte budget is spent.

use std::collections::VecDeque;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use skirmish_protocol::packets::{
    DownloadClientFileFragment, DownloadClientFileRequest, DownloadClientFileResponse,
    FileResponse, RemoteFile,
};

use crate::manager::sha1_checksum;

/// Rate limiting of the fragment stream.
#[derive(Debug, Clone)]
pub struct FragmentServerConfig {
    /// Size of every fragment except the last one. Default: 1 024.
    pub fragment_size: u32,
    /// Fragment bytes produced per [`FileFragmentServer::update`].
    /// Default: 65 536 (64 KiB).
    pub bytes_per_update: usize,
}

impl Default for FragmentServerConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1024,
            bytes_per_update: 65_536,
        }
    }
}

struct Asset {
    data: Arc<[u8]>,
    remote: RemoteFile,
}

struct Transfer<K> {
    requester: K,
    download_path: String,
    data: Arc<[u8]>,
    next_fragment: u32,
    fragment_count: u32,
}

/// Streams registered assets to requesters identified by `K`.
pub struct FileFragmentServer<K> {
    config: FragmentServerConfig,
    assets: FxHashMap<String, Asset>,
    transfers: VecDeque<Transfer<K>>,
}

impl<K: Copy + Eq + Hash + std::fmt::Debug> FileFragmentServer<K> {
    /// Create a server with no assets.
    pub fn new(config: FragmentServerConfig) -> Self {
        Self {
            config: FragmentServerConfig {
                fragment_size: config.fragment_size.max(1),
                ..config
            },
            assets: FxHashMap::default(),
            transfers: VecDeque::new(),
        }
    }

    /// Serve `data` under `download_path`, replacing any previous asset.
    pub fn register_bytes(
        &mut self,
        download_path: impl Into<String>,
        data: Vec<u8>,
    ) -> RemoteFile {
        let download_path = download_path.into();
        let remote = RemoteFile {
            download_path: download_path.clone(),
            checksum: sha1_checksum(&data),
            size: data.len() as u64,
        };
        tracing::debug!(path = %download_path, size = remote.size, "asset registered");
        self.assets.insert(
            download_path,
            Asset {
                data: data.into(),
                remote: remote.clone(),
            },
        );
        remote
    }

    /// Serve the content of `file` under `download_path`.
    pub fn register_file(
        &mut self,
        download_path: impl Into<String>,
        file: &Path,
    ) -> std::io::Result<RemoteFile> {
        let data = std::fs::read(file)?;
        Ok(self.register_bytes(download_path, data))
    }

    /// Description of every registered asset, sorted by path.
    pub fn remote_files(&self) -> Vec<RemoteFile> {
        let mut files: Vec<_> = self.assets.values().map(|a| a.remote.clone()).collect();
        files.sort_by(|a, b| a.download_path.cmp(&b.download_path));
        files
    }

    /// Number of transfers with fragments left to send.
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Answer a file request and queue its fragments.
    ///
    /// Requesting a file that is already streaming to the same requester
    /// restarts it from the first fragment.
    pub fn handle_request(
        &mut self,
        requester: K,
        request: DownloadClientFileRequest,
    ) -> DownloadClientFileResponse {
        let DownloadClientFileRequest { download_path } = request;
        let Some(asset) = self.assets.get(&download_path) else {
            tracing::warn!(?requester, path = %download_path, "requested file is not served");
            return DownloadClientFileResponse {
                download_path,
                response: FileResponse::NotFound,
            };
        };

        let fragment_size = self.config.fragment_size;
        let file_size = asset.data.len() as u64;
        let fragment_count = file_size.div_ceil(u64::from(fragment_size)) as u32;
        let data = Arc::clone(&asset.data);

        self.transfers
            .retain(|t| !(t.requester == requester && t.download_path == download_path));
        if fragment_count > 0 {
            self.transfers.push_back(Transfer {
                requester,
                download_path: download_path.clone(),
                data,
                next_fragment: 0,
                fragment_count,
            });
        }
        tracing::debug!(?requester, path = %download_path, file_size, "file transfer started");

        DownloadClientFileResponse {
            download_path,
            response: FileResponse::Found {
                file_size,
                fragment_size,
            },
        }
    }

    /// Drop every transfer of `requester`, typically on disconnect.
    pub fn cancel_requester(&mut self, requester: K) {
        self.transfers.retain(|t| t.requester != requester);
    }

    /// Produce the next fragments, within the byte budget.
    ///
    /// Transfers take turns one fragment at a time. At least one fragment is
    /// produced when any transfer is active, so a budget smaller than a
    /// fragment still makes progress.
    pub fn update(&mut self) -> Vec<(K, DownloadClientFileFragment)> {
        let mut budget = self.config.bytes_per_update;
        let mut fragments = Vec::new();

        while let Some(mut transfer) = self.transfers.pop_front() {
            let start = transfer.next_fragment as usize * self.config.fragment_size as usize;
            let end = (start + self.config.fragment_size as usize).min(transfer.data.len());
            let len = end - start;
            if len > budget && !fragments.is_empty() {
                self.transfers.push_front(transfer);
                break;
            }
            budget = budget.saturating_sub(len);

            fragments.push((
                transfer.requester,
                DownloadClientFileFragment {
                    download_path: transfer.download_path.clone(),
                    fragment_index: transfer.next_fragment,
                    fragment_data: transfer.data[start..end].to_vec(),
                },
            ));
            transfer.next_fragment += 1;

            if transfer.next_fragment < transfer.fragment_count {
                self.transfers.push_back(transfer);
            } else {
                tracing::debug!(
                    requester = ?transfer.requester,
                    path = %transfer.download_path,
                    "file transfer complete"
                );
            }
            if budget == 0 {
                break;
            }
        }
        fragments
    }
}
