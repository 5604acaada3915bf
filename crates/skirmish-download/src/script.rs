//! Client script downloads.
//!
//! Scripts are small, so every pending script is requested at once. The
//! manager never talks to the network itself: it raises
//! [`DownloadEvent::Request`] and expects the caller to send a
//! [`DownloadClientScriptRequest`] and hand the server's answer to
//! [`ClientScriptDownloadManager::handle_packet`].

use std::path::{Component, Path, PathBuf};

use rustc_hash::FxHashMap;
use skirmish_protocol::packets::{
    DownloadClientScriptRequest, DownloadClientScriptResponse, ScriptContent,
};

use crate::manager::{
    Batch, DownloadError, DownloadErrorKind, DownloadEvent, DownloadManager, DownloadSettings,
    FileEntry, PendingFile, sha1_checksum,
};

fn verify(entry: &FileEntry, bytes: Vec<u8>) -> Result<Vec<u8>, DownloadErrorKind> {
    if bytes.len() as u64 != entry.expected_size {
        Err(DownloadErrorKind::SizeMismatch)
    } else if sha1_checksum(&bytes) != entry.checksum {
        Err(DownloadErrorKind::ChecksumMismatch)
    } else {
        Ok(bytes)
    }
}

/// Downloads client scripts through request/response packets.
pub struct ClientScriptDownloadManager {
    settings: DownloadSettings,
    cache_dir: Option<PathBuf>,
    queued: Vec<PendingFile>,
    requested: FxHashMap<String, PendingFile>,
    batch: Batch,
}

impl ClientScriptDownloadManager {
    /// Create a manager, optionally backed by an on-disk cache.
    pub fn new(settings: DownloadSettings, cache_dir: Option<PathBuf>) -> Self {
        Self {
            settings,
            cache_dir,
            queued: Vec::new(),
            requested: FxHashMap::default(),
            batch: Batch::default(),
        }
    }

    /// Request packet for a path announced by a [`DownloadEvent::Request`].
    pub fn request_packet(path: &str) -> DownloadClientScriptRequest {
        DownloadClientScriptRequest {
            path: path.to_owned(),
        }
    }

    /// Feed a server response.
    pub fn handle_packet(&mut self, packet: DownloadClientScriptResponse) {
        let Some(mut file) = self.requested.remove(&packet.path) else {
            tracing::warn!(path = %packet.path, "unexpected script response");
            return;
        };

        let result = match packet.content {
            ScriptContent::NotFound => Err(DownloadErrorKind::FileNotFound),
            ScriptContent::Content(bytes) => verify(&file.entry, bytes),
        };

        match result {
            Ok(bytes) => {
                self.store_in_cache(&file.entry.download_path, &bytes);
                self.batch.complete(&file.entry, bytes);
            }
            Err(kind) => {
                if file.retry(kind, &self.settings) {
                    self.queued.push(file);
                } else {
                    self.batch.failed(file.entry.download_path, kind);
                }
            }
        }
    }

    fn cache_path(&self, download_path: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let relative = Path::new(download_path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            tracing::warn!(path = %download_path, "script path not cacheable");
            return None;
        }
        Some(dir.join(relative))
    }

    fn load_from_cache(&self, entry: &FileEntry) -> Option<Vec<u8>> {
        let path = self.cache_path(&entry.download_path)?;
        let bytes = std::fs::read(&path).ok()?;
        if bytes.len() as u64 == entry.expected_size && sha1_checksum(&bytes) == entry.checksum {
            tracing::debug!(path = %path.display(), "script found in cache");
            Some(bytes)
        } else {
            None
        }
    }

    fn store_in_cache(&self, download_path: &str, bytes: &[u8]) {
        let Some(path) = self.cache_path(download_path) else {
            return;
        };
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(&path, bytes));
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), %err, "failed to cache script");
        }
    }
}

impl DownloadManager for ClientScriptDownloadManager {
    fn register_file(&mut self, entry: FileEntry) -> Result<(), DownloadError> {
        self.batch.register(&entry.download_path)?;
        self.queued.push(PendingFile::new(entry));
        Ok(())
    }

    fn start(&mut self) {
        if self.batch.start() {
            tracing::info!(scripts = self.queued.len(), "starting script downloads");
        }
    }

    fn update(&mut self) {
        if !self.batch.is_started() {
            return;
        }
        for file in std::mem::take(&mut self.queued) {
            if let Some(bytes) = self.load_from_cache(&file.entry) {
                self.batch.complete(&file.entry, bytes);
                continue;
            }
            let path = file.entry.download_path.clone();
            self.batch.push(DownloadEvent::Request { path: path.clone() });
            self.batch.push(DownloadEvent::Started { path: path.clone() });
            self.requested.insert(path, file);
        }
    }

    fn poll_event(&mut self) -> Option<DownloadEvent> {
        self.batch.pop()
    }

    fn is_finished(&self) -> bool {
        self.batch.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::FinishedContent;

    fn drain(manager: &mut ClientScriptDownloadManager) -> Vec<DownloadEvent> {
        std::iter::from_fn(|| manager.poll_event()).collect()
    }

    fn requests(events: &[DownloadEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Request { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn response(path: &str, bytes: &[u8]) -> DownloadClientScriptResponse {
        DownloadClientScriptResponse {
            path: path.into(),
            content: ScriptContent::Content(bytes.to_vec()),
        }
    }

    const SCRIPT: &[u8] = b"function OnInit() end";

    #[test]
    fn test_requests_then_finishes() {
        let mut manager = ClientScriptDownloadManager::new(DownloadSettings::default(), None);
        manager
            .register_file(FileEntry::in_memory(
                "gamemodes/ctf.lua",
                sha1_checksum(SCRIPT),
                SCRIPT.len() as u64,
            ))
            .unwrap();
        manager
            .register_file(FileEntry::in_memory("gone.lua", [0; 20], 3))
            .unwrap();
        manager.start();
        manager.update();
        assert_eq!(
            requests(&drain(&mut manager)),
            vec!["gamemodes/ctf.lua", "gone.lua"]
        );

        manager.handle_packet(response("gamemodes/ctf.lua", SCRIPT));
        manager.handle_packet(DownloadClientScriptResponse {
            path: "gone.lua".into(),
            content: ScriptContent::NotFound,
        });

        let events = drain(&mut manager);
        assert!(events.contains(&DownloadEvent::Finished {
            path: "gamemodes/ctf.lua".into(),
            content: FinishedContent::Memory(SCRIPT.to_vec()),
        }));
        assert!(events.contains(&DownloadEvent::Error {
            path: "gone.lua".into(),
            kind: DownloadErrorKind::FileNotFound,
        }));
        assert_eq!(events.last(), Some(&DownloadEvent::AllFinished));
    }

    #[test]
    fn test_tampered_script_is_rejected() {
        let mut manager = ClientScriptDownloadManager::new(DownloadSettings::default(), None);
        manager
            .register_file(FileEntry::in_memory(
                "a.lua",
                sha1_checksum(SCRIPT),
                SCRIPT.len() as u64,
            ))
            .unwrap();
        manager.start();
        manager.update();
        let mut tampered = SCRIPT.to_vec();
        tampered[0] = b'F';
        manager.handle_packet(response("a.lua", &tampered));

        assert!(drain(&mut manager).contains(&DownloadEvent::Error {
            path: "a.lua".into(),
            kind: DownloadErrorKind::ChecksumMismatch,
        }));
        // A late duplicate answer is ignored.
        manager.handle_packet(response("a.lua", SCRIPT));
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn test_cache_skips_request() {
        let cache = tempfile::tempdir().unwrap();
        let entry = || {
            FileEntry::in_memory("lib/util.lua", sha1_checksum(SCRIPT), SCRIPT.len() as u64)
        };

        let mut first =
            ClientScriptDownloadManager::new(DownloadSettings::default(), Some(cache.path().into()));
        first.register_file(entry()).unwrap();
        first.start();
        first.update();
        first.handle_packet(response("lib/util.lua", SCRIPT));
        assert!(first.is_finished());
        assert_eq!(
            std::fs::read(cache.path().join("lib/util.lua")).unwrap(),
            SCRIPT
        );

        let mut second =
            ClientScriptDownloadManager::new(DownloadSettings::default(), Some(cache.path().into()));
        second.register_file(entry()).unwrap();
        second.start();
        second.update();
        let events = drain(&mut second);
        assert!(requests(&events).is_empty());
        assert!(second.is_finished());
    }

    #[test]
    fn test_escaping_paths_are_not_cached() {
        let cache = tempfile::tempdir().unwrap();
        let manager =
            ClientScriptDownloadManager::new(DownloadSettings::default(), Some(cache.path().into()));
        assert!(manager.cache_path("../outside.lua").is_none());
        assert!(manager.cache_path("/etc/passwd").is_none());
        assert!(manager.cache_path("ok/inside.lua").is_some());
    }
}
