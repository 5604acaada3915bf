//! Match content loaded from disk: assets streamed through the fragment
//! server and client scripts answered in one packet.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use skirmish_download::{FileFragmentServer, sha1_checksum};
use skirmish_protocol::packets::{RemoteFile, ScriptContent};
use skirmish_session::SessionHandle;

/// Every regular file under `root`, keyed by its `/`-separated relative path
/// and sorted by it. A missing directory yields nothing.
pub fn collect_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        tracing::warn!(dir = %root.display(), "content directory not found");
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((key, path));
        }
    }
    files.sort();
    Ok(files)
}

/// Register every file under `root` with `server`.
pub fn load_assets(
    server: &mut FileFragmentServer<SessionHandle>,
    root: &Path,
) -> std::io::Result<Vec<RemoteFile>> {
    let mut remote = Vec::new();
    for (key, path) in collect_files(root)? {
        remote.push(server.register_file(key, &path)?);
    }
    tracing::info!(count = remote.len(), dir = %root.display(), "assets loaded");
    Ok(remote)
}

/// Client scripts held in memory.
#[derive(Debug, Default)]
pub struct ScriptLibrary {
    scripts: FxHashMap<String, Vec<u8>>,
}

impl ScriptLibrary {
    /// Load every file under `root`.
    pub fn load(root: &Path) -> std::io::Result<Self> {
        let mut library = Self::default();
        for (key, path) in collect_files(root)? {
            library.insert(key, std::fs::read(&path)?);
        }
        tracing::info!(count = library.scripts.len(), dir = %root.display(), "scripts loaded");
        Ok(library)
    }

    /// Add or replace a script.
    pub fn insert(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.scripts.insert(path.into(), content);
    }

    /// Answer for a script request.
    pub fn content(&self, path: &str) -> ScriptContent {
        match self.scripts.get(path) {
            Some(bytes) => ScriptContent::Content(bytes.clone()),
            None => ScriptContent::NotFound,
        }
    }

    /// Description of every script, sorted by path.
    pub fn remote_files(&self) -> Vec<RemoteFile> {
        let mut files: Vec<_> = self
            .scripts
            .iter()
            .map(|(path, bytes)| RemoteFile {
                download_path: path.clone(),
                checksum: sha1_checksum(bytes),
                size: bytes.len() as u64,
            })
            .collect();
        files.sort_by(|a, b| a.download_path.cmp(&b.download_path));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_nested_files_with_slash_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("maps/desert")).unwrap();
        std::fs::write(dir.path().join("maps/desert/level.map"), b"map").unwrap();
        std::fs::write(dir.path().join("logo.png"), b"png").unwrap();

        let keys: Vec<_> = collect_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["logo.png", "maps/desert/level.map"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_files(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_script_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hud.lua"), b"-- hud").unwrap();

        let library = ScriptLibrary::load(dir.path()).unwrap();
        assert_eq!(
            library.content("hud.lua"),
            ScriptContent::Content(b"-- hud".to_vec())
        );
        assert_eq!(library.content("other.lua"), ScriptContent::NotFound);

        let remote = library.remote_files();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].checksum, sha1_checksum(b"-- hud"));
    }
}
