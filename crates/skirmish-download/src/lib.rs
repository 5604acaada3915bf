//! Match file downloads: fragment streaming over the session, HTTP mirrors
//! and client scripts, all behind one polling contract.

pub mod http;
pub mod manager;
pub mod packet;
pub mod script;
pub mod server;
pub mod web;

pub use http::{HttpDownloadManager, RequestId, WebError, WebEvent, WebService};
pub use manager::{
    Destination, DownloadError, DownloadErrorKind, DownloadEvent, DownloadManager,
    DownloadSettings, FileEntry, FinishedContent, sha1_checksum,
};
pub use packet::PacketDownloadManager;
pub use script::ClientScriptDownloadManager;
pub use server::{FileFragmentServer, FragmentServerConfig};
pub use web::UreqWebService;
