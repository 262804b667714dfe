//! Remote object-store interface consumed by the sync engine.
//!
//! The engine never talks HTTP directly; it depends on the narrow
//! [`CloudClient`] trait: paginated listing, single-item metadata, ranged
//! content reads, and server-side export of native editor documents.
//! [`DriveClient`] is the production implementation; tests substitute a
//! wiremock-backed instance by overriding the base URL.

mod drive;
mod export;
mod types;

pub use drive::DriveClient;
pub use export::{export_extension, export_target};
pub use types::{Entry, FileList};

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::errors::SyncError;

/// Sentinel folder ID resolving to the account's root folder.
pub const ROOT_SENTINEL: &str = "root";

/// Listing page size.
pub const PAGE_SIZE: u32 = 1000;

/// Content type marking an entry as a folder.
pub const FOLDER_CONTENT_TYPE: &str = "application/vnd.google-apps.folder";

/// Content type marking an entry as a shortcut to another entry.
pub const SHORTCUT_CONTENT_TYPE: &str = "application/vnd.google-apps.shortcut";

/// Prefix shared by all cloud-native (exportable) document types.
pub const NATIVE_CONTENT_TYPE_PREFIX: &str = "application/vnd.google-apps.";

/// Streaming response body: ordered chunks or a categorized failure.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SyncError>> + Send>>;

/// Narrow remote-API contract the engine is written against.
///
/// Implementations map upstream failures into the [`SyncError`] taxonomy
/// (429 → quota, 403 with a rate-limit reason → quota, 401/404 →
/// permission, 5xx → network).
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Lists one page of the direct, non-trashed children of a folder.
    ///
    /// `page_token` of `None` requests the first page; the returned
    /// [`FileList::next_page_token`] is `None` on the last page.
    async fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, SyncError>;

    /// Fetches metadata for a single entry. The [`ROOT_SENTINEL`] resolves
    /// to the root folder.
    async fn metadata(&self, file_id: &str) -> Result<Entry, SyncError>;

    /// Opens a ranged read of a regular file's content.
    ///
    /// `start` and `end` are inclusive byte offsets with HTTP `Range`
    /// semantics.
    async fn download_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, SyncError>;

    /// Exports a native document to `target_content_type` and streams the
    /// converted bytes. No size is advertised up front.
    async fn export(
        &self,
        file_id: &str,
        target_content_type: &str,
    ) -> Result<ByteStream, SyncError>;
}
