//! Shared test doubles for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use cloudpull_core::api::{ByteStream, CloudClient, Entry, FileList};
use cloudpull_core::{SyncError, SyncErrorKind};

/// In-memory remote: a folder tree plus scripted listing failures.
#[derive(Default)]
pub struct FakeCloud {
    /// Folder ID → children, in listing order.
    children: HashMap<String, Vec<Entry>>,
    /// Entry ID → metadata.
    entries: HashMap<String, Entry>,
    /// File ID → content bytes.
    contents: HashMap<String, Vec<u8>>,
    /// File ID → exported bytes.
    exports: HashMap<String, Vec<u8>>,
    /// Folder ID → queued listing failures, consumed one per call.
    list_failures: Mutex<HashMap<String, VecDeque<SyncErrorKind>>>,
    /// Listing page size (0 = everything on one page).
    pub page_size: usize,
}

pub fn folder_entry(id: &str, name: &str) -> Entry {
    Entry {
        id: id.to_string(),
        name: name.to_string(),
        content_type: "application/vnd.google-apps.folder".to_string(),
        size: None,
        md5: None,
        modified_time: None,
        parents: Vec::new(),
    }
}

pub fn file_entry(id: &str, name: &str, size: u64) -> Entry {
    Entry {
        id: id.to_string(),
        name: name.to_string(),
        content_type: "application/octet-stream".to_string(),
        size: Some(size),
        md5: None,
        modified_time: Some("2026-03-01T12:00:00Z".to_string()),
        parents: Vec::new(),
    }
}

pub fn doc_entry(id: &str, name: &str) -> Entry {
    Entry {
        id: id.to_string(),
        name: name.to_string(),
        content_type: "application/vnd.google-apps.document".to_string(),
        size: None,
        md5: None,
        modified_time: None,
        parents: Vec::new(),
    }
}

pub fn shortcut_entry(id: &str, name: &str) -> Entry {
    Entry {
        id: id.to_string(),
        name: name.to_string(),
        content_type: "application/vnd.google-apps.shortcut".to_string(),
        size: None,
        md5: None,
        modified_time: None,
        parents: Vec::new(),
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a folder with its children.
    pub fn add_folder(&mut self, entry: Entry, children: Vec<Entry>) {
        for child in &children {
            self.entries.insert(child.id.clone(), child.clone());
        }
        self.children.insert(entry.id.clone(), children);
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Registers file content.
    pub fn add_content(&mut self, id: &str, bytes: Vec<u8>) {
        self.contents.insert(id.to_string(), bytes);
    }

    /// Queues listing failures for a folder, consumed first.
    pub fn fail_listing(&self, folder_id: &str, kinds: &[SyncErrorKind]) {
        let mut failures = self.list_failures.lock().unwrap();
        failures
            .entry(folder_id.to_string())
            .or_default()
            .extend(kinds.iter().copied());
    }

    fn next_failure(&self, folder_id: &str) -> Option<SyncErrorKind> {
        let mut failures = self.list_failures.lock().unwrap();
        failures.get_mut(folder_id).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, SyncError> {
        if let Some(kind) = self.next_failure(folder_id) {
            return Err(SyncError::new(kind, "scripted listing failure"));
        }
        let children = self
            .children
            .get(folder_id)
            .cloned()
            .ok_or_else(|| SyncError::permission(format!("unknown folder {folder_id}")))?;

        if self.page_size == 0 {
            return Ok(FileList {
                entries: children,
                next_page_token: None,
            });
        }

        let offset: usize = page_token.map_or(0, |t| t.parse().unwrap_or(0));
        let page: Vec<Entry> = children
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = if offset + page.len() < children.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(FileList {
            entries: page,
            next_page_token: next,
        })
    }

    async fn metadata(&self, file_id: &str) -> Result<Entry, SyncError> {
        self.entries
            .get(file_id)
            .cloned()
            .ok_or_else(|| SyncError::permission(format!("unknown entry {file_id}")))
    }

    async fn download_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, SyncError> {
        let content = self
            .contents
            .get(file_id)
            .ok_or_else(|| SyncError::permission(format!("no content for {file_id}")))?;
        if content.is_empty() {
            let empty: Vec<Result<Vec<u8>, SyncError>> = Vec::new();
            return Ok(Box::pin(stream::iter(empty)));
        }
        let start = usize::try_from(start).unwrap();
        let end = usize::try_from(end).unwrap().min(content.len() - 1);
        let slice = content[start..=end].to_vec();
        Ok(Box::pin(stream::iter(vec![Ok(slice)])))
    }

    async fn export(
        &self,
        file_id: &str,
        _target_content_type: &str,
    ) -> Result<ByteStream, SyncError> {
        let bytes = self
            .exports
            .get(file_id)
            .cloned()
            .unwrap_or_else(|| b"exported".to_vec());
        Ok(Box::pin(stream::iter(vec![Ok(bytes)])))
    }
}
