//! Remote entry metadata types.

use serde::Deserialize;

use super::{FOLDER_CONTENT_TYPE, NATIVE_CONTENT_TYPE_PREFIX, SHORTCUT_CONTENT_TYPE};

/// Metadata for a single remote entry (folder, file, or shortcut).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Opaque remote identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Remote content type; folders and native documents use vendor types.
    #[serde(rename = "mimeType", default)]
    pub content_type: String,
    /// Declared size in bytes; absent for folders and native documents.
    #[serde(default, deserialize_with = "de_size")]
    pub size: Option<u64>,
    /// Declared MD5 of the content, when the remote computed one.
    #[serde(rename = "md5Checksum", default)]
    pub md5: Option<String>,
    /// Remote modification time (RFC 3339).
    #[serde(rename = "modifiedTime", default)]
    pub modified_time: Option<String>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// One page of a folder listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FileList {
    /// Entries on this page, in listing order.
    #[serde(default, rename = "files")]
    pub entries: Vec<Entry>,
    /// Token for the next page; `None` on the last page.
    #[serde(rename = "nextPageToken", default)]
    pub next_page_token: Option<String>,
}

impl Entry {
    /// Whether this entry is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.content_type == FOLDER_CONTENT_TYPE
    }

    /// Whether this entry is a shortcut to another entry.
    #[must_use]
    pub fn is_shortcut(&self) -> bool {
        self.content_type == SHORTCUT_CONTENT_TYPE
    }

    /// Whether this entry is a cloud-native document with no portable
    /// binary form (it must be exported rather than downloaded).
    #[must_use]
    pub fn is_native_document(&self) -> bool {
        self.content_type.starts_with(NATIVE_CONTENT_TYPE_PREFIX)
            && !self.is_folder()
            && !self.is_shortcut()
    }

    /// Declared size, treating absent as zero.
    #[must_use]
    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}

/// The remote serializes sizes as JSON strings; accept both forms.
fn de_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid size: {s}"))),
    }
}
