//! Export target mapping for cloud-native documents.
//!
//! The mapping is fixed by downstream consumers and must not drift:
//! documents to docx, spreadsheets to xlsx, presentations to pptx,
//! drawings and forms to pdf.

/// Export MIME for word-processing documents.
const DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
/// Export MIME for spreadsheets.
const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
/// Export MIME for presentations.
const PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
/// Export MIME for drawings and forms.
const PDF: &str = "application/pdf";

/// Maps a native document's content type to its export target
/// `(content_type, extension)`. Returns `None` for types with no
/// supported export.
#[must_use]
pub fn export_target(source_content_type: &str) -> Option<(&'static str, &'static str)> {
    match source_content_type {
        "application/vnd.google-apps.document" => Some((DOCX, ".docx")),
        "application/vnd.google-apps.spreadsheet" => Some((XLSX, ".xlsx")),
        "application/vnd.google-apps.presentation" => Some((PPTX, ".pptx")),
        "application/vnd.google-apps.drawing" | "application/vnd.google-apps.form" => {
            Some((PDF, ".pdf"))
        }
        _ => None,
    }
}

/// Maps an export content type to the file extension appended to names
/// lacking one.
#[must_use]
pub fn export_extension(export_content_type: &str) -> Option<&'static str> {
    match export_content_type {
        DOCX => Some(".docx"),
        XLSX => Some(".xlsx"),
        PPTX => Some(".pptx"),
        PDF => Some(".pdf"),
        "text/plain" => Some(".txt"),
        "text/html" => Some(".html"),
        "text/csv" => Some(".csv"),
        _ => None,
    }
}
