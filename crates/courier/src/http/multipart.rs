//! Multipart form data bodies for uploads.

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{Cause, Result, UploadError};

/// A `multipart/form-data` body under construction.
///
/// ```ignore
/// let form = MultipartFormData::new()
///     .text("title", "Holiday")
///     .file_bytes("photo", jpeg, "photo.jpg", "image/jpeg");
/// session.post_multipart("https://api.test/photos", form, handlers)?;
/// ```
#[derive(Clone, Debug)]
pub struct MultipartFormData {
    boundary: String,
    parts: Vec<Part>,
}

#[derive(Clone, Debug)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Default for MultipartFormData {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormData {
    /// Create an empty form with a random boundary.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            boundary: format!("courier.boundary.{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>()),
            parts: Vec::new(),
        }
    }

    /// The boundary token separating parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Number of parts added so far.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check whether no parts have been added.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Add a text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    /// Add a file part from bytes.
    pub fn file_bytes(
        mut self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    /// Add a file part read from disk. The content type is guessed from the
    /// extension.
    pub fn file(self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(UploadError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let data = std::fs::read(path).map_err(|e| UploadError::CannotReadFile {
            path: path.to_path_buf(),
            cause: Cause::new(e),
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let content_type = guess_content_type(path);
        Ok(self.file_bytes(name, data, filename, content_type))
    }

    /// Encode the form. Returns the boundary and the body bytes.
    pub fn finish(self) -> (String, Bytes) {
        let mut body = BytesMut::new();
        for part in &self.parts {
            body.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
            let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", escape_quoted(&part.name));
            if let Some(filename) = &part.filename {
                disposition.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
            }
            body.put_slice(disposition.as_bytes());
            body.put_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                body.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            body.put_slice(b"\r\n");
            body.put_slice(&part.data);
            body.put_slice(b"\r\n");
        }
        body.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (self.boundary, body.freeze())
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n'], " ")
}

fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_are_unique() {
        let a = MultipartFormData::new();
        let b = MultipartFormData::new();
        assert_ne!(a.boundary(), b.boundary());
        assert!(a.is_empty());
    }

    #[test]
    fn test_finish_layout() {
        let form = MultipartFormData::new()
            .text("title", "Holiday")
            .file_bytes("photo", Bytes::from_static(b"\xff\xd8"), "p.jpg", "image/jpeg");
        assert_eq!(form.len(), 2);
        let (boundary, body) = form.finish();
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("Content-Disposition: form-data; name=\"title\"\r\n\r\nHoliday\r\n"));
        assert!(text.contains("name=\"photo\"; filename=\"p.jpg\"\r\nContent-Type: image/jpeg\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn test_missing_file() {
        let err = MultipartFormData::new()
            .file("doc", "/definitely/not/here.txt")
            .unwrap_err();
        assert_eq!(err.code(), 4001);
    }

    #[test]
    fn test_file_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "remember").unwrap();

        let form = MultipartFormData::new().file("doc", &path).unwrap();
        let (_, body) = form.finish();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("filename=\"notes.txt\"\r\nContent-Type: text/plain\r\n\r\nremember"));
    }
}
