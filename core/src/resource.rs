//! The in-memory `Resource`: a cached URL's attributes plus its `RangeSet`.

use std::path::PathBuf;

use common::RangeSet;

use crate::mime;

/// One cacheable URL. Owns the in-memory `cached_set`; the data file, meta
/// file, per-resource mutex, debounce timer, and liveness flag it also owns
/// conceptually live alongside it in the manager's per-id registries (see
/// `manager.rs`) rather than on this struct, so `Resource` itself stays
/// plain data that can be constructed, cloned into a meta snapshot, and
/// tested without pulling in tokio.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    pub origin_url: String,
    pub total_size: u64,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub promotion_target: Option<PathBuf>,
    pub cached_set: RangeSet,
}

impl Resource {
    pub fn new(id: String, origin_url: String, total_size: u64) -> Self {
        Self {
            id,
            origin_url,
            total_size,
            mime_type: None,
            file_name: None,
            promotion_target: None,
            cached_set: RangeSet::new(total_size),
        }
    }

    pub fn progress(&mut self) -> f64 {
        self.cached_set.progress()
    }

    pub fn is_complete(&mut self) -> bool {
        self.cached_set.is_complete()
    }

    pub fn content_type(&self) -> String {
        self.mime_type
            .clone()
            .unwrap_or_else(|| "video/mp4".to_string())
    }

    /// file_name -> origin_url tail -> mime_type, in that precedence.
    pub fn suggested_name(&self) -> String {
        if let Some(name) = &self.file_name {
            if !name.is_empty() {
                return name.clone();
            }
        }

        let tail = self
            .origin_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty());
        if let Some(tail) = tail {
            let tail = tail.split(['?', '#']).next().unwrap_or(tail);
            if !tail.is_empty() {
                return tail.to_string();
            }
        }

        format!("{}.{}", self.id, self.extension())
    }

    pub fn extension(&self) -> String {
        if let Some(name) = &self.file_name {
            if let Some(ext) = name.rsplit('.').next().filter(|e| *e != *name) {
                return ext.to_string();
            }
        }

        if let Some(tail) = self.origin_url.rsplit('/').next() {
            let tail = tail.split(['?', '#']).next().unwrap_or(tail);
            if let Some(ext) = tail.rsplit('.').next().filter(|e| *e != tail) {
                return ext.to_string();
            }
        }

        mime_to_extension(self.mime_type.as_deref()).to_string()
    }

    /// Sniffs the MIME type from the first bytes of the sparse file when
    /// neither the origin nor the file name has told us. Called once the
    /// first chunk lands.
    pub fn sniff_mime(&mut self, head: &[u8]) {
        if self.mime_type.is_none() {
            self.mime_type = mime::sniff(head).map(str::to_string);
        }
    }
}

fn mime_to_extension(mime: Option<&str>) -> &'static str {
    match mime {
        Some("video/webm") => "webm",
        Some("video/x-flv") => "flv",
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("application/zip") => "zip",
        Some("application/x-rar-compressed") => "rar",
        Some("application/pdf") => "pdf",
        _ => "mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggested_name_prefers_file_name() {
        let mut r = Resource::new("abc".into(), "https://x.test/a.bin".into(), 10);
        r.file_name = Some("real-name.mp4".into());
        assert_eq!(r.suggested_name(), "real-name.mp4");
    }

    #[test]
    fn suggested_name_falls_back_to_url_tail() {
        let r = Resource::new("abc".into(), "https://x.test/path/video.mp4?x=1".into(), 10);
        assert_eq!(r.suggested_name(), "video.mp4");
    }

    #[test]
    fn suggested_name_falls_back_to_mime_extension() {
        let mut r = Resource::new("abc".into(), "https://x.test/".into(), 10);
        r.mime_type = Some("image/png".into());
        assert_eq!(r.suggested_name(), "abc.png");
    }
}
