//! Product image saver
//!
//! Downloads the chosen product image through the shared egress rotation and
//! writes it into the image directory. The file name is the transliterated
//! product name; the extension comes from the response Content-Type. Writes
//! are atomic (temp file + rename) and an existing file is never rewritten
//! in place — collisions get a short-hash suffix instead.

use crate::net::HttpEngine;
use deunicode::deunicode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image download failed: {0}")]
    Download(#[from] crate::net::FetchError),

    #[error("image write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty image URL")]
    EmptyUrl,
}

pub struct ImageSaver {
    http: Arc<HttpEngine>,
    image_dir: PathBuf,
}

impl ImageSaver {
    /// Creates the saver, making sure the target directory exists
    pub fn new(http: Arc<HttpEngine>, image_dir: PathBuf) -> Result<Self, ImageError> {
        std::fs::create_dir_all(&image_dir)?;
        Ok(Self { http, image_dir })
    }

    /// Downloads `url` and writes it under a name derived from `title`.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute image URL
    /// * `title` - Product name used for the file name; `fallback_id` is
    ///   hashed into a name when the title transliterates to nothing
    ///
    /// # Returns
    ///
    /// The final path of the written file.
    pub async fn save(
        &self,
        url: &str,
        title: Option<&str>,
        fallback_id: &str,
    ) -> Result<PathBuf, ImageError> {
        if url.is_empty() {
            return Err(ImageError::EmptyUrl);
        }
        let binary = self.http.fetch_binary(url).await?;
        let extension = extension_for(binary.content_type.as_deref());
        self.write_file(url, title, fallback_id, &binary.bytes, extension)
            .await
    }

    /// Deletes a previously saved image (sheet-append rollback)
    pub fn rollback(&self, path: &Path) {
        if let Err(err) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %err, "Image rollback failed");
        } else {
            tracing::debug!(path = %path.display(), "Rolled back saved image");
        }
    }

    async fn write_file(
        &self,
        url: &str,
        title: Option<&str>,
        fallback_id: &str,
        content: &[u8],
        extension: &str,
    ) -> Result<PathBuf, ImageError> {
        let slug = match title.map(slugify).filter(|s| !s.is_empty()) {
            Some(slug) => slug,
            None => format!("{:x}", md5::compute(fallback_id.as_bytes())),
        };

        let mut path = self.image_dir.join(format!("{}.{}", slug, extension));
        if path.exists() {
            let suffix = &format!("{:x}", md5::compute(url.as_bytes()))[..6];
            path = self
                .image_dir
                .join(format!("{}-{}.{}", slug, suffix, extension));
        }

        let tmp = self.image_dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("image")
        ));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(path = %path.display(), "Saved product image");
        Ok(path)
    }
}

/// Maps a Content-Type to a file extension; unknown types become `bin`
/// so the payload is never mislabeled
fn extension_for(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/avif" => "avif",
        _ => "bin",
    }
}

/// ASCII-safe, lowercase, hyphenated form of a product name, capped at 80
/// characters
fn slugify(value: &str) -> String {
    let ascii = deunicode(value).to_lowercase();
    let mut slug = String::with_capacity(ascii.len());
    let mut prev_hyphen = true;
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
            prev_hyphen = false;
        } else if !prev_hyphen {
            slug.push('-');
            prev_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, RetryPolicy};
    use crate::net::ProxyPool;

    fn saver(dir: &Path) -> ImageSaver {
        let network = NetworkConfig {
            user_agents: vec!["TestAgent/1.0".to_string()],
            proxy_pool: Vec::new(),
            proxy_allow_direct: true,
            request_timeout_sec: 5.0,
            retry: RetryPolicy::default(),
            accept_language: None,
            browser: Default::default(),
            bad_proxy_log_path: std::env::temp_dir().join("lh-test-bad.log"),
        };
        let pool = Arc::new(ProxyPool::new(&[], true, None));
        ImageSaver::new(Arc::new(HttpEngine::new(network, pool)), dir.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_collision_gets_hash_suffix_and_never_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());

        let first = saver
            .write_file("https://x.ru/a.jpg", Some("Green tea"), "id-1", b"one", "jpg")
            .await
            .unwrap();
        assert!(first.ends_with("green-tea.jpg"));

        let second = saver
            .write_file("https://x.ru/b.jpg", Some("Green tea"), "id-2", b"two", "jpg")
            .await
            .unwrap();
        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("green-tea-") && name.ends_with(".jpg"));

        // The original file is untouched
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_untitled_image_falls_back_to_hash_name() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());
        let path = saver
            .write_file("https://x.ru/a.jpg", None, "https://x.ru/p/1", b"img", "webp")
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 32 + 1 + 4); // md5 hex + "." + "webp"
        assert!(name.ends_with(".webp"));
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for(Some("image/png; charset=binary")), "png");
        assert_eq!(extension_for(Some("image/webp")), "webp");
        assert_eq!(extension_for(Some("image/avif")), "avif");
        assert_eq!(extension_for(Some("text/html")), "bin");
        assert_eq!(extension_for(None), "bin");
    }

    #[test]
    fn test_slugify_transliterates_cyrillic() {
        assert_eq!(slugify("Чайник заварочный"), "chainik-zavarochnyi");
    }

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("  Green  Tea / 100g!  "), "green-tea-100g");
    }

    #[test]
    fn test_slugify_caps_length() {
        let long = "a".repeat(200);
        assert_eq!(slugify(&long).len(), 80);
    }
}
