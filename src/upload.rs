//! Inbound image validation and transient on-disk staging.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use image::ImageFormat;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::UploadSettings;
use crate::error::InputError;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("static regex"))
}

/// Reduce a client-supplied filename to a safe ASCII basename.
///
/// Path separators become spaces, whitespace runs become `_`, anything
/// outside `[A-Za-z0-9_.-]` is dropped, and leading/trailing `.`/`_` are
/// trimmed. Falls back to `upload` when nothing is left.
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = unsafe_chars().replace_all(&joined, "");
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');

    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercased extension after the last `.`, if any.
pub fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

pub fn allowed_file(filename: &str, allowed: &[String]) -> bool {
    extension(filename)
        .map(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
        .unwrap_or(false)
}

/// Check the content really is one of the image formats OCR accepts here.
pub fn sniff_image(data: &[u8]) -> Result<ImageFormat, InputError> {
    match image::guess_format(data) {
        Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif)) => Ok(format),
        _ => Err(InputError::NotAnImage),
    }
}

/// Validate an uploaded file before any remote call is made.
pub fn validate_upload(
    filename: &str,
    data: &[u8],
    settings: &UploadSettings,
) -> Result<ImageFormat, InputError> {
    if data.len() > settings.max_bytes {
        return Err(InputError::TooLarge {
            limit: settings.max_bytes,
        });
    }
    if !allowed_file(filename, &settings.allowed_extensions) {
        return Err(InputError::DisallowedExtension(
            extension(filename).unwrap_or_else(|| filename.to_string()),
        ));
    }
    sniff_image(data)
}

/// Accept only absolute http(s) URLs.
pub fn validate_url(raw: &str) -> Result<String, InputError> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| InputError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(InputError::InvalidUrl(format!(
            "unsupported scheme {}",
            other
        ))),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// An uploaded image written to the upload directory for the duration of
/// one request. The file is removed when this value is dropped.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    pub async fn stage(dir: &Path, filename: &str, data: &[u8]) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create upload dir {:?}", dir))?;

        let path = dir.join(format!(
            "{}_{}",
            Uuid::new_v4().simple(),
            secure_filename(filename)
        ));
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write upload {:?}", path))?;

        debug!("Staged upload at {:?} ({} bytes)", path, data.len());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read staged upload {:?}", self.path))
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged upload {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged upload {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const GIF: &[u8] = b"GIF89a\x01\0\x01\0";
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("..\\windows\\scan.png"), "windows_scan.png");
        assert_eq!(secure_filename("résumé photo.jpg"), "rsum_photo.jpg");
        assert_eq!(secure_filename("..."), "upload");
        assert_eq!(secure_filename(""), "upload");
    }

    #[test]
    fn test_allowed_file() {
        let allowed = UploadSettings::default().allowed_extensions;
        assert!(allowed_file("scan.png", &allowed));
        assert!(allowed_file("Scan.JPEG", &allowed));
        assert!(allowed_file("archive.tar.gif", &allowed));
        assert!(!allowed_file("scan.pdf", &allowed));
        assert!(!allowed_file("png", &allowed));
        assert!(!allowed_file("scan.", &allowed));
    }

    #[test]
    fn test_sniff_image() {
        assert_eq!(sniff_image(PNG).unwrap(), ImageFormat::Png);
        assert_eq!(sniff_image(GIF).unwrap(), ImageFormat::Gif);
        assert_eq!(sniff_image(JPEG).unwrap(), ImageFormat::Jpeg);
        assert_eq!(sniff_image(b"%PDF-1.7"), Err(InputError::NotAnImage));
    }

    #[test]
    fn test_validate_upload_checks_extension_before_content() {
        let settings = UploadSettings::default();
        assert_eq!(
            validate_upload("scan.pdf", PNG, &settings),
            Err(InputError::DisallowedExtension("pdf".to_string()))
        );
        assert_eq!(
            validate_upload("scan.png", b"not an image", &settings),
            Err(InputError::NotAnImage)
        );
        assert!(validate_upload("scan.png", PNG, &settings).is_ok());
    }

    #[test]
    fn test_validate_upload_size_limit() {
        let settings = UploadSettings {
            max_bytes: 4,
            ..UploadSettings::default()
        };
        assert_eq!(
            validate_upload("scan.png", PNG, &settings),
            Err(InputError::TooLarge { limit: 4 })
        );
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(
            validate_url(" https://example.com/receipt.jpg ").unwrap(),
            "https://example.com/receipt.jpg"
        );
        assert!(validate_url("ftp://example.com/a.png").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_staged_upload_is_removed_on_drop() {
        let dir = std::env::temp_dir().join(format!("upload-test-{}", Uuid::new_v4().simple()));
        let staged = TempUpload::stage(&dir, "../scan.png", PNG).await.unwrap();
        let path = staged.path().to_path_buf();

        assert!(path.starts_with(&dir));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_scan.png"));
        assert_eq!(staged.read().await.unwrap(), PNG);

        drop(staged);
        assert!(!path.exists());
        let _ = std::fs::remove_dir(&dir);
    }
}
