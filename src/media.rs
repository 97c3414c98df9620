//! Persistence for uploaded attachments.
//!
//! A [`MediaStore`] takes the raw bytes of an upload and returns the reference
//! clients later use to fetch them. The local backend hands out paths relative
//! to the serving host; the Cloudinary backend hands out absolute URLs.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use sha1::{Digest, Sha1};

use crate::config::CloudinaryCredentials;

pub const IMAGES_SUBDIR: &str = "images";
pub const VIDEOS_SUBDIR: &str = "videos";

const FALLBACK_FILE_NAME: &str = "upload";
const CLOUDINARY_API_BASE: &str = "https://api.cloudinary.com/v1_1";

/// An attachment pulled out of a multipart submission.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Upload {
    /// Declared content type, or a guess from the file name.
    pub fn mime_type(&self) -> String {
        self.content_type
            .clone()
            .filter(|value| !value.is_empty() && value != "application/octet-stream")
            .or_else(|| {
                mime_guess::from_path(&self.file_name)
                    .first()
                    .map(|mime| mime.to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    fn is_video(&self) -> bool {
        self.mime_type().starts_with("video/")
    }
}

pub trait MediaStore: Send + Sync {
    /// Persists the upload and returns its media reference.
    fn store(&self, upload: &Upload) -> Result<String>;
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = Path::new(name)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .next_back()
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

fn timestamped_name(name: &str) -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), sanitize_file_name(name))
}

/// Writes uploads under `<root>/images` or `<root>/videos`, the same tree the
/// static routes serve from.
#[derive(Debug, Clone)]
pub struct LocalMediaStore {
    root: PathBuf,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for subdir in [IMAGES_SUBDIR, VIDEOS_SUBDIR] {
            let dir = root.join(subdir);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating media directory {}", dir.display()))?;
        }
        Ok(Self { root })
    }
}

impl MediaStore for LocalMediaStore {
    fn store(&self, upload: &Upload) -> Result<String> {
        let subdir = if upload.is_video() {
            VIDEOS_SUBDIR
        } else {
            IMAGES_SUBDIR
        };
        let file_name = timestamped_name(&upload.file_name);
        let path = self.root.join(subdir).join(&file_name);

        let mut file = fs::File::create(&path)
            .with_context(|| format!("creating media file {}", path.display()))?;
        file.write_all(&upload.data)
            .with_context(|| format!("writing media file {}", path.display()))?;
        file.sync_all()?;

        tracing::info!(
            path = %path.display(),
            size_bytes = upload.data.len(),
            "stored upload on local disk"
        );
        Ok(format!("/{subdir}/{file_name}"))
    }
}

/// Signed uploads to a Cloudinary account.
#[derive(Debug, Clone)]
pub struct CloudinaryMediaStore {
    credentials: CloudinaryCredentials,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct CloudinaryUploadResponse {
    secure_url: Option<String>,
    url: Option<String>,
}

impl CloudinaryMediaStore {
    pub fn new(credentials: CloudinaryCredentials) -> Self {
        Self {
            credentials,
            api_base: CLOUDINARY_API_BASE.to_string(),
        }
    }

    /// Overrides the API endpoint, e.g. to point at a regional host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/{}/auto/upload",
            self.api_base, self.credentials.cloud_name
        )
    }
}

/// SHA-1 over the signed parameters sorted by name, joined as `k=v&k=v`, with
/// the API secret appended.
pub fn sign_params(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

impl MediaStore for CloudinaryMediaStore {
    fn store(&self, upload: &Upload) -> Result<String> {
        let public_id = timestamped_name(&upload.file_name);
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[
                ("folder", self.credentials.folder.as_str()),
                ("public_id", public_id.as_str()),
                ("timestamp", timestamp.as_str()),
            ],
            &self.credentials.api_secret,
        );
        let file = format!(
            "data:{};base64,{}",
            upload.mime_type(),
            STANDARD.encode(&upload.data)
        );

        let response = ureq::post(&self.upload_url())
            .send_form(&[
                ("file", file.as_str()),
                ("api_key", self.credentials.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("folder", self.credentials.folder.as_str()),
                ("public_id", public_id.as_str()),
                ("signature", signature.as_str()),
            ])
            .map_err(|err| anyhow!("cloudinary upload failed: {err}"))?;
        let body: CloudinaryUploadResponse = response
            .into_json()
            .context("decoding cloudinary upload response")?;

        let reference = body
            .secure_url
            .or(body.url)
            .ok_or_else(|| anyhow!("cloudinary response did not include a URL"))?;
        tracing::info!(
            public_id = %public_id,
            size_bytes = upload.data.len(),
            "stored upload on cloudinary"
        );
        Ok(reference)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    fn upload(name: &str, content_type: Option<&str>) -> Upload {
        Upload {
            file_name: name.to_string(),
            content_type: content_type.map(str::to_string),
            data: b"bytes".to_vec(),
        }
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my clip (1).mp4"), "my_clip__1_.mp4");
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
    }

    #[test]
    fn mime_type_falls_back_to_extension() {
        assert_eq!(upload("a.png", None).mime_type(), "image/png");
        assert_eq!(
            upload("a.mp4", Some("application/octet-stream")).mime_type(),
            "video/mp4"
        );
        assert_eq!(upload("a", Some("video/webm")).mime_type(), "video/webm");
        assert_eq!(upload("noext", None).mime_type(), "application/octet-stream");
    }

    #[test]
    fn local_store_routes_by_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(dir.path()).unwrap();

        let image_ref = store.store(&upload("thumb.jpg", Some("image/jpeg"))).unwrap();
        assert!(image_ref.starts_with("/images/"));
        assert!(image_ref.ends_with("-thumb.jpg"));
        let on_disk = dir.path().join(image_ref.trim_start_matches('/'));
        assert_eq!(fs::read(on_disk).unwrap(), b"bytes");

        let video_ref = store.store(&upload("clip.mp4", None)).unwrap();
        assert!(video_ref.starts_with("/videos/"));
        assert!(dir.path().join(video_ref.trim_start_matches('/')).is_file());
    }

    #[test]
    fn signature_matches_cloudinary_scheme() {
        let signature = sign_params(
            &[
                ("timestamp", "1700000000"),
                ("public_id", "1700000000000-clip.mp4"),
                ("folder", "uploads"),
            ],
            "topsecret",
        );
        assert_eq!(signature, "f5cca7df096585059f33392ad4e95959f143cf2e");
    }

    #[test]
    fn upload_url_uses_cloud_name() {
        let store = CloudinaryMediaStore::new(cloud_stub::credentials())
            .with_api_base("http://localhost:9000/v1_1/");
        assert_eq!(store.upload_url(), "http://localhost:9000/v1_1/demo/auto/upload");
    }

    async fn store_blocking(store: CloudinaryMediaStore, upload: Upload) -> Result<String> {
        tokio::task::spawn_blocking(move || store.store(&upload))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloudinary_upload_posts_a_signed_form() {
        let secure = "https://res.cloudinary.com/demo/video/upload/uploads/clip.mp4";
        let (store, received) = cloud_stub::spawn(
            StatusCode::OK,
            json!({ "secure_url": secure, "url": "http://res.cloudinary.com/plain" }),
        )
        .await;

        let reference = store_blocking(store, upload("my clip.mp4", Some("video/mp4")))
            .await
            .unwrap();
        assert_eq!(reference, secure);

        let (cloud, form) = received.lock().clone().unwrap();
        assert_eq!(cloud, "demo");
        assert_eq!(form["api_key"], "key");
        assert_eq!(form["folder"], "uploads");
        assert!(form["public_id"].ends_with("-my_clip.mp4"));
        assert_eq!(
            form["file"],
            format!("data:video/mp4;base64,{}", STANDARD.encode(b"bytes"))
        );
        let expected = sign_params(
            &[
                ("folder", form["folder"].as_str()),
                ("public_id", form["public_id"].as_str()),
                ("timestamp", form["timestamp"].as_str()),
            ],
            "secret",
        );
        assert_eq!(form["signature"], expected);
        assert!(!form.contains_key("api_secret"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloudinary_falls_back_to_plain_url() {
        let (store, _) =
            cloud_stub::spawn(StatusCode::OK, json!({ "url": "http://res.cloudinary.com/a.png" }))
                .await;
        let reference = store_blocking(store, upload("a.png", None)).await.unwrap();
        assert_eq!(reference, "http://res.cloudinary.com/a.png");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloudinary_rejection_is_an_error() {
        let (store, received) = cloud_stub::spawn(
            StatusCode::UNAUTHORIZED,
            json!({ "error": { "message": "Invalid Signature" } }),
        )
        .await;
        let err = store_blocking(store, upload("a.png", None)).await.unwrap_err();
        assert!(err.to_string().contains("cloudinary upload failed"));
        assert!(received.lock().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloudinary_reply_without_url_is_an_error() {
        let (store, _) = cloud_stub::spawn(StatusCode::OK, json!({ "public_id": "x" })).await;
        let err = store_blocking(store, upload("a.png", None)).await.unwrap_err();
        assert!(err.to_string().contains("did not include a URL"));
    }
}
