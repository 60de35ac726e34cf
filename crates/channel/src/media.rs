use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qqgate_core::{Error, MediaSource, Result, SendTarget};
use tracing::{debug, info};

use crate::rest::RestClient;

/// Image extensions the platform's rich-media path accepts.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

pub fn has_image_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Classify a raw media reference string from the reply pipeline.
pub fn classify_media_url(s: &str) -> Option<MediaSource> {
    let s = s.trim();
    if s.starts_with("http://") || s.starts_with("https://") {
        return Some(MediaSource::PublicUrl(s.to_string()));
    }
    if s.starts_with("data:image/") && s.contains(";base64,") {
        return Some(MediaSource::DataUrl(s.to_string()));
    }
    if s.starts_with('/') && has_image_extension(s) {
        return Some(MediaSource::LocalPath(s.into()));
    }
    None
}

pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

pub fn decode_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    let bytes = BASE64.decode(data).ok()?;
    Some((mime.to_string(), bytes))
}

/// Rewrite a local path into a data URL (MIME by extension) so only public
/// URLs and data URLs ever reach the wire.
pub async fn normalize_source(source: MediaSource) -> Result<MediaSource> {
    match source {
        MediaSource::LocalPath(path) => {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            let mime = mime_for_extension(ext).ok_or_else(|| {
                Error::PayloadInvalid(format!("unsupported image extension: {}", path.display()))
            })?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| Error::PayloadInvalid(format!("{}: {}", path.display(), e)))?;
            debug!(path = %path.display(), bytes = bytes.len(), "Local image read for upload");
            Ok(MediaSource::DataUrl(encode_data_url(mime, &bytes)))
        }
        other => Ok(other),
    }
}

/// Two-step rich media sender, step one: upload the image and obtain the
/// server-side `file_info` token that a `msg_type:7` message references.
pub struct MediaUploader {
    rest: Arc<RestClient>,
}

impl MediaUploader {
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self { rest }
    }

    pub async fn upload(&self, target: &SendTarget, source: &MediaSource) -> Result<String> {
        let path = match target {
            SendTarget::C2c(openid) => format!("/v2/users/{}/files", openid),
            SendTarget::Group(group) => format!("/v2/groups/{}/files", group),
            SendTarget::Channel(_) => {
                return Err(Error::PayloadInvalid(
                    "channel targets do not accept rich media".to_string(),
                ))
            }
        };

        let mut body = serde_json::json!({
            "file_type": 1,
            "srv_send_msg": false,
        });
        match source {
            MediaSource::PublicUrl(url) => {
                body["url"] = serde_json::Value::String(url.clone());
            }
            MediaSource::DataUrl(data_url) => {
                let payload = data_url
                    .split_once(";base64,")
                    .map(|(_, data)| data.to_string())
                    .ok_or_else(|| {
                        Error::PayloadInvalid("malformed data URL".to_string())
                    })?;
                body["file_data"] = serde_json::Value::String(payload);
            }
            MediaSource::LocalPath(path) => {
                return Err(Error::PayloadInvalid(format!(
                    "local path not normalized before upload: {}",
                    path.display()
                )))
            }
        }

        let resp = self.rest.post_message(&path, &body).await?;
        let file_info = resp
            .get("file_info")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::ProtocolDecode("no file_info in upload response".to_string()))?;
        info!(target = %target.format(), "Image uploaded");
        Ok(file_info)
    }
}
