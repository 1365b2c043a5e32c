//! Rewrites device-local resource references into portable data URIs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use tracing::{debug, warn};

use storekeep_common::SettingsDocument;

/// Makes settings documents self-contained before they leave the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Embed the store logo if it points at a local file.
    ///
    /// Remote URLs and data URIs are returned unchanged. A logo that cannot
    /// be read is left as is and logged.
    pub async fn normalize(&self, doc: SettingsDocument) -> SettingsDocument {
        let Some(logo) = doc.store.logo.as_deref() else {
            return doc;
        };
        if is_portable(logo) {
            return doc;
        }

        let path = logo.strip_prefix("file://").unwrap_or(logo).to_string();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let uri = format!("data:{};base64,{}", media_type(&path), STANDARD.encode(&bytes));
                debug!(path = %path, size = bytes.len(), "Embedded local logo");
                let mut doc = doc;
                doc.store.logo = Some(uri);
                doc
            }
            Err(e) => {
                warn!(path = %path, "Logo could not be embedded, sending local reference: {}", e);
                doc
            }
        }
    }
}

fn is_portable(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("data:")
}

fn media_type(path: &str) -> &'static str {
    let is_png = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if is_png {
        "image/png"
    } else {
        "image/jpeg"
    }
}
