//! Reference face images: `http(s)://` URLs over HTTP, everything else from disk.

use async_trait::async_trait;
use presence_core::{FetchError, ImageRef, ReferenceImageSource};
use reqwest::StatusCode;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpReferenceSource {
    client: reqwest::Client,
}

impl HttpReferenceSource {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(path.to_string()),
            _ => FetchError::Transport(format!("{path}: {e}")),
        })
    }
}

#[async_trait]
impl ReferenceImageSource for HttpReferenceSource {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        let bytes = if image.starts_with("http://") || image.starts_with("https://") {
            self.fetch_url(image).await?
        } else {
            self.fetch_file(image.strip_prefix("file://").unwrap_or(image))
                .await?
        };
        tracing::debug!(image = %image, bytes = bytes.len(), "reference image fetched");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_bare_path_and_file_url() {
        let path = std::env::temp_dir().join(format!("presence-ref-{}.png", std::process::id()));
        tokio::fs::write(&path, b"png-bytes").await.unwrap();
        let source = HttpReferenceSource::new().unwrap();

        let bare = path.to_string_lossy().into_owned();
        assert_eq!(source.fetch(&bare).await.unwrap(), b"png-bytes");
        assert_eq!(
            source.fetch(&format!("file://{bare}")).await.unwrap(),
            b"png-bytes"
        );

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let source = HttpReferenceSource::new().unwrap();
        let missing = "/nonexistent/presence/face.png".to_string();
        assert!(matches!(
            source.fetch(&missing).await,
            Err(FetchError::NotFound(_))
        ));
    }
}
