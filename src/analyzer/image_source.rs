use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::settings::LiveFeedSettings;

use super::AnalysisError;

/// Raw bytes ready for the classifier plus a reference the view layer can
/// use to redisplay the captured image.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub display_ref: String,
}

/// Seam between the session and whatever produces images. A real camera
/// or sensor API can replace [`DeviceImageSource`] without touching the
/// controller. Retries are the caller's responsibility.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn acquire_from_upload(&self, path: &Path) -> Result<CapturedImage, AnalysisError>;
    async fn acquire_from_live_feed(&self) -> Result<CapturedImage, AnalysisError>;
}

pub struct DeviceImageSource {
    client: reqwest::Client,
    feed_url: String,
}

impl DeviceImageSource {
    pub fn new(settings: &LiveFeedSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.capture_timeout_secs))
            .build()
            .context("failed to build live feed HTTP client")?;

        Ok(Self {
            client,
            feed_url: settings.url.clone(),
        })
    }
}

#[async_trait]
impl ImageSource for DeviceImageSource {
    async fn acquire_from_upload(&self, path: &Path) -> Result<CapturedImage, AnalysisError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| AnalysisError::Read(format!("{}: {err}", path.display())))?;

        // Decode check up front so a corrupt file fails here instead of at
        // the provider.
        let format = image::guess_format(&bytes).map_err(|_| {
            AnalysisError::Read(format!("{} is not a recognized image", path.display()))
        })?;
        image::load_from_memory_with_format(&bytes, format).map_err(|err| {
            AnalysisError::Read(format!("could not decode {}: {err}", path.display()))
        })?;

        let display_ref = format!(
            "data:{};base64,{}",
            format.to_mime_type(),
            BASE64.encode(&bytes)
        );

        Ok(CapturedImage { bytes, display_ref })
    }

    async fn acquire_from_live_feed(&self) -> Result<CapturedImage, AnalysisError> {
        let response = self
            .client
            .get(&self.feed_url)
            .send()
            .await
            .map_err(|err| AnalysisError::Capture(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AnalysisError::Capture(format!(
                "feed returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| AnalysisError::Capture(err.to_string()))?
            .to_vec();

        Ok(CapturedImage {
            bytes,
            display_ref: self.feed_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes() -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image::RgbImage::new(4, 4)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn source_with_feed(url: &str) -> DeviceImageSource {
        DeviceImageSource::new(&LiveFeedSettings {
            url: url.into(),
            ..LiveFeedSettings::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upload_produces_a_data_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plant.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let source = source_with_feed("http://unused.local/feed");
        let captured = source.acquire_from_upload(&path).await.unwrap();

        assert!(captured.display_ref.starts_with("data:image/png;base64,"));
        assert!(!captured.bytes.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let source = source_with_feed("http://unused.local/feed");
        let outcome = source
            .acquire_from_upload(Path::new("/nonexistent/plant.jpg"))
            .await;

        assert!(matches!(outcome, Err(AnalysisError::Read(_))));
    }

    #[tokio::test]
    async fn undecodable_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not an image at all").unwrap();

        let source = source_with_feed("http://unused.local/feed");
        let outcome = source.acquire_from_upload(&path).await;

        assert!(matches!(outcome, Err(AnalysisError::Read(_))));
    }

    #[tokio::test]
    async fn live_feed_fetch_keeps_the_url_as_display_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
            .mount(&server)
            .await;

        let source = source_with_feed(&server.uri());
        let captured = source.acquire_from_live_feed().await.unwrap();

        assert_eq!(captured.display_ref, server.uri());
        assert!(!captured.bytes.is_empty());
    }

    #[tokio::test]
    async fn failed_feed_fetch_is_a_capture_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = source_with_feed(&server.uri());
        let outcome = source.acquire_from_live_feed().await;

        assert!(matches!(outcome, Err(AnalysisError::Capture(_))));
    }
}
