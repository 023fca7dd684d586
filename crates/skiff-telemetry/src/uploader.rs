//! Object store upload of closed segments
//!
//! Every upload follows the same three steps:
//!
//! 1. **claim**: the segment is renamed into `tmp/`, after which only the
//!    uploader touches it;
//! 2. **transfer**: the bytes go to object storage through the strategy chosen
//!    at construction;
//! 3. **commit**: on success the segment is renamed into `archives/`.
//!
//! A failed transfer leaves the file in `tmp/`, where the next startup's
//! recovery sweep finds it again.

use crate::layout::SegmentLayout;
use crate::sigv4::{self, Credentials, SigningRequest};
use chrono::Utc;
use reqwest::{header, Client, StatusCode, Url};
use serde::Deserialize;
use skiff_core::{AppSettings, ShippingSettings};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upload failures; none of them reach the foreground
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("Segment is empty: {}", path.display())]
    EmptySegment { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected with status {status}")]
    Rejected { status: u16 },

    #[error("Upload configuration error: {message}")]
    Configuration { message: String },
}

impl UploadError {
    /// Short label used for failure counters
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::EmptySegment { .. } => "empty",
            UploadError::Io(_) => "io",
            UploadError::Http(_) => "http",
            UploadError::Rejected { .. } => "rejected",
            UploadError::Configuration { .. } => "configuration",
        }
    }
}

type UploadResult<T> = std::result::Result<T, UploadError>;

/// `<app>/logs/<installation-id>/<segment-stem>.log`
pub fn object_key(app: &AppSettings, segment: &Path) -> String {
    let stem = segment
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("segment");
    format!("{}/logs/{}/{}.log", app.name, app.installation_id, stem)
}

/// Signed path-style `PUT` with a static key pair
#[derive(Debug, Clone)]
pub struct DirectUpload {
    client: Client,
    credentials: Credentials,
    endpoint: String,
    bucket: String,
    region: String,
}

impl DirectUpload {
    pub fn new(
        client: Client,
        credentials: Credentials,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            client,
            credentials,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            region: region.into(),
        }
    }

    /// `{endpoint}/{bucket}/{key}`
    pub fn object_url(&self, key: &str) -> UploadResult<Url> {
        let path = sigv4::encode_path(&format!("/{}/{}", self.bucket, key));
        let url = format!("{}{}", self.endpoint.trim_end_matches('/'), path);
        Url::parse(&url).map_err(|e| UploadError::Configuration {
            message: format!("Invalid object URL '{}': {}", url, e),
        })
    }

    async fn transfer(&self, key: &str, path: &Path) -> UploadResult<()> {
        let body = tokio::fs::read(path).await?;
        let url = self.object_url(key)?;

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(UploadError::Configuration {
                    message: format!("Endpoint has no host: {}", self.endpoint),
                })
            }
        };

        let signed = sigv4::sign(
            &SigningRequest {
                method: "PUT",
                host: &host,
                canonical_uri: url.path(),
                payload: &body,
                region: &self.region,
                service: "s3",
            },
            &self.credentials,
            Utc::now(),
        );

        let response = self
            .client
            .put(url)
            .header(header::AUTHORIZATION, signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Form handed out by the control plane
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedForm {
    pub url: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Two-phase upload through a control plane issuing presigned forms
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    client: Client,
    presign_url: String,
}

impl PresignedUpload {
    pub fn new(client: Client, presign_url: impl Into<String>) -> Self {
        Self {
            client,
            presign_url: presign_url.into(),
        }
    }

    /// Ask the control plane for a form covering `key`
    pub async fn request_form(&self, key: &str) -> UploadResult<PresignedForm> {
        let response = self
            .client
            .post(&self.presign_url)
            .json(&serde_json::json!({ "object_key": key }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(response.json::<PresignedForm>().await?)
    }

    async fn transfer(&self, key: &str, path: &Path) -> UploadResult<()> {
        let form = self.request_form(key).await?;

        let mut multipart = reqwest::multipart::Form::new();
        for (name, value) in form.fields {
            multipart = multipart.text(name, value);
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("segment.log")
            .to_string();
        let body = tokio::fs::read(path).await?;
        multipart = multipart.part("file", reqwest::multipart::Part::bytes(body).file_name(file_name));

        let response = self.client.post(&form.url).multipart(multipart).send().await?;

        // The storage endpoint answers a stored object with 204 only.
        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// How bytes reach object storage; fixed for the lifetime of an [`Uploader`]
#[derive(Debug, Clone)]
pub enum UploadStrategy {
    DirectCredentialed(DirectUpload),
    Presigned(PresignedUpload),
}

impl UploadStrategy {
    /// Static credentials win over a presign URL; with neither there is no
    /// way to ship.
    pub fn from_settings(settings: &ShippingSettings) -> UploadResult<Self> {
        let client = Client::builder().timeout(settings.timeout()).build()?;

        if let Some((access_key_id, secret_access_key)) = settings.credentials() {
            if settings.bucket.trim().is_empty() {
                return Err(UploadError::Configuration {
                    message: "A bucket is required for credentialed uploads".to_string(),
                });
            }

            let endpoint = settings
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", settings.region));
            require_http_url("shipping.endpoint", &endpoint)?;

            return Ok(UploadStrategy::DirectCredentialed(DirectUpload::new(
                client,
                Credentials::new(access_key_id, secret_access_key),
                endpoint,
                settings.bucket.clone(),
                settings.region.clone(),
            )));
        }

        match settings.presign_url.as_deref().filter(|url| !url.trim().is_empty()) {
            Some(url) => {
                require_http_url("shipping.presign_url", url)?;
                Ok(UploadStrategy::Presigned(PresignedUpload::new(client, url)))
            }
            None => Err(UploadError::Configuration {
                message: "Shipping needs either static credentials or a presign URL".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UploadStrategy::DirectCredentialed(_) => "direct",
            UploadStrategy::Presigned(_) => "presigned",
        }
    }

    async fn transfer(&self, key: &str, path: &Path) -> UploadResult<()> {
        match self {
            UploadStrategy::DirectCredentialed(direct) => direct.transfer(key, path).await,
            UploadStrategy::Presigned(presigned) => presigned.transfer(key, path).await,
        }
    }
}

fn require_http_url(setting: &str, url: &str) -> UploadResult<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(UploadError::Configuration {
            message: format!("{} must start with http:// or https://, got '{}'", setting, url),
        })
    }
}

/// Moves one segment through claim, transfer and commit
#[derive(Debug, Clone)]
pub struct Uploader {
    app: Arc<AppSettings>,
    layout: SegmentLayout,
    strategy: UploadStrategy,
}

impl Uploader {
    pub fn new(
        app: Arc<AppSettings>,
        layout: SegmentLayout,
        settings: &ShippingSettings,
    ) -> UploadResult<Self> {
        let strategy = UploadStrategy::from_settings(settings)?;
        Ok(Self::with_strategy(app, layout, strategy))
    }

    pub fn with_strategy(app: Arc<AppSettings>, layout: SegmentLayout, strategy: UploadStrategy) -> Self {
        Self {
            app,
            layout,
            strategy,
        }
    }

    pub fn strategy(&self) -> &UploadStrategy {
        &self.strategy
    }

    /// Ship one closed segment and return its archive path.
    ///
    /// Empty segments are deleted and reported as [`UploadError::EmptySegment`].
    pub async fn upload(&self, path: &Path) -> UploadResult<PathBuf> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() == 0 {
            let _ = tokio::fs::remove_file(path).await;
            return Err(UploadError::EmptySegment {
                path: path.to_path_buf(),
            });
        }

        let claimed = self.claim(path).await?;
        let key = object_key(&self.app, &claimed);
        self.strategy.transfer(&key, &claimed).await?;
        self.commit(&claimed).await
    }

    /// Move `path` into `tmp/`; a file already there stays put
    pub async fn claim(&self, path: &Path) -> UploadResult<PathBuf> {
        let tmp_dir = self.layout.tmp_dir();
        if path.parent() == Some(tmp_dir.as_path()) {
            return Ok(path.to_path_buf());
        }

        tokio::fs::create_dir_all(&tmp_dir).await?;
        let claimed = tmp_dir.join(file_name(path)?);
        tokio::fs::rename(path, &claimed).await?;
        Ok(claimed)
    }

    async fn commit(&self, claimed: &Path) -> UploadResult<PathBuf> {
        let archives = self.layout.archives_dir();
        tokio::fs::create_dir_all(&archives).await?;
        let archived = archives.join(file_name(claimed)?);
        tokio::fs::rename(claimed, &archived).await?;
        Ok(archived)
    }
}

fn file_name(path: &Path) -> UploadResult<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        UploadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Not a file path: {}", path.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app() -> Arc<AppSettings> {
        Arc::new(AppSettings::new("skiff", "c0ffee", "sess", "inst"))
    }

    fn presigned_settings() -> ShippingSettings {
        ShippingSettings {
            enabled: true,
            presign_url: Some("http://127.0.0.1:9/presign".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_key() {
        let key = object_key(&app(), Path::new("/logs/inst/skiff_sess.2024-05-01_10.log"));
        assert_eq!(key, "skiff/logs/inst/skiff_sess.2024-05-01_10.log");
    }

    #[test]
    fn test_strategy_prefers_credentials() {
        let settings = ShippingSettings {
            enabled: true,
            access_key_id: Some("AKID".to_string()),
            secret_access_key: Some("secret".to_string()),
            bucket: "telemetry".to_string(),
            presign_url: Some("https://control.example/presign".to_string()),
            ..Default::default()
        };
        let strategy = UploadStrategy::from_settings(&settings).unwrap();
        assert_eq!(strategy.name(), "direct");

        match strategy {
            UploadStrategy::DirectCredentialed(direct) => {
                let url = direct.object_url("skiff/logs/inst/s.log").unwrap();
                assert_eq!(
                    url.as_str(),
                    "https://s3.us-east-1.amazonaws.com/telemetry/skiff/logs/inst/s.log"
                );
            }
            other => panic!("unexpected strategy {:?}", other.name()),
        }
    }

    #[test]
    fn test_strategy_falls_back_to_presigned() {
        let strategy = UploadStrategy::from_settings(&presigned_settings()).unwrap();
        assert_eq!(strategy.name(), "presigned");
    }

    #[test]
    fn test_strategy_requires_a_route() {
        let err = UploadStrategy::from_settings(&ShippingSettings::default()).unwrap_err();
        assert_eq!(err.kind(), "configuration");

        let missing_bucket = ShippingSettings {
            access_key_id: Some("AKID".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(UploadStrategy::from_settings(&missing_bucket).is_err());

        let bad_url = ShippingSettings {
            presign_url: Some("ftp://control".to_string()),
            ..Default::default()
        };
        assert!(UploadStrategy::from_settings(&bad_url).is_err());
    }

    #[tokio::test]
    async fn test_empty_segment_is_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let app = app();
        let layout = SegmentLayout::new(temp_dir.path(), &app);
        layout.ensure_dirs().unwrap();
        let uploader = Uploader::new(app, layout.clone(), &presigned_settings()).unwrap();

        let empty = layout.segment_dir().join("skiff_sess.2024-05-01_10.log");
        std::fs::write(&empty, "").unwrap();

        let err = uploader.upload(&empty).await.unwrap_err();
        assert!(matches!(err, UploadError::EmptySegment { .. }));
        assert!(!empty.exists());
        assert_eq!(std::fs::read_dir(layout.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_claim_moves_into_tmp_once() {
        let temp_dir = TempDir::new().unwrap();
        let app = app();
        let layout = SegmentLayout::new(temp_dir.path(), &app);
        layout.ensure_dirs().unwrap();
        let uploader = Uploader::new(app, layout.clone(), &presigned_settings()).unwrap();

        let segment = layout.segment_dir().join("skiff_sess.2024-05-01_10.log");
        std::fs::write(&segment, "line\n").unwrap();

        let claimed = uploader.claim(&segment).await.unwrap();
        assert_eq!(claimed, layout.tmp_dir().join("skiff_sess.2024-05-01_10.log"));
        assert!(!segment.exists());

        let again = uploader.claim(&claimed).await.unwrap();
        assert_eq!(again, claimed);
        assert!(claimed.exists());
    }
}
