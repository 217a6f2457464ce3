//! S3-compatible object storage (MinIO, R2, AWS).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region, http::HttpResponse},
    error::{DisplayErrorContext, SdkError},
    operation::get_object::GetObjectError,
    primitives::ByteStream,
};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::S3Config;
use crate::error::StorageError;

use super::{ObjectStore, object_key};

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "scribe",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(s3_config);
        let bucket = config.bucket.clone();

        // Unreachable storage is not fatal at startup; downloads retry.
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => info!(bucket = %bucket, "Connected to S3 bucket"),
            Err(e) => warn!(bucket = %bucket, error = %e, "Could not verify bucket"),
        }

        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(&self, name: &str, data: Bytes) -> Result<String, StorageError> {
        let locator = object_key(name);
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&locator)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Backend {
                locator: locator.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(bucket = %self.bucket, locator = %locator, bytes = size, "Stored object");
        Ok(locator)
    }

    async fn download(&self, locator: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
            .map_err(|e| download_error(locator, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend {
                locator: locator.to_string(),
                message: format!("failed to read object body: {e}"),
            })?;

        Ok(body.into_bytes())
    }
}

/// A missing key is permanent; everything else is a backend failure.
///
/// Some S3-compatible servers answer a missing key with a bare 404 and no
/// `NoSuchKey` code, so the raw status counts too.
fn download_error(locator: &str, error: SdkError<GetObjectError, HttpResponse>) -> StorageError {
    let no_such_key = error
        .as_service_error()
        .is_some_and(GetObjectError::is_no_such_key);
    let status_404 = error
        .raw_response()
        .is_some_and(|response| response.status().as_u16() == 404);

    if no_such_key || status_404 {
        StorageError::NotFound {
            locator: locator.to_string(),
        }
    } else {
        StorageError::Backend {
            locator: locator.to_string(),
            message: DisplayErrorContext(&error).to_string(),
        }
    }
}
