//! `aws-sdk-s3`-backed `ObjectStore` adapter (spec §4.3, §6).

use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use domain::ObjectStoreError;

/// Maps AWS SDK errors onto the port's transient/permanent split: throttling
/// and 5xx service faults are retried by the caller, everything else
/// (bad credentials, missing bucket, malformed request) is permanent.
fn classify_put_error(err: SdkError<PutObjectError>) -> ObjectStoreError {
    let message = err.to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ObjectStoreError::Transient(message),
        SdkError::ServiceError(service_err) => {
            if service_err.raw().status().is_server_error() {
                ObjectStoreError::Transient(message)
            } else {
                ObjectStoreError::Permanent(message)
            }
        }
        _ => ObjectStoreError::Permanent(message),
    }
}

/// `ObjectStore` adapter over an S3-compatible bucket. The client is
/// constructed once at startup from `aws-config`'s default provider chain
/// (region, credentials, optional custom endpoint for S3-compatible
/// services) and reused for every publish cycle.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    #[must_use]
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }

    pub async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type);
        if let Some(encoding) = content_encoding {
            request = request.content_encoding(encoding);
        }
        request.send().await.map_err(classify_put_error)?;
        Ok(())
    }
}

impl domain::ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        S3ObjectStore::put_object(self, key, bytes, content_type, content_encoding).await
    }
}

/// Builds an S3 client from `aws-config`'s default credential/region chain,
/// optionally overriding the region and pointing at a custom endpoint (for
/// S3-compatible services used in local/dev environments).
pub async fn build_client(
    region: impl Into<String>,
    endpoint: Option<&str>,
    access_key: Option<&str>,
    secret_key: Option<&str>,
) -> Client {
    let region = aws_sdk_s3::config::Region::new(region.into());
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let (Some(key), Some(secret)) = (access_key, secret_key) {
        let credentials = aws_credential_types::Credentials::new(key, secret, None, None, "data-sleigh-config");
        loader = loader.credentials_provider(credentials);
    }

    let shared_config = loader.load().await;
    let mut s3_config = aws_sdk_s3::config::Builder::from(&shared_config);
    if let Some(endpoint) = endpoint {
        s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
    }
    Client::from_conf(s3_config.build())
}
