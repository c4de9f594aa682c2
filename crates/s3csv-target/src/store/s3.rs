//! S3 multipart upload store

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use tracing::{debug, info, instrument};

use super::{ObjectStore, Part, UploadSession};
use crate::config::TargetConfig;
use crate::error::{StoreError, StoreResult};

/// Service error codes S3 uses for throttling and temporary unavailability
const RETRYABLE_CODES: &[&str] = &[
    "RequestTimeout",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalError",
    "ServiceUnavailable",
];

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the target config
    ///
    /// Explicit keys win; otherwise the default AWS credential chain
    /// (environment, profile, instance metadata) is used.
    pub async fn from_config(config: &TargetConfig) -> Self {
        debug!(
            "Initializing S3 client (region: {}, endpoint: {:?}, path style: {})",
            config.region(),
            config.aws_endpoint_url,
            config.s3_path_style
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region().to_string()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.aws_access_key_id, &config.aws_secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                config.aws_session_token.clone(),
                None,
                "s3csv-target",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.s3_path_style);
        if let Some(endpoint) = &config.aws_endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        info!("S3 client initialized for bucket: {}", config.bucket());

        Self::new(Client::from_conf(builder.build()), config.bucket())
    }
}

/// Map an SDK error onto the transient/permanent split the retry policy uses
fn classify<E>(operation: &str, err: &SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(err).to_string();

    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::transient(operation, message)
        },
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or_default();

            if status >= 500 || status == 429 || RETRYABLE_CODES.contains(&code) {
                StoreError::transient(operation, message)
            } else {
                StoreError::permanent(operation, message)
            }
        },
        _ => StoreError::permanent(operation, message),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self))]
    async fn begin_chunked_upload(&self, key: &str) -> StoreResult<UploadSession> {
        debug!("Creating multipart upload for s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("text/csv")
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", &e))?;

        let upload_id = response.upload_id().ok_or_else(|| {
            StoreError::permanent("create_multipart_upload", "response carried no upload id")
        })?;

        Ok(UploadSession {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    #[instrument(skip(self, session, data), fields(key = %session.key, bytes = data.len()))]
    async fn upload_chunk(&self, session: &UploadSession, part_number: u32, data: &[u8]) -> StoreResult<String> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| StoreError::permanent("upload_part", format!("part number {part_number} out of range")))?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| classify("upload_part", &e))?;

        response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::permanent("upload_part", "response carried no ETag"))
    }

    #[instrument(skip(self, session, parts), fields(key = %session.key, parts = parts.len()))]
    async fn complete(&self, session: &UploadSession, parts: &[Part]) -> StoreResult<()> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.number as i32)
                    .e_tag(&part.tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", &e))?;

        info!("Completed s3://{}/{}", self.bucket, session.key);
        Ok(())
    }

    #[instrument(skip(self, session), fields(key = %session.key))]
    async fn abort(&self, session: &UploadSession) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", &e))?;

        info!("Aborted multipart upload of s3://{}/{}", self.bucket, session.key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_open_uploads(&self, prefix: &str) -> StoreResult<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| classify("list_multipart_uploads", &e))?;

            sessions.extend(response.uploads().iter().filter_map(|upload| {
                Some(UploadSession {
                    key: upload.key()?.to_string(),
                    upload_id: upload.upload_id()?.to_string(),
                })
            }));

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = response.next_key_marker().map(str::to_string);
            upload_id_marker = response.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }

        debug!("Found {} open uploads under s3://{}/{}", sessions.len(), self.bucket, prefix);
        Ok(sessions)
    }
}
