//! S3 client on `aws-sdk-s3`, bound to one bucket behind a custom endpoint.

use std::fmt;
use std::time::SystemTime;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, error};
use crate::config::AgentConfig;
use crate::error::{FsError, Result};
use super::{ObjectBody, ObjectInfo, ObjectStore, PutSource};

/// Characters escaped in the `x-amz-copy-source` header; `/` separates key segments.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    ranged_reads: bool,
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("ranged_reads", &self.ranged_reads)
            .finish()
    }
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, ranged_reads: bool) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            ranged_reads,
        }
    }

    /// Builds a path-style client for `config`. Static keys are used when both
    /// are configured, otherwise the ambient AWS credential chain.
    pub async fn connect(config: &AgentConfig) -> Self {
        let region = Region::new(config.region.clone());
        let mut builder = if config.has_static_credentials() {
            aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(
                    config.access_key_id.clone(),
                    config.secret_access_key.clone(),
                    None,
                    None,
                    "bucketfs-config",
                ))
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        };
        if let Some(url) = config.endpoint_url() {
            builder = builder.endpoint_url(url);
        }
        let client = Client::from_conf(builder.force_path_style(true).build());
        debug!(
            "S3 client ready: bucket={}, endpoint={:?}, region={}",
            config.bucket,
            config.endpoint_url(),
            config.region
        );
        Self::new(client, config.bucket.clone(), config.fs.ranged_reads)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, utf8_percent_encode(key, COPY_SOURCE))
    }
}

fn storage_error<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> FsError
where
    E: std::error::Error + 'static,
    R: fmt::Debug,
{
    let message = format!("{} {:?}: {}", op, key, DisplayErrorContext(err));
    error!("{}", message);
    FsError::Storage(message)
}

fn get_error<R: fmt::Debug>(key: &str, err: SdkError<GetObjectError, R>) -> FsError {
    if err.as_service_error().is_some_and(GetObjectError::is_no_such_key) {
        return FsError::NotFound(key.to_string());
    }
    storage_error("get", key, err)
}

fn body_of(content_length: Option<i64>, body: ByteStream) -> ObjectBody {
    let size = content_length.unwrap_or(0).max(0) as u64;
    ObjectBody::new(size, Box::pin(body.into_async_read()))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| storage_error("list", prefix, e))?;

            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                let modified = obj
                    .last_modified()
                    .and_then(|t| SystemTime::try_from(t.clone()).ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                objects.push(ObjectInfo::new(
                    key,
                    obj.size().unwrap_or(0).max(0) as u64,
                    modified,
                    obj.e_tag().unwrap_or_default(),
                ));
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        debug!("list: prefix={:?} returned {} objects", prefix, objects.len());
        Ok(objects)
    }

    async fn get(&self, key: &str) -> Result<ObjectBody> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_error(key, e))?;
        Ok(body_of(out.content_length(), out.body))
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<ObjectBody> {
        if !self.ranged_reads {
            return self.get(key).await?.slice(offset, len).await;
        }
        if len == 0 {
            return Ok(ObjectBody::empty());
        }
        let range = format!("bytes={}-{}", offset, offset.saturating_add(len - 1));
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await;
        match result {
            Ok(out) => Ok(body_of(out.content_length(), out.body)),
            Err(e)
                if e.raw_response().map(|r| r.status().as_u16())
                    == Some(HTTP_RANGE_NOT_SATISFIABLE) =>
            {
                debug!("get_range: offset {} past end of {:?}", offset, key);
                Ok(ObjectBody::empty())
            }
            Err(e) => Err(get_error(key, e)),
        }
    }

    async fn put(&self, key: &str, source: PutSource) -> Result<()> {
        let body = match source {
            PutSource::Empty => ByteStream::from(Vec::new()),
            PutSource::File(path) => ByteStream::from_path(&path)
                .await
                .map_err(|e| FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
        };
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_error("put", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("delete", key, e))?;
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(source_key))
            .key(dest_key)
            .send()
            .await
            .map_err(|e| storage_error("copy", source_key, e))?;
        Ok(())
    }
}
