use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use terrarium_core::{ObjectStore, StorageError, StoredObject, WriteCondition};
use tokio::io::AsyncWrite;
use tracing::{debug, instrument, warn};

use crate::config::S3Settings;

/// Retries after a transient failure.
const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;
/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;

/// S3 object store with ETag-based conditional writes.
///
/// Works against AWS S3 and S3-compatible services reached through a
/// custom endpoint with path-style addressing.
#[derive(Clone)]
pub struct S3Store {
    s3_client: S3Client,
    bucket_name: String,
    conditional_writes: bool,
}

impl S3Store {
    pub fn new(s3_client: S3Client, bucket_name: String, conditional_writes: bool) -> Self {
        Self {
            s3_client,
            bucket_name,
            conditional_writes,
        }
    }

    /// Build a client from validated settings with static credentials.
    ///
    /// SDK-level retries are disabled; every primitive here retries on its own.
    pub fn connect(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "terrarium-env",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::new(
            S3Client::from_conf(builder.build()),
            settings.bucket.clone(),
            settings.conditional_writes,
        )
    }

    /// Send a `get_object`, retrying transient errors. `None` for NoSuchKey.
    async fn send_get(
        &self,
        key: &str,
    ) -> Result<Option<aws_sdk_s3::operation::get_object::GetObjectOutput>, StorageError> {
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .get_object()
                .bucket(&self.bucket_name)
                .key(key)
                .send()
                .await;

            match result {
                Ok(output) => return Ok(Some(output)),
                Err(e) => {
                    if is_transient(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key, "S3 get_object retryable error, retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    let service_error = e.into_service_error();
                    if service_error.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(StorageError::Io(format!(
                        "S3 get_object error for {}: {}",
                        key, service_error
                    )));
                }
            }
        }
        unreachable!()
    }
}

/// HTTP status of a failed call, if a response came back at all.
fn response_status(err: &SdkError<impl std::fmt::Debug>) -> Option<u16> {
    match err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    }
}

/// Throttling, 5xx and transport failures.
fn is_transient(err: &SdkError<impl std::fmt::Debug>) -> bool {
    match response_status(err) {
        Some(status) => status == 429 || (500..=599).contains(&status),
        None => matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)),
    }
}

/// Doubling delay from `BASE_DELAY_MS`, plus up to 50ms taken from the clock's nanos.
async fn backoff(attempt: u32) {
    let jitter = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos() % 50))
        .unwrap_or(0);
    let delay = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10)) + jitter;
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// `CopySource` value: `{bucket}/{key}` with each key segment URL-encoded.
pub(crate) fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

#[async_trait]
impl ObjectStore for S3Store {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn supports_conditional_writes(&self) -> bool {
        self.conditional_writes
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let mut attempt = 0;
            let output = loop {
                match request.clone().send().await {
                    Ok(output) => break output,
                    Err(e) => {
                        if is_transient(&e) && attempt < MAX_RETRIES {
                            warn!(attempt, prefix, "S3 list_objects retryable error, retrying");
                            backoff(attempt).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(StorageError::Io(format!(
                            "S3 list_objects error for {}: {}",
                            prefix,
                            e.into_service_error()
                        )));
                    }
                }
            };

            if let Some(contents) = output.contents {
                keys.extend(contents.into_iter().filter_map(|obj| obj.key));
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        debug!("Listed {} keys under {}", keys.len(), prefix);
        Ok(keys)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        let Some(output) = self.send_get(key).await? else {
            return Ok(None);
        };
        let version = output.e_tag().map(str::to_string);
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read S3 object body: {}", e)))?
            .into_bytes()
            .to_vec();
        Ok(Some(StoredObject { data, version }))
    }

    #[instrument(skip(self, writer), level = "debug")]
    async fn download_to(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        let output = self
            .send_get(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let body = output.body.into_async_read();
        tokio::pin!(body);
        tokio::io::copy(&mut body, writer)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to stream {}: {}", key, e)))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<(), StorageError> {
        // A resent conditional write can fail against our own first attempt,
        // so those get a single try.
        let conditional = self.conditional_writes && condition != WriteCondition::None;
        let retries = if conditional { 0 } else { MAX_RETRIES };
        for attempt in 0..=retries {
            let mut req = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(key)
                .body(ByteStream::from(data.clone()));

            if self.conditional_writes {
                req = match &condition {
                    WriteCondition::None => req,
                    WriteCondition::IfAbsent => req.if_none_match("*"),
                    WriteCondition::IfMatch(etag) => req.if_match(etag),
                };
            }

            match req.send().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if response_status(&e) == Some(412) {
                        return Err(StorageError::PreconditionFailed(key.to_string()));
                    }
                    if is_transient(&e) && attempt < retries {
                        warn!(attempt, key, "S3 put_object retryable error, retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(StorageError::Io(format!(
                        "S3 put_object error for {}: {}",
                        key,
                        e.into_service_error()
                    )));
                }
            }
        }
        unreachable!()
    }

    #[instrument(skip(self), level = "debug")]
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| StorageError::LocalFilesystem {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();

        for attempt in 0..=MAX_RETRIES {
            let body = ByteStream::from_path(path).await.map_err(|e| {
                StorageError::Io(format!("Failed to open {}: {}", path.display(), e))
            })?;
            let result = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(key)
                .body(body)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(len),
                Err(e) => {
                    if is_transient(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key, "S3 put_object (file) retryable error, retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(StorageError::Io(format!(
                        "S3 put_object error for {}: {}",
                        key,
                        e.into_service_error()
                    )));
                }
            }
        }
        unreachable!()
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .delete_object()
                .bucket(&self.bucket_name)
                .key(key)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if is_transient(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key, "S3 delete_object retryable error, retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(StorageError::Io(format!(
                        "S3 delete_object error for {}: {}",
                        key,
                        e.into_service_error()
                    )));
                }
            }
        }
        unreachable!()
    }

    #[instrument(skip(self, keys), level = "debug", fields(keys = keys.len()))]
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for chunk in keys.chunks(DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StorageError::InvalidKey(format!("{}: {}", key, e)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::Io(format!("Failed to build delete request: {}", e)))?;

            let mut attempt = 0;
            let output = loop {
                match self
                    .s3_client
                    .delete_objects()
                    .bucket(&self.bucket_name)
                    .delete(delete.clone())
                    .send()
                    .await
                {
                    Ok(output) => break output,
                    Err(e) => {
                        if is_transient(&e) && attempt < MAX_RETRIES {
                            warn!(attempt, "S3 delete_objects retryable error, retrying");
                            backoff(attempt).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(StorageError::Io(format!(
                            "S3 delete_objects error: {}",
                            e.into_service_error()
                        )));
                    }
                }
            };

            if let Some(failed) = output.errors().first() {
                return Err(StorageError::Io(format!(
                    "S3 delete_objects failed for {} of {} keys, first {}: {}",
                    output.errors().len(),
                    chunk.len(),
                    failed.key().unwrap_or("?"),
                    failed.message().unwrap_or("unknown error")
                )));
            }
            debug!("Deleted {} keys", chunk.len());
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError> {
        let copy_source = copy_source(&self.bucket_name, source);
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .copy_object()
                .bucket(&self.bucket_name)
                .copy_source(&copy_source)
                .key(destination)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if is_transient(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, source, "S3 copy_object retryable error, retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(StorageError::Io(format!(
                        "S3 copy_object error {} -> {}: {}",
                        source,
                        destination,
                        e.into_service_error()
                    )));
                }
            }
        }
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_for(server: &MockServer) -> S3Store {
        S3Store::connect(&S3Settings {
            bucket: "bucket".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some(server.uri()),
            access_key: "AKIDTEST".to_string(),
            secret_key: "secret".to_string(),
            conditional_writes: true,
        })
    }

    fn s3_error(code: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>test</Message></Error>",
            code
        )
    }

    #[test]
    fn test_copy_source_encodes_segments() {
        assert_eq!(copy_source("b", "dir/state/a.txt"), "b/dir/state/a.txt");
        assert_eq!(copy_source("b", "dir/state/my file+1.txt"), "b/dir/state/my%20file%2B1.txt");
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(ResponseTemplate::new(404).set_body_string(s3_error("NoSuchKey")))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(store.get("infra/.lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_returns_body_and_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .set_body_string("1700000600"),
            )
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let object = store.get("infra/.lock").await.unwrap().unwrap();
        assert_eq!(object.data, b"1700000600");
        assert_eq!(object.version.as_deref(), Some("\"abc\""));
    }

    #[tokio::test]
    async fn test_get_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/k"))
            .respond_with(ResponseTemplate::new(503).set_body_string(s3_error("SlowDown")))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bucket/k"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let object = store.get("k").await.unwrap().unwrap();
        assert_eq!(object.data, b"ok");
    }

    #[tokio::test]
    async fn test_put_if_absent_maps_412() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(
                ResponseTemplate::new(412).set_body_string(s3_error("PreconditionFailed")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let err = store
            .put("infra/.lock", b"1".to_vec(), WriteCondition::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_list_follows_continuation_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/bucket/?$"))
            .and(query_param("continuation-token", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <Name>bucket</Name><Prefix>infra/state/</Prefix><KeyCount>1</KeyCount>\
                 <MaxKeys>1000</MaxKeys><IsTruncated>false</IsTruncated>\
                 <Contents><Key>infra/state/b.txt</Key></Contents>\
                 </ListBucketResult>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/bucket/?$"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <Name>bucket</Name><Prefix>infra/state/</Prefix><KeyCount>1</KeyCount>\
                 <MaxKeys>1000</MaxKeys><IsTruncated>true</IsTruncated>\
                 <NextContinuationToken>page2</NextContinuationToken>\
                 <Contents><Key>infra/state/a.txt</Key></Contents>\
                 </ListBucketResult>",
            ))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let keys = store.list("infra/state/").await.unwrap();
        assert_eq!(keys, vec!["infra/state/a.txt", "infra/state/b.txt"]);
    }

    #[tokio::test]
    async fn test_conditional_put_is_not_resent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(ResponseTemplate::new(500).set_body_string(s3_error("InternalError")))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        // Would be hit by a resend after the first attempt landed.
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(
                ResponseTemplate::new(412).set_body_string(s3_error("PreconditionFailed")),
            )
            .expect(0)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let err = store
            .put("infra/.lock", b"1700000600".to_vec(), WriteCondition::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unconditional_put_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(ResponseTemplate::new(503).set_body_string(s3_error("SlowDown")))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/.lock"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store
            .put("infra/.lock", b"1700000600".to_vec(), WriteCondition::None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_file_reports_local_length() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/state/main.tf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("main.tf");
        std::fs::write(&file, "resource {}").unwrap();

        let store = store_for(&server).await;
        assert_eq!(store.put_file("infra/state/main.tf", &file).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_copy_sends_encoded_source() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/infra/backups/1700000000/plan.tf"))
            .and(header("x-amz-copy-source", "bucket/infra/state/my%20plan%2B1.tf"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <CopyObjectResult><ETag>\"abc\"</ETag>\
                 <LastModified>2024-01-01T00:00:00.000Z</LastModified></CopyObjectResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store
            .copy("infra/state/my plan+1.tf", "infra/backups/1700000000/plan.tf")
            .await
            .unwrap();
    }

    const DELETE_OK: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"></DeleteResult>";

    #[tokio::test]
    async fn test_delete_many_batches_by_thousand() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/bucket/?$"))
            .and(query_param("delete", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(DELETE_OK))
            .expect(2)
            .mount(&server)
            .await;

        let keys: Vec<String> = (0..1001).map(|i| format!("infra/state/{}.tf", i)).collect();
        let store = store_for(&server).await;
        store.delete_many(&keys).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_many_surfaces_per_key_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/bucket/?$"))
            .and(query_param("delete", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <Error><Key>infra/state/a.tf</Key><Code>AccessDenied</Code>\
                 <Message>Access Denied</Message></Error>\
                 </DeleteResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let keys = vec!["infra/state/a.tf".to_string(), "infra/state/b.tf".to_string()];
        let store = store_for(&server).await;
        let err = store.delete_many(&keys).await.unwrap_err();
        match err {
            StorageError::Io(message) => {
                assert!(message.contains("infra/state/a.tf"), "{}", message);
                assert!(message.contains("Access Denied"), "{}", message);
            }
            other => panic!("expected Io, got {:?}", other),
        }
    }
}
