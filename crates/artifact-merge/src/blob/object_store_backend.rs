//! Object store implementation of BlobStore.
//!
//! Supports S3 (and S3-compatible endpoints), the local filesystem and an
//! in-memory backend via the `object_store` crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder, AmazonS3ConfigKey};
use object_store::signer::Signer;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, GetResult, ObjectStore, PutOptions,
    PutPayload,
};
use reqwest::{Method, StatusCode};

use super::naming::{bucket_dir, object_path};
use super::{
    BlobStore, FetchedObject, ObjectHead, ObjectLocation, PutRequest, StoreError, StoreResult,
    StoreSpec, ENCRYPTION_ATTRIBUTE,
};

/// Response header S3 uses to report an object's server-side encryption.
pub const SSE_HEADER: &str = "x-amz-server-side-encryption";

/// Lifetime of the presigned URLs used for metadata requests.
const PRESIGN_TTL: Duration = Duration::from_secs(300);

/// How a backend stores and reports the encryption setting of an object.
enum EncryptionMode {
    /// Carried as the [`ENCRYPTION_ATTRIBUTE`] metadata attribute (in-memory backend).
    Metadata,
    /// Native S3 server-side encryption: written by a client configured for
    /// the setting, read back from the [`SSE_HEADER`] response header.
    ServerSide(reqwest::Client),
    /// Not persisted (local filesystem).
    Unsupported,
}

/// Cache key for clients. S3 clients carry their encryption setting, so one
/// bucket may have several.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    bucket: String,
    encryption: Option<String>,
}

#[derive(Clone)]
struct BucketClient {
    store: Arc<dyn ObjectStore>,
    /// Presigns metadata requests (S3 only)
    signer: Option<Arc<AmazonS3>>,
}

/// Blob store backed by `object_store`.
///
/// `object_store` clients are bound to a single bucket, while a merge job
/// reads from and writes to arbitrary buckets. Clients are therefore created
/// on first use of a bucket and cached for the lifetime of the store.
pub struct ObjectStoreBlobStore {
    spec: StoreSpec,
    clients: Mutex<HashMap<ClientKey, BucketClient>>,
    encryption: EncryptionMode,
}

impl ObjectStoreBlobStore {
    /// Create a store from a parsed spec.
    pub fn from_spec(spec: &StoreSpec) -> StoreResult<Self> {
        let encryption = if spec.is_memory() {
            EncryptionMode::Metadata
        } else if spec.is_file() {
            EncryptionMode::Unsupported
        } else if spec.scheme == "s3" {
            let http = reqwest::Client::builder()
                .build()
                .map_err(|e| StoreError::Io {
                    message: format!("failed to create HTTP client: {}", e),
                })?;
            EncryptionMode::ServerSide(http)
        } else {
            return Err(StoreError::InvalidSpec {
                spec: spec.scheme.clone(),
                reason: format!("unsupported scheme: {}", spec.scheme),
            });
        };

        Ok(Self {
            spec: spec.clone(),
            clients: Mutex::new(HashMap::new()),
            encryption,
        })
    }

    /// Create a store from a URL string.
    pub fn from_url(url: &str) -> StoreResult<Self> {
        let spec = StoreSpec::parse(url)?;
        Self::from_spec(&spec)
    }

    /// Create an in-memory store for testing.
    pub fn memory() -> Self {
        Self {
            spec: StoreSpec {
                scheme: "memory".to_string(),
                root: String::new(),
                region: None,
                endpoint: None,
            },
            clients: Mutex::new(HashMap::new()),
            encryption: EncryptionMode::Metadata,
        }
    }

    /// The client for `bucket`, creating it on first use.
    ///
    /// `encryption` selects a client that applies that setting to uploads;
    /// it only distinguishes clients on S3.
    fn client(&self, bucket: &str, encryption: Option<&str>) -> StoreResult<BucketClient> {
        let key = ClientKey {
            bucket: bucket.to_string(),
            encryption: match self.encryption {
                EncryptionMode::ServerSide(_) => encryption.map(str::to_string),
                _ => None,
            },
        };

        let mut clients = self.clients.lock().map_err(|_| StoreError::Io {
            message: "client cache lock poisoned".to_string(),
        })?;

        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = self.build_client(&key)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn build_client(&self, key: &ClientKey) -> StoreResult<BucketClient> {
        let store: Arc<dyn ObjectStore> = match self.spec.scheme.as_str() {
            "memory" => Arc::new(object_store::memory::InMemory::new()),
            "file" => {
                let path = bucket_dir(&self.spec.root, &key.bucket);
                // Ensure directory exists
                std::fs::create_dir_all(&path).map_err(|e| StoreError::Io {
                    message: format!(
                        "failed to create bucket directory {}: {}",
                        path.display(),
                        e
                    ),
                })?;
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(&path).map_err(|e| {
                        StoreError::Io {
                            message: format!(
                                "failed to create local store at {}: {}",
                                path.display(),
                                e
                            ),
                        }
                    })?,
                )
            }
            "s3" => {
                let s3 = Arc::new(self.build_s3(key)?);
                return Ok(BucketClient {
                    store: s3.clone(),
                    signer: Some(s3),
                });
            }
            scheme => {
                return Err(StoreError::InvalidSpec {
                    spec: self.spec.scheme.clone(),
                    reason: format!("unsupported scheme: {}", scheme),
                })
            }
        };
        Ok(BucketClient {
            store,
            signer: None,
        })
    }

    fn build_s3(&self, key: &ClientKey) -> StoreResult<AmazonS3> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&key.bucket);

        if let Some(region) = &self.spec.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &self.spec.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(encryption) = &key.encryption {
            let config_key: AmazonS3ConfigKey = "aws_server_side_encryption".parse()?;
            builder = builder.with_config(config_key, encryption);
        }

        builder.build().map_err(|e| StoreError::Io {
            message: format!("failed to create S3 client for {}: {}", key.bucket, e),
        })
    }

    fn put_options(&self, location: &ObjectLocation, request: PutRequest) -> PutOptions {
        let mut attributes = Attributes::new();
        match self.encryption {
            EncryptionMode::Unsupported => {
                if request.encryption.is_some() {
                    tracing::debug!(
                        location = %location,
                        "backend does not persist object attributes, dropping encryption setting"
                    );
                }
                return PutOptions::default();
            }
            EncryptionMode::Metadata => {
                if let Some(encryption) = request.encryption {
                    attributes.insert(
                        Attribute::Metadata(ENCRYPTION_ATTRIBUTE.into()),
                        AttributeValue::from(encryption),
                    );
                }
            }
            // Applied by the client chosen in `put`.
            EncryptionMode::ServerSide(_) => {}
        }
        if let Some(content_type) = request.content_type {
            attributes.insert(Attribute::ContentType, AttributeValue::from(content_type));
        }

        PutOptions {
            attributes,
            ..Default::default()
        }
    }

    /// HEAD an S3 object through a presigned URL.
    ///
    /// `object_store` does not expose the server-side encryption response
    /// header, so the request is sent directly.
    async fn head_server_side(
        &self,
        http: &reqwest::Client,
        location: &ObjectLocation,
    ) -> StoreResult<ObjectHead> {
        let label = location.to_string();
        let client = self.client(&location.bucket, None)?;
        let signer = client.signer.ok_or_else(|| StoreError::Io {
            message: format!("no request signer for {}", label),
        })?;

        let url = signer
            .signed_url(Method::HEAD, &object_path(&location.key), PRESIGN_TTL)
            .await
            .map_err(|e| StoreError::from_object_store(e, &label))?;
        let response = http.head(url).send().await.map_err(|e| StoreError::Io {
            message: format!("HEAD {} failed: {}", label, e),
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound { location: label }),
            status @ (StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) => {
                return Err(StoreError::AccessDenied {
                    message: format!("{}: HTTP {}", label, status),
                })
            }
            status if !status.is_success() => {
                return Err(StoreError::Io {
                    message: format!("HEAD {} returned HTTP {}", label, status),
                })
            }
            _ => {}
        }

        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Io {
                message: format!("HEAD {} returned no content length", label),
            })?;
        let encryption = headers
            .get(SSE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(ObjectHead { size, encryption })
    }
}

fn encryption_of(result: &GetResult) -> Option<String> {
    result
        .attributes
        .get(&Attribute::Metadata(ENCRYPTION_ATTRIBUTE.into()))
        .map(|value| {
            let value: &str = value.as_ref();
            value.to_string()
        })
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn get(&self, location: &ObjectLocation) -> StoreResult<FetchedObject> {
        let client = self.client(&location.bucket, None)?;
        let label = location.to_string();

        let result = client
            .store
            .get_opts(&object_path(&location.key), GetOptions::default())
            .await
            .map_err(|e| StoreError::from_object_store(e, &label))?;

        let content_length = result.meta.size;
        let attributed = encryption_of(&result);

        let bytes = result.bytes().await.map_err(|e| StoreError::Io {
            message: format!("failed to read {}: {}", label, e),
        })?;

        let encryption = match &self.encryption {
            EncryptionMode::Metadata => attributed,
            EncryptionMode::ServerSide(http) => {
                self.head_server_side(http, location).await?.encryption
            }
            EncryptionMode::Unsupported => None,
        };

        Ok(FetchedObject {
            bytes,
            content_length,
            encryption,
        })
    }

    async fn head(&self, location: &ObjectLocation) -> StoreResult<ObjectHead> {
        if let EncryptionMode::ServerSide(http) = &self.encryption {
            return self.head_server_side(http, location).await;
        }

        let client = self.client(&location.bucket, None)?;
        let label = location.to_string();

        // A head request through get_opts keeps the attributes, which
        // `ObjectStore::head` discards.
        let mut options = GetOptions::default();
        options.head = true;

        let result = client
            .store
            .get_opts(&object_path(&location.key), options)
            .await
            .map_err(|e| StoreError::from_object_store(e, &label))?;

        Ok(ObjectHead {
            size: result.meta.size,
            encryption: match self.encryption {
                EncryptionMode::Metadata => encryption_of(&result),
                _ => None,
            },
        })
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Bytes,
        request: PutRequest,
    ) -> StoreResult<()> {
        let client = self.client(&location.bucket, request.encryption.as_deref())?;
        let options = self.put_options(location, request);

        client
            .store
            .put_opts(
                &object_path(&location.key),
                PutPayload::from_bytes(bytes),
                options,
            )
            .await
            .map_err(|e| StoreError::from_object_store(e, &location.to_string()))?;

        Ok(())
    }
}
