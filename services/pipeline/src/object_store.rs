//! Object store access for a single logical bucket.
//!
//! [`ObjectStore`] is the raw collaborator (S3 in production, memory in
//! tests). [`ObjectGateway`] layers JSON encoding and tagging on top of it.

use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Object tags, sorted by key so the encoded form is stable
pub type Tags = BTreeMap<String, String>;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Tag key used by the bucket policy to grant anonymous reads
pub const TAG_ACCESS: &str = "access";
/// Tag value granting anonymous reads
pub const TAG_ACCESS_PUBLIC: &str = "public";

/// Tags marking an object as publicly readable
pub fn public_access_tags() -> Tags {
    Tags::from([(TAG_ACCESS.to_string(), TAG_ACCESS_PUBLIC.to_string())])
}

/// An object as written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct PutObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub tags: Tags,
}

/// Raw object storage collaborator
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the full body of an object
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Write or overwrite an object
    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()>;
}

/// Encode tags as a URL query string (`k1=v1&k2=v2`)
pub fn encode_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Form-urlencode one query component
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Typed access to the bucket shared by all stages
#[derive(Clone)]
pub struct ObjectGateway {
    store: Arc<dyn ObjectStore>,
}

impl ObjectGateway {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Read the full object body
    pub async fn get(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        self.store.get(bucket, path).await
    }

    /// Read an object and decode it as JSON
    pub async fn get_json<T: DeserializeOwned>(&self, bucket: &str, path: &str) -> Result<T> {
        let body = self.store.get(bucket, path).await?;
        serde_json::from_slice(&body).map_err(|e| {
            PipelineError::Serialization(format!("s3://{}/{}: {}", bucket, path, e))
        })
    }

    /// Encode a value as JSON and write it, attaching tags when non-empty
    #[instrument(skip(self, value, tags), fields(bucket = %bucket, path = %path))]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        bucket: &str,
        path: &str,
        value: &T,
        tags: &Tags,
    ) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        debug!(size_bytes = body.len(), tags = tags.len(), "Putting JSON object");

        self.store
            .put(
                bucket,
                path,
                PutObject {
                    body,
                    content_type: CONTENT_TYPE_JSON.to_string(),
                    tags: tags.clone(),
                },
            )
            .await
    }

    /// Write raw bytes with the given content type
    #[instrument(skip(self, body), fields(bucket = %bucket, path = %path, size_bytes = body.len()))]
    pub async fn put_binary(
        &self,
        bucket: &str,
        path: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.store
            .put(
                bucket,
                path,
                PutObject {
                    body,
                    content_type: content_type.to_string(),
                    tags: Tags::new(),
                },
            )
            .await
    }
}

/// In-process object store keyed by `(bucket, key)`
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), PutObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored object, including content type and tags
    pub fn object(&self, bucket: &str, key: &str) -> Option<PutObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// Keys stored in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.object(bucket, key)
            .map(|object| object.body)
            .ok_or_else(|| PipelineError::not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()> {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        name: String,
        confidence: f64,
    }

    fn gateway() -> (Arc<MemoryObjectStore>, ObjectGateway) {
        let store = Arc::new(MemoryObjectStore::new());
        (store.clone(), ObjectGateway::new(store))
    }

    #[test]
    fn test_encode_tags() {
        assert_eq!(encode_tags(&public_access_tags()), "access=public");

        let tags = Tags::from([
            ("team".to_string(), "vision & audio".to_string()),
            ("access".to_string(), "public".to_string()),
        ]);
        assert_eq!(encode_tags(&tags), "access=public&team=vision+%26+audio");
        assert_eq!(encode_tags(&Tags::new()), "");
    }

    #[tokio::test]
    async fn test_put_json_then_get_json() {
        let (store, gateway) = gateway();
        let payload = Payload {
            name: "Dog".to_string(),
            confidence: 97.5,
        };

        gateway
            .put_json("bucket", "rekognition-artifacts/req-1", &payload, &Tags::new())
            .await
            .unwrap();

        let object = store.object("bucket", "rekognition-artifacts/req-1").unwrap();
        assert_eq!(object.content_type, CONTENT_TYPE_JSON);
        assert!(object.tags.is_empty());

        let read: Payload = gateway
            .get_json("bucket", "rekognition-artifacts/req-1")
            .await
            .unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_put_json_with_tags() {
        let (store, gateway) = gateway();
        gateway
            .put_json("bucket", "consolidated/req-1", &serde_json::json!({}), &public_access_tags())
            .await
            .unwrap();

        let object = store.object("bucket", "consolidated/req-1").unwrap();
        assert_eq!(object.tags.get(TAG_ACCESS).map(String::as_str), Some(TAG_ACCESS_PUBLIC));
    }

    #[tokio::test]
    async fn test_put_binary() {
        let (store, gateway) = gateway();
        gateway
            .put_binary("bucket", "polly-artifacts/req-1", vec![1, 2, 3], "audio/mpeg3")
            .await
            .unwrap();

        assert_eq!(gateway.get("bucket", "polly-artifacts/req-1").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.object("bucket", "polly-artifacts/req-1").unwrap().content_type,
            "audio/mpeg3"
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_, gateway) = gateway();
        let err = tokio_test::assert_err!(gateway.get("bucket", "polly-artifacts/none").await);
        assert_eq!(err, PipelineError::not_found("bucket", "polly-artifacts/none"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_serialization_error() {
        let (_, gateway) = gateway();
        gateway
            .put_binary("bucket", "rekognition-artifacts/bad", b"not json".to_vec(), "text/plain")
            .await
            .unwrap();

        let err = gateway
            .get_json::<Payload>("bucket", "rekognition-artifacts/bad")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_all_land() {
        let (store, gateway) = gateway();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32u8 {
            let gateway = gateway.clone();
            tasks.spawn(async move {
                let key = format!("polly-artifacts/req-{i}");
                gateway.put_binary("bucket", &key, vec![i], "audio/mpeg3").await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            tokio_test::assert_ok!(joined.unwrap());
        }

        assert_eq!(store.keys("bucket").len(), 32);
        assert_eq!(store.object("bucket", "polly-artifacts/req-7").unwrap().body, vec![7]);
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let (store, gateway) = gateway();
        gateway
            .put_binary("a", "uploads/req-1", vec![0], "image/jpeg")
            .await
            .unwrap();
        assert!(store.contains("a", "uploads/req-1"));
        assert!(!store.contains("b", "uploads/req-1"));
        assert_eq!(store.keys("a"), vec!["uploads/req-1".to_string()]);
    }
}
