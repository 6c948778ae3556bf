//! Object store backends for composite images.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// `put(bucket, key, bytes, content type, metadata)`.
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Sidecar written next to every object by `FsObjectStore`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub size: usize,
    pub sha256: String,
    pub metadata: BTreeMap<String, String>,
}

/// Stores objects as files under `<root>/<bucket>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(safe_segment(bucket, "bucket")?);
        for part in key.split('/').filter(|part| !part.is_empty()) {
            path.push(safe_segment(part, "key")?);
        }
        if path.parent() == Some(self.root.as_path()) {
            bail!("object key must not be empty");
        }
        Ok(path)
    }

    /// Read back an object's sidecar.
    pub fn read_meta(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let path = meta_path(&self.object_path(bucket, key)?);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read object metadata {}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        std::fs::write(&path, body).with_context(|| format!("write object {}", path.display()))?;

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            size: body.len(),
            sha256: hex::encode(Sha256::digest(body)),
            metadata: metadata.clone(),
        };
        let meta_file = meta_path(&path);
        std::fs::write(&meta_file, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("write object metadata {}", meta_file.display()))?;
        log::debug!("stored {} bytes at {}", body.len(), path.display());
        Ok(())
    }
}

fn meta_path(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

fn safe_segment<'a>(segment: &'a str, what: &str) -> Result<&'a str> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(segment),
        _ => Err(anyhow!("invalid object {} segment {:?}", what, segment)),
    }
}

/// S3-compatible HTTP store: `PUT <endpoint>/<bucket>/<key>`.
pub struct HttpObjectStore {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid object store endpoint {}", endpoint))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { endpoint, agent })
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("object store endpoint {} cannot be a base", self.endpoint))?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/').filter(|part| !part.is_empty()));
        Ok(url)
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let mut request = self
            .agent
            .put(url.as_str())
            .set("Content-Type", content_type);
        for (name, value) in metadata {
            request = request.set(&format!("x-amz-meta-{}", name), value);
        }
        request
            .send_bytes(body)
            .with_context(|| format!("put object {}", url))?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

/// In-process store keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        match self.objects.lock() {
            Ok(objects) => objects
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, key)| key.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory object store lock poisoned"))?;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.to_vec(),
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::from([("frame_index".to_string(), "4".to_string())])
    }

    #[test]
    fn fs_store_writes_object_and_sidecar() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsObjectStore::new(dir.path());
        store.put("frames", "cam/4.jpg", b"jpeg", "image/jpeg", &meta())?;

        let path = dir.path().join("frames").join("cam").join("4.jpg");
        assert_eq!(std::fs::read(&path)?, b"jpeg");

        let sidecar = store.read_meta("frames", "cam/4.jpg")?;
        assert_eq!(sidecar.content_type, "image/jpeg");
        assert_eq!(sidecar.size, 4);
        assert_eq!(sidecar.sha256, hex::encode(Sha256::digest(b"jpeg")));
        assert_eq!(sidecar.metadata, meta());
        Ok(())
    }

    #[test]
    fn fs_store_rejects_path_escapes() {
        let store = FsObjectStore::new("/tmp/motion-grid-unused");
        assert!(store.object_path("frames", "../etc/passwd").is_err());
        assert!(store.object_path("..", "x.jpg").is_err());
        assert!(store.object_path("frames", "").is_err());
    }

    #[test]
    fn http_store_builds_object_urls() -> Result<()> {
        let store = HttpObjectStore::new("http://127.0.0.1:9000/", Duration::from_secs(1))?;
        assert_eq!(
            store.object_url("frames", "cam/7.jpg")?.as_str(),
            "http://127.0.0.1:9000/frames/cam/7.jpg"
        );
        let nested = HttpObjectStore::new("http://store.local/s3", Duration::from_secs(1))?;
        assert_eq!(
            nested.object_url("b", "k.jpg")?.as_str(),
            "http://store.local/s3/b/k.jpg"
        );
        Ok(())
    }

    #[test]
    fn http_store_puts_body_with_content_type_and_metadata() -> Result<()> {
        let server = crate::http_stub::serve_once(200, "")?;
        let store = HttpObjectStore::new(&server.base_url, Duration::from_secs(5))?;
        store.put("frames", "cam/7.jpg", b"jpeg", "image/jpeg", &meta())?;

        let request = server.request()?;
        assert_eq!(request.request_line, "PUT /frames/cam/7.jpg HTTP/1.1");
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("image/jpeg")
        );
        assert_eq!(
            request.headers.get("x-amz-meta-frame_index").map(String::as_str),
            Some("4")
        );
        assert_eq!(request.body, b"jpeg");
        Ok(())
    }

    #[test]
    fn http_store_fails_on_error_status() -> Result<()> {
        let server = crate::http_stub::serve_once(503, "")?;
        let store = HttpObjectStore::new(&server.base_url, Duration::from_secs(5))?;
        let err = store
            .put("frames", "cam/8.jpg", b"jpeg", "image/jpeg", &meta())
            .expect_err("503 must fail");
        assert!(format!("{:#}", err).contains("cam/8.jpg"));
        server.request()?;
        Ok(())
    }

    #[test]
    fn memory_store_keeps_objects_per_bucket() -> Result<()> {
        let store = MemoryObjectStore::new();
        store.put("a", "1.jpg", b"one", "image/jpeg", &meta())?;
        store.put("b", "2.jpg", b"two", "image/jpeg", &BTreeMap::new())?;
        assert_eq!(store.len(), 2);
        assert_eq!(store.keys("a"), vec!["1.jpg".to_string()]);
        assert_eq!(store.get("b", "2.jpg").map(|o| o.body), Some(b"two".to_vec()));
        assert!(store.get("a", "2.jpg").is_none());
        Ok(())
    }
}
