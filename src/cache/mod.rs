//! On-disk response cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <scheme>/<host>[:<port>]/<METHOD><path>.data        body
//! <scheme>/<host>[:<port>]/<METHOD><path>#index.data  body, path ends in '/'
//! <body path>.meta                                    {statusCode, headers}
//! ```
//!
//! The metadata file is the only proof that an entry is complete. A body
//! without metadata is left over from an aborted write and is never served.

pub mod body;
pub mod flight;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};

const DATA_SUFFIX: &str = ".data";
const INDEX_SUFFIX: &str = "#index.data";
const META_SUFFIX: &str = ".meta";
const META_TMP_SUFFIX: &str = ".meta.tmp";

/// Deterministic identity of a cacheable request.
///
/// Derived from scheme, host, port, method and path (with query). Nothing
/// else about the request, headers included, takes part.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    relative: PathBuf,
}

impl CacheKey {
    /// Derive the key for `method` on the absolute `uri`.
    ///
    /// Returns `None` when the URI has no scheme or host.
    pub fn new(method: &Method, uri: &Uri) -> Option<CacheKey> {
        let scheme = uri.scheme_str()?.to_ascii_lowercase();
        let host = uri.host()?.to_ascii_lowercase();
        let port = match (uri.port_u16(), scheme.as_str()) {
            (Some(80), "http") | (Some(443), "https") | (None, _) => String::new(),
            (Some(port), _) => format!(":{port}"),
        };
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let suffix = if path.ends_with('/') {
            INDEX_SUFFIX
        } else {
            DATA_SUFFIX
        };

        let mut relative = PathBuf::new();
        relative.push(sanitize_segment(&scheme));
        relative.push(sanitize_segment(&format!("{host}{port}")));

        let file = format!("{}{}{}", method.as_str(), path, suffix);
        for segment in file.split('/').filter(|s| !s.is_empty()) {
            relative.push(sanitize_segment(segment));
        }

        Some(CacheKey {
            method: method.clone(),
            relative,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Body path relative to the cache root.
    pub fn relative_path(&self) -> &Path {
        &self.relative
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.relative.display())
    }
}

// `.` and `..` would otherwise walk out of the host directory.
fn sanitize_segment(segment: &str) -> String {
    match segment {
        "." => "%2E".to_owned(),
        ".." => "%2E%2E".to_owned(),
        other => other.to_owned(),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// A header value as stored: one string, or a list when the header repeats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

/// The persisted `{statusCode, headers}` record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub status_code: u16,
    pub headers: BTreeMap<String, HeaderField>,
}

impl Metadata {
    pub fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        let mut fields = BTreeMap::new();
        for name in headers.keys() {
            let mut values = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>();
            let field = if values.len() == 1 {
                HeaderField::One(values.remove(0))
            } else {
                HeaderField::Many(values)
            };
            fields.insert(name.as_str().to_owned(), field);
        }

        Metadata {
            status_code: status.as_u16(),
            headers: fields,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK)
    }

    /// Rebuild a header map. Entries that are no longer valid header names or
    /// values are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, field) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let values = match field {
                HeaderField::One(value) => std::slice::from_ref(value),
                HeaderField::Many(values) => values.as_slice(),
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}

/// A complete cache entry.
pub struct CacheRecord {
    pub metadata: Metadata,
    /// Stored body, `None` for `HEAD` entries.
    pub body: Option<File>,
    pub path: PathBuf,
}

/// Owner of every artifact under the cache root.
#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute body path for `key`.
    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Absolute metadata path for `key`.
    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        with_suffix(&self.body_path(key), META_SUFFIX)
    }

    /// Look `key` up. A hit requires a metadata file that parses; a body file
    /// alone is a miss.
    pub async fn lookup(&self, key: &CacheKey) -> io::Result<Option<CacheRecord>> {
        let body_path = self.body_path(key);
        let meta = match fs::read(self.meta_path(key)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let metadata: Metadata = match serde_json::from_slice(&meta) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!("ignoring unreadable metadata for {:?}: {}", key, err);
                return Ok(None);
            }
        };

        let body = if *key.method() == Method::HEAD {
            None
        } else {
            Some(File::open(&body_path).await?)
        };

        Ok(Some(CacheRecord {
            metadata,
            body,
            path: body_path,
        }))
    }

    /// Create parent directories and open the body file for writing.
    pub async fn begin_write(&self, key: &CacheKey) -> io::Result<WriteHandle> {
        let body_path = self.body_path(key);
        if let Some(parent) = body_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&body_path).await?;

        Ok(WriteHandle {
            file,
            meta_path: self.meta_path(key),
            body_path,
            written: 0,
        })
    }
}

/// An open body file for an in-progress fetch.
///
/// Consumed by [`WriteHandle::commit`] or [`WriteHandle::abort`]; dropping it
/// behaves like `abort`.
#[derive(Debug)]
pub struct WriteHandle {
    file: File,
    body_path: PathBuf,
    meta_path: PathBuf,
    written: u64,
}

impl WriteHandle {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn body_path(&self) -> &Path {
        &self.body_path
    }

    /// Flush the body, then publish the metadata. The entry becomes a hit
    /// only once the rename lands.
    pub async fn commit(mut self, metadata: &Metadata) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        drop(self.file);

        let json = serde_json::to_vec(metadata).map_err(io::Error::from)?;
        let tmp = with_suffix(&self.body_path, META_TMP_SUFFIX);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.meta_path).await
    }

    /// Release the body file without writing metadata. The partial body
    /// stays on disk and is overwritten by the next writer for this key.
    pub async fn abort(mut self) {
        if let Err(err) = self.file.flush().await {
            tracing::debug!("flush of aborted body {} failed: {}", self.body_path.display(), err);
        }
    }
}
