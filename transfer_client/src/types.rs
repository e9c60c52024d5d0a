use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferClientError};

pub const LOCATOR_SCHEME: &str = "s3://";

/// Bucket + key address of an object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// A locator for `relative` below this one, treating the key as a prefix.
    pub fn join(&self, relative: &str) -> Self {
        let prefix = self.key.trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        let key = if prefix.is_empty() {
            relative.to_owned()
        } else {
            format!("{prefix}/{relative}")
        };
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LOCATOR_SCHEME}{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectLocator {
    type Err = TransferClientError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix(LOCATOR_SCHEME)
            .ok_or_else(|| TransferClientError::ConfigurationError(format!("locator {s:?} must start with {LOCATOR_SCHEME}")))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(TransferClientError::ConfigurationError(format!("locator {s:?} has no bucket")));
        }
        Ok(Self::new(bucket, key))
    }
}

impl TryFrom<String> for ObjectLocator {
    type Error = TransferClientError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectLocator> for String {
    fn from(value: ObjectLocator) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Object store to local filesystem.
    Download,
    /// Local filesystem to object store.
    Upload,
    /// Managed object store to an external object store.
    RemoteCopy,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Download => "download",
            TransferDirection::Upload => "upload",
            TransferDirection::RemoteCopy => "remote_copy",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferDirection {
    type Err = TransferClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "download" => Ok(TransferDirection::Download),
            "upload" => Ok(TransferDirection::Upload),
            "remote_copy" | "copy" => Ok(TransferDirection::RemoteCopy),
            other => Err(TransferClientError::ConfigurationError(format!("unknown transfer direction {other:?}"))),
        }
    }
}

/// Which files of the remote collection a run covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum FileSelection {
    /// Every file in the collection with this id.
    Collection(String),
    /// A single named subset (result set) of files.
    Subset(String),
    /// An explicit list of remote paths.
    Paths(Vec<String>),
}

impl FileSelection {
    /// Loads a retry manifest written by a previous run as an explicit path list.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let paths = progress_tracking::read_manifest(path)
            .map_err(|e| TransferClientError::ConfigurationError(format!("reading {path:?}: {e}")))?;
        Ok(FileSelection::Paths(paths))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            FileSelection::Collection(_) => "collection",
            FileSelection::Subset(_) => "subset",
            FileSelection::Paths(_) => "paths",
        }
    }
}

/// One file as enumerated from the metadata service. Immutable once listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: String,
    /// Path relative to the transfer root.
    pub alias: String,
    pub expected_size: u64,
    pub locator: ObjectLocator,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListingPage {
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub next_page: Option<String>,
}

/// Short-lived credentials scoped to one or more files. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Source address issued with the credentials, when the service pins it.
    #[serde(default)]
    pub source: Option<ObjectLocator>,
    #[serde(default)]
    pub destination: Option<ObjectLocator>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            source: None,
            destination: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHead {
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartSession {
    pub upload_id: String,
    pub locator: ObjectLocator,
    /// Milliseconds since the epoch; orders sessions for the same key.
    pub initiated: u64,
}

/// A part already held by an open multipart session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub size: u64,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub checksum: String,
}

impl From<&PartInfo> for CompletedPart {
    fn from(p: &PartInfo) -> Self {
        Self {
            part_number: p.part_number,
            checksum: p.checksum.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parse_and_display() {
        let l: ObjectLocator = "s3://bucket/a/b/c.txt".parse().unwrap();
        assert_eq!(l.bucket, "bucket");
        assert_eq!(l.key, "a/b/c.txt");
        assert_eq!(l.to_string(), "s3://bucket/a/b/c.txt");

        let root: ObjectLocator = "s3://bucket".parse().unwrap();
        assert_eq!(root.join("x/y").to_string(), "s3://bucket/x/y");
        assert_eq!(l.join("/d").key, "a/b/c.txt/d");

        assert!("http://bucket/key".parse::<ObjectLocator>().is_err());
        assert!("s3:///key".parse::<ObjectLocator>().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let c = Credentials::new("AKIA", "very-secret", "token-123");
        let s = format!("{c:?}");
        assert!(s.contains("AKIA"));
        assert!(!s.contains("very-secret"));
        assert!(!s.contains("token-123"));
    }

    #[test]
    fn test_selection_serialization() {
        let s = FileSelection::Subset("42".into());
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#"{"mode":"subset","value":"42"}"#);
        assert_eq!(serde_json::from_str::<FileSelection>(&json).unwrap(), s);
        assert_eq!("remote-copy".parse::<TransferDirection>().unwrap(), TransferDirection::RemoteCopy);
    }
}
