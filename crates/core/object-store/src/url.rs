//! Validated URL wrapper and provider types for object store URLs.

use std::path::PathBuf;

use fs_err as fs;
use url::Url;

/// A validated URL wrapper that ensures the URL is a valid object store URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectStoreUrl {
    url: Url,
    provider: ObjectStoreProvider,
}

impl ObjectStoreUrl {
    /// Creates a new ObjectStoreUrl from a string that can be either a URL or filesystem path.
    ///
    /// Filesystem paths are created when missing, output and working directories are usually
    /// not there on a first run.
    pub fn new(location: impl Into<String>) -> Result<Self, ObjectStoreUrlError> {
        let location = location.into();

        // If the location fails to parse as a URL, we assume it's a filesystem path.
        match Url::parse(&location) {
            Ok(url) => Self::try_from_url(url),
            Err(_) => Self::try_from_filesystem_path(&location),
        }
    }

    fn try_from_url(url: Url) -> Result<Self, ObjectStoreUrlError> {
        let provider = ObjectStoreProvider::from_scheme(url.scheme())?;
        if provider == ObjectStoreProvider::Local {
            let path = url
                .to_file_path()
                .map_err(|()| ObjectStoreUrlError::InvalidFilesystemPath {
                    path: PathBuf::from(url.path()),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "file url has no local path",
                    ),
                })?;
            return Self::try_from_filesystem_path(path.to_string_lossy());
        }

        Ok(Self { url, provider })
    }

    fn try_from_filesystem_path(location: impl AsRef<str>) -> Result<Self, ObjectStoreUrlError> {
        let path = PathBuf::from(location.as_ref());

        fs::create_dir_all(&path).map_err(|err| ObjectStoreUrlError::InvalidFilesystemPath {
            path: path.clone(),
            source: err,
        })?;
        let canonical_path =
            fs::canonicalize(&path).map_err(|err| ObjectStoreUrlError::InvalidFilesystemPath {
                path: path.clone(),
                source: err,
            })?;

        let url = Url::from_directory_path(&canonical_path).map_err(|_| {
            ObjectStoreUrlError::InvalidFilesystemPath {
                path: canonical_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "absolute path could not be resolved",
                ),
            }
        })?;

        Ok(Self {
            url,
            provider: ObjectStoreProvider::Local,
        })
    }

    /// Returns the [`ObjectStoreProvider`] of the URL.
    pub fn provider(&self) -> ObjectStoreProvider {
        self.provider
    }
}

impl AsRef<ObjectStoreUrl> for ObjectStoreUrl {
    fn as_ref(&self) -> &ObjectStoreUrl {
        self
    }
}

impl std::ops::Deref for ObjectStoreUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.url
    }
}

impl std::fmt::Display for ObjectStoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

impl std::fmt::Debug for ObjectStoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Supported object store providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStoreProvider {
    /// Local filesystem (`file://`)
    Local,

    /// Amazon S3 (`s3://`, `s3a://`)
    AmazonS3,

    /// Google Cloud Storage (`gs://`)
    GoogleCloudStorage,

    /// Microsoft Azure (`az://`, `azure://`, `abfs://`, `abfss://`)
    MicrosoftAzure,
}

impl ObjectStoreProvider {
    /// Backend serving URLs of `scheme`, case insensitive.
    pub fn from_scheme(scheme: &str) -> Result<Self, ObjectStoreUrlError> {
        let provider = match scheme.to_ascii_lowercase().as_str() {
            "file" => Self::Local,
            "s3" | "s3a" => Self::AmazonS3,
            "gs" => Self::GoogleCloudStorage,
            "az" | "azure" | "abfs" | "abfss" => Self::MicrosoftAzure,
            _ => {
                return Err(ObjectStoreUrlError::UnsupportedScheme {
                    scheme: scheme.to_string(),
                });
            }
        };
        Ok(provider)
    }
}

/// Error type for invalid object store URLs.
///
/// Valid object store schemes are: `file`, `s3`, `gs` and `azure`. Plain filesystem paths are
/// accepted as well.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreUrlError {
    /// URL scheme is not supported by object stores
    ///
    /// If you need to use an S3-compatible object store with a custom HTTP/HTTPS endpoint,
    /// configure the `AWS_ENDPOINT` environment variable and use the `s3://` scheme.
    #[error("unsupported object store scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    /// Filesystem path cannot be created or resolved to an absolute directory
    #[error("invalid filesystem path: {path}")]
    InvalidFilesystemPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cloud_schemes() {
        //* When
        let s3 = ObjectStoreUrl::new("s3://bucket/transfers").expect("valid s3 url");
        let gs = ObjectStoreUrl::new("gs://bucket").expect("valid gs url");

        //* Then
        assert_eq!(s3.provider(), ObjectStoreProvider::AmazonS3);
        assert_eq!(s3.path(), "/transfers");
        assert_eq!(gs.provider(), ObjectStoreProvider::GoogleCloudStorage);
    }

    #[test]
    fn http_urls_are_not_stores() {
        //* When
        let result = ObjectStoreUrl::new("https://example.com/output");

        //* Then
        assert!(matches!(
            result,
            Err(ObjectStoreUrlError::UnsupportedScheme { scheme }) if scheme == "https"
        ));
    }

    #[test]
    fn filesystem_path_is_created_and_canonicalized() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("nested/output");

        //* When
        let url = ObjectStoreUrl::new(location.to_string_lossy()).expect("valid path");

        //* Then
        assert_eq!(url.provider(), ObjectStoreProvider::Local);
        assert!(location.is_dir());
        assert!(url.as_str().starts_with("file://"));
        assert!(url.as_str().ends_with('/'));
    }
}
