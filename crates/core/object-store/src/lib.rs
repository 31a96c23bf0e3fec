//! Destination and working stores for produced files.
//!
//! The sink only needs the upload contract of an object store (`put`, `get`, `delete`), so every
//! backend is handed out as an `Arc<dyn ObjectStore>`. The backend is picked from the URL scheme
//! of the configured location; plain filesystem paths are accepted and turned into `file://` URLs.

use std::sync::Arc;

use object_store::{
    ObjectStore, aws::AmazonS3Builder, azure::MicrosoftAzureBuilder,
    gcp::GoogleCloudStorageBuilder, local::LocalFileSystem, path::Path, prefix::PrefixStore,
};

pub mod ext;
pub mod url;

use self::url::{ObjectStoreProvider, ObjectStoreUrl};

/// Creates an object store rooted at the location designated by `url`.
///
/// For cloud providers the URL path becomes a key prefix inside the bucket, so
/// `s3://bucket/transfers` and `./output/transfers` behave the same way: every relative
/// path handed to the returned store lands under `transfers/`.
///
/// # Providers configuration
///
/// Cloud providers are configured via environment variables:
/// - **AWS S3**: Uses `AWS_*` environment variables (e.g., `AWS_ACCESS_KEY_ID`, `AWS_ENDPOINT`)
/// - **Google Cloud**: Uses `GOOGLE_*` environment variables or service account credentials
/// - **Azure**: Uses `AZURE_*` environment variables (e.g., `AZURE_STORAGE_ACCOUNT_NAME`)
pub fn new(url: impl AsRef<ObjectStoreUrl>) -> Result<Arc<dyn ObjectStore>, ObjectStoreCreationError> {
    let url = url.as_ref();
    let creation_error = |source| ObjectStoreCreationError {
        url: url.to_string(),
        source,
    };

    let store: Arc<dyn ObjectStore> = match url.provider() {
        ObjectStoreProvider::Local => {
            let root = url
                .to_file_path()
                .map_err(|()| creation_error(object_store::Error::NotSupported {
                    source: format!("{url} is not a local directory").into(),
                }))?;
            let store = LocalFileSystem::new_with_prefix(root).map_err(creation_error)?;
            return Ok(Arc::new(store));
        }
        ObjectStoreProvider::AmazonS3 => Arc::new(
            AmazonS3Builder::from_env()
                .with_url(url.as_str())
                .build()
                .map_err(creation_error)?,
        ),
        ObjectStoreProvider::GoogleCloudStorage => Arc::new(
            GoogleCloudStorageBuilder::from_env()
                .with_url(url.as_str())
                .build()
                .map_err(creation_error)?,
        ),
        ObjectStoreProvider::MicrosoftAzure => Arc::new(
            MicrosoftAzureBuilder::from_env()
                .with_url(url.as_str())
                .build()
                .map_err(creation_error)?,
        ),
    };

    let prefix = url.path().trim_matches('/');
    if prefix.is_empty() {
        return Ok(store);
    }

    tracing::debug!(%url, %prefix, "scoping object store to url path");
    Ok(Arc::new(PrefixStore::new(store, Path::from(prefix))))
}

/// Failed to create object store instance.
///
/// The URL itself has been validated, but the backend could not be instantiated.
///
/// Common causes:
/// - **Missing credentials**: Required environment variables not set
/// - **Invalid credentials**: Environment variables set but contain invalid or expired credentials
/// - **Local directory**: The local directory cannot be used as a store root
#[derive(Debug, thiserror::Error)]
#[error("failed to create object store for {url}")]
pub struct ObjectStoreCreationError {
    url: String,
    #[source]
    source: object_store::Error,
}

#[cfg(test)]
mod test {
    use object_store::PutPayload;

    use super::*;
    use crate::ext::ObjectStoreExt as _;

    #[tokio::test]
    async fn local_store_is_rooted_at_directory() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let url = ObjectStoreUrl::new(dir.path().join("out").to_string_lossy())
            .expect("valid local url");
        let store = new(&url).expect("local store");

        //* When
        store
            .put(
                &Path::from("transfers/0000000000-0000000100.jsonl"),
                PutPayload::from_static(b"{}\n"),
            )
            .await
            .expect("put");

        //* Then
        let on_disk = dir
            .path()
            .join("out/transfers/0000000000-0000000100.jsonl");
        assert!(on_disk.exists());
        let content = store
            .get_bytes("transfers/0000000000-0000000100.jsonl")
            .await
            .expect("get");
        assert_eq!(content.as_ref(), b"{}\n");
    }
}
