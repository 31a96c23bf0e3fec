//! Extension trait for ObjectStore.

use std::future::Future;

use bytes::Bytes;
use object_store::{ObjectStore, path::Path};

/// Convenience reads on top of any `ObjectStore`.
pub trait ObjectStoreExt {
    /// Reads the entire contents of an object as `Bytes`.
    fn get_bytes(
        &self,
        location: impl Into<Path>,
    ) -> impl Future<Output = Result<Bytes, ObjectStoreExtError>>;

    /// Returns `true` when an object exists at `location`.
    fn exists(
        &self,
        location: impl Into<Path>,
    ) -> impl Future<Output = Result<bool, ObjectStoreExtError>>;
}

impl<T> ObjectStoreExt for T
where
    T: ObjectStore + ?Sized,
{
    async fn get_bytes(&self, location: impl Into<Path>) -> Result<Bytes, ObjectStoreExtError> {
        self.get(&location.into())
            .await
            .map_err(ObjectStoreExtError::ObjectStoreGet)?
            .bytes()
            .await
            .map_err(ObjectStoreExtError::ObjectStoreBytes)
    }

    async fn exists(&self, location: impl Into<Path>) -> Result<bool, ObjectStoreExtError> {
        match self.head(&location.into()).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(ObjectStoreExtError::ObjectStoreHead(err)),
        }
    }
}

/// Error type for object store read operations.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreExtError {
    /// Error initiating object retrieval.
    ///
    /// Common causes: network timeouts, permission denied, file not found,
    /// or authentication token expiry.
    #[error("failed to get object: {0}")]
    ObjectStoreGet(#[source] object_store::Error),

    /// Error streaming the object body after the request was accepted.
    #[error("failed to read object bytes: {0}")]
    ObjectStoreBytes(#[source] object_store::Error),

    /// Error fetching object metadata.
    #[error("failed to head object: {0}")]
    ObjectStoreHead(#[source] object_store::Error),
}
