use anyhow::Result;
use async_trait::async_trait;

/// Decides whether an owner may upload into a collection.
#[async_trait]
pub trait CollectionAuthorizer: Send + Sync {
    async fn can_write(&self, owner_id: &str, collection_ref: &str) -> Result<bool>;
}

/// Grants every request. Used when authorization happens upstream.
#[derive(Debug, Default, Clone)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl CollectionAuthorizer for AllowAllAuthorizer {
    async fn can_write(&self, _owner_id: &str, _collection_ref: &str) -> Result<bool> {
        Ok(true)
    }
}
