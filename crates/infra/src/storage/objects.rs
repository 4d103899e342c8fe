use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::StoreError;

const SCHEME: &str = "mem://objects/";

/// Object storage for uploaded images.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `bytes` and return a reference the inference service can read.
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError>;
}

/// Process-local object store handing out `mem://objects/<uuid>` references.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Validation("upload is empty".into()));
        }
        if !content_type.starts_with("image/") {
            return Err(StoreError::Validation(format!(
                "unsupported content type: {content_type}"
            )));
        }
        let url = format!("{SCHEME}{}", Uuid::now_v7());
        self.objects
            .write()
            .insert(url.clone(), (content_type.to_string(), bytes));
        Ok(url)
    }
}
