//! Storage: key layout, record codec, worker pool, backends and the kifu
//! store orchestrators.

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::KvBackend;

pub mod codec;
pub mod item;
pub mod keys;
pub mod kifu_store;
pub mod mock;
pub mod pipeline;

#[cfg(feature = "dynamo")]
pub mod dynamo;

pub use item::{AttrValue, Item, Key};
pub use kifu_store::KifuStore;
pub use mock::MemoryBackend;
pub use pipeline::{Feeder, WorkerPool};

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoBackend;

/// Initialize the backend selected by configuration.
pub async fn init_storage(
    config: &StorageConfig,
) -> Result<Arc<dyn KvBackend>, Box<dyn std::error::Error>> {
    match config.storage_type {
        #[cfg(feature = "dynamo")]
        StorageType::Dynamo => {
            let dynamo = &config.dynamo;
            let backend = DynamoBackend::new(
                dynamo.table_name.clone(),
                dynamo.endpoint_url.as_deref(),
                dynamo.region.as_deref(),
            )
            .await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "dynamo"))]
        StorageType::Dynamo => {
            tracing::error!("DynamoDB storage requested but 'dynamo' feature is not enabled");
            Err("DynamoDB feature not enabled".into())
        }
        StorageType::Memory => {
            info!("Storage: in-memory backend");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
