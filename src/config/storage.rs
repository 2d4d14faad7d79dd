//! Storage configuration types.

use serde::Deserialize;

use crate::interfaces::{StorageError, MAX_BATCH_WRITE};

/// Backend type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Dynamo,
    Memory,
}

/// Backend configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// DynamoDB-specific configuration.
    pub dynamo: DynamoConfig,
}

/// DynamoDB-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamoConfig {
    /// Table holding roots and steps.
    pub table_name: String,
    /// Endpoint override, e.g. DynamoDB Local.
    pub endpoint_url: Option<String>,
    /// Region override. Falls back to the AWS default chain.
    pub region: Option<String>,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            table_name: "kansousen".to_string(),
            endpoint_url: None,
            region: None,
        }
    }
}

/// Tuning of the kifu store orchestrators.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Worker count of every fan-out.
    pub parallelism: usize,
    /// Requests per batch write. At most 25.
    pub batch_write_size: usize,
    /// Steps returned per same-position match when the caller gives none.
    pub default_num_step: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            batch_write_size: MAX_BATCH_WRITE,
            default_num_step: 5,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.parallelism == 0 {
            return Err(StorageError::InvalidArgument(
                "store.parallelism must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_WRITE).contains(&self.batch_write_size) {
            return Err(StorageError::InvalidArgument(format!(
                "store.batch_write_size must be within 1..={MAX_BATCH_WRITE}, got {}",
                self.batch_write_size
            )));
        }
        Ok(())
    }
}
