//! Request dispatch for authenticated kifu operations.
//!
//! Callers hand over an owner id (from their auth layer) and a tagged
//! [`KifuRequest`]; storage failures are mapped to [`ServiceError`] with an
//! HTTP-style status code. Backend details never leave this layer; they are
//! logged instead.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::interfaces::StorageError;
use crate::kifu::{Kifu, KifuSignature, SamePosition, Step, Version};
use crate::storage::KifuStore;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors returned to callers of the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid authentication data")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Duplicated kifu: {}", join_signatures(.0))]
    DuplicatedKifu(Vec<KifuSignature>),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error")]
    Internal,
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Unauthenticated => 401,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) | ServiceError::DuplicatedKifu(_) => 409,
            ServiceError::InvalidArgument(_) => 400,
            ServiceError::Internal => 500,
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ServiceError::NotFound(what),
            StorageError::OptimisticLock { kifu_id } => {
                ServiceError::Conflict(format!("kifu {kifu_id} was modified concurrently"))
            }
            StorageError::InvalidArgument(msg) => ServiceError::InvalidArgument(msg),
            other => {
                error!(error = %other, retryable = other.is_retryable(), "Storage failure");
                ServiceError::Internal
            }
        }
    }
}

/// A request on behalf of one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KifuRequest {
    RecentKifu {
        limit: usize,
    },
    /// Store a parsed kifu. Without `expected_version` a new kifu is created.
    /// With `reject_duplicate`, a kifu of any owner ending in the same
    /// position fails the request.
    PostKifu {
        kifu: Kifu,
        #[serde(default)]
        steps: Vec<Step>,
        #[serde(default)]
        expected_version: Option<Version>,
        #[serde(default)]
        reject_duplicate: bool,
    },
    GetKifu {
        kifu_id: String,
    },
    /// Without `version` the currently stored version is deleted.
    DeleteKifu {
        kifu_id: String,
        #[serde(default)]
        version: Option<Version>,
    },
    GetSamePositions {
        position: String,
        #[serde(default)]
        num_step: Option<u32>,
        #[serde(default)]
        exclude_kifu_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KifuResponse {
    RecentKifu {
        kifus: Vec<Kifu>,
    },
    PostKifu {
        kifu_id: String,
        version: Version,
    },
    GetKifu {
        kifu: Kifu,
        steps: Vec<Step>,
        version: Version,
    },
    DeleteKifu {
        kifu_id: String,
    },
    GetSamePositions {
        positions: Vec<SamePosition>,
    },
}

/// Owner-scoped front of a [`KifuStore`].
pub struct KifuService {
    store: KifuStore,
}

impl KifuService {
    pub fn new(store: KifuStore) -> Self {
        Self { store }
    }

    /// Dispatch `request` for `owner_id`. An empty owner is rejected.
    pub async fn handle(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        request: KifuRequest,
    ) -> Result<KifuResponse> {
        if owner_id.is_empty() {
            return Err(ServiceError::Unauthenticated);
        }

        match request {
            KifuRequest::RecentKifu { limit } => {
                let kifus = self.store.get_recent_kifu(ctx, owner_id, limit).await?;
                Ok(KifuResponse::RecentKifu { kifus })
            }
            KifuRequest::PostKifu {
                kifu,
                steps,
                expected_version,
                reject_duplicate,
            } => {
                self.post_kifu(ctx, owner_id, kifu, steps, expected_version, reject_duplicate)
                    .await
            }
            KifuRequest::GetKifu { kifu_id } => {
                let (kifu, steps, version) = self.store.get_kifu_and_steps(ctx, &kifu_id).await?;
                if kifu.owner_id != owner_id {
                    return Err(not_found(&kifu_id));
                }
                Ok(KifuResponse::GetKifu {
                    kifu,
                    steps,
                    version,
                })
            }
            KifuRequest::DeleteKifu { kifu_id, version } => {
                let (stored, stored_version) = self.store.get_kifu(ctx, &kifu_id).await?;
                if stored.owner_id != owner_id {
                    return Err(not_found(&kifu_id));
                }
                let version = version.unwrap_or(stored_version);
                self.store.delete_kifu(ctx, &kifu_id, &version).await?;
                Ok(KifuResponse::DeleteKifu { kifu_id })
            }
            KifuRequest::GetSamePositions {
                position,
                num_step,
                exclude_kifu_ids,
            } => {
                let positions = self
                    .store
                    .get_same_positions(
                        ctx,
                        &[owner_id.to_string()],
                        &position,
                        num_step,
                        &exclude_kifu_ids,
                    )
                    .await?;
                Ok(KifuResponse::GetSamePositions { positions })
            }
        }
    }

    async fn post_kifu(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        mut kifu: Kifu,
        mut steps: Vec<Step>,
        expected_version: Option<Version>,
        reject_duplicate: bool,
    ) -> Result<KifuResponse> {
        if kifu.kifu_id.is_empty() {
            if expected_version.is_some() {
                return Err(ServiceError::InvalidArgument(
                    "expected_version given without kifu_id".to_string(),
                ));
            }
            kifu.kifu_id = uuid::Uuid::new_v4().to_string();
        } else {
            // Another owner's id reads as absent, whether or not a version is given.
            match self.store.get_kifu(ctx, &kifu.kifu_id).await {
                Ok((stored, _)) if stored.owner_id != owner_id => {
                    return Err(not_found(&kifu.kifu_id));
                }
                Ok(_) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if reject_duplicate {
            let duplicates: Vec<KifuSignature> = self
                .store
                .duplicate_kifu(ctx, &kifu.position)
                .await?
                .into_iter()
                .filter(|sig| sig.kifu_id != kifu.kifu_id)
                .collect();
            if !duplicates.is_empty() {
                debug!(owner = %owner_id, duplicates = duplicates.len(), "Rejected duplicated kifu");
                return Err(ServiceError::DuplicatedKifu(duplicates));
            }
        }
        if kifu.created_ts == 0 {
            kifu.created_ts = Utc::now().timestamp();
        }
        kifu.owner_id = owner_id.to_string();
        for step in &mut steps {
            step.owner_id = owner_id.to_string();
            step.kifu_id = kifu.kifu_id.clone();
        }

        let version = self
            .store
            .put_kifu(ctx, &kifu, &steps, expected_version.as_ref())
            .await?;
        debug!(owner = %owner_id, kifu_id = %kifu.kifu_id, "Posted kifu");
        Ok(KifuResponse::PostKifu {
            kifu_id: kifu.kifu_id,
            version,
        })
    }
}

fn join_signatures(signatures: &[KifuSignature]) -> String {
    signatures
        .iter()
        .map(KifuSignature::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn not_found(kifu_id: &str) -> ServiceError {
    ServiceError::NotFound(format!("kifu {kifu_id}"))
}
