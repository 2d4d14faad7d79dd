//! DynamoDB backend.
//!
//! Table schema:
//! - PK: `pk` (String), SK: `sk` (String)
//! - GSI `OwnerIndex`: `owner_id` / `created_key`, projection ALL
//! - GSI `PositionIndex`: `position_key` / `position_sk`, projection INCLUDE
//!   `owner_id`, `kifu_id`, `seq`

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::delete_item::DeleteItemError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, PutRequest, ReturnValue, ReturnValuesOnConditionCheckFailure,
    WriteRequest as DynamoWriteRequest,
};
use aws_sdk_dynamodb::Client;
use backon::BackoffBuilder;
use tracing::{debug, info, warn};

use crate::interfaces::{
    Condition, Conditional, KvBackend, QueryPage, QueryRequest, RangeCondition, Result,
    StorageError, WriteRequest, MAX_BATCH_WRITE,
};
use crate::storage::item::{AttrValue, Item, Key, PK_ATTR};
use crate::utils::retry::unprocessed_backoff;

type DynamoItem = HashMap<String, AttributeValue>;

/// DynamoDB implementation of KvBackend.
pub struct DynamoBackend {
    client: Client,
    table_name: String,
}

impl DynamoBackend {
    /// Connect using the default AWS credential and region chain.
    pub async fn new(
        table_name: impl Into<String>,
        endpoint_url: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        let client = if let Some(endpoint) = endpoint_url {
            let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(dynamo_config)
        } else {
            Client::new(&config)
        };

        let table_name = table_name.into();
        info!(table = %table_name, endpoint = ?endpoint_url, "Connected to DynamoDB");

        Ok(Self { client, table_name })
    }

    async fn send_batch(&self, requests: Vec<DynamoWriteRequest>) -> Result<Vec<DynamoWriteRequest>> {
        let output = self
            .client
            .batch_write_item()
            .request_items(&self.table_name, requests)
            .send()
            .await
            .map_err(|e| backend("batch_write_item", e))?;

        Ok(output
            .unprocessed_items
            .and_then(|mut unprocessed| unprocessed.remove(&self.table_name))
            .unwrap_or_default())
    }
}

#[async_trait]
impl KvBackend for DynamoBackend {
    async fn get(&self, key: &Key) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(to_dynamo_item(&key.to_item())))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| backend("get_item", e))?;

        output.item.map(from_dynamo_item).transpose()
    }

    async fn put_if(&self, item: Item, condition: Condition) -> Result<Conditional> {
        let expr = ConditionExpr::from(&condition);
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_dynamo_item(&item)))
            .condition_expression(expr.expression)
            .set_expression_attribute_names(Some(expr.names))
            .set_expression_attribute_values(expr.values)
            .return_values(ReturnValue::AllOld)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Conditional::Applied {
                previous: output.attributes.map(from_dynamo_item).transpose()?,
            }),
            Err(SdkError::ServiceError(err)) => match err.into_err() {
                PutItemError::ConditionalCheckFailedException(ex) => {
                    debug!(table = %self.table_name, "put_item condition failed");
                    Ok(Conditional::Rejected {
                        current: ex.item.map(from_dynamo_item).transpose()?,
                    })
                }
                other => Err(backend("put_item", other)),
            },
            Err(e) => Err(backend("put_item", e)),
        }
    }

    async fn delete_if(&self, key: &Key, condition: Condition) -> Result<Conditional> {
        let expr = ConditionExpr::from(&condition);
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(to_dynamo_item(&key.to_item())))
            .condition_expression(expr.expression)
            .set_expression_attribute_names(Some(expr.names))
            .set_expression_attribute_values(expr.values)
            .return_values(ReturnValue::AllOld)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Conditional::Applied {
                previous: output.attributes.map(from_dynamo_item).transpose()?,
            }),
            Err(SdkError::ServiceError(err)) => match err.into_err() {
                DeleteItemError::ConditionalCheckFailedException(ex) => {
                    debug!(table = %self.table_name, "delete_item condition failed");
                    Ok(Conditional::Rejected {
                        current: ex.item.map(from_dynamo_item).transpose()?,
                    })
                }
                other => Err(backend("delete_item", other)),
            },
            Err(e) => Err(backend("delete_item", e)),
        }
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        if requests.len() > MAX_BATCH_WRITE {
            return Err(StorageError::InvalidArgument(format!(
                "batch of {} exceeds {MAX_BATCH_WRITE} requests",
                requests.len()
            )));
        }
        if requests.is_empty() {
            return Ok(());
        }

        let mut pending = requests
            .iter()
            .map(to_dynamo_write)
            .collect::<Result<Vec<_>>>()?;
        let mut delays = unprocessed_backoff().build();

        loop {
            let unprocessed = self.send_batch(pending).await?;
            if unprocessed.is_empty() {
                return Ok(());
            }
            match delays.next() {
                Some(delay) => {
                    warn!(
                        table = %self.table_name,
                        unprocessed = unprocessed.len(),
                        delay_ms = delay.as_millis() as u64,
                        "Resubmitting unprocessed batch items"
                    );
                    tokio::time::sleep(delay).await;
                    pending = unprocessed;
                }
                None => {
                    return Err(StorageError::Backend(format!(
                        "{} batch items still unprocessed after retries",
                        unprocessed.len()
                    )));
                }
            }
        }
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        let expr = KeyConditionExpr::from(request);
        let limit = request
            .limit
            .map(|l| i32::try_from(l).unwrap_or(i32::MAX));

        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .set_index_name(request.index.clone())
            .key_condition_expression(expr.expression)
            .set_expression_attribute_names(Some(expr.names))
            .set_expression_attribute_values(Some(expr.values))
            .scan_index_forward(request.ascending)
            .set_limit(limit)
            .set_exclusive_start_key(request.start_key.as_ref().map(to_dynamo_item))
            .send()
            .await
            .map_err(|e| backend("query", e))?;

        let items = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_dynamo_item)
            .collect::<Result<Vec<_>>>()?;
        let last_key = output.last_evaluated_key.map(from_dynamo_item).transpose()?;

        debug!(
            table = %self.table_name,
            index = ?request.index,
            items = items.len(),
            more = last_key.is_some(),
            "Query page"
        );
        Ok(QueryPage { items, last_key })
    }
}

fn backend(operation: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(format!("DynamoDB {operation} failed: {err}"))
}

/// A condition rendered as a DynamoDB expression with placeholders.
struct ConditionExpr {
    expression: String,
    names: HashMap<String, String>,
    values: Option<HashMap<String, AttributeValue>>,
}

impl From<&Condition> for ConditionExpr {
    fn from(condition: &Condition) -> Self {
        // DynamoDB rejects placeholders the expression does not reference.
        match condition {
            Condition::NotExists => Self {
                expression: "attribute_not_exists(#pk)".to_string(),
                names: HashMap::from([("#pk".to_string(), PK_ATTR.to_string())]),
                values: None,
            },
            Condition::Equals { attr, value } => Self {
                expression: "#a = :v".to_string(),
                names: HashMap::from([("#a".to_string(), attr.clone())]),
                values: Some(HashMap::from([(":v".to_string(), to_dynamo(value))])),
            },
            Condition::NotExistsOrEquals { attr, value } => Self {
                expression: "attribute_not_exists(#pk) OR #a = :v".to_string(),
                names: HashMap::from([
                    ("#pk".to_string(), PK_ATTR.to_string()),
                    ("#a".to_string(), attr.clone()),
                ]),
                values: Some(HashMap::from([(":v".to_string(), to_dynamo(value))])),
            },
        }
    }
}

/// Key condition of a query rendered with placeholders.
struct KeyConditionExpr {
    expression: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl From<&QueryRequest> for KeyConditionExpr {
    fn from(request: &QueryRequest) -> Self {
        let mut names = HashMap::from([("#h".to_string(), request.partition_attr.clone())]);
        let mut values = HashMap::from([(
            ":h".to_string(),
            AttributeValue::S(request.partition_value.clone()),
        )]);

        let expression = match &request.range {
            None => "#h = :h".to_string(),
            Some(RangeCondition::Between { attr, lo, hi }) => {
                names.insert("#r".to_string(), attr.clone());
                values.insert(":lo".to_string(), AttributeValue::S(lo.clone()));
                values.insert(":hi".to_string(), AttributeValue::S(hi.clone()));
                "#h = :h AND #r BETWEEN :lo AND :hi".to_string()
            }
        };

        Self {
            expression,
            names,
            values,
        }
    }
}

fn to_dynamo_write(request: &WriteRequest) -> Result<DynamoWriteRequest> {
    let built = match request {
        WriteRequest::Put(item) => DynamoWriteRequest::builder().put_request(
            PutRequest::builder()
                .set_item(Some(to_dynamo_item(item)))
                .build()
                .map_err(|e| StorageError::InvalidArgument(format!("put request: {e}")))?,
        ),
        WriteRequest::Delete(key) => DynamoWriteRequest::builder().delete_request(
            DeleteRequest::builder()
                .set_key(Some(to_dynamo_item(&key.to_item())))
                .build()
                .map_err(|e| StorageError::InvalidArgument(format!("delete request: {e}")))?,
        ),
    };
    Ok(built.build())
}

fn to_dynamo(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s.clone()),
        AttrValue::N(n) => AttributeValue::N(n.clone()),
        AttrValue::Bool(b) => AttributeValue::Bool(*b),
        AttrValue::L(list) => AttributeValue::L(list.iter().map(to_dynamo).collect()),
        AttrValue::Null => AttributeValue::Null(true),
    }
}

fn to_dynamo_item(item: &Item) -> DynamoItem {
    item.iter()
        .map(|(name, value)| (name.clone(), to_dynamo(value)))
        .collect()
}

fn from_dynamo(value: AttributeValue) -> Result<AttrValue> {
    match value {
        AttributeValue::S(s) => Ok(AttrValue::S(s)),
        AttributeValue::N(n) => Ok(AttrValue::N(n)),
        AttributeValue::Bool(b) => Ok(AttrValue::Bool(b)),
        AttributeValue::L(list) => list
            .into_iter()
            .map(from_dynamo)
            .collect::<Result<Vec<_>>>()
            .map(AttrValue::L),
        AttributeValue::Null(_) => Ok(AttrValue::Null),
        other => Err(StorageError::InvalidStoredValue(format!(
            "unsupported attribute type: {other:?}"
        ))),
    }
}

fn from_dynamo_item(item: DynamoItem) -> Result<Item> {
    item.into_iter()
        .map(|(name, value)| from_dynamo(value).map(|v| (name, v)))
        .collect()
}
