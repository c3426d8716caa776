use super::{classify_db_error, OpFailure, PostgresClient, RetryPolicy};
use crate::domain::{
    FieldFilter, MessageId, MessagePage, MessageQuery, MessageRepository, ProcessingOutcome,
    StorageError, StoredMessage, TelemetryPacket,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const SELECT_COLUMNS: &str = "id, device_id, device_timestamp, measurements, status, battery_level, \
     received_at, processed, processed_at, processing_outcome";

type SqlParam = Box<dyn ToSql + Sync + Send>;

fn corrupt_row(e: impl std::fmt::Display) -> OpFailure {
    OpFailure::Permanent(StorageError::Rejected(format!("corrupt message row: {}", e)))
}

fn row_to_message(row: &Row) -> Result<StoredMessage, OpFailure> {
    let measurements_json: serde_json::Value =
        row.try_get("measurements").map_err(corrupt_row)?;
    let measurements: BTreeMap<String, f64> =
        serde_json::from_value(measurements_json).map_err(corrupt_row)?;
    let outcome: String = row.try_get("processing_outcome").map_err(corrupt_row)?;

    let packet = TelemetryPacket::from_validated_parts(
        row.try_get("device_id").map_err(corrupt_row)?,
        row.try_get("device_timestamp").map_err(corrupt_row)?,
        measurements,
        row.try_get("status").map_err(corrupt_row)?,
        row.try_get("battery_level").map_err(corrupt_row)?,
    );

    Ok(StoredMessage {
        id: MessageId::new(row.try_get("id").map_err(corrupt_row)?),
        packet,
        received_at: row.try_get("received_at").map_err(corrupt_row)?,
        processed: row.try_get("processed").map_err(corrupt_row)?,
        processed_at: row.try_get("processed_at").map_err(corrupt_row)?,
        processing_outcome: outcome.parse().map_err(corrupt_row)?,
    })
}

/// WHERE clause and parameters shared by the page and count queries
fn query_predicate(
    query: &MessageQuery,
    filter: Option<FieldFilter>,
) -> (String, Vec<SqlParam>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(start) = query.start_time {
        params.push(Box::new(start));
        clauses.push(format!("received_at >= ${}", params.len()));
    }
    if let Some(end) = query.end_time {
        params.push(Box::new(end));
        clauses.push(format!("received_at <= ${}", params.len()));
    }
    match filter {
        Some(FieldFilter::DeviceId(device_id)) => {
            params.push(Box::new(device_id));
            clauses.push(format!("device_id = ${}", params.len()));
        }
        Some(FieldFilter::Status(status)) => {
            params.push(Box::new(status));
            clauses.push(format!("status = ${}", params.len()));
        }
        Some(FieldFilter::BatteryLevel(level)) => {
            params.push(Box::new(level));
            clauses.push(format!("battery_level = ${}", params.len()));
        }
        Some(FieldFilter::Measurement { name, value }) => {
            params.push(Box::new(name));
            let name_idx = params.len();
            params.push(Box::new(value));
            clauses.push(format!(
                "(measurements ->> ${}::text)::double precision = ${}",
                name_idx,
                params.len()
            ));
        }
        None => {}
    }

    let predicate = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (predicate, params)
}

/// PostgreSQL implementation of [`MessageRepository`]
#[derive(Clone)]
pub struct PostgresMessageRepository {
    client: PostgresClient,
    retry: RetryPolicy,
    close_timeout: Duration,
}

impl PostgresMessageRepository {
    pub fn new(client: PostgresClient, retry: RetryPolicy, close_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            close_timeout,
        }
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    #[instrument(skip_all, fields(device_id = %packet.device_id()))]
    async fn ingest(&self, packet: &TelemetryPacket) -> Result<MessageId, StorageError> {
        let measurements = serde_json::to_value(packet.measurements())
            .map_err(|e| StorageError::Rejected(format!("unencodable measurements: {}", e)))?;
        let client = &self.client;
        let measurements = &measurements;

        let id = self
            .retry
            .run("ingest", move || async move {
                let conn = client.lease().await?;
                let row = conn
                    .query_one(
                        "INSERT INTO telemetry_messages (device_id, device_timestamp, measurements, status, battery_level)
                         VALUES ($1, $2, $3, $4, $5)
                         RETURNING id",
                        &[
                            &packet.device_id(),
                            &packet.timestamp(),
                            measurements,
                            &packet.status(),
                            &packet.battery_level(),
                        ],
                    )
                    .await
                    .map_err(classify_db_error)?;
                let id: i64 = row.try_get(0).map_err(corrupt_row)?;
                Ok(MessageId::new(id))
            })
            .await?;

        debug!(message_id = %id, "stored telemetry message");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let client = &self.client;
        let limit = limit as i64;
        let sql = format!(
            "SELECT {} FROM telemetry_messages
             WHERE processed = FALSE
             ORDER BY received_at ASC, id ASC
             LIMIT $1",
            SELECT_COLUMNS
        );
        let sql = sql.as_str();

        self.retry
            .run("fetch_unprocessed", move || async move {
                let conn = client.lease().await?;
                let rows = conn
                    .query(sql, &[&limit])
                    .await
                    .map_err(classify_db_error)?;
                rows.iter().map(row_to_message).collect()
            })
            .await
    }

    #[instrument(skip_all, fields(message_id = %id, outcome = %outcome))]
    async fn mark_processed(
        &self,
        id: MessageId,
        outcome: ProcessingOutcome,
    ) -> Result<(), StorageError> {
        if outcome == ProcessingOutcome::Pending {
            return Err(StorageError::Rejected(
                "pending is not a terminal outcome".to_string(),
            ));
        }

        let client = &self.client;
        let raw_id = id.value();
        let outcome_str = outcome.as_str();

        let updated = self
            .retry
            .run("mark_processed", move || async move {
                let conn = client.lease().await?;
                let updated = conn
                    .execute(
                        "UPDATE telemetry_messages
                         SET processed = TRUE, processed_at = clock_timestamp(), processing_outcome = $2
                         WHERE id = $1 AND processed = FALSE",
                        &[&raw_id, &outcome_str],
                    )
                    .await
                    .map_err(classify_db_error)?;
                if updated > 0 {
                    return Ok(true);
                }

                let exists = conn
                    .query_opt("SELECT 1 FROM telemetry_messages WHERE id = $1", &[&raw_id])
                    .await
                    .map_err(classify_db_error)?;
                match exists {
                    Some(_) => Ok(false),
                    None => Err(OpFailure::Permanent(StorageError::Rejected(format!(
                        "unknown message id {}",
                        raw_id
                    )))),
                }
            })
            .await?;

        if !updated {
            debug!("message already processed, leaving outcome unchanged");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(limit = query.limit))]
    async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage, StorageError> {
        let filter = query
            .field_filter()
            .map_err(|e| StorageError::Rejected(e.to_string()))?;
        let (predicate, mut params) = query_predicate(query, filter);

        let count_sql = format!("SELECT COUNT(*) FROM telemetry_messages {}", predicate);
        let count_param_len = params.len();
        params.push(Box::new(query.limit as i64));
        let page_sql = format!(
            "SELECT {} FROM telemetry_messages {} ORDER BY received_at DESC, id DESC LIMIT ${}",
            SELECT_COLUMNS,
            predicate,
            params.len()
        );

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let client = &self.client;
        let refs = refs.as_slice();
        let (count_sql, page_sql) = (count_sql.as_str(), page_sql.as_str());

        self.retry
            .run("query_messages", move || async move {
                let conn = client.lease().await?;
                let total: i64 = conn
                    .query_one(count_sql, &refs[..count_param_len])
                    .await
                    .map_err(classify_db_error)?
                    .try_get(0)
                    .map_err(corrupt_row)?;
                let rows = conn
                    .query(page_sql, refs)
                    .await
                    .map_err(classify_db_error)?;
                let items = rows
                    .iter()
                    .map(row_to_message)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MessagePage {
                    items,
                    total_count: total.max(0) as u64,
                })
            })
            .await
    }

    #[instrument(skip(self))]
    async fn pending_count(&self) -> Result<u64, StorageError> {
        let client = &self.client;
        self.retry
            .run("pending_count", move || async move {
                let conn = client.lease().await?;
                let count: i64 = conn
                    .query_one(
                        "SELECT COUNT(*) FROM telemetry_messages WHERE processed = FALSE",
                        &[],
                    )
                    .await
                    .map_err(classify_db_error)?
                    .try_get(0)
                    .map_err(corrupt_row)?;
                Ok(count.max(0) as u64)
            })
            .await
    }

    async fn close(&self) {
        self.client.close(self.close_timeout).await;
    }
}
