//! Analytics façade — bucket usage rankings from ClickHouse.
//!
//! Speaks the ClickHouse HTTP interface directly: each ranking is a single
//! aggregate query POSTed as SQL with `FORMAT JSONEachRow`, rows streamed
//! back one JSON object per line. The façade exists only when analytics
//! configuration is present; without it the ranking tools are never
//! registered.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::config::AnalyticsConfig;
use crate::error::{ButlerError, Result};

/// Default number of ranked buckets returned when the caller gives no limit.
pub const DEFAULT_LIMIT: u32 = 10;

/// Aggregation table written by the storage service's log pipeline.
const SOURCE_TABLE: &str = "cloudserver_aggregated_federated";

/// One row of the operations ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOperations {
    pub bucket: String,
    pub count: u64,
}

/// One row of a traffic ranking (inbound or outbound).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTraffic {
    pub bucket: String,
    pub bytes: u64,
    /// Human-readable size from ClickHouse's `formatReadableSize`.
    pub readable: String,
}

/// Time window for a ranking query.
///
/// `hours_back` is relative to now and takes precedence over the explicit
/// bounds. With no bounds at all the window defaults to the last 10 days.
/// An explicit start without an end runs up to now.
#[derive(Debug, Clone, Default)]
pub struct TimeRange {
    pub hours_back: Option<u32>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
}

impl TimeRange {
    /// SQL conditions bounding the window. Timestamps are normalized to UTC
    /// before interpolation; callers validate them as RFC 3339 first.
    fn conditions(&self) -> Vec<String> {
        if let Some(hours) = self.hours_back {
            return vec![
                format!("timestamp >= now() - INTERVAL {} HOUR", hours),
                "timestamp <= now()".to_string(),
            ];
        }
        if self.start.is_some() || self.end.is_some() {
            let mut conditions = Vec::new();
            if let Some(start) = &self.start {
                conditions.push(format!("timestamp >= '{}'", sql_timestamp(start)));
            }
            match &self.end {
                Some(end) => conditions.push(format!("timestamp <= '{}'", sql_timestamp(end))),
                None => conditions.push("timestamp <= now()".to_string()),
            }
            return conditions;
        }
        vec![
            "timestamp >= now() - INTERVAL 10 DAY".to_string(),
            "timestamp <= now()".to_string(),
        ]
    }
}

fn sql_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Client façade over the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct AnalyticsClient {
    http: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl AnalyticsClient {
    /// Build the HTTP client from analytics configuration.
    pub fn new(config: &AnalyticsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify)
            .build()
            .map_err(|e| ButlerError::Upstream {
                backend: "clickhouse".to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            url: config.base_url(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Top buckets by total operation count.
    pub async fn top_buckets_by_operations(
        &self,
        limit: u32,
        range: &TimeRange,
    ) -> Result<Vec<BucketOperations>> {
        let sql = operations_query(&self.database, range, limit);
        tracing::debug!(limit, "querying top buckets by operations");
        self.query_rows(sql).await
    }

    /// Top buckets by uploaded bytes (`PutObject` + `UploadPart`).
    pub async fn top_buckets_by_inbound_traffic(
        &self,
        limit: u32,
        range: &TimeRange,
    ) -> Result<Vec<BucketTraffic>> {
        let sql = traffic_query(&self.database, range, limit, "action IN ('PutObject', 'UploadPart')");
        tracing::debug!(limit, "querying top buckets by inbound traffic");
        self.query_rows(sql).await
    }

    /// Top buckets by downloaded bytes (`GetObject`).
    pub async fn top_buckets_by_outbound_traffic(
        &self,
        limit: u32,
        range: &TimeRange,
    ) -> Result<Vec<BucketTraffic>> {
        let sql = traffic_query(&self.database, range, limit, "action = 'GetObject'");
        tracing::debug!(limit, "querying top buckets by outbound traffic");
        self.query_rows(sql).await
    }

    /// POST one SQL statement and deserialize the JSONEachRow response.
    async fn query_rows<T: DeserializeOwned>(&self, sql: String) -> Result<Vec<T>> {
        let mut request = self
            .http
            .post(&self.url)
            .query(&[
                ("database", self.database.as_str()),
                // 64-bit aggregates must come back as JSON numbers, not strings
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .body(format!("{} FORMAT JSONEachRow", sql));
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await.map_err(|e| ButlerError::Upstream {
            backend: "clickhouse".to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ButlerError::Auth(format!("clickhouse: {}", body.trim())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ButlerError::Upstream {
                backend: "clickhouse".to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }

        let body = response.text().await.map_err(|e| ButlerError::Upstream {
            backend: "clickhouse".to_string(),
            message: e.to_string(),
        })?;
        parse_rows(&body)
    }
}

/// Parse a JSONEachRow response body: one JSON object per non-empty line.
/// An empty body is an empty result set, not an error.
fn parse_rows<T: DeserializeOwned>(body: &str) -> Result<Vec<T>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ButlerError::Upstream {
                backend: "clickhouse".to_string(),
                message: format!("malformed result row: {}", e),
            })
        })
        .collect()
}

/// Ranking by operation count. Ties break on ascending bucket name so the
/// ordering is deterministic.
fn operations_query(database: &str, range: &TimeRange, limit: u32) -> String {
    let mut conditions = range.conditions();
    conditions.push("bucketName <> ''".to_string());
    format!(
        "SELECT bucketName AS bucket, sum(number_of_op) AS count \
         FROM {}.{} WHERE {} \
         GROUP BY bucket ORDER BY count DESC, bucket ASC LIMIT {}",
        database,
        SOURCE_TABLE,
        conditions.join(" AND "),
        limit
    )
}

/// Ranking by byte volume for the given action filter.
fn traffic_query(database: &str, range: &TimeRange, limit: u32, action_condition: &str) -> String {
    let mut conditions = range.conditions();
    conditions.push(action_condition.to_string());
    format!(
        "SELECT bucketName AS bucket, sum(contentLength) AS bytes, \
         formatReadableSize(sum(contentLength)) AS readable \
         FROM {}.{} WHERE {} \
         GROUP BY bucket ORDER BY bytes DESC, bucket ASC LIMIT {}",
        database,
        SOURCE_TABLE,
        conditions.join(" AND "),
        limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_query_ordering_and_limit() {
        let sql = operations_query("logs", &TimeRange::default(), 10);
        assert!(sql.contains("ORDER BY count DESC, bucket ASC"));
        assert!(sql.ends_with("LIMIT 10"));
        assert!(sql.contains("FROM logs.cloudserver_aggregated_federated"));
        assert!(sql.contains("bucketName <> ''"));
    }

    #[test]
    fn test_default_window_is_ten_days() {
        let sql = operations_query("logs", &TimeRange::default(), 5);
        assert!(sql.contains("timestamp >= now() - INTERVAL 10 DAY"));
        assert!(sql.contains("timestamp <= now()"));
    }

    #[test]
    fn test_hours_back_window() {
        let range = TimeRange {
            hours_back: Some(24),
            ..Default::default()
        };
        let sql = operations_query("logs", &range, 10);
        assert!(sql.contains("timestamp >= now() - INTERVAL 24 HOUR"));
        assert!(!sql.contains("INTERVAL 10 DAY"));
    }

    #[test]
    fn test_explicit_start_defaults_end_to_now() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap();
        let range = TimeRange {
            start: Some(start),
            ..Default::default()
        };
        let sql = operations_query("logs", &range, 10);
        assert!(sql.contains("timestamp >= '2024-01-01 00:00:00'"));
        assert!(sql.contains("timestamp <= now()"));
    }

    #[test]
    fn test_explicit_window_normalized_to_utc() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T02:00:00+02:00").unwrap();
        let end = DateTime::parse_from_rfc3339("2024-01-31T23:59:59Z").unwrap();
        let range = TimeRange {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        };
        let sql = operations_query("logs", &range, 10);
        assert!(sql.contains("timestamp >= '2024-01-01 00:00:00'"));
        assert!(sql.contains("timestamp <= '2024-01-31 23:59:59'"));
    }

    #[test]
    fn test_inbound_query_filters_uploads() {
        let sql = traffic_query(
            "logs",
            &TimeRange::default(),
            10,
            "action IN ('PutObject', 'UploadPart')",
        );
        assert!(sql.contains("action IN ('PutObject', 'UploadPart')"));
        assert!(sql.contains("ORDER BY bytes DESC, bucket ASC"));
        assert!(sql.contains("formatReadableSize"));
    }

    #[test]
    fn test_parse_rows_operations() {
        let body = "{\"bucket\":\"finance\",\"count\":120}\n{\"bucket\":\"logs\",\"count\":80}\n";
        let rows: Vec<BucketOperations> = parse_rows(body).unwrap();
        assert_eq!(
            rows,
            vec![
                BucketOperations {
                    bucket: "finance".to_string(),
                    count: 120
                },
                BucketOperations {
                    bucket: "logs".to_string(),
                    count: 80
                },
            ]
        );
    }

    #[test]
    fn test_parse_rows_empty_body_is_empty_result() {
        let rows: Vec<BucketOperations> = parse_rows("").unwrap();
        assert!(rows.is_empty());
        let rows: Vec<BucketOperations> = parse_rows("\n\n").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_rows_malformed_is_upstream_error() {
        let result: Result<Vec<BucketOperations>> = parse_rows("{\"bucket\":");
        assert!(
            matches!(result, Err(ButlerError::Upstream { backend, .. }) if backend == "clickhouse")
        );
    }

    #[test]
    fn test_parse_rows_traffic_with_readable_size() {
        let body = "{\"bucket\":\"media\",\"bytes\":1610612736,\"readable\":\"1.50 GiB\"}\n";
        let rows: Vec<BucketTraffic> = parse_rows(body).unwrap();
        assert_eq!(rows[0].bytes, 1_610_612_736);
        assert_eq!(rows[0].readable, "1.50 GiB");
    }

    #[test]
    fn test_client_construction_is_offline() {
        let config = AnalyticsConfig {
            host: "ch.internal".to_string(),
            port: 8123,
            user: Some("default".to_string()),
            password: None,
            database: "logs".to_string(),
            secure: false,
            verify: true,
            connect_timeout_secs: 30,
            request_timeout_secs: 300,
        };
        let client = AnalyticsClient::new(&config).unwrap();
        assert_eq!(client.url, "http://ch.internal:8123");
    }
}
