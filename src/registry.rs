//! ToolRegistry — the single public entry point for tool dispatch.
//!
//! An explicit registration table built once at startup: each entry pairs an
//! MCP tool descriptor with an async handler closed over the façade clients.
//! Registration of a duplicate name is a startup-time fatal error, dispatch
//! validates arguments against the declared input schema, and every handler
//! result is wrapped in the uniform `{"result": ...}` envelope. Façade
//! errors pass through with their kind intact.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use futures::FutureExt;
use futures::future::BoxFuture;
use rmcp::model::{JsonObject, Tool};
use serde_json::{Map, Value, json};

use crate::analytics::{AnalyticsClient, DEFAULT_LIMIT, TimeRange};
use crate::config::ButlerConfig;
use crate::error::{ButlerError, Result};
use crate::storage::StorageClient;

/// Parsed JSON arguments of a tool call.
pub type ToolArguments = Map<String, Value>;

/// Type-erased async tool handler.
pub type ToolHandler = Arc<dyn Fn(ToolArguments) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct RegisteredTool {
    descriptor: Tool,
    handler: ToolHandler,
}

/// Immutable-after-startup table of registered tools.
pub struct ToolRegistry {
    /// Registration order, preserved in the advertised tool list.
    tools: Vec<RegisteredTool>,
    /// Name → position in `tools`.
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Build the full registry from configuration and façade clients.
    ///
    /// The three storage tools are always registered; the three ranking
    /// tools only when the analytics façade exists. Fails on duplicate
    /// names, which aborts startup before the listener opens.
    pub fn build(
        config: &ButlerConfig,
        storage: StorageClient,
        analytics: Option<AnalyticsClient>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        registry.register_team_tool(config.team_name.clone())?;
        registry.register_storage_tools(storage)?;

        match analytics {
            Some(analytics) => {
                registry.register_analytics_tools(analytics)?;
                tracing::info!("analytics configured, ranking tools registered");
            }
            None => {
                tracing::info!("analytics not configured, skipping ranking tools");
            }
        }

        Ok(registry)
    }

    /// Add one tool to the table. Duplicate names are fatal.
    pub fn register(&mut self, descriptor: Tool, handler: ToolHandler) -> Result<()> {
        let name = descriptor.name.to_string();
        if self.index.contains_key(&name) {
            return Err(ButlerError::DuplicateTool(name));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool {
            descriptor,
            handler,
        });
        Ok(())
    }

    /// Advertised tool descriptors, in registration order.
    pub fn descriptors(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up the handler, validate arguments against the schema, invoke,
    /// and wrap the value in the `{"result": ...}` envelope.
    pub async fn dispatch(&self, name: &str, arguments: Option<ToolArguments>) -> Result<Value> {
        let entry = self
            .index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ButlerError::ToolNotFound(name.to_string()))?;

        let args = arguments.unwrap_or_default();
        validate_arguments(&entry.descriptor, &args)?;

        let value = (entry.handler)(args).await?;
        Ok(json!({ "result": value }))
    }

    fn register_team_tool(&mut self, team_name: String) -> Result<()> {
        self.register(
            descriptor(
                "get_team_name",
                "Get the name of the team or organization this server belongs to",
                json!({"type": "object", "properties": {}}),
            ),
            Arc::new(move |_args| {
                let team = team_name.clone();
                async move { Ok(Value::String(team)) }.boxed()
            }),
        )
    }

    fn register_storage_tools(&mut self, storage: StorageClient) -> Result<()> {
        let client = storage.clone();
        self.register(
            descriptor(
                "list_buckets",
                "List all S3 buckets accessible with the configured credentials",
                json!({"type": "object", "properties": {}}),
            ),
            Arc::new(move |_args| {
                let client = client.clone();
                async move {
                    let buckets = client.list_buckets().await?;
                    Ok(Value::Array(buckets.into_iter().map(Value::String).collect()))
                }
                .boxed()
            }),
        )?;

        self.register(
            descriptor(
                "get_iam_policies_for_bucket",
                "Retrieve all IAM policies that grant access to a specific S3 bucket",
                json!({
                    "type": "object",
                    "properties": {
                        "bucket": {
                            "type": "string",
                            "description": "Name of the bucket to audit"
                        }
                    },
                    "required": ["bucket"]
                }),
            ),
            Arc::new(move |args| {
                let client = storage.clone();
                async move {
                    let bucket = require_string("get_iam_policies_for_bucket", &args, "bucket")?;
                    client.get_policies_for_bucket(&bucket).await
                }
                .boxed()
            }),
        )
    }

    fn register_analytics_tools(&mut self, analytics: AnalyticsClient) -> Result<()> {
        let client = analytics.clone();
        self.register(
            descriptor(
                "get_top_buckets_by_operations",
                "Get the top N buckets ranked by total number of operations",
                ranking_schema(),
            ),
            Arc::new(move |args| {
                let client = client.clone();
                async move {
                    let limit = parse_limit("get_top_buckets_by_operations", &args)?;
                    let range = parse_time_range("get_top_buckets_by_operations", &args)?;
                    let rows = client.top_buckets_by_operations(limit, &range).await?;
                    to_json("clickhouse", rows)
                }
                .boxed()
            }),
        )?;

        let client = analytics.clone();
        self.register(
            descriptor(
                "get_top_buckets_by_inbound_traffic",
                "Get the top N buckets ranked by uploaded bytes (PutObject and UploadPart)",
                ranking_schema(),
            ),
            Arc::new(move |args| {
                let client = client.clone();
                async move {
                    let limit = parse_limit("get_top_buckets_by_inbound_traffic", &args)?;
                    let range = parse_time_range("get_top_buckets_by_inbound_traffic", &args)?;
                    let rows = client.top_buckets_by_inbound_traffic(limit, &range).await?;
                    to_json("clickhouse", rows)
                }
                .boxed()
            }),
        )?;

        self.register(
            descriptor(
                "get_top_buckets_by_outbound_traffic",
                "Get the top N buckets ranked by downloaded bytes (GetObject)",
                ranking_schema(),
            ),
            Arc::new(move |args| {
                let client = analytics.clone();
                async move {
                    let limit = parse_limit("get_top_buckets_by_outbound_traffic", &args)?;
                    let range = parse_time_range("get_top_buckets_by_outbound_traffic", &args)?;
                    let rows = client.top_buckets_by_outbound_traffic(limit, &range).await?;
                    to_json("clickhouse", rows)
                }
                .boxed()
            }),
        )
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a tool descriptor from a `json!` schema literal.
fn descriptor(name: &str, description: &str, schema: Value) -> Tool {
    let schema: JsonObject = schema.as_object().cloned().unwrap_or_default();
    Tool {
        name: name.to_string().into(),
        title: None,
        description: Some(description.to_string().into()),
        input_schema: Arc::new(schema),
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

/// Shared parameter schema for the three ranking tools.
fn ranking_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "limit": {
                "type": "integer",
                "description": "Number of top buckets to return (default: 10)"
            },
            "hours_back": {
                "type": "integer",
                "description": "Look back this many hours from now; overrides start_time/end_time"
            },
            "start_time": {
                "type": "string",
                "description": "Window start, RFC 3339 (e.g. 2024-01-01T00:00:00Z)"
            },
            "end_time": {
                "type": "string",
                "description": "Window end, RFC 3339; defaults to now"
            }
        }
    })
}

/// Validate call arguments against the tool's declared input schema:
/// required properties present, declared types respected, unknown
/// properties rejected.
fn validate_arguments(tool: &Tool, args: &ToolArguments) -> Result<()> {
    let invalid = |reason: String| ButlerError::InvalidArguments {
        tool: tool.name.to_string(),
        reason,
    };

    let empty = Map::new();
    let properties = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = tool.input_schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match args.get(name) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing required argument '{}'", name)));
                }
                Some(_) => {}
            }
        }
    }

    for (name, value) in args {
        let Some(schema) = properties.get(name) else {
            return Err(invalid(format!("unexpected argument '{}'", name)));
        };
        if value.is_null() {
            continue; // optional argument explicitly omitted
        }
        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(invalid(format!(
                    "argument '{}' must be a {}",
                    name, expected
                )));
            }
        }
    }

    Ok(())
}

fn require_string(tool: &str, args: &ToolArguments, name: &str) -> Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ButlerError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("argument '{}' must be a non-empty string", name),
        })
}

/// Result-count limit: defaults to 10, must be a positive integer.
fn parse_limit(tool: &str, args: &ToolArguments) -> Result<u32> {
    let Some(value) = args.get("limit").filter(|v| !v.is_null()) else {
        return Ok(DEFAULT_LIMIT);
    };
    value
        .as_u64()
        .filter(|&n| n > 0)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ButlerError::InvalidArguments {
            tool: tool.to_string(),
            reason: "argument 'limit' must be a positive integer".to_string(),
        })
}

/// Optional time-window arguments, with RFC 3339 validation before any
/// value reaches a query.
fn parse_time_range(tool: &str, args: &ToolArguments) -> Result<TimeRange> {
    let invalid = |reason: String| ButlerError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    };

    let hours_back = match args.get("hours_back").filter(|v| !v.is_null()) {
        None => None,
        Some(value) => Some(
            value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    invalid("argument 'hours_back' must be a positive integer".to_string())
                })?,
        ),
    };

    let parse_ts = |name: &str| -> Result<Option<DateTime<FixedOffset>>> {
        match args.get(name).filter(|v| !v.is_null()) {
            None => Ok(None),
            Some(value) => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("argument '{}' must be a string", name)))?;
                DateTime::parse_from_rfc3339(raw).map(Some).map_err(|e| {
                    invalid(format!("argument '{}' is not RFC 3339: {}", name, e))
                })
            }
        }
    };

    Ok(TimeRange {
        hours_back,
        start: parse_ts("start_time")?,
        end: parse_ts("end_time")?,
    })
}

fn to_json<T: serde::Serialize>(backend: &str, rows: Vec<T>) -> Result<Value> {
    serde_json::to_value(rows).map_err(|e| ButlerError::Upstream {
        backend: backend.to_string(),
        message: format!("failed to serialize result rows: {}", e),
    })
}
