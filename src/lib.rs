//! S3 Butler — standalone MCP server for S3 bucket administration.
//! Exposes bucket listing, IAM policy auditing, and ClickHouse usage
//! analytics as MCP tools over Streamable HTTP and STDIO transports.
//! Analytics tools appear only when a ClickHouse backend is configured.

pub mod analytics;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod storage;

pub use analytics::{AnalyticsClient, BucketOperations, BucketTraffic, TimeRange};
pub use config::{AnalyticsConfig, ButlerConfig, ListenConfig, StorageConfig};
pub use error::{ButlerError, Result};
pub use registry::{ToolHandler, ToolRegistry};
pub use server::ButlerMcpServer;
pub use storage::StorageClient;
