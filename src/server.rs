//! ButlerMcpServer — rmcp ServerHandler backed by the ToolRegistry.
//!
//! Delegates tool listing and tool calls to the registry. The registry is
//! read-only after startup and shared behind an `Arc`, so every session
//! clone serves concurrent calls without further synchronization.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};

use crate::registry::ToolRegistry;

/// MCP server over the startup-built tool registry.
///
/// `StreamableHttpService` calls the factory closure per session — each
/// clone shares the same registry `Arc`.
#[derive(Clone)]
pub struct ButlerMcpServer {
    registry: Arc<ToolRegistry>,
}

impl ButlerMcpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Read access to the registry, mainly for tests and startup logging.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

impl ServerHandler for ButlerMcpServer {
    /// Server metadata: name, version, tools capability.
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "s3-butler".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "S3 Butler — S3 bucket administration and usage analytics as MCP tools.".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    /// Advertise the registry's tool descriptors.
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.registry.descriptors(),
            next_cursor: None,
            meta: None,
        })
    }

    /// Dispatch one tool call and stream back the `{"result": ...}` envelope.
    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        tracing::debug!(tool = %request.name, "dispatching tool call");
        let envelope = self
            .registry
            .dispatch(&request.name, request.arguments)
            .await
            .map_err(McpError::from)?;

        let content = Content::json(envelope)?;
        Ok(CallToolResult {
            content: vec![content],
            is_error: Some(false),
            structured_content: None,
            meta: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsClient;
    use crate::config::ButlerConfig;
    use crate::storage::StorageClient;
    use std::collections::HashMap;

    fn make_server(analytics: bool) -> ButlerMcpServer {
        let mut vars = HashMap::new();
        vars.insert("S3_ACCESS_KEY".to_string(), "AKIA_TEST".to_string());
        vars.insert("S3_SECRET_KEY".to_string(), "secret".to_string());
        if analytics {
            vars.insert("CLICKHOUSE_HOST".to_string(), "ch.internal".to_string());
        }
        let config = ButlerConfig::from_map(&vars).unwrap();
        let storage = StorageClient::new(&config.storage);
        let analytics_client = config
            .analytics
            .as_ref()
            .map(|a| AnalyticsClient::new(a).unwrap());
        let registry = ToolRegistry::build(&config, storage, analytics_client).unwrap();
        ButlerMcpServer::new(registry)
    }

    #[test]
    fn test_get_info_server_name() {
        let server = make_server(false);
        let info = server.get_info();
        assert_eq!(info.server_info.name, "s3-butler");
        assert!(
            info.capabilities.tools.is_some(),
            "tools capability should be enabled"
        );
        assert!(info.instructions.is_some(), "instructions should be set");
    }

    #[test]
    fn test_registry_shared_across_clones() {
        let server = make_server(false);
        let clone = server.clone();
        assert!(Arc::ptr_eq(&server.registry, &clone.registry));
    }

    #[test]
    fn test_advertised_tools_without_analytics() {
        let server = make_server(false);
        let names: Vec<String> = server
            .registry()
            .descriptors()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "get_team_name",
                "list_buckets",
                "get_iam_policies_for_bucket"
            ]
        );
    }

    #[test]
    fn test_advertised_tools_with_analytics() {
        let server = make_server(true);
        assert_eq!(server.registry().len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_protocol_error_not_crash() {
        let server = make_server(false);
        let result = server.registry().dispatch("not_a_tool", None).await;
        assert!(result.is_err());
    }
}
