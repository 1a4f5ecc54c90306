//! Upstream MCP server: the single tool surface exposed to the client.
//!
//! `list_tools` serves the merged catalog snapshot; `call_tool` hands off
//! to the dispatch router. The transport is stdio, which is why nothing in
//! this process may write to stdout except the MCP framing itself.

use anyhow::Result;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer, RunningService},
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use std::sync::Arc;
use tracing::info;

use crate::router::Router;
use crate::schema::SharedCatalog;

/// MCP server handler for the router's unified tool surface.
#[derive(Clone)]
pub struct MuxServer {
    router: Arc<Router>,
    catalog: SharedCatalog,
}

impl MuxServer {
    pub fn new(router: Arc<Router>, catalog: SharedCatalog) -> Self {
        Self { router, catalog }
    }

    /// Serve the MCP surface over this process's stdin/stdout.
    pub async fn serve_stdio(self) -> Result<RunningService<RoleServer, MuxServer>> {
        let service = self
            .serve(stdio())
            .await
            .map_err(|e| anyhow::anyhow!("failed to start upstream MCP server: {e:?}"))?;
        info!("upstream MCP server listening on stdio");
        Ok(service)
    }
}

impl ServerHandler for MuxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "kustomux - one tool surface over a fleet of Azure Data Explorer (Kusto) \
                 clusters. Tools with a required cluster argument run on the cluster you \
                 name; the rest run on every connected cluster unless a specific cluster \
                 is supplied."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.catalog.load().merged().to_vec(),
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self
            .router
            .dispatch(request.name.as_ref(), request.arguments)
            .await)
    }
}
