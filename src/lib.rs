//! kustomux - multiplexing MCP router for Azure Data Explorer (Kusto)
//! clusters
//!
//! One MCP client upstream on stdio, one supervised downstream MCP server
//! child process per configured cluster. Tools whose schema names a
//! `cluster` property route to the cluster the caller picks; everything
//! else fans out to every connected cluster with merged results.

pub mod cluster;
pub mod config;
pub mod events;
pub mod health;
pub mod logging;
pub mod router;
pub mod schema;
pub mod server;
pub mod supervisor;
