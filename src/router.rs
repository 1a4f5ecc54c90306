//! Dispatch routing: translate one upstream `call_tool` into supervisor
//! calls.
//!
//! The decision is pure ([`decide`]) and separated from execution so the
//! table can be tested without live children. The router never retries;
//! every problem surfaces as an `isError` tool result.

use rmcp::model::{CallToolResult, Content, JsonObject};
use std::sync::Arc;
use tracing::debug;

use crate::cluster::normalize_cluster_url;
use crate::schema::{SharedCatalog, ToolCatalog};
use crate::supervisor::Supervisor;

/// Outcome of the routing decision for one call.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// Call one cluster.
    One {
        cluster: String,
        tool: String,
        args: JsonObject,
    },
    /// Fan out to every connected cluster.
    All { tool: String, args: JsonObject },
    /// Refuse with a textual error result.
    Reject { message: String },
}

/// Decide how to dispatch `name(args)`, in decision-table order:
///
/// 1. routable tool → one cluster, `cluster` argument forwarded unchanged
/// 2. fan-out tool with `cluster` → one cluster, `cluster` stripped
/// 3. fan-out tool without `cluster` → all clusters, `cluster` stripped
/// 4. unknown tool with `cluster` → one cluster, args passed through
/// 5. unknown tool without `cluster` → reject naming the available tools
pub fn decide(catalog: &ToolCatalog, name: &str, mut args: JsonObject) -> Dispatch {
    // An empty or whitespace cluster value counts as absent.
    let requested = args
        .get("cluster")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if catalog.is_routable(name) {
        let Some(requested) = requested else {
            return Dispatch::Reject {
                message: format!(
                    "The cluster parameter is required for \"{name}\". Available clusters: {}",
                    join_clusters(catalog.clusters())
                ),
            };
        };
        return match resolve(catalog, &requested) {
            Ok(cluster) => Dispatch::One {
                cluster,
                tool: name.to_string(),
                args,
            },
            Err(message) => Dispatch::Reject { message },
        };
    }

    if catalog.is_fan_out(name) {
        args.remove("cluster");
        return match requested {
            Some(requested) => match resolve(catalog, &requested) {
                Ok(cluster) => Dispatch::One {
                    cluster,
                    tool: name.to_string(),
                    args,
                },
                Err(message) => Dispatch::Reject { message },
            },
            None => Dispatch::All {
                tool: name.to_string(),
                args,
            },
        };
    }

    // Unknown tool: pass through optimistically when a cluster is named.
    match requested {
        Some(requested) => match resolve(catalog, &requested) {
            Ok(cluster) => Dispatch::One {
                cluster,
                tool: name.to_string(),
                args,
            },
            Err(message) => Dispatch::Reject { message },
        },
        None => Dispatch::Reject {
            message: format!(
                "Unknown tool \"{name}\". Available tools: {}",
                join_names(&catalog.tool_names())
            ),
        },
    }
}

/// Normalize the requested cluster and require an exact match among the
/// configured cluster URLs.
fn resolve(catalog: &ToolCatalog, requested: &str) -> Result<String, String> {
    let normalized = normalize_cluster_url(requested);
    if catalog.clusters().iter().any(|url| *url == normalized) {
        Ok(normalized)
    } else {
        Err(format!(
            "Cluster \"{requested}\" is not configured. Available clusters: {}",
            join_clusters(catalog.clusters())
        ))
    }
}

fn join_clusters(clusters: &[String]) -> String {
    if clusters.is_empty() {
        "(none)".to_string()
    } else {
        clusters.join(", ")
    }
}

fn join_names(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Executes routing decisions against the supervisor.
pub struct Router {
    supervisor: Arc<Supervisor>,
    catalog: SharedCatalog,
}

impl Router {
    pub fn new(supervisor: Arc<Supervisor>, catalog: SharedCatalog) -> Self {
        Self {
            supervisor,
            catalog,
        }
    }

    /// Dispatch one upstream tool call.
    pub async fn dispatch(&self, name: &str, args: Option<JsonObject>) -> CallToolResult {
        let catalog = self.catalog.load();
        match decide(&catalog, name, args.unwrap_or_default()) {
            Dispatch::One {
                cluster,
                tool,
                args,
            } => {
                debug!(tool = %tool, cluster = %cluster, "routing to one cluster");
                self.supervisor.call_on_one(&cluster, &tool, args).await
            }
            Dispatch::All { tool, args } => {
                debug!(tool = %tool, "fanning out to all clusters");
                self.supervisor.call_on_all(&tool, args).await
            }
            Dispatch::Reject { message } => {
                debug!(tool = name, %message, "call rejected");
                CallToolResult::error(vec![Content::text(message)])
            }
        }
    }
}
