//! Tool classification and schema rewriting.
//!
//! The upstream tool surface is derived from whichever cluster's tools are
//! available: a tool whose input schema declares a `cluster` property is
//! *routable* (must target one cluster), everything else *fans out* to all
//! clusters with an optional synthetic `cluster` parameter to force
//! single-cluster mode. Tool names are never hardcoded; the schema shape is
//! the only classification signal.

use rmcp::model::{JsonObject, Tool};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::supervisor::Supervisor;

/// Immutable classification table plus the merged upstream tool list.
pub struct ToolCatalog {
    merged: Vec<Tool>,
    routable: HashSet<String>,
    fan_out: HashSet<String>,
    clusters: Vec<String>,
}

impl ToolCatalog {
    /// An empty catalog (no tools, no clusters).
    pub fn empty() -> Self {
        Self {
            merged: Vec::new(),
            routable: HashSet::new(),
            fan_out: HashSet::new(),
            clusters: Vec::new(),
        }
    }

    /// Classify and rewrite the source tools against the cluster list.
    pub fn build(source: &[Tool], clusters: &[String]) -> Self {
        let mut merged = Vec::with_capacity(source.len());
        let mut routable = HashSet::new();
        let mut fan_out = HashSet::new();

        for tool in source {
            if has_cluster_property(tool) {
                routable.insert(tool.name.to_string());
                merged.push(rewrite_routable(tool, clusters));
            } else {
                fan_out.insert(tool.name.to_string());
                merged.push(rewrite_fan_out(tool, clusters));
            }
        }

        Self {
            merged,
            routable,
            fan_out,
            clusters: clusters.to_vec(),
        }
    }

    /// The rewritten tool list exposed upstream.
    pub fn merged(&self) -> &[Tool] {
        &self.merged
    }

    pub fn is_routable(&self, name: &str) -> bool {
        self.routable.contains(name)
    }

    pub fn is_fan_out(&self, name: &str) -> bool {
        self.fan_out.contains(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.is_routable(name) || self.is_fan_out(name)
    }

    /// Configured cluster URLs the catalog was built against.
    pub fn clusters(&self) -> &[String] {
        &self.clusters
    }

    /// All exposed tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.merged.iter().map(|t| t.name.to_string()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

/// Shared catalog snapshot.
///
/// Refresh swaps the whole catalog atomically; readers clone the `Arc` and
/// see either the old or the new version, never a torn one.
#[derive(Clone)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<ToolCatalog>>>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(ToolCatalog::empty()))),
        }
    }

    /// Get the current catalog snapshot.
    pub fn load(&self) -> Arc<ToolCatalog> {
        self.inner.read().unwrap().clone()
    }

    /// Replace the catalog.
    pub fn store(&self, catalog: ToolCatalog) {
        *self.inner.write().unwrap() = Arc::new(catalog);
    }

    /// Rebuild the catalog from the supervisor's current state.
    ///
    /// The source of truth is the first connected cluster reporting a
    /// non-empty tool list; the fleet is assumed homogeneous. Returns the
    /// number of tools exposed upstream.
    pub async fn refresh_from(&self, supervisor: &Supervisor) -> usize {
        let source = supervisor.source_tools().await;
        let clusters = supervisor.endpoint_urls().await;

        if source.is_empty() {
            warn!("no connected cluster reported tools; exposing an empty tool list");
        }

        let catalog = ToolCatalog::build(&source, &clusters);
        let count = catalog.merged().len();
        debug!(
            tools = count,
            routable = catalog.routable.len(),
            fan_out = catalog.fan_out.len(),
            "tool catalog refreshed"
        );
        self.store(catalog);
        count
    }
}

impl Default for SharedCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Routable tools are recognized purely by shape: the original input
/// schema declares a `cluster` property.
fn has_cluster_property(tool: &Tool) -> bool {
    tool.input_schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|props| props.contains_key("cluster"))
}

/// Rewrite a routable tool: pin the `cluster` property to the configured
/// cluster URLs and make it required.
fn rewrite_routable(tool: &Tool, clusters: &[String]) -> Tool {
    let mut rewritten = tool.clone();
    let mut schema: JsonObject = (*tool.input_schema).clone();

    let props = ensure_object(&mut schema, "properties");
    let prop = props.entry("cluster".to_string()).or_insert_with(|| json!({}));
    if !prop.is_object() {
        *prop = json!({});
    }
    if let Some(prop) = prop.as_object_mut() {
        prop.insert("type".to_string(), json!("string"));
        prop.insert("enum".to_string(), json!(clusters));
        prop.insert(
            "description".to_string(),
            json!(format!(
                "Kusto cluster URL to target. Available clusters: {}",
                clusters.join(", ")
            )),
        );
    }

    let required = schema.entry("required".to_string()).or_insert_with(|| json!([]));
    if !required.is_array() {
        *required = json!([]);
    }
    if let Some(required) = required.as_array_mut() {
        if !required.iter().any(|v| v.as_str() == Some("cluster")) {
            required.push(json!("cluster"));
        }
    }

    rewritten.input_schema = Arc::new(schema);
    rewritten.description = Some(append_suffix(
        tool.description.as_deref(),
        " (Routed to the specified cluster)",
    ));
    rewritten
}

/// Rewrite a fan-out tool: add an optional synthetic `cluster` property
/// that forces single-cluster mode when supplied.
fn rewrite_fan_out(tool: &Tool, clusters: &[String]) -> Tool {
    let mut rewritten = tool.clone();
    let mut schema: JsonObject = (*tool.input_schema).clone();

    let props = ensure_object(&mut schema, "properties");
    props.insert(
        "cluster".to_string(),
        json!({
            "type": "string",
            "enum": clusters,
            "description": format!(
                "Optional Kusto cluster URL. When omitted the call is sent to every available cluster: {}",
                clusters.join(", ")
            ),
        }),
    );

    rewritten.input_schema = Arc::new(schema);
    rewritten.description = Some(append_suffix(
        tool.description.as_deref(),
        " (Queries all available clusters unless a specific cluster is specified)",
    ));
    rewritten
}

fn ensure_object<'a>(schema: &'a mut JsonObject, key: &str) -> &'a mut JsonObject {
    let value = schema.entry(key.to_string()).or_insert_with(|| json!({}));
    if !value.is_object() {
        *value = json!({});
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn append_suffix(description: Option<&str>, suffix: &str) -> Cow<'static, str> {
    let base = description.unwrap_or("").trim_end();
    if base.is_empty() {
        Cow::Owned(suffix.trim_start().to_string())
    } else {
        Cow::Owned(format!("{base}{suffix}"))
    }
}
