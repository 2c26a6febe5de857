//! Tool Index
//!
//! Name-keyed handler table built once at startup. Exact lookups hit a
//! `HashMap`; misses go through one approximate pass (normalized variant
//! table, then matcher scoring). Resolved queries are memoized in a small
//! hot-entry cache.

pub mod matcher;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, ServeError};
pub use matcher::{NameMatcher, NormalizedMatcher};

/// Weight of the newest sample in the per-tool latency average
const LATENCY_ALPHA: f64 = 0.2;

const HOT_CACHE_CAPACITY: u64 = 1024;

/// Registration record for a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
    /// Results may be memoized in the tiered cache
    #[serde(default = "default_true")]
    pub cacheable: bool,
    /// Results are also written to the persistent tier
    #[serde(default)]
    pub persist: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_schema() -> Value {
    json!({ "type": "object" })
}

fn default_true() -> bool {
    true
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            description: String::new(),
            input_schema: default_schema(),
            cacheable: true,
            persist: false,
        }
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }
}

/// Tool definition for MCP `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Turns a call into a backend payload and interprets the reply
pub trait ToolHandler: Send + Sync {
    fn encode(&self, tool: &str, arguments: &Value) -> Value;

    fn decode(&self, reply: Value) -> Result<Value>;
}

/// Forwards the call as MCP `tools/call` params and unwraps JSON-RPC replies
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHandler;

impl ToolHandler for PassthroughHandler {
    fn encode(&self, tool: &str, arguments: &Value) -> Value {
        json!({ "name": tool, "arguments": arguments })
    }

    fn decode(&self, reply: Value) -> Result<Value> {
        if let Some(error) = reply.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(ServeError::Backend(message));
        }
        match reply {
            Value::Object(mut map) if map.contains_key("result") => {
                Ok(map.remove("result").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }
}

/// A registered tool with its live usage statistics
pub struct Tool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
    usage_count: AtomicU64,
    avg_latency_bits: AtomicU64,
}

impl Tool {
    fn new(spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            spec,
            handler,
            usage_count: AtomicU64::new(0),
            avg_latency_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn category(&self) -> &str {
        &self.spec.category
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    pub fn handler(&self) -> &Arc<dyn ToolHandler> {
        &self.handler
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        f64::from_bits(self.avg_latency_bits.load(Ordering::Relaxed))
    }

    fn record(&self, latency_ms: f64) {
        let previous_uses = self.usage_count.fetch_add(1, Ordering::Relaxed);
        // fetch_update retries on contention, so concurrent samples are never lost
        let _ = self
            .avg_latency_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                let next = if previous_uses == 0 && current == 0.0 {
                    latency_ms
                } else {
                    current + LATENCY_ALPHA * (latency_ms - current)
                };
                Some(next.to_bits())
            });
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.spec.name)
            .field("category", &self.spec.category)
            .field("usage_count", &self.usage_count())
            .finish()
    }
}

/// Usage snapshot for one tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolStats {
    pub name: String,
    pub usage_count: u64,
    pub avg_latency_ms: f64,
}

/// Read-mostly tool index
pub struct ToolIndex {
    tools: Vec<Arc<Tool>>,
    by_name: HashMap<String, usize>,
    by_category: HashMap<String, Vec<usize>>,
    variants: HashMap<String, usize>,
    matcher: Arc<dyn NameMatcher>,
    hot: Cache<String, Option<usize>>,
}

impl ToolIndex {
    /// Build the index with the default matcher
    pub fn build(tools: Vec<(ToolSpec, Arc<dyn ToolHandler>)>) -> Result<Self> {
        Self::build_with_matcher(tools, Arc::new(NormalizedMatcher::default()))
    }

    /// Build the index with a custom approximate matcher
    pub fn build_with_matcher(
        tools: Vec<(ToolSpec, Arc<dyn ToolHandler>)>,
        matcher: Arc<dyn NameMatcher>,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::with_capacity(tools.len());
        let mut by_category: HashMap<String, Vec<usize>> = HashMap::new();
        let mut variants = HashMap::new();

        for (idx, (spec, handler)) in tools.into_iter().enumerate() {
            if by_name.insert(spec.name.clone(), idx).is_some() {
                return Err(ServeError::Config(format!("duplicate tool name: {}", spec.name)));
            }
            by_category.entry(spec.category.clone()).or_default().push(idx);

            // First registration wins when two names normalize alike
            let normalized = matcher.normalize(&spec.name);
            let compact = matcher::compact(&normalized);
            variants.entry(normalized).or_insert(idx);
            variants.entry(compact).or_insert(idx);

            entries.push(Arc::new(Tool::new(spec, handler)));
        }

        info!(
            "Tool index built: {} tools in {} categories",
            entries.len(),
            by_category.len()
        );

        Ok(Self {
            tools: entries,
            by_name,
            by_category,
            variants,
            matcher,
            hot: Cache::new(HOT_CACHE_CAPACITY),
        })
    }

    /// Build from specs, forwarding every tool with [`PassthroughHandler`]
    pub fn from_specs(specs: Vec<ToolSpec>) -> Result<Self> {
        let handler: Arc<dyn ToolHandler> = Arc::new(PassthroughHandler);
        Self::build(
            specs
                .into_iter()
                .map(|spec| (spec, Arc::clone(&handler)))
                .collect(),
        )
    }

    /// Resolve a tool by exact name, then by one approximate pass
    pub fn find(&self, name: &str) -> Result<Arc<Tool>> {
        if let Some(&idx) = self.by_name.get(name) {
            return Ok(Arc::clone(&self.tools[idx]));
        }

        let resolved = match self.hot.get(name) {
            Some(cached) => cached,
            None => {
                let resolved = self.approximate(name);
                self.hot.insert(name.to_string(), resolved);
                resolved
            }
        };

        match resolved {
            Some(idx) => {
                debug!("Approximate match: {} -> {}", name, self.tools[idx].name());
                Ok(Arc::clone(&self.tools[idx]))
            }
            None => Err(ServeError::ToolNotFound(name.to_string())),
        }
    }

    fn approximate(&self, name: &str) -> Option<usize> {
        for query in [name, matcher::unqualified(name)] {
            let normalized = self.matcher.normalize(query);
            if let Some(&idx) = self.variants.get(&normalized) {
                return Some(idx);
            }
            if let Some(&idx) = self.variants.get(&matcher::compact(&normalized)) {
                return Some(idx);
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, tool) in self.tools.iter().enumerate() {
            if let Some(score) = self.matcher.score(name, tool.name()) {
                // Strictly greater keeps the earliest registration on ties
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((idx, score));
                }
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// All tools in a category, in registration order
    pub fn find_by_category(&self, category: &str) -> Vec<Arc<Tool>> {
        self.by_category
            .get(category)
            .map(|ids| ids.iter().map(|&i| Arc::clone(&self.tools[i])).collect())
            .unwrap_or_default()
    }

    /// Record one dispatch; safe to call from many requests at once
    pub fn record_usage(&self, name: &str, latency_ms: f64) -> bool {
        match self.by_name.get(name) {
            Some(&idx) => {
                self.tools[idx].record(latency_ms);
                true
            }
            None => {
                debug!("Usage recorded for unknown tool: {}", name);
                false
            }
        }
    }

    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.by_name.get(name).map(|&idx| {
            let tool = &self.tools[idx];
            ToolStats {
                name: tool.name().to_string(),
                usage_count: tool.usage_count(),
                avg_latency_ms: tool.avg_latency_ms(),
            }
        })
    }

    /// Tool definitions in registration order
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.spec.name.clone(),
                description: t.spec.description.clone(),
                input_schema: t.spec.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(names: &[(&str, &str)]) -> ToolIndex {
        ToolIndex::from_specs(
            names
                .iter()
                .map(|(n, c)| ToolSpec::new(*n, *c))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_exact_and_not_found() {
        let index = index_of(&[("a", "x"), ("b", "x"), ("c", "y")]);
        assert_eq!(index.find("a").unwrap().name(), "a");
        assert_eq!(index.find("c").unwrap().name(), "c");
        assert_eq!(
            index.find("zzz").unwrap_err(),
            ServeError::ToolNotFound("zzz".to_string())
        );
    }

    #[test]
    fn test_handler_identity() {
        let h1: Arc<dyn ToolHandler> = Arc::new(PassthroughHandler);
        let h2: Arc<dyn ToolHandler> = Arc::new(PassthroughHandler);
        let index = ToolIndex::build(vec![
            (ToolSpec::new("one", "g"), Arc::clone(&h1)),
            (ToolSpec::new("two", "g"), Arc::clone(&h2)),
        ])
        .unwrap();

        assert!(Arc::ptr_eq(index.find("one").unwrap().handler(), &h1));
        assert!(Arc::ptr_eq(index.find("two").unwrap().handler(), &h2));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ToolIndex::from_specs(vec![ToolSpec::new("a", "x"), ToolSpec::new("a", "y")]);
        assert!(matches!(result, Err(ServeError::Config(_))));
    }

    #[test]
    fn test_approximate_variants() {
        let index = index_of(&[("web_search", "search"), ("memory_learn", "memory")]);
        assert_eq!(index.find("Web-Search").unwrap().name(), "web_search");
        assert_eq!(index.find("websearch").unwrap().name(), "web_search");
        assert_eq!(index.find("brave__web_search").unwrap().name(), "web_search");
        assert_eq!(index.find("memory_lern").unwrap().name(), "memory_learn");
        // Served from the hot cache the second time
        assert_eq!(index.find("memory_lern").unwrap().name(), "memory_learn");
    }

    #[test]
    fn test_approximate_tie_prefers_first_registered() {
        let index = index_of(&[("fetch_data", "a"), ("fetch_date", "b")]);
        assert_eq!(index.find("fetch_dat").unwrap().name(), "fetch_data");
    }

    #[test]
    fn test_find_by_category_order() {
        let index = index_of(&[("b", "x"), ("a", "y"), ("c", "x")]);
        let names: Vec<String> = index
            .find_by_category("x")
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(index.find_by_category("missing").is_empty());
    }

    #[test]
    fn test_record_usage_moving_average() {
        let index = index_of(&[("t", "g")]);
        assert!(index.record_usage("t", 100.0));
        assert!(index.record_usage("t", 200.0));
        assert!(!index.record_usage("unknown", 1.0));

        let stats = index.stats("t").unwrap();
        assert_eq!(stats.usage_count, 2);
        assert!((stats.avg_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_usage_concurrent() {
        let index = Arc::new(index_of(&[("t", "g")]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        index.record_usage("t", 10.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = index.stats("t").unwrap();
        assert_eq!(stats.usage_count, 8000);
        assert!((stats.avg_latency_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_passthrough_decode() {
        let handler = PassthroughHandler;
        assert_eq!(
            handler.decode(json!({"jsonrpc": "2.0", "result": {"ok": true}, "id": 1})).unwrap(),
            json!({"ok": true})
        );
        assert_eq!(
            handler.decode(json!({"error": {"code": -1, "message": "nope"}})).unwrap_err(),
            ServeError::Backend("nope".to_string())
        );
        assert_eq!(handler.decode(json!("raw")).unwrap(), json!("raw"));
    }
}
