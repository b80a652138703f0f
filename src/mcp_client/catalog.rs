//! Tool catalog: the snapshot of tools a server offered at connect time.
//!
//! Provides:
//! - Lookup by name, in server order
//! - Reshaping into model tool definitions
//! - Validation of a model's tool call against the advertised schema
//! - Near-miss suggestions for tool names the server never offered

use std::collections::HashMap;

use serde_json::Value;

use super::errors::McpError;
use super::session::McpSession;
use super::types::ToolDescriptor;
use crate::inference::types::ToolDefinition;

/// Minimum similarity for a name to be suggested.
const SUGGESTION_FLOOR: f64 = 0.3;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Immutable set of tool descriptors from one session.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    /// `name → index into tools`.
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Build a catalog, rejecting duplicate tool names.
    pub fn from_descriptors(server: &str, tools: Vec<ToolDescriptor>) -> Result<Self, McpError> {
        let mut index = HashMap::with_capacity(tools.len());
        for (i, tool) in tools.iter().enumerate() {
            if index.insert(tool.name.clone(), i).is_some() {
                return Err(McpError::DuplicateTool {
                    server: server.to_string(),
                    name: tool.name.clone(),
                });
            }
        }
        Ok(Self { tools, index })
    }

    /// List the session's tools once and build the catalog.
    pub async fn fetch(session: &McpSession) -> Result<Self, McpError> {
        let tools = session.list_tools().await?;
        let catalog = Self::from_descriptors(session.server_name(), tools)?;
        tracing::info!(
            server = %session.server_name(),
            tools = catalog.len(),
            "tool catalog loaded"
        );
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Tool names in server order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    /// Tool definitions in the shape the model expects.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    /// Check a tool call against the catalog before it reaches the server.
    ///
    /// Rejects unknown tools (with suggestions), non-object arguments, and
    /// arguments missing a field the schema lists as `required`.
    pub fn validate_call(&self, name: &str, arguments: &Value) -> Result<(), McpError> {
        let Some(tool) = self.get(name) else {
            let similar = self.find_similar(name, 3);
            let reason = if similar.is_empty() {
                format!("unknown tool; available tools: {}", self.names().join(", "))
            } else {
                format!("unknown tool; did you mean: {}?", similar.join(", "))
            };
            return Err(McpError::InvalidArguments {
                tool: name.to_string(),
                reason,
            });
        };

        let Some(args) = arguments.as_object() else {
            return Err(McpError::InvalidArguments {
                tool: name.to_string(),
                reason: format!("arguments must be a JSON object, got {arguments}"),
            });
        };

        if let Some(required) = tool.input_schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(field) {
                    return Err(McpError::InvalidArguments {
                        tool: name.to_string(),
                        reason: format!("missing required field: '{field}'"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Up to `max_results` catalog names closest to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&str, f64)> = self
            .tools
            .iter()
            .map(|t| (t.name.as_str(), similarity(name, &t.name)))
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(*ca != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, required: &[&str]) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object", "required": required}),
        }
    }

    fn weather_catalog() -> ToolCatalog {
        ToolCatalog::from_descriptors(
            "weather",
            vec![tool("get_alerts", &["state"]), tool("get_forecast", &["latitude", "longitude"])],
        )
        .unwrap()
    }

    #[test]
    fn test_preserves_server_order() {
        let catalog = weather_catalog();
        assert_eq!(catalog.names(), vec!["get_alerts", "get_forecast"]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("get_forecast").is_some());
        assert!(catalog.get("get_weather").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = ToolCatalog::from_descriptors("w", vec![tool("a", &[]), tool("a", &[])])
            .unwrap_err();
        assert!(matches!(err, McpError::DuplicateTool { ref name, .. } if name == "a"));
    }

    #[test]
    fn test_definitions_carry_schema() {
        let defs = weather_catalog().definitions();
        assert_eq!(defs[0].name, "get_alerts");
        assert_eq!(defs[0].description, "get_alerts tool");
        assert_eq!(defs[0].input_schema["required"][0], "state");
    }

    #[test]
    fn test_validate_call_accepts_complete_arguments() {
        let catalog = weather_catalog();
        assert!(catalog.validate_call("get_alerts", &json!({"state": "CA"})).is_ok());
    }

    #[test]
    fn test_validate_call_missing_required_field() {
        let err = weather_catalog()
            .validate_call("get_forecast", &json!({"latitude": 1.0}))
            .unwrap_err();
        assert!(err.to_string().contains("longitude"));
    }

    #[test]
    fn test_validate_call_rejects_non_object_arguments() {
        let err = weather_catalog()
            .validate_call("get_alerts", &json!("CA"))
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn test_unknown_tool_suggests_near_miss() {
        let err = weather_catalog()
            .validate_call("get_alert", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("did you mean: get_alerts"));
    }

    #[test]
    fn test_find_similar_respects_floor() {
        let catalog = weather_catalog();
        assert!(catalog.find_similar("xyzzy_plugh_qq", 3).is_empty());
        assert_eq!(catalog.find_similar("get_forcast", 1), vec!["get_forecast"]);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
