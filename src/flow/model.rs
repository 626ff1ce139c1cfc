use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Error)]
pub enum FlowDocumentError {
    #[error("failed to parse flow JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse flow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Text,
    Markdown,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default)]
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub json_mode: bool,
}

impl Default for PromptData {
    fn default() -> Self {
        Self {
            label: None,
            system_prompt: String::new(),
            user_prompt: String::new(),
            model: default_model(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            json_mode: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub display_mode: DisplayMode,
}

/// Kind-specific payload, tagged the way the canvas serialises nodes:
/// `{"type": "prompt", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NodeKind {
    Input(InputData),
    Prompt(PromptData),
    End(EndData),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input(_) => "input",
            NodeKind::Prompt(_) => "prompt",
            NodeKind::End(_) => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodePosition {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<NodePosition>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            position: None,
            kind,
        }
    }

    pub fn input(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Input(InputData {
                value: value.into(),
                ..InputData::default()
            }),
        )
    }

    pub fn prompt(id: impl Into<String>, data: PromptData) -> Self {
        Self::new(id, NodeKind::Prompt(data))
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End(EndData::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl FlowEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

/// The executable part of a flow: nodes plus the edges between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn new(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Incoming edges of `id`, in edge-list order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |edge| edge.target == id)
    }
}

/// A saved flow as the persistence layer stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl FlowDocument {
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: FlowGraph) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: graph.nodes,
            edges: graph.edges,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn graph(&self) -> FlowGraph {
        FlowGraph::new(self.nodes.clone(), self.edges.clone())
    }

    pub fn from_json_str(input: &str) -> Result<Self, FlowDocumentError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json_string(&self) -> Result<String, FlowDocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, FlowDocumentError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, FlowDocumentError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(FlowDocument)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_canvas_node_shape_and_ignores_presentation_fields() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "prompt-1",
            "type": "prompt",
            "position": { "x": 200.0, "y": 0.0 },
            "selected": true,
            "data": {
                "label": "Prompt",
                "systemPrompt": "You are helpful",
                "userPrompt": "Process: {{input-1.output}}",
                "model": "gpt-4o",
                "temperature": 0.2,
                "maxTokens": 100,
                "jsonMode": true,
                "output": "stale",
                "isRunning": false,
                "status": "done"
            }
        }))
        .unwrap();

        assert_eq!(node.id, "prompt-1");
        match node.kind {
            NodeKind::Prompt(data) => {
                assert_eq!(data.user_prompt, "Process: {{input-1.output}}");
                assert_eq!(data.model, "gpt-4o");
                assert_eq!(data.max_tokens, 100);
                assert!(data.json_mode);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn prompt_defaults_fill_missing_fields() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "p",
            "type": "prompt",
            "data": { "userPrompt": "hi" }
        }))
        .unwrap();

        let NodeKind::Prompt(data) = node.kind else {
            panic!("expected prompt node");
        };
        assert_eq!(data.model, DEFAULT_MODEL);
        assert_eq!(data.max_tokens, 2000);
        assert!((data.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn input_content_type_is_serialised_as_type() {
        let node = FlowNode::input("input-1", "Hello");
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], json!("input"));
        assert_eq!(value["data"]["type"], json!("text"));
        assert_eq!(value["data"]["value"], json!("Hello"));
    }

    #[test]
    fn incoming_edges_keep_edge_list_order() {
        let graph = FlowGraph::new(
            vec![
                FlowNode::input("x", "A"),
                FlowNode::input("y", "B"),
                FlowNode::end("z"),
            ],
            vec![FlowEdge::new("e2", "y", "z"), FlowEdge::new("e1", "x", "z")],
        );
        let sources: Vec<_> = graph.incoming("z").map(|edge| edge.source.as_str()).collect();
        assert_eq!(sources, vec!["y", "x"]);
    }

    #[test]
    fn schema_names_the_document() {
        let schema = FlowDocument::json_schema();
        let title = schema.schema.metadata.as_ref().and_then(|m| m.title.clone());
        assert_eq!(title.as_deref(), Some("FlowDocument"));
    }
}
