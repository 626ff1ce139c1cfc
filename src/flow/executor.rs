use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    error::{FlowError, LLMError},
    providers::{openai::OpenAI, LLMProvider},
    types::{model_info, ChatMessage, CompletionRequest, StreamEvent},
};

use super::{
    context::ExecutionContext,
    model::{FlowEdge, FlowGraph, FlowNode, InputData, NodeKind, PromptData},
    template,
};

/// Lifecycle notifications of a run, in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    #[serde(rename = "start")]
    NodeStarted { node_id: String },
    #[serde(rename = "token")]
    NodeToken { node_id: String, token: String },
    #[serde(rename = "complete")]
    NodeCompleted { node_id: String, output: String },
    #[serde(rename = "error")]
    NodeFailed { node_id: String, message: String },
    RunCompleted,
    RunAborted { node_id: String, message: String },
}

impl FlowEvent {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowEvent::NodeStarted { node_id }
            | FlowEvent::NodeToken { node_id, .. }
            | FlowEvent::NodeCompleted { node_id, .. }
            | FlowEvent::NodeFailed { node_id, .. }
            | FlowEvent::RunAborted { node_id, .. } => Some(node_id),
            FlowEvent::RunCompleted => None,
        }
    }
}

pub type EventSender = UnboundedSender<FlowEvent>;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause after each prompt node before the next node starts.
    pub node_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_delay: Duration::from_millis(100),
        }
    }
}

/// Outcome of a run that reached the end of its execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRun {
    pub order: Vec<String>,
    pub context: ExecutionContext,
}

impl FlowRun {
    pub fn output(&self, node_id: &str) -> Option<&str> {
        self.context.output(node_id)
    }
}

/// Runs a flow graph node by node in dependency order, one node at a time.
pub struct FlowExecutor {
    provider: Arc<dyn LLMProvider>,
    config: ExecutorConfig,
}

impl FlowExecutor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_node_delay(mut self, node_delay: Duration) -> Self {
        self.config.node_delay = node_delay;
        self
    }

    /// Executes `graph`, reporting progress on `events`.
    ///
    /// The graph is validated and ordered up front; a malformed graph fails
    /// before any event is sent. The first node error is reported as
    /// [`FlowEvent::NodeFailed`] followed by [`FlowEvent::RunAborted`], and no
    /// later node is started. A closed receiver does not stop the run.
    pub async fn run(&self, graph: &FlowGraph, events: &EventSender) -> Result<FlowRun, FlowError> {
        let order = graph.execution_order()?;
        let order_ids: Vec<String> = order.iter().map(|node| node.id.clone()).collect();
        tracing::info!(nodes = order.len(), edges = graph.edges.len(), "starting flow run");

        let mut context = ExecutionContext::new();

        for node in order {
            emit(
                events,
                FlowEvent::NodeStarted {
                    node_id: node.id.clone(),
                },
            );
            tracing::debug!(node = %node.id, kind = node.kind.name(), "node started");

            let result = match &node.kind {
                NodeKind::Input(data) => Ok(run_input(data)),
                NodeKind::Prompt(data) => self.run_prompt(node, data, &context, events).await,
                NodeKind::End(_) => Ok(run_end(node, graph, &context)),
            };

            let output = match result {
                Ok(output) => output,
                Err(error) => {
                    let message = error.to_string();
                    tracing::warn!(node = %node.id, %message, "node failed, aborting run");
                    emit(
                        events,
                        FlowEvent::NodeFailed {
                            node_id: node.id.clone(),
                            message: message.clone(),
                        },
                    );
                    emit(
                        events,
                        FlowEvent::RunAborted {
                            node_id: node.id.clone(),
                            message,
                        },
                    );
                    return Err(FlowError::Node {
                        node_id: node.id.clone(),
                        source: error,
                    });
                }
            };

            context.record(node.id.clone(), output.clone());
            tracing::debug!(node = %node.id, bytes = output.len(), "node completed");
            emit(
                events,
                FlowEvent::NodeCompleted {
                    node_id: node.id.clone(),
                    output,
                },
            );

            if matches!(node.kind, NodeKind::Prompt(_)) && !self.config.node_delay.is_zero() {
                tokio::time::sleep(self.config.node_delay).await;
            }
        }

        emit(events, FlowEvent::RunCompleted);
        tracing::info!(completed = context.len(), "flow run finished");

        Ok(FlowRun {
            order: order_ids,
            context,
        })
    }

    async fn run_prompt(
        &self,
        node: &FlowNode,
        data: &PromptData,
        context: &ExecutionContext,
        events: &EventSender,
    ) -> Result<String, LLMError> {
        for text in [&data.system_prompt, &data.user_prompt] {
            for reference in template::references(text) {
                if context.get(&reference).is_none() {
                    tracing::warn!(
                        node = %node.id,
                        reference = %reference,
                        "template references a node that has not completed; it resolves to empty"
                    );
                }
            }
        }

        if let Some(model) = model_info(&data.model) {
            if data.max_tokens > model.max_tokens {
                tracing::warn!(
                    node = %node.id,
                    model = model.id,
                    requested = data.max_tokens,
                    ceiling = model.max_tokens,
                    "max tokens exceeds the model's output ceiling"
                );
            }
        }

        let system_prompt = template::resolve(&data.system_prompt, context);
        let user_prompt = template::resolve(&data.user_prompt, context);

        let request = CompletionRequest::new(
            data.model.clone(),
            vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
        )
        .with_temperature(data.temperature)
        .with_max_tokens(data.max_tokens)
        .with_json_mode(data.json_mode);

        let mut stream = self.provider.stream_completion(request).await?;
        let mut streamed = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::MessageDelta(token) => {
                    streamed.push_str(&token);
                    emit(
                        events,
                        FlowEvent::NodeToken {
                            node_id: node.id.clone(),
                            token,
                        },
                    );
                }
                StreamEvent::Completed(response) => return Ok(response.content),
            }
        }

        Ok(streamed)
    }
}

fn run_input(data: &InputData) -> String {
    data.value.clone()
}

/// Mirrors the output of the source of the first incoming edge in edge-list
/// order. Other incoming edges are ignored.
fn run_end(node: &FlowNode, graph: &FlowGraph, context: &ExecutionContext) -> String {
    let Some(edge) = graph.incoming(&node.id).next() else {
        tracing::debug!(node = %node.id, "end node has no incoming edge");
        return String::new();
    };

    context.output(&edge.source).unwrap_or_default().to_string()
}

fn emit(events: &EventSender, event: FlowEvent) {
    // A dropped receiver only means nobody is watching.
    let _ = events.send(event);
}

/// Builds an OpenAI client from `credential` and runs the graph with it.
pub async fn execute_flow(
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    credential: &str,
    events: &EventSender,
) -> Result<FlowRun, FlowError> {
    let provider = OpenAI::new(credential)?;
    FlowExecutor::new(Arc::new(provider))
        .run(&FlowGraph::new(nodes, edges), events)
        .await
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::{
        error::GraphError,
        flow::model::FlowDocument,
        providers::scripted::{ScriptedProvider, ScriptedReply},
        types::MessageRole,
    };

    fn prompt(user_prompt: &str) -> PromptData {
        PromptData {
            system_prompt: "System".to_string(),
            user_prompt: user_prompt.to_string(),
            max_tokens: 100,
            ..PromptData::default()
        }
    }

    fn drain(receiver: &mut UnboundedReceiver<FlowEvent>) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn executor(provider: Arc<ScriptedProvider>) -> FlowExecutor {
        FlowExecutor::new(provider).with_node_delay(Duration::ZERO)
    }

    fn chain() -> FlowGraph {
        FlowGraph::new(
            vec![
                FlowNode::input("input-1", "Hello World"),
                FlowNode::prompt("prompt-1", prompt("User input: {{input-1.output}}")),
                FlowNode::end("end-1"),
            ],
            vec![
                FlowEdge::new("e1", "input-1", "prompt-1"),
                FlowEdge::new("e2", "prompt-1", "end-1"),
            ],
        )
    }

    #[tokio::test]
    async fn input_completes_before_prompt_and_template_is_resolved() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::text("ok")]));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let run = executor(provider.clone()).run(&chain(), &sender).await.unwrap();

        let events = drain(&mut receiver);
        let input_done = events
            .iter()
            .position(|event| {
                *event
                    == FlowEvent::NodeCompleted {
                        node_id: "input-1".to_string(),
                        output: "Hello World".to_string(),
                    }
            })
            .expect("input completion");
        let first_prompt_event = events
            .iter()
            .position(|event| event.node_id() == Some("prompt-1"))
            .expect("prompt events");
        assert!(input_done < first_prompt_event);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        let user = &requests[0].messages[1];
        assert_eq!(user.role, MessageRole::User);
        assert_eq!(user.content, "User input: Hello World");
        assert_eq!(requests[0].messages[0].content, "System");
        assert_eq!(requests[0].max_tokens, 100);

        assert_eq!(run.order, vec!["input-1", "prompt-1", "end-1"]);
        assert_eq!(run.output("end-1"), Some("ok"));
        assert_eq!(events.last(), Some(&FlowEvent::RunCompleted));
    }

    #[tokio::test]
    async fn streamed_tokens_arrive_in_order_and_concatenate() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::tokens([
            "foo", "bar", "baz",
        ])]));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let graph = FlowGraph::new(vec![FlowNode::prompt("p", prompt("go"))], Vec::new());

        executor(provider).run(&graph, &sender).await.unwrap();

        let events = drain(&mut receiver);
        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                FlowEvent::NodeToken { token, .. } => Some(token.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["foo", "bar", "baz"]);
        assert!(events.contains(&FlowEvent::NodeCompleted {
            node_id: "p".to_string(),
            output: "foobarbaz".to_string(),
        }));
    }

    #[tokio::test]
    async fn api_failure_aborts_before_later_nodes_start() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::failure(
            401,
            "Incorrect API key provided",
        )]));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let error = executor(provider).run(&chain(), &sender).await.unwrap_err();
        assert_eq!(error.node_id(), Some("prompt-1"));

        let events = drain(&mut receiver);
        let failure = events.iter().find_map(|event| match event {
            FlowEvent::NodeFailed { node_id, message } => Some((node_id.clone(), message.clone())),
            _ => None,
        });
        let (node_id, message) = failure.expect("failure event");
        assert_eq!(node_id, "prompt-1");
        assert!(!message.is_empty());

        assert!(!events.contains(&FlowEvent::NodeStarted {
            node_id: "end-1".to_string()
        }));
        assert!(matches!(events.last(), Some(FlowEvent::RunAborted { .. })));
        assert!(!events.contains(&FlowEvent::RunCompleted));
    }

    #[tokio::test]
    async fn stream_breaking_mid_node_aborts_without_completion() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::interrupted(
            ["par"],
            "connection reset",
        )]));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let error = executor(provider).run(&chain(), &sender).await.unwrap_err();
        assert_eq!(error.node_id(), Some("prompt-1"));
        assert!(matches!(
            error,
            FlowError::Node {
                source: LLMError::Provider(_),
                ..
            }
        ));

        let events = drain(&mut receiver);
        assert!(events.contains(&FlowEvent::NodeToken {
            node_id: "prompt-1".to_string(),
            token: "par".to_string(),
        }));
        assert!(!events.iter().any(|event| matches!(
            event,
            FlowEvent::NodeCompleted { node_id, .. } if node_id == "prompt-1"
        )));
        assert!(!events.contains(&FlowEvent::NodeStarted {
            node_id: "end-1".to_string()
        }));

        let tail: Vec<&FlowEvent> = events.iter().rev().take(2).collect();
        assert!(matches!(tail[0], FlowEvent::RunAborted { node_id, .. } if node_id == "prompt-1"));
        assert!(matches!(
            tail[1],
            FlowEvent::NodeFailed { node_id, message }
                if node_id == "prompt-1" && message.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn end_node_mirrors_first_incoming_edge() {
        let graph = FlowGraph::new(
            vec![
                FlowNode::input("X", "A"),
                FlowNode::input("Y", "B"),
                FlowNode::end("out"),
            ],
            vec![
                FlowEdge::new("e1", "Y", "out"),
                FlowEdge::new("e2", "X", "out"),
            ],
        );
        let provider = Arc::new(ScriptedProvider::default());

        for _ in 0..3 {
            let (sender, _receiver) = mpsc::unbounded_channel();
            let run = executor(provider.clone()).run(&graph, &sender).await.unwrap();
            assert_eq!(run.output("out"), Some("B"));
        }
    }

    #[tokio::test]
    async fn end_node_without_inputs_completes_empty() {
        let graph = FlowGraph::new(vec![FlowNode::end("alone")], Vec::new());
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let run = executor(Arc::new(ScriptedProvider::default()))
            .run(&graph, &sender)
            .await
            .unwrap();

        assert_eq!(run.output("alone"), Some(""));
        assert_eq!(
            drain(&mut receiver),
            vec![
                FlowEvent::NodeStarted {
                    node_id: "alone".to_string()
                },
                FlowEvent::NodeCompleted {
                    node_id: "alone".to_string(),
                    output: String::new()
                },
                FlowEvent::RunCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn cyclic_graph_is_rejected_without_events() {
        let graph = FlowGraph::new(
            vec![
                FlowNode::prompt("a", prompt("{{b.output}}")),
                FlowNode::prompt("b", prompt("{{a.output}}")),
            ],
            vec![FlowEdge::new("1", "a", "b"), FlowEdge::new("2", "b", "a")],
        );
        let provider = Arc::new(ScriptedProvider::default());
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let error = executor(provider.clone()).run(&graph, &sender).await.unwrap_err();

        assert!(matches!(error, FlowError::Graph(GraphError::Cycle { .. })));
        assert!(drain(&mut receiver).is_empty());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn forward_reference_resolves_to_empty_string() {
        let graph = FlowGraph::new(
            vec![
                FlowNode::prompt("first", prompt("before [{{second.output}}]")),
                FlowNode::prompt("second", prompt("after")),
            ],
            Vec::new(),
        );
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::text("one"),
            ScriptedReply::text("two"),
        ]));
        let (sender, _receiver) = mpsc::unbounded_channel();

        executor(provider.clone()).run(&graph, &sender).await.unwrap();

        assert_eq!(provider.requests()[0].messages[1].content, "before []");
    }

    #[tokio::test]
    async fn json_mode_and_model_settings_reach_the_request() {
        let data = PromptData {
            model: "gpt-4o".to_string(),
            temperature: 1.5,
            json_mode: true,
            ..prompt("{}")
        };
        let graph = FlowGraph::new(vec![FlowNode::prompt("p", data)], Vec::new());
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::text("{\"a\":1}")]));
        let (sender, _receiver) = mpsc::unbounded_channel();

        executor(provider.clone()).run(&graph, &sender).await.unwrap();

        let requests = provider.requests();
        let request = &requests[0];
        assert_eq!(request.model, "gpt-4o");
        assert!(request.json_mode);
        assert!((request.temperature - 1.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn closed_receiver_does_not_stop_the_run() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::text("fine")]));
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);

        let run = executor(provider).run(&chain(), &sender).await.unwrap();
        assert_eq!(run.output("end-1"), Some("fine"));
    }

    #[tokio::test]
    async fn reimported_document_replays_identically() {
        let document = FlowDocument::new("flow-1", "Chain", chain());
        let json = document.to_json_string().unwrap();
        let reimported = FlowDocument::from_json_str(&json).unwrap();

        let mut outputs = Vec::new();
        for graph in [document.graph(), reimported.graph()] {
            let reply = ScriptedReply::tokens(["det", "erministic"]);
            let provider = Arc::new(ScriptedProvider::new([reply]));
            let (sender, mut receiver) = mpsc::unbounded_channel();
            executor(provider).run(&graph, &sender).await.unwrap();
            let completed: Vec<FlowEvent> = drain(&mut receiver)
                .into_iter()
                .filter(|event| matches!(event, FlowEvent::NodeCompleted { .. }))
                .collect();
            outputs.push(completed);
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0].len(), 3);
    }

    #[test]
    fn events_serialise_with_lifecycle_kind() {
        let value = serde_json::to_value(FlowEvent::NodeToken {
            node_id: "p".to_string(),
            token: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "kind": "token", "node_id": "p", "token": "hi" })
        );
        let value = serde_json::to_value(FlowEvent::RunCompleted).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "run_completed" }));
    }
}
