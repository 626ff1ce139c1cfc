pub mod context;
pub mod executor;
pub mod graph;
pub mod model;
pub mod template;

pub use context::{ExecutionContext, NodeResult, PathLookup};
pub use executor::{execute_flow, EventSender, ExecutorConfig, FlowEvent, FlowExecutor, FlowRun};
pub use model::{
    ContentType, DisplayMode, EndData, FlowDocument, FlowDocumentError, FlowEdge, FlowGraph,
    FlowNode, InputData, NodeKind, NodePosition, PromptData,
};
