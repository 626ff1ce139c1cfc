pub mod error;
pub mod flow;
pub mod providers;
pub mod store;
pub mod types;

pub use error::{CryptoError, FlowError, GraphError, LLMError, StoreError};
pub use flow::{
    execute_flow, ExecutionContext, FlowDocument, FlowEdge, FlowEvent, FlowExecutor, FlowGraph,
    FlowNode, FlowRun, NodeKind,
};
pub use providers::LLMProvider;
pub use store::{FileStore, FlowRepository, MemoryStore, Namespace, SettingsCipher, Store};
pub use types::{
    model_info, ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, MessageRole,
    ModelInfo, StreamEvent, TokenUsage, KNOWN_MODELS,
};
