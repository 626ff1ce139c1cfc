use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("{message} (status {status})")]
    Api { status: u16, message: String },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Structural problems detected before a flow starts running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),

    #[error("edge `{edge}` references unknown node `{node}`")]
    DanglingEdge { edge: String, node: String },

    #[error("flow graph contains a cycle through: {}", unresolved.join(", "))]
    Cycle { unresolved: Vec<String> },
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow graph: {0}")]
    Graph(#[from] GraphError),

    #[error("model client unavailable: {0}")]
    Provider(#[from] LLMError),

    #[error("node `{node_id}` failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: LLMError,
    },
}

impl FlowError {
    /// Id of the node that aborted the run, if the failure happened mid-run.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::Node { node_id, .. } => Some(node_id),
            FlowError::Graph(_) | FlowError::Provider(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store has been shut down")]
    NotOpen,

    #[error("invalid key `{0}`")]
    InvalidKey(String),

    #[error("setting `{key}`: {source}")]
    Crypto {
        key: String,
        #[source]
        source: CryptoError,
    },
}

/// Failures sealing or opening an encrypted setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    Encoding,

    #[error("ciphertext too short to contain nonce and authentication tag")]
    CiphertextTooShort,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: wrong key or tampered data")]
    DecryptionFailed,

    #[error("decrypted value is not valid UTF-8")]
    NotUtf8,
}
