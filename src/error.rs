//! Top-level error types for Plotforge.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Store lookup and write errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("game {id} not found")]
    GameNotFound { id: i64 },

    #[error("no game is bound to channel {channel_id}")]
    NoGameInChannel { channel_id: String },

    #[error("branch '{name}' not found")]
    BranchNotFound { name: String },

    #[error("round {id} not found")]
    RoundNotFound { id: i64 },

    #[error("tag '{name}' not found")]
    TagNotFound { name: String },

    #[error("name '{name}' is already taken")]
    NameTaken { name: String },

    #[error("channel {channel_id} already hosts a game")]
    ChannelOccupied { channel_id: String },

    #[error("game {game_id} has no usable head branch")]
    HeadBranchMissing { game_id: i64 },

    #[error("the current HEAD branch cannot be deleted")]
    CannotDeleteHead,

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Volatile cache persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read cache file: {0}")]
    Read(String),

    #[error("failed to write cache file: {0}")]
    Write(String),

    #[error("cache file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),

    #[error("预设 '{name}' 不存在")]
    PresetNotFound { name: String },

    #[error("该群已被用户 {owner} 绑定")]
    BindingHeld { owner: String },

    #[error("预设正在被群组使用: {}", .groups.join(", "))]
    PresetInUse { groups: Vec<String> },

    #[error("failed to decrypt stored API key")]
    DecryptionFailed,

    #[error("failed to encrypt API key")]
    EncryptionFailed,

    #[error("failed to persist presets: {0}")]
    Persist(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM completion errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no preset is bound for this channel")]
    NoPreset,

    #[error("provider rate limited the request")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("provider returned an empty completion")]
    EmptyCompletion,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Whether a failed attempt is worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::RateLimited | LlmError::Timeout | LlmError::Connection(_) => true,
            LlmError::Status { status, .. } => {
                *status == 429 || *status == 408 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Game orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("branch tip changed during advancement")]
    TipChanged,

    #[error("already at the first round")]
    AtInitialRound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Chat platform adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to send message: {0}")]
    Send(String),

    #[error("message {id} not found")]
    MessageNotFound { id: String },

    #[error("failed to look up member role: {0}")]
    RoleLookup(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
