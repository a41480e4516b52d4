//! Domain error types.

/// A parse error with position information, shared by the condition and
/// formula parsers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Failure of a single formula invocation inside the sandbox.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("formula rejected at position {position}: {reason}")]
    Rejected { reason: String, position: usize },

    #[error("formula exceeded the {limit_ms} ms time limit")]
    Timeout { limit_ms: u64 },

    #[error("formula exceeded the memory ceiling of {limit} bytes (would hold {requested})")]
    MemoryLimit { limit: usize, requested: usize },

    #[error("formula failed at runtime: {message}")]
    Runtime { message: String },

    #[error("formula output rejected: {reason}")]
    OutputContract { reason: String },
}

impl SandboxError {
    /// Stable machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Rejected { .. } => "rejected",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::MemoryLimit { .. } => "memory_limit",
            SandboxError::Runtime { .. } => "runtime",
            SandboxError::OutputContract { .. } => "output_contract",
        }
    }
}

impl From<ParseError> for SandboxError {
    fn from(err: ParseError) -> Self {
        SandboxError::Rejected {
            reason: err.message,
            position: err.position,
        }
    }
}

/// Top-level error type for stagetrader.
#[derive(Debug, thiserror::Error)]
pub enum StagetraderError {
    #[error("configuration error in {context}: {reason}")]
    Configuration { context: String, reason: String },

    #[error("indicator '{indicator}': {source}")]
    Sandbox {
        indicator: String,
        #[source]
        source: SandboxError,
    },

    #[error("simulation invariant violated for {instrument} at row {row} (stage {stage}): {reason}")]
    SimulationInvariant {
        instrument: String,
        row: usize,
        stage: usize,
        reason: String,
    },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    ConditionParse(#[from] ParseError),

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("no data for {instrument}")]
    NoData { instrument: String },

    #[error("insufficient data for {instrument}: have {bars} bars, need {minimum}")]
    InsufficientData {
        instrument: String,
        bars: usize,
        minimum: usize,
    },

    #[error("strategy document error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StagetraderError {
    pub fn config(context: impl Into<String>, reason: impl Into<String>) -> Self {
        StagetraderError::Configuration {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn data(reason: impl Into<String>) -> Self {
        StagetraderError::Data {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name of the error class, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            StagetraderError::Configuration { .. } => "configuration",
            StagetraderError::Sandbox { source, .. } => source.kind(),
            StagetraderError::SimulationInvariant { .. } => "simulation_invariant",
            StagetraderError::ConfigParse { .. }
            | StagetraderError::ConfigMissing { .. }
            | StagetraderError::ConfigInvalid { .. } => "run_config",
            StagetraderError::ConditionParse(_) => "condition_parse",
            StagetraderError::Data { .. }
            | StagetraderError::NoData { .. }
            | StagetraderError::InsufficientData { .. } => "data",
            StagetraderError::Json(_) => "strategy_document",
            StagetraderError::Io(_) => "io",
        }
    }
}

impl StagetraderError {
    /// Process exit status for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            StagetraderError::Io(_) => 1,
            StagetraderError::ConfigParse { .. }
            | StagetraderError::ConfigMissing { .. }
            | StagetraderError::ConfigInvalid { .. } => 2,
            StagetraderError::Data { .. }
            | StagetraderError::NoData { .. }
            | StagetraderError::InsufficientData { .. } => 3,
            StagetraderError::Configuration { .. }
            | StagetraderError::ConditionParse(_)
            | StagetraderError::Json(_) => 4,
            StagetraderError::Sandbox { .. } => 5,
            StagetraderError::SimulationInvariant { .. } => 6,
        }
    }
}

impl From<&StagetraderError> for std::process::ExitCode {
    fn from(err: &StagetraderError) -> Self {
        std::process::ExitCode::from(err.exit_code())
    }
}
