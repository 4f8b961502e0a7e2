use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid deployment plan: {0}")]
    Plan(String),

    #[error("Duplicate task name: {0}")]
    DuplicateTaskName(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {task}: {from} -> {to}")]
    InvalidTaskTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Component already in progress: {0}")]
    DuplicateComponent(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Invalid component transition for {component}: {from} -> {to}")]
    InvalidComponentTransition {
        component: String,
        from: String,
        to: String,
    },

    #[error("Worker pool is full (max {max} workers)")]
    WorkerPoolFull { max: usize },

    #[error("Failed to delete {resource}: {reason}")]
    DeleteFailed { resource: String, reason: String },

    #[error("Cleanup requires confirmation")]
    CleanupNotConfirmed,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors that are detected before any task runs and abort the whole run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::Plan(_)
                | Error::DuplicateTaskName(_)
                | Error::UnknownDependency { .. }
                | Error::CyclicDependency { .. }
                | Error::TomlParse(_)
        )
    }

    /// Process exit code for the CLI.
    ///
    /// Execution failures are reported through `RunReport`, not through
    /// `Error`, so anything that is not a configuration problem maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_configuration() => 2,
            Error::CleanupNotConfirmed => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
