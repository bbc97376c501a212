use std::path::Path;

use serde::Serialize;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or an artifact that failed verification.
    Validation,
    /// Unreachable origin, timeout or unexpected HTTP status.
    Network,
    /// Permission, lock or missing path.
    FileSystem,
    /// Patch application failed or the installed tree is incomplete.
    Install,
    /// Another installation already holds the single-flight guard.
    Busy,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::FileSystem => "filesystem",
            Self::Install => "install",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Error carried across the core.
///
/// Built at the lowest layer that knows what went wrong, then enriched with
/// [`CoreError::context`] as it travels up. Enrichment prepends to the user
/// message and never changes the kind.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    user_message: String,
    technical_detail: Option<String>,
    source: Option<BoxedSource>,
}

/// Serializable form of a [`CoreError`] for structured error events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub technical: Option<String>,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: ErrorKind, user_message: impl Into<String>) -> Self {
        Self {
            kind,
            user_message: user_message.into(),
            technical_detail: None,
            source: None,
        }
    }

    pub fn validation(user_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, user_message)
    }

    pub fn network(user_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, user_message)
    }

    pub fn install(user_message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Install, user_message)
    }

    pub fn busy() -> Self {
        Self::new(ErrorKind::Busy, "installation already in progress")
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("{operation} was cancelled"))
    }

    pub fn http(context: &str, source: reqwest::Error) -> Self {
        let kind = if source.is_decode() {
            ErrorKind::Validation
        } else {
            ErrorKind::Network
        };
        Self::new(kind, context).with_source(source)
    }

    pub fn io(context: &str, source: std::io::Error) -> Self {
        Self::new(ErrorKind::FileSystem, context).with_source(source)
    }

    pub fn io_at(context: &str, path: &Path, source: std::io::Error) -> Self {
        Self::new(ErrorKind::FileSystem, format!("{context}: {}", path.display()))
            .with_source(source)
    }

    pub fn zip(context: &str, source: zip::result::ZipError) -> Self {
        Self::new(ErrorKind::Validation, context).with_source(source)
    }

    pub fn json(context: &str, source: serde_json::Error) -> Self {
        Self::new(ErrorKind::Validation, context).with_source(source)
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if self.technical_detail.is_none() {
            self.technical_detail = Some(source.to_string());
        }
        self.source = Some(Box::new(source));
        self
    }

    /// Prepend operation context to the user-facing message.
    #[must_use]
    pub fn context(mut self, context: impl std::fmt::Display) -> Self {
        self.user_message = format!("{context}: {}", self.user_message);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    #[must_use]
    pub fn technical_detail(&self) -> Option<&str> {
        self.technical_detail.as_deref()
    }

    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind,
            message: self.user_message.clone(),
            technical: self.technical_detail.clone(),
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.technical_detail {
            Some(detail) => write!(f, "{}: {detail}", self.user_message),
            None => f.write_str(&self.user_message),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

pub trait ResultExt<T> {
    /// Attach step context to the error side of a core result.
    ///
    /// # Errors
    /// Returns the original error, enriched with `context`.
    fn context(self, context: impl std::fmt::Display) -> CoreResult<T>;
}

impl<T> ResultExt<T> for CoreResult<T> {
    fn context(self, context: impl std::fmt::Display) -> CoreResult<T> {
        self.map_err(|error| error.context(context))
    }
}
