use std::fmt::{self, Write};
use thiserror::Error;

/// Formats an error and its entire source chain with each error on a new line
///
/// This produces output like:
/// ```text
/// Error message
///   Caused by: First cause
///   Caused by: Root cause
/// ```
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    write!(&mut output, "{}", err).ok();

    let mut source = err.source();
    while let Some(err) = source {
        write!(&mut output, "\n  Caused by: {}", err).ok();
        source = err.source();
    }

    output
}

/// Formats an anyhow::Error with its full chain
pub fn format_anyhow_chain(err: &anyhow::Error) -> String {
    let mut output = String::new();

    let chain: Vec<_> = err.chain().collect();

    if let Some((first, rest)) = chain.split_first() {
        write!(&mut output, "{}", first).ok();
        for cause in rest {
            write!(&mut output, "\n  Caused by: {}", cause).ok();
        }
    }

    output
}

/// Process-level error type for everything outside a single reconciliation
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Kubernetes config error: {0}")]
    KubernetesConfig(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// An ordered collection of independent failures.
///
/// Steps that must all be attempted (label patch, status patch, chart
/// lifecycle) push their errors here instead of returning early, so the
/// caller sees every cause rather than only the first.
#[derive(Debug)]
pub struct ErrorList<E> {
    errors: Vec<E>,
}

impl<E> Default for ErrorList<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E> ErrorList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    /// Records the error of `result`, if any, and hands back the success value.
    pub fn add<T>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.errors.iter()
    }
}

impl<E> IntoIterator for ErrorList<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<E> FromIterator<E> for ErrorList<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for ErrorList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_char('\n')?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error> std::error::Error for ErrorList<E> {}
