use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading the raw scenario XML document.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("cannot read scenario file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed XML in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },

    #[error("{path}: root element must be <scenario>, found <{found}>")]
    WrongRoot { path: PathBuf, found: String },

    #[error("{path}: <{tag}> is missing required attribute '{attr}'")]
    MissingAttribute {
        path: PathBuf,
        tag: String,
        attr: String,
    },
}

/// Errors raised while elaborating a [`crate::scenario::Scenario`] into a
/// [`crate::flow::ProcessFlow`].
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error("undefined parameter '${{{name}}}' referenced in scenario")]
    UndefinedParameter { name: String },

    #[error("parameter substitution for '{attr}' did not converge (possible self-reference: {value:?})")]
    ParameterCycle { attr: String, value: String },

    #[error("import cycle detected: {0}")]
    ImportCycle(String),

    #[error("cannot import {path}: {source}")]
    ImportIo {
        path: PathBuf,
        #[source]
        source: Box<ScenarioError>,
    },

    #[error("duplicate step or group name '{0}' after namespacing")]
    DuplicateName(String),

    #[error("'{dependent}' requires unknown step or group '{required}'")]
    UnresolvedDependency { dependent: String, required: String },

    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can surface out of the coordinator while a run is executing.
/// Unlike [`CompileError`], these do not abort the run — the affected step
/// simply transitions to `Failed` and scheduling continues.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to spawn step '{step}': {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open log file for step '{step}': {source}")]
    LogFile {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("status record I/O error: {0}")]
    Record(#[from] std::io::Error),
}
