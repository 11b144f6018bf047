//! Typed error variants for every fallible operation in the engine, per the
//! error-kind list in `spec.md` §7.

use std::path::PathBuf;

use thiserror::Error;

/// Sub-kind of a plan violation: too many `TestLine`s relative to the
/// declared plan, or too few by end-of-stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanErrorKind {
    #[error("Number of planned tests ({planned}) exceeded")]
    Exceeded { planned: u32 },
    #[error("Number of executed tests ({ran}) less than the number of planned ({planned})")]
    Short { ran: u32, planned: u32 },
}

/// Errors raised while parsing one line of TAP output, or at end-of-stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TapError {
    #[error("Non-TAP input was encountered: \"{0}\"")]
    NotTap(String),
    #[error("Unexpected test number {found} expecting {expected}")]
    Numbering { expected: u32, found: u32 },
    #[error(transparent)]
    Plan(#[from] PlanErrorKind),
    #[error("Bail out!{}", .0.as_deref().map(|r| format!(" {r}")).unwrap_or_default())]
    BailOut(Option<String>),
}

/// Errors raised while constructing a `Case` (file missing/not executable).
#[derive(Error, Debug)]
pub enum CaseError {
    #[error("test case not executable: {0}")]
    NotExecutable(PathBuf),
}

/// Errors raised while loading a declarative suite file (or resolving a
/// top-level CLI token into a Case/Suite).
#[derive(Error, Debug)]
pub enum SuiteError {
    #[error("failed to read suite file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse suite file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("suite file {0} declares no tests")]
    Empty(PathBuf),
    #[error("{0} does not appear to be a test case or suite")]
    NotATest(PathBuf),
    #[error("including suite {path}")]
    SubSuite {
        path: PathBuf,
        #[source]
        source: Box<SuiteError>,
    },
    #[error(transparent)]
    Case(#[from] CaseError),
}

/// Raised when aggregating a `Case`'s executions into a `CaseResult`
/// observes disagreeing `planned` counts across the executions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("executions of the same case disagree on the planned count: {a} vs {b}")]
pub struct InconsistentPlan {
    pub a: u32,
    pub b: u32,
}
