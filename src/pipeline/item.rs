//! The unit-of-work protocol: jobs, work groups and their contexts.
//!
//! A pipeline is an ordered queue of [`PipelineItem`]s of exactly two kinds:
//!
//! - a **job**, whose [`JobWork`] is one deterministic computation over its
//!   declared inputs and prerequisite results, and
//! - a **work group**, whose [`GroupWork`] lazily produces an ordered list of
//!   child items the moment the executor dequeues it.
//!
//! The closed two-variant [`ItemWork`] is the only place the executor
//! distinguishes the kinds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::env::Env;

use super::outcome::JobOutput;
use super::state::State;

/// The designated failure channel for jobs and work groups.
///
/// `Failed` carries a human-readable message and makes the item terminally
/// `failed`; it covers both configuration/usage mistakes and expected-work
/// failures (a wrong solution, a rejected input). `Internal` is a defect in
/// the tool itself and aborts the whole run instead of being downgraded to a
/// per-item failure.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The item's declared purpose failed.
    #[error("{0}")]
    Failed(String),

    /// A defect in the tool; propagates past the executor.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WorkError {
    /// Builds a failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        WorkError::Failed(message.into())
    }
}

impl From<std::io::Error> for WorkError {
    fn from(err: std::io::Error) -> Self {
        WorkError::Internal(err.into())
    }
}

/// A reference to an earlier pipeline item, optionally under a lookup alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    /// Name of the referenced item.
    pub name: String,
    /// Name the depending job uses to fetch the result, defaults to `name`.
    pub alias: Option<String>,
}

impl Prerequisite {
    pub fn new(name: impl Into<String>) -> Self {
        Prerequisite {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Prerequisite {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// The name the result is looked up under.
    pub fn lookup_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// The work function of a single job.
///
/// Implementations must declare every file they read, either up front through
/// [`JobWork::inputs`] or during execution through [`JobContext::access`], so
/// the result cache can fingerprint the job and validate later hits.
pub trait JobWork {
    /// Stable kind tag; part of the cache fingerprint.
    fn kind(&self) -> &'static str;

    /// Constructor parameters; part of the cache fingerprint.
    fn params(&self) -> Vec<String>;

    /// Files whose content feeds the fingerprint, known before running.
    fn inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Executes the job. Invoked only when every prerequisite succeeded, and
    /// skipped entirely on a valid cache hit.
    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError>;
}

/// A composite whose children are unknown before expansion.
pub trait GroupWork {
    /// Produces the ordered child items. Called exactly once, when the
    /// executor dequeues the group; every earlier-queued item is terminal by
    /// then.
    fn create_jobs(&mut self, env: &Env) -> Result<Vec<PipelineItem>, WorkError>;

    /// Inspects aggregated child results after all children are terminal and
    /// may reject an otherwise all-succeeding group.
    fn evaluate(&mut self, ctx: &GroupContext<'_>) -> Result<(), WorkError> {
        let _ = ctx;
        Ok(())
    }

    /// Optional live progress line; the executor renders a default one when
    /// this returns `None`.
    fn status(&self, ctx: &GroupContext<'_>) -> Option<String> {
        let _ = ctx;
        None
    }
}

/// The two kinds of pipeline items.
pub enum ItemWork {
    Job(Box<dyn JobWork>),
    Group(Box<dyn GroupWork>),
}

/// One entry in the executor's queue.
pub struct PipelineItem {
    pub name: String,
    pub prerequisites: Vec<Prerequisite>,
    pub(crate) work: ItemWork,
}

impl PipelineItem {
    /// Creates a job item.
    pub fn job(name: impl Into<String>, work: impl JobWork + 'static) -> Self {
        PipelineItem {
            name: name.into(),
            prerequisites: Vec::new(),
            work: ItemWork::Job(Box::new(work)),
        }
    }

    /// Creates a work-group item.
    pub fn group(name: impl Into<String>, work: impl GroupWork + 'static) -> Self {
        PipelineItem {
            name: name.into(),
            prerequisites: Vec::new(),
            work: ItemWork::Group(Box::new(work)),
        }
    }

    /// Declares a prerequisite by name.
    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.prerequisites.push(Prerequisite::new(name));
        self
    }

    /// Declares a prerequisite fetched under an alias.
    pub fn after_as(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.prerequisites.push(Prerequisite::aliased(name, alias));
        self
    }
}

impl std::fmt::Debug for PipelineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.work {
            ItemWork::Job(_) => "job",
            ItemWork::Group(_) => "group",
        };
        f.debug_struct("PipelineItem")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("prerequisites", &self.prerequisites)
            .finish()
    }
}

/// Terminal record of a finished item.
#[derive(Debug, Clone)]
pub struct FinishedItem {
    pub state: State,
    pub output: Option<JobOutput>,
    pub message: Option<String>,
}

impl FinishedItem {
    pub fn succeeded(output: JobOutput) -> Self {
        FinishedItem {
            state: State::Succeeded,
            output: Some(output),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        FinishedItem {
            state: State::Failed,
            output: None,
            message: Some(message.into()),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        FinishedItem {
            state: State::Canceled,
            output: None,
            message: Some(message.into()),
        }
    }
}

/// Results of every item that reached a terminal state, keyed by name.
///
/// Names are required to be unique across one run; a duplicate is a defect in
/// the pipeline definition.
#[derive(Debug, Default)]
pub struct ResultRegistry {
    items: BTreeMap<String, FinishedItem>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal state of `name`, if it finished.
    pub fn state(&self, name: &str) -> Option<State> {
        self.items.get(name).map(|item| item.state)
    }

    /// Result of `name`, if it succeeded with an output.
    pub fn output(&self, name: &str) -> Option<&JobOutput> {
        self.items.get(name).and_then(|item| item.output.as_ref())
    }

    /// Failure or cancellation message of `name`.
    pub fn message(&self, name: &str) -> Option<&str> {
        self.items.get(name).and_then(|item| item.message.as_deref())
    }

    pub(crate) fn record(&mut self, name: &str, item: FinishedItem) -> Result<(), String> {
        if self.items.contains_key(name) {
            return Err(name.to_string());
        }
        self.items.insert(name.to_string(), item);
        Ok(())
    }
}

/// Execution context handed to a job's work function.
pub struct JobContext<'a> {
    registry: &'a ResultRegistry,
    prerequisites: &'a [Prerequisite],
    accessed: Vec<PathBuf>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(registry: &'a ResultRegistry, prerequisites: &'a [Prerequisite]) -> Self {
        JobContext {
            registry,
            prerequisites,
            accessed: Vec::new(),
        }
    }

    /// Fetches a prerequisite's result by its lookup name.
    ///
    /// The executor guarantees every prerequisite succeeded before the job
    /// runs, so a missing result is a defect in the pipeline definition.
    pub fn prerequisite(&self, name: &str) -> Result<&JobOutput, WorkError> {
        let prereq = self
            .prerequisites
            .iter()
            .find(|p| p.lookup_name() == name)
            .ok_or_else(|| {
                WorkError::Internal(anyhow::anyhow!("Undeclared prerequisite '{name}'"))
            })?;
        self.registry.output(&prereq.name).ok_or_else(|| {
            WorkError::Internal(anyhow::anyhow!(
                "Prerequisite '{}' has no recorded result",
                prereq.name
            ))
        })
    }

    /// Declares that the job read `path`, adding it to the access manifest.
    pub fn access(&mut self, path: impl Into<PathBuf>) {
        self.accessed.push(path.into());
    }

    /// Declares and reads a file in one step.
    pub fn read(&mut self, path: &Path) -> Result<Vec<u8>, WorkError> {
        self.access(path);
        std::fs::read(path)
            .map_err(|err| WorkError::failed(format!("Cannot read '{}': {err}", path.display())))
    }

    /// Files accessed during execution.
    pub(crate) fn accessed(&self) -> &[PathBuf] {
        &self.accessed
    }

    /// Recorded results of the declared prerequisites, in declared order.
    /// These feed the cache fingerprint: a job consuming a prerequisite's
    /// output must re-run when that output changes, even if no file it reads
    /// did.
    pub(crate) fn prerequisite_outputs(&self) -> Vec<(&str, &JobOutput)> {
        self.prerequisites
            .iter()
            .filter_map(|p| self.registry.output(&p.name).map(|out| (p.lookup_name(), out)))
            .collect()
    }
}

/// Aggregated child view handed to a group's `evaluate` and `status` hooks.
pub struct GroupContext<'a> {
    children: &'a [String],
    registry: &'a ResultRegistry,
}

impl<'a> GroupContext<'a> {
    pub(crate) fn new(children: &'a [String], registry: &'a ResultRegistry) -> Self {
        GroupContext { children, registry }
    }

    /// Child names in declared order.
    pub fn children(&self) -> &[String] {
        self.children
    }

    /// A child's state; `Pending` until it reaches a terminal state.
    pub fn child_state(&self, name: &str) -> State {
        self.registry.state(name).unwrap_or(State::Pending)
    }

    /// A child's result, if it succeeded.
    pub fn output(&self, name: &str) -> Option<&JobOutput> {
        self.registry.output(name)
    }

    /// Number of children in a terminal state.
    pub fn terminal_count(&self) -> usize {
        self.children
            .iter()
            .filter(|name| self.child_state(name).is_terminal())
            .count()
    }

    /// Whether every child reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.terminal_count() == self.children.len()
    }

    /// Whether any child failed.
    pub fn any_failed(&self) -> bool {
        self.children
            .iter()
            .any(|name| self.child_state(name) == State::Failed)
    }

    /// Displayed state derived purely from the children: `Failed` if any
    /// child failed, `Succeeded` once all succeeded, `Running` otherwise.
    pub fn aggregate_state(&self) -> State {
        if self.any_failed() {
            State::Failed
        } else if self
            .children
            .iter()
            .all(|name| self.child_state(name) == State::Succeeded)
        {
            State::Succeeded
        } else {
            State::Running
        }
    }

    /// Names of canceled children, in declared order.
    pub fn canceled_children(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|name| self.child_state(name) == State::Canceled)
            .cloned()
            .collect()
    }

    /// Failure messages of failed children, in declared order.
    pub fn failures(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|name| self.child_state(name) == State::Failed)
            .filter_map(|name| {
                self.registry
                    .message(name)
                    .map(|msg| format!("{name}: {msg}"))
            })
            .collect()
    }
}
