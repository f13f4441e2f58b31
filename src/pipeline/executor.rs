//! The pipeline executor.
//!
//! Drives a FIFO queue seeded with the top-level ordered list of work groups
//! and jobs. Popping a group expands it just-in-time and splices its children
//! directly after it (depth-first, preserving declared order); popping a job
//! runs it through the result cache. After every iteration the in-flight
//! groups are re-assessed: ready ones are finalized, failures either stop the
//! run (fail-fast) or are accumulated (full mode).
//!
//! Execution is strictly sequential; the executor never overlaps two jobs.

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheError, ResultCache};
use crate::env::{Env, EnvError};

use super::item::{
    FinishedItem, GroupContext, GroupWork, ItemWork, JobContext, JobWork, PipelineItem,
    Prerequisite, ResultRegistry, WorkError,
};
use super::state::State;
use super::status::StatusRenderer;

/// Internal faults that abort a run. Per-item failures never surface here;
/// they become terminal `failed` states instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Environment misuse (forking a locked environment).
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    /// Result-cache storage fault.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Two pipeline items were given the same name.
    #[error("Duplicate pipeline item name '{0}'")]
    DuplicateName(String),

    /// An executor was driven past its one permitted run.
    #[error("Executor has already run")]
    AlreadyRan,

    /// A defect raised by an item outside the designated failure channel.
    #[error("Internal fault in '{item}': {source}")]
    Internal {
        item: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Run options, passed in explicitly; there is no process-wide mode state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    /// Keep going after failures and report all of them at the end.
    pub full: bool,
    /// Rewrite progress lines with ANSI cursor movement.
    pub ansi: bool,
}

/// Lifecycle of the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    CompletedSuccess,
    CompletedWithFailures,
}

/// A work group that has been expanded and awaits finalization.
struct ActiveGroup {
    name: String,
    work: Box<dyn GroupWork>,
    children: Vec<String>,
}

/// What the assessment of an in-flight group decided.
enum Disposition {
    /// A child failed while siblings are still pending; stop issuing work.
    FailFast {
        ongoing: String,
        failures: Vec<String>,
    },
    /// All children terminal (or one failed); the group is done.
    Finalized {
        state: State,
        message: Option<String>,
        failures: Vec<String>,
    },
    /// Children still outstanding.
    InProgress,
}

/// Outcome of gating an item on its prerequisites.
enum Gate {
    Ready,
    Cancel(String),
    Fail(String),
}

/// Sequential pipeline executor.
pub struct Executor {
    queue: VecDeque<PipelineItem>,
    groups: VecDeque<ActiveGroup>,
    registry: ResultRegistry,
    renderer: StatusRenderer,
    options: ExecutorOptions,
    /// Names claimed by some expanded group; failures of these surface
    /// through their group, not directly.
    owned: BTreeSet<String>,
    state: ExecutorState,
    failed: bool,
}

impl Executor {
    /// Creates an executor over the top-level ordered item list.
    pub fn new(items: Vec<PipelineItem>, options: ExecutorOptions) -> Self {
        Executor {
            queue: items.into(),
            groups: VecDeque::new(),
            registry: ResultRegistry::new(),
            renderer: StatusRenderer::new(options.ansi),
            options,
            owned: BTreeSet::new(),
            state: ExecutorState::Idle,
            failed: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Terminal results recorded so far, for reporting and tests.
    pub fn registry(&self) -> &ResultRegistry {
        &self.registry
    }

    /// Runs the pipeline to completion (or to the first failure outside full
    /// mode). Returns whether the overall run failed; mapping that to a
    /// process exit code is the caller's concern.
    pub fn run(&mut self, env: &Env, cache: &mut ResultCache) -> Result<bool, PipelineError> {
        if self.state != ExecutorState::Idle {
            return Err(PipelineError::AlreadyRan);
        }
        self.state = ExecutorState::Running;

        while !self.queue.is_empty() || !self.groups.is_empty() {
            if let Some(item) = self.queue.pop_front() {
                match item.work {
                    ItemWork::Group(work) => {
                        self.expand_group(item.name, item.prerequisites, work, env)?
                    }
                    ItemWork::Job(work) => {
                        self.run_job(item.name, item.prerequisites, work, cache)?
                    }
                }
            }

            let clean = self.status_update()?;
            self.failed |= !clean;
            if self.failed && !self.options.full {
                // Already-queued items are left pending; they are implicitly
                // canceled for this run.
                break;
            }
        }

        let export = cache.export()?;
        debug!(
            kept = export.kept,
            dropped = export.dropped,
            "exported result cache"
        );

        self.state = if self.failed {
            ExecutorState::CompletedWithFailures
        } else {
            ExecutorState::CompletedSuccess
        };
        Ok(self.failed)
    }

    /// Checks an item's prerequisites against the registry.
    fn gate(&self, name: &str, prerequisites: &[Prerequisite]) -> Gate {
        for prereq in prerequisites {
            match self.registry.state(&prereq.name) {
                Some(State::Succeeded) => {}
                Some(state) => {
                    return Gate::Cancel(format!(
                        "Canceled because prerequisite '{}' {}",
                        prereq.name, state
                    ));
                }
                _ => {
                    return Gate::Fail(format!(
                        "Prerequisite '{}' of '{}' never ran; it must be declared earlier \
                         in the pipeline",
                        prereq.name, name
                    ));
                }
            }
        }
        Gate::Ready
    }

    fn expand_group(
        &mut self,
        name: String,
        prerequisites: Vec<Prerequisite>,
        mut work: Box<dyn GroupWork>,
        env: &Env,
    ) -> Result<(), PipelineError> {
        match self.gate(&name, &prerequisites) {
            Gate::Cancel(message) => {
                self.record(&name, FinishedItem::canceled(message))?;
                self.renderer.print(&format!("{name}: canceled"));
            }
            Gate::Fail(message) => {
                self.record(&name, FinishedItem::failed(message.clone()))?;
                self.note_failure(&name, &message);
            }
            Gate::Ready => {
                let forked = env.fork()?;
                match work.create_jobs(&forked) {
                    Ok(children) => {
                        let names: Vec<String> =
                            children.iter().map(|child| child.name.clone()).collect();
                        debug!(group = %name, children = names.len(), "expanded work group");
                        self.owned.extend(names.iter().cloned());
                        for child in children.into_iter().rev() {
                            self.queue.push_front(child);
                        }
                        self.groups.push_back(ActiveGroup {
                            name,
                            work,
                            children: names,
                        });
                    }
                    Err(WorkError::Failed(message)) => {
                        self.record(&name, FinishedItem::failed(message.clone()))?;
                        self.note_failure(&name, &message);
                    }
                    Err(WorkError::Internal(source)) => {
                        return Err(PipelineError::Internal { item: name, source });
                    }
                }
            }
        }
        Ok(())
    }

    fn run_job(
        &mut self,
        name: String,
        prerequisites: Vec<Prerequisite>,
        mut work: Box<dyn JobWork>,
        cache: &mut ResultCache,
    ) -> Result<(), PipelineError> {
        match self.gate(&name, &prerequisites) {
            Gate::Cancel(message) => {
                debug!(job = %name, "canceled");
                self.record(&name, FinishedItem::canceled(message))?;
                if !self.owned.contains(&name) {
                    self.renderer.print(&format!("{name}: canceled"));
                }
            }
            Gate::Fail(message) => {
                self.record(&name, FinishedItem::failed(message.clone()))?;
                self.note_failure(&name, &message);
            }
            Gate::Ready => {
                debug!(job = %name, "running");
                let result = {
                    let mut ctx = JobContext::new(&self.registry, &prerequisites);
                    cache.lookup_or_run(&name, work.as_mut(), &mut ctx)
                };
                match result {
                    Ok(output) => {
                        self.record(&name, FinishedItem::succeeded(output))?;
                    }
                    Err(WorkError::Failed(message)) => {
                        self.record(&name, FinishedItem::failed(message.clone()))?;
                        self.note_failure(&name, &message);
                    }
                    Err(WorkError::Internal(source)) => {
                        return Err(PipelineError::Internal { item: name, source });
                    }
                }
            }
        }
        Ok(())
    }

    /// Handles a failure of an item no group claims: print it now, since no
    /// group finalization will.
    fn note_failure(&mut self, name: &str, message: &str) {
        if !self.owned.contains(name) {
            self.renderer.error(&format!("{name}: {message}"));
            self.failed = true;
        }
    }

    fn record(&mut self, name: &str, item: FinishedItem) -> Result<(), PipelineError> {
        self.registry
            .record(name, item)
            .map_err(PipelineError::DuplicateName)
    }

    /// Re-assesses in-flight groups: finalizes every ready one (children
    /// first, so nested groups unblock their parents) and reports failures.
    /// Returns `false` when a failure was found this iteration.
    fn status_update(&mut self) -> Result<bool, PipelineError> {
        self.renderer.clear_tmp();

        loop {
            let mut progressed = false;
            let mut failure = false;
            let mut remaining = VecDeque::with_capacity(self.groups.len());

            while let Some(mut group) = self.groups.pop_front() {
                if failure {
                    remaining.push_back(group);
                    continue;
                }
                match self.assess_group(&mut group)? {
                    Disposition::FailFast { ongoing, failures } => {
                        self.renderer.print(&ongoing);
                        for line in &failures {
                            self.renderer.error(line);
                        }
                        progressed = true;
                        failure = true;
                    }
                    Disposition::Finalized {
                        state,
                        message,
                        failures,
                    } => {
                        self.record(
                            &group.name,
                            FinishedItem {
                                state,
                                output: None,
                                message: message.clone(),
                            },
                        )?;
                        self.renderer.print(&format!("{}: {}", group.name, state));
                        if state == State::Failed {
                            for line in &failures {
                                self.renderer.error(line);
                            }
                            if let Some(msg) = &message {
                                self.renderer.error(&format!("{}: {}", group.name, msg));
                            }
                            failure = true;
                        }
                        progressed = true;
                    }
                    Disposition::InProgress => remaining.push_back(group),
                }
            }

            self.groups = remaining;
            if failure {
                return Ok(false);
            }
            if !progressed {
                break;
            }
        }

        // Temporary lines: frontmost in-flight group plus the active job.
        let ongoing = self.groups.front().map(|group| {
            let ctx = GroupContext::new(&group.children, &self.registry);
            group.work.status(&ctx).unwrap_or_else(|| {
                format!(
                    "{} {}/{}",
                    group.name,
                    ctx.terminal_count(),
                    group.children.len()
                )
            })
        });
        if let Some(line) = ongoing {
            self.renderer.print_tmp(&line);
        }
        let active = self.queue.front().map(|item| item.name.clone());
        if let Some(name) = active {
            self.renderer.print_tmp(&format!("Active job: {name}"));
        }
        Ok(true)
    }

    fn assess_group(&self, group: &mut ActiveGroup) -> Result<Disposition, PipelineError> {
        let ctx = GroupContext::new(&group.children, &self.registry);

        if !self.options.full && ctx.any_failed() && !ctx.all_terminal() {
            let ongoing = group.work.status(&ctx).unwrap_or_else(|| {
                format!(
                    "{} {}/{}",
                    group.name,
                    ctx.terminal_count(),
                    group.children.len()
                )
            });
            return Ok(Disposition::FailFast {
                ongoing,
                failures: ctx.failures(),
            });
        }
        if !ctx.all_terminal() {
            return Ok(Disposition::InProgress);
        }

        let failures = ctx.failures();
        if ctx.any_failed() {
            return Ok(Disposition::Finalized {
                state: State::Failed,
                message: None,
                failures,
            });
        }
        let canceled = ctx.canceled_children();
        if !canceled.is_empty() {
            return Ok(Disposition::Finalized {
                state: State::Failed,
                message: Some(format!("Children never ran: {}", canceled.join(", "))),
                failures,
            });
        }
        match group.work.evaluate(&ctx) {
            Ok(()) => Ok(Disposition::Finalized {
                state: State::Succeeded,
                message: None,
                failures,
            }),
            Err(WorkError::Failed(message)) => Ok(Disposition::Finalized {
                state: State::Failed,
                message: Some(message),
                failures,
            }),
            Err(WorkError::Internal(source)) => Err(PipelineError::Internal {
                item: group.name.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobOutput;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// A job that records its execution into a shared log.
    struct RecordingJob {
        name: String,
        fail: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl JobWork for RecordingJob {
        fn kind(&self) -> &'static str {
            "test-job"
        }

        fn params(&self) -> Vec<String> {
            vec![self.name.clone()]
        }

        fn run(&mut self, _ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
            self.log.borrow_mut().push(self.name.clone());
            if self.fail {
                Err(WorkError::failed(format!("{} broke", self.name)))
            } else {
                Ok(JobOutput::Unit)
            }
        }
    }

    /// A group expanding to a preset child list.
    struct StaticGroup {
        children: Option<Vec<PipelineItem>>,
        expanded: Rc<Cell<bool>>,
        eval_failure: Option<String>,
    }

    impl StaticGroup {
        fn new(children: Vec<PipelineItem>) -> Self {
            StaticGroup {
                children: Some(children),
                expanded: Rc::new(Cell::new(false)),
                eval_failure: None,
            }
        }
    }

    impl GroupWork for StaticGroup {
        fn create_jobs(&mut self, _env: &Env) -> Result<Vec<PipelineItem>, WorkError> {
            self.expanded.set(true);
            Ok(self.children.take().unwrap_or_default())
        }

        fn evaluate(&mut self, _ctx: &GroupContext<'_>) -> Result<(), WorkError> {
            match &self.eval_failure {
                Some(message) => Err(WorkError::failed(message.clone())),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                log: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn job(&self, name: &str) -> PipelineItem {
            PipelineItem::job(
                name,
                RecordingJob {
                    name: name.to_string(),
                    fail: false,
                    log: Rc::clone(&self.log),
                },
            )
        }

        fn failing_job(&self, name: &str) -> PipelineItem {
            PipelineItem::job(
                name,
                RecordingJob {
                    name: name.to_string(),
                    fail: true,
                    log: Rc::clone(&self.log),
                },
            )
        }

        fn executed(&self) -> Vec<String> {
            self.log.borrow().clone()
        }
    }

    fn run_pipeline(items: Vec<PipelineItem>, full: bool) -> (bool, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new();
        let mut cache = ResultCache::open(dir.path()).unwrap();
        let mut executor = Executor::new(items, ExecutorOptions { full, ansi: false });
        let failed = executor.run(&env, &mut cache).unwrap();
        (failed, executor)
    }

    #[test]
    fn test_cancellation_propagates_forward() {
        let h = Harness::new();
        let items = vec![
            h.failing_job("a"),
            h.job("b").after("a"),
            h.job("c").after("b"),
        ];
        let (failed, executor) = run_pipeline(items, true);

        assert!(failed);
        let registry = executor.registry();
        assert_eq!(registry.state("a"), Some(State::Failed));
        assert_eq!(registry.state("b"), Some(State::Canceled));
        assert_eq!(registry.state("c"), Some(State::Canceled));
        // Canceled work functions are never invoked.
        assert_eq!(h.executed(), vec!["a"]);
    }

    #[test]
    fn test_fail_fast_stops_issuing_work() {
        let h = Harness::new();
        let items = vec![h.job("a"), h.failing_job("b"), h.job("c")];
        let (failed, executor) = run_pipeline(items, false);

        assert!(failed);
        assert_eq!(h.executed(), vec!["a", "b"]);
        // "c" was left pending, implicitly canceled.
        assert_eq!(executor.registry().state("c"), None);
        assert_eq!(executor.state(), ExecutorState::CompletedWithFailures);
    }

    #[test]
    fn test_full_mode_runs_everything() {
        let h = Harness::new();
        let items = vec![h.job("a"), h.failing_job("b"), h.job("c")];
        let (failed, executor) = run_pipeline(items, true);

        assert!(failed);
        assert_eq!(h.executed(), vec!["a", "b", "c"]);
        assert_eq!(executor.registry().state("c"), Some(State::Succeeded));
    }

    #[test]
    fn test_group_aggregates_children() {
        let h = Harness::new();
        let group = StaticGroup::new(vec![h.job("x"), h.job("y")]);
        let (failed, executor) = run_pipeline(vec![PipelineItem::group("G", group)], false);

        assert!(!failed);
        assert_eq!(executor.registry().state("G"), Some(State::Succeeded));
        assert_eq!(executor.state(), ExecutorState::CompletedSuccess);
    }

    #[test]
    fn test_group_fails_when_any_child_fails() {
        let h = Harness::new();
        let group = StaticGroup::new(vec![h.job("x"), h.failing_job("y")]);
        let (failed, executor) = run_pipeline(vec![PipelineItem::group("G", group)], true);

        assert!(failed);
        assert_eq!(executor.registry().state("G"), Some(State::Failed));
    }

    #[test]
    fn test_group_canceled_before_expansion() {
        let h = Harness::new();
        let group = StaticGroup::new(vec![h.job("x")]);
        let expanded = Rc::clone(&group.expanded);
        let items = vec![
            h.failing_job("setup"),
            PipelineItem::group("G", group).after("setup"),
        ];
        let (failed, executor) = run_pipeline(items, true);

        assert!(failed);
        assert_eq!(executor.registry().state("G"), Some(State::Canceled));
        // Children were never created.
        assert!(!expanded.get());
        assert_eq!(executor.registry().state("x"), None);
    }

    #[test]
    fn test_evaluate_rejects_succeeding_group() {
        let h = Harness::new();
        let mut group = StaticGroup::new(vec![h.job("x")]);
        group.eval_failure = Some("totals do not match".to_string());
        let (failed, executor) = run_pipeline(vec![PipelineItem::group("G", group)], false);

        assert!(failed);
        assert_eq!(executor.registry().state("G"), Some(State::Failed));
        assert_eq!(executor.registry().state("x"), Some(State::Succeeded));
        assert_eq!(
            executor.registry().message("G"),
            Some("totals do not match")
        );
    }

    #[test]
    fn test_compile_and_run_scenario_full_mode() {
        let h = Harness::new();
        let group = StaticGroup::new(vec![
            h.failing_job("Compile"),
            h.job("RunOnInputA").after("Compile"),
            h.job("RunOnInputB").after("Compile"),
        ]);
        let (failed, executor) = run_pipeline(vec![PipelineItem::group("Compile+Run", group)], true);

        assert!(failed);
        let registry = executor.registry();
        assert_eq!(registry.state("RunOnInputA"), Some(State::Canceled));
        assert_eq!(registry.state("RunOnInputB"), Some(State::Canceled));
        assert_eq!(registry.state("Compile+Run"), Some(State::Failed));
        assert_eq!(h.executed(), vec!["Compile"]);
    }

    #[test]
    fn test_compile_and_run_scenario_fail_fast() {
        let h = Harness::new();
        let group = StaticGroup::new(vec![
            h.failing_job("Compile"),
            h.job("RunOnInputA").after("Compile"),
            h.job("RunOnInputB").after("Compile"),
        ]);
        let (failed, _) = run_pipeline(vec![PipelineItem::group("Compile+Run", group)], false);

        assert!(failed);
        assert_eq!(h.executed(), vec!["Compile"]);
    }

    #[test]
    fn test_depth_first_expansion_order() {
        let h = Harness::new();
        let sub = StaticGroup::new(vec![h.job("s1"), h.job("s2")]);
        let g1 = StaticGroup::new(vec![
            h.job("a"),
            PipelineItem::group("Sub", sub),
            h.job("b"),
        ]);
        let g2 = StaticGroup::new(vec![h.job("z")]);
        let items = vec![PipelineItem::group("G1", g1), PipelineItem::group("G2", g2)];
        let (failed, executor) = run_pipeline(items, false);

        assert!(!failed);
        assert_eq!(h.executed(), vec!["a", "s1", "s2", "b", "z"]);
        // The nested group finalized before its parent could.
        assert_eq!(executor.registry().state("Sub"), Some(State::Succeeded));
        assert_eq!(executor.registry().state("G1"), Some(State::Succeeded));
    }

    #[test]
    fn test_three_independent_groups_full_mode() {
        let h = Harness::new();
        let items = vec![
            PipelineItem::group("S1", StaticGroup::new(vec![h.job("r1")])),
            PipelineItem::group("S2", StaticGroup::new(vec![h.failing_job("r2")])),
            PipelineItem::group("S3", StaticGroup::new(vec![h.job("r3")])),
        ];
        let (failed, executor) = run_pipeline(items, true);

        assert!(failed);
        assert_eq!(h.executed(), vec!["r1", "r2", "r3"]);
        let registry = executor.registry();
        assert_eq!(registry.state("S1"), Some(State::Succeeded));
        assert_eq!(registry.state("S2"), Some(State::Failed));
        assert_eq!(registry.state("S3"), Some(State::Succeeded));
    }

    #[test]
    fn test_executor_runs_only_once() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new();
        let mut cache = ResultCache::open(dir.path()).unwrap();
        let mut executor = Executor::new(vec![h.job("a")], ExecutorOptions::default());

        assert_eq!(executor.state(), ExecutorState::Idle);
        executor.run(&env, &mut cache).unwrap();
        assert!(matches!(
            executor.run(&env, &mut cache),
            Err(PipelineError::AlreadyRan)
        ));
    }

    #[test]
    fn test_duplicate_names_are_a_defect() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new();
        let mut cache = ResultCache::open(dir.path()).unwrap();
        let mut executor = Executor::new(
            vec![h.job("same"), h.job("same")],
            ExecutorOptions { full: true, ansi: false },
        );

        assert!(matches!(
            executor.run(&env, &mut cache),
            Err(PipelineError::DuplicateName(_))
        ));
    }
}
