//! Pipeline assembly for one task.
//!
//! Turns a task configuration into the top-level item list the executor
//! runs: one build group, one data group, then one group per solution with
//! the primary solution first. Non-primary groups are judged against the
//! primary's outputs, so they additionally wait on the primary group and are
//! canceled when it fails; apart from that, solution groups stay independent
//! and one bad solution does not keep the rest from being tested.

use std::path::Path;

use anyhow::bail;

use crate::env::{Env, EnvValue};
use crate::pipeline::{PipelineItem, Verdict};
use crate::storage::StateDir;

use super::build::BuildGroup;
use super::data::DataGroup;
use super::solution::SolutionGroup;

pub const BUILD_GROUP: &str = "Build programs";
pub const DATA_GROUP: &str = "Generate inputs";

/// One declared solution, as read from the configuration.
struct DeclaredSolution {
    name: String,
    source: String,
    expected: Option<Verdict>,
    primary: bool,
}

fn parse_solutions(env: &Env) -> anyhow::Result<Vec<DeclaredSolution>> {
    let mut declared: Vec<DeclaredSolution> = Vec::new();
    for value in env.get_list("solutions")? {
        let Some(solution) = value.as_env() else {
            bail!("Each solution must be a mapping with 'name' and 'source'");
        };
        let name = solution.get_str("name")?.to_string();
        if declared.iter().any(|s| s.name == name) {
            bail!("Solution '{name}' is declared twice");
        }
        let source = solution.get_str("source")?.to_string();
        let expected = match solution.opt("expected") {
            Some(EnvValue::Str(verdict)) => Some(
                verdict
                    .parse::<Verdict>()
                    .map_err(|err| anyhow::anyhow!("Solution '{name}': {err}"))?,
            ),
            Some(other) => bail!(
                "Solution '{name}': 'expected' is {}, expected a string",
                other.type_name()
            ),
            None => None,
        };
        let primary = match solution.opt("primary") {
            Some(EnvValue::Bool(flag)) => *flag,
            Some(other) => bail!(
                "Solution '{name}': 'primary' is {}, expected a boolean",
                other.type_name()
            ),
            None => false,
        };
        declared.push(DeclaredSolution {
            name,
            source,
            expected,
            primary,
        });
    }
    Ok(declared)
}

/// Builds the top-level pipeline for the task rooted at `task_dir`.
pub fn build_pipeline(
    env: &Env,
    task_dir: &Path,
    state: &StateDir,
) -> anyhow::Result<Vec<PipelineItem>> {
    let declared = parse_solutions(env)?;
    if declared.is_empty() {
        bail!("At least one solution must be declared");
    }
    let flagged: Vec<usize> = declared
        .iter()
        .enumerate()
        .filter(|(_, s)| s.primary)
        .map(|(i, _)| i)
        .collect();
    let primary_idx = match flagged.as_slice() {
        [] => 0,
        [idx] => *idx,
        _ => bail!("More than one solution is marked primary"),
    };
    let primary = declared[primary_idx].name.clone();
    if let Some(expected) = declared[primary_idx].expected {
        if expected != Verdict::Ok {
            bail!("Primary solution '{primary}' cannot expect {expected}");
        }
    }

    let mut items = vec![
        PipelineItem::group(
            BUILD_GROUP,
            BuildGroup::new(task_dir.to_path_buf(), state.build_dir()),
        ),
        PipelineItem::group(DATA_GROUP, DataGroup::new(state.build_dir(), state.inputs_dir()))
            .after(BUILD_GROUP),
    ];

    let order = std::iter::once(primary_idx)
        .chain((0..declared.len()).filter(|i| *i != primary_idx));
    for idx in order {
        let solution = &declared[idx];
        let mut item = PipelineItem::group(
            format!("Test solution {}", solution.name),
            SolutionGroup::new(
                solution.name.clone(),
                solution.source.clone(),
                solution.expected,
                idx == primary_idx,
                primary.clone(),
                state.build_dir(),
                state.inputs_dir(),
                state.outputs_dir(),
            ),
        )
        .after(DATA_GROUP);
        // Judging a non-primary solution reads the primary's outputs as the
        // reference, so a failed primary cancels the comparisons instead of
        // judging against garbage.
        if idx != primary_idx {
            item = item.after(format!("Test solution {primary}"));
        }
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution(name: &str, source: &str, primary: bool, expected: Option<&str>) -> EnvValue {
        let mut env = Env::new();
        env.set("name", EnvValue::Str(name.into()));
        env.set("source", EnvValue::Str(source.into()));
        if primary {
            env.set("primary", EnvValue::Bool(true));
        }
        if let Some(verdict) = expected {
            env.set("expected", EnvValue::Str(verdict.into()));
        }
        EnvValue::Nested(env)
    }

    fn task_env(solutions: Vec<EnvValue>) -> Env {
        let mut env = Env::new();
        env.set("name", EnvValue::Str("sum".into()));
        env.set("generator", EnvValue::Str("gen.cpp".into()));
        env.set("test_groups", EnvValue::List(vec![EnvValue::Str("01".into())]));
        env.set("solutions", EnvValue::List(solutions));
        env
    }

    #[test]
    fn test_pipeline_layout_puts_primary_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let env = task_env(vec![
            solution("slow", "slow.cpp", false, Some("timeout")),
            solution("solve", "solve.cpp", true, None),
        ]);

        let items = build_pipeline(&env, dir.path(), &state).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Build programs",
                "Generate inputs",
                "Test solution solve",
                "Test solution slow",
            ]
        );
        // The primary depends on input generation only; the others also wait
        // on the primary, whose outputs they are judged against.
        let prereqs_of = |item: &PipelineItem| -> Vec<String> {
            item.prerequisites.iter().map(|p| p.name.clone()).collect()
        };
        assert_eq!(prereqs_of(&items[2]), vec![DATA_GROUP]);
        assert_eq!(
            prereqs_of(&items[3]),
            vec![DATA_GROUP.to_string(), "Test solution solve".to_string()]
        );
    }

    #[test]
    fn test_first_solution_is_default_primary() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let env = task_env(vec![
            solution("solve", "solve.cpp", false, None),
            solution("slow", "slow.cpp", false, Some("timeout")),
        ]);

        let items = build_pipeline(&env, dir.path(), &state).unwrap();
        assert_eq!(items[2].name, "Test solution solve");
    }

    #[test]
    fn test_configuration_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();

        let empty = task_env(vec![]);
        assert!(build_pipeline(&empty, dir.path(), &state).is_err());

        let duplicated = task_env(vec![
            solution("solve", "a.cpp", true, None),
            solution("solve", "b.cpp", false, None),
        ]);
        assert!(build_pipeline(&duplicated, dir.path(), &state).is_err());

        let two_primaries = task_env(vec![
            solution("a", "a.cpp", true, None),
            solution("b", "b.cpp", true, None),
        ]);
        assert!(build_pipeline(&two_primaries, dir.path(), &state).is_err());

        let bad_verdict = task_env(vec![solution("a", "a.cpp", true, Some("fast"))]);
        assert!(build_pipeline(&bad_verdict, dir.path(), &state).is_err());

        let failing_primary = task_env(vec![solution("a", "a.cpp", true, Some("timeout"))]);
        assert!(build_pipeline(&failing_primary, dir.path(), &state).is_err());
    }
}
