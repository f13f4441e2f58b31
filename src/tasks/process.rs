//! External program execution with a wall-clock limit.
//!
//! Every task program (generator, validator, solution, checker) runs through
//! [`ProgramRun`]: file-redirected stdin/stdout, discarded stderr and a
//! polled deadline after which the process is killed. Exceeding the limit or
//! dying on a signal is an *outcome*, not an error; only failures to start
//! the process at all surface as `io::Error`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::pipeline::RunOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for one supervised program execution.
pub struct ProgramRun {
    binary: PathBuf,
    args: Vec<String>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    time_limit: Option<Duration>,
}

impl ProgramRun {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        ProgramRun {
            binary: binary.into(),
            args: Vec::new(),
            stdin: None,
            stdout: None,
            time_limit: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Redirects standard input from a file.
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Captures standard output into a file.
    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Kills the process once it has run for this long.
    pub fn time_limit_ms(mut self, millis: u64) -> Self {
        self.time_limit = Some(Duration::from_millis(millis));
        self
    }

    /// Spawns the program and waits for it to finish or exceed its limit.
    pub fn run(self) -> io::Result<RunOutcome> {
        let mut command = Command::new(&self.binary);
        command.args(&self.args).stderr(Stdio::null());

        match &self.stdin {
            Some(path) => command.stdin(Stdio::from(File::open(path)?)),
            None => command.stdin(Stdio::null()),
        };
        match &self.stdout {
            Some(path) => command.stdout(Stdio::from(File::create(path)?)),
            None => command.stdout(Stdio::null()),
        };

        let start = Instant::now();
        let mut child = command.spawn()?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = self.time_limit {
                if start.elapsed() >= limit {
                    // Best effort; the process may have exited in between.
                    let _ = child.kill();
                    child.wait()?;
                    let outcome = RunOutcome::timeout(limit.as_millis() as u64);
                    return Ok(self.attach_stdout(outcome));
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let elapsed = start.elapsed().as_millis() as u64;
        let outcome = match status.code() {
            Some(0) => RunOutcome::ok(elapsed),
            Some(code) => RunOutcome::runtime_error(code, elapsed),
            // Killed by a signal.
            None => RunOutcome::runtime_error(-1, elapsed),
        };
        Ok(self.attach_stdout(outcome))
    }

    fn attach_stdout(&self, outcome: RunOutcome) -> RunOutcome {
        match &self.stdout {
            Some(path) => outcome.with_stdout(path.clone()),
            None => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunOutcomeKind;
    use std::fs;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("prog.sh");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_successful_run_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "echo hello");
        let out = dir.path().join("out.txt");

        let outcome = ProgramRun::new("/bin/sh")
            .arg(prog.to_string_lossy())
            .stdout_file(&out)
            .run()
            .unwrap();

        assert_eq!(outcome.kind, RunOutcomeKind::Ok);
        assert_eq!(outcome.stdout.as_deref(), Some(out.as_path()));
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "exit 3");

        let outcome = ProgramRun::new("/bin/sh")
            .arg(prog.to_string_lossy())
            .run()
            .unwrap();

        assert_eq!(outcome.kind, RunOutcomeKind::RuntimeError);
        assert_eq!(outcome.returncode, 3);
    }

    #[test]
    fn test_deadline_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "sleep 5");

        let outcome = ProgramRun::new("/bin/sh")
            .arg(prog.to_string_lossy())
            .time_limit_ms(100)
            .run()
            .unwrap();

        assert_eq!(outcome.kind, RunOutcomeKind::Timeout);
    }

    #[test]
    fn test_stdin_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "1 2\n").unwrap();
        let prog = script(dir.path(), "cat");
        let out = dir.path().join("out.txt");

        ProgramRun::new("/bin/sh")
            .arg(prog.to_string_lossy())
            .stdin_file(&input)
            .stdout_file(&out)
            .run()
            .unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "1 2\n");
    }

    #[test]
    fn test_missing_binary_is_an_io_error() {
        assert!(ProgramRun::new("/nonexistent/binary").run().is_err());
    }
}
