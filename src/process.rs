//! External command lines and bounded-time execution

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// A program plus leading arguments, e.g. `python3 /path/worker.py`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Parse a whitespace separated command line from configuration
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: PathBuf::from(program),
            args: parts.map(OsString::from).collect(),
        })
    }

    /// Build a `Command` with the leading arguments applied
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// How a bounded command run ended
#[derive(Debug)]
pub enum RunOutcome {
    Exited { status: ExitStatus, stderr: String },
    TimedOut,
}

/// Run a command to completion, killing it once `timeout` elapses
///
/// Stdout is discarded and stderr captured for error reporting. Stderr is
/// drained while waiting so a chatty command never stalls on a full pipe.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> std::io::Result<RunOutcome> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut stderr = String::new();
            let _ = pipe.read_to_string(&mut stderr);
            stderr
        })
    });

    let status = match child.wait_timeout(timeout) {
        Ok(status) => status,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };

    match status {
        Some(status) => {
            let stderr = reader
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            Ok(RunOutcome::Exited { status, stderr })
        }
        None => {
            let _ = child.kill();
            let _ = child.wait();
            // Grandchildren may still hold stderr open; leave the reader be
            Ok(RunOutcome::TimedOut)
        }
    }
}

/// Keep the last line of a stderr dump for a status message
pub fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cmd = CommandLine::parse("python3  -u worker.py").unwrap();
        assert_eq!(cmd.program, PathBuf::from("python3"));
        assert_eq!(cmd.args, vec![OsString::from("-u"), OsString::from("worker.py")]);
        assert!(CommandLine::parse("   ").is_none());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("first\nsecond\n\n"), "second");
        assert_eq!(last_line(""), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_reports_exit_and_stderr() {
        let command = CommandLine::new("sh")
            .arg("-c")
            .arg("echo broken >&2; exit 3")
            .command();
        match run_with_timeout(command, Duration::from_secs(5)).unwrap() {
            RunOutcome::Exited { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(last_line(&stderr), "broken");
            }
            RunOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_drains_large_stderr() {
        // Well past the pipe buffer
        let command = CommandLine::new("sh")
            .arg("-c")
            .arg("head -c 300000 /dev/zero | tr '\\0' x >&2; echo >&2; echo done >&2")
            .command();
        match run_with_timeout(command, Duration::from_secs(10)).unwrap() {
            RunOutcome::Exited { status, stderr } => {
                assert!(status.success());
                assert!(stderr.len() > 300_000);
                assert_eq!(last_line(&stderr), "done");
            }
            RunOutcome::TimedOut => panic!("stalled on a full stderr pipe"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let command = CommandLine::new("sh").arg("-c").arg("sleep 5").command();
        let outcome = run_with_timeout(command, Duration::from_millis(100)).unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));
    }
}
