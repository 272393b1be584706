use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::process::{Command, Stdio};

use snafu::{ensure, ResultExt, Snafu};
use tracing::{info, warn};

/// How much of a failed command's output is kept in the error message.
const OUTPUT_TAIL_LIMIT: usize = 700;

#[derive(Debug, Snafu)]
pub enum RunCmdError {
    #[snafu(display("Failed to execute command: {cmd}"))]
    Exec {
        cmd: String,
        source: std::io::Error,
    },
    #[snafu(display("Command failed with exit code {code}: {cmd}\n{tail}"))]
    RunFailed { cmd: String, code: i32, tail: String },
}

/// Exit state of a finished command.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub code: i32,
    pub normal_exit: bool,
    pub output: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.normal_exit && self.code == 0
    }
}

/// Runs external tools and forwards every line they print to the install
/// log. stdout and stderr share one pipe so the log keeps the original
/// interleaving.
pub struct Runner<'a> {
    log: &'a dyn Fn(&str),
}

impl<'a> Runner<'a> {
    pub fn new(log: &'a dyn Fn(&str)) -> Runner<'a> {
        Runner { log }
    }

    /// Pushes one line to the install log and the daemon log.
    pub fn log(&self, line: &str) {
        info!("{line}");
        (self.log)(line);
    }

    /// Runs a command and fails if it exits abnormally or with a nonzero
    /// code. The error carries the tail of the merged output.
    pub fn run<I, S>(&self, program: &str, args: I) -> Result<ProcessResult, RunCmdError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (cmd, args) = render_command(program, args);
        self.log(&format!("$ {cmd}"));

        let result = self.stream_merged(program, &args, &cmd)?;
        ensure!(
            result.success(),
            RunFailedSnafu {
                cmd,
                code: result.code,
                tail: output_tail(&result.output).to_string(),
            }
        );

        Ok(result)
    }

    /// Runs a command whose failure is tolerated. A command that could not
    /// even be spawned is reported as exit code -1.
    pub fn run_unchecked<I, S>(&self, program: &str, args: I) -> ProcessResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (cmd, args) = render_command(program, args);
        self.log(&format!("$ {cmd}"));

        match self.stream_merged(program, &args, &cmd) {
            Ok(result) => result,
            Err(e) => {
                warn!("{e}");
                self.log(&format!("Warning: {e}"));
                ProcessResult {
                    code: -1,
                    normal_exit: false,
                    output: String::new(),
                }
            }
        }
    }

    /// Runs a command and returns its stdout for parsing. Only the command
    /// line goes to the install log; a failure reports the stderr tail.
    pub fn run_capture<I, S>(&self, program: &str, args: I) -> Result<String, RunCmdError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (cmd, args) = render_command(program, args);
        self.log(&format!("$ {cmd}"));

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .context(ExecSnafu { cmd: cmd.as_str() })?;

        ensure!(
            output.status.success(),
            RunFailedSnafu {
                cmd,
                code: output.status.code().unwrap_or(-1),
                tail: output_tail(&String::from_utf8_lossy(&output.stderr)).to_string(),
            }
        );

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn stream_merged(
        &self,
        program: &str,
        args: &[OsString],
        cmd: &str,
    ) -> Result<ProcessResult, RunCmdError> {
        let (read_end, write_end) = rustix::pipe::pipe()
            .map_err(std::io::Error::from)
            .context(ExecSnafu { cmd })?;
        let stderr_end = write_end.try_clone().context(ExecSnafu { cmd })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .spawn()
            .context(ExecSnafu { cmd })?;

        // The child holds the only remaining write ends, so this loop ends
        // when it exits.
        let mut reader = BufReader::new(File::from(read_end));
        let mut output = String::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .context(ExecSnafu { cmd })?;
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            output.push_str(&line);
            let line = line.trim();
            if !line.is_empty() {
                self.log(line);
            }
        }

        let status = child.wait().context(ExecSnafu { cmd })?;

        Ok(ProcessResult {
            code: status.code().unwrap_or(-1),
            normal_exit: status.code().is_some(),
            output,
        })
    }
}

fn render_command<I, S>(program: &str, args: I) -> (String, Vec<OsString>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args = args
        .into_iter()
        .map(|x| x.as_ref().to_os_string())
        .collect::<Vec<_>>();

    let mut cmd = program.to_string();
    for arg in &args {
        cmd.push(' ');
        cmd.push_str(&arg.to_string_lossy());
    }

    (cmd, args)
}

/// Last `OUTPUT_TAIL_LIMIT` characters, cut on a char boundary.
fn output_tail(output: &str) -> &str {
    let total = output.chars().count();
    if total <= OUTPUT_TAIL_LIMIT {
        return output;
    }

    match output.char_indices().nth(total - OUTPUT_TAIL_LIMIT) {
        Some((idx, _)) => &output[idx..],
        None => output,
    }
}
