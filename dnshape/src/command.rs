//! Utilies for running the backend binary through [`std::process::Command`].

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
    process,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status: {0}")]
    NonZero(Output),
}

/// The captured result of a finished command.
#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The diagnostic usually lands on stderr, but some ipfw builds print it on stdout.
        let diagnostic =
            if self.stderr.trim().is_empty() { self.stdout.trim() } else { self.stderr.trim() };
        write!(f, "{} ({diagnostic})", self.status)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs a fixed program, optionally through `sudo`.
#[derive(Debug, Clone)]
pub struct Runner {
    program: PathBuf,
    sudo: bool,
}

impl Runner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), sudo: false }
    }

    /// Prefix every invocation with `sudo`.
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Builds the command without running it.
    pub fn command<I, S>(&self, args: I) -> process::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = if self.sudo {
            let mut cmd = process::Command::new("sudo");
            cmd.arg(&self.program);
            cmd
        } else {
            process::Command::new(&self.program)
        };

        cmd.args(args).stderr(process::Stdio::piped()).stdout(process::Stdio::piped());
        cmd
    }

    /// Runs the program with the provided arguments, returning the captured output on success.
    pub fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(args);

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();

        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, ?cmd, "command returned non-zero status");
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}
