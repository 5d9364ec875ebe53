use crate::config::ProjectConfig;
use crate::handler::ManagedCommand;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::env as stdenv;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Command backed by an external program.
///
/// Starting it spawns the program in the project directory and waits for it
/// to exit; stopping it kills the child. Commands declared in a project file
/// are of this kind (see [`Handler::probe`](crate::Handler::probe)).
pub struct ProcessCommand {
    label: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stop_signal: Mutex<CancellationToken>,
}

impl ProcessCommand {
    /// Run `program` with `args` directly, without a shell.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let label = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self::with_label(label, program, args)
    }

    /// Run `line` through the platform shell.
    ///
    /// Extra argv given at execution time is appended to the command line:
    /// `sh` receives it as positional parameters expanded by `"$@"`, `cmd`
    /// joins it onto the line itself.
    pub fn shell(line: impl Into<String>) -> Self {
        let line = line.into();
        let args = if cfg!(windows) {
            vec!["/C".to_string(), line.clone()]
        } else {
            vec![
                "-c".to_string(),
                format!("{} \"$@\"", line),
                "sh".to_string(),
            ]
        };
        let program = if cfg!(windows) { "cmd" } else { "sh" };
        Self::with_label(line, program.to_string(), args)
    }

    fn with_label(label: String, program: String, args: Vec<String>) -> Self {
        Self {
            label,
            program,
            args,
            cwd: None,
            env: BTreeMap::new(),
            stop_signal: Mutex::new(CancellationToken::new()),
        }
    }

    /// Working directory, relative to the project directory unless absolute.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Interpret a project-file value. Returns `None` for unsupported shapes.
    ///
    /// Accepted shapes:
    /// - `"cargo build"`: a command line for the platform shell.
    /// - `["cargo", "build"]`: an argv vector.
    /// - `{"run": <either of the above>, "cwd": "dir", "env": {"KEY": "value"}}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(spec) => {
                let mut command = Self::from_run(spec.get("run")?)?;
                if let Some(cwd) = spec.get("cwd") {
                    command = command.current_dir(cwd.as_str()?);
                }
                if let Some(env) = spec.get("env") {
                    for (key, value) in env.as_object()? {
                        command = command.env(key.clone(), value.as_str()?);
                    }
                }
                Some(command)
            }
            other => Self::from_run(other),
        }
    }

    fn from_run(run: &Value) -> Option<Self> {
        match run {
            Value::String(line) if !line.trim().is_empty() => Some(Self::shell(line.clone())),
            Value::Array(items) => {
                let mut argv = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()?;
                if argv.is_empty() || argv[0].is_empty() {
                    return None;
                }
                let program = argv.remove(0);
                Some(Self::new(program, argv))
            }
            _ => None,
        }
    }

    fn arm_stop_signal(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.stop_signal.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }
}

#[async_trait]
impl ManagedCommand for ProcessCommand {
    async fn start(&self, config: Arc<ProjectConfig>, args: Value) -> Result<Value> {
        let stop_signal = self.arm_stop_signal();

        let cwd = match &self.cwd {
            Some(dir) => config.resolve_path(dir),
            None => config.cwd.clone(),
        };
        let search_paths = stdenv::var_os("PATH").unwrap_or_default();
        let program = find_program(&search_paths, &cwd, Path::new(&self.program))
            .ok_or_else(|| anyhow!("{}: command not found", self.program))?;

        let mut argv = self.args.clone();
        argv.extend(extra_argv(&args)?);

        debug!(command = %self.label, cwd = %cwd.display(), "spawning process");
        let mut child = Command::new(&program)
            .args(&argv)
            .envs(&self.env)
            .current_dir(&cwd)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.label))?;

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_signal.cancelled() => None,
        };
        let (status, stopped) = match finished {
            Some(status) => (status, false),
            None => {
                // The child may have exited on its own in the meantime.
                let _ = child.start_kill();
                (child.wait().await, true)
            }
        };
        let code = exit_code(status.with_context(|| format!("failed to wait for `{}`", self.label))?);

        debug!(command = %self.label, code, stopped, "process exited");
        if stopped {
            return Ok(json!({ "status": code, "stopped": true }));
        }
        if code != 0 {
            bail!("`{}` exited with status {}", self.label, code);
        }
        Ok(json!({ "status": code }))
    }

    async fn stop(&self) -> Result<()> {
        self.stop_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        Ok(())
    }
}

/// Extra argv entries passed at execution time as `{"argv": [...]}`.
fn extra_argv(args: &Value) -> Result<Vec<String>> {
    match args.get("argv") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("argv entries must be strings, got {}", item))
            })
            .collect(),
        Some(other) => bail!("argv must be an array of strings, got {}", other),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => terminated_by_signal(status),
    }
}

#[cfg(unix)]
fn terminated_by_signal(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => 128 + signal,
        None if status.core_dumped() => 255,
        None => -1,
    }
}

#[cfg(not(unix))]
fn terminated_by_signal(_status: ExitStatus) -> i32 {
    -1
}

/// Resolve a program the way a shell would.
///
/// - An absolute path is used if it names a file.
/// - A bare name (one component) is looked up in each directory of `search_paths`.
/// - Anything else (`./tool`, `bin/tool`) is resolved against `cwd`.
pub fn find_program(search_paths: &OsStr, cwd: &Path, program: &Path) -> Option<PathBuf> {
    if program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }

    let mut components = program.components();
    match (components.next(), components.next()) {
        (None, _) => None,
        (Some(Component::Normal(name)), None) => stdenv::split_paths(search_paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file()),
        _ => {
            let candidate = cwd.join(program);
            candidate.is_file().then_some(candidate)
        }
    }
}
