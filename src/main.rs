use anyhow::{Context, Result, anyhow};
use argh::FromArgs;
use mrpo::{ExecutorCatalog, MrPo};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Run the commands of an mrpo project.
///
/// With no command, the available commands are listed. The last positional
/// argument is taken as the project directory when it names one.
struct Cli {
    #[argh(switch, short = 'v')]
    /// log executor activity to stderr.
    verbose: bool,

    #[argh(switch, short = 'i')]
    /// read commands from an interactive prompt.
    interactive: bool,

    #[argh(option, short = 'a', long = "arg")]
    /// argument passed to the command as key=value; values are parsed as JSON
    /// when possible.
    args: Vec<String>,

    #[argh(positional)]
    /// command to run, then extra arguments passed to it as `argv`, then
    /// optionally the project directory.
    params: Vec<String>,
}

/// Where the project lives and what to run in it.
#[derive(Debug, PartialEq)]
struct Invocation {
    target: PathBuf,
    params: Vec<String>,
}

fn prepare_args(cwd: &Path, mut params: Vec<String>) -> Invocation {
    if let Some(last) = params.last() {
        let candidate = cwd.join(last);
        if candidate.is_dir() {
            params.pop();
            return Invocation {
                target: candidate,
                params,
            };
        }
    }
    Invocation {
        target: cwd.to_path_buf(),
        params,
    }
}

fn parse_arg(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got `{}`", raw))?;
    if key.is_empty() {
        return Err(anyhow!("expected key=value, got `{}`", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn command_args(raw: &[String]) -> Result<Value> {
    raw.iter()
        .map(|arg| parse_arg(arg))
        .collect::<Result<Map<_, _>>>()
        .map(Value::Object)
}

/// Add positional arguments that follow the command to `args.argv`.
fn with_argv(mut args: Value, extra: &[String]) -> Value {
    if extra.is_empty() {
        return args;
    }
    if let Value::Object(map) = &mut args {
        let argv = map.entry("argv").or_insert_with(|| Value::Array(Vec::new()));
        match argv {
            Value::Array(items) => items.extend(extra.iter().cloned().map(Value::String)),
            other => {
                let mut items = vec![other.take()];
                items.extend(extra.iter().cloned().map(Value::String));
                *other = Value::Array(items);
            }
        }
    }
    args
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mrpo=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("MRPO_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run one command, canceling it once per Ctrl-C until it settles.
async fn run(mrpo: &MrPo, command: &str, args: Value) -> Result<()> {
    let execution = mrpo.exec(command, args);
    let mut settled = execution.clone();

    let result = loop {
        tokio::select! {
            result = &mut settled => break result,
            interrupt = tokio::signal::ctrl_c() => {
                interrupt.context("can't listen for interrupts")?;
                debug!(command, "interrupted, canceling");
                execution.cancel();
            }
        }
    };

    let value = result?;
    if !value.is_null() {
        println!("{}", value);
    }
    Ok(())
}

async fn list(mrpo: &MrPo) -> Result<()> {
    for name in mrpo.list_commands().await? {
        println!("{}", name);
    }
    Ok(())
}

async fn repl(mrpo: &MrPo, args: &Value) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        match rl.readline("mrpo> ") {
            Ok(line) => {
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                rl.add_history_entry(command)?;
                match command {
                    "exit" | "quit" => break,
                    "help" | "?" => list(mrpo).await?,
                    _ => {
                        if let Err(err) = run(mrpo, command, args.clone()).await {
                            eprintln!("error: {:#}", err);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

async fn try_main(cli: Cli) -> Result<()> {
    let cwd = env::current_dir().context("can't determine the working directory")?;
    let invocation = prepare_args(&cwd, cli.params);
    let args = command_args(&cli.args)?;
    debug!(project = %invocation.target.display(), "resolved project directory");

    let mrpo = MrPo::build(invocation.target, &ExecutorCatalog::new()).await?;

    if cli.interactive {
        return repl(&mrpo, &args).await;
    }
    match invocation.params.split_first() {
        None => list(&mrpo).await,
        Some((command, extra)) => run(&mrpo, command, with_argv(args, extra)).await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli: Cli = argh::from_env();
    init_logging(cli.verbose);

    match try_main(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
