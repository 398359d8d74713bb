use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use nano_runtime::{LoopHandle, ScriptContext};
use tracing::instrument;
use tracing_subscriber::EnvFilter;

use nano::config::Config;
use nano::server::Server;

/// Watchdog budget for `eval` and the REPL: these are trivial synchronous
/// contexts, not request handlers.
const EVAL_BUDGET: Duration = Duration::from_millis(50);

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Evaluate an expression:
    $ nano eval '1 + 1'
    2

  Serve a single app directory on the default port:
    $ cat ./hello/index.js
    export default {
        async fetch(request, env) {
            return Response.json({ hello: env.NAME ?? \"world\" });
        }
    };

    $ nano serve ./hello

  Serve a multi-app config, routed by Host header:
    $ cat ./nano.json
    {
        \"port\": 8080,
        \"apps\": [
            { \"name\": \"app-a\", \"path\": \"./apps/a\", \"hostname\": \"a.local\" },
            { \"name\": \"app-b\", \"path\": \"./apps/b\", \"hostname\": \"b.local\" }
        ]
    }

    $ nano serve --config ./nano.json
    $ curl -H 'Host: a.local' http://127.0.0.1:8080/
";

/// A multi-tenant JavaScript runtime: many isolated apps, one process.
#[derive(Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a JavaScript expression and print the result.
    Eval {
        /// The source text to evaluate.
        source: String,
    },
    /// Interactive REPL preserving a single context.
    Repl,
    /// Serve one or more apps over HTTP.
    Serve {
        /// Listening port (overrides the config document).
        #[arg(long)]
        port: Option<u16>,
        /// Path to the JSON configuration document.
        #[arg(long)]
        config: Option<PathBuf>,
        /// A single app directory (shorthand for a one-app config).
        app_dir: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[instrument(skip_all, level = "info")]
fn run() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Eval { source } => eval(&source),
        Command::Repl => repl(),
        Command::Serve {
            port,
            config,
            app_dir,
        } => serve(port, config, app_dir),
    }
}

fn eval(source: &str) -> anyhow::Result<()> {
    let events = LoopHandle::new();
    let context = ScriptContext::new(events)?;
    let result = context.eval(source, EVAL_BUDGET)?;
    println!("{result}");
    Ok(())
}

fn repl() -> anyhow::Result<()> {
    let events = LoopHandle::new();
    let context = ScriptContext::new(events)?;
    let mut editor = rustyline::DefaultEditor::new().context("initialising the line editor")?;

    loop {
        match editor.readline("nano> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match context.eval(line, EVAL_BUDGET) {
                    Ok(result) => println!("{result}"),
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("reading input"),
        }
    }
    Ok(())
}

fn serve(
    port: Option<u16>,
    config_path: Option<PathBuf>,
    app_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (config, config_path) = match (&config_path, &app_dir) {
        (Some(path), _) => {
            let mut config = Config::load(path)?;
            if let Some(port) = port {
                config.port = port;
            }
            (config, Some(path.clone()))
        }
        (None, Some(dir)) => (Config::for_single_app(dir, port)?, None),
        (None, None) => bail!("serve requires --config FILE or an app directory"),
    };

    let stop = nano::shutdown::register()?;
    let mut server = Server::new(config, config_path, stop)?;
    server.run()
}
