//! `gatekeeper` command line.
//!
//! `check` screens text offline. `submit` runs the full gate against the
//! configured oracle, with a dry-run executor unless `--execute` is given.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};

use gatekeeper::core::patterns::blocked_rules;
use gatekeeper::core::types::OperationStatus;
use gatekeeper::exit_codes;
use gatekeeper::io::config::{GateConfig, load_config, render_config, write_config};
use gatekeeper::io::executor::{DryRunExecutor, Executor, ShellExecutor};
use gatekeeper::io::oracle::{CommandOracle, NoOracle, Oracle};
use gatekeeper::verify::{ScreenVerdict, screen};
use gatekeeper::{Gatekeeper, SessionContext, UserPreferences, logging};

const DEFAULT_CONFIG: &str = "gatekeeper.toml";

#[derive(Parser)]
#[command(
    name = "gatekeeper",
    version,
    about = "Verify natural-language requests before anything privileged runs"
)]
struct Cli {
    /// Config file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Screen text offline: sanitizer, syntax checks and blocked patterns.
    Check { text: String },
    /// Run a request through the full gate and print the operation tree as JSON.
    Submit {
        text: String,
        /// Session id; budgets and the circuit breaker are tracked per session.
        #[arg(long)]
        session: Option<String>,
        /// Context snippet passed to the classifier. Repeatable.
        #[arg(long = "hint")]
        hints: Vec<String>,
        /// Run approved leaves with /bin/sh instead of a dry run.
        #[arg(long)]
        execute: bool,
        /// Never auto-execute; the top tier asks for confirmation too.
        #[arg(long)]
        no_auto: bool,
    },
    /// Create or print the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the blocked patterns.
    Patterns,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective config.
    Show,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { text } => cmd_check(&cli.config, &text),
        Command::Submit {
            text,
            session,
            hints,
            execute,
            no_auto,
        } => {
            let mut ctx = session
                .map_or_else(SessionContext::anonymous, SessionContext::new)
                .with_hints(hints);
            if no_auto {
                ctx = ctx.with_preferences(UserPreferences {
                    allow_auto_execute: false,
                });
            }
            cmd_submit(&cli.config, &text, &ctx, execute)
        }
        Command::Config {
            action: ConfigAction::Init { force },
        } => cmd_config_init(&cli.config, force),
        Command::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&cli.config),
        Command::Patterns => cmd_patterns(),
    }
}

fn cmd_check(config_path: &Path, text: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let verdict = match screen(text, cfg.verification.max_request_bytes) {
        Ok(verdict) => verdict,
        Err(e) => {
            println!("invalid: {e}");
            return Ok(exit_codes::INVALID);
        }
    };
    match verdict {
        ScreenVerdict::Clear { warnings } => {
            println!("clear");
            for warning in warnings {
                println!("  warning: {warning}");
            }
            Ok(exit_codes::OK)
        }
        ScreenVerdict::Blocked { layer, issues } => {
            println!("blocked by {layer} layer");
            for issue in issues {
                println!("  {issue}");
            }
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_submit(
    config_path: &Path,
    text: &str,
    session: &SessionContext,
    execute: bool,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let oracle: Arc<dyn Oracle> = match CommandOracle::from_config(&cfg.oracle) {
        Some(oracle) => Arc::new(oracle),
        None => Arc::new(NoOracle),
    };
    let executor: Arc<dyn Executor> = if execute {
        Arc::new(ShellExecutor)
    } else {
        Arc::new(DryRunExecutor::new())
    };
    let gate = Gatekeeper::builder(cfg)
        .oracle(oracle)
        .executor(executor)
        .build()
        .context("build gatekeeper")?;

    let result = gate.submit(text, session)?;
    let explanations: Map<String, Value> = result
        .tree
        .iter()
        .map(|op| (op.id.to_string(), Value::String(result.explain(op.id))))
        .collect();
    let recovered: Vec<String> = result.recovered.iter().map(ToString::to_string).collect();
    let report = json!({
        "session": result.session,
        "status": result.root_status(),
        "tree": result.tree,
        "notices": result.notices,
        "recovered": recovered,
        "explanations": explanations,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize result")?
    );

    Ok(match result.root_status() {
        OperationStatus::Complete => exit_codes::OK,
        OperationStatus::Failed => exit_codes::BLOCKED,
        _ => exit_codes::PENDING,
    })
}

fn cmd_config_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    write_config(path, &GateConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_config_show(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    print!("{}", render_config(&cfg)?);
    Ok(exit_codes::OK)
}

fn cmd_patterns() -> Result<i32> {
    for rule in blocked_rules() {
        println!("{:<24} {:<40} {}", rule.id, rule.issue, rule.pattern());
    }
    Ok(exit_codes::OK)
}
