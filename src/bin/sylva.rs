//! Binary entry point for the Sylva plan optimizer CLI.
#![forbid(unsafe_code)]

#[path = "sylva/config.rs"]
mod config;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use sylva::query::profile::profile_snapshot;
use sylva::query::{
    prepare, FunctionRegistry, OptimizerConfig, Plan, PreparedQuery, QueryContext, QueryDocument,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(
    name = "sylva",
    version,
    about = "Rewrite, explain and run FLWOR query plans",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "SYLVA_CONFIG",
        help = "Config file with an [optimizer] table"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OptimizerArgs {
    #[arg(value_name = "PLAN", help = "JSON query document")]
    plan: PathBuf,

    #[arg(long, help = "Run the unnesting passes")]
    unnest: bool,

    #[arg(long, help = "Skip projection (liveness) annotation")]
    no_projection: bool,

    #[arg(long, value_name = "N", help = "Traversal bound per rewrite pass")]
    max_traversals: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the rewritten plan and its operator tree.
    Explain {
        #[command(flatten)]
        args: OptimizerArgs,

        #[arg(long, help = "Hide literal values in operator properties")]
        redact: bool,
    },
    /// Evaluate the plan and print the result items.
    Run {
        #[command(flatten)]
        args: OptimizerArgs,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    debug!(path = ?config.path(), "cli.config.loaded");

    match cli.command {
        Command::Explain { args, redact } => {
            let (document, prepared) = load_and_prepare(&args, &config)?;
            let explain = prepared.compiled.explain();
            match cli.format {
                OutputFormat::Json => {
                    let value = json!({
                        "externals": document.bindings.keys().collect::<Vec<_>>(),
                        "rewrites": prepared.rewrites,
                        "projected": prepared.projected,
                        "plan": prepared.plan.to_spec(prepared.plan.root()),
                        "explain": explain.to_json(redact),
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                OutputFormat::Text => {
                    println!("Rewrites:");
                    for pass in &prepared.rewrites.passes {
                        println!(
                            "  {} traversals={} changed={}",
                            pass.pass, pass.traversals, pass.changed
                        );
                    }
                    println!("Plan:");
                    print!("{}", indent(&prepared.plan.render()));
                    println!("Operators:");
                    print!("{}", indent(&explain.render_text(redact)));
                }
            }
        }
        Command::Run { args } => {
            let (document, prepared) = load_and_prepare(&args, &config)?;
            let ctx = QueryContext::new();
            let result = prepared
                .compiled
                .evaluate(&ctx, &document.external_bindings())?;
            let stats = ctx.stats();
            match cli.format {
                OutputFormat::Json => {
                    let value = json!({
                        "items": result.items(),
                        "stats": stats,
                        "profile": profile_snapshot(false),
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                OutputFormat::Text => {
                    for item in result.iter() {
                        println!("{item}");
                    }
                    eprintln!(
                        "rows={} let_evaluations={} skipped_lets={} joins(hash={} sort_merge={} nested_loop={})",
                        stats.rows,
                        stats.let_evaluations,
                        stats.skipped_lets,
                        stats.hash_joins,
                        stats.sort_merge_joins,
                        stats.nested_loop_joins
                    );
                }
            }
        }
    }
    Ok(())
}

fn optimizer_config(args: &OptimizerArgs, config: &CliConfig) -> OptimizerConfig {
    let mut optimizer = config.optimizer();
    if args.unnest {
        optimizer.unnest = true;
    }
    if args.no_projection {
        optimizer.projection = false;
    }
    if let Some(max) = args.max_traversals {
        optimizer.max_traversals = max;
    }
    optimizer
}

fn load_and_prepare(
    args: &OptimizerArgs,
    config: &CliConfig,
) -> Result<(QueryDocument, PreparedQuery), Box<dyn Error>> {
    let document = read_document(&args.plan)?;
    let optimizer = optimizer_config(args, config);
    let plan = Plan::from_spec(&document.plan)?;
    let registry = FunctionRegistry::builtins();
    let prepared = prepare(plan, &optimizer, &registry, &document.externals())?;
    Ok((document, prepared))
}

fn read_document(path: &Path) -> Result<QueryDocument, Box<dyn Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let document = serde_json::from_str(&contents)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
    Ok(document)
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("  {line}\n")).collect()
}
