use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use shipit::{Plan, ReconcileError, Reconciler, Reporter};
use shipit_config::{Config, find_config, load_config_from_file};
use shipit_store::{MemoryStore, Store};
use shipit_types::{Actor, AuditEntry, ReadView};

#[derive(Parser, Debug)]
#[command(name = "shipit", version)]
#[command(about = "Reconcile shipment trees against a local store")]
struct Cli {
    /// Directory to look for .shipit.toml in (default: current directory)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Explicit config file; disables the upward search.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store snapshot file (overrides [store] path)
    #[arg(long)]
    store: Option<PathBuf>,

    /// User recorded in audit rows.
    #[arg(long, default_value = "cli")]
    user: String,

    /// Hide every audit row written by this call.
    #[arg(long)]
    hidden: bool,

    /// Operations in flight at once inside a batch (overrides [engine]).
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Upper bound on the transaction (e.g. 30s, 500ms)
    #[arg(long)]
    timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the ordered plan for a tree without writing anything.
    Plan {
        /// JSON tree file, or `-` for stdin
        file: PathBuf,
        /// Treat the tree as an environment of this shipment.
        #[arg(long)]
        shipment: Option<String>,
    },
    /// Reconcile the store with a tree.
    Apply {
        /// JSON tree file, or `-` for stdin
        file: PathBuf,
        /// Treat the tree as an environment of this shipment.
        #[arg(long)]
        shipment: Option<String>,
    },
    /// Print a stored shipment, or one of its environments.
    Show {
        shipment: String,
        #[arg(long = "env")]
        environment: Option<String>,
        /// Show secret values.
        #[arg(long)]
        reveal: bool,
    },
    /// List the environments of a shipment.
    Envs { shipment: String },
    /// Print the audit trail of an environment.
    Logs {
        shipment: String,
        environment: String,
        /// Show hidden diffs.
        #[arg(long)]
        reveal: bool,
    },
    /// Resolve a build token to its environment.
    Token { token: String },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let (config, base) = resolve_config(&cli, &dir)?;

    let store_path = match &cli.store {
        Some(path) => path.clone(),
        None => config.resolve_store_path(&base),
    };
    let store = MemoryStore::open(&store_path)?;
    let reconciler = Reconciler::new(store, config.field_codec()?).with_options(shipit::EngineOptions {
        max_concurrency: config.max_concurrency(),
        transaction_timeout: config.transaction_timeout(),
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let actor = Actor {
        username: cli.user.clone(),
        hidden: cli.hidden,
    };
    let mut reporter = CliReporter;

    runtime.block_on(run(cli.cmd, &reconciler, &actor, &mut reporter))
}

/// Config file (explicit or found upward) with command-line overrides applied,
/// plus the directory relative store paths resolve against.
fn resolve_config(cli: &Cli, dir: &Path) -> Result<(Config, PathBuf)> {
    let found = cli.config.clone().or_else(|| find_config(dir));
    let (mut config, base) = match found {
        Some(path) => {
            let config = load_config_from_file(&path)?;
            let base = path.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            (config, base)
        }
        None => (Config::default(), dir.to_path_buf()),
    };

    if let Some(n) = cli.max_concurrency {
        config.set_max_concurrency(n);
    }
    if let Some(timeout) = &cli.timeout {
        config.set_transaction_timeout(parse_duration(timeout)?);
    }
    Ok((config, base))
}

async fn run(
    cmd: Commands,
    reconciler: &Reconciler<MemoryStore>,
    actor: &Actor,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    reporter.info(&format!("store: {}", reconciler.store().location()));

    match cmd {
        Commands::Plan { file, shipment } => {
            let tree = read_tree(&file)?;
            let plan = match &shipment {
                Some(shipment) => reconciler.plan_environment(shipment, &tree).await,
                None => reconciler.plan_shipment(&tree).await,
            };
            print_plan(&plan.map_err(|e| report(e, reporter))?);
        }
        Commands::Apply { file, shipment } => {
            let tree = read_tree(&file)?;
            let (status, plan, audit_rows, stored) = match &shipment {
                Some(shipment) => {
                    let done = reconciler
                        .reconcile_environment(shipment, &tree, actor, reporter)
                        .await
                        .map_err(|e| report(e, reporter))?;
                    (done.outcome.status_code(), done.plan, done.audit_rows, serde_json::to_value(&done.tree)?)
                }
                None => {
                    let done = reconciler
                        .reconcile_shipment(&tree, actor, reporter)
                        .await
                        .map_err(|e| report(e, reporter))?;
                    (done.outcome.status_code(), done.plan, done.audit_rows, serde_json::to_value(&done.tree)?)
                }
            };
            println!("status: {status}");
            print_plan(&plan);
            println!("audit_rows: {audit_rows}");
            println!();
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Commands::Show { shipment, environment, reveal } => {
            let view = view(reveal);
            let value = match &environment {
                Some(env) => serde_json::to_value(
                    reconciler
                        .get_environment(&shipment, env, view)
                        .await
                        .map_err(|e| report(e, reporter))?,
                )?,
                None => serde_json::to_value(
                    reconciler
                        .get_shipment(&shipment, view)
                        .await
                        .map_err(|e| report(e, reporter))?,
                )?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Envs { shipment } => {
            let envs = reconciler
                .list_environments(&shipment, ReadView::anonymous())
                .await
                .map_err(|e| report(e, reporter))?;
            for env in envs {
                println!("{}", env.name);
            }
        }
        Commands::Logs { shipment, environment, reveal } => {
            let entries = reconciler
                .audit_log(&shipment, &environment, view(reveal))
                .await
                .map_err(|e| report(e, reporter))?;
            for entry in &entries {
                print_entry(entry)?;
            }
        }
        Commands::Token { token } => {
            let Some(target) = reconciler
                .find_environment_by_build_token(&token)
                .await
                .map_err(|e| report(e, reporter))?
            else {
                bail!("no environment has this build token");
            };
            println!("{}/{}", target.shipment, target.environment.name);
        }
    }

    Ok(())
}

/// Print the details of a reconciliation error and turn it into an exit error.
fn report(err: ReconcileError, reporter: &mut dyn Reporter) -> anyhow::Error {
    for field in err.field_errors() {
        reporter.error(&field.to_string());
    }
    anyhow::anyhow!("{} (status {})", err, err.status_code())
}

fn view(reveal: bool) -> ReadView {
    if reveal {
        ReadView::authenticated()
    } else {
        ReadView::anonymous()
    }
}

fn read_tree(file: &Path) -> Result<Value> {
    let content = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read tree from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read tree file: {}", file.display()))?
    };
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", file.display()))
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn print_plan(plan: &Plan) {
    println!("plan_id: {}", plan.plan_id);
    println!("summary: {}", plan.summary());
    println!();

    for (idx, op) in plan.operations().enumerate() {
        let method = serde_json::to_value(op.method).ok();
        let method = method.as_ref().and_then(Value::as_str).unwrap_or("?");
        let change = op
            .change
            .and_then(|c| serde_json::to_value(c).ok())
            .and_then(|v| v.as_str().map(|s| format!(" ({s})")))
            .unwrap_or_default();
        println!("{:>3}. {method} {} {}{change}", idx + 1, op.kind, op.id);
    }
}

fn print_entry(entry: &AuditEntry) -> Result<()> {
    let when = chrono::DateTime::from_timestamp_millis(entry.updated)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| entry.updated.to_string());
    let hidden = if entry.hidden { " [hidden]" } else { "" };
    println!("{when} {} {}{hidden}", entry.user, entry.name);
    println!("  {}", serde_json::to_string(&entry.diff)?);
    Ok(())
}
