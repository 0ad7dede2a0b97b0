use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chatflow::config::EnvConfig;
use chatflow::utils::LoggingConfig;
use chatflow::{
    load_flows_from_dir, ActionRegistry, ContactStateStore, EngineSettings, FlowEngine,
    FlowRegistry, InMemoryBusinessStore, InboundEvent, MemoryContactStore, SandboxPaymentGateway,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "chatflow", version, about = "Conversational flow engine CLI", author)]
struct Cli {
    /// Verbose logs (target, file and line) on stderr
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate every flow document in a directory
    Validate {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print static analysis findings
    Lint {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Interactive conversation over stdin
    Simulate {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value = "263770000000")]
        contact: String,
        #[arg(long)]
        name: Option<String>,
        /// Engine settings JSON
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Business records JSON: `{"entity": [records...]}`
        #[arg(long)]
        records: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    LoggingConfig::from_env().verbose(cli.verbose).install();

    match cli.command {
        Command::Validate { dir } => handle_validate(flows_dir(dir))?,
        Command::Lint { dir, json } => handle_lint(flows_dir(dir), json)?,
        Command::Simulate {
            dir,
            contact,
            name,
            settings,
            records,
        } => handle_simulate(flows_dir(dir), contact, name, settings, records).await?,
    }
    Ok(())
}

fn flows_dir(dir: Option<PathBuf>) -> PathBuf {
    dir.or_else(|| EnvConfig::flows_dir().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("flows"))
}

fn load(dir: &PathBuf) -> anyhow::Result<FlowRegistry> {
    load_flows_from_dir(dir).with_context(|| format!("loading flows from `{}`", dir.display()))
}

fn builtin_actions(store: Arc<InMemoryBusinessStore>) -> ActionRegistry {
    ActionRegistry::with_builtins(store, Arc::new(SandboxPaymentGateway::default()))
}

fn handle_validate(dir: PathBuf) -> anyhow::Result<()> {
    let registry = load(&dir)?;
    println!(
        "{:<28} {:<8} {:<8} {}",
        "Flow", "Version", "Steps", "Triggers"
    );
    for name in registry.names() {
        if let Some(flow) = registry.get(name) {
            println!(
                "{:<28} {:<8} {:<8} {}",
                flow.name,
                flow.version,
                flow.steps.len(),
                flow.trigger_keywords.join(", ")
            );
        }
    }
    println!("{} flow(s) valid in `{}`", registry.len(), dir.display());
    Ok(())
}

fn handle_lint(dir: PathBuf, as_json: bool) -> anyhow::Result<()> {
    let registry = load(&dir)?;
    let findings = chatflow::lint_registry(
        &registry,
        &builtin_actions(Arc::new(InMemoryBusinessStore::new())),
    );
    if as_json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
    } else if findings.is_empty() {
        println!("No findings.");
    } else {
        for finding in &findings {
            println!("{finding}");
        }
    }
    Ok(())
}

async fn handle_simulate(
    dir: PathBuf,
    contact: String,
    name: Option<String>,
    settings: Option<PathBuf>,
    records: Option<PathBuf>,
) -> anyhow::Result<()> {
    let registry = load(&dir)?;
    let settings = match settings {
        Some(path) => EngineSettings::from_file(path)?.with_env_overrides()?,
        None => EngineSettings::from_env()?,
    };

    let business = Arc::new(InMemoryBusinessStore::new());
    if let Some(path) = records {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading records from `{}`", path.display()))?;
        let tables: Map<String, Value> = serde_json::from_str(&raw)?;
        for (entity, rows) in tables {
            match rows {
                Value::Array(rows) => business.seed(&entity, rows),
                _ => return Err(anyhow!("records for `{}` must be an array", entity)),
            }
        }
    }

    let engine = FlowEngine::with_settings(
        registry,
        builtin_actions(business),
        state_store()?,
        settings,
    )?;

    eprintln!("Simulating contact {contact}. Plain lines send text; /reply <id>, /media <id> [mime], /form <token> <json>, /state, /quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match parse_line(&contact, line) {
            Ok(Some(event)) => event,
            Ok(None) if line == "/quit" => break,
            Ok(None) => {
                let state = engine.contact_state(&contact).await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
                continue;
            }
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        let event = match &name {
            Some(name) => event.with_contact_name(name),
            None => event,
        };
        let outcome = engine.handle_event(event).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "disposition": outcome.disposition,
                "flow": outcome.flow_name,
                "step": outcome.current_step,
                "status": outcome.status,
                "outbound": outcome.outbound,
                "external_calls": outcome.external_calls,
                "halt": outcome.halt,
            }))?
        );
    }
    Ok(())
}

#[cfg(feature = "redis-store")]
fn state_store() -> anyhow::Result<Arc<dyn ContactStateStore>> {
    match EnvConfig::redis_url() {
        Some(url) => Ok(Arc::new(chatflow::state::RedisContactStore::from_url(&url)?)),
        None => Ok(Arc::new(MemoryContactStore::new())),
    }
}

#[cfg(not(feature = "redis-store"))]
fn state_store() -> anyhow::Result<Arc<dyn ContactStateStore>> {
    Ok(Arc::new(MemoryContactStore::new()))
}

/// 解析一行输入；`/state` 与 `/quit` 返回 `None`
fn parse_line(contact: &str, line: &str) -> anyhow::Result<Option<InboundEvent>> {
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(InboundEvent::text(contact, line)));
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "reply" if !rest.is_empty() => Ok(Some(InboundEvent::reply(contact, rest))),
        "media" if !rest.is_empty() => {
            let (media_id, mime) = rest.split_once(' ').unwrap_or((rest, ""));
            let mime = Some(mime.trim()).filter(|mime| !mime.is_empty());
            Ok(Some(InboundEvent::media(contact, media_id, mime)))
        }
        "form" => {
            let (token, raw) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: /form <token> <json>"))?;
            let fields: Map<String, Value> = serde_json::from_str(raw.trim())
                .context("form fields must be a JSON object")?;
            Ok(Some(InboundEvent::form(contact, token, fields)))
        }
        "state" | "quit" => Ok(None),
        _ => Err(anyhow!("unknown command `/{}`", name)),
    }
}
