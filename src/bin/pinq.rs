//! Command-line driver: loads a JSON dataset and a JSON query, then prints
//! the plan or the result rows.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pinstore::query::{profile_snapshot, BuildCtx, Cursor, QueryConfig, QueryCtx, QueryProfileSnapshot, QueryVar};
use pinstore::{MemStore, PinError, PinHandle, Value};
use serde_json::{json, Map};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pinq",
    version,
    about = "Plan and run PIN store queries over a JSON dataset",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "JSON dataset to query")]
    data: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "PINSTORE_QUERY_CONFIG",
        help = "TOML file with engine limits"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long, value_name = "FILE", help = "JSON query variable")]
    query: PathBuf,

    #[arg(
        long,
        value_name = "JSON",
        help = "Parameter vectors as a JSON array of value arrays"
    )]
    params: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the physical plan.
    Explain {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long, help = "Hide literal values")]
        redact: bool,
    },
    /// Execute the query and print rows.
    Run {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long, default_value_t = 0, help = "Rows to skip first")]
        skip: u64,

        #[arg(long, help = "Stop after this many rows")]
        limit: Option<u64>,

        #[arg(long, help = "Only print the number of rows")]
        count: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Engine(#[from] PinError),
    #[error("{path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("invalid query: {0}")]
    Query(#[from] serde_json::Error),
    #[error(transparent)]
    Output(#[from] io::Error),
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pinstore=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => QueryConfig::load(path)?,
        None => QueryConfig::default(),
    };
    let store = match &cli.data {
        Some(path) => MemStore::load(path)?,
        None => MemStore::new(),
    };
    debug!(pins = store.len(), "pinq.store.ready");
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Explain { query, redact } => {
            let (ctx, var) = prepare(store, config, &query)?;
            let root = BuildCtx::new(ctx).build(&var)?;
            let plan = root.explain();
            match cli.format {
                OutputFormat::Text => {
                    write!(out, "{}", plan.render_with(redact))?;
                    writeln!(out, "fingerprint: {:016x}", plan.fingerprint())?;
                }
                OutputFormat::Json => {
                    let doc = json!({
                        "plan": plan,
                        "operators": plan.operator_count(),
                        "fingerprint": format!("{:016x}", plan.fingerprint()),
                    });
                    writeln!(out, "{doc}")?;
                }
            }
        }
        Command::Run {
            query,
            skip,
            limit,
            count,
        } => {
            let (ctx, var) = prepare(store, config, &query)?;
            let mut cursor = Cursor::open(&ctx, &var)?;
            if skip > 0 {
                cursor.skip_rows(skip)?;
            }
            if count {
                let rows = cursor.count_rows(limit.unwrap_or(u64::MAX))?;
                match cli.format {
                    OutputFormat::Text => writeln!(out, "{rows}")?,
                    OutputFormat::Json => writeln!(out, "{}", json!({ "count": rows }))?,
                }
            } else {
                let limit = limit.unwrap_or(u64::MAX);
                let mut printed = 0u64;
                for row in cursor.by_ref() {
                    if printed >= limit {
                        break;
                    }
                    let row = row?;
                    match cli.format {
                        OutputFormat::Text => writeln!(out, "{}", text_row(&row))?,
                        OutputFormat::Json => writeln!(out, "{}", json_row(&row))?,
                    }
                    printed += 1;
                }
                debug!(rows = printed, "pinq.run.done");
            }
        }
    }
    out.flush()?;
    if let Some(profile) = profile_snapshot(true) {
        report_profile(&profile)?;
    }
    Ok(())
}

/// Writes the non-zero operator counters to stderr, one kind per line.
fn report_profile(profile: &QueryProfileSnapshot) -> Result<(), CliError> {
    let kinds = [
        ("build", profile.build),
        ("scan", profile.scan),
        ("load", profile.load),
        ("filter", profile.filter),
        ("sort", profile.sort),
        ("merge", profile.merge),
        ("merge_join", profile.merge_join),
        ("hash_join", profile.hash_join),
        ("nested_loop", profile.nested_loop),
        ("path", profile.path),
    ];
    let stderr = io::stderr();
    let mut err = stderr.lock();
    for (name, timing) in kinds {
        if timing.count > 0 {
            writeln!(err, "profile {name}: calls={} ns={}", timing.count, timing.ns)?;
        }
    }
    Ok(())
}

fn prepare(store: MemStore, config: QueryConfig, args: &QueryArgs) -> Result<(QueryCtx, QueryVar), CliError> {
    let var = read_query(&args.query)?;
    let mut builder = QueryCtx::builder(Arc::new(store)).config(config);
    if let Some(raw) = &args.params {
        let params: Vec<Vec<Value>> = serde_json::from_str(raw)
            .map_err(|err| CliError::Message(format!("invalid --params: {err}")))?;
        for values in params {
            builder = builder.param(values);
        }
    }
    Ok((builder.build(), var))
}

fn read_query(path: &Path) -> Result<QueryVar, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

fn text_value(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(v) => v.to_string(),
        Value::Int(v) | Value::DateTime(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::String(v) => format!("{v:?}"),
        Value::Bytes(v) => format!("<{} bytes>", v.len()),
        Value::Ref(id) => format!("@{id}"),
        Value::Coll(items) => {
            let items: Vec<String> = items.iter().map(text_value).collect();
            format!("[{}]", items.join(","))
        }
    }
}

fn text_row(row: &[PinHandle]) -> String {
    let slots: Vec<String> = row
        .iter()
        .map(|handle| match handle.id() {
            None => "-".to_string(),
            Some(id) => {
                let mut text = id.to_string();
                for (prop, value) in handle.props() {
                    text.push_str(&format!(" p{prop}={}", text_value(value)));
                }
                text
            }
        })
        .collect();
    slots.join("\t")
}

fn json_row(row: &[PinHandle]) -> serde_json::Value {
    let slots: Vec<serde_json::Value> = row
        .iter()
        .map(|handle| {
            let mut props = Map::new();
            for (prop, value) in handle.props() {
                props.insert(prop.to_string(), json!(value));
            }
            json!({ "id": handle.id(), "props": props })
        })
        .collect();
    json!({ "slots": slots })
}
