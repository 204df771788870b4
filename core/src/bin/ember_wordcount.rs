//! Word count over a stored text object.
//!
//! Reads the input, splits lines on spaces, drops tokens ending in `1`,
//! counts the rest, sorts by count and saves `(count, word)` lines.
//!
//! ```bash
//! ember-wordcount --root /tmp/data --input data.txt --output counts --descending
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ember_core::{EmberContext, EngineConfig, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ember-wordcount")]
#[command(about = "Count words of a text object and save them ordered by count")]
struct Args {
    /// Input object, relative to the storage root
    #[arg(long)]
    input: String,

    /// Output directory, relative to the storage root
    #[arg(long)]
    output: String,

    /// Local directory holding input and output
    #[arg(long)]
    root: Option<PathBuf>,

    /// Partitions of the input
    #[arg(long)]
    partitions: Option<usize>,

    /// Size of the worker pool
    #[arg(long)]
    workers: Option<usize>,

    /// JSON engine configuration; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Most frequent words first
    #[arg(long)]
    descending: bool,

    /// Cache the counts before sorting
    #[arg(long)]
    cache: bool,

    /// Records printed before saving
    #[arg(long, default_value_t = 10)]
    preview: usize,
}

fn add_counts(a: Value, b: Value) -> Value {
    Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::new("ember-wordcount"),
    };
    if let Some(root) = &args.root {
        config = config.with_storage_root(root);
    }
    if let Some(workers) = args.workers {
        config = config.with_num_workers(workers);
    }

    let ctx = EmberContext::new(config).await?;
    let lines = match args.partitions {
        Some(n) => ctx.text_file_with_partitions(&args.input, n),
        None => ctx.text_file(&args.input),
    };

    let counts = lines
        .flat_map(|line| {
            line.as_str()
                .unwrap_or_default()
                .split(' ')
                .map(Value::from)
                .collect::<Vec<_>>()
        })
        .filter(|word| !word.as_str().unwrap_or_default().ends_with('1'))
        .map(|word| Value::pair(word, 1))
        .reduce_by_key(add_counts);
    let counts = if args.cache { counts.cache()? } else { counts };

    let sorted = counts.map(Value::swap).sort_by_key(!args.descending);
    for record in sorted.take(args.preview).await? {
        println!("{}", record);
    }

    sorted.save_as_text_file(&args.output).await?;
    info!(
        "Saved {} distinct words to {}",
        counts.count().await?,
        args.output
    );

    ctx.stop().await?;
    Ok(())
}
