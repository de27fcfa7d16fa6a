// crates/pipecli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipecore::{
    DataId, ExecutionEvent, MemoryStore, NodeEvent, NodeSpec, PipelineDef, Target, TaskConfig,
    Value,
};
use piperuntime::{PipelineRuntime, RunDescriptor, RuntimeConfig, TaskRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe")]
#[command(about = "Pipeline Engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registered composite or a pipeline definition file
    Run {
        /// Name of a registered composite
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        name: Option<String>,

        /// Path to pipeline definition JSON file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// JSON data store file: { "dataset": { "key=value": data } }
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Print the metadata of every node after the run
        #[arg(long)]
        metadata: bool,
    },

    /// List available task types and composites
    Nodes,

    /// Print the composed tree of a registered composite
    Tree { name: String },

    /// Export the edge list of a registered composite
    Graph {
        name: String,

        /// Render Graphviz dot instead of a plain edge list
        #[arg(long)]
        dot: bool,
    },

    /// Run one task type over many data ids
    Batch {
        /// Registered task type
        task_type: String,

        /// Data id as whitespace separated key=value pairs; repeatable
        #[arg(long = "id")]
        ids: Vec<String>,

        /// File with one data id per line
        #[arg(long)]
        ids_file: Option<PathBuf>,

        /// JSON data store file
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Number of workers; 1 runs serially
        #[arg(short = 'j', long, default_value_t = 1)]
        processes: usize,

        /// Batch timeout in seconds
        #[arg(long, default_value_t = piperuntime::DEFAULT_TIMEOUT_SECS)]
        timeout: u64,

        /// Abort on the first failure
        #[arg(long)]
        doraise: bool,

        /// Overwrite persisted config and schemas
        #[arg(long)]
        clobber_config: bool,

        /// Config override key=value; repeatable
        #[arg(short, long = "config")]
        config: Vec<String>,

        /// Print each target's result
        #[arg(long)]
        return_results: bool,
    },

    /// Create an example pipeline definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "pipeline.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Run {
            name,
            file,
            input,
            data,
            metadata,
        } => {
            run_pipeline(name, file, input, data, metadata).await?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Tree { name } => {
            let runtime = build_runtime(None)?;
            print!("{}", runtime.tree(&name)?);
        }

        Commands::Graph { name, dot } => {
            let runtime = build_runtime(None)?;
            if dot {
                let graph = runtime.graph(&name)?;
                println!("{}", petgraph::dot::Dot::new(&graph));
            } else {
                for edge in runtime.edges(&name)? {
                    println!("{} -> {} ({})", edge.from, edge.to, edge.kind);
                }
            }
        }

        Commands::Batch {
            task_type,
            ids,
            ids_file,
            data,
            processes,
            timeout,
            doraise,
            clobber_config,
            config,
            return_results,
        } => {
            let mut overrides = TaskConfig::new();
            for assignment in &config {
                overrides.apply_override(assignment)?;
            }

            let mut targets = Vec::new();
            for raw in &ids {
                targets.push(Target::new(raw.parse::<DataId>()?));
            }
            if let Some(path) = ids_file {
                targets.extend(read_ids_file(&path)?);
            }

            let desc = RunDescriptor::new(task_type)
                .with_config(overrides)
                .with_targets(targets)
                .with_workers(processes)
                .with_timeout(Duration::from_secs(timeout))
                .raise_on_error(doraise)
                .clobber_config(clobber_config)
                .return_results(return_results);

            run_batch(desc, data.as_deref()).await?;
        }

        Commands::Init { output } => {
            create_example_pipeline(output)?;
        }
    }

    Ok(())
}

fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    pipetasks::register_all(&mut registry);
    registry
}

fn build_runtime(data: Option<&Path>) -> Result<PipelineRuntime> {
    let runtime = PipelineRuntime::with_registry(Arc::new(build_registry()), RuntimeConfig::default());
    Ok(match data {
        Some(path) => {
            let store = Arc::new(load_store(path)?);
            runtime
                .with_data_store(store.clone())
                .with_metadata_sink(store)
        }
        None => runtime.with_metadata_sink(Arc::new(MemoryStore::new())),
    })
}

fn load_store(path: &Path) -> Result<MemoryStore> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading data store {}", path.display()))?;
    let store = MemoryStore::from_json(serde_json::from_str(&json)?)?;
    tracing::debug!("Loaded data store from {}", path.display());
    Ok(store)
}

fn read_ids_file(path: &Path) -> Result<Vec<Target>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading id file {}", path.display()))?;
    let mut targets = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        targets.push(Target::new(line.parse::<DataId>()?));
    }
    Ok(targets)
}

async fn run_pipeline(
    name: Option<String>,
    file: Option<PathBuf>,
    input: Option<String>,
    data: Option<PathBuf>,
    show_metadata: bool,
) -> Result<()> {
    let runtime = build_runtime(data.as_deref())?;

    let def = match (name, file) {
        (_, Some(file)) => {
            println!("🚀 Loading pipeline from: {}", file.display());
            let def_json = std::fs::read_to_string(&file)?;
            serde_json::from_str::<PipelineDef>(&def_json)?
        }
        (Some(name), None) => runtime.registry().composite(&name)?.clone(),
        (None, None) => anyhow::bail!("either --name or --file is required"),
    };

    println!("📋 Pipeline: {}", def.name);
    if let Some(description) = &def.description {
        println!("   {}", description);
    }
    println!();

    let input = match input {
        Some(raw) => Value::from_plain_json(serde_json::from_str(&raw)?),
        None => Value::Null,
    };

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::PipelineStarted { pipeline, .. } => {
                    println!("▶️  Pipeline {} started", pipeline);
                }
                ExecutionEvent::NodeStarted { node, kind, .. } => {
                    println!("  ⚡ Starting {}: {}", kind, node);
                }
                ExecutionEvent::NodeCompleted { node, duration_ms, .. } => {
                    println!("  ✅ {} completed in {}ms", node, duration_ms);
                }
                ExecutionEvent::NodeSkipped { node, .. } => {
                    println!("  ⏭️  {} already complete", node);
                }
                ExecutionEvent::NodeFailed { node, error, .. } => {
                    println!("  ❌ {} failed: {}", node, error);
                }
                ExecutionEvent::NodeEvent { node, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node, message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", node, percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", node, percent);
                        }
                    }
                },
                ExecutionEvent::PipelineCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Pipeline completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Pipeline failed after {}ms", duration_ms);
                    }
                }
                _ => {}
            }
        }
    });

    let run = runtime.run_definition(&def, input).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    let run = run?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", run.result.execution_id);
    println!(
        "   Completed: {}/{} nodes",
        run.result.completed_nodes, run.result.total_nodes
    );

    if let Some(root) = run.pipeline.root() {
        println!();
        print!("{}", piperuntime::ascii_tree(&run.pipeline, root));
    }

    println!();
    println!("📤 Output:");
    println!(
        "{}",
        serde_json::to_string_pretty(&run.result.output.to_plain_json())?
    );

    if show_metadata {
        println!();
        println!("🗂️  Metadata:");
        for (key, value) in run.pipeline.full_metadata().await.iter() {
            println!("   {} = {}", key, value.to_plain_json());
        }
    }

    Ok(())
}

async fn run_batch(desc: RunDescriptor, data: Option<&Path>) -> Result<()> {
    let runtime = build_runtime(data)?;
    let task_type = desc.task_type.clone();
    let targets = desc.targets.len();

    println!("🚀 Running {} over {} targets", task_type, targets);

    let report = runtime.run_batch(desc).await?;

    println!();
    println!("📊 Batch Summary:");
    println!("   Batch ID: {}", report.batch_id);
    println!("   State: {}", report.state);
    println!(
        "   Succeeded: {}  Failed: {}  ({}ms)",
        report.succeeded, report.failed, report.duration_ms
    );

    for result in &report.results {
        match (&result.result, &result.error) {
            (Some(value), _) => println!("   ✅ {}: {}", result.data_id, value.to_plain_json()),
            (None, Some(error)) => println!("   ❌ {}: {}", result.data_id, error),
            (None, None) => println!("   ❌ {}", result.data_id),
        }
    }

    Ok(())
}

fn list_nodes() {
    let registry = build_registry();

    println!("📦 Available Task Types:");
    println!();
    for task_type in registry.list_task_types() {
        if let Some(metadata) = registry.get_metadata(&task_type) {
            println!("  • {} ({})", task_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", task_type);
        }
    }

    println!();
    println!("🧩 Composites:");
    println!();
    for name in registry.list_composites() {
        match registry.composite(&name).ok().and_then(|d| d.description.clone()) {
            Some(description) => {
                println!("  • {}", name);
                println!("    {}", description);
            }
            None => println!("  • {}", name),
        }
    }
}

fn create_example_pipeline(output: PathBuf) -> Result<()> {
    let def = PipelineDef::new(
        "example_stats",
        NodeSpec::sequential(
            "example_stats",
            vec![
                NodeSpec::task("debug.log")
                    .with_name("announce")
                    .with_config("message", "computing statistics"),
                NodeSpec::parallel(
                    "stats",
                    vec![
                        NodeSpec::task("stats.mean").with_config("num_sigma_clip", 3.0),
                        NodeSpec::task("stats.std"),
                    ],
                ),
            ],
        ),
    )
    .with_description("Logs a message, then computes mean and standard deviation in parallel");

    // Save to file
    let json = serde_json::to_string_pretty(&def)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example pipeline: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  pipe run --file {} --input '{{\"samples\": [1, 2, 3, 4, 100]}}'",
        output.display()
    );

    Ok(())
}
