use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flowcore::{
    ExecArg, ExecutionEvent, GraphSpec, NodeSpec, OpSpec, OutputKind, Repository, Resources, Value,
    GIB,
};
use flowexec::{ExecMode, FileAssoc, FileRepository, LocalExecutor};
use flowruntime::{
    CacheCoordinator, ContinuationRegistry, ExecutorPool, FactoryKind, FlowRuntime, GraphLoader,
    ResultCache, RuntimeConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Evaluate content-addressed flow graphs", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a graph file and print the root's value
    Run {
        /// Path to graph JSON file
        file: PathBuf,

        /// Directory holding the repository and result cache
        #[arg(short, long, default_value = ".flow")]
        repo: PathBuf,

        /// How execs are run
        #[arg(short, long, value_enum, default_value_t = Mode::Shell)]
        mode: Mode,

        /// CPUs available to execs (defaults to the machine's)
        #[arg(long)]
        cpu: Option<u64>,

        /// Memory available to execs, in GiB
        #[arg(long, default_value_t = 8)]
        memory_gib: u64,
    },

    /// Check that a graph file loads
    Validate {
        file: PathBuf,
    },

    /// Print the digest of a graph file's root
    Digest {
        file: PathBuf,
    },

    /// List available continuations and mappers
    Continuations,

    /// Write an example graph file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Shell,
    Docker,
}

impl From<Mode> for ExecMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Shell => ExecMode::Shell,
            Mode::Docker => ExecMode::Docker,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            repo,
            mode,
            cpu,
            memory_gib,
        } => {
            let cpu = match cpu {
                Some(cpu) => cpu,
                None => std::thread::available_parallelism().map(|n| n.get() as u64).unwrap_or(1),
            };
            let capacity = Resources::new(cpu, memory_gib * GIB, u64::MAX);
            run_graph(file, repo, mode.into(), capacity, config).await?;
        }

        Commands::Validate { file } => {
            validate_graph(&file)?;
        }

        Commands::Digest { file } => {
            let spec = GraphLoader::read(&file)?;
            let registry = registry();
            let (graph, root) = GraphLoader::new(&registry).load(&spec)?;
            println!("{}", graph.digest(root));
        }

        Commands::Continuations => {
            list_continuations();
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn registry() -> ContinuationRegistry {
    let mut registry = ContinuationRegistry::new();
    flowexec::register_all(&mut registry);
    registry
}

async fn run_graph(
    file: PathBuf,
    repo: PathBuf,
    mode: ExecMode,
    capacity: Resources,
    config: RuntimeConfig,
) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());
    let spec = GraphLoader::read(&file)?;

    let repository: Arc<dyn Repository> = Arc::new(FileRepository::open(&repo)?);
    let results = ResultCache::new(Arc::clone(&repository), Arc::new(FileAssoc::open(&repo)?))
        .with_retry(config.eval.retry.clone());
    let executor = LocalExecutor::new("local", capacity, repository).with_mode(mode);
    let runtime = FlowRuntime::with_config(
        ExecutorPool::single(Arc::new(executor)),
        CacheCoordinator::with_results(results),
        config,
    )
    .with_registry(Arc::new(registry()));

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::EvaluationStarted { nodes, .. } => {
                    println!("▶️  Evaluation started ({} nodes)", nodes);
                }
                ExecutionEvent::NodeDispatched {
                    node_id,
                    op,
                    executor,
                    attempt,
                    ..
                } => {
                    println!("  ⚡ {} {} on {} (attempt {})", op, node_id, executor, attempt);
                }
                ExecutionEvent::NodeRetrying { node_id, delay_ms, error, .. } => {
                    println!("  🔁 {} retrying in {}ms: {}", node_id, delay_ms, error);
                }
                ExecutionEvent::NodeCacheHit { node_id, digest, .. } => {
                    println!("  💾 {} cached ({})", node_id, digest.short());
                }
                ExecutionEvent::NodeCompleted { node_id, duration_ms, .. } => {
                    println!("  ✅ {} completed in {}ms", node_id, duration_ms);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ {} failed: {}", node_id, error);
                }
                ExecutionEvent::GraphSpliced { node_id, added, .. } => {
                    println!("  🧩 {} spliced {} node(s)", node_id, added);
                }
                ExecutionEvent::EvaluationCompleted { success, duration_ms, .. } => {
                    if success {
                        println!("✨ Evaluation completed in {}ms", duration_ms);
                    } else {
                        println!("💥 Evaluation failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling evaluation");
            on_interrupt.cancel();
        }
    });

    let result = runtime.evaluate_spec(&spec, cancel).await;

    // Let the event printer drain before the summary.
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let value: Value = result?;
    println!();
    println!("📤 Result:");
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let spec = GraphLoader::read(file)?;
    let registry = registry();
    let (graph, root) = GraphLoader::new(&registry).load(&spec)?;

    println!("✅ Graph is valid:");
    println!("   Name: {}", spec.name.as_deref().unwrap_or("<unnamed>"));
    println!("   Nodes: {} ({} distinct)", spec.nodes.len(), graph.len());
    println!("   Root: {} ({})", spec.root, graph.digest(root));

    Ok(())
}

fn list_continuations() {
    println!("📦 Available continuations and mappers:");
    println!();

    let registry = registry();
    for (name, kind) in registry.list() {
        let kind = match kind {
            FactoryKind::Continuation => "continuation",
            FactoryKind::Mapper => "mapper",
        };
        match registry.get_metadata(&name) {
            Some(metadata) => {
                println!("  • {} ({}, {})", name, kind, metadata.category);
                println!("    {}", metadata.description);
                for param in metadata.params {
                    let required = if param.required { " (required)" } else { "" };
                    println!("      {}{}: {}", param.name, required, param.description);
                }
            }
            None => println!("  • {} ({})", name, kind),
        }
    }
}

fn create_example_graph(output: &Path) -> Result<()> {
    let mut spec = GraphSpec::new("Line counts", "counts");
    spec.description = Some("Counts the lines of a file, and of each file in a directory".to_string());

    spec.add_node(NodeSpec::new(
        "text",
        OpSpec::Intern {
            url: "file:///etc/hosts".to_string(),
        },
    ));
    spec.add_node(
        NodeSpec::new(
            "lines",
            OpSpec::Exec {
                image: "ubuntu".to_string(),
                cmd: "wc -l < %s > %s".to_string(),
                args: vec![ExecArg::Dep(0), ExecArg::Out(0)],
                outputs: vec![OutputKind::File],
                resources: Resources::new(1, 0, 0),
            },
        )
        .with_dep("text"),
    );
    spec.add_node(NodeSpec::new(
        "docs",
        OpSpec::Intern {
            url: "file:///usr/share/doc/bash".to_string(),
        },
    ));
    let mut params = std::collections::BTreeMap::new();
    params.insert("cmd".to_string(), Value::from("wc -l < %s > %s"));
    params.insert("cpu".to_string(), Value::from(1));
    spec.add_node(
        NodeSpec::new(
            "doc_lines",
            OpSpec::Map {
                mapper: "exec_each".to_string(),
                params: Value::Map(params),
            },
        )
        .with_dep("docs"),
    );
    spec.add_node(
        NodeSpec::new("counts", OpSpec::Tuple)
            .with_dep("lines")
            .with_dep("doc_lines"),
    );

    let json = serde_json::to_string_pretty(&spec)?;
    std::fs::write(output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run {}", output.display());

    Ok(())
}
