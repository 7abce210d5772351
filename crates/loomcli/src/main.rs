use anyhow::Result;
use clap::{Parser, Subcommand};
use loomcore::{ExecutionEvent, NodeSpec, Value};
use loomruntime::{FlowRequest, LoomRuntime, RuntimeConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run {
        /// Path to flow request JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Extra input values as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow request JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn build_runtime() -> Arc<LoomRuntime> {
    let mut registry = loomruntime::NodeRegistry::new();
    loomnodes::register_all(&mut registry);
    Arc::new(LoomRuntime::with_registry(
        Arc::new(registry),
        RuntimeConfig::default(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };
            tracing_subscriber::fmt().with_max_level(level).init();

            run_flow(file, input).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn load_request(file: &PathBuf) -> Result<FlowRequest> {
    let json = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&json)?)
}

async fn run_flow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());

    let mut request = load_request(&file)?;

    println!("📋 Workflow: {}", request.workflow_id);
    println!("   Nodes: {}", request.nodes.len());
    println!("   Edges: {}", request.edges.len());
    println!();

    if let Some(input_str) = input {
        let json: serde_json::Value = serde_json::from_str(&input_str)?;
        let serde_json::Value::Object(obj) = json else {
            return Err(anyhow::anyhow!("Input must be a JSON object"));
        };
        for (key, value) in obj {
            request.inputs.insert(key, Value::from_json(value));
        }
    }

    let runtime = build_runtime();
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowStarted { .. } => {
                    println!("▶️  Flow started");
                }
                ExecutionEvent::NodeStatus {
                    node_id,
                    spec_id,
                    status,
                    error,
                    ..
                } => match error {
                    Some(error) => println!("  ❌ {} ({}) → {:?}: {}", node_id, spec_id, status, error),
                    None => println!("  ⚡ {} ({}) → {:?}", node_id, spec_id, status),
                },
                ExecutionEvent::NodeToken { delta, .. } => {
                    print!("{delta}");
                }
                ExecutionEvent::NodeLog { node_id, message, .. } => {
                    println!("     ℹ️  [{}] {}", node_id, message);
                }
                ExecutionEvent::FlowCompleted {
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("✨ Flow finished: {:?} in {}ms", status, duration_ms);
                }
            }
        }
    });

    let result = runtime.run_flow(request).await?;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {:?}", result.workflow_status);

    if !result.final_outputs.is_empty() {
        println!();
        println!("📤 Final outputs:");
        for output in &result.final_outputs {
            println!("   {}: {}", output.node_id, output.value.to_text());
        }
    }

    println!();
    println!("🧾 Node traces:");
    for trace in &result.node_traces {
        let duration = trace.end_ms - trace.start_ms;
        let mut line = format!(
            "   {} ({}) {:?} {}ms retries={}",
            trace.node_id, trace.spec_id, trace.status, duration, trace.retries
        );
        if let Some(tokens) = trace.tokens {
            line.push_str(&format!(" tokens={tokens}"));
        }
        if let Some(error) = &trace.error {
            line.push_str(&format!(" error={error}"));
        }
        println!("{line}");
    }

    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let request = load_request(&file)?;
    let runtime = build_runtime();

    match runtime.validate(&request) {
        Ok(()) => {
            println!("✅ Flow is valid:");
            println!("   Workflow: {}", request.workflow_id);
            println!("   Nodes: {}", request.nodes.len());
            println!("   Edges: {}", request.edges.len());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("invalid flow: {e}")),
    }
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let runtime = build_runtime();
    let registry = runtime.registry();

    for spec_id in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&spec_id) {
            println!("  • {} ({})", spec_id, metadata.category);
            if !metadata.description.is_empty() {
                println!("    {}", metadata.description);
            }
        } else {
            println!("  • {}", spec_id);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut request = FlowRequest {
        workflow_id: "example-greeting".to_string(),
        nodes: Vec::new(),
        edges: Vec::new(),
        inputs: HashMap::new(),
        metadata: Default::default(),
    };

    request.nodes.push(NodeSpec::new("name", "input").with_config("name", "name"));
    request.nodes.push(
        NodeSpec::new("greeting", "template")
            .with_config("template", "Hello {{input}}, welcome to the loom!"),
    );
    request
        .nodes
        .push(NodeSpec::new("result", "output").with_config("format", "text"));

    request.edges.push(loomcore::Edge {
        source: "name".into(),
        target: "greeting".into(),
        source_handle: None,
        target_handle: None,
    });
    request.edges.push(loomcore::Edge {
        source: "greeting".into(),
        target: "result".into(),
        source_handle: None,
        target_handle: None,
    });

    request
        .inputs
        .insert("name".to_string(), Value::String("world".to_string()));

    let json = serde_json::to_string_pretty(&request)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  loom run --file {} --input '{{\"name\": \"Ada\"}}'", output.display());

    Ok(())
}
