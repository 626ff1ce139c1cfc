use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use flowpilot::{
    flow::ExecutorConfig,
    providers::openai::{OpenAI, OpenAIConfig},
    FileStore, FlowDocument, FlowEvent, FlowExecutor, FlowRepository, LLMProvider, SettingsCipher,
    KNOWN_MODELS,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowpilot")]
#[command(about = "Run and manage prompt flows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a flow document, streaming node output to stdout
    Run {
        /// Flow document (.json, .yaml or .yml)
        file: PathBuf,

        #[command(flatten)]
        credentials: Credentials,

        /// Pause after each prompt node, in milliseconds
        #[arg(long, default_value_t = 100)]
        node_delay_ms: u64,
    },
    /// Validate a flow document and print its execution order
    Order {
        file: PathBuf,
    },
    /// Check that the API key is accepted by the model service
    Probe {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// List the models flows usually target
    Models,
    /// Save a flow document into a local store
    Save {
        file: PathBuf,

        /// Store directory
        #[arg(long, env = "FLOWPILOT_DATA_DIR", default_value = "data")]
        store: PathBuf,
    },
    /// List the flows saved in a local store
    List {
        #[arg(long, env = "FLOWPILOT_DATA_DIR", default_value = "data")]
        store: PathBuf,
    },
    /// Read and write settings in a local store
    Setting {
        #[command(subcommand)]
        action: SettingAction,

        #[arg(long, env = "FLOWPILOT_DATA_DIR", default_value = "data")]
        store: PathBuf,

        /// Passphrase for encrypted settings
        #[arg(long, env = "FLOWPILOT_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingAction {
    Set {
        key: String,
        value: String,

        /// Store the value encrypted
        #[arg(long)]
        encrypted: bool,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
}

#[derive(Args)]
struct Credentials {
    /// Model service API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model service base URL
    #[arg(long, env = "OPENAI_BASE_URL")]
    base_url: Option<String>,

    /// Organization the requests are billed to
    #[arg(long, env = "OPENAI_ORGANIZATION")]
    organization: Option<String>,

    /// Project the requests are scoped to
    #[arg(long, env = "OPENAI_PROJECT")]
    project: Option<String>,

    /// Per-request timeout, in seconds
    #[arg(long, env = "OPENAI_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,
}

impl Credentials {
    fn provider(self) -> Result<OpenAI, flowpilot::LLMError> {
        let mut config = OpenAIConfig::new(self.api_key)
            .with_timeout(Duration::from_secs(self.timeout_secs));
        if let Some(base_url) = self.base_url {
            config = config.with_base_url(base_url);
        }
        if let Some(organization) = self.organization {
            config = config.with_organization(organization);
        }
        if let Some(project) = self.project {
            config = config.with_project(project);
        }
        OpenAI::from_config(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,flowpilot=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            file,
            credentials,
            node_delay_ms,
        } => {
            let document = load_document(&file)?;
            let provider: Arc<dyn LLMProvider> = Arc::new(credentials.provider()?);
            let executor = FlowExecutor::new(provider).with_config(ExecutorConfig {
                node_delay: Duration::from_millis(node_delay_ms),
            });

            let (sender, mut receiver) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                let mut streamed = false;
                while let Some(event) = receiver.recv().await {
                    print_event(&event, &mut streamed);
                }
            });

            let result = executor.run(&document.graph(), &sender).await;
            drop(sender);
            printer.await?;

            match result {
                Ok(run) => {
                    println!("\nCompleted {} node(s).", run.context.len());
                }
                Err(error) => {
                    eprintln!("\nFlow aborted: {error}");
                    std::process::exit(1);
                }
            }
        }
        Command::Order { file } => {
            let document = load_document(&file)?;
            let graph = document.graph();
            let order = graph.execution_order()?;
            for (position, node) in order.iter().enumerate() {
                println!("{:>3}. {} ({})", position + 1, node.id, node.kind.name());
            }
        }
        Command::Probe { credentials } => {
            let provider = credentials.provider()?;
            if provider.probe().await {
                println!("Credential accepted.");
            } else {
                eprintln!("Credential rejected or service unreachable.");
                std::process::exit(1);
            }
        }
        Command::Models => {
            for model in KNOWN_MODELS {
                println!("{:<16} {:<16} max tokens {}", model.id, model.name, model.max_tokens);
            }
        }
        Command::Save { file, store } => {
            let document = load_document(&file)?;
            let store = Arc::new(FileStore::open(store).await?);
            let repository = FlowRepository::new(store.clone());
            let saved = repository.save_flow(document).await?;
            store.shutdown();
            println!(
                "Saved flow `{}` ({}) in {}.",
                saved.id,
                saved.name,
                store.root().display()
            );
        }
        Command::List { store } => {
            let store = Arc::new(FileStore::open(store).await?);
            let repository = FlowRepository::new(store.clone());
            for flow in repository.list_flows().await? {
                println!(
                    "{:<24} {:<32} {} node(s), {} edge(s)",
                    flow.id,
                    flow.name,
                    flow.nodes.len(),
                    flow.edges.len()
                );
            }
            store.shutdown();
        }
        Command::Setting {
            action,
            store,
            secret,
        } => {
            let store = Arc::new(FileStore::open(store).await?);
            let mut repository = FlowRepository::new(store.clone());
            if let Some(secret) = secret {
                repository = repository.with_cipher(SettingsCipher::from_passphrase(&secret));
            }

            let result = run_setting(&repository, action).await;
            store.shutdown();
            result?;
        }
    }

    Ok(())
}

async fn run_setting(
    repository: &FlowRepository,
    action: SettingAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        SettingAction::Set {
            key,
            value,
            encrypted,
        } => {
            repository.save_setting(&key, &value, encrypted).await?;
            println!("Saved setting `{key}`.");
        }
        SettingAction::Get { key } => match repository.get_setting(&key).await? {
            Some(value) => println!("{value}"),
            None => {
                eprintln!("Setting `{key}` is not set.");
                std::process::exit(1);
            }
        },
        SettingAction::Delete { key } => {
            if repository.delete_setting(&key).await? {
                println!("Deleted setting `{key}`.");
            } else {
                println!("Setting `{key}` was not set.");
            }
        }
    }
    Ok(())
}

fn load_document(path: &Path) -> Result<FlowDocument, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml");

    let document = if is_yaml {
        FlowDocument::from_yaml_str(&content)?
    } else {
        FlowDocument::from_json_str(&content)?
    };
    Ok(document)
}

/// `streamed` tracks whether the current node already printed its output as tokens.
fn print_event(event: &FlowEvent, streamed: &mut bool) {
    match event {
        FlowEvent::NodeStarted { node_id } => {
            *streamed = false;
            println!("\n== {node_id}");
        }
        FlowEvent::NodeToken { token, .. } => {
            *streamed = true;
            print!("{token}");
            let _ = std::io::stdout().flush();
        }
        FlowEvent::NodeCompleted { node_id, output } => {
            if !*streamed {
                print!("{output}");
            }
            println!("\n-- {node_id} done ({} chars)", output.chars().count());
        }
        FlowEvent::NodeFailed { node_id, message } => eprintln!("\n!! {node_id}: {message}"),
        FlowEvent::RunCompleted | FlowEvent::RunAborted { .. } => {}
    }
}
