use chat_history::catalog::ModelCatalog;
use chat_history::config::{AppConfig, StorageConfig};
use chat_history::core::{Conversation, MessageRole};
use chat_history::provider::anthropic;
use chat_history::session::{self, ChatSession};
use chat_history::storage::ConversationStore;
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "chat-history")]
#[command(about = "Chat with Claude and browse the saved conversation history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file (overrides CHAT_DB_PATH)
    #[arg(long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations, most recently updated first
    List {
        /// Include archived conversations
        #[arg(long)]
        archived: bool,
    },
    /// Search conversation titles and message contents
    Search { query: String },
    /// Display a conversation with all of its messages
    Show { id: i32 },
    /// Change the title of a conversation
    Rename { id: i32, title: String },
    /// Hide a conversation from the default listing
    Archive { id: i32 },
    /// Permanently delete a conversation and its messages
    Delete { id: i32 },
    /// Replace the tags of a conversation
    Tag { id: i32, tags: Vec<String> },
    /// Show totals across the whole database
    Stats,
    /// Write a conversation to a JSON file
    Export { id: i32, path: PathBuf },
    /// List the available models and their prices
    Models,
    /// Start an interactive chat
    Chat {
        /// Continue an existing conversation
        #[arg(long)]
        resume: Option<i32>,
        /// Model key, e.g. sonnet-4
        #[arg(long)]
        model: Option<String>,
    },
}

// Setup tracing. The returned guard flushes the log file on drop.
fn init_tracing(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-history.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn print_conversation_line(c: &Conversation) {
    let archived = if c.is_archived { " [archived]" } else { "" };
    println!(
        "{:>5}  {}  {:<50}  {:>3} msgs  {:>7} tokens  ${:.4}  {}{}",
        c.id,
        c.updated_at.format("%Y-%m-%d %H:%M"),
        c.title,
        c.message_count,
        c.total_tokens,
        c.total_cost,
        c.model_name,
        archived
    );
}

fn load_catalog(config: &AppConfig) -> Result<ModelCatalog, Box<dyn Error>> {
    Ok(match &config.models_file {
        Some(path) => ModelCatalog::from_file(Path::new(path))?,
        None => ModelCatalog::default(),
    })
}

async fn run_chat(
    store: Arc<ConversationStore>,
    config: &AppConfig,
    resume: Option<i32>,
    model: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let api_key = config
        .api_key
        .clone()
        .ok_or("Please provide ANTHROPIC_API_KEY or CHAT_API_KEY env var")?;
    let provider = anthropic::Agent::new(&anthropic::Config {
        endpoint: config.endpoint.clone(),
        api_key,
    });
    let catalog = Arc::new(load_catalog(config)?);
    let session_cfg = session::Config {
        model: model.unwrap_or_else(|| config.model.clone()),
        system_prompt: Some(config.system_prompt.clone()),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };
    let mut chat = ChatSession::new(&session_cfg, provider, store, catalog)?;
    if let Some(id) = resume {
        chat.resume(id)?;
        for turn in chat.history() {
            let who = match turn.role {
                MessageRole::User => "You",
                MessageRole::Assistant => "Claude",
            };
            println!("{who}: {}\n", turn.content);
        }
    }
    println!(
        "Model: {}. Commands: /new, /model <key>, /stats, /quit",
        chat.model().name
    );

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                chat.start_new();
                println!("Started a new conversation.");
                continue;
            }
            "/stats" => {
                let stats = chat.stats();
                println!(
                    "Session: {} replies, {} input tokens, {} output tokens, ${:.4}",
                    stats.message_count, stats.input_tokens, stats.output_tokens, stats.cost
                );
                continue;
            }
            _ => {}
        }
        if let Some(key) = line.strip_prefix("/model ") {
            match chat.set_model(key.trim()) {
                Ok(()) => println!("Using {}.", chat.model().name),
                Err(e) => println!("{e}"),
            }
            continue;
        }

        match chat.send(line).await {
            Ok(reply) => {
                println!("\n{}\n", reply.content);
                let saved = if reply.persisted { "" } else { " (not saved)" };
                println!(
                    "[{} in / {} out, ${:.4}]{saved}",
                    reply.input_tokens, reply.output_tokens, reply.cost
                );
            }
            Err(e) => println!("Error: {e}"),
        }
    }
    Ok(())
}

async fn run(cli: Cli, app_config: AppConfig) -> Result<(), Box<dyn Error>> {
    // Read in configuration from OS env.
    let mut storage_cfg = StorageConfig::from_env()?;
    if let Some(path) = cli.database {
        storage_cfg.path = path;
    }

    // Models do not need the database
    if let Commands::Models = cli.command {
        for m in load_catalog(&app_config)?.models() {
            println!(
                "{:<12} {:<30} ${:>6.2}/M in  ${:>6.2}/M out  {}",
                m.key, m.id, m.input_cost, m.output_cost, m.name
            );
        }
        return Ok(());
    }

    let store = Arc::new(ConversationStore::new(&storage_cfg)?);

    match cli.command {
        Commands::List { archived } => {
            for c in store.list_conversations(archived)? {
                print_conversation_line(&c);
            }
        }
        Commands::Search { query } => {
            for c in store.search_conversations(&query)? {
                print_conversation_line(&c);
            }
        }
        Commands::Show { id } => {
            let conv = store
                .get_conversation_with_messages(id)?
                .ok_or(format!("Conversation {id} not found"))?;
            print_conversation_line(&conv.conversation);
            if let Some(prompt) = &conv.conversation.system_prompt {
                println!("System: {prompt}");
            }
            if !conv.conversation.tags.is_empty() {
                println!("Tags: {}", conv.conversation.tags.join(", "));
            }
            for m in &conv.messages {
                println!(
                    "\n[{}] {} ({} tokens, ${:.4})\n{}",
                    m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    m.role,
                    m.tokens(),
                    m.cost,
                    m.content
                );
            }
        }
        Commands::Rename { id, title } => store.update_title(id, &title)?,
        Commands::Archive { id } => store.archive_conversation(id)?,
        Commands::Delete { id } => store.delete_conversation(id)?,
        Commands::Tag { id, tags } => store.set_tags(id, &tags)?,
        Commands::Stats => {
            let stats = store.get_statistics()?;
            println!("Conversations: {}", stats.total_conversations);
            println!("Messages:      {}", stats.total_messages);
            println!("Tokens:        {}", stats.total_tokens);
            println!("Cost:          ${:.4}", stats.total_cost);
            for (model, count) in &stats.model_usage {
                println!("  {model}: {count}");
            }
        }
        Commands::Export { id, path } => {
            store.export_conversation_to_file(id, &path)?;
            println!("Exported conversation {id} to {}", path.display());
        }
        Commands::Chat { resume, model } => run_chat(store, &app_config, resume, model).await?,
        Commands::Models => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let app_config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_tracing(app_config.log_dir.as_deref());

    match run(cli, app_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
