mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tabrelay_core::Product;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabrelay")]
#[command(about = "Drive chat tabs in a real browser through a local relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Relay port (overrides config relay.port)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Chat product to drive (chatgpt, grok)
    #[arg(long, global = true, default_value = "chatgpt")]
    product: Product,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Relay,

    /// Ask several questions in parallel, one new tab each
    Search {
        /// Questions to ask
        #[arg(required = true)]
        questions: Vec<String>,

        #[command(flatten)]
        setup: SetupArgs,

        #[command(flatten)]
        wait: WaitArgs,

        /// Close the tabs afterwards instead of keeping them for `chat`
        #[arg(long)]
        close_tabs: bool,
    },

    /// Ask questions one after another in a single tab
    Search1 {
        /// Questions to ask
        #[arg(required = true)]
        questions: Vec<String>,

        /// Reuse this open tab instead of opening a new one
        #[arg(long)]
        tab: Option<i64>,

        #[command(flatten)]
        setup: SetupArgs,

        #[command(flatten)]
        wait: WaitArgs,

        /// Close the tab afterwards
        #[arg(long)]
        close_tabs: bool,
    },

    /// Continue the conversation in a session tab
    Chat {
        /// Messages to send, in order
        #[arg(required = true)]
        messages: Vec<String>,

        /// Tab to continue in (default: the active session tab)
        #[arg(long, conflicts_with = "topic")]
        tab: Option<i64>,

        /// Continue the session tab saved under this topic
        #[arg(long)]
        topic: Option<String>,

        /// Files to attach before the first message
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        #[command(flatten)]
        wait: WaitArgs,

        /// Send without waiting for the answers
        #[arg(long)]
        no_wait: bool,
    },

    /// Read the current answer of a tab once
    Recover {
        /// Tab id, reopened from the session registry when closed
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        tab: Option<i64>,

        /// Conversation url to open and read
        #[arg(long)]
        url: Option<String>,

        /// Attachments whose name badges should be stripped from the answer
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },

    /// List open browser tabs
    Tabs,

    /// Show relay, extension and session status
    Status,
}

/// How each new tab is prepared before the question goes out.
#[derive(Args, Clone, Debug, Default)]
pub struct SetupArgs {
    /// Model to select in the tab
    #[arg(long)]
    pub model: Option<String>,

    /// Reasoning intensity (chatgpt only)
    #[arg(long)]
    pub thinking: Option<String>,

    /// Product mode, e.g. "deep research"
    #[arg(long)]
    pub mode: Option<String>,

    /// Files to attach to every tab
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,
}

/// Completion detector overrides.
#[derive(Args, Clone, Debug, Default)]
pub struct WaitArgs {
    /// Give up on an answer after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds between answer polls
    #[arg(long)]
    pub poll_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON results.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = commands::Context::load(cli.port, cli.product)?;

    match cli.command {
        Commands::Relay => {
            commands::relay::run(&ctx).await?;
        }
        Commands::Search {
            questions,
            setup,
            wait,
            close_tabs,
        } => {
            commands::search::run(ctx.with_wait(&wait), &questions, &setup, close_tabs).await?;
        }
        Commands::Search1 {
            questions,
            tab,
            setup,
            wait,
            close_tabs,
        } => {
            commands::search::run_single(ctx.with_wait(&wait), &questions, tab, &setup, close_tabs).await?;
        }
        Commands::Chat {
            messages,
            tab,
            topic,
            files,
            wait,
            no_wait,
        } => {
            commands::chat::run(ctx.with_wait(&wait), &messages, tab, topic.as_deref(), files, !no_wait).await?;
        }
        Commands::Recover { tab, url, files } => {
            commands::recover::run(&ctx, tab, url, &files).await?;
        }
        Commands::Tabs => {
            commands::tabs::run(&ctx).await?;
        }
        Commands::Status => {
            commands::status::run(&ctx).await?;
        }
    }

    Ok(())
}
