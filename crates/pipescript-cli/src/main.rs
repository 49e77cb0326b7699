//! CLI binary for running and checking pipeline scripts, and for managing the
//! macros and events kept in a data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};

use pipescript_engine::events::EventCommand;
use pipescript_engine::macros::{CommandMode, MacroCommand};
use pipescript_engine::{
    default_registry, Context, ExecutableScript, IncomingMessage, MacroKind, OutputSink, Runtime,
    RuntimeConfig, ScriptProcessor, TriggerKind,
};
use pipescript_types::{ErrorLog, Origin, User};

#[derive(Parser)]
#[command(name = "pipes", version, about = "Run pipeline scripts and manage their macros and events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the macro and event JSON files (default: in memory only)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Runtime configuration JSON file; `--data-dir` overrides its data_dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name to run scripts as
    #[arg(long, global = true, default_value = "cli")]
    user: String,

    /// Treat the user as trusted, lifting the flow size limit
    #[arg(long, global = true)]
    trusted: bool,

    /// Channel name used for events and remembered output
    #[arg(long, global = true, default_value = "cli")]
    channel: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script and print its output
    Run {
        /// The script, e.g. `[a|b] > upper`
        script: Option<String>,

        /// Read the script from a file instead
        #[arg(short, long, conflicts_with = "script")]
        file: Option<PathBuf>,
    },

    /// Report a script's parse errors and warnings without running it
    Check {
        script: Option<String>,

        #[arg(short, long, conflicts_with = "script")]
        file: Option<PathBuf>,
    },

    /// Read messages from stdin as if they were sent to a channel
    Chat {
        /// Prefix marking a message as a script
        #[arg(long, default_value = ">>")]
        prefix: String,
    },

    /// Manage macros
    #[command(subcommand)]
    Macro(MacroCmd),

    /// Manage events
    #[command(subcommand)]
    Event(EventCmd),
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Pipe,
    Source,
}

impl From<KindArg> for MacroKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pipe => MacroKind::Pipe,
            KindArg::Source => MacroKind::Source,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    Message,
    Reaction,
    Invoke,
}

impl From<TriggerArg> for TriggerKind {
    fn from(trigger: TriggerArg) -> Self {
        match trigger {
            TriggerArg::Message => TriggerKind::Message,
            TriggerArg::Reaction => TriggerKind::Reaction,
            TriggerArg::Invoke => TriggerKind::Invoke,
        }
    }
}

#[derive(Subcommand)]
enum MacroCmd {
    /// Define a new macro, or redefine one with --edit
    Define {
        kind: KindArg,
        name: String,
        code: String,
        #[arg(long)]
        hidden: bool,
        #[arg(long)]
        edit: bool,
    },
    /// Set a macro's description
    Describe {
        kind: KindArg,
        name: String,
        desc: String,
    },
    /// List macros of a kind
    List {
        kind: KindArg,
        /// List the hidden ones instead
        #[arg(long)]
        hidden: bool,
    },
    Show {
        kind: KindArg,
        name: String,
    },
    Delete {
        kind: KindArg,
        name: String,
    },
}

#[derive(Subcommand)]
enum EventCmd {
    /// Define a new event enabled in --channel, or redefine one with --edit
    Define {
        name: String,
        #[arg(long = "on", value_enum)]
        on: TriggerArg,
        trigger: String,
        script: String,
        #[arg(long)]
        edit: bool,
    },
    List,
    /// Send a message to --channel and run the events it triggers
    Test { message: String },
    /// Enable or disable an event in --channel
    Toggle {
        name: String,
        #[arg(long)]
        off: bool,
    },
    Delete { name: String },
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Prints script output to stdout and error logs to stderr.
struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn send_text(&self, text: &str) -> pipescript_types::Result<()> {
        println!("{text}");
        Ok(())
    }

    async fn send_error_log(&self, errors: &ErrorLog, name: &str) -> pipescript_types::Result<()> {
        eprintln!("{}:\n{}", errors.title(Some(name)), errors.render());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref(), cli.data_dir.clone()).await?;
    let rt = Arc::new(Runtime::load(config, default_registry()).await?);
    let mut user = User::new(0, cli.user.clone());
    if cli.trusted {
        user = user.trusted();
    }

    match cli.command {
        Commands::Run { script, file } => {
            let script = script_text(script, file.as_deref()).await?;
            cmd_run(&rt, &script, user, &cli.channel).await?;
        }
        Commands::Check { script, file } => {
            let script = script_text(script, file.as_deref()).await?;
            cmd_check(&rt, &script);
        }
        Commands::Chat { prefix } => cmd_chat(rt, &prefix, user, &cli.channel).await?,
        Commands::Macro(cmd) => cmd_macro(&rt, cmd, &user).await?,
        Commands::Event(cmd) => cmd_event(rt, cmd, &user, &cli.channel).await?,
    }

    Ok(())
}

async fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    Ok(config)
}

async fn script_text(script: Option<String>, file: Option<&Path>) -> anyhow::Result<String> {
    match (script, file) {
        (Some(script), _) => Ok(script),
        (None, Some(file)) => Ok(tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading script {}", file.display()))?),
        (None, None) => anyhow::bail!("Provide a script or --file"),
    }
}

async fn cmd_run(rt: &Arc<Runtime>, script: &str, user: User, channel: &str) -> anyhow::Result<()> {
    let ctx = Context::new(rt.clone(), Origin::direct(user), Arc::new(StdoutSink)).with_channel(channel);
    ExecutableScript::from_string(script, rt).execute(&ctx, None).await?;
    Ok(())
}

fn cmd_check(rt: &Runtime, script: &str) {
    let parsed = ExecutableScript::from_string(script, rt);
    let errors = parsed.get_static_errors();
    if errors.is_empty() {
        println!("Script is valid: {parsed}");
        return;
    }
    println!("{}:\n{}", errors.title(None), errors.render());
    if errors.is_terminal() {
        std::process::exit(1);
    }
}

async fn cmd_chat(rt: Arc<Runtime>, prefix: &str, user: User, channel: &str) -> anyhow::Result<()> {
    let processor = ScriptProcessor::new(rt, prefix);
    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = IncomingMessage::new(user.clone(), channel, line);
        if !processor.interpret_message(&message, sink.clone()).await? {
            processor.on_message(&message, sink.clone()).await?;
        }
    }
    Ok(())
}

async fn cmd_macro(rt: &Runtime, cmd: MacroCmd, user: &User) -> anyhow::Result<()> {
    let sink = StdoutSink;
    match cmd {
        MacroCmd::Define {
            kind,
            name,
            code,
            hidden,
            edit,
        } => {
            let command = MacroCommand {
                mode: if edit { CommandMode::Edit } else { CommandMode::New },
                kind: kind.into(),
                visible: !hidden,
                name: name.to_lowercase(),
                body: code,
            };
            command.run(user, rt, &sink).await?;
        }
        MacroCmd::Describe { kind, name, desc } => {
            let command = MacroCommand {
                mode: CommandMode::Desc,
                kind: kind.into(),
                visible: true,
                name: name.to_lowercase(),
                body: desc,
            };
            command.run(user, rt, &sink).await?;
        }
        MacroCmd::List { kind, hidden } => {
            let kind = MacroKind::from(kind);
            let macros = if hidden {
                rt.macros.hidden(kind)
            } else {
                rt.macros.visible(kind)
            };
            if macros.is_empty() {
                println!("No {} macros.", kind.as_str().to_lowercase());
            }
            for m in macros {
                match &m.desc {
                    Some(desc) => println!("{}: {desc}", m.name),
                    None => println!("{}", m.name),
                }
            }
        }
        MacroCmd::Show { kind, name } => match rt.macros.get(kind.into(), &name.to_lowercase()) {
            Some(m) => println!("{m}"),
            None => anyhow::bail!("No such macro: {name}"),
        },
        MacroCmd::Delete { kind, name } => {
            let kind = MacroKind::from(kind);
            let name = name.to_lowercase();
            let Some(m) = rt.macros.get(kind, &name) else {
                anyhow::bail!("No such macro: {name}");
            };
            if !m.authorised(user) {
                anyhow::bail!("You are not authorised to delete that macro.");
            }
            rt.macros.remove(kind, &name).await?;
            println!("Deleted {} macro `{name}`.", kind.as_str().to_lowercase());
        }
    }
    Ok(())
}

async fn cmd_event(rt: Arc<Runtime>, cmd: EventCmd, user: &User, channel: &str) -> anyhow::Result<()> {
    let sink = StdoutSink;
    match cmd {
        EventCmd::Define {
            name,
            on,
            trigger,
            script,
            edit,
        } => {
            let command = EventCommand {
                edit,
                name: name.to_lowercase(),
                kind: on.into(),
                trigger,
                script,
            };
            command.run(user, channel, &rt, &sink).await?;
        }
        EventCmd::List => {
            if rt.events.is_empty() {
                println!("No events.");
            }
            for event in rt.events.list() {
                let state = if event.is_enabled(channel) { "enabled" } else { "disabled" };
                println!("{event} ({state} in {channel})");
            }
        }
        EventCmd::Test { message } => {
            let processor = ScriptProcessor::new(rt, ">>");
            let message = IncomingMessage::new(user.clone(), channel, message);
            let ran = processor.on_message(&message, Arc::new(StdoutSink)).await?;
            tracing::info!(events = ran, "Message processed");
        }
        EventCmd::Toggle { name, off } => {
            if !rt.events.set_enabled(&name, channel, !off).await? {
                anyhow::bail!("No such event: {name}");
            }
            println!("Event `{name}` {}abled in {channel}.", if off { "dis" } else { "en" });
        }
        EventCmd::Delete { name } => match rt.events.remove(&name).await? {
            Some(_) => println!("Deleted event `{name}`."),
            None => anyhow::bail!("No such event: {name}"),
        },
    }
    Ok(())
}
