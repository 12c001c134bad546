//! AgentGate command-line front end
//!
//! Drives the gateway core directly from a terminal: one-shot queries,
//! interactive chat sessions and skill listing.

use agentgate_core::{
    ChatRequest, CreateSessionRequest, Gateway, GatewayConfig, OutputFormat, PermissionMode,
    QueryRequest, TurnResult, WireEvent, WireFrame,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::{Stream, StreamExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// AgentGate - sessions and streaming over an agent CLI
#[derive(Parser, Debug)]
#[command(name = "agentgate", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Agent executable (overrides config)
    #[arg(long, global = true)]
    agent_command: Option<String>,

    /// MCP server config providing the built-in tools (overrides config)
    #[arg(long, global = true)]
    mcp_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single prompt in an ephemeral session
    Query(QueryArgs),
    /// Interactive session; one line per turn, Ctrl-C interrupts a running turn
    Chat(ChatArgs),
    /// List user and project skills
    Skills {
        /// Project directory to scan
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Args, Debug)]
struct QueryArgs {
    prompt: String,

    /// Print events as they arrive
    #[arg(long)]
    stream: bool,

    /// Emit raw server-sent-event frames (implies --stream)
    #[arg(long)]
    sse: bool,

    #[command(flatten)]
    agent: AgentOptions,
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Working directory; a scratch workspace is used when omitted
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[command(flatten)]
    agent: AgentOptions,
}

#[derive(Args, Debug)]
struct AgentOptions {
    /// JSON schema file, or an output_format envelope
    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long)]
    system_prompt: Option<String>,

    #[arg(long)]
    max_turns: Option<u32>,

    /// Comma-separated tool allow-list
    #[arg(long, value_delimiter = ',')]
    tools: Option<Vec<String>>,

    /// default, acceptEdits, plan or bypassPermissions
    #[arg(long)]
    permission_mode: Option<String>,

    /// Do not expose the gateway's custom tools
    #[arg(long)]
    no_custom_tools: bool,
}

impl AgentOptions {
    fn output_format(&self) -> anyhow::Result<Option<OutputFormat>> {
        self.schema.as_deref().map(load_output_format).transpose()
    }

    fn permission_mode(&self) -> anyhow::Result<Option<PermissionMode>> {
        self.permission_mode
            .as_ref()
            .map(|mode| {
                serde_json::from_value(serde_json::Value::String(mode.clone()))
                    .with_context(|| format!("Unknown permission mode {:?}", mode))
            })
            .transpose()
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(std::process::ExitCode::SUCCESS)
        }
        Command::Skills { cwd } => {
            let gateway = Gateway::start(config).await?;
            let skills = gateway.list_skills(cwd.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&skills)?);
            Ok(std::process::ExitCode::SUCCESS)
        }
        Command::Query(args) => {
            let gateway = Gateway::start(config).await?;
            let outcome = query(&gateway, args).await;
            gateway.shutdown().await;
            outcome
        }
        Command::Chat(args) => {
            let gateway = Gateway::start(config).await?;
            let outcome = chat(&gateway, args).await;
            gateway.shutdown().await;
            outcome
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
            .with_env_overrides(std::env::vars())?,
        None => GatewayConfig::from_env()?,
    };
    if let Some(command) = &cli.agent_command {
        config.agent_command = command.clone();
    }
    if let Some(path) = &cli.mcp_config {
        config.mcp_config = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn load_output_format(path: &Path) -> anyhow::Result<OutputFormat> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Schema {} is not valid JSON", path.display()))?;

    // Accept either a bare schema or a full output_format envelope
    if value.get("type").and_then(|t| t.as_str()) == Some("json_schema") {
        Ok(OutputFormat::from_value(&value)?)
    } else {
        Ok(OutputFormat::json_schema(value))
    }
}

async fn query(gateway: &Gateway, args: QueryArgs) -> anyhow::Result<std::process::ExitCode> {
    let mut request = QueryRequest::new(args.prompt);
    request.system_prompt = args.agent.system_prompt.clone();
    request.max_turns = args.agent.max_turns;
    request.permission_mode = args.agent.permission_mode()?;
    request.include_custom_tools = !args.agent.no_custom_tools;
    request.output_format = args.agent.output_format()?;
    if let Some(tools) = args.agent.tools {
        request.allowed_tools = tools;
    }

    let result = if args.stream || args.sse {
        let frames = gateway.query_stream(request).await?;
        print_frames(frames, args.sse).await?
    } else {
        let result = gateway.query(request).await?;
        print_result(&result)?;
        Some(result)
    };
    Ok(exit_code(result.as_ref()))
}

async fn chat(gateway: &Gateway, args: ChatArgs) -> anyhow::Result<std::process::ExitCode> {
    let mut request = CreateSessionRequest {
        cwd: args.cwd,
        system_prompt: args.agent.system_prompt.clone(),
        max_turns: args.agent.max_turns,
        include_custom_tools: !args.agent.no_custom_tools,
        output_format: args.agent.output_format()?,
        ..CreateSessionRequest::default()
    };
    if let Some(mode) = args.agent.permission_mode()? {
        request.permission_mode = mode;
    }
    if let Some(tools) = args.agent.tools {
        request.allowed_tools = tools;
    }

    let session_id = gateway.create_session(request).await?.session_id;
    info!("Chat session {}", session_id);
    eprintln!("Session {} ready. Empty line or Ctrl-D to quit.", session_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            break;
        }

        let frames = gateway.chat_stream(&session_id, ChatRequest { message: message.to_string() })?;
        let mut printing = Box::pin(print_frames(frames, false));
        let interrupted = tokio::select! {
            printed = &mut printing => {
                printed?;
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            eprintln!("\n[interrupting]");
            if let Err(e) = gateway.interrupt(&session_id).await {
                warn!("Interrupt failed: {}", e);
            }
            // Drain the rest of the turn, which ends with an interrupted result
            printing.await?;
        }
    }

    gateway.delete_session(&session_id).await?;
    Ok(std::process::ExitCode::SUCCESS)
}

/// Print frames until the end marker; returns the turn's result if one arrived
async fn print_frames<S>(frames: S, sse: bool) -> anyhow::Result<Option<TurnResult>>
where
    S: Stream<Item = WireFrame>,
{
    let mut frames = Box::pin(frames);
    let mut result = None;
    let mut stdout = std::io::stdout();

    while let Some(frame) = frames.next().await {
        if sse {
            write!(stdout, "{}", frame.to_sse()?)?;
        }
        match frame {
            WireFrame::Done => break,
            WireFrame::Event(WireEvent::Result(turn)) => {
                if !sse {
                    writeln!(stdout)?;
                    print_summary(&turn);
                }
                result = Some(turn);
            }
            WireFrame::Event(_) if sse => {}
            WireFrame::Event(WireEvent::Text { text }) => write!(stdout, "{}", text)?,
            WireFrame::Event(WireEvent::ToolUse { name, input, .. }) => {
                eprintln!("\n[tool] {} {}", name, input)
            }
            WireFrame::Event(WireEvent::ToolResult { content, .. }) => {
                eprintln!("[tool result] {}", truncate(&content, 200))
            }
        }
        stdout.flush()?;
    }
    Ok(result)
}

fn print_result(result: &TurnResult) -> anyhow::Result<()> {
    match &result.structured_output {
        Some(payload) => println!("{}", serde_json::to_string_pretty(payload)?),
        None => println!("{}", result.result),
    }
    print_summary(result);
    Ok(())
}

fn print_summary(result: &TurnResult) {
    let mut summary = format!("[{}]", result.outcome);
    if let Some(cost) = result.cost_usd {
        summary.push_str(&format!(" cost=${:.4}", cost));
    }
    if let Some(ms) = result.duration_ms {
        summary.push_str(&format!(" duration={}ms", ms));
    }
    if result.is_error() {
        summary.push_str(&format!(" {}", result.result));
    }
    eprintln!("{}", summary);
}

fn exit_code(result: Option<&TurnResult>) -> std::process::ExitCode {
    match result {
        Some(result) if !result.is_error() => std::process::ExitCode::SUCCESS,
        _ => std::process::ExitCode::FAILURE,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "agentgate",
            "query",
            "hello",
            "--stream",
            "--tools",
            "Read,Grep",
            "--permission-mode",
            "plan",
        ])
        .unwrap();
        match cli.command {
            Command::Query(args) => {
                assert!(args.stream);
                assert_eq!(args.agent.tools, Some(vec!["Read".to_string(), "Grep".to_string()]));
                assert_eq!(args.agent.permission_mode().unwrap(), Some(PermissionMode::Plan));
            }
            other => panic!("Expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_permission_mode_rejected() {
        let cli = Cli::try_parse_from(["agentgate", "chat", "--permission-mode", "yolo"]).unwrap();
        match cli.command {
            Command::Chat(args) => assert!(args.agent.permission_mode().is_err()),
            other => panic!("Expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_load_output_format_accepts_bare_schema_and_envelope() {
        let dir = std::env::temp_dir().join(format!("agentgate-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let bare = dir.join("bare.json");
        std::fs::write(&bare, r#"{"type": "object"}"#).unwrap();
        let envelope = dir.join("envelope.json");
        std::fs::write(
            &envelope,
            r#"{"type": "json_schema", "schema": {"type": "object"}}"#,
        )
        .unwrap();

        let expected = OutputFormat::json_schema(serde_json::json!({"type": "object"}));
        assert_eq!(load_output_format(&bare).unwrap(), expected);
        assert_eq!(load_output_format(&envelope).unwrap(), expected);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
