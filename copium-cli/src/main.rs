use anyhow::{Context, Result};
use clap::Parser;
use colored::{ColoredString, Colorize};
use copium_client::config::LoggingConfig;
use copium_client::{
    ClassificationResult, CopiumClient, CopiumConfig, DownloadHandle, DownloadProgress, Label,
    ProgressStream, StatusLevel,
};
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "copium")]
#[command(about = "CopiumMeter CLI - detect copium, sarcasm and sincerity in text", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start without network: skip the probe and mark the remote API offline
    #[arg(long)]
    offline: bool,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct Session {
    client: CopiumClient,
    /// Kept so the model download can be cancelled on quit
    download: Option<DownloadHandle>,
}

impl Session {
    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_lowercase().as_str() {
            "analyze" => self.cmd_analyze(&args.join(" ")).await?,
            "status" => self.cmd_status(),
            "cache-size" => self.cmd_cache_size().await?,
            "skip-wait" => self.cmd_skip_wait().await?,
            "help" => help_text(),
            // Anything else is text to classify
            _ => {
                let text = std::iter::once(command.to_string())
                    .chain(args.iter().cloned())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.cmd_analyze(&text).await?
            }
        };

        let elapsed = start.elapsed();
        Ok(format!("{}\n{}", response, format!("({:.2?})", elapsed).dimmed()))
    }

    async fn cmd_analyze(&self, text: &str) -> Result<String> {
        let result = self.client.analyze(text).await?;
        Ok(render_result(&result))
    }

    fn cmd_status(&self) -> String {
        let status = self.client.status();
        let tiers = status
            .ready_tiers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}\n  model:  {}\n  remote: {:?}\n  build:  {:?}\n  ready:  {}",
            paint(&status.summary(), status.level()),
            status.model,
            status.remote,
            status.build,
            if tiers.is_empty() { "none".to_string() } else { tiers }
        )
    }

    async fn cmd_cache_size(&self) -> Result<String> {
        let bytes = self.client.control().model_cache_size().await?;
        Ok(format!(
            "Model cache: {} ({} bytes)",
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0)).bold(),
            bytes
        ))
    }

    async fn cmd_skip_wait(&self) -> Result<String> {
        let deleted = self.client.control().skip_waiting().await?;
        if deleted.is_empty() {
            Ok("OK".green().to_string())
        } else {
            Ok(format!("OK, deleted {}", deleted.join(", ")).green().to_string())
        }
    }
}

fn render_result(result: &ClassificationResult) -> String {
    let mut lines = vec![
        format!(
            "{} {} {}",
            result.label.emoji(),
            result.label.name().bold(),
            format!("({:.1}%)", result.confidence).cyan()
        ),
        format!("  {}", result.label.description().italic()),
        format!("  {}", format!("via {}", result.backend).dimmed()),
    ];

    for (label, score) in result.ranked() {
        let bar = "█".repeat((score / 5.0).round() as usize);
        let name = format!("{:<10}", label.name());
        let name = if label == result.label {
            name.bold()
        } else {
            name.normal()
        };
        lines.push(format!("  {} {} {} {:.1}%", label.emoji(), name, bar, score));
    }
    lines.join("\n")
}

fn paint(text: &str, level: StatusLevel) -> ColoredString {
    match level {
        StatusLevel::Success => text.green(),
        StatusLevel::Warning => text.yellow(),
        StatusLevel::Loading => text.blue(),
        StatusLevel::Error => text.red(),
    }
}

fn help_text() -> String {
    let mut help = vec![format!("{}", "Commands:".bold())];
    for (command, description) in [
        ("analyze <text>", "Classify text (bare text works too)"),
        ("status", "Show backend and cache status"),
        ("cache-size", "Show the size of the cached model weights"),
        ("skip-wait", "Activate a waiting cache build now"),
        ("help", "Show this help"),
        ("quit", "Exit"),
    ] {
        help.push(format!("  {:<16} {}", command.cyan(), description));
    }
    help.push(String::new());
    help.push(format!("{}", "Labels:".bold()));
    for label in Label::ALL {
        help.push(format!("  {} {:<10} {}", label.emoji(), label.name(), label.description()));
    }
    help.join("\n")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Log download progress until the stream ends
fn watch_download(mut progress: ProgressStream) {
    tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(event) = progress.next().await {
            match &event {
                DownloadProgress::Progress { file, .. } => {
                    let percent = event.percent();
                    if percent.is_some() && percent != last_percent {
                        last_percent = percent;
                        debug!(file = %file, percent = ?percent, "Downloading model");
                    }
                }
                DownloadProgress::Done {
                    file, from_cache, ..
                } => {
                    last_percent = None;
                    debug!(file = %file, from_cache, "Model file ready");
                }
                DownloadProgress::Failed { file, reason } => {
                    warn!(file = %file, reason = %reason, "Model file download failed");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CopiumConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CopiumConfig::default(),
    };
    init_tracing(&config.logging);

    let client = CopiumClient::new(config)
        .await
        .context("Failed to start CopiumMeter client")?;

    if args.offline {
        client.set_online(false).await;
    } else {
        client.refresh_connectivity().await;
    }

    let download = client.load_model().map(|(progress, handle)| {
        watch_download(progress);
        handle
    });
    let session = Session { client, download };

    if !args.command.is_empty() {
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        match session.execute_command(cmd, &cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(session).await
    }
}

async fn run_interactive(session: Session) -> Result<()> {
    info!(
        "{}",
        format!("CopiumMeter CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    let status = session.client.status();
    info!("{}", paint(&status.summary(), status.level()));
    info!("Type {} for available commands\n", "help".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(&format!("{}> ", "copium".green()));

        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if matches!(cmd.to_lowercase().as_str(), "quit" | "exit") {
                    info!("Goodbye!");
                    break;
                }

                match session.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = %err, "Readline error");
                break;
            }
        }
    }

    if let Some(handle) = &session.download {
        handle.cancel();
    }
    Ok(())
}
