use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use murmur_core::{load_config, MurmurConfig, Services};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod simulate;

const CONFIG_FILE: &str = "murmur.yaml";

#[derive(Parser)]
#[command(name = "murmur", version, about = "murmur adaptive live-comment engine")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.murmur",
        help = "Data root directory (contains murmur.yaml and logs/)"
    )]
    root: PathBuf,

    #[arg(long, help = "Config file to use instead of <root>/murmur.yaml")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate the config file")]
    Validate,
    #[command(about = "Replay a scripted session on a simulated clock")]
    Simulate {
        #[arg(help = "Session script (YAML)")]
        script: PathBuf,
        #[arg(long, help = "Override the user id named in the script")]
        user: Option<String>,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
    #[command(about = "Show a user's learned role weights")]
    Weights {
        #[arg(help = "User ID")]
        user_id: String,
    },
    #[command(about = "Show a user's highest and lowest weighted roles")]
    Ranking {
        #[arg(help = "User ID")]
        user_id: String,
    },
    #[command(about = "Reset a user's learned preferences")]
    Reset {
        #[arg(help = "User ID")]
        user_id: String,
    },
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Explicit `--config`, else `<root>/murmur.yaml` if present, else defaults.
fn resolve_config(root: &Path, explicit: Option<&Path>) -> Result<MurmurConfig> {
    let mut config = match explicit {
        Some(path) => load_config(&expand_home(path))?,
        None => {
            let path = root.join(CONFIG_FILE);
            if path.exists() {
                load_config(&path)?
            } else {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                MurmurConfig::default()
            }
        }
    };
    config.storage.path = config.storage.path.as_deref().map(expand_home);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.root = expand_home(&cli.root);

    let log_dir = cli.root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "murmur.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = resolve_config(&cli.root, cli.config.as_deref())?;

    match command {
        Commands::Validate => {
            println!(
                "Config valid. model {} via {:?}, {}-{} comments/min, storage {}.",
                config.engine.model_id,
                config.engine.runtime.runtime_type,
                config.frequency.min_frequency,
                config.frequency.max_frequency,
                config
                    .storage
                    .path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "in-memory".to_string()),
            );
        }
        Commands::Simulate { script, user, json } => {
            let mut script = simulate::load_script(&script)?;
            if let Some(user) = user {
                script.user_id = user;
            }
            let report = simulate::run(config, &script).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Weights { user_id } => {
            let services = Services::from_config(config)?;
            let weights = services.learner.get_personalized_weights(&user_id).await;
            println!("{:<12} {:>8}", "ROLE", "WEIGHT");
            println!("{}", "-".repeat(21));
            for (role, weight) in weights.iter() {
                println!("{:<12} {:>8.3}", role.as_str(), weight);
            }
        }
        Commands::Ranking { user_id } => {
            let services = Services::from_config(config)?;
            let ranking = services.learner.get_preference_ranking(&user_id).await;
            let join = |roles: &[murmur_schema::RoleType]| {
                roles
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("Highest: {}", join(&ranking.highest));
            println!("Lowest:  {}", join(&ranking.lowest));
            for (rank, (role, weight)) in ranking.ranked.iter().enumerate() {
                println!("{:>2}. {:<12} {:.3}", rank + 1, role.as_str(), weight);
            }
        }
        Commands::Reset { user_id } => {
            let services = Services::from_config(config)?;
            if services.config.storage.path.is_none() {
                println!("No storage configured; nothing persisted to reset.");
            }
            if services.learner.reset_preferences(&user_id).await {
                println!("Preferences for '{user_id}' reset.");
            } else {
                anyhow::bail!("failed to persist reset for '{user_id}'");
            }
        }
    }

    Ok(())
}

fn print_report(report: &simulate::SimulationReport) {
    println!("Session {} (user {})", report.session_id, report.user_id);
    println!("{}", "-".repeat(60));
    for comment in &report.comments {
        println!(
            "[{:>7.1}s] {:<10} {:<5} {}",
            comment.at_ms as f64 / 1000.0,
            comment.role.as_str(),
            match comment.source {
                murmur_schema::GenerationSource::Rule => "rule",
                murmur_schema::GenerationSource::Model => "model",
            },
            comment.content
        );
    }
    println!("{}", "-".repeat(60));
    println!(
        "{} comments, {} skipped, {} pickups, {} feedback events",
        report.comments.len(),
        report.skipped,
        report.pickups,
        report.feedback_applied
    );
    println!(
        "Model ratio {:.2} ({} attempts, {} fallbacks){}",
        report.mixer.ratio,
        report.mixer.attempts,
        report.mixer.fallbacks,
        if report.degraded { ", degraded" } else { "" }
    );
    for (role, weight) in &report.final_weights {
        println!("  {:<12} {:.3}", role.as_str(), weight);
    }
}
