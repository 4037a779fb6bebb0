//! Command-line interface

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::audit::ObjectType;
use crate::context::AppContext;
use crate::error::{PipelineError, Result};
use crate::models::{Label, Message};
use crate::push::BatchReport;
use crate::registry::{RunReport, ALL_PROVIDERS};

#[derive(Parser, Debug)]
#[command(name = "mail-categorizer")]
#[command(version = "0.1.0")]
#[command(about = "Fetch, categorize and label email across Gmail and Exchange", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Make sure every category label exists on the remote account
    Labels {
        /// Provider name, or `*` for all
        #[arg(short, long, default_value = ALL_PROVIDERS)]
        provider: String,
    },

    /// Fetch recent messages and categorize them
    Fetch {
        #[arg(short, long, default_value = ALL_PROVIDERS)]
        provider: String,

        /// Maximum messages per provider
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Look back this many hours
        #[arg(long)]
        hours: Option<u32>,

        /// List messages without categorizing them
        #[arg(long)]
        list_only: bool,
    },

    /// Categorize recent messages not yet in the audit log
    Recent {
        #[arg(short, long, default_value = ALL_PROVIDERS)]
        provider: String,

        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(long)]
        hours: Option<u32>,
    },

    /// Process a stored webhook body
    Webhook {
        /// Provider the notification was addressed to
        #[arg(short, long)]
        provider: String,

        /// JSON file holding the request body
        #[arg(long)]
        payload: PathBuf,
    },

    /// Register push subscriptions and hold them until Ctrl+C
    Listen,

    /// Remove push subscriptions on every provider
    Unlisten,

    /// Show audit records
    Audit {
        /// Look back this many hours
        #[arg(long, default_value_t = 24)]
        hours: u32,

        /// Only this object type, e.g. `email`
        #[arg(long)]
        object_type: Option<String>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run every command that needs a provider context
pub async fn run_command(ctx: &AppContext, command: &Commands) -> Result<()> {
    match command {
        Commands::Labels { provider } => {
            for (name, client) in ctx.registry().select(provider).await? {
                let handles = client.ensure_labels(Label::vocabulary()).await?;
                println!("{}:", name);
                for handle in handles {
                    println!("  {:<12} {}", handle.name, handle.id);
                }
            }
            Ok(())
        }

        Commands::Fetch {
            provider,
            count,
            hours,
            list_only,
        } => {
            let query = ctx.fetch_query(*count, *hours);
            if *list_only {
                let messages = ctx
                    .registry()
                    .fetch_last_emails(provider, query.count, query.window_hours)
                    .await?;
                for message in &messages {
                    println!("{}", describe_message(message));
                }
                println!("{} message(s)", messages.len());
                return Ok(());
            }

            let report = ctx
                .registry()
                .fetch_and_categorize(ctx.categorizer(), provider, query)
                .await?;
            print_run_report(&report);
            Ok(())
        }

        Commands::Recent {
            provider,
            count,
            hours,
        } => {
            let query = ctx.fetch_query(*count, *hours);
            let report = ctx
                .registry()
                .process_recent(ctx.categorizer(), ctx.audit().as_ref(), provider, query)
                .await?;
            print_run_report(&report);
            Ok(())
        }

        Commands::Webhook { provider, payload } => {
            let body = tokio::fs::read_to_string(payload).await?;
            let body: serde_json::Value = serde_json::from_str(&body)?;
            let report = ctx.push().process(provider, &body).await?;
            print_batch_report(&report);
            Ok(())
        }

        Commands::Listen => {
            let started = ctx.listen().await;
            match started {
                Ok(count) => println!("Listening on {} provider(s), press Ctrl+C to stop", count),
                Err(e) => {
                    ctx.shutdown().await.ok();
                    return Err(e);
                }
            }
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, removing push subscriptions");
            ctx.shutdown().await
        }

        Commands::Unlisten => {
            let stopped = ctx.registry().stop_all().await?;
            println!("Stopped push subscriptions on {} provider(s)", stopped);
            Ok(())
        }

        Commands::Audit {
            hours,
            object_type,
            json,
        } => {
            let object_type = object_type
                .as_deref()
                .map(str::parse::<ObjectType>)
                .transpose()?;
            let since = Utc::now() - ChronoDuration::hours(*hours as i64);
            let records = ctx.audit().find_since(since, object_type).await?;

            for record in &records {
                if *json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!(
                        "{}  {:<8} {} / {}  {}",
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.object_type,
                        record.thread_id,
                        record.message_id,
                        record.result
                    );
                }
            }
            if !*json {
                println!("{} record(s) in the last {} hour(s)", records.len(), hours);
            }
            Ok(())
        }

        Commands::InitConfig { .. } => Err(PipelineError::Config(
            "init-config runs without a provider context".to_string(),
        )),
    }
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

fn describe_message(message: &Message) -> String {
    let labels: Vec<&str> = message.labels.iter().map(String::as_str).collect();
    format!(
        "{}  {:<30} {:<50} [{}]",
        message.timestamp.format("%Y-%m-%d %H:%M"),
        truncate_string(&message.sender, 30),
        truncate_string(&message.subject, 50),
        labels.join(", ")
    )
}

fn print_run_report(report: &RunReport) {
    println!("\n========================================");
    println!("Fetched:      {}", report.fetched);
    println!("Categorized:  {}", report.categorized);
    println!("Unchanged:    {}", report.unchanged);
    println!("Skipped:      {}", report.skipped);
    println!("Failed:       {}", report.failed);
    println!("========================================");
}

fn print_batch_report(report: &BatchReport) {
    println!(
        "Processed {}, skipped {}, replayed {}, failed {}",
        report.processed, report.skipped, report.replayed, report.failed
    );
}
