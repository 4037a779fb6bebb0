use anyhow::Result;
use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

use mail_categorizer::cli::{self, Cli, Commands};
use mail_categorizer::config::Config;
use mail_categorizer::context::AppContext;
use mail_categorizer::PipelineError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: mail-categorizer --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in different rustls crypto providers
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mail_categorizer=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mail_categorizer=info,warn"))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    if let Commands::InitConfig { output, force } = &cli.command {
        if output.exists() && !force {
            anyhow::bail!(
                "Config file {:?} already exists, use --force to overwrite",
                output
            );
        }
        Config::create_example(output).await?;
        println!("Created example configuration at {:?}", output);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    let ctx = AppContext::initialize(&config).await?;

    let outcome = cli::run_command(&ctx, &cli.command).await;
    if let Err(e) = ctx.shutdown().await {
        tracing::warn!("Shutdown incomplete: {}", e);
    }
    outcome?;
    Ok(())
}

fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(pipeline_err) = error.downcast_ref::<PipelineError>() {
        match pipeline_err {
            PipelineError::Auth(_) => {
                eprintln!("\nHint: The stored credential could not be used or refreshed.");
                eprintln!("      Check the token file named in your configuration.");
            }
            PipelineError::RateLimitExceeded { .. } => {
                eprintln!("\nHint: The provider is rate limiting requests.");
                eprintln!("      Wait a few seconds and try again.");
            }
            PipelineError::Config(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: mail-categorizer init-config --force");
            }
            PipelineError::NotFound(_) => {
                eprintln!("\nHint: Provider names come from the gmail.name and exchange.name settings.");
            }
            _ => {}
        }
    }
}
