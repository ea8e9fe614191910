//! pgfan - Main entry point

use clap::Parser;
use pgfan_cli::{commands, Cli};
use pgfan_common::logging::{init_logging, LogConfig};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    // LOG_* variables take precedence over the DEBUG toggle
    let log_config = LogConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring LOG_* settings: {}", e);
        LogConfig::diagnostics_from_env()
    });
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let result = match cli.into_request() {
        Ok(request) => commands::fetch::run(request).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %e, "Run failed");
        eprintln!("Error: {}", e);
        // exit skips destructors; flush the log writer first
        drop(guard);
        process::exit(e.exit_code());
    }
}
