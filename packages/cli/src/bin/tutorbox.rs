use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "tutorbox")]
#[command(about = "Tutorbox CLI - run interactive coding lessons in a sandbox")]
#[command(version)]
struct Cli {
    /// Content server base URL (overrides TUTORBOX_CONTENT_URL)
    #[arg(long, global = true)]
    content_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a lesson against a local sandbox
    Run {
        /// Path to the lesson descriptor (JSON)
        lesson: PathBuf,
    },
    /// Fetch a file bundle and list its files
    Fetch {
        /// Bundle reference, e.g. template-vite or 1-basics-1-intro-files
        bundle: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tutorbox_cli::logging::init_tracing();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run { lesson } => cli::run::run_lesson(&lesson, cli.content_url).await,
        Commands::Fetch { bundle } => cli::fetch::fetch_bundle(&bundle, cli.content_url)
            .await
            .map(|()| true),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}
