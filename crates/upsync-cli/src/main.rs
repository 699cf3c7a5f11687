//! upsync CLI - record resource changes locally and upload them
//!
//! Changes are stored in a local SQLite file and pushed to a FHIR-style server
//! with `upsync upload`.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::resolve_db_path;
use crate::commands::resource::{run_add, run_delete, run_import, run_update};
use crate::commands::status::run_status;
use crate::commands::upload::run_upload;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("upsync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Import { file } => run_import(&file, &db_path)?,
        Commands::Add { file } => run_add(&file, &db_path)?,
        Commands::Update {
            resource_type,
            id,
            patch,
        } => run_update(&resource_type, &id, &patch, &db_path)?,
        Commands::Delete { resource_type, id } => run_delete(&resource_type, &id, &db_path)?,
        Commands::Status { limit, json } => run_status(limit, json, &db_path)?,
        Commands::Upload(args) => run_upload(&args, &db_path).await?,
    }

    Ok(())
}
