use std::env;
use std::path::Path;

use upsync_core::config::{parse_upload_config, UploadConfig};
use upsync_core::sync::{HttpDataSource, SyncUploadProgress, UploadSession};
use upsync_core::util::normalize_text_option;

use crate::cli::UploadArgs;
use crate::commands::common::open_database;
use crate::error::CliError;

pub async fn run_upload(args: &UploadArgs, db_path: &Path) -> Result<(), CliError> {
    let file_config = match &args.config {
        Some(path) => Some(parse_upload_config(&std::fs::read_to_string(path)?)?),
        None => None,
    };
    let config = resolve_upload_config(file_config, args, env::var("UPSYNC_SERVER_URL").ok())?;
    let strategy = config.strategy()?;
    let server_url = config
        .server_base_url()?
        .ok_or(CliError::ServerNotConfigured)?;
    let auth_token = normalize_text_option(env::var("UPSYNC_AUTH_TOKEN").ok());

    let data_source = HttpDataSource::new(server_url, auth_token, config.timeout())?;
    let db = open_database(db_path)?;
    tracing::info!("Uploading to {}", data_source.base_url());

    let mut session = UploadSession::new(&db, &data_source, strategy)?;
    let mut total = 0;
    while let Some(event) = session.next().await {
        match event {
            SyncUploadProgress::Started { total: pending } => {
                total = pending;
                if pending == 0 {
                    println!("Nothing to upload");
                } else {
                    println!("Uploading {pending} local changes");
                }
            }
            SyncUploadProgress::Success { consumed, progress } => {
                println!(
                    "Uploaded {consumed} changes ({} remaining)",
                    progress.remaining
                );
            }
            SyncUploadProgress::Failure { error, progress } => {
                return Err(CliError::UploadFailed {
                    uploaded: progress.initial_total.saturating_sub(progress.remaining),
                    total,
                    source: error,
                });
            }
        }
    }

    if total > 0 {
        println!("Upload completed");
    }
    Ok(())
}

/// Layer command-line overrides and the environment on top of the file config.
///
/// Precedence for the server URL: `--server`, then `UPSYNC_SERVER_URL`, then the file.
pub fn resolve_upload_config(
    file_config: Option<UploadConfig>,
    args: &UploadArgs,
    env_server_url: Option<String>,
) -> Result<UploadConfig, CliError> {
    let mut config = file_config.unwrap_or_default();

    if let Some(server) = normalize_text_option(args.server.clone())
        .or_else(|| normalize_text_option(env_server_url))
    {
        config.server_base_url = Some(server);
    }
    if let Some(fetch_mode) = args.fetch_mode {
        config.fetch_mode = fetch_mode.into();
    }
    if let Some(patch_mode) = args.patch_mode {
        config.patch_mode = patch_mode.into();
    }
    if let Some(request_mode) = args.request_mode {
        config.request_mode = request_mode.into();
    }
    if let Some(max_entries) = args.max_entries {
        config.max_entries = max_entries;
    }
    if let Some(method) = args.create {
        config.create_method = method.create_method().ok_or(CliError::UnsupportedMethod {
            operation: "create",
            method: "patch",
        })?;
    }
    if let Some(method) = args.update {
        config.update_method = method.update_method().ok_or(CliError::UnsupportedMethod {
            operation: "update",
            method: "post",
        })?;
    }
    if args.no_etag {
        config.use_etag_for_upload = false;
    }

    Ok(config)
}
