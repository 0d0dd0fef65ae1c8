use anyhow::{Context, bail};
use clap::Parser;
use fusionctl::client::{FusionApi, ReqwestFusionClient};
use fusionctl::config::{Args, Command};
use fusionctl::controller::StartOutcome;
use fusionctl::poller::StatusPoller;
use fusionctl::tracker::UploadOutcome;
use fusionctl::{Config, FileCandidate, FusionWorkflow, SessionId, telemetry};
use std::path::PathBuf;
use std::sync::Arc;

async fn upload(config: &Config, session: String, required: usize, process: bool, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let workflow = FusionWorkflow::connect(config, session, required)?;

    let mut candidates = Vec::with_capacity(files.len());
    for path in &files {
        let candidate = FileCandidate::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        candidates.push(candidate);
    }

    let outcomes = workflow.submit_files(candidates).await;
    for outcome in &outcomes {
        match outcome {
            UploadOutcome::Accepted { image, progress } => {
                println!("uploaded {} as {} ({}/{})", image.original_name, image.storage_name, progress.current, progress.required)
            }
            UploadOutcome::Rejected(e) => println!("rejected {}: {e}", e.file_name()),
            UploadOutcome::Failed { file_name, error } => {
                let hint = if error.is_retryable() { " (retry the upload)" } else { "" };
                println!("failed {file_name}: {}{hint}", error.user_message())
            }
        }
    }

    let progress = workflow.progress();
    println!("{}/{} images uploaded", progress.current, progress.required);

    if !process {
        return Ok(());
    }

    match workflow.start_processing().await {
        StartOutcome::Completed(result) => {
            println!("fusion complete: {}", result.result_location);
            Ok(())
        }
        StartOutcome::Failed(e) => bail!(e.user_message()),
        StartOutcome::Ignored(reason) => bail!("processing not started: {reason:?}"),
    }
}

async fn status(config: &Config, sessions: Vec<String>, watch: bool) -> anyhow::Result<()> {
    let api = Arc::new(ReqwestFusionClient::from_config(config)?);

    if !watch {
        for id in sessions {
            let status = api.query_status(&SessionId::from(id.as_str())).await?;
            println!("{id}: {status}");
        }
        return Ok(());
    }

    let poller = StatusPoller::new(api, &config.polling);
    let handles: Vec<_> = sessions.into_iter().map(|id| poller.poll(id)).collect();
    for handle in handles {
        let id = handle.session_id().clone();
        match handle.settled().await? {
            Some(status) => println!("{id}: {status}"),
            None => println!("{id}: polling stopped"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(&config.log_filter)?;

    tracing::debug!("{:?}", args);

    match args.command {
        Some(Command::Upload {
            session,
            required,
            process,
            files,
        }) => upload(&config, session, required, process, files).await,
        Some(Command::Status { sessions, watch }) => status(&config, sessions, watch).await,
        None => bail!("no command given; see --help"),
    }
}
