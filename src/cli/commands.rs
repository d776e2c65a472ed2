//! CLI command definitions for image-forge.
//!
//! Every command builds an [`OrchestrationService`] over the Gemini client,
//! seeds its credential pool from `--keys` / `GEMINI_API_KEYS` and drives it
//! to completion.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ForgeConfig;
use crate::generation::pattern_split;
use crate::metrics::{export_metrics, init_metrics};
use crate::service::{Collaborators, CreateTaskRequest, OrchestrationService};
use crate::tasks::{Task, TaskId, TaskStatus};

/// Default directory for archives written by `run`.
const DEFAULT_OUTPUT_DIR: &str = "./output";

/// How often `run` polls Task progress.
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bulk image generation over a rotating pool of API keys.
#[derive(Parser)]
#[command(name = "image-forge")]
#[command(about = "Generate batches of images unattended over a pool of Gemini API keys")]
#[command(version)]
#[command(
    long_about = "image-forge turns a list of prompts into images, rotating across API keys and \
                  cooling down keys that run out of quota.\n\nExample usage:\n  \
                  GEMINI_API_KEYS=key1,key2 image-forge run prompts.txt --name castles --output ./output"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; FORGE_* environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate one image per prompt and write them as a .tar.gz archive.
    #[command(alias = "gen")]
    Run(RunArgs),

    /// Split free text into individual prompts.
    Split(SplitArgs),

    /// Describe the character shown in an image.
    Describe(DescribeArgs),
}

/// API keys shared by every subcommand.
#[derive(clap::Args, Debug)]
pub struct KeyArgs {
    /// Comma-separated Gemini API keys.
    #[arg(
        short,
        long = "keys",
        env = "GEMINI_API_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub keys: Vec<String>,
}

/// Arguments for `image-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File with prompts, one per line.
    pub prompts: PathBuf,

    /// Parse the file as free text (numbered or bulleted lists) instead of one prompt per line.
    #[arg(long)]
    pub split: bool,

    /// Task name; also used for the archive file name.
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// Reference image (png, jpg, jpeg, webp).
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Keep the character consistent by feeding each image into the next prompt.
    #[arg(long)]
    pub character_sync: bool,

    /// Character description; analysed from --image when omitted with --character-sync.
    #[arg(long)]
    pub character: Option<String>,

    /// Directory for the resulting archive.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Maximum concurrent jobs for non-synced tasks.
    #[arg(short, long)]
    pub parallel: Option<usize>,

    /// Write Prometheus metrics to this file when done.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Output JSON to stdout instead of a text summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub keys: KeyArgs,
}

/// Arguments for `image-forge split`.
#[derive(Parser, Debug)]
pub struct SplitArgs {
    /// Text file to split.
    pub input: PathBuf,

    /// Ask the text model instead of pattern matching.
    #[arg(short, long)]
    pub assist: bool,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub keys: KeyArgs,
}

/// Arguments for `image-forge describe`.
#[derive(Parser, Debug)]
pub struct DescribeArgs {
    /// Image to analyse.
    pub image: PathBuf,

    #[command(flatten)]
    pub keys: KeyArgs,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_batch_command(config, args).await,
        Commands::Split(args) => run_split_command(config, args).await,
        Commands::Describe(args) => run_describe_command(config, args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ForgeConfig> {
    let config = match path {
        Some(path) => ForgeConfig::from_yaml_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))?,
        None => ForgeConfig::from_env()?,
    };
    Ok(config)
}

/// Builds the service and registers the given keys.
fn build_service(config: ForgeConfig, keys: &KeyArgs) -> anyhow::Result<OrchestrationService> {
    let collaborators = Collaborators::gemini(&config)?;
    let service = OrchestrationService::new(config, collaborators)?;

    for key in keys.keys.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
        match service.add_credential(SecretString::from(key.to_string())) {
            Ok(view) => info!(credential = %view.suffix, "Registered API key"),
            Err(e) => warn!(error = %e, "Skipping API key"),
        }
    }
    if service.list_credentials().is_empty() {
        anyhow::bail!("No API keys configured. Pass --keys or set GEMINI_API_KEYS.");
    }
    Ok(service)
}

#[derive(Debug, Serialize)]
struct RunSummary {
    task_id: TaskId,
    name: String,
    status: String,
    total: usize,
    completed: usize,
    failed: usize,
    archive: Option<String>,
    failures: Vec<FailureEntry>,
}

#[derive(Debug, Serialize)]
struct FailureEntry {
    prompt_index: usize,
    prompt: String,
    code: Option<String>,
    error: Option<String>,
}

fn read_prompts(path: &Path, split: bool) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read prompts {}: {}", path.display(), e))?;
    if split {
        return Ok(pattern_split(&text).prompts);
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn run_batch_command(mut config: ForgeConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(parallel) = args.parallel {
        config = config.with_max_parallel_jobs(parallel);
        config.validate()?;
    }
    if args.metrics_out.is_some() {
        init_metrics()?;
    }

    let prompts = read_prompts(&args.prompts, args.split)?;
    let service = build_service(config, &args.keys)?;

    let reference_image = match &args.image {
        Some(path) => {
            let bytes = fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read image {}: {}", path.display(), e))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some(service.upload_reference_image(&file_name, &bytes).await?)
        }
        None => None,
    };

    service.start()?;
    let created = service
        .create_task(CreateTaskRequest {
            name: args.name.clone(),
            prompts,
            reference_image,
            character_sync: args.character_sync,
            character_context: args.character.clone(),
            auto_start: true,
        })
        .await?;
    info!(task_id = %created.task_id, "{}", created.message);

    let Some(task) = wait_for_task(&service, created.task_id).await? else {
        service.shutdown().await;
        anyhow::bail!("Interrupted before task {} started; it was removed", created.task_id);
    };

    let archive = match service.export_task_archive(task.id).await {
        Ok(archive) => {
            fs::create_dir_all(&args.output)?;
            let path = args.output.join(&archive.file_name);
            fs::write(&path, &archive.bytes)?;
            info!(path = %path.display(), images = archive.entries, "Archive written");
            Some(path.display().to_string())
        }
        Err(e) => {
            warn!(error = %e, "No archive written");
            None
        }
    };

    if let Some(path) = &args.metrics_out {
        fs::write(path, export_metrics())?;
    }
    service.shutdown().await;

    let summary = RunSummary {
        task_id: task.id,
        name: task.name.clone(),
        status: task.status.to_string(),
        total: task.counts.total,
        completed: task.counts.completed,
        failed: task.counts.failed,
        archive,
        failures: task
            .results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| FailureEntry {
                prompt_index: r.prompt_index,
                prompt: r.prompt.clone(),
                code: r.error_code.map(|c| c.to_string()),
                error: r.error.clone(),
            })
            .collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Task {} ({}): {} - {}/{} images, {} failed",
            summary.name, summary.task_id, summary.status, summary.completed, summary.total, summary.failed
        );
        for failure in &summary.failures {
            println!(
                "  #{} {}: {}",
                failure.prompt_index + 1,
                failure.code.as_deref().unwrap_or("ERROR"),
                failure.error.as_deref().unwrap_or("")
            );
        }
        if let Some(path) = &summary.archive {
            println!("Archive: {}", path);
        }
    }
    Ok(())
}

/// What Ctrl-C did to the CLI's Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// The run was signalled; Results produced so far are kept.
    Aborting,
    /// The Task had not started and was removed.
    Withdrawn,
}

async fn interrupt_task(service: &OrchestrationService, id: TaskId) -> anyhow::Result<Interrupt> {
    match service.get_task(id)?.status {
        TaskStatus::Pending | TaskStatus::Queued => {
            service.delete_task(id).await?;
            Ok(Interrupt::Withdrawn)
        }
        TaskStatus::Processing => {
            if let Err(e) = service.cancel_task(id) {
                warn!(error = %e, "Abort request rejected");
            }
            Ok(Interrupt::Aborting)
        }
        _ => Ok(Interrupt::Aborting),
    }
}

/// Polls until the Task is terminal. Ctrl-C aborts a running Task but keeps
/// its Results; a Task still waiting in the Queue is removed and `None` returned.
async fn wait_for_task(service: &OrchestrationService, id: TaskId) -> anyhow::Result<Option<Task>> {
    let mut last_attempted = usize::MAX;
    let mut cancelled = false;
    loop {
        let task = service.get_task(id)?;
        if task.status.is_terminal() {
            return Ok(Some(task));
        }
        let attempted = task.counts.attempted();
        if attempted != last_attempted {
            info!(
                task_id = %id,
                completed = task.counts.completed,
                failed = task.counts.failed,
                total = task.counts.total,
                "Progress"
            );
            last_attempted = attempted;
        }

        tokio::select! {
            _ = tokio::time::sleep(PROGRESS_POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                warn!(task_id = %id, status = %task.status, "Interrupted");
                match interrupt_task(service, id).await? {
                    Interrupt::Aborting => cancelled = true,
                    Interrupt::Withdrawn => return Ok(None),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct SplitOutput {
    count: usize,
    prompts: Vec<String>,
    summary: String,
}

async fn run_split_command(config: ForgeConfig, args: SplitArgs) -> anyhow::Result<()> {
    let text = fs::read_to_string(&args.input)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.input.display(), e))?;

    let outcome = if args.assist {
        let service = build_service(config, &args.keys)?;
        service.split_prompts(&text, true).await?
    } else {
        if text.trim().is_empty() {
            anyhow::bail!("Input file {} is empty", args.input.display());
        }
        pattern_split(&text)
    };

    if args.json {
        let output = SplitOutput {
            count: outcome.prompts.len(),
            prompts: outcome.prompts,
            summary: outcome.summary,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for prompt in &outcome.prompts {
            println!("{}", prompt);
        }
        eprintln!("{}", outcome.summary);
    }
    Ok(())
}

async fn run_describe_command(config: ForgeConfig, args: DescribeArgs) -> anyhow::Result<()> {
    let bytes = fs::read(&args.image)
        .map_err(|e| anyhow::anyhow!("Failed to read image {}: {}", args.image.display(), e))?;
    let file_name = args
        .image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let service = build_service(config, &args.keys)?;
    let handle = service.upload_reference_image(&file_name, &bytes).await?;
    let description = service.analyze_character(&handle).await?;
    println!("{}", description);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "image-forge",
            "run",
            "prompts.txt",
            "--name",
            "castles",
            "--character-sync",
            "--keys",
            "aaa,bbb",
            "--json",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.prompts, PathBuf::from("prompts.txt"));
                assert_eq!(args.name, "castles");
                assert!(args.character_sync);
                assert!(args.json);
                assert_eq!(args.keys.keys, vec!["aaa", "bbb"]);
                assert_eq!(args.output, PathBuf::from(DEFAULT_OUTPUT_DIR));
            }
            _ => panic!("expected run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_read_prompts_modes() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("prompts.txt");
        fs::write(
            &path,
            "# castles\n1. a castle at dawn\n\n2. a castle in the snow\n",
        )
        .expect("write");

        let lines = read_prompts(&path, false).expect("should read");
        assert_eq!(lines, vec!["1. a castle at dawn", "2. a castle in the snow"]);

        let split = read_prompts(&path, true).expect("should read");
        assert_eq!(split, vec!["a castle at dawn", "a castle in the snow"]);
    }

    mod interrupt {
        use super::*;
        use crate::generation::{
            CharacterDescriber, GenerationError, GenerationRequest, ImageGenerator, ImageInput,
            PromptAssistant, SplitOutcome,
        };
        use crate::storage::MemoryBlobStore;
        use async_trait::async_trait;
        use std::sync::Arc;

        struct Idle;

        #[async_trait]
        impl ImageGenerator for Idle {
            async fn generate(
                &self,
                _api_key: &SecretString,
                _request: &GenerationRequest,
            ) -> Result<Vec<u8>, GenerationError> {
                Err(GenerationError::network("not used"))
            }
        }

        #[async_trait]
        impl CharacterDescriber for Idle {
            async fn describe(
                &self,
                _api_key: &SecretString,
                _image: &ImageInput,
            ) -> Result<String, GenerationError> {
                Err(GenerationError::network("not used"))
            }
        }

        #[async_trait]
        impl PromptAssistant for Idle {
            async fn split_prompts(
                &self,
                _api_key: &SecretString,
                _text: &str,
            ) -> Result<SplitOutcome, GenerationError> {
                Err(GenerationError::network("not used"))
            }
        }

        // Never started, so Tasks stay where the test puts them
        async fn service_with_task() -> (OrchestrationService, TaskId) {
            let idle = Arc::new(Idle);
            let service = OrchestrationService::new(
                ForgeConfig::default(),
                Collaborators {
                    generator: idle.clone(),
                    describer: idle.clone(),
                    assistant: idle,
                    blobs: Arc::new(MemoryBlobStore::new()),
                },
            )
            .expect("should build service");
            service
                .add_credential(SecretString::from("key-12345678".to_string()))
                .expect("should add credential");
            let created = service
                .create_task(CreateTaskRequest {
                    name: "cli".to_string(),
                    prompts: vec!["a quiet street".to_string()],
                    ..CreateTaskRequest::default()
                })
                .await
                .expect("should create");
            (service, created.task_id)
        }

        #[tokio::test]
        async fn test_interrupt_withdraws_queued_task() {
            let (service, id) = service_with_task().await;
            service.enqueue_task(id).expect("should enqueue");

            let outcome = interrupt_task(&service, id).await.expect("should interrupt");
            assert_eq!(outcome, Interrupt::Withdrawn);
            assert!(service.get_task(id).is_err());
            assert!(service.queue_status().queue.is_empty());
        }

        #[tokio::test]
        async fn test_interrupt_aborts_processing_task() {
            let (service, id) = service_with_task().await;
            service.start_task(id).expect("should start");

            let outcome = interrupt_task(&service, id).await.expect("should interrupt");
            assert_eq!(outcome, Interrupt::Aborting);
            assert_eq!(
                service.get_task(id).expect("task kept").status,
                TaskStatus::Processing
            );
        }
    }
}
