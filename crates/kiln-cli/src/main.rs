//! Kiln CLI - generate, run and repair small web applications
//!
//! Usage:
//!   kiln init                         Write .kiln/config.toml with defaults
//!   kiln project create <name>        Create a project
//!   kiln project list                 List projects
//!   kiln run <project> -p <prompt>    Start a run and drive it to a terminal status
//!   kiln status <run>                 Show a run's status
//!   kiln logs <run>                   Show a run's log stream
//!   kiln patch <file> -w <dir>        Apply a patch file to a directory
//!   kiln extract <file>               Show the files a generator transcript yields

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiln_agent::{apply_patch_text, CodeGenerator, HttpGenerator};
use kiln_core::{KilnConfig, ProjectId, RunId, Workspace};
use kiln_extract::{detect_shape, extract_document, normalize_artifact, parse_document};
use kiln_orchestrator::RunOrchestrator;
use kiln_store::{JsonlStore, RunStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const STORE_FILE: &str = ".kiln/store.jsonl";

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Generate, run and repair small web applications")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding .kiln/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Project management
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },

    /// Start a run for a project and wait for it to finish
    Run {
        /// Project id
        project: u64,

        /// What to build
        #[arg(short, long)]
        prompt: String,

        /// Keep the application attached until Ctrl-C, then stop it
        #[arg(long)]
        serve: bool,
    },

    /// Show a run's status
    Status {
        /// Run id
        run: u64,
    },

    /// Show a run's log events
    Logs {
        /// Run id
        run: u64,

        /// Only events after this id
        #[arg(long)]
        after: Option<u64>,

        /// Keep polling until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Apply a patch file to a directory
    Patch {
        /// File holding the patch envelope
        file: PathBuf,

        /// Directory the patch paths are relative to
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },

    /// Show what a generator transcript extracts to
    Extract {
        /// File holding raw generator output
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project
    Create {
        /// Project name
        name: String,
    },
    /// List projects
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Ignoring unreadable .env: {}", e);
        }
    }

    let root = cli.root;
    match cli.command {
        Commands::Init { force } => cmd_init(&root, force).await,
        Commands::Project { action } => cmd_project(&root, action).await,
        Commands::Run {
            project,
            prompt,
            serve,
        } => cmd_run(&root, ProjectId(project), prompt, serve).await,
        Commands::Status { run } => cmd_status(&root, RunId(run)).await,
        Commands::Logs { run, after, follow } => cmd_logs(&root, RunId(run), after, follow).await,
        Commands::Patch { file, workspace } => cmd_patch(file, workspace).await,
        Commands::Extract { file } => cmd_extract(&root, file).await,
    }
}

fn load_config(root: &Path) -> Result<KilnConfig> {
    let mut config = KilnConfig::load(root).context("Failed to load configuration")?;
    config.run.workspace_root = under(root, &config.run.workspace_root);
    Ok(config)
}

/// `path` if absolute, else `path` inside `root`
fn under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

async fn open_store(root: &Path) -> Result<JsonlStore> {
    JsonlStore::open(root.join(STORE_FILE))
        .await
        .context("Failed to open run store")
}

async fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(".kiln/config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let path = KilnConfig::write_default(root)?;
    let workspaces = under(root, &KilnConfig::default().run.workspace_root);
    tokio::fs::create_dir_all(&workspaces).await?;
    info!("Initialized Kiln in {:?}", root);

    println!("Created:");
    println!("  {}", path.display());
    println!("  {}/", workspaces.display());
    Ok(())
}

async fn cmd_project(root: &Path, action: ProjectCommands) -> Result<()> {
    let store = open_store(root).await?;
    match action {
        ProjectCommands::Create { name } => {
            let project = store.create_project(&name).await?;
            println!("Created project {} ({})", project.id, project.name);
        }
        ProjectCommands::List => {
            let projects = store.list_projects().await?;
            if projects.is_empty() {
                println!("No projects");
            }
            for project in projects {
                let runs = store.list_runs(project.id).await?;
                println!(
                    "{:>4}  {:<30} {} runs  created {}",
                    project.id,
                    project.name,
                    runs.len(),
                    project.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    Ok(())
}

async fn cmd_run(root: &Path, project: ProjectId, prompt: String, serve: bool) -> Result<()> {
    let config = load_config(root)?;
    let store: Arc<dyn RunStore> = Arc::new(open_store(root).await?);

    let generator = HttpGenerator::from_config(&config.generator, config.api_key())
        .context("Failed to configure generator")?;
    info!("Using {} at {}", generator.provider().name(), generator.provider().endpoint());
    let codegen = CodeGenerator::new(Arc::new(generator), &config);

    let run = store
        .create_run(project, &prompt)
        .await
        .with_context(|| format!("Failed to create run for project {}", project))?;
    println!("Run {} queued", run.id);

    let orchestrator = RunOrchestrator::new(codegen, store.clone(), config);
    let workspace = orchestrator.workspace_for(&run);
    let outcome = orchestrator.execute(run.id).await?;

    println!(
        "Run {}: {} after {} attempt(s)",
        outcome.run_id, outcome.status, outcome.attempts
    );
    println!("Workspace: {}", workspace.root().display());
    if let Some(reason) = &outcome.reason {
        println!("Reason: {}", reason);
    }

    let Some(handle) = outcome.handle else {
        return Ok(());
    };
    println!("Application: {}", handle.url());
    if let Some(pid) = handle.pid() {
        println!("PID: {}", pid);
    }

    if serve {
        println!("Serving; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        handle.shutdown().await?;
        println!("Stopped");
    }
    Ok(())
}

async fn cmd_status(root: &Path, run_id: RunId) -> Result<()> {
    let store = open_store(root).await?;
    let run = store.get_run(run_id).await?;

    println!("Run {}", run.id);
    println!("==========");
    println!("Project:    {}", run.project_id);
    println!("Status:     {}", run.status);
    println!("Attempts:   {}", run.attempts);
    if !run.entrypoint.is_empty() {
        println!("Entrypoint: {}", run.entrypoint);
    }
    println!("Created:    {}", run.created_at.to_rfc3339());
    println!("Updated:    {}", run.updated_at.to_rfc3339());
    Ok(())
}

async fn cmd_logs(root: &Path, run_id: RunId, after: Option<u64>, follow: bool) -> Result<()> {
    let mut last = after;
    loop {
        // Reopen to see lines appended by the process driving the run
        let store = open_store(root).await?;
        for event in store.list_logs(run_id, last).await? {
            println!(
                "{} [{:<5}] {:<8} {}",
                event.created_at.format("%H:%M:%S"),
                event.severity.to_string(),
                event.stage,
                event.message
            );
            last = Some(event.id);
        }

        if !follow || store.get_run(run_id).await?.status.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn cmd_patch(file: PathBuf, workspace: PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let report = apply_patch_text(&Workspace::new(workspace), &text).await?;

    println!("Patch applied: {}", report.summary());
    for path in &report.files_created {
        println!("  + {}", path);
    }
    for path in &report.files_modified {
        println!("  ~ {}", path);
    }
    for (path, reason) in report.skipped.iter().chain(report.failed.iter()) {
        println!("  ! {}: {}", path, reason);
    }
    Ok(())
}

async fn cmd_extract(root: &Path, file: PathBuf) -> Result<()> {
    let config = KilnConfig::load_or_default(root)?;
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let candidate = extract_document(&raw)?;
    let doc = parse_document(&candidate)?;
    let artifact = normalize_artifact(&doc, &config.layout());

    println!("Shape:      {:?}", detect_shape(&doc));
    println!("Entrypoint: {}", artifact.entrypoint);
    println!("Files:      {}", artifact.files.len());
    for f in &artifact.files {
        println!("  {} ({} bytes)", f.path, f.content.len());
    }
    if !artifact.run_config.is_empty() {
        println!("Run config: {}", serde_json::to_string(&artifact.run_config)?);
    }
    Ok(())
}
