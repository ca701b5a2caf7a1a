//! CLI binary for deploying and inspecting Dockership projects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use dockership_clients::{DryRunConnector, HttpConnector};
use dockership_core::{
    load_catalog, Connector, DeployEvent, Dockership, EventEmitter, OutputSink, DEFAULT_CONFIG_FILE,
};
use dockership_types::{Container, DockershipError, Image};

#[derive(Parser)]
#[command(name = "dockership", version, about = "Deploy Docker images built from GitHub heads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the head revision with what each environment runs
    Status {
        /// Project to inspect (default: every project)
        project: Option<String>,

        /// Print the statuses as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build and run the head revision of a project on an environment
    Deploy {
        project: String,
        environment: String,

        /// Deploy even if the endpoints already run the head revision
        #[arg(short, long)]
        force: bool,

        /// Resolve and render for real, but build and run on in-memory engines
        #[arg(long)]
        dry_run: bool,
    },

    /// List the containers of a project across its environments
    Containers { project: String },

    /// List the images of a project across its environments
    Images { project: String },

    /// Remove the containers of a project and prune its old images
    Clean { project: String, environment: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set.
    let filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dry_run = matches!(cli.command, Commands::Deploy { dry_run: true, .. });
    let dockership = connect(&cli.config, dry_run).await?;

    match cli.command {
        Commands::Status { project, json } => cmd_status(&dockership, project.as_deref(), json).await?,
        Commands::Deploy {
            project,
            environment,
            force,
            ..
        } => cmd_deploy(&dockership, &project, &environment, force, dry_run).await?,
        Commands::Containers { project } => cmd_containers(&dockership, &project).await?,
        Commands::Images { project } => cmd_images(&dockership, &project).await?,
        Commands::Clean {
            project,
            environment,
        } => cmd_clean(&dockership, &project, &environment).await?,
    }

    Ok(())
}

async fn connect(config: &Path, dry_run: bool) -> anyhow::Result<Dockership> {
    let catalog = load_catalog(config).await?;
    let connector: Arc<dyn Connector> = if dry_run {
        Arc::new(DryRunConnector::new(HttpConnector::new()))
    } else {
        Arc::new(HttpConnector::new())
    };
    Ok(Dockership::new(catalog, connector, EventEmitter::default()))
}

fn print_errors(errors: &[DockershipError]) {
    for err in errors {
        eprintln!("  error: {err}");
    }
}

fn timestamp(created: i64) -> String {
    chrono::DateTime::from_timestamp(created, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| created.to_string())
}

async fn cmd_status(dockership: &Dockership, project: Option<&str>, json: bool) -> anyhow::Result<()> {
    let names: Vec<String> = match project {
        Some(name) => vec![name.to_string()],
        None => dockership.catalog().projects().map(|p| p.name.clone()).collect(),
    };

    for name in names {
        let (statuses, errors) = dockership.status(&name).await?;
        if json {
            let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
            let value = serde_json::json!({ "project": name, "statuses": statuses, "errors": errors });
            println!("{}", serde_json::to_string_pretty(&value)?);
            continue;
        }

        println!("{name}");
        for status in &statuses {
            let running = status.running_revision().unwrap_or("-");
            let state = if status.is_up_to_date() { "up to date" } else { "outdated" };
            println!(
                "  {:<12} head={} running={} containers={}/{} images={} [{state}]",
                status.environment,
                status.last_revision.get_short(),
                running,
                status.running_containers.len(),
                status.containers.len(),
                status.images.len(),
            );
        }
        print_errors(&errors);
    }

    Ok(())
}

fn describe(event: &DeployEvent) -> Option<String> {
    let line = match event {
        DeployEvent::TaskStarted {
            project,
            environment,
            task,
        } => format!("{task} of {project} on {environment} started"),
        DeployEvent::TaskFinished {
            task,
            errors,
            duration_ms,
            ..
        } => format!("{task} finished in {duration_ms}ms with {} error(s)", errors.len()),
        DeployEvent::DeploySkipped { endpoint, image, .. } => {
            format!("{endpoint}: already running {image}, skipped")
        }
        DeployEvent::ImagesPruned { endpoint, removed, .. } => {
            format!("{endpoint}: pruned {removed} image(s)")
        }
        DeployEvent::ImageBuilt { endpoint, image, .. } => format!("{endpoint}: built {image}"),
        DeployEvent::ContainersRemoved { endpoint, removed, .. } => {
            format!("{endpoint}: removed {removed} container(s)")
        }
        DeployEvent::ContainerStarted {
            endpoint,
            container,
            image,
            ..
        } => format!("{endpoint}: started {container} from {image}"),
        DeployEvent::LinkedContainerRestarted {
            endpoint, container, ..
        } => format!("{endpoint}: restarted linked {container}"),
        // Already written by tracing.
        DeployEvent::Log { .. } => return None,
    };
    Some(line)
}

/// Print deploy events until the emitter's last sender is gone or the task
/// is aborted.
fn spawn_event_printer(events: &EventEmitter) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        println!("==> {line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn cmd_deploy(
    dockership: &Dockership,
    project: &str,
    environment: &str,
    force: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        println!("(dry run -- building on in-memory engines)");
    }

    let printer = spawn_event_printer(dockership.events());
    let (output, mut lines) = OutputSink::channel();
    let build_log = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            println!("[{}] {}", line.endpoint, line.line);
        }
    });

    let result = dockership.deploy(project, environment, &output, force).await;
    drop(output);
    let _ = build_log.await;

    let mut report = match result {
        Ok(report) => report,
        Err(err) => {
            printer.abort();
            return Err(err.into());
        }
    };
    if let Some(webhook) = report.webhook.take() {
        let _ = webhook.await;
    }
    printer.abort();

    match &report.revision {
        Some(revision) => println!("\nDeployed {} revision {}", report.project, revision.get_short()),
        None => println!("\nNo revision deployed for {}", report.project),
    }
    print_errors(&report.errors);

    if !report.is_success() {
        anyhow::bail!(
            "deploy of {} to {} failed with {} error(s)",
            report.project,
            report.environment,
            report.errors.len()
        );
    }
    Ok(())
}

fn print_container(c: &Container) {
    println!(
        "  {:<28} {}  {:<24} {:<20} {}  {}",
        c.endpoint,
        c.short_id(),
        c.image.as_str(),
        c.status,
        timestamp(c.created),
        c.ports_string(),
    );
}

fn print_image(i: &Image) {
    let tags = if i.repo_tags.is_empty() {
        "<none>".to_string()
    } else {
        i.repo_tags.join(",")
    };
    let id = i.id.trim_start_matches("sha256:");
    let short = id.get(..12).unwrap_or(id);
    println!("  {:<28} {}  {:<24} {}", i.endpoint, short, tags, timestamp(i.created));
}

async fn cmd_containers(dockership: &Dockership, project: &str) -> anyhow::Result<()> {
    let (containers, errors) = dockership.list_containers(project).await?;
    println!("Containers of {project}: {}", containers.len());
    containers.iter().for_each(print_container);
    print_errors(&errors);
    Ok(())
}

async fn cmd_images(dockership: &Dockership, project: &str) -> anyhow::Result<()> {
    let (images, errors) = dockership.list_images(project).await?;
    println!("Images of {project}: {}", images.len());
    images.iter().for_each(print_image);
    print_errors(&errors);
    Ok(())
}

async fn cmd_clean(dockership: &Dockership, project: &str, environment: &str) -> anyhow::Result<()> {
    let printer = spawn_event_printer(dockership.events());
    let errors = dockership.clean(project, environment).await;
    printer.abort();

    let errors = errors?;
    if errors.is_empty() {
        println!("Cleaned {project} on {environment}");
        return Ok(());
    }
    print_errors(&errors);
    anyhow::bail!("clean of {project} on {environment} failed with {} error(s)", errors.len());
}
