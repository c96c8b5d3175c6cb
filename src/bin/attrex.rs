//! Attrex CLI: product image attribute extraction.
//!
//! Usage:
//!   attrex extract --image photo.jpg --schema schema.yaml [--category dresses]
//!   attrex run --schema schema.yaml [--db path] IMAGES...
//!   attrex providers
//!   attrex jobs <subcommand> [--db path]

use attrex::queue::{JobStatusView, ShutdownReport};
use attrex::schema::StaticSchemaProvider;
use attrex::{
    AppConfig, AttributeSchema, ExtractionRequest, ExtractionScheduler, FusionStrategy, ImageRef,
    JobId, JobStatus, JobStore, JobSubmission, OpenStore, Priority, ProductContext,
    SchemaProvider, SqliteJobStore, StagedPipeline,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "attrex",
    version,
    about = "Staged multi-provider attribute extraction from product images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to YAML config (defaults to ~/.config/attrex/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (overrides ATTREX_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract attributes from one image and print the result as JSON
    Extract {
        /// Image file
        #[arg(long)]
        image: PathBuf,
        #[command(flatten)]
        schema: SchemaArgs,
        /// Run the discovery stage
        #[arg(long)]
        discovery: bool,
        /// Use the fusion ensemble (voting, weighted or best); bare flag uses
        /// the configured default_fusion
        #[arg(long, num_args = 0..=1, value_name = "STRATEGY")]
        fuse: Option<Option<FusionStrategy>>,
    },
    /// Queue images through the scheduler and wait for them to finish
    Run {
        #[command(flatten)]
        schema: SchemaArgs,
        /// Requested priority (low, normal, high)
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Submitter identity, checked against the privileged list
        #[arg(long)]
        submitter: Option<String>,
        /// Run the discovery stage
        #[arg(long)]
        discovery: bool,
        /// Use the fusion ensemble (voting, weighted or best); bare flag uses
        /// the configured default_fusion
        #[arg(long, num_args = 0..=1, value_name = "STRATEGY")]
        fuse: Option<Option<FusionStrategy>>,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List configured providers and their health
    Providers,
    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
        /// Path to SQLite database file
        #[arg(long, global = true)]
        db: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct SchemaArgs {
    /// Schema YAML: a list of attributes, or a category table with --category
    #[arg(long)]
    schema: PathBuf,
    /// Category to pick from a category table
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    subdepartment: Option<String>,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Show one job, including its result
    Status {
        /// Job ID
        id: JobId,
    },
    /// Delete finished jobs older than the retention window
    Cleanup {
        /// Override the configured retention, in days
        #[arg(long)]
        days: Option<u64>,
    },
    /// Show counts per status and token usage
    Overview,
}

/// Get the default database path (~/.local/share/attrex/jobs.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let attrex_dir = data_dir.join("attrex");
    std::fs::create_dir_all(&attrex_dir).ok();
    attrex_dir.join("jobs.db")
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig, String> {
    match path {
        Some(path) => AppConfig::load(&path).map_err(|e| e.to_string()),
        None => match AppConfig::default_path().filter(|p| p.exists()) {
            Some(path) => AppConfig::load(&path).map_err(|e| e.to_string()),
            None => Ok(AppConfig::default()),
        },
    }
}

fn load_schema(args: &SchemaArgs) -> Result<AttributeSchema, String> {
    match &args.category {
        Some(category) => {
            let provider = StaticSchemaProvider::load(&args.schema)
                .map_err(|e| format!("Failed to load schema table: {}", e))?;
            provider.schema_for(category).map_err(|e| e.to_string())
        }
        None => {
            let text = std::fs::read_to_string(&args.schema)
                .map_err(|e| format!("Failed to read {}: {}", args.schema.display(), e))?;
            serde_yaml::from_str(&text).map_err(|e| format!("Invalid schema: {}", e))
        }
    }
}

fn product_context(args: &SchemaArgs) -> ProductContext {
    let mut context = ProductContext::new();
    if let Some(department) = &args.department {
        context = context.with_department(department.clone());
    }
    if let Some(category) = &args.category {
        context = context.with_category(category.clone());
    }
    if let Some(subdepartment) = &args.subdepartment {
        context = context.with_subdepartment(subdepartment.clone());
    }
    context
}

fn build_pipeline(config: &AppConfig) -> Result<StagedPipeline, String> {
    let registry = config.build_registry();
    if registry.is_empty() {
        return Err("no providers configured; pass --config".to_string());
    }
    config.build_pipeline(&registry).map_err(|e| e.to_string())
}

fn open_store(db: Option<PathBuf>, config: &AppConfig) -> Result<SqliteJobStore, String> {
    let db_path = db
        .or_else(|| config.database.clone())
        .unwrap_or_else(default_db_path);
    SqliteJobStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_extract(
    config: &AppConfig,
    image: &Path,
    schema_args: &SchemaArgs,
    discovery: bool,
    fuse: Option<Option<FusionStrategy>>,
) -> Result<i32, String> {
    let pipeline = build_pipeline(config)?;
    let schema = load_schema(schema_args)?;
    let payload = ImageRef::path(image)
        .resolve()
        .await
        .map_err(|e| e.to_string())?;

    let mut request = ExtractionRequest::new(payload, schema)
        .with_context(product_context(schema_args))
        .with_discovery(discovery);
    if let Some(requested) = fuse {
        request = request.with_fusion(config.pipeline.fusion_strategy(requested));
    }

    let outcome = pipeline.run(&request).await.map_err(|e| e.to_string())?;
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(print_json(&outcome))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config: &AppConfig,
    schema_args: &SchemaArgs,
    priority: Priority,
    submitter: Option<String>,
    discovery: bool,
    fuse: Option<Option<FusionStrategy>>,
    db: Option<PathBuf>,
    images: &[PathBuf],
) -> Result<i32, String> {
    let pipeline = build_pipeline(config)?;
    let schema = load_schema(schema_args)?;
    let store: Arc<dyn JobStore> = Arc::new(open_store(db, config)?);
    let scheduler = ExtractionScheduler::new(config.scheduler.clone(), Arc::new(pipeline), store);

    let recovered = scheduler.recover().map_err(|e| e.to_string())?;
    if !recovered.requeued.is_empty() {
        eprintln!("Resuming {} pending job(s) from a previous run", recovered.requeued.len());
    }

    let mut ids = Vec::with_capacity(images.len());
    for image in images {
        let mut submission = JobSubmission::new(ImageRef::path(image), schema.clone())
            .with_context(product_context(schema_args))
            .with_priority(priority)
            .with_discovery(discovery);
        if let Some(submitter) = &submitter {
            submission = submission.submitted_by(submitter.clone());
        }
        if let Some(requested) = fuse {
            submission = submission.with_fusion(config.pipeline.fusion_strategy(requested));
        }
        let id = scheduler.add_job(submission).map_err(|e| e.to_string())?;
        println!("{}  {}", id, image.display());
        ids.push(id);
    }

    scheduler.start();
    scheduler.wait_until_idle(Duration::from_millis(200)).await;
    let report: ShutdownReport = scheduler.shutdown(scheduler.config().drain_timeout()).await;

    let mut failed = 0;
    for id in ids.iter().chain(recovered.requeued.iter()) {
        if let Some(view) = scheduler.job_status(id).map_err(|e| e.to_string())? {
            if view.status != JobStatus::Completed {
                failed += 1;
            }
            print_view_line(&view);
        }
    }
    if !report.drained {
        eprintln!("{} job(s) interrupted", report.interrupted.len());
    }
    Ok(if failed == 0 { 0 } else { 1 })
}

fn print_view_line(view: &JobStatusView) {
    let detail = match (&view.result, &view.error) {
        (Some(result), _) => format!(
            "{} attributes, confidence {:.0}",
            result.attributes.len(),
            result.confidence
        ),
        (None, Some(error)) => error.message.clone(),
        (None, None) => String::new(),
    };
    println!("{:<36}  {:<10}  {:<6}  {}", view.job_id, view.status, view.priority, detail);
}

fn cmd_providers(config: &AppConfig) -> i32 {
    let registry = config.build_registry();
    if registry.is_empty() {
        println!("No providers configured.");
        return 0;
    }
    println!("{:<20}  {:<10}  {:<28}  {}", "ID", "KIND", "MODEL", "HEALTH");
    println!("{}", "-".repeat(72));
    for (id, healthy) in registry.health() {
        let Some(spec) = config.providers.get(&id) else {
            continue;
        };
        let model = spec
            .model
            .clone()
            .unwrap_or_else(|| spec.kind.default_model().to_string());
        let health = if healthy { "ok" } else { "unavailable" };
        println!("{:<20}  {:<10}  {:<28}  {}", id, spec.kind.as_str(), model, health);
    }
    0
}

fn cmd_jobs(config: &AppConfig, action: JobsAction, db: Option<PathBuf>) -> Result<i32, String> {
    let store = open_store(db, config)?;
    match action {
        JobsAction::List { status } => {
            let jobs = match status {
                Some(status) => store.list_jobs_by_status(status),
                None => store.list_jobs(),
            }
            .map_err(|e| e.to_string())?;
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(0);
            }
            println!("{:<36}  {:<10}  {:<6}  {:>6}  {}", "ID", "STATUS", "PRIO", "COST", "CREATED");
            println!("{}", "-".repeat(88));
            for job in jobs {
                println!(
                    "{:<36}  {:<10}  {:<6}  {:>6}  {}",
                    job.id,
                    job.status,
                    job.priority,
                    job.estimated_cost,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(0)
        }
        JobsAction::Status { id } => match store.get_job(&id).map_err(|e| e.to_string())? {
            Some(job) => Ok(print_json(&job)),
            None => {
                eprintln!("Error: job '{}' not found", id);
                Ok(1)
            }
        },
        JobsAction::Cleanup { days } => {
            let retention = days
                .map(|d| chrono::Duration::days(d as i64))
                .unwrap_or_else(|| config.scheduler.retention());
            let removed = store
                .delete_terminal_before(chrono::Utc::now() - retention)
                .map_err(|e| e.to_string())?;
            println!("Removed {} finished job(s)", removed);
            Ok(0)
        }
        JobsAction::Overview => {
            let counts = store.count_by_status().map_err(|e| e.to_string())?;
            let used = store
                .usage_since(chrono::Utc::now() - config.scheduler.window())
                .map_err(|e| e.to_string())?;
            for status in JobStatus::ALL {
                println!("{:<10}  {:>6}", status, counts.get(status));
            }
            println!(
                "tokens used this window: {} / {}",
                used, config.scheduler.token_limit
            );
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    attrex::logging::init(cli.verbose);

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Extract {
            image,
            schema,
            discovery,
            fuse,
        } => cmd_extract(&config, &image, &schema, discovery, fuse).await,
        Commands::Run {
            schema,
            priority,
            submitter,
            discovery,
            fuse,
            db,
            images,
        } => {
            cmd_run(&config, &schema, priority, submitter, discovery, fuse, db, &images).await
        }
        Commands::Providers => Ok(cmd_providers(&config)),
        Commands::Jobs { action, db } => cmd_jobs(&config, action, db),
    };

    let code = result.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        1
    });
    std::process::exit(code);
}
