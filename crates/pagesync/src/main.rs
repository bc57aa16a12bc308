use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use pagesync_core::browser::ChromeLauncher;
use pagesync_core::category::classify;
use pagesync_core::config::{Settings, SettingsOverrides, load_config, resolve_settings};
use pagesync_core::response::SyncResponse;
use pagesync_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, normalize_for_display,
    resolve_paths,
};
use pagesync_core::service::SyncService;
use pagesync_core::source::source_from_settings;
use pagesync_core::webhook::{WebhookRequest, sign};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;

const DEFAULT_LOG_FILTER: &str = "pagesync=info,pagesync_core=info";
const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Parser)]
#[command(
    name = "pagesync",
    version,
    about = "Mirror code/css and code/js sources onto wiki pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Treat this invocation as local (webhooks are refused)")]
    local: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics to stderr")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    local: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            local: cli.local,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .pagesync/config.toml and the code/css, code/js roots")]
    Init(InitArgs),
    #[command(about = "Handle one webhook event document and print the response")]
    Receive(ReceiveArgs),
    #[command(name = "sync-all", about = "Replace every page under code/css and code/js")]
    SyncAll,
    #[command(about = "Serve POST /webhook over HTTP")]
    Serve(ServeArgs),
    #[command(about = "Print the X-Hub-Signature-256 value for a request body")]
    Sign(SignArgs),
    #[command(about = "Show which page a repository path maps to")]
    Classify(ClassifyArgs),
    #[command(about = "Print resolved paths and settings")]
    Config,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct ReceiveArgs {
    #[arg(
        long,
        value_name = "FILE",
        default_value = "-",
        help = "Event JSON ({headers, body}); '-' reads stdin"
    )]
    event: String,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_BIND)]
    bind: String,
}

#[derive(Debug, Args)]
struct SignArgs {
    #[arg(long, value_name = "FILE", default_value = "-", help = "'-' reads stdin")]
    body: String,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    let outcome = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Receive(args)) => run_receive(&runtime, args).await,
        Some(Commands::SyncAll) => run_sync_all(&runtime).await,
        Some(Commands::Serve(args)) => run_serve(&runtime, args).await,
        Some(Commands::Sign(args)) => run_sign(&runtime, args),
        Some(Commands::Classify(args)) => run_classify(args),
        Some(Commands::Config) => run_config(&runtime),
        None => print_help(),
    };

    match outcome {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn print_help() -> Result<ExitCode> {
    let mut command = Cli::command();
    command.print_help()?;
    println!();
    Ok(ExitCode::SUCCESS)
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<ExitCode> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized pagesync layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("code_dir: {}", normalize_for_display(&paths.code_dir()));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_receive(runtime: &RuntimeOptions, args: ReceiveArgs) -> Result<ExitCode> {
    let raw = read_input(&args.event)?;
    let request: WebhookRequest =
        serde_json::from_str(&raw).context("event must be a JSON object with headers and body")?;
    let service = build_service(runtime)?;
    let response = service.receive(&request).await;
    print_response(&response)
}

async fn run_sync_all(runtime: &RuntimeOptions) -> Result<ExitCode> {
    let service = build_service(runtime)?;
    let response = service.sync_all().await;
    print_response(&response)
}

async fn run_serve(runtime: &RuntimeOptions, args: ServeArgs) -> Result<ExitCode> {
    let service = build_service(runtime)?;
    server::serve(service, &args.bind).await?;
    Ok(ExitCode::SUCCESS)
}

fn run_sign(runtime: &RuntimeOptions, args: SignArgs) -> Result<ExitCode> {
    let (_, settings) = load_settings(runtime)?;
    let secret = settings
        .webhook
        .secret
        .as_ref()
        .context("webhook secret is not configured (set WEBHOOK_SECRET)")?;
    let body = read_input(&args.body)?;
    println!("{}", sign(secret, &body));
    Ok(ExitCode::SUCCESS)
}

fn run_classify(args: ClassifyArgs) -> Result<ExitCode> {
    for path in &args.paths {
        match classify(path) {
            Some(classified) => println!("{path}\t{}:{}", classified.category, classified.title),
            None => println!("{path}\tignored"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_config(runtime: &RuntimeOptions) -> Result<ExitCode> {
    let (paths, settings) = load_settings(runtime)?;
    println!("[paths]\n{}", paths.diagnostics());
    println!("\n[settings]\n{}", settings.diagnostics());
    Ok(ExitCode::SUCCESS)
}

fn build_service(runtime: &RuntimeOptions) -> Result<SyncService<ChromeLauncher>> {
    let (_, settings) = load_settings(runtime)?;
    let launcher = ChromeLauncher::from_settings(&settings);
    let source = source_from_settings(&settings.source)?;
    Ok(SyncService::new(settings, launcher, source))
}

fn load_settings(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, Settings)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let settings = resolve_settings(
        &config,
        &paths,
        SettingsOverrides {
            local_mode: runtime.local,
        },
    )?;
    if runtime.diagnostics {
        eprintln!(
            "[diagnostics]\n{}\n{}",
            paths.diagnostics(),
            settings.diagnostics()
        );
    }
    Ok((paths, settings))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_response(response: &SyncResponse) -> Result<ExitCode> {
    let rendered = serde_json::to_string_pretty(&response.envelope())?;
    println!("{rendered}");
    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        return Ok(buffer);
    }
    let path = Path::new(source);
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
