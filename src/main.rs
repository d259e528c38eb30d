use std::error::Error as StdError;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::runtime::Runtime;

use arachne::config_adapters::engine_config_from_settings;
use arachne::core::signal::SignalManager;
use arachne::engine::{Components, Engine, EngineStats};
use arachne::link_spider::LinkSpider;
use arachne::middleware::UrlFilterMiddleware;
use arachne::pipeline::JsonLinesPipeline;
use arachne::settings::Settings;

type CliResult<T> = std::result::Result<T, Box<dyn StdError>>;

#[derive(Parser)]
#[command(
    name = "arachne",
    about = "A concurrent, rate-limited web crawler",
    version,
    long_about = None
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl from the given URLs, following links
    #[command(name = "crawl")]
    Crawl(CrawlArgs),

    /// Print the effective configuration for a settings file
    #[command(name = "settings")]
    Settings {
        /// Settings file (.toml, .json, .yaml)
        file: PathBuf,
    },
}

#[derive(Args)]
struct CrawlArgs {
    /// Start URLs
    #[arg(required = true)]
    urls: Vec<String>,

    /// Settings file (.toml, .json, .yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write scraped items to this file as JSON lines
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Delay between requests to the same host, in seconds
    #[arg(long)]
    delay: Option<f64>,

    /// Maximum number of concurrent requests
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only follow links to this domain; repeatable. Defaults to the start URL hosts.
    #[arg(long = "allowed-domain")]
    allowed_domains: Vec<String>,

    /// Maximum link depth, 0 for unlimited
    #[arg(long)]
    max_depth: Option<u64>,

    /// Only follow URLs matching this regex; repeatable
    #[arg(long)]
    allow: Vec<String>,

    /// Never follow URLs matching this regex; repeatable
    #[arg(long)]
    deny: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.log_level.as_deref());

    let outcome = match cli.command {
        Commands::Crawl(args) => crawl(args),
        Commands::Settings { file } => show_settings(&file),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_logger(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        match LevelFilter::from_str(level) {
            Ok(level) => {
                builder.filter_level(level);
            }
            Err(_) => eprintln!("Ignoring unknown log level '{}'", level),
        }
    }
    builder.init();
}

fn load_settings(path: Option<&PathBuf>) -> CliResult<Settings> {
    match path {
        Some(path) => Ok(Settings::from_file(path)?),
        None => Ok(Settings::new()),
    }
}

fn crawl(args: CrawlArgs) -> CliResult<()> {
    let mut settings = load_settings(args.config.as_ref())?;
    if let Some(delay) = args.delay {
        settings.set("DOWNLOAD_DELAY", delay)?;
    }
    if let Some(concurrency) = args.concurrency {
        settings.set("CONCURRENT_REQUESTS", concurrency)?;
    }
    if let Some(max_depth) = args.max_depth {
        settings.set("DEPTH_LIMIT", max_depth)?;
    }
    let config = engine_config_from_settings(&settings)?;

    let mut spider = LinkSpider::new("arachne", args.urls)?;
    if !args.allowed_domains.is_empty() {
        spider = spider.with_allowed_domains(args.allowed_domains);
    }

    let mut components = Components::from_config(&config, Arc::new(SignalManager::new()))?;
    if !args.allow.is_empty() || !args.deny.is_empty() {
        let allow: Vec<&str> = args.allow.iter().map(String::as_str).collect();
        let deny: Vec<&str> = args.deny.iter().map(String::as_str).collect();
        components
            .spider_middlewares
            .register(UrlFilterMiddleware::from_strings(&allow, &deny)?);
    }
    if let Some(output) = &args.output {
        components.pipelines.register(JsonLinesPipeline::new(output));
    }

    let engine = Engine::with_components(Arc::new(spider), components, config);
    let runtime = Runtime::new()?;
    let stats = runtime.block_on(run_until_interrupted(&engine))?;

    println!("\nCrawl completed!");
    println!("Requests: {}", stats.request_count);
    println!("Responses: {}", stats.response_count);
    println!("Items: {}", stats.item_count);
    println!("Dropped items: {}", stats.item_dropped_count);
    println!("Errors: {}", stats.error_count);
    if let Some(duration) = stats.duration() {
        println!("Duration: {:.3} seconds", duration.as_secs_f64());
    }
    if let Some(rps) = stats.requests_per_second() {
        println!("Requests per second: {:.2}", rps);
    }
    if let Some(output) = &args.output {
        println!("Items written to {}", output.display());
    }
    Ok(())
}

/// Run the crawl, stopping it cleanly on Ctrl-C
async fn run_until_interrupted(engine: &Engine) -> CliResult<EngineStats> {
    tokio::select! {
        stats = engine.run() => Ok(stats?),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            engine.stop().await?;
            Ok(engine.summary().await)
        }
    }
}

fn show_settings(path: &PathBuf) -> CliResult<()> {
    let settings = Settings::from_file(path)?;
    let config = engine_config_from_settings(&settings)?;

    println!("Settings from {}:", path.display());
    for (key, value) in settings.all() {
        println!("  {} = {}", key, value);
    }
    println!("\nEffective configuration:");
    println!("{:#?}", config);
    Ok(())
}
