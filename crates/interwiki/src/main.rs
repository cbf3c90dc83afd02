use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use interwiki_core::cancel::CancelToken;
use interwiki_core::config::{InterwikiConfig, load_config};
use interwiki_core::gateway::NS_MAIN;
use interwiki_core::logging::{LogGuards, LogSettings, init_logging};
use interwiki_core::mediawiki::{GatewayConfig, MediaWikiGateway};
use interwiki_core::moves::MoveScanOptions;
use interwiki_core::runner::{RetryPolicy, RunMode, Runner, RunnerSettings};
use interwiki_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use interwiki_core::sites::SiteCache;

#[derive(Debug, Parser)]
#[command(
    name = "interwiki",
    version,
    about = "Converges language links of wiki pages into linkage repository records"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            log_dir: cli.log_dir.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    /// Refresh the cached site matrix and print its size
    Sites(SitesArgs),
    /// Converge the given pages
    Page(PageArgs),
    /// Converge every page of a namespace between two titles
    Range(RangeArgs),
    /// Converge pages created recently
    New(NewArgs),
    /// Converge the members of a category
    Category(CategoryArgs),
    /// Converge pages recently edited by a user
    User(UserArgs),
    /// Retarget linkage records of recently moved pages
    Moves(MovesArgs),
    /// Retarget linkage records of redirects between two titles
    Redirects(RangeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SitesArgs {
    #[arg(long, value_name = "NAME", help = "Project family (defaults to config)")]
    project: Option<String>,
}

#[derive(Debug, Args)]
struct SiteArgs {
    #[arg(long, default_value = "en", value_name = "CODE", help = "Language code of the seed wiki")]
    lang: String,
    #[arg(long, value_name = "NAME", help = "Project family (defaults to config)")]
    project: Option<String>,
    #[arg(long, help = "Also check pages that already have a linkage record")]
    full_check: bool,
    #[arg(long, help = "Only update existing records, never create new ones")]
    only_update: bool,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(required = true, value_name = "TITLE")]
    titles: Vec<String>,
}

#[derive(Debug, Args)]
struct RangeArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(long, default_value = "", value_name = "TITLE", help = "First title of the range")]
    from: String,
    #[arg(long, value_name = "TITLE", help = "Last title of the range (inclusive)")]
    to: Option<String>,
    #[arg(long, default_value_t = NS_MAIN)]
    namespace: i32,
}

#[derive(Debug, Args)]
struct NewArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(long, default_value_t = 24)]
    hours: u32,
    #[arg(long, default_value_t = NS_MAIN)]
    namespace: i32,
    #[arg(long, default_value_t = 500)]
    limit: usize,
}

#[derive(Debug, Args)]
struct CategoryArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(value_name = "NAME")]
    category: String,
    #[arg(long, default_value_t = NS_MAIN)]
    namespace: i32,
    #[arg(long, default_value_t = 0, help = "Subcategory levels to descend")]
    depth: u32,
    #[arg(long, default_value_t = 500)]
    limit: usize,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(value_name = "USER")]
    user: String,
    #[arg(long, default_value_t = 24)]
    hours: u32,
    #[arg(long, default_value_t = NS_MAIN)]
    namespace: i32,
    #[arg(long, default_value_t = 500)]
    limit: usize,
}

#[derive(Debug, Args)]
struct MovesArgs {
    #[command(flatten)]
    site: SiteArgs,
    #[arg(long, default_value_t = 24)]
    hours: u32,
    #[arg(long, help = "Only moves from this namespace")]
    namespace: Option<i32>,
    #[arg(long, default_value_t = 500)]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Sites(args)) => run_sites(&runtime, args),
        Some(Commands::Page(PageArgs { site, titles })) => {
            run_bot(&runtime, &site, RunMode::Pages(titles))
        }
        Some(Commands::Range(RangeArgs {
            site,
            from,
            to,
            namespace,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::Range {
                namespace,
                from,
                to,
            },
        ),
        Some(Commands::New(NewArgs {
            site,
            hours,
            namespace,
            limit,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::NewPages {
                namespace,
                hours,
                limit,
            },
        ),
        Some(Commands::Category(CategoryArgs {
            site,
            category,
            namespace,
            depth,
            limit,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::Category {
                category,
                namespace,
                depth,
                limit,
            },
        ),
        Some(Commands::User(UserArgs {
            site,
            user,
            hours,
            namespace,
            limit,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::UserContributions {
                user,
                namespace,
                hours,
                limit,
            },
        ),
        Some(Commands::Moves(MovesArgs {
            site,
            hours,
            namespace,
            limit,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::Moves(MoveScanOptions {
                hours,
                namespace,
                limit,
                ..MoveScanOptions::default()
            }),
        ),
        Some(Commands::Redirects(RangeArgs {
            site,
            from,
            to,
            namespace,
        })) => run_bot(
            &runtime,
            &site,
            RunMode::RedirectRange {
                namespace,
                from,
                to,
            },
        ),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let created = init_layout(&paths, args.force)?;

    println!("Initialized interwiki runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("site_cache: {}", normalize_path(&paths.site_cache_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("log_dir: {}", normalize_path(&paths.log_dir));
    println!("created_dirs: {}", created.len());
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_sites(runtime: &RuntimeOptions, args: SitesArgs) -> Result<()> {
    let (paths, config, _guards) = prepare(runtime)?;
    let project = args.project.unwrap_or_else(|| config.project());
    let mut gateway = MediaWikiGateway::new(GatewayConfig::from_config(&config))?;
    let sites = SiteCache::new(&paths.site_cache_path).refresh(
        &mut gateway,
        &project,
        config.site_cache_max_age(),
    )?;

    println!("project: {}", sites.project());
    println!("sites: {}", sites.len());
    println!("site_cache: {}", normalize_path(&paths.site_cache_path));
    Ok(())
}

fn run_bot(runtime: &RuntimeOptions, site: &SiteArgs, mut mode: RunMode) -> Result<()> {
    let (paths, config, _guards) = prepare(runtime)?;
    if let RunMode::Moves(options) = &mut mode {
        options.move_wait_minutes = config.move_wait_minutes();
    }
    let project = site.project.clone().unwrap_or_else(|| config.project());

    let mut gateway = MediaWikiGateway::new(GatewayConfig::from_config(&config))?;
    let sites = SiteCache::new(&paths.site_cache_path).refresh(
        &mut gateway,
        &project,
        config.site_cache_max_age(),
    )?;
    if !sites.contains_language(&site.lang) {
        bail!("language {} has no site in project {project}", site.lang);
    }
    let rules_base = paths
        .config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths.project_root.clone());
    let conformity = config.namespace_rules(&rules_base)?;

    let settings = RunnerSettings {
        engine: config.engine_options(site.full_check, site.only_update),
        portions: config.portions(),
        portion_size: config.portion_size(),
        retry: RetryPolicy::default(),
    };
    let mut runner = Runner::new(gateway, sites, conformity, settings, CancelToken::new());

    let (username, password) = bot_credentials()?;
    runner.login_with_retry(&username, &password)?;
    tracing::info!(code = %site.lang, project = %project, user = %username, "logged in");

    let report = runner.run(&site.lang, &mode, Utc::now())?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn prepare(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, InterwikiConfig, LogGuards)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let configured_log_dir = config.log_dir(&paths.project_root);
    let paths = paths.with_config_log_dir(configured_log_dir);
    let guards = init_logging(&LogSettings::from_config(&config, Some(paths.log_dir.clone())))?;
    if runtime.diagnostics {
        println!("[diagnostics]\n{}", paths.diagnostics());
    }
    Ok((paths, config, guards))
}

fn bot_credentials() -> Result<(String, String)> {
    let username = std::env::var("INTERWIKI_BOT_USER")
        .context("INTERWIKI_BOT_USER must be set to log in to the linkage repository")?;
    let password = std::env::var("INTERWIKI_BOT_PASSWORD")
        .context("INTERWIKI_BOT_PASSWORD must be set to log in to the linkage repository")?;
    Ok((username, password))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
        log_dir: runtime.log_dir.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
