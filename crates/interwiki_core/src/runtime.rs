use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".interwiki";
pub const SITE_CACHE_FILENAME: &str = "sites.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub site_cache_path: PathBuf,
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
    pub log_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\nsite_cache={}\nconfig_path={} ({})\nlog_dir={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.site_cache_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.log_dir),
            self.log_source.as_str(),
        )
    }

    /// Applies `[logs] dir` from the config unless a flag or env already chose it.
    pub fn with_config_log_dir(mut self, configured: Option<PathBuf>) -> Self {
        if matches!(self.log_source, ValueSource::Default)
            && let Some(dir) = configured
        {
            self.log_dir = absolutize(&dir, &self.project_root);
            self.log_source = ValueSource::Config;
        }
        self
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = resolve_under_project(
        overrides.data_dir.as_deref(),
        lookup_env("INTERWIKI_DATA_DIR"),
        &project_root,
        state_dir.join("data"),
    );
    let (config_path, config_source) = resolve_under_project(
        overrides.config.as_deref(),
        lookup_env("INTERWIKI_CONFIG"),
        &project_root,
        state_dir.join("config.toml"),
    );
    let (log_dir, log_source) = resolve_under_project(
        overrides.log_dir.as_deref(),
        lookup_env("INTERWIKI_LOG_DIR"),
        &project_root,
        state_dir.join("logs"),
    );

    Ok(ResolvedPaths {
        site_cache_path: data_dir.join(SITE_CACHE_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        log_dir,
        root_source,
        data_source,
        config_source,
        log_source,
    })
}

/// Creates the state layout and writes a starter config when none exists.
/// Returns the directories that were created.
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<Vec<PathBuf>> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir, &paths.log_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }
    if !paths.config_path.exists() || force {
        let parent = paths.config_path.parent().ok_or_else(|| {
            anyhow::anyhow!("path has no parent: {}", paths.config_path.display())
        })?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        fs::write(&paths.config_path, STARTER_CONFIG)
            .with_context(|| format!("failed to write {}", paths.config_path.display()))?;
    }
    Ok(created_dirs)
}

const STARTER_CONFIG: &str = r#"# interwiki configuration (materialized by `interwiki init`)

[wiki]
project = "wikipedia"
# repo_api_url = "https://www.wikidata.org/w/api.php"
# site_matrix_api_url = "https://meta.wikimedia.org/w/api.php"
# user_agent = "interwiki/0.1"
site_cache_max_age_days = 10

[bot]
portions = [50, 30, 20, 10, 5, 1]
portion_size = 500
min_linkage_size = 2
language_order = []
move_wait_minutes = 60
namespace_rules = []
# namespace_rules_file = "namespaces.txt"

[logs]
level = "info"
"#;

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("INTERWIKI_PROJECT_ROOT").filter(|value| !value.trim().is_empty())
    {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    let mut seen = HashSet::new();
    let mut candidates = ancestors(&context.cwd);
    if let Some(exe_dir) = context.executable_dir.as_deref() {
        candidates.extend(ancestors(exe_dir));
    }
    for candidate in candidates {
        if !seen.insert(normalize_for_display(&candidate)) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return (candidate, ValueSource::Heuristic);
        }
    }
    (context.cwd.clone(), ValueSource::Default)
}

fn resolve_under_project(
    flag: Option<&Path>,
    env_value: Option<String>,
    project_root: &Path,
    default: PathBuf,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, project_root), ValueSource::Flag);
    }
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return (
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        );
    }
    (default, ValueSource::Default)
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
