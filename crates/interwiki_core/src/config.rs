use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::batch::normalize_portions;
use crate::conformity::NamespaceConformityTable;
use crate::engine::{EngineOptions, ITERATION_LIMIT};

pub const DEFAULT_PROJECT: &str = "wikipedia";
pub const DEFAULT_USER_AGENT: &str = "interwiki/0.1";
pub const DEFAULT_REPO_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_SITE_MATRIX_API_URL: &str = "https://meta.wikimedia.org/w/api.php";
pub const DEFAULT_SITE_CACHE_MAX_AGE_DAYS: u64 = 10;
pub const DEFAULT_PORTION_SIZE: usize = 500;
pub const DEFAULT_MIN_LINKAGE_SIZE: usize = 2;
pub const DEFAULT_MOVE_WAIT_MINUTES: i64 = 60;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct InterwikiConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub bot: BotSection,
    #[serde(default)]
    pub logs: LogsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub project: Option<String>,
    pub repo_api_url: Option<String>,
    pub site_matrix_api_url: Option<String>,
    pub user_agent: Option<String>,
    pub site_cache_max_age_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotSection {
    #[serde(default)]
    pub portions: Vec<usize>,
    pub portion_size: Option<usize>,
    pub min_linkage_size: Option<usize>,
    #[serde(default)]
    pub language_order: Vec<String>,
    pub move_wait_minutes: Option<i64>,
    pub iteration_limit: Option<usize>,
    /// Inline `lang1:ns1|lang2:ns2` rules.
    #[serde(default)]
    pub namespace_rules: Vec<String>,
    pub namespace_rules_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LogsSection {
    pub dir: Option<String>,
    pub level: Option<String>,
}

impl InterwikiConfig {
    /// Project family: config > `wikipedia`.
    pub fn project(&self) -> String {
        self.wiki
            .project
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
    }

    /// env INTERWIKI_REPO_API_URL > config > DEFAULT_REPO_API_URL.
    pub fn repo_api_url(&self) -> String {
        env_override("INTERWIKI_REPO_API_URL")
            .or_else(|| self.wiki.repo_api_url.clone())
            .unwrap_or_else(|| DEFAULT_REPO_API_URL.to_string())
    }

    /// env INTERWIKI_SITE_MATRIX_API_URL > config > DEFAULT_SITE_MATRIX_API_URL.
    pub fn site_matrix_api_url(&self) -> String {
        env_override("INTERWIKI_SITE_MATRIX_API_URL")
            .or_else(|| self.wiki.site_matrix_api_url.clone())
            .unwrap_or_else(|| DEFAULT_SITE_MATRIX_API_URL.to_string())
    }

    /// env INTERWIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("INTERWIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn site_cache_max_age(&self) -> Duration {
        let days = self
            .wiki
            .site_cache_max_age_days
            .unwrap_or(DEFAULT_SITE_CACHE_MAX_AGE_DAYS);
        Duration::from_secs(days.saturating_mul(24 * 60 * 60))
    }

    /// Descending, de-duplicated sub-batch sizes ending in 1.
    pub fn portions(&self) -> Vec<usize> {
        normalize_portions(&self.bot.portions)
    }

    pub fn portion_size(&self) -> usize {
        self.bot
            .portion_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PORTION_SIZE)
    }

    pub fn min_linkage_size(&self) -> usize {
        self.bot
            .min_linkage_size
            .unwrap_or(DEFAULT_MIN_LINKAGE_SIZE)
            .max(1)
    }

    pub fn move_wait_minutes(&self) -> i64 {
        self.bot
            .move_wait_minutes
            .unwrap_or(DEFAULT_MOVE_WAIT_MINUTES)
            .max(0)
    }

    pub fn iteration_limit(&self) -> usize {
        self.bot
            .iteration_limit
            .filter(|limit| *limit > 0)
            .unwrap_or(ITERATION_LIMIT)
    }

    pub fn log_level(&self) -> &str {
        self.logs.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Log directory resolved against the project root, if configured.
    pub fn log_dir(&self, project_root: &Path) -> Option<PathBuf> {
        self.logs
            .dir
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .map(|dir| absolutize(Path::new(dir.trim()), project_root))
    }

    pub fn engine_options(&self, full_check: bool, only_update: bool) -> EngineOptions {
        EngineOptions {
            full_check,
            only_update,
            min_linkage_size: self.min_linkage_size(),
            language_order: self.bot.language_order.clone(),
            iteration_limit: self.iteration_limit(),
        }
    }

    /// Inline rules plus the rules file, resolved relative to `base_dir`.
    pub fn namespace_rules(&self, base_dir: &Path) -> Result<NamespaceConformityTable> {
        let mut table = NamespaceConformityTable::parse(&self.bot.namespace_rules.join("\n"));
        if let Some(file) = self
            .bot
            .namespace_rules_file
            .as_deref()
            .filter(|file| !file.trim().is_empty())
        {
            let path = absolutize(Path::new(file.trim()), base_dir);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read namespace rules {}", path.display()))?;
            table.extend(NamespaceConformityTable::parse(&content));
        }
        tracing::debug!(rules = table.len(), "loaded namespace conformity rules");
        Ok(table)
    }
}

/// Load and parse an InterwikiConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<InterwikiConfig> {
    if !config_path.exists() {
        return Ok(InterwikiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: InterwikiConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub(crate) fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
