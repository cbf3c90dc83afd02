use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::error::FetchResult;

const SITE_CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS site_matrix (
    project TEXT NOT NULL,
    language TEXT NOT NULL,
    dbname TEXT NOT NULL,
    url TEXT NOT NULL,
    PRIMARY KEY (project, language)
);
CREATE INDEX IF NOT EXISTS idx_site_matrix_dbname ON site_matrix(dbname);

CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const FETCHED_AT_KEY: &str = "site_matrix_fetched_at_unix";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub language: String,
    /// Repository site key, e.g. `enwiki`.
    pub dbname: String,
    pub url: String,
}

impl SiteInfo {
    pub fn api_url(&self) -> String {
        format!("{}/w/api.php", self.url.trim_end_matches('/'))
    }
}

/// One row of the remote site matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    pub project: String,
    pub language: String,
    pub dbname: String,
    pub url: String,
}

pub trait SiteMatrixSource {
    fn fetch_site_matrix(&mut self) -> FetchResult<Vec<SiteEntry>>;
}

/// Language-code/site cross-reference for one project. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct SiteMatrix {
    project: String,
    by_language: BTreeMap<String, SiteInfo>,
    language_by_site_key: BTreeMap<String, String>,
}

impl SiteMatrix {
    pub fn from_entries(project: &str, entries: &[SiteEntry]) -> Self {
        let mut by_language = BTreeMap::new();
        let mut language_by_site_key = BTreeMap::new();
        for entry in entries.iter().filter(|entry| entry.project == project) {
            if entry.language.is_empty() || entry.dbname.is_empty() {
                continue;
            }
            if by_language.contains_key(&entry.language) {
                continue;
            }
            language_by_site_key.insert(entry.dbname.clone(), entry.language.clone());
            by_language.insert(
                entry.language.clone(),
                SiteInfo {
                    language: entry.language.clone(),
                    dbname: entry.dbname.clone(),
                    url: entry.url.clone(),
                },
            );
        }
        Self {
            project: project.to_string(),
            by_language,
            language_by_site_key,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Only Wikipedia gets new linkage records; sister projects update existing ones.
    pub fn allows_creation(&self) -> bool {
        self.project == "wikipedia"
    }

    pub fn len(&self) -> usize {
        self.by_language.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_language.is_empty()
    }

    pub fn contains_language(&self, language: &str) -> bool {
        self.by_language.contains_key(language)
    }

    pub fn site(&self, language: &str) -> Option<&SiteInfo> {
        self.by_language.get(language)
    }

    pub fn site_key(&self, language: &str) -> Option<&str> {
        self.by_language
            .get(language)
            .map(|site| site.dbname.as_str())
    }

    pub fn language_for_site_key(&self, site_key: &str) -> Option<&str> {
        self.language_by_site_key
            .get(site_key)
            .map(String::as_str)
    }

    /// Maps `language -> title` pairs to `site key -> title`, keeping order and
    /// dropping languages without a site in this project.
    pub fn to_site_keys(&self, links: &[(String, String)]) -> Vec<(String, String)> {
        links
            .iter()
            .filter_map(|(language, title)| {
                self.site_key(language)
                    .map(|key| (key.to_string(), title.clone()))
            })
            .collect()
    }

    /// Maps repository `site key -> title` links back to languages of this project.
    pub fn to_language_links(&self, links: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        links
            .iter()
            .filter_map(|(key, title)| {
                self.language_for_site_key(key)
                    .map(|language| (language.to_string(), title.clone()))
            })
            .collect()
    }

    pub fn short_prefix(&self) -> &str {
        short_project_prefix(&self.project)
    }

    /// `[[en:Dog]]` in long form, `en` in short form; sister projects carry their prefix.
    pub fn wikitext_link(&self, language: &str, title: &str, long: bool) -> String {
        let prefix = self.short_prefix();
        let mut link = language.to_string();
        if !prefix.is_empty() {
            link.push(':');
            link.push_str(prefix);
        }
        if long {
            format!("[[{link}:{title}]]")
        } else {
            link
        }
    }
}

/// Project name as used in configuration for a sitematrix site code.
pub fn project_for_site_code(code: &str) -> String {
    match code {
        "wiki" => "wikipedia".to_string(),
        other => other.to_string(),
    }
}

pub fn short_project_prefix(project: &str) -> &str {
    match project {
        "wiki" | "wikipedia" => "",
        "wikisource" => "s",
        "wikinews" => "n",
        "wikibooks" => "b",
        "wikiquote" => "q",
        "wikiversity" => "v",
        "wiktionary" => "wikt",
        "wikivoyage" => "voy",
        other => other,
    }
}

/// SQLite-backed copy of the site matrix with a fetch timestamp.
#[derive(Debug, Clone)]
pub struct SiteCache {
    db_path: PathBuf,
}

impl SiteCache {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    /// Builds the matrix for `project`, refreshing from `source` when the cache is
    /// missing or older than `max_age`. A failed refresh falls back to stale rows.
    pub fn refresh<S: SiteMatrixSource>(
        &self,
        source: &mut S,
        project: &str,
        max_age: Duration,
    ) -> Result<SiteMatrix> {
        self.refresh_at(source, project, max_age, unix_timestamp()?)
    }

    fn refresh_at<S: SiteMatrixSource>(
        &self,
        source: &mut S,
        project: &str,
        max_age: Duration,
        now: u64,
    ) -> Result<SiteMatrix> {
        let cached = self.load()?;
        if let Some((entries, fetched_at)) = &cached {
            let age = now.saturating_sub(*fetched_at);
            let matrix = SiteMatrix::from_entries(project, entries);
            if age <= max_age.as_secs() && !matrix.is_empty() {
                tracing::debug!(project, sites = matrix.len(), "using cached site matrix");
                return Ok(matrix);
            }
        }

        match source.fetch_site_matrix() {
            Ok(entries) => {
                let matrix = SiteMatrix::from_entries(project, &entries);
                if matrix.is_empty() {
                    tracing::warn!(project, "remote site matrix has no sites for project");
                } else {
                    self.store(&entries, now)?;
                    tracing::info!(project, sites = matrix.len(), "refreshed site matrix");
                    return Ok(matrix);
                }
            }
            Err(error) => {
                tracing::warn!(project, %error, "site matrix refresh failed");
            }
        }

        if let Some((entries, _)) = cached {
            let matrix = SiteMatrix::from_entries(project, &entries);
            if !matrix.is_empty() {
                tracing::warn!(project, "falling back to stale site matrix cache");
                return Ok(matrix);
            }
        }
        bail!("site matrix is unavailable for project {project}")
    }

    fn load(&self) -> Result<Option<(Vec<SiteEntry>, u64)>> {
        if !self.db_path.exists() {
            return Ok(None);
        }
        let connection = self.open()?;
        let fetched_at = match get_meta(&connection, FETCHED_AT_KEY)? {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("invalid {FETCHED_AT_KEY} value: {value}"))?,
            None => return Ok(None),
        };

        let mut statement = connection
            .prepare("SELECT project, language, dbname, url FROM site_matrix ORDER BY project, language")
            .context("failed to prepare site matrix query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(SiteEntry {
                    project: row.get(0)?,
                    language: row.get(1)?,
                    dbname: row.get(2)?,
                    url: row.get(3)?,
                })
            })
            .context("failed to query site matrix cache")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode site matrix row")?);
        }
        Ok(Some((entries, fetched_at)))
    }

    fn store(&self, entries: &[SiteEntry], now: u64) -> Result<()> {
        let mut connection = self.open()?;
        let transaction = connection
            .transaction()
            .context("failed to start site matrix transaction")?;
        transaction
            .execute("DELETE FROM site_matrix", [])
            .context("failed to clear site matrix cache")?;
        for entry in entries {
            transaction
                .execute(
                    "INSERT INTO site_matrix (project, language, dbname, url) VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(project, language) DO NOTHING",
                    params![entry.project, entry.language, entry.dbname, entry.url],
                )
                .with_context(|| format!("failed to cache site {}", entry.dbname))?;
        }
        transaction
            .execute(
                "INSERT INTO cache_meta (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![FETCHED_AT_KEY, now.to_string()],
            )
            .context("failed to stamp site matrix cache")?;
        transaction
            .commit()
            .context("failed to commit site matrix cache")
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache directory {}", parent.display())
            })?;
        }
        let connection = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .execute_batch(SITE_CACHE_SCHEMA_SQL)
            .context("failed to initialize site cache schema")?;
        Ok(connection)
    }
}

fn get_meta(connection: &Connection, key: &str) -> Result<Option<String>> {
    let mut statement = connection
        .prepare("SELECT value FROM cache_meta WHERE key = ?1 LIMIT 1")
        .context("failed to prepare cache meta query")?;
    let mut rows = statement
        .query([key])
        .with_context(|| format!("failed to read cache meta key {key}"))?;
    let row = match rows.next().context("failed to decode cache meta row")? {
        Some(row) => row,
        None => return Ok(None),
    };
    let value = row.get(0).context("failed to decode cache meta value")?;
    Ok(Some(value))
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
pub(crate) fn entry(project: &str, language: &str, dbname: &str) -> SiteEntry {
    SiteEntry {
        project: project.to_string(),
        language: language.to_string(),
        dbname: dbname.to_string(),
        url: format!("https://{language}.{project}.org"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{SiteCache, SiteEntry, SiteMatrix, SiteMatrixSource, entry};
    use crate::error::{FetchError, FetchResult};

    struct StaticSource {
        entries: Option<Vec<SiteEntry>>,
        calls: usize,
    }

    impl SiteMatrixSource for StaticSource {
        fn fetch_site_matrix(&mut self) -> FetchResult<Vec<SiteEntry>> {
            self.calls += 1;
            self.entries
                .clone()
                .ok_or_else(|| FetchError::Transport("meta unreachable".to_string()))
        }
    }

    fn wikipedia_entries() -> Vec<SiteEntry> {
        vec![
            entry("wikipedia", "en", "enwiki"),
            entry("wikipedia", "fr", "frwiki"),
            entry("wikivoyage", "en", "enwikivoyage"),
        ]
    }

    #[test]
    fn matrix_maps_languages_and_site_keys_both_ways() {
        let matrix = SiteMatrix::from_entries("wikipedia", &wikipedia_entries());
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.site_key("fr"), Some("frwiki"));
        assert_eq!(matrix.language_for_site_key("enwiki"), Some("en"));
        assert_eq!(matrix.language_for_site_key("enwikivoyage"), None);
        assert!(!matrix.contains_language("de"));
        assert_eq!(
            matrix.site("en").map(|site| site.api_url()).as_deref(),
            Some("https://en.wikipedia.org/w/api.php")
        );

        let links = BTreeMap::from([
            ("enwiki".to_string(), "Dog".to_string()),
            ("dewiki".to_string(), "Hund".to_string()),
        ]);
        let languages = matrix.to_language_links(&links);
        assert_eq!(languages.len(), 1);
        assert_eq!(languages.get("en").map(String::as_str), Some("Dog"));
    }

    #[test]
    fn wikitext_links_carry_project_prefix() {
        let wikipedia = SiteMatrix::from_entries("wikipedia", &wikipedia_entries());
        assert_eq!(wikipedia.wikitext_link("en", "Dog", true), "[[en:Dog]]");
        assert_eq!(wikipedia.wikitext_link("en", "Dog", false), "en");

        let voyage = SiteMatrix::from_entries("wikivoyage", &wikipedia_entries());
        assert_eq!(voyage.wikitext_link("en", "Paris", true), "[[en:voy:Paris]]");
    }

    #[test]
    fn only_wikipedia_allows_record_creation() {
        let wikipedia = SiteMatrix::from_entries("wikipedia", &wikipedia_entries());
        let voyage = SiteMatrix::from_entries("wikivoyage", &wikipedia_entries());
        assert!(wikipedia.allows_creation());
        assert!(!voyage.allows_creation());
    }

    #[test]
    fn refresh_fetches_once_then_serves_from_cache() {
        let temp = tempdir().expect("tempdir");
        let cache = SiteCache::new(&temp.path().join("data").join("sites.db"));
        let mut source = StaticSource {
            entries: Some(wikipedia_entries()),
            calls: 0,
        };
        let max_age = Duration::from_secs(10 * 86_400);

        let first = cache
            .refresh_at(&mut source, "wikipedia", max_age, 1_000)
            .expect("first refresh");
        assert_eq!(first.len(), 2);
        let second = cache
            .refresh_at(&mut source, "wikipedia", max_age, 2_000)
            .expect("second refresh");
        assert_eq!(second.site_key("en"), Some("enwiki"));
        assert_eq!(source.calls, 1);
    }

    #[test]
    fn expired_cache_is_refetched_and_stale_rows_survive_failures() {
        let temp = tempdir().expect("tempdir");
        let cache = SiteCache::new(&temp.path().join("sites.db"));
        let max_age = Duration::from_secs(60);
        let mut source = StaticSource {
            entries: Some(wikipedia_entries()),
            calls: 0,
        };
        cache
            .refresh_at(&mut source, "wikipedia", max_age, 0)
            .expect("seed cache");

        let mut failing = StaticSource {
            entries: None,
            calls: 0,
        };
        let stale = cache
            .refresh_at(&mut failing, "wikipedia", max_age, 10_000)
            .expect("stale fallback");
        assert_eq!(failing.calls, 1);
        assert_eq!(stale.len(), 2);
    }

    #[test]
    fn refresh_fails_without_cache_or_remote() {
        let temp = tempdir().expect("tempdir");
        let cache = SiteCache::new(&temp.path().join("sites.db"));
        let mut failing = StaticSource {
            entries: None,
            calls: 0,
        };
        let error = cache
            .refresh_at(&mut failing, "wikipedia", Duration::from_secs(60), 0)
            .expect_err("must fail");
        assert!(error.to_string().contains("site matrix is unavailable"));
    }
}
