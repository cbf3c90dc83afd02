use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::{InterwikiConfig, env_override};
use crate::error::{FetchError, FetchResult};
use crate::gateway::{
    LinkGroup, LinkageStore, LinkageWrite, MoveEvent, MoveLogQuery, Normalization, PageFact,
    Redirect, RemoteGateway, SeedPage, SeedQuery, TitleResolution,
};
use crate::sites::{SiteEntry, SiteInfo, SiteMatrixSource, project_for_site_code};

const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub repo_api_url: String,
    pub site_matrix_api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl GatewayConfig {
    pub fn from_config(config: &InterwikiConfig) -> Self {
        Self {
            repo_api_url: config.repo_api_url(),
            site_matrix_api_url: config.site_matrix_api_url(),
            user_agent: config.user_agent(),
            timeout_ms: env_number("INTERWIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_number("INTERWIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_number("INTERWIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_number("INTERWIKI_HTTP_RETRIES", 2),
            max_write_retries: env_number("INTERWIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_number("INTERWIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

/// One remote operation with its typed parameters.
#[derive(Clone, Copy)]
pub enum ApiRequest<'a> {
    ResolveTitles {
        titles: &'a [String],
    },
    LanguageLinks {
        titles: &'a [String],
    },
    CrossReference {
        site_key: &'a str,
        titles: &'a [String],
    },
    MoveLog {
        query: &'a MoveLogQuery,
    },
    AllPages {
        namespace: i32,
        from: &'a str,
        limit: usize,
        redirects: bool,
    },
    NewPages {
        namespace: i32,
        until: DateTime<Utc>,
        limit: usize,
    },
    CategoryMembers {
        category: &'a str,
        namespace: i32,
        limit: usize,
    },
    Subcategories {
        category: &'a str,
        limit: usize,
    },
    UserContributions {
        user: &'a str,
        namespace: i32,
        until: DateTime<Utc>,
        limit: usize,
    },
    SiteMatrix,
    LoginToken,
    Login {
        username: &'a str,
        password: &'a str,
        token: &'a str,
    },
    CsrfToken,
    WriteLinkage {
        write: &'a LinkageWrite,
        token: &'a str,
    },
}

impl ApiRequest<'_> {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::ResolveTitles { .. } => "title resolution",
            Self::LanguageLinks { .. } => "language links",
            Self::CrossReference { .. } => "cross-reference",
            Self::MoveLog { .. } => "move log",
            Self::AllPages { .. } => "allpages",
            Self::NewPages { .. } => "new pages",
            Self::CategoryMembers { .. } => "category members",
            Self::Subcategories { .. } => "subcategories",
            Self::UserContributions { .. } => "user contributions",
            Self::SiteMatrix => "site matrix",
            Self::LoginToken => "login token",
            Self::Login { .. } => "login",
            Self::CsrfToken => "csrf token",
            Self::WriteLinkage { .. } => "linkage write",
        }
    }

    /// Sent as a form POST and paced by the write rate limit.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Login { .. } | Self::WriteLinkage { .. })
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::ResolveTitles { titles } => vec![
                ("action", "query".to_string()),
                ("redirects", "1".to_string()),
                ("titles", titles.join("|")),
            ],
            Self::LanguageLinks { titles } => vec![
                ("action", "query".to_string()),
                ("prop", "langlinks".to_string()),
                ("lllimit", "max".to_string()),
                ("titles", titles.join("|")),
            ],
            Self::CrossReference { site_key, titles } => vec![
                ("action", "wbgetentities".to_string()),
                ("props", "sitelinks".to_string()),
                ("sites", (*site_key).to_string()),
                ("titles", titles.join("|")),
            ],
            Self::MoveLog { query } => {
                let mut params = vec![
                    ("action", "query".to_string()),
                    ("list", "logevents".to_string()),
                    ("letype", "move".to_string()),
                    ("leprop", "title|timestamp|details".to_string()),
                    ("ledir", "newer".to_string()),
                    ("lelimit", query.limit.clamp(1, MAX_LIST_LIMIT).to_string()),
                ];
                if let Some(title) = &query.title {
                    params.push(("letitle", title.clone()));
                }
                if let Some(namespace) = query.namespace {
                    params.push(("lenamespace", namespace.to_string()));
                }
                if let Some(since) = query.since {
                    params.push(("lestart", api_timestamp(since)));
                }
                params
            }
            Self::AllPages {
                namespace,
                from,
                limit,
                redirects,
            } => vec![
                ("action", "query".to_string()),
                ("list", "allpages".to_string()),
                ("apnamespace", namespace.to_string()),
                ("apfrom", (*from).to_string()),
                (
                    "apfilterredir",
                    if *redirects { "redirects" } else { "nonredirects" }.to_string(),
                ),
                ("aplimit", (*limit).clamp(1, MAX_LIST_LIMIT).to_string()),
            ],
            Self::NewPages {
                namespace,
                until,
                limit,
            } => vec![
                ("action", "query".to_string()),
                ("list", "recentchanges".to_string()),
                ("rctype", "new".to_string()),
                ("rcnamespace", namespace.to_string()),
                ("rcshow", "!redirect".to_string()),
                ("rcprop", "title".to_string()),
                ("rcend", api_timestamp(*until)),
                ("rclimit", (*limit).clamp(1, MAX_LIST_LIMIT).to_string()),
            ],
            Self::CategoryMembers {
                category,
                namespace,
                limit,
            } => vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title(category)),
                ("cmnamespace", namespace.to_string()),
                ("cmlimit", (*limit).clamp(1, MAX_LIST_LIMIT).to_string()),
            ],
            Self::Subcategories { category, limit } => vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title(category)),
                ("cmtype", "subcat".to_string()),
                ("cmlimit", (*limit).clamp(1, MAX_LIST_LIMIT).to_string()),
            ],
            Self::UserContributions {
                user,
                namespace,
                until,
                limit,
            } => vec![
                ("action", "query".to_string()),
                ("list", "usercontribs".to_string()),
                ("ucuser", (*user).to_string()),
                ("ucnamespace", namespace.to_string()),
                ("ucprop", "title".to_string()),
                ("ucend", api_timestamp(*until)),
                ("uclimit", (*limit).clamp(1, MAX_LIST_LIMIT).to_string()),
            ],
            Self::SiteMatrix => vec![
                ("action", "sitematrix".to_string()),
                ("smtype", "language".to_string()),
                ("smlangprop", "code|site".to_string()),
                ("smsiteprop", "url|dbname|code".to_string()),
            ],
            Self::LoginToken => vec![
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ],
            Self::Login {
                username,
                password,
                token,
            } => vec![
                ("action", "login".to_string()),
                ("lgname", (*username).to_string()),
                ("lgpassword", (*password).to_string()),
                ("lgtoken", (*token).to_string()),
            ],
            Self::CsrfToken => vec![
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
            ],
            Self::WriteLinkage { write, token } => {
                let sitelinks: serde_json::Map<String, Value> = write
                    .links
                    .iter()
                    .map(|(site, title)| (site.clone(), json!({ "site": site, "title": title })))
                    .collect();
                let mut params = vec![("action", "wbeditentity".to_string())];
                match &write.record_id {
                    Some(id) => params.push(("id", id.clone())),
                    None => params.push(("new", "item".to_string())),
                }
                params.extend([
                    ("data", json!({ "sitelinks": sitelinks }).to_string()),
                    ("summary", write.summary.clone()),
                    ("bot", "1".to_string()),
                    ("token", (*token).to_string()),
                ]);
                params
            }
        }
    }
}

/// Blocking MediaWiki/Wikibase client behind the gateway traits.
pub struct MediaWikiGateway {
    client: Client,
    config: GatewayConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn send(
        &mut self,
        endpoint: &str,
        request: &ApiRequest<'_>,
        extra: &[(String, String)],
    ) -> FetchResult<Value> {
        let url = Url::parse(endpoint)
            .map_err(|error| FetchError::Transport(format!("invalid API URL {endpoint}: {error}")))?;
        let is_write = request.is_write();
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        let mut pairs = vec![
            ("format".to_string(), "json".to_string()),
            ("formatversion".to_string(), "2".to_string()),
        ];
        for (key, value) in request.params() {
            if !value.is_empty() {
                pairs.push((key.to_string(), value));
            }
        }
        pairs.extend(extra.iter().cloned());

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let builder = if is_write {
                self.client.post(url.clone()).form(&pairs)
            } else {
                self.client.get(url.clone()).query(&pairs)
            };

            match builder.send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::URI_TOO_LONG {
                        return Err(FetchError::SizeExceeded);
                    }
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        return Err(FetchError::Transport(format!(
                            "{} request failed with HTTP {status}",
                            request.operation()
                        )));
                    }
                    let payload: Value = response
                        .json()
                        .map_err(|error| FetchError::decode(request.operation(), error))?;
                    check_api_error(&payload)?;
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(FetchError::Transport(format!(
                        "failed to call {}: {error}",
                        request.operation()
                    )));
                }
            }
        }

        Err(FetchError::Transport(format!(
            "{} exhausted retry budget",
            request.operation()
        )))
    }

    /// Follows `continue` blocks until exhausted or `limit` items are collected.
    fn send_continued<T, F>(
        &mut self,
        endpoint: &str,
        request: &ApiRequest<'_>,
        limit: usize,
        mut extract: F,
    ) -> FetchResult<Vec<T>>
    where
        F: FnMut(Value) -> FetchResult<Vec<T>>,
    {
        let mut items = Vec::new();
        let mut continuation: Vec<(String, String)> = Vec::new();
        loop {
            let payload = self.send(endpoint, request, &continuation)?;
            let next = continuation_params(&payload);
            items.extend(extract(payload)?);
            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
            match next {
                Some(next) => continuation = next,
                None => break,
            }
        }
        Ok(items)
    }

    fn all_pages(
        &mut self,
        endpoint: &str,
        namespace: i32,
        from: &str,
        limit: usize,
        redirects: bool,
    ) -> FetchResult<SeedPage> {
        let request = ApiRequest::AllPages {
            namespace,
            from,
            limit,
            redirects,
        };
        let payload = self.send(endpoint, &request, &[])?;
        let next_from = payload
            .get("continue")
            .and_then(|block| block.get("apcontinue"))
            .and_then(Value::as_str)
            .map(|cursor| cursor.replace('_', " "));
        Ok(SeedPage {
            titles: parse_titles(payload, "allpages")?,
            next_from,
        })
    }

    /// Members of `category` and of subcategories down to `depth` levels,
    /// breadth first, each category visited once.
    fn category_tree(
        &mut self,
        endpoint: &str,
        category: &str,
        namespace: i32,
        depth: u32,
        limit: usize,
    ) -> FetchResult<Vec<String>> {
        let root = category_title(category);
        let mut visited = BTreeSet::from([root.clone()]);
        let mut queue = VecDeque::from([(root, 0u32)]);
        let mut titles = Vec::new();

        while let Some((current, level)) = queue.pop_front() {
            let remaining = limit.saturating_sub(titles.len());
            if remaining == 0 {
                break;
            }
            let request = ApiRequest::CategoryMembers {
                category: &current,
                namespace,
                limit: remaining,
            };
            titles.extend(self.send_continued(endpoint, &request, remaining, |payload| {
                parse_titles(payload, "categorymembers")
            })?);
            titles = dedup_titles(titles);

            if level < depth {
                let request = ApiRequest::Subcategories {
                    category: &current,
                    limit: MAX_LIST_LIMIT,
                };
                let subcategories = self.send_continued(endpoint, &request, usize::MAX, |payload| {
                    parse_titles(payload, "categorymembers")
                })?;
                for subcategory in subcategories {
                    if visited.insert(subcategory.clone()) {
                        queue.push_back((subcategory, level + 1));
                    }
                }
            }
        }
        tracing::debug!(category, depth, categories = visited.len(), pages = titles.len(), "walked category tree");
        titles.truncate(limit);
        Ok(titles)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        let delay = base.saturating_mul(multiplier).saturating_add(jitter);
        tracing::debug!(attempt, delay_ms = delay, "retrying MediaWiki request");
        sleep(Duration::from_millis(delay));
    }

    fn ensure_csrf_token(&mut self) -> FetchResult<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let endpoint = self.config.repo_api_url.clone();
        let payload = self.send(&endpoint, &ApiRequest::CsrfToken, &[])?;
        let parsed: TokenQueryResponse = decode(payload, "csrf token")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| FetchError::decode("csrf token", "response carries no csrftoken"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl RemoteGateway for MediaWikiGateway {
    fn resolve_titles(
        &mut self,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<TitleResolution> {
        let payload = self.send(&site.api_url(), &ApiRequest::ResolveTitles { titles }, &[])?;
        parse_title_resolution(payload)
    }

    fn cross_reference_links(
        &mut self,
        site_key: &str,
        titles: &[String],
    ) -> FetchResult<Vec<LinkGroup>> {
        let endpoint = self.config.repo_api_url.clone();
        let payload = self.send(
            &endpoint,
            &ApiRequest::CrossReference { site_key, titles },
            &[],
        )?;
        parse_link_groups(payload)
    }

    fn local_language_links(
        &mut self,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<BTreeMap<String, BTreeMap<String, String>>> {
        let pages = self.send_continued(
            &site.api_url(),
            &ApiRequest::LanguageLinks { titles },
            usize::MAX,
            parse_language_links,
        )?;
        let mut links: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (title, page_links) in pages {
            links.entry(title).or_default().extend(page_links);
        }
        Ok(links)
    }

    fn move_log(&mut self, site: &SiteInfo, query: &MoveLogQuery) -> FetchResult<Vec<MoveEvent>> {
        self.send_continued(
            &site.api_url(),
            &ApiRequest::MoveLog { query },
            query.limit.max(1),
            parse_move_events,
        )
    }

    fn list_seeds(&mut self, site: &SiteInfo, query: &SeedQuery) -> FetchResult<SeedPage> {
        let endpoint = site.api_url();
        match query {
            SeedQuery::AllPages {
                namespace,
                from,
                limit,
            } => self.all_pages(&endpoint, *namespace, from, *limit, false),
            SeedQuery::AllRedirects {
                namespace,
                from,
                limit,
            } => self.all_pages(&endpoint, *namespace, from, *limit, true),
            SeedQuery::NewPages {
                namespace,
                hours,
                limit,
            } => {
                let until = Utc::now() - chrono::Duration::hours(i64::from(*hours));
                let request = ApiRequest::NewPages {
                    namespace: *namespace,
                    until,
                    limit: *limit,
                };
                let titles = self.send_continued(&endpoint, &request, *limit, |payload| {
                    parse_titles(payload, "recentchanges")
                })?;
                Ok(SeedPage {
                    titles: dedup_titles(titles),
                    next_from: None,
                })
            }
            SeedQuery::CategoryMembers {
                category,
                namespace,
                depth,
                limit,
            } => Ok(SeedPage {
                titles: self.category_tree(&endpoint, category, *namespace, *depth, *limit)?,
                next_from: None,
            }),
            SeedQuery::UserContributions {
                user,
                namespace,
                hours,
                limit,
            } => {
                let until = Utc::now() - chrono::Duration::hours(i64::from(*hours));
                let request = ApiRequest::UserContributions {
                    user,
                    namespace: *namespace,
                    until,
                    limit: *limit,
                };
                // One entry per edit; the limit counts pages.
                let titles = self.send_continued(&endpoint, &request, usize::MAX, |payload| {
                    parse_titles(payload, "usercontribs")
                })?;
                let mut titles = dedup_titles(titles);
                titles.truncate(*limit);
                Ok(SeedPage {
                    titles,
                    next_from: None,
                })
            }
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl LinkageStore for MediaWikiGateway {
    fn login(&mut self, username: &str, password: &str) -> FetchResult<()> {
        let endpoint = self.config.repo_api_url.clone();
        let payload = self.send(&endpoint, &ApiRequest::LoginToken, &[])?;
        let parsed: TokenQueryResponse = decode(payload, "login token")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| FetchError::decode("login token", "response carries no logintoken"))?;

        let payload = self.send(
            &endpoint,
            &ApiRequest::Login {
                username,
                password,
                token: &token,
            },
            &[],
        )?;
        let parsed: LoginResponse = decode(payload, "login")?;
        match parsed.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                tracing::info!(user = username, "logged in to the linkage repository");
                Ok(())
            }
            other => Err(FetchError::api(
                "login-failed",
                parsed
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    fn write_linkage(&mut self, write: &LinkageWrite) -> FetchResult<String> {
        let token = self.ensure_csrf_token()?;
        let endpoint = self.config.repo_api_url.clone();
        let result = self.send(
            &endpoint,
            &ApiRequest::WriteLinkage {
                write,
                token: &token,
            },
            &[],
        );
        if matches!(&result, Err(FetchError::Api { code, .. }) if code == "badtoken") {
            self.csrf_token = None;
        }
        let parsed: EditEntityResponse = decode(result?, "linkage write")?;
        parsed
            .entity
            .map(|entity| entity.id)
            .ok_or_else(|| FetchError::decode("linkage write", "response carries no entity id"))
    }
}

impl SiteMatrixSource for MediaWikiGateway {
    fn fetch_site_matrix(&mut self) -> FetchResult<Vec<SiteEntry>> {
        let endpoint = self.config.site_matrix_api_url.clone();
        let payload = self.send(&endpoint, &ApiRequest::SiteMatrix, &[])?;
        parse_site_matrix(payload)
    }
}

fn check_api_error(payload: &Value) -> FetchResult<()> {
    let Some(error) = payload.get("error") else {
        return Ok(());
    };
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    match code {
        "toomanyvalues" | "too-many-titles" => Err(FetchError::SizeExceeded),
        _ => Err(FetchError::api(code, info)),
    }
}

fn continuation_params(payload: &Value) -> Option<Vec<(String, String)>> {
    let block = payload.get("continue")?.as_object()?;
    let params: Vec<(String, String)> = block
        .iter()
        .filter_map(|(key, value)| match value {
            Value::String(text) => Some((key.clone(), text.clone())),
            Value::Number(number) => Some((key.clone(), number.to_string())),
            _ => None,
        })
        .collect();
    (!params.is_empty()).then_some(params)
}

fn decode<T: DeserializeOwned>(payload: Value, operation: &str) -> FetchResult<T> {
    serde_json::from_value(payload).map_err(|error| FetchError::decode(operation, error))
}

fn parse_title_resolution(payload: Value) -> FetchResult<TitleResolution> {
    let parsed: QueryResponse = decode(payload, "title resolution")?;
    Ok(TitleResolution {
        normalized: parsed
            .query
            .normalized
            .into_iter()
            .map(|item| Normalization {
                from: item.from,
                to: item.to,
            })
            .collect(),
        redirects: parsed
            .query
            .redirects
            .into_iter()
            .map(|item| Redirect {
                from: item.from,
                to: item.to,
                fragment: item.tofragment.filter(|fragment| !fragment.trim().is_empty()),
            })
            .collect(),
        pages: parsed
            .query
            .pages
            .into_iter()
            .map(|page| PageFact {
                title: page.title,
                namespace: page.ns,
                missing: page.missing || page.invalid,
            })
            .collect(),
    })
}

fn parse_link_groups(payload: Value) -> FetchResult<Vec<LinkGroup>> {
    let parsed: EntitiesResponse = decode(payload, "cross-reference")?;
    Ok(parsed
        .entities
        .into_values()
        .filter(|entity| !entity.missing)
        .filter_map(|entity| {
            let record_id = entity.id?;
            Some(LinkGroup {
                record_id,
                links: entity
                    .sitelinks
                    .into_iter()
                    .map(|(site, link)| (site, link.title))
                    .collect(),
            })
        })
        .collect())
}

fn parse_language_links(payload: Value) -> FetchResult<Vec<(String, BTreeMap<String, String>)>> {
    let parsed: QueryResponse = decode(payload, "language links")?;
    Ok(parsed
        .query
        .pages
        .into_iter()
        .filter(|page| !page.missing && !page.invalid)
        .map(|page| {
            let links = page
                .langlinks
                .into_iter()
                .filter_map(|link| {
                    let title = normalize_link_title(&link.title);
                    (!link.lang.is_empty() && !title.is_empty()).then_some((link.lang, title))
                })
                .collect();
            (page.title, links)
        })
        .collect())
}

fn parse_move_events(payload: Value) -> FetchResult<Vec<MoveEvent>> {
    let parsed: QueryResponse = decode(payload, "move log")?;
    let mut events = Vec::new();
    for item in parsed.query.logevents {
        let (Some(title), Some(params)) = (item.title, item.params) else {
            continue;
        };
        let timestamp = DateTime::parse_from_rfc3339(&item.timestamp)
            .map_err(|error| FetchError::decode("move log", error))?
            .with_timezone(&Utc);
        events.push(MoveEvent {
            title,
            namespace: item.ns,
            target_title: params.target_title,
            target_namespace: params.target_ns,
            timestamp,
        });
    }
    Ok(events)
}

fn parse_titles(payload: Value, list: &str) -> FetchResult<Vec<String>> {
    let parsed: QueryResponse = decode(payload, list)?;
    let items = match list {
        "allpages" => parsed.query.allpages,
        "recentchanges" => parsed.query.recentchanges,
        "usercontribs" => parsed.query.usercontribs,
        _ => parsed.query.categorymembers,
    };
    Ok(items.into_iter().map(|item| item.title).collect())
}

fn parse_site_matrix(payload: Value) -> FetchResult<Vec<SiteEntry>> {
    let parsed: SiteMatrixResponse = decode(payload, "site matrix")?;
    let mut entries = Vec::new();
    for (key, value) in parsed.sitematrix {
        if key == "count" || key == "specials" {
            continue;
        }
        let language: SiteMatrixLanguage = decode(value, "site matrix")?;
        for site in language.site.into_iter().filter(|site| !site.closed) {
            entries.push(SiteEntry {
                project: project_for_site_code(&site.code),
                language: language.code.clone(),
                dbname: site.dbname,
                url: site.url,
            });
        }
    }
    Ok(entries)
}

fn normalize_link_title(title: &str) -> String {
    title.replace('_', " ").trim().to_string()
}

fn dedup_titles(titles: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    titles
        .into_iter()
        .filter(|title| seen.insert(title.clone()))
        .collect()
}

fn category_title(category: &str) -> String {
    if category.contains(':') {
        category.to_string()
    } else {
        format!("Category:{category}")
    }
}

fn api_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_override(key)
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    normalized: Vec<FromToItem>,
    #[serde(default)]
    redirects: Vec<RedirectItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    logevents: Vec<LogEventItem>,
    #[serde(default)]
    allpages: Vec<TitleQueryItem>,
    #[serde(default)]
    recentchanges: Vec<TitleQueryItem>,
    #[serde(default)]
    categorymembers: Vec<TitleQueryItem>,
    #[serde(default)]
    usercontribs: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize)]
struct FromToItem {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct RedirectItem {
    from: String,
    to: String,
    tofragment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    ns: Option<i32>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    langlinks: Vec<LangLinkItem>,
}

#[derive(Debug, Deserialize)]
struct LangLinkItem {
    lang: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct LogEventItem {
    title: Option<String>,
    ns: Option<i32>,
    timestamp: String,
    params: Option<MoveParams>,
}

#[derive(Debug, Deserialize)]
struct MoveParams {
    target_ns: Option<i32>,
    target_title: String,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct EntitiesResponse {
    #[serde(default)]
    entities: BTreeMap<String, EntityItem>,
}

#[derive(Debug, Deserialize)]
struct EntityItem {
    id: Option<String>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    sitelinks: BTreeMap<String, SitelinkItem>,
}

#[derive(Debug, Deserialize)]
struct SitelinkItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct EditEntityResponse {
    entity: Option<EntityRef>,
}

#[derive(Debug, Deserialize)]
struct EntityRef {
    id: String,
}

#[derive(Debug, Deserialize, Default)]
struct SiteMatrixResponse {
    #[serde(default)]
    sitematrix: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SiteMatrixLanguage {
    code: String,
    #[serde(default)]
    site: Vec<SiteMatrixSite>,
}

#[derive(Debug, Deserialize)]
struct SiteMatrixSite {
    url: String,
    dbname: String,
    code: String,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
