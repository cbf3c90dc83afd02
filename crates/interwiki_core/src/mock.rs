use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{FetchError, FetchResult};
use crate::gateway::{
    LinkGroup, LinkageStore, LinkageWrite, MoveEvent, MoveLogQuery, Normalization, PageFact,
    Redirect, RemoteGateway, SeedPage, SeedQuery, TitleResolution,
};
use crate::sites::{SiteEntry, SiteInfo, SiteMatrix, entry};

pub(crate) fn site(language: &str) -> SiteInfo {
    SiteInfo {
        language: language.to_string(),
        dbname: format!("{language}wiki"),
        url: format!("https://{language}.wikipedia.org"),
    }
}

pub(crate) fn site_entries() -> Vec<SiteEntry> {
    ["de", "en", "es", "fr", "it"]
        .iter()
        .map(|language| entry("wikipedia", language, &format!("{language}wiki")))
        .collect()
}

pub(crate) fn site_matrix() -> SiteMatrix {
    SiteMatrix::from_entries("wikipedia", &site_entries())
}

pub(crate) fn at(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

#[derive(Debug, Clone)]
struct MockPage {
    namespace: i32,
    redirect: Option<(String, Option<String>)>,
    langlinks: BTreeMap<String, String>,
}

/// In-memory wiki family plus linkage repository.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockWiki {
    pages: BTreeMap<(String, String), MockPage>,
    records: BTreeMap<String, BTreeMap<String, String>>,
    moves: Vec<(String, MoveEvent)>,
    seeds: Vec<String>,
    seed_queries: Vec<SeedQuery>,
    dropped: BTreeSet<String>,
    oversized_alone: BTreeSet<String>,
    max_batch: Option<usize>,
    transport_failures: usize,
    login_failures: usize,
    failing_write_titles: BTreeSet<String>,
    writes: Vec<LinkageWrite>,
    log: Vec<String>,
    next_record: u32,
}

impl MockWiki {
    pub(crate) fn new() -> Self {
        Self {
            next_record: 100,
            ..Self::default()
        }
    }

    pub(crate) fn page(&mut self, language: &str, title: &str, namespace: i32) -> &mut Self {
        self.pages.insert(
            (language.to_string(), title.to_string()),
            MockPage {
                namespace,
                redirect: None,
                langlinks: BTreeMap::new(),
            },
        );
        self
    }

    pub(crate) fn redirect(&mut self, language: &str, from: &str, to: &str) -> &mut Self {
        self.redirect_with_section(language, from, to, None)
    }

    pub(crate) fn redirect_with_section(
        &mut self,
        language: &str,
        from: &str,
        to: &str,
        section: Option<&str>,
    ) -> &mut Self {
        self.pages.insert(
            (language.to_string(), from.to_string()),
            MockPage {
                namespace: 0,
                redirect: Some((to.to_string(), section.map(str::to_string))),
                langlinks: BTreeMap::new(),
            },
        );
        self
    }

    pub(crate) fn langlinks(
        &mut self,
        language: &str,
        title: &str,
        links: &[(&str, &str)],
    ) -> &mut Self {
        let page = self
            .pages
            .entry((language.to_string(), title.to_string()))
            .or_insert_with(|| MockPage {
                namespace: 0,
                redirect: None,
                langlinks: BTreeMap::new(),
            });
        for (link_language, link_title) in links {
            page.langlinks
                .insert((*link_language).to_string(), (*link_title).to_string());
        }
        self
    }

    pub(crate) fn record(&mut self, id: &str, links: &[(&str, &str)]) -> &mut Self {
        self.records.insert(
            id.to_string(),
            links
                .iter()
                .map(|(key, title)| ((*key).to_string(), (*title).to_string()))
                .collect(),
        );
        self
    }

    pub(crate) fn moved(
        &mut self,
        language: &str,
        from: &str,
        to: &str,
        timestamp: &str,
    ) -> &mut Self {
        self.moved_in(language, 0, from, to, timestamp)
    }

    pub(crate) fn moved_in(
        &mut self,
        language: &str,
        namespace: i32,
        from: &str,
        to: &str,
        timestamp: &str,
    ) -> &mut Self {
        self.moves.push((
            language.to_string(),
            MoveEvent {
                title: from.to_string(),
                namespace: Some(namespace),
                target_title: to.to_string(),
                target_namespace: Some(namespace),
                timestamp: at(timestamp),
            },
        ));
        self
    }

    pub(crate) fn seeds(&mut self, titles: &[&str]) -> &mut Self {
        self.seeds = titles.iter().map(|title| (*title).to_string()).collect();
        self
    }

    pub(crate) fn drop_from_batches(&mut self, title: &str) -> &mut Self {
        self.dropped.insert(title.to_string());
        self
    }

    /// Resolving this title on its own is answered as too large.
    pub(crate) fn oversized_alone(&mut self, title: &str) -> &mut Self {
        self.oversized_alone.insert(title.to_string());
        self
    }

    pub(crate) fn max_batch(&mut self, size: usize) -> &mut Self {
        self.max_batch = Some(size);
        self
    }

    pub(crate) fn fail_transport(&mut self, times: usize) -> &mut Self {
        self.transport_failures = times;
        self
    }

    pub(crate) fn fail_logins(&mut self, times: usize) -> &mut Self {
        self.login_failures = times;
        self
    }

    pub(crate) fn fail_writes_for(&mut self, title: &str) -> &mut Self {
        self.failing_write_titles.insert(title.to_string());
        self
    }

    pub(crate) fn writes(&self) -> &[LinkageWrite] {
        &self.writes
    }

    pub(crate) fn record_links(&self, id: &str) -> Option<&BTreeMap<String, String>> {
        self.records.get(id)
    }

    pub(crate) fn seed_queries(&self) -> &[SeedQuery] {
        &self.seed_queries
    }

    pub(crate) fn request_log(&self) -> Vec<String> {
        self.log.clone()
    }

    fn enter(&mut self, operation: &str, size: usize) -> FetchResult<()> {
        self.log.push(format!("{operation}:{size}"));
        if self.transport_failures > 0 {
            self.transport_failures -= 1;
            return Err(FetchError::Transport("connection reset by peer".to_string()));
        }
        if self.max_batch.is_some_and(|max| size > max) {
            return Err(FetchError::SizeExceeded);
        }
        Ok(())
    }

    fn lookup(&self, language: &str, title: &str) -> Option<&MockPage> {
        self.pages.get(&(language.to_string(), title.to_string()))
    }
}

/// Sorted `titles` from `from` on, `limit` at a time.
fn page_from(titles: &[String], from: &str, limit: usize) -> SeedPage {
    let remaining: Vec<&String> = titles.iter().filter(|title| title.as_str() >= from).collect();
    SeedPage {
        titles: remaining.iter().take(limit).map(|title| (*title).clone()).collect(),
        next_from: remaining.get(limit).map(|title| (*title).clone()),
    }
}

fn normalize(title: &str) -> String {
    let title = title.replace('_', " ");
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl RemoteGateway for MockWiki {
    fn resolve_titles(
        &mut self,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<TitleResolution> {
        self.enter("resolve", titles.len())?;
        if let [title] = titles
            && self.oversized_alone.contains(title)
        {
            return Err(FetchError::SizeExceeded);
        }
        let mut resolution = TitleResolution::default();
        let mut seen_pages = BTreeSet::new();
        for title in titles {
            if titles.len() > 1 && self.dropped.contains(title) {
                continue;
            }
            let canonical = normalize(title);
            if canonical != *title {
                resolution.normalized.push(Normalization {
                    from: title.clone(),
                    to: canonical.clone(),
                });
            }
            // Redirect chains are followed hop by hop until a title repeats.
            let mut landing = canonical.clone();
            let mut visited = BTreeSet::from([landing.clone()]);
            while let Some((target, section)) = self
                .lookup(&site.language, &landing)
                .and_then(|page| page.redirect.clone())
            {
                resolution.redirects.push(Redirect {
                    from: landing.clone(),
                    to: target.clone(),
                    fragment: section,
                });
                if !visited.insert(target.clone()) {
                    break;
                }
                landing = target;
            }
            if !seen_pages.insert(landing.clone()) {
                continue;
            }
            let fact = match self.lookup(&site.language, &landing) {
                Some(page) => PageFact {
                    title: landing,
                    namespace: Some(page.namespace),
                    missing: false,
                },
                None => PageFact {
                    title: landing,
                    namespace: Some(0),
                    missing: true,
                },
            };
            resolution.pages.push(fact);
        }
        Ok(resolution)
    }

    fn cross_reference_links(
        &mut self,
        site_key: &str,
        titles: &[String],
    ) -> FetchResult<Vec<LinkGroup>> {
        self.enter("crossref", titles.len())?;
        Ok(self
            .records
            .iter()
            .filter(|(_, links)| {
                links
                    .get(site_key)
                    .is_some_and(|title| titles.contains(title))
            })
            .map(|(id, links)| LinkGroup {
                record_id: id.clone(),
                links: links.clone(),
            })
            .collect())
    }

    fn local_language_links(
        &mut self,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<BTreeMap<String, BTreeMap<String, String>>> {
        self.enter("langlinks", titles.len())?;
        let mut out = BTreeMap::new();
        for title in titles {
            if let Some(page) = self.lookup(&site.language, title)
                && page.redirect.is_none()
            {
                out.insert(title.clone(), page.langlinks.clone());
            }
        }
        Ok(out)
    }

    fn move_log(&mut self, site: &SiteInfo, query: &MoveLogQuery) -> FetchResult<Vec<MoveEvent>> {
        self.enter("movelog", 1)?;
        let mut events: Vec<MoveEvent> = self
            .moves
            .iter()
            .filter(|(language, _)| *language == site.language)
            .map(|(_, event)| event)
            .filter(|event| query.title.as_ref().is_none_or(|title| *title == event.title))
            .filter(|event| {
                query
                    .namespace
                    .is_none_or(|namespace| event.namespace == Some(namespace))
            })
            .filter(|event| query.since.is_none_or(|since| event.timestamp >= since))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        events.truncate(query.limit.max(1));
        Ok(events)
    }

    fn list_seeds(&mut self, site: &SiteInfo, query: &SeedQuery) -> FetchResult<SeedPage> {
        self.enter("seeds", 1)?;
        self.seed_queries.push(query.clone());
        match query {
            SeedQuery::AllPages { from, limit, .. } => Ok(page_from(&self.seeds, from, *limit)),
            SeedQuery::AllRedirects { from, limit, .. } => {
                let redirects: Vec<String> = self
                    .pages
                    .iter()
                    .filter(|((language, _), page)| {
                        *language == site.language && page.redirect.is_some()
                    })
                    .map(|((_, title), _)| title.clone())
                    .collect();
                Ok(page_from(&redirects, from, *limit))
            }
            SeedQuery::NewPages { limit, .. }
            | SeedQuery::CategoryMembers { limit, .. }
            | SeedQuery::UserContributions { limit, .. } => Ok(SeedPage {
                titles: self.seeds.iter().take(*limit).cloned().collect(),
                next_from: None,
            }),
        }
    }

    fn request_count(&self) -> usize {
        self.log.len()
    }
}

impl LinkageStore for MockWiki {
    fn login(&mut self, _username: &str, _password: &str) -> FetchResult<()> {
        self.log.push("login:1".to_string());
        if self.login_failures > 0 {
            self.login_failures -= 1;
            return Err(FetchError::Transport("login endpoint unavailable".to_string()));
        }
        Ok(())
    }

    fn write_linkage(&mut self, write: &LinkageWrite) -> FetchResult<String> {
        self.log.push(format!("write:{}", write.links.len()));
        if write
            .links
            .iter()
            .any(|(_, title)| self.failing_write_titles.contains(title))
        {
            return Err(FetchError::api("failed-save", "The save has failed."));
        }
        self.writes.push(write.clone());
        let id = match &write.record_id {
            Some(id) => id.clone(),
            None => {
                self.next_record += 1;
                format!("Q{}", self.next_record)
            }
        };
        let links = self.records.entry(id.clone()).or_default();
        for (key, title) in &write.links {
            links.insert(key.clone(), title.clone());
        }
        Ok(id)
    }
}
