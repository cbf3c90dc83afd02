use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::BatchFetcher;
use crate::conformity::NamespaceConformityTable;
use crate::error::FetchResult;
use crate::gateway::{MoveEvent, MoveLogQuery, PageRecord, RemoteGateway};
use crate::resolver::TitleResolver;
use crate::sites::SiteInfo;

pub const MAX_CHAIN_STEPS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChainStep {
    Seed,
    Normalized,
    Redirect,
    Moved { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainLink {
    pub title: String,
    pub step: ChainStep,
    pub record: Option<PageRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Open,
    /// Tail is an existing page that is not a redirect.
    Resolved,
    Unresolved,
    Loop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSeed {
    pub title: String,
    pub namespace: Option<i32>,
    /// Time of the move that put this page under watch, if known.
    pub moved_at: Option<DateTime<Utc>>,
}

impl ChainSeed {
    pub fn from_move(event: &MoveEvent) -> Self {
        Self {
            title: event.title.clone(),
            namespace: event.namespace,
            moved_at: Some(event.timestamp),
        }
    }

    /// Existing redirect page with no known move behind it.
    pub fn redirect(title: &str, namespace: i32) -> Self {
        Self {
            title: title.to_string(),
            namespace: Some(namespace),
            moved_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectChain {
    pub seed_namespace: Option<i32>,
    pub links: Vec<ChainLink>,
    pub status: ChainStatus,
    pub loop_detected: bool,
    seed_moved_at: Option<DateTime<Utc>>,
}

impl RedirectChain {
    fn open(seed: &ChainSeed) -> Self {
        Self {
            seed_namespace: seed.namespace,
            links: vec![ChainLink {
                title: seed.title.clone(),
                step: ChainStep::Seed,
                record: None,
            }],
            status: ChainStatus::Open,
            loop_detected: false,
            seed_moved_at: seed.moved_at,
        }
    }

    pub fn seed_title(&self) -> &str {
        &self.links[0].title
    }

    pub fn final_title(&self) -> &str {
        &self.links[self.links.len() - 1].title
    }

    pub fn final_record(&self) -> Option<&PageRecord> {
        self.links.last().and_then(|link| link.record.as_ref())
    }

    pub fn contains(&self, title: &str) -> bool {
        self.links.iter().any(|link| link.title == title)
    }

    /// Latest move time already known in this chain.
    fn last_move_time(&self) -> Option<DateTime<Utc>> {
        self.links
            .iter()
            .filter_map(|link| match link.step {
                ChainStep::Moved { at } => Some(at),
                _ => None,
            })
            .chain(self.seed_moved_at)
            .max()
    }

    fn extend(&mut self, title: &str, step: ChainStep) {
        if self.contains(title) {
            self.loop_detected = true;
            self.status = ChainStatus::Loop;
            return;
        }
        self.links.push(ChainLink {
            title: title.to_string(),
            step,
            record: None,
        });
    }
}

/// Follows redirects and move-log entries from renamed pages to their current
/// titles on one site.
pub struct RedirectChainWalker<'a> {
    site: &'a SiteInfo,
    conformity: &'a NamespaceConformityTable,
    fetcher: &'a BatchFetcher,
    max_steps: usize,
}

impl<'a> RedirectChainWalker<'a> {
    pub fn new(
        site: &'a SiteInfo,
        conformity: &'a NamespaceConformityTable,
        fetcher: &'a BatchFetcher,
    ) -> Self {
        Self {
            site,
            conformity,
            fetcher,
            max_steps: MAX_CHAIN_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn resolve<G>(&self, gateway: &mut G, seeds: &[ChainSeed]) -> FetchResult<Vec<RedirectChain>>
    where
        G: RemoteGateway + ?Sized,
    {
        let mut chains: Vec<RedirectChain> = seeds.iter().map(RedirectChain::open).collect();
        let resolver = TitleResolver::new(self.fetcher);

        for step in 0..self.max_steps {
            let mut tails: Vec<String> = Vec::new();
            for chain in chains.iter().filter(|chain| chain.status == ChainStatus::Open) {
                let tail = chain.final_title().to_string();
                if !tails.contains(&tail) {
                    tails.push(tail);
                }
            }
            if tails.is_empty() {
                break;
            }
            self.fetcher.cancel_token().check()?;
            tracing::debug!(code = %self.site.language, step, titles = tails.len(), "walking redirect chains");
            let resolved = resolver.resolve(gateway, self.site, &tails)?;

            let mut needs_move_log = Vec::new();
            for (index, chain) in chains.iter_mut().enumerate() {
                if chain.status != ChainStatus::Open {
                    continue;
                }
                let Some(record) = resolved.get(chain.final_title()).cloned() else {
                    chain.status = ChainStatus::Unresolved;
                    continue;
                };
                if let Some(last) = chain.links.last_mut() {
                    last.record = Some(record.clone());
                }
                if chain.seed_namespace.is_none() && chain.links.len() == 1 {
                    chain.seed_namespace = record.namespace;
                }

                let into_section = record
                    .redirect_section
                    .as_deref()
                    .is_some_and(|section| !section.is_empty());
                match (record.redirect_target.as_deref(), record.normalized_title.as_deref()) {
                    (Some(_), _) if into_section => {
                        tracing::debug!(code = %self.site.language, title = %record.title, "redirect points into a section");
                        chain.status = ChainStatus::Unresolved;
                    }
                    (Some(target), _) if target != record.title => {
                        chain.extend(target, ChainStep::Redirect);
                    }
                    (None, Some(normalized)) if normalized != record.title => {
                        chain.extend(normalized, ChainStep::Normalized);
                    }
                    _ if record.is_missing => needs_move_log.push(index),
                    _ => chain.status = ChainStatus::Resolved,
                }
            }

            for index in needs_move_log {
                let chain = &mut chains[index];
                let title = chain.final_title().to_string();
                let since = chain.last_move_time();
                match self.next_move(gateway, &title, since)? {
                    Some(event) => chain.extend(&event.target_title, ChainStep::Moved {
                        at: event.timestamp,
                    }),
                    None => {
                        tracing::debug!(code = %self.site.language, %title, "no further move found");
                        chain.status = ChainStatus::Unresolved;
                    }
                }
            }
        }

        for chain in chains
            .iter_mut()
            .filter(|chain| chain.status == ChainStatus::Open)
        {
            tracing::warn!(
                code = %self.site.language,
                seed = %chain.seed_title(),
                steps = self.max_steps,
                "redirect chain exceeded step bound"
            );
            chain.status = ChainStatus::Unresolved;
        }
        Ok(chains)
    }

    /// Earliest move at or after `since` when a move time is known, otherwise the
    /// most recent move of `title`.
    fn next_move<G>(
        &self,
        gateway: &mut G,
        title: &str,
        since: Option<DateTime<Utc>>,
    ) -> FetchResult<Option<MoveEvent>>
    where
        G: RemoteGateway + ?Sized,
    {
        let titles = [title.to_string()];
        let events: Vec<MoveEvent> = self
            .fetcher
            .fetch(&self.site.language, "move log", &titles, |batch| {
                let query = MoveLogQuery {
                    since,
                    ..MoveLogQuery::for_title(&batch[0])
                };
                gateway.move_log(self.site, &query)
            })?
            .into_iter()
            .flatten()
            .filter(|event| event.title == title)
            .collect();

        Ok(match since {
            Some(since) => events
                .into_iter()
                .filter(|event| event.timestamp >= since)
                .min_by_key(|event| event.timestamp),
            None => events.into_iter().max_by_key(|event| event.timestamp),
        })
    }

    /// Resolved chains that end on a different title in a conforming namespace.
    pub fn accepted<'c>(&self, chains: &'c [RedirectChain]) -> Vec<&'c RedirectChain> {
        chains
            .iter()
            .filter(|chain| chain.status == ChainStatus::Resolved)
            .filter(|chain| chain.final_title() != chain.seed_title())
            .filter(|chain| {
                let final_namespace = chain.final_record().and_then(|record| record.namespace);
                match (chain.seed_namespace, final_namespace) {
                    (Some(seed), Some(last)) => self.conformity.is_compatible(
                        &self.site.language,
                        seed,
                        &self.site.language,
                        last,
                    ),
                    _ => false,
                }
            })
            .collect()
    }
}
