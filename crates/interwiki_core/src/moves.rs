use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::batch::BatchFetcher;
use crate::conformity::NamespaceConformityTable;
use crate::engine::CommitEntry;
use crate::error::FetchResult;
use crate::gateway::{LinkageStore, LinkageWrite, MoveEvent, MoveLogQuery, RemoteGateway};
use crate::logging::ACTION_TARGET;
use crate::sites::{SiteInfo, SiteMatrix};
use crate::summary::{Replacement, update_log_line, update_summary};
use crate::walker::{ChainSeed, RedirectChainWalker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveScanOptions {
    pub hours: u32,
    pub namespace: Option<i32>,
    pub limit: usize,
    /// Moves younger than this are left for a later run.
    pub move_wait_minutes: i64,
}

impl Default for MoveScanOptions {
    fn default() -> Self {
        Self {
            hours: 24,
            namespace: None,
            limit: 500,
            move_wait_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MoveReport {
    pub language: String,
    pub events: usize,
    pub with_records: usize,
    pub accepted: usize,
    pub retargeted: Vec<CommitEntry>,
    pub skipped: Vec<String>,
    pub write_errors: Vec<String>,
    pub requests: usize,
}

/// Retargets linkage records of renamed pages to their current titles.
pub struct MovedPagesTask<'a> {
    sites: &'a SiteMatrix,
    conformity: &'a NamespaceConformityTable,
    fetcher: &'a BatchFetcher,
}

impl<'a> MovedPagesTask<'a> {
    pub fn new(
        sites: &'a SiteMatrix,
        conformity: &'a NamespaceConformityTable,
        fetcher: &'a BatchFetcher,
    ) -> Self {
        Self {
            sites,
            conformity,
            fetcher,
        }
    }

    /// Move-log events of the last `hours`, old enough to be settled, from
    /// non-talk namespaces, one per source title.
    pub fn recent_moves<G>(
        &self,
        gateway: &mut G,
        site: &SiteInfo,
        options: &MoveScanOptions,
        now: DateTime<Utc>,
    ) -> FetchResult<Vec<MoveEvent>>
    where
        G: RemoteGateway + ?Sized,
    {
        self.fetcher.cancel_token().check()?;
        let query = MoveLogQuery {
            title: None,
            namespace: options.namespace,
            since: Some(now - Duration::hours(i64::from(options.hours))),
            limit: options.limit,
        };
        let border = now - Duration::minutes(options.move_wait_minutes);
        let mut seen = BTreeSet::new();
        let events: Vec<MoveEvent> = gateway
            .move_log(site, &query)?
            .into_iter()
            .filter(|event| event.timestamp <= border)
            .filter(|event| event.namespace.is_none_or(|namespace| namespace.rem_euclid(2) == 0))
            .filter(|event| seen.insert(event.title.clone()))
            .collect();
        tracing::info!(code = %site.language, events = events.len(), "found settled page moves");
        Ok(events)
    }

    pub fn process_portion<C>(
        &self,
        client: &mut C,
        code: &str,
        events: &[MoveEvent],
    ) -> FetchResult<MoveReport>
    where
        C: RemoteGateway + LinkageStore + ?Sized,
    {
        let seeds: Vec<ChainSeed> = events.iter().map(ChainSeed::from_move).collect();
        self.process_seeds(client, code, &seeds)
    }

    /// Walks every seed that owns a linkage record to its current title and
    /// retargets the record there.
    pub fn process_seeds<C>(
        &self,
        client: &mut C,
        code: &str,
        candidates: &[ChainSeed],
    ) -> FetchResult<MoveReport>
    where
        C: RemoteGateway + LinkageStore + ?Sized,
    {
        let requests_before = client.request_count();
        let mut report = MoveReport {
            language: code.to_string(),
            events: candidates.len(),
            ..MoveReport::default()
        };
        let (Some(site), Some(site_key)) = (self.sites.site(code), self.sites.site_key(code))
        else {
            tracing::warn!(code, "language has no site in this project");
            return Ok(report);
        };
        if let Some(first) = candidates.first() {
            tracing::info!(code, first = %first.title, pages = candidates.len(), "processing moved pages");
        }

        let sources: Vec<String> = candidates.iter().map(|seed| seed.title.clone()).collect();
        let source_records = self.record_ids(client, code, site_key, &sources)?;
        let seeds: Vec<ChainSeed> = candidates
            .iter()
            .filter(|seed| source_records.contains_key(&seed.title))
            .cloned()
            .collect();
        report.with_records = seeds.len();
        tracing::info!(code, pages = seeds.len(), "old pages with linkage records");
        if seeds.is_empty() {
            report.requests = client.request_count().saturating_sub(requests_before);
            return Ok(report);
        }

        let walker = RedirectChainWalker::new(site, self.conformity, self.fetcher);
        let chains = walker.resolve(client, &seeds)?;
        let accepted = walker.accepted(&chains);
        let finals: Vec<String> = accepted
            .iter()
            .map(|chain| chain.final_title().to_string())
            .collect();
        let target_records = self.record_ids(client, code, site_key, &finals)?;

        for chain in accepted {
            let old_title = chain.seed_title();
            let new_title = chain.final_title();
            if let Some(existing) = target_records.get(new_title) {
                let message = format!(
                    "Target {code}:{new_title} of {code}:{old_title} already has linkage record {existing}"
                );
                tracing::debug!("{message}");
                report.skipped.push(message);
                continue;
            }
            let Some(record_id) = source_records.get(old_title) else {
                continue;
            };
            report.accepted += 1;

            let replaced = [Replacement {
                language: code.to_string(),
                old_title: old_title.to_string(),
                new_title: new_title.to_string(),
            }];
            let write = LinkageWrite {
                record_id: Some(record_id.clone()),
                links: vec![(site_key.to_string(), new_title.to_string())],
                summary: update_summary(self.sites, &[], &replaced),
            };
            self.fetcher.cancel_token().check()?;
            match client.write_linkage(&write) {
                Ok(record_id) => {
                    tracing::info!(
                        target: ACTION_TARGET,
                        record = %record_id,
                        "{}",
                        update_log_line(self.sites, &[], &replaced)
                    );
                    report.retargeted.push(CommitEntry {
                        record_id,
                        seed: format!("{code}:{old_title}"),
                        summary: write.summary,
                    });
                }
                Err(error) => {
                    let message =
                        format!("Problem when retargeting {code}:{old_title} to {new_title}: {error}");
                    tracing::error!(target: ACTION_TARGET, "{message}");
                    report.write_errors.push(message);
                }
            }
        }

        report.requests = client.request_count().saturating_sub(requests_before);
        Ok(report)
    }

    /// Linkage record id per title, for titles that have one.
    fn record_ids<G>(
        &self,
        gateway: &mut G,
        code: &str,
        site_key: &str,
        titles: &[String],
    ) -> FetchResult<BTreeMap<String, String>>
    where
        G: RemoteGateway + ?Sized,
    {
        let mut ids = BTreeMap::new();
        if titles.is_empty() {
            return Ok(ids);
        }
        for link_group in self
            .fetcher
            .fetch(code, "cross-reference links", titles, |batch| {
                gateway.cross_reference_links(site_key, batch)
            })?
            .into_iter()
            .flatten()
        {
            if let Some(title) = link_group.links.get(site_key) {
                ids.entry(title.clone()).or_insert(link_group.record_id);
            }
        }
        Ok(ids)
    }
}
