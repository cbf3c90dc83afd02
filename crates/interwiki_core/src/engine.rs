use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::batch::BatchFetcher;
use crate::conformity::NamespaceConformityTable;
use crate::error::{FetchError, FetchResult};
use crate::gateway::{LinkGroup, LinkageStore, LinkageWrite, PageRecord, RemoteGateway};
use crate::logging::{ACTION_TARGET, CONFLICT_TARGET};
use crate::resolver::TitleResolver;
use crate::sites::SiteMatrix;
use crate::summary::{
    additions, creation_log_line, creation_summary, reorder_links, replacements, update_log_line,
    update_summary,
};

pub const ITERATION_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Unchecked,
    TitleResolved,
    CrossRefChecked,
    Converged,
    Excluded,
}

/// Candidate page of one language inside a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterwikiItem {
    pub language: String,
    pub title: String,
    pub is_redirect: bool,
    pub redirect_target: Option<String>,
    pub is_section_link: bool,
    pub is_excluded: bool,
    pub title_resolved: bool,
    pub cross_ref_checked: bool,
    pub local_links_checked: bool,
    pub matches_store_record: bool,
    pub record: Option<PageRecord>,
}

impl InterwikiItem {
    pub fn new(language: &str, title: &str) -> Self {
        Self {
            language: language.to_string(),
            title: title.to_string(),
            ..Self::default()
        }
    }

    /// Neither a redirect, excluded, nor a link to a section.
    pub fn is_live(&self) -> bool {
        !self.is_redirect && !self.is_excluded && !self.is_section_link
    }

    pub fn is_pending(&self) -> bool {
        self.is_live()
            && !(self.title_resolved && self.cross_ref_checked && self.local_links_checked)
    }

    pub fn state(&self) -> ItemState {
        if !self.is_live() {
            ItemState::Excluded
        } else if self.title_resolved && self.cross_ref_checked && self.local_links_checked {
            ItemState::Converged
        } else if self.title_resolved && self.cross_ref_checked {
            ItemState::CrossRefChecked
        } else if self.title_resolved {
            ItemState::TitleResolved
        } else {
            ItemState::Unchecked
        }
    }

    fn namespace(&self) -> Option<i32> {
        self.record.as_ref().and_then(|record| record.namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Conflict,
    Update,
    Create,
    Ignore,
}

/// Multilingual group grown from a single seed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    /// Discovery order; the first item is the seed.
    pub items: Vec<InterwikiItem>,
    pub is_on_store: bool,
    pub store_record_id: Option<String>,
    /// Links of the stored record, by language.
    pub store_links: BTreeMap<String, String>,
    pub has_conflict: bool,
    pub conflict_description: Option<String>,
}

impl Group {
    pub fn seeded(language: &str, title: &str) -> Self {
        Self {
            items: vec![InterwikiItem::new(language, title)],
            is_on_store: false,
            store_record_id: None,
            store_links: BTreeMap::new(),
            has_conflict: false,
            conflict_description: None,
        }
    }

    pub fn seed(&self) -> &InterwikiItem {
        &self.items[0]
    }

    pub fn seed_label(&self) -> String {
        let seed = self.seed();
        format!("{}:{}", seed.language, seed.title)
    }

    pub fn contains(&self, language: &str, title: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.language == language && item.title == title)
    }

    fn push_if_absent(&mut self, item: InterwikiItem) {
        if !self.contains(&item.language, &item.title) {
            self.items.push(item);
        }
    }

    /// Keeps the first recorded description.
    pub fn flag_conflict(&mut self, description: String) {
        if !self.has_conflict {
            self.has_conflict = true;
            self.conflict_description = Some(description);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.items.iter().any(InterwikiItem::is_pending)
    }

    /// Live items as `language -> title`; first item wins per language.
    pub fn surviving_links(&self) -> BTreeMap<String, String> {
        let mut links = BTreeMap::new();
        for item in self.items.iter().filter(|item| item.is_live()) {
            links
                .entry(item.language.clone())
                .or_insert_with(|| item.title.clone());
        }
        links
    }

    pub fn classification(&self) -> Classification {
        if self.has_conflict {
            Classification::Conflict
        } else if self.is_on_store {
            Classification::Update
        } else if self.items.len() > 1 {
            Classification::Create
        } else {
            Classification::Ignore
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Also work on seeds that already have a linkage record.
    pub full_check: bool,
    /// Compute creations but never write them.
    pub only_update: bool,
    pub min_linkage_size: usize,
    pub language_order: Vec<String>,
    pub iteration_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            full_check: false,
            only_update: false,
            min_linkage_size: 2,
            language_order: Vec::new(),
            iteration_limit: ITERATION_LIMIT,
        }
    }
}

/// Terminal groups of one portion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Convergence {
    pub groups: Vec<Group>,
    pub iterations: usize,
    pub dropped_on_store: usize,
    pub dropped_unlinked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitEntry {
    pub record_id: String,
    pub seed: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortionReport {
    pub language: String,
    pub seeds: usize,
    pub iterations: usize,
    pub dropped_on_store: usize,
    pub dropped_unlinked: usize,
    pub created: Vec<CommitEntry>,
    pub updated: Vec<CommitEntry>,
    pub proposed_creations: usize,
    pub skipped: Vec<String>,
    pub conflicts: Vec<String>,
    pub write_errors: Vec<String>,
    pub requests: usize,
}

pub struct ConvergenceEngine<'a> {
    sites: &'a SiteMatrix,
    conformity: &'a NamespaceConformityTable,
    fetcher: &'a BatchFetcher,
    options: EngineOptions,
}

impl<'a> ConvergenceEngine<'a> {
    pub fn new(
        sites: &'a SiteMatrix,
        conformity: &'a NamespaceConformityTable,
        fetcher: &'a BatchFetcher,
        options: EngineOptions,
    ) -> Self {
        Self {
            sites,
            conformity,
            fetcher,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Converges and commits one portion of seed titles of language `code`.
    pub fn run_portion<C>(
        &self,
        client: &mut C,
        code: &str,
        seeds: &[String],
    ) -> FetchResult<PortionReport>
    where
        C: RemoteGateway + LinkageStore + ?Sized,
    {
        let requests_before = client.request_count();
        let convergence = self.converge(client, code, seeds)?;
        let mut report = self.commit(client, code, &convergence)?;
        report.seeds = seeds.len();
        report.requests = client.request_count().saturating_sub(requests_before);
        Ok(report)
    }

    pub fn converge<G>(
        &self,
        gateway: &mut G,
        code: &str,
        seeds: &[String],
    ) -> FetchResult<Convergence>
    where
        G: RemoteGateway + ?Sized,
    {
        let mut seen = BTreeSet::new();
        let mut groups: Vec<Group> = seeds
            .iter()
            .filter(|title| seen.insert(title.as_str()))
            .map(|title| Group::seeded(code, title))
            .collect();
        let mut convergence = Convergence::default();
        if groups.is_empty() {
            return Ok(convergence);
        }

        tracing::info!(
            code,
            titles = groups.len(),
            first = %groups[0].seed().title,
            "iteration 0: checking seed titles"
        );
        self.resolve_step(gateway, &mut groups, code)?;
        self.cross_reference_step(gateway, &mut groups, code)?;
        for group in groups.iter().filter(|group| group.is_on_store) {
            tracing::debug!(
                seed = %group.seed_label(),
                record = group.store_record_id.as_deref().unwrap_or_default(),
                "seed already has a linkage record"
            );
        }
        if !self.options.full_check {
            let before = groups.len();
            groups.retain(|group| !group.is_on_store);
            convergence.dropped_on_store = before - groups.len();
        }

        self.local_links_step(gateway, &mut groups, code)?;
        let before = groups.len();
        groups.retain(|group| {
            let linked = group.items.iter().any(|item| item.language != code);
            if !linked {
                tracing::debug!(seed = %group.seed_label(), "seed has no foreign links");
            }
            linked
        });
        convergence.dropped_unlinked = before - groups.len();
        if groups.is_empty() {
            tracing::info!(code, "nothing to check");
            return Ok(convergence);
        }
        tracing::info!(code, groups = groups.len(), "groups to check");

        let limit = self.options.iteration_limit.max(2);
        for iteration in 1..limit {
            let Some((primary, titles)) = primary_code(&groups) else {
                break;
            };
            convergence.iterations = iteration;
            tracing::info!(
                iteration,
                code = %primary,
                titles = titles.len(),
                "checking pending titles"
            );

            self.resolve_step(gateway, &mut groups, &primary)?;
            self.cross_reference_step(gateway, &mut groups, &primary)?;
            self.local_links_step(gateway, &mut groups, &primary)?;
            check_conflicts(&mut groups);
            self.check_namespaces(&mut groups, &primary);

            if iteration + 1 >= limit {
                for group in groups.iter_mut().filter(|group| !group.has_conflict) {
                    let looped = group
                        .items
                        .iter()
                        .find(|item| item.language == primary && item.is_pending())
                        .map(|item| item.title.clone());
                    if let Some(title) = looped {
                        let description = format!(
                            "Too many iterations. Started on {}. Looped on {primary}:{title}",
                            group.seed_label()
                        );
                        group.flag_conflict(description);
                    }
                }
            }
        }

        for group in groups
            .iter_mut()
            .filter(|group| !group.has_conflict && group.has_pending())
        {
            let description = format!(
                "Too many iterations. Started on {}. Items remain unchecked",
                group.seed_label()
            );
            group.flag_conflict(description);
        }

        check_shared_records(&mut groups);
        drop_duplicate_creations(&mut groups);
        convergence.groups = groups;
        Ok(convergence)
    }

    fn resolve_step<G>(&self, gateway: &mut G, groups: &mut [Group], code: &str) -> FetchResult<()>
    where
        G: RemoteGateway + ?Sized,
    {
        let titles = collect_titles(groups, code, |item| item.is_live() && !item.title_resolved);
        if titles.is_empty() {
            return Ok(());
        }
        let Some(site) = self.sites.site(code) else {
            exclude_unknown_language(groups, code);
            return Ok(());
        };
        let resolved = TitleResolver::new(self.fetcher).resolve(gateway, site, &titles)?;
        let requested: BTreeSet<&str> = titles.iter().map(String::as_str).collect();

        for group in groups.iter_mut().filter(|group| !group.has_conflict) {
            let mut targets = Vec::new();
            for item in group.items.iter_mut().filter(|item| {
                item.language == code
                    && item.is_live()
                    && !item.title_resolved
                    && requested.contains(item.title.as_str())
            }) {
                let Some(record) = resolved.get(&item.title) else {
                    continue;
                };
                item.title_resolved = true;
                item.is_excluded = record.is_missing;
                item.record = Some(record.clone());
                if let Some(target) = record.forward_target() {
                    item.is_redirect = true;
                    item.redirect_target = Some(
                        record
                            .redirect_display()
                            .unwrap_or_else(|| target.to_string()),
                    );
                    targets.push(target.to_string());
                }
            }

            for target in targets {
                if group.contains(code, &target) {
                    continue;
                }
                let mut item = InterwikiItem::new(code, &target);
                match resolved.get(&target) {
                    Some(record) if record.forward_target().is_some() => {
                        // Chained further; resolved on a later pass.
                    }
                    Some(record) => {
                        item.title_resolved = true;
                        item.is_excluded = record.is_missing;
                        item.record = Some(record.clone());
                    }
                    None => {
                        item.title_resolved = true;
                        item.is_excluded = true;
                    }
                }
                group.items.push(item);
            }
        }
        Ok(())
    }

    fn cross_reference_step<G>(
        &self,
        gateway: &mut G,
        groups: &mut [Group],
        code: &str,
    ) -> FetchResult<()>
    where
        G: RemoteGateway + ?Sized,
    {
        let titles = collect_titles(groups, code, |item| {
            item.is_live() && item.title_resolved && !item.cross_ref_checked
        });
        if titles.is_empty() {
            return Ok(());
        }
        let Some(site_key) = self.sites.site_key(code) else {
            exclude_unknown_language(groups, code);
            return Ok(());
        };
        let link_groups: Vec<LinkGroup> = self
            .fetcher
            .fetch(code, "cross-reference links", &titles, |batch| {
                gateway.cross_reference_links(site_key, batch)
            })?
            .into_iter()
            .flatten()
            .collect();

        let requested: BTreeSet<&str> = titles.iter().map(String::as_str).collect();
        for item in groups
            .iter_mut()
            .flat_map(|group| group.items.iter_mut())
            .filter(|item| item.language == code && requested.contains(item.title.as_str()))
        {
            item.cross_ref_checked = true;
        }

        for link_group in link_groups {
            let links = self.sites.to_language_links(&link_group.links);
            let Some(anchor) = links.get(code) else {
                continue;
            };
            for group in groups
                .iter_mut()
                .filter(|group| !group.has_conflict && group.contains(code, anchor))
            {
                if let Some(existing) = group.store_record_id.as_deref()
                    && existing != link_group.record_id
                {
                    let description = format!(
                        "Conflict. Starting from: {}. Found items on Wikidata: {} and {}",
                        group.seed_label(),
                        existing,
                        link_group.record_id
                    );
                    group.flag_conflict(description);
                    continue;
                }
                group.is_on_store = true;
                group.store_record_id = Some(link_group.record_id.clone());
                group.store_links = links.clone();
                for (language, title) in &links {
                    group.push_if_absent(InterwikiItem::new(language, title));
                }
                for item in group.items.iter_mut() {
                    if links.get(&item.language) == Some(&item.title) {
                        item.cross_ref_checked = true;
                        item.matches_store_record = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn local_links_step<G>(
        &self,
        gateway: &mut G,
        groups: &mut [Group],
        code: &str,
    ) -> FetchResult<()>
    where
        G: RemoteGateway + ?Sized,
    {
        let titles = collect_titles(groups, code, |item| {
            item.is_live() && item.title_resolved && !item.local_links_checked
        });
        if titles.is_empty() {
            return Ok(());
        }
        let Some(site) = self.sites.site(code) else {
            exclude_unknown_language(groups, code);
            return Ok(());
        };
        let mut links_by_title: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for batch in self
            .fetcher
            .fetch(code, "local language links", &titles, |batch| {
                gateway.local_language_links(site, batch)
            })?
        {
            links_by_title.extend(batch);
        }

        let prefix = match self.sites.short_prefix() {
            "" => None,
            prefix => Some(format!("{prefix}:")),
        };
        let requested: BTreeSet<&str> = titles.iter().map(String::as_str).collect();

        for group in groups.iter_mut().filter(|group| !group.has_conflict) {
            let mut discovered = Vec::new();
            for item in group.items.iter_mut().filter(|item| {
                item.language == code
                    && item.is_live()
                    && requested.contains(item.title.as_str())
            }) {
                item.local_links_checked = true;
                if let Some(links) = links_by_title.get(&item.title) {
                    discovered.extend(links.iter().map(|(language, title)| {
                        let title = match &prefix {
                            Some(prefix) => title.strip_prefix(prefix.as_str()).unwrap_or(title),
                            None => title.as_str(),
                        };
                        (language.clone(), title.to_string())
                    }));
                }
            }

            for (language, title) in discovered {
                if !self.sites.contains_language(&language) {
                    continue;
                }
                if group.contains(&language, &title) {
                    continue;
                }
                let mut item = InterwikiItem::new(&language, &title);
                item.is_section_link = title.contains('#');
                group.items.push(item);
            }
        }
        Ok(())
    }

    fn check_namespaces(&self, groups: &mut [Group], code: &str) {
        for group in groups.iter_mut().filter(|group| !group.has_conflict) {
            let seed = group.seed();
            let Some(seed_namespace) = seed.namespace() else {
                continue;
            };
            let seed_language = seed.language.clone();
            let seed_on_store = seed.matches_store_record;

            let mut contradiction = false;
            for item in group
                .items
                .iter_mut()
                .filter(|item| item.language == code && item.title_resolved)
            {
                let compatible = item.namespace().is_some_and(|namespace| {
                    self.conformity.is_compatible(
                        &item.language,
                        namespace,
                        &seed_language,
                        seed_namespace,
                    )
                });
                if compatible {
                    continue;
                }
                item.is_excluded = true;
                if !seed_on_store && item.matches_store_record && item.namespace().is_some() {
                    contradiction = true;
                }
            }

            if contradiction {
                let description = format!(
                    "Conflict. Namespace of page {} does not correspond to Wikidata item {}",
                    group.seed_label(),
                    group.store_record_id.as_deref().unwrap_or_default()
                );
                group.flag_conflict(description);
            }
        }
    }

    /// Classifies terminal groups and writes creations and updates.
    pub fn commit<S>(
        &self,
        store: &mut S,
        code: &str,
        convergence: &Convergence,
    ) -> FetchResult<PortionReport>
    where
        S: LinkageStore + ?Sized,
    {
        let mut report = PortionReport {
            language: code.to_string(),
            iterations: convergence.iterations,
            dropped_on_store: convergence.dropped_on_store,
            dropped_unlinked: convergence.dropped_unlinked,
            ..PortionReport::default()
        };

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for group in &convergence.groups {
            match group.classification() {
                Classification::Conflict => {
                    let description = group
                        .conflict_description
                        .clone()
                        .unwrap_or_else(|| format!("Conflict. Starting from: {}", group.seed_label()));
                    tracing::warn!(target: CONFLICT_TARGET, "{description}");
                    report.conflicts.push(description);
                }
                Classification::Update => updates.push(group),
                Classification::Create => creates.push(group),
                Classification::Ignore => {}
            }
        }
        let may_create = !self.options.only_update && self.sites.allows_creation();
        if !creates.is_empty() {
            tracing::info!(code, count = creates.len(), "proposed creations");
            if !may_create {
                tracing::info!(code, project = self.sites.project(), "creation prohibited");
            }
        }
        if !updates.is_empty() {
            tracing::info!(code, count = updates.len(), "proposed updates");
        }
        if !report.conflicts.is_empty() {
            tracing::info!(code, count = report.conflicts.len(), "conflicts");
        }

        for group in creates {
            if !may_create {
                report.proposed_creations += 1;
                continue;
            }
            self.create(store, group, &mut report)?;
        }
        for group in updates {
            self.update(store, group, &mut report)?;
        }
        Ok(report)
    }

    fn create<S>(&self, store: &mut S, group: &Group, report: &mut PortionReport) -> FetchResult<()>
    where
        S: LinkageStore + ?Sized,
    {
        let links = group.surviving_links();
        if links.len() < self.options.min_linkage_size.max(1) {
            let message = format!(
                "Page {} has not sufficient number of interwikis. Skipping",
                group.seed_label()
            );
            tracing::info!("{message}");
            report.skipped.push(message);
            return Ok(());
        }
        let ordered = reorder_links(&links, &self.options.language_order);
        let write = LinkageWrite {
            record_id: None,
            links: self.sites.to_site_keys(&ordered),
            summary: creation_summary(self.sites, &ordered),
        };
        let log_line = creation_log_line(self.sites, &ordered);
        self.write(store, group, write, log_line, report, true)
    }

    fn update<S>(&self, store: &mut S, group: &Group, report: &mut PortionReport) -> FetchResult<()>
    where
        S: LinkageStore + ?Sized,
    {
        let live: Vec<&InterwikiItem> = group.items.iter().filter(|item| item.is_live()).collect();
        if live.iter().all(|item| item.matches_store_record) {
            let message = format!(
                "Page {} has no additional interwikis. Skipping",
                group.seed_label()
            );
            tracing::debug!("{message}");
            report.skipped.push(message);
            return Ok(());
        }
        let ordered = reorder_links(&group.surviving_links(), &self.options.language_order);
        let added = additions(&group.store_links, &ordered);
        let replaced = replacements(&group.store_links, &ordered);
        if added.is_empty() && replaced.is_empty() {
            report
                .skipped
                .push(format!("Page {} needs no record change", group.seed_label()));
            return Ok(());
        }

        let changed: Vec<(String, String)> = ordered
            .iter()
            .filter(|(language, title)| group.store_links.get(language) != Some(title))
            .cloned()
            .collect();
        let write = LinkageWrite {
            record_id: group.store_record_id.clone(),
            links: self.sites.to_site_keys(&changed),
            summary: update_summary(self.sites, &added, &replaced),
        };
        let log_line = update_log_line(self.sites, &added, &replaced);
        self.write(store, group, write, log_line, report, false)
    }

    fn write<S>(
        &self,
        store: &mut S,
        group: &Group,
        write: LinkageWrite,
        log_line: String,
        report: &mut PortionReport,
        is_creation: bool,
    ) -> FetchResult<()>
    where
        S: LinkageStore + ?Sized,
    {
        self.fetcher.cancel_token().check()?;
        match store.write_linkage(&write) {
            Ok(record_id) => {
                tracing::info!(target: ACTION_TARGET, record = %record_id, "{log_line}");
                let entry = CommitEntry {
                    record_id,
                    seed: group.seed_label(),
                    summary: write.summary,
                };
                if is_creation {
                    report.created.push(entry);
                } else {
                    report.updated.push(entry);
                }
            }
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(error) => {
                let action = if is_creation { "creation" } else { "update" };
                let message = format!("Problem with {action} for {}: {error}", group.seed_label());
                tracing::error!(target: ACTION_TARGET, "{message}");
                report.write_errors.push(message);
            }
        }
        Ok(())
    }
}

/// Language with the most pending items; ties go to the first code in sort order.
fn primary_code(groups: &[Group]) -> Option<(String, BTreeSet<String>)> {
    let mut pending: BTreeMap<&str, (usize, BTreeSet<String>)> = BTreeMap::new();
    for item in groups
        .iter()
        .filter(|group| !group.has_conflict)
        .flat_map(|group| group.items.iter())
        .filter(|item| item.is_pending())
    {
        let entry = pending.entry(item.language.as_str()).or_default();
        entry.0 += 1;
        entry.1.insert(item.title.clone());
    }

    let mut best: Option<(&str, usize)> = None;
    for (&code, (count, _)) in &pending {
        if best.is_none_or(|(_, best_count)| *count > best_count) {
            best = Some((code, *count));
        }
    }
    let (code, _) = best?;
    let titles = pending.remove(code).map(|(_, titles)| titles)?;
    Some((code.to_string(), titles))
}

/// Distinct titles of `code` across non-conflicted groups, in discovery order.
fn collect_titles<F>(groups: &[Group], code: &str, wanted: F) -> Vec<String>
where
    F: Fn(&InterwikiItem) -> bool,
{
    let mut seen = BTreeSet::new();
    groups
        .iter()
        .filter(|group| !group.has_conflict)
        .flat_map(|group| group.items.iter())
        .filter(|item| item.language == code && wanted(item))
        .filter(|item| seen.insert(item.title.clone()))
        .map(|item| item.title.clone())
        .collect()
}

fn exclude_unknown_language(groups: &mut [Group], code: &str) {
    tracing::warn!(code, "language has no site in this project, excluding its items");
    for item in groups
        .iter_mut()
        .flat_map(|group| group.items.iter_mut())
        .filter(|item| item.language == code)
    {
        item.is_excluded = true;
    }
}

/// A language with more than one live, resolved title marks the group conflicted.
fn check_conflicts(groups: &mut [Group]) {
    for group in groups.iter_mut().filter(|group| !group.has_conflict) {
        let mut by_language: Vec<(&str, Vec<&str>)> = Vec::new();
        for item in group
            .items
            .iter()
            .filter(|item| item.is_live() && item.title_resolved)
        {
            match by_language
                .iter()
                .position(|(language, _)| *language == item.language)
            {
                Some(index) => by_language[index].1.push(item.title.as_str()),
                None => by_language.push((item.language.as_str(), vec![item.title.as_str()])),
            }
        }
        let mut largest: Option<&(&str, Vec<&str>)> = None;
        for entry in &by_language {
            if largest.is_none_or(|current| entry.1.len() > current.1.len()) {
                largest = Some(entry);
            }
        }
        let Some((language, titles)) = largest else {
            continue;
        };
        if titles.len() <= 1 {
            continue;
        }
        let description = format!(
            "Conflict. Starting from: {}. Found different local pages: {language}:{} and {language}:{}",
            group.seed_label(),
            titles[0],
            titles[1]
        );
        group.flag_conflict(description);
    }
}

/// Groups claiming the same stored record must agree on its members.
fn check_shared_records(groups: &mut [Group]) {
    let mut by_record: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, group) in groups.iter().enumerate() {
        if let Some(record_id) = &group.store_record_id {
            by_record.entry(record_id.clone()).or_default().push(index);
        }
    }
    for (record_id, indices) in by_record {
        if indices.len() < 2 {
            continue;
        }
        let first_links = groups[indices[0]].surviving_links();
        let agree = indices.iter().all(|&index| {
            !groups[index].has_conflict && groups[index].surviving_links() == first_links
        });
        if agree {
            continue;
        }
        let claimants: Vec<String> = indices
            .iter()
            .map(|&index| groups[index].seed_label())
            .collect();
        for &index in &indices {
            let description = format!(
                "Conflict. Starting from: {}. Wikidata item {record_id} is claimed with different pages by {}",
                groups[index].seed_label(),
                claimants.join(", ")
            );
            groups[index].flag_conflict(description);
        }
    }
}

/// Seeds that converged onto identical memberships write only once.
fn drop_duplicate_creations(groups: &mut Vec<Group>) {
    let mut seen: BTreeSet<BTreeMap<String, String>> = BTreeSet::new();
    let mut seen_records: BTreeSet<String> = BTreeSet::new();
    groups.retain(|group| match group.classification() {
        Classification::Create => seen.insert(group.surviving_links()),
        Classification::Update => group
            .store_record_id
            .as_ref()
            .is_none_or(|record_id| seen_records.insert(record_id.clone())),
        Classification::Conflict | Classification::Ignore => true,
    });
}

#[cfg(test)]
mod tests {
    use super::{
        Classification, ConvergenceEngine, EngineOptions, Group, InterwikiItem, ItemState,
    };
    use crate::batch::BatchFetcher;
    use crate::conformity::NamespaceConformityTable;
    use crate::error::FetchError;
    use crate::mock::{MockWiki, site_matrix};
    use crate::sites::{SiteMatrix, entry};

    fn seeds(titles: &[&str]) -> Vec<String> {
        titles.iter().map(|title| (*title).to_string()).collect()
    }

    fn full_check() -> EngineOptions {
        EngineOptions {
            full_check: true,
            ..EngineOptions::default()
        }
    }

    struct Fixture {
        sites: SiteMatrix,
        conformity: NamespaceConformityTable,
        fetcher: BatchFetcher,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_sites(site_matrix())
        }

        fn with_sites(sites: SiteMatrix) -> Self {
            Self {
                sites,
                conformity: NamespaceConformityTable::parse("14|14\n4|104"),
                fetcher: BatchFetcher::default(),
            }
        }

        fn engine(&self, options: EngineOptions) -> ConvergenceEngine<'_> {
            ConvergenceEngine::new(&self.sites, &self.conformity, &self.fetcher, options)
        }
    }

    fn titles_of(group: &Group) -> Vec<String> {
        group
            .items
            .iter()
            .filter(|item| item.is_live())
            .map(|item| format!("{}:{}", item.language, item.title))
            .collect()
    }

    #[test]
    fn item_state_follows_checks() {
        let mut item = InterwikiItem::new("en", "Dog");
        assert_eq!(item.state(), ItemState::Unchecked);
        item.title_resolved = true;
        assert_eq!(item.state(), ItemState::TitleResolved);
        item.cross_ref_checked = true;
        assert_eq!(item.state(), ItemState::CrossRefChecked);
        item.local_links_checked = true;
        assert_eq!(item.state(), ItemState::Converged);
        assert!(!item.is_pending());
        item.is_redirect = true;
        assert_eq!(item.state(), ItemState::Excluded);
    }

    #[test]
    fn scenario_a_creates_new_record() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("en", "Dog")]);
        let fixture = Fixture::new();
        let report = fixture
            .engine(EngineOptions::default())
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("portion");

        assert_eq!(report.created.len(), 1);
        assert!(report.conflicts.is_empty());
        let write = &wiki.writes()[0];
        assert_eq!(write.record_id, None);
        assert_eq!(
            write.links,
            vec![
                ("enwiki".to_string(), "Dog".to_string()),
                ("frwiki".to_string(), "Chien".to_string())
            ]
        );
        assert_eq!(write.summary, "New item: [[en:Dog]], [[fr:Chien]]");
    }

    #[test]
    fn scenario_b_updates_existing_record_with_additions() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .record("Q1", &[("enwiki", "Dog")]);
        let fixture = Fixture::new();
        let report = fixture
            .engine(full_check())
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("portion");

        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.updated[0].record_id, "Q1");
        let write = &wiki.writes()[0];
        assert_eq!(write.record_id.as_deref(), Some("Q1"));
        assert_eq!(write.links, vec![("frwiki".to_string(), "Chien".to_string())]);
        assert_eq!(write.summary, "Added: [[fr:Chien]]");
    }

    #[test]
    fn linked_seeds_are_dropped_without_full_check() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .record("Q1", &[("enwiki", "Dog")]);
        let fixture = Fixture::new();
        let report = fixture
            .engine(EngineOptions::default())
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("portion");
        assert_eq!(report.dropped_on_store, 1);
        assert!(wiki.writes().is_empty());
    }

    #[test]
    fn scenario_c_follows_redirect_to_effective_member() {
        let mut wiki = MockWiki::new();
        wiki.redirect("en", "Dog", "Dogs")
            .page("en", "Dogs", 0)
            .langlinks("en", "Dogs", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("en", "Dogs")]);
        let fixture = Fixture::new();
        let engine = fixture.engine(EngineOptions::default());
        let convergence = engine
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");

        let group = &convergence.groups[0];
        assert!(group.items[0].is_redirect);
        assert_eq!(group.items[0].redirect_target.as_deref(), Some("Dogs"));
        assert_eq!(titles_of(group), vec!["en:Dogs", "fr:Chien"]);
        assert_eq!(group.classification(), Classification::Create);

        let report = engine
            .commit(&mut wiki, "en", &convergence)
            .expect("commit");
        assert_eq!(report.created.len(), 1);
        assert_eq!(
            wiki.writes()[0].links[0],
            ("enwiki".to_string(), "Dogs".to_string())
        );
    }

    #[test]
    fn scenario_d_shared_record_with_different_titles_conflicts_both() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("en", "Hound", 0)
            .langlinks("en", "Hound", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("en", "Dog")])
            .record("Q1", &[("enwiki", "Dog"), ("frwiki", "Chien")]);
        let fixture = Fixture::new();
        let report = fixture
            .engine(full_check())
            .run_portion(&mut wiki, "en", &seeds(&["Dog", "Hound"]))
            .expect("portion");

        assert_eq!(report.conflicts.len(), 2);
        assert!(report.conflicts.iter().any(|line| line.contains("en:Hound")));
        assert!(report.created.is_empty());
        assert!(report.updated.is_empty());
        assert!(wiki.writes().is_empty());
    }

    #[test]
    fn different_records_in_one_group_conflict() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .record("Q1", &[("enwiki", "Dog")])
            .record("Q2", &[("frwiki", "Chien")]);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(full_check())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert!(group.has_conflict);
        assert_eq!(
            group.conflict_description.as_deref(),
            Some("Conflict. Starting from: en:Dog. Found items on Wikidata: Q1 and Q2")
        );
    }

    #[test]
    fn two_local_titles_in_one_language_conflict() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("en", "Domestic dog")])
            .page("en", "Domestic dog", 0);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert_eq!(
            group.conflict_description.as_deref(),
            Some("Conflict. Starting from: en:Dog. Found different local pages: en:Dog and en:Domestic dog")
        );
    }

    #[test]
    fn namespace_mismatch_excludes_item() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Discussion:Chien"), ("de", "Hund")])
            .page("fr", "Discussion:Chien", 1)
            .page("de", "Hund", 0);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert!(!group.has_conflict);
        assert_eq!(titles_of(group), vec!["en:Dog", "de:Hund"]);
    }

    #[test]
    fn stored_item_failing_namespace_check_is_a_conflict() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .page("de", "Benutzer:Hund", 2)
            .record("Q7", &[("frwiki", "Chien"), ("dewiki", "Benutzer:Hund")]);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert!(group.has_conflict);
        assert!(
            group
                .conflict_description
                .as_deref()
                .is_some_and(|text| text.contains("Namespace of page en:Dog"))
        );
    }

    #[test]
    fn section_links_and_unknown_languages_never_join() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks(
                "en",
                "Dog",
                &[("fr", "Chien#Races"), ("xx", "Dogo"), ("de", "Hund")],
            )
            .page("de", "Hund", 0);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert!(group.items.iter().any(|item| item.is_section_link));
        assert!(!group.items.iter().any(|item| item.language == "xx"));
        assert_eq!(titles_of(group), vec!["en:Dog", "de:Hund"]);
    }

    #[test]
    fn seeds_without_foreign_links_are_dropped() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Lonely", 0);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Lonely", "Missing page"]))
            .expect("converge");
        assert!(convergence.groups.is_empty());
        assert_eq!(convergence.dropped_unlinked, 2);
    }

    #[test]
    fn converged_groups_leave_no_pending_items() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "chien"), ("de", "Hund")])
            .redirect("fr", "Chien", "Chien domestique")
            .page("fr", "Chien domestique", 0)
            .langlinks("fr", "Chien domestique", &[("it", "Cane"), ("es", "Perro")])
            .page("de", "Hund", 0)
            .langlinks("de", "Hund", &[("en", "Dog")])
            .page("it", "Cane", 0)
            .page("en", "Cat", 0)
            .langlinks("en", "Cat", &[("de", "Katze")])
            .page("de", "Katze", 0)
            .record("Q5", &[("dewiki", "Katze")]);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(full_check())
            .converge(&mut wiki, "en", &seeds(&["Dog", "Cat"]))
            .expect("converge");

        for group in convergence.groups.iter().filter(|group| !group.has_conflict) {
            assert!(group.items.iter().all(|item| matches!(
                item.state(),
                ItemState::Converged | ItemState::Excluded
            )));
        }
        let dog = &convergence.groups[0];
        assert_eq!(
            titles_of(dog),
            vec!["en:Dog", "de:Hund", "fr:Chien domestique", "it:Cane"]
        );
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien"), ("de", "Hund"), ("it", "Cane")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("es", "Perro")])
            .page("de", "Hund", 0)
            .page("it", "Cane", 0)
            .page("es", "Perro", 0)
            .page("en", "Cat", 0)
            .langlinks("en", "Cat", &[("de", "Katze")])
            .page("de", "Katze", 0);
        let fixture = Fixture::new();
        let engine = fixture.engine(EngineOptions::default());

        let mut first_wiki = wiki.clone();
        let mut second_wiki = wiki.clone();
        let first = engine
            .converge(&mut first_wiki, "en", &seeds(&["Dog", "Cat"]))
            .expect("first");
        let second = engine
            .converge(&mut second_wiki, "en", &seeds(&["Dog", "Cat"]))
            .expect("second");
        assert_eq!(first, second);
        assert_eq!(first_wiki.request_log(), second_wiki.request_log());
    }

    #[test]
    fn iteration_limit_flags_unfinished_groups() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .langlinks("fr", "Chien", &[("de", "Hund")])
            .page("de", "Hund", 0)
            .langlinks("de", "Hund", &[("it", "Cane")])
            .page("it", "Cane", 0);
        let fixture = Fixture::new();
        let options = EngineOptions {
            iteration_limit: 2,
            ..EngineOptions::default()
        };
        let convergence = fixture
            .engine(options)
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");
        let group = &convergence.groups[0];
        assert!(group.has_conflict);
        assert!(
            group
                .conflict_description
                .as_deref()
                .is_some_and(|text| text.starts_with("Too many iterations. Started on en:Dog"))
        );
    }

    #[test]
    fn small_groups_are_skipped_and_only_update_blocks_creation() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0);
        let fixture = Fixture::new();

        let strict = EngineOptions {
            min_linkage_size: 3,
            ..EngineOptions::default()
        };
        let report = fixture
            .engine(strict)
            .run_portion(&mut wiki.clone(), "en", &seeds(&["Dog"]))
            .expect("portion");
        assert_eq!(report.skipped.len(), 1);
        assert!(report.created.is_empty());

        let only_update = EngineOptions {
            only_update: true,
            ..EngineOptions::default()
        };
        let report = fixture
            .engine(only_update)
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("portion");
        assert_eq!(report.proposed_creations, 1);
        assert!(wiki.writes().is_empty());
    }

    #[test]
    fn sister_projects_never_create_records() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Paris", 0)
            .langlinks("en", "Paris", &[("fr", "Paris")])
            .page("fr", "Paris", 0)
            .langlinks("fr", "Paris", &[("en", "Paris")]);
        let sites = SiteMatrix::from_entries(
            "wikivoyage",
            &[
                entry("wikivoyage", "en", "enwikivoyage"),
                entry("wikivoyage", "fr", "frwikivoyage"),
            ],
        );
        let fixture = Fixture::with_sites(sites);
        let report = fixture
            .engine(EngineOptions::default())
            .run_portion(&mut wiki, "en", &seeds(&["Paris"]))
            .expect("portion");

        assert!(report.created.is_empty());
        assert_eq!(report.proposed_creations, 1);
        assert!(wiki.writes().is_empty());
    }

    #[test]
    fn sister_projects_still_update_existing_records() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Paris", 0)
            .langlinks("en", "Paris", &[("fr", "Paris")])
            .page("fr", "Paris", 0)
            .record("Q90", &[("enwikivoyage", "Paris")]);
        let sites = SiteMatrix::from_entries(
            "wikivoyage",
            &[
                entry("wikivoyage", "en", "enwikivoyage"),
                entry("wikivoyage", "fr", "frwikivoyage"),
            ],
        );
        let fixture = Fixture::with_sites(sites);
        let report = fixture
            .engine(full_check())
            .run_portion(&mut wiki, "en", &seeds(&["Paris"]))
            .expect("portion");

        assert_eq!(report.updated.len(), 1);
        assert_eq!(
            wiki.writes()[0].links,
            vec![("frwikivoyage".to_string(), "Paris".to_string())]
        );
    }

    #[test]
    fn stored_redirect_is_replaced_by_its_target() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .redirect("fr", "Chien (animal)", "Chien")
            .page("fr", "Chien", 0)
            .record("Q1", &[("enwiki", "Dog"), ("frwiki", "Chien (animal)")]);
        let fixture = Fixture::new();
        let report = fixture
            .engine(full_check())
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("portion");

        assert!(report.conflicts.is_empty());
        assert_eq!(report.updated.len(), 1);
        let write = &wiki.writes()[0];
        assert_eq!(write.record_id.as_deref(), Some("Q1"));
        assert_eq!(write.links, vec![("frwiki".to_string(), "Chien".to_string())]);
        assert_eq!(write.summary, "Updated: [[fr:Chien (animal)]] -> [[fr:Chien]]");
        assert_eq!(
            wiki.record_links("Q1").and_then(|links| links.get("frwiki")),
            Some(&"Chien".to_string())
        );
    }

    #[test]
    fn redirect_loop_inside_a_group_is_absorbed() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "A"), ("de", "Hund")])
            .redirect("fr", "A", "B")
            .redirect("fr", "B", "A")
            .page("de", "Hund", 0)
            .langlinks("de", "Hund", &[("en", "Dog")]);
        let fixture = Fixture::new();
        let convergence = fixture
            .engine(EngineOptions::default())
            .converge(&mut wiki, "en", &seeds(&["Dog"]))
            .expect("converge");

        let group = &convergence.groups[0];
        assert!(!group.has_conflict);
        assert!(!group.has_pending());
        let french: Vec<&str> = group
            .items
            .iter()
            .filter(|item| item.language == "fr")
            .map(|item| item.title.as_str())
            .collect();
        assert_eq!(french, vec!["A", "B"]);
        assert_eq!(titles_of(group), vec!["en:Dog", "de:Hund"]);
        assert!(convergence.iterations < EngineOptions::default().iteration_limit);
    }

    #[test]
    fn write_failures_are_reported_per_group() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0)
            .page("en", "Cat", 0)
            .langlinks("en", "Cat", &[("fr", "Chat")])
            .page("fr", "Chat", 0)
            .fail_writes_for("Chien");
        let fixture = Fixture::new();
        let report = fixture
            .engine(EngineOptions::default())
            .run_portion(&mut wiki, "en", &seeds(&["Dog", "Cat"]))
            .expect("portion");
        assert_eq!(report.write_errors.len(), 1);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].seed, "en:Cat");
    }

    #[test]
    fn cancelled_portion_writes_nothing() {
        let mut wiki = MockWiki::new();
        wiki.page("en", "Dog", 0)
            .langlinks("en", "Dog", &[("fr", "Chien")])
            .page("fr", "Chien", 0);
        let fixture = Fixture::new();
        fixture.fetcher.cancel_token().cancel();
        let error = fixture
            .engine(EngineOptions::default())
            .run_portion(&mut wiki, "en", &seeds(&["Dog"]))
            .expect_err("cancelled");
        assert_eq!(error, FetchError::Cancelled);
        assert!(wiki.writes().is_empty());
    }
}
