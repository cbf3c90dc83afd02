use std::collections::{BTreeMap, HashMap};

use crate::batch::BatchFetcher;
use crate::error::FetchResult;
use crate::gateway::{PageRecord, RemoteGateway, TitleResolution};
use crate::sites::SiteInfo;

/// Resolved records of one resolver call, keyed by the title they describe.
///
/// Contains a record for every requested title plus the plain records of the
/// pages the batch reported (redirect and normalization targets).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTitles {
    records: BTreeMap<String, PageRecord>,
}

impl ResolvedTitles {
    pub fn get(&self, title: &str) -> Option<&PageRecord> {
        self.records.get(title)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn absorb(&mut self, records: Vec<PageRecord>) {
        for record in records {
            self.records.entry(record.title.clone()).or_insert(record);
        }
    }
}

pub struct TitleResolver<'a> {
    fetcher: &'a BatchFetcher,
}

impl<'a> TitleResolver<'a> {
    pub fn new(fetcher: &'a BatchFetcher) -> Self {
        Self { fetcher }
    }

    pub fn resolve<G>(
        &self,
        gateway: &mut G,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<ResolvedTitles>
    where
        G: RemoteGateway + ?Sized,
    {
        let mut resolved = ResolvedTitles::default();
        let batches = self
            .fetcher
            .fetch(&site.language, "resolve titles", titles, |batch| {
                gateway.resolve_titles(site, batch)
            })?;
        for resolution in batches {
            resolved.absorb(cross_match(&resolution));
        }

        let absent: Vec<String> = titles
            .iter()
            .filter(|title| resolved.get(title).is_none())
            .cloned()
            .collect();
        for title in absent {
            tracing::debug!(code = %site.language, %title, "title absent from batch answer, resolving alone");
            let singles = self.fetcher.fetch(
                &site.language,
                "resolve titles",
                std::slice::from_ref(&title),
                |batch| gateway.resolve_titles(site, batch),
            )?;
            for single in singles {
                resolved.absorb(cross_match(&single));
            }
            if resolved.get(&title).is_none() {
                resolved.absorb(vec![PageRecord::plain(&title, None, true)]);
            }
        }
        Ok(resolved)
    }
}

/// Dereferences normalizations and redirects of one answer against its own page
/// facts, so that a `from` title carries the namespace and existence of the page
/// it finally lands on.
pub fn cross_match(resolution: &TitleResolution) -> Vec<PageRecord> {
    let redirects: HashMap<&str, (&str, Option<&str>)> = resolution
        .redirects
        .iter()
        .map(|redirect| {
            (
                redirect.from.as_str(),
                (redirect.to.as_str(), redirect.fragment.as_deref()),
            )
        })
        .collect();
    let pages: HashMap<&str, (Option<i32>, bool)> = resolution
        .pages
        .iter()
        .map(|page| (page.title.as_str(), (page.namespace, page.missing)))
        .collect();

    let landing = |title: &str| -> (Option<i32>, bool) {
        pages.get(title).copied().unwrap_or((None, false))
    };

    let mut records = Vec::new();
    for normalization in &resolution.normalized {
        let mut record = PageRecord {
            title: normalization.from.clone(),
            normalized_title: Some(normalization.to.clone()),
            ..PageRecord::default()
        };
        let mut final_title = normalization.to.as_str();
        if let Some(&(target, fragment)) = redirects.get(final_title) {
            record.redirect_target = Some(target.to_string());
            record.redirect_section = fragment.map(|section| section.trim().to_string());
            final_title = target;
        }
        (record.namespace, record.is_missing) = landing(final_title);
        records.push(record);
    }
    for redirect in &resolution.redirects {
        let (namespace, is_missing) = landing(&redirect.to);
        records.push(PageRecord {
            title: redirect.from.clone(),
            normalized_title: None,
            redirect_target: Some(redirect.to.clone()),
            redirect_section: redirect
                .fragment
                .as_deref()
                .map(|section| section.trim().to_string()),
            namespace,
            is_missing,
        });
    }
    for page in &resolution.pages {
        records.push(PageRecord::plain(&page.title, page.namespace, page.missing));
    }
    records
}
