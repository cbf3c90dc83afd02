use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FetchResult;
use crate::sites::SiteInfo;

pub const NS_MAIN: i32 = 0;
pub const NS_USER: i32 = 2;
pub const NS_CATEGORY: i32 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub from: String,
    pub to: String,
    pub fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFact {
    pub title: String,
    pub namespace: Option<i32>,
    pub missing: bool,
}

/// Raw answer of one title-resolution request, before cross-matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleResolution {
    pub normalized: Vec<Normalization>,
    pub redirects: Vec<Redirect>,
    pub pages: Vec<PageFact>,
}

/// Resolved fact about one title on one site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub title: String,
    pub normalized_title: Option<String>,
    pub redirect_target: Option<String>,
    pub redirect_section: Option<String>,
    pub namespace: Option<i32>,
    pub is_missing: bool,
}

impl PageRecord {
    pub fn plain(title: &str, namespace: Option<i32>, is_missing: bool) -> Self {
        Self {
            title: title.to_string(),
            namespace,
            is_missing,
            ..Self::default()
        }
    }

    /// Title this record points at when it is not canonical itself.
    pub fn forward_target(&self) -> Option<&str> {
        self.redirect_target
            .as_deref()
            .or(self.normalized_title.as_deref())
    }

    /// Redirect target rendered with its `#section` fragment, if any.
    pub fn redirect_display(&self) -> Option<String> {
        let target = self.redirect_target.as_deref()?;
        Some(match self.redirect_section.as_deref() {
            Some(section) if !section.is_empty() => format!("{target}#{section}"),
            _ => target.to_string(),
        })
    }
}

/// One linkage record as stored in the central repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkGroup {
    pub record_id: String,
    /// Site key (`enwiki`) to title.
    pub links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveEvent {
    pub title: String,
    pub namespace: Option<i32>,
    pub target_title: String,
    pub target_namespace: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveLogQuery {
    pub title: Option<String>,
    pub namespace: Option<i32>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl MoveLogQuery {
    pub fn for_title(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            namespace: None,
            since: None,
            limit: 500,
        }
    }
}

/// Source of seed titles for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedQuery {
    AllPages {
        namespace: i32,
        from: String,
        limit: usize,
    },
    /// Redirect pages of a namespace, alphabetically from `from`.
    AllRedirects {
        namespace: i32,
        from: String,
        limit: usize,
    },
    NewPages {
        namespace: i32,
        hours: u32,
        limit: usize,
    },
    /// Members of `category` and, down to `depth` levels, of its subcategories.
    CategoryMembers {
        category: String,
        namespace: i32,
        depth: u32,
        limit: usize,
    },
    /// Pages edited by `user` within the last `hours`.
    UserContributions {
        user: String,
        namespace: i32,
        hours: u32,
        limit: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedPage {
    pub titles: Vec<String>,
    /// Cursor for the next `AllPages`/`AllRedirects` request, when more pages remain.
    pub next_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkageWrite {
    pub record_id: Option<String>,
    /// Site key and title pairs, in the order they should be written.
    pub links: Vec<(String, String)>,
    pub summary: String,
}

pub trait RemoteGateway {
    fn resolve_titles(&mut self, site: &SiteInfo, titles: &[String])
    -> FetchResult<TitleResolution>;
    fn cross_reference_links(
        &mut self,
        site_key: &str,
        titles: &[String],
    ) -> FetchResult<Vec<LinkGroup>>;
    fn local_language_links(
        &mut self,
        site: &SiteInfo,
        titles: &[String],
    ) -> FetchResult<BTreeMap<String, BTreeMap<String, String>>>;
    fn move_log(&mut self, site: &SiteInfo, query: &MoveLogQuery) -> FetchResult<Vec<MoveEvent>>;
    fn list_seeds(&mut self, site: &SiteInfo, query: &SeedQuery) -> FetchResult<SeedPage>;
    fn request_count(&self) -> usize;
}

pub trait LinkageStore {
    fn login(&mut self, username: &str, password: &str) -> FetchResult<()>;
    /// Commits the links and returns the id of the written record.
    fn write_linkage(&mut self, write: &LinkageWrite) -> FetchResult<String>;
}
