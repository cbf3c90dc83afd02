use std::collections::BTreeMap;

use crate::sites::SiteMatrix;

/// One language whose stored title is being replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub language: String,
    pub old_title: String,
    pub new_title: String,
}

/// Preferred languages first, in configured order, then the rest alphabetically.
pub fn reorder_links(
    links: &BTreeMap<String, String>,
    language_order: &[String],
) -> Vec<(String, String)> {
    let mut ordered: Vec<(String, String)> = language_order
        .iter()
        .filter_map(|language| {
            links
                .get(language)
                .map(|title| (language.clone(), title.clone()))
        })
        .collect();
    ordered.extend(
        links
            .iter()
            .filter(|(language, _)| !language_order.contains(language))
            .map(|(language, title)| (language.clone(), title.clone())),
    );
    ordered
}

/// Languages absent from the stored record.
pub fn additions(
    stored: &BTreeMap<String, String>,
    current: &[(String, String)],
) -> Vec<(String, String)> {
    current
        .iter()
        .filter(|(language, _)| !stored.contains_key(language))
        .cloned()
        .collect()
}

/// Languages whose stored title differs from the current one.
pub fn replacements(
    stored: &BTreeMap<String, String>,
    current: &[(String, String)],
) -> Vec<Replacement> {
    current
        .iter()
        .filter_map(|(language, title)| {
            let old_title = stored.get(language)?;
            (old_title != title).then(|| Replacement {
                language: language.clone(),
                old_title: old_title.clone(),
                new_title: title.clone(),
            })
        })
        .collect()
}

fn use_long_form(added: usize, replaced: usize) -> bool {
    let score = added + replaced * 3 + usize::from(added > 0) + usize::from(replaced > 0);
    score <= 6
}

pub fn creation_summary(sites: &SiteMatrix, links: &[(String, String)]) -> String {
    let long = use_long_form(links.len(), 0);
    format!("New item: {}", join_links(sites, links, long))
}

pub fn update_summary(
    sites: &SiteMatrix,
    added: &[(String, String)],
    replaced: &[Replacement],
) -> String {
    render_update(sites, added, replaced, use_long_form(added.len(), replaced.len()))
}

/// Full-length variant for the action log.
pub fn creation_log_line(sites: &SiteMatrix, links: &[(String, String)]) -> String {
    format!("New item: {}", join_links(sites, links, true))
}

pub fn update_log_line(
    sites: &SiteMatrix,
    added: &[(String, String)],
    replaced: &[Replacement],
) -> String {
    render_update(sites, added, replaced, true)
}

fn render_update(
    sites: &SiteMatrix,
    added: &[(String, String)],
    replaced: &[Replacement],
    long: bool,
) -> String {
    let replaced_text = replaced
        .iter()
        .map(|replacement| {
            if long {
                format!(
                    "{} -> {}",
                    sites.wikitext_link(&replacement.language, &replacement.old_title, true),
                    sites.wikitext_link(&replacement.language, &replacement.new_title, true)
                )
            } else {
                sites.wikitext_link(&replacement.language, "", false)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    if added.is_empty() {
        return format!("Updated: {replaced_text}");
    }
    let mut summary = format!("Added: {}", join_links(sites, added, long));
    if !replaced.is_empty() {
        summary.push_str("; updated: ");
        summary.push_str(&replaced_text);
    }
    summary
}

fn join_links(sites: &SiteMatrix, links: &[(String, String)], long: bool) -> String {
    links
        .iter()
        .map(|(language, title)| sites.wikitext_link(language, title, long))
        .collect::<Vec<_>>()
        .join(", ")
}
