use crate::gateway::NS_USER;

/// One configured equivalence; an empty language matches any language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConformityRule {
    pub lang1: String,
    pub ns1: i32,
    pub lang2: String,
    pub ns2: i32,
}

impl ConformityRule {
    fn matches(&self, lang1: &str, ns1: i32, lang2: &str, ns2: i32) -> bool {
        (self.lang1.is_empty() || self.lang1 == lang1)
            && self.ns1 == ns1
            && (self.lang2.is_empty() || self.lang2 == lang2)
            && self.ns2 == ns2
    }
}

/// Namespace equivalences between languages, queried symmetrically and never
/// mutated after loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceConformityTable {
    rules: Vec<ConformityRule>,
}

impl NamespaceConformityTable {
    pub fn new(rules: Vec<ConformityRule>) -> Self {
        Self { rules }
    }

    /// Parses `lang1:ns1|lang2:ns2` lines. `#` starts a comment; lines that do
    /// not match the format are skipped.
    pub fn parse(text: &str) -> Self {
        let rules = text
            .lines()
            .filter_map(|line| {
                let line = line.split('#').next().unwrap_or_default().trim();
                if line.is_empty() {
                    return None;
                }
                let rule = parse_rule(line);
                if rule.is_none() {
                    tracing::debug!(line, "ignoring malformed namespace rule");
                }
                rule
            })
            .collect();
        Self { rules }
    }

    pub fn extend(&mut self, other: NamespaceConformityTable) {
        self.rules.extend(other.rules);
    }

    pub fn rules(&self) -> &[ConformityRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when namespaces are equal or a rule covers the pair in either order.
    pub fn conforms(&self, lang1: &str, ns1: i32, lang2: &str, ns2: i32) -> bool {
        if ns1 == ns2 {
            return true;
        }
        self.rules.iter().any(|rule| {
            rule.matches(lang1, ns1, lang2, ns2) || rule.matches(lang2, ns2, lang1, ns1)
        })
    }

    /// Full linkability test: talk namespaces (odd) and user pages never link.
    pub fn is_compatible(&self, lang1: &str, ns1: i32, lang2: &str, ns2: i32) -> bool {
        if ns1.rem_euclid(2) == 1 || ns2.rem_euclid(2) == 1 {
            return false;
        }
        if ns1 == NS_USER || ns2 == NS_USER {
            return false;
        }
        self.conforms(lang1, ns1, lang2, ns2)
    }
}

fn parse_rule(line: &str) -> Option<ConformityRule> {
    let (left, right) = line.split_once('|')?;
    let (lang1, ns1) = parse_side(left)?;
    let (lang2, ns2) = parse_side(right)?;
    Some(ConformityRule {
        lang1,
        ns1,
        lang2,
        ns2,
    })
}

fn parse_side(side: &str) -> Option<(String, i32)> {
    let side = side.trim();
    let (language, namespace) = match side.rsplit_once(':') {
        Some((language, namespace)) => (language.trim(), namespace.trim()),
        None => ("", side),
    };
    if !language
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch == '-')
    {
        return None;
    }
    if namespace.is_empty() || !namespace.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let namespace = namespace.parse::<i32>().ok()?;
    Some((language.to_string(), namespace))
}
