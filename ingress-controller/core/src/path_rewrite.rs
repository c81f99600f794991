//! Prefix replacement for routed request paths.
//!
//! A policy holds `(prefix, replacement)` rules. Each rule is matched against
//! the route's effective prefix (including any prefix contributed by an
//! include) and the most specific match replaces that portion of the path. A
//! rule with an empty prefix matches any route and replaces its whole prefix.

use crate::graph::PathMatch;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathRewritePolicy {
    pub rules: Vec<ReplacePrefix>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplacePrefix {
    pub prefix: String,
    pub replacement: String,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathRewriteError {
    #[error("ambiguous prefix replacement: duplicate prefix {0:?}")]
    DuplicatePrefix(String),

    #[error("ambiguous prefix replacement: more than one rule with an empty prefix")]
    AmbiguousEmptyPrefix,

    #[error("replacement for prefix {0:?} must not be empty")]
    EmptyReplacement(String),

    #[error("{0:?} must begin with '/'")]
    NotAbsolute(String),
}

// === impl PathRewritePolicy ===

impl PathRewritePolicy {
    pub fn new(rules: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(prefix, replacement)| ReplacePrefix {
                    prefix,
                    replacement,
                })
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), PathRewriteError> {
        let mut seen = Vec::with_capacity(self.rules.len());
        let mut empty = 0usize;
        for ReplacePrefix {
            prefix,
            replacement,
        } in &self.rules
        {
            if replacement.is_empty() {
                return Err(PathRewriteError::EmptyReplacement(prefix.clone()));
            }
            if !replacement.starts_with('/') {
                return Err(PathRewriteError::NotAbsolute(replacement.clone()));
            }

            if prefix.is_empty() {
                empty += 1;
                if empty > 1 {
                    return Err(PathRewriteError::AmbiguousEmptyPrefix);
                }
                continue;
            }
            if !prefix.starts_with('/') {
                return Err(PathRewriteError::NotAbsolute(prefix.clone()));
            }

            let normalized = normalize(prefix);
            if seen.contains(&normalized) {
                return Err(PathRewriteError::DuplicatePrefix(prefix.clone()));
            }
            seen.push(normalized);
        }
        Ok(())
    }

    /// Returns the path that replaces `route_prefix`, if any rule applies.
    ///
    /// The longest matching explicit prefix wins; the empty-prefix rule only
    /// applies when no explicit prefix matches.
    pub fn rewrite(&self, route_prefix: &str) -> Option<String> {
        let route = normalize(route_prefix);

        let mut best: Option<(usize, &str, &str)> = None;
        for ReplacePrefix {
            prefix,
            replacement,
        } in &self.rules
        {
            let candidate = if prefix.is_empty() {
                Some((0, ""))
            } else {
                let rule = normalize(prefix);
                remainder(rule, route).map(|rest| (rule.len(), rest))
            };

            if let Some((len, rest)) = candidate {
                let better = match best {
                    None => true,
                    // Any explicit prefix beats the catch-all, which has no length.
                    Some((best_len, _, _)) => len > best_len,
                };
                if better {
                    best = Some((len, rest, replacement.as_str()));
                }
            }
        }

        best.map(|(_, rest, replacement)| join(replacement, rest))
    }
}

/// Expands a prefix route into the path matches it generates.
///
/// Without a rewrite the prefix is matched as-is. With a rewrite, the prefix
/// is split into an exact match for the bare prefix and a prefix match for
/// everything below it, so that neither variant gains or loses a separator.
pub fn expand_prefix(prefix: &str, rewrite: Option<&str>) -> Vec<(PathMatch, Option<String>)> {
    let rewrite = match rewrite {
        None => return vec![(PathMatch::Prefix(prefix.to_string()), None)],
        Some(rewrite) => rewrite,
    };

    let prefix = normalize(prefix);
    if prefix == "/" {
        return vec![(PathMatch::Prefix("/".to_string()), Some(rewrite.to_string()))];
    }

    let bare = rewrite.trim_end_matches('/');
    let slashed = format!("{bare}/");
    let bare = if bare.is_empty() { "/" } else { bare };
    vec![
        (PathMatch::Exact(prefix.to_string()), Some(bare.to_string())),
        (PathMatch::Prefix(format!("{prefix}/")), Some(slashed)),
    ]
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Returns the part of `route` that follows `rule`, if `rule` covers whole
/// path segments of `route`.
fn remainder<'r>(rule: &str, route: &'r str) -> Option<&'r str> {
    if rule == "/" {
        return Some(if route == "/" { "" } else { route });
    }
    if route == rule {
        return Some("");
    }
    route
        .strip_prefix(rule)
        .filter(|rest| rest.starts_with('/'))
}

fn join(replacement: &str, rest: &str) -> String {
    if rest.is_empty() {
        return replacement.to_string();
    }
    format!("{}{}", replacement.trim_end_matches('/'), rest)
}
