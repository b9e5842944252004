//! Query expansion: synonyms, acronyms, and phrasal rewrites.
//!
//! Expansion is optional and bounded: the original query always searches at
//! weight 1.0, variants at 0.8, and the engine multiplies merged scores by
//! 1.1 for entities found by two or more variants.

use regex::Regex;

/// Weight assigned to every non-original variant.
pub const VARIANT_WEIGHT: f64 = 0.8;
/// Score multiplier for entities found by ≥ 2 variants.
pub const MULTI_VARIANT_BONUS: f64 = 1.1;

/// A query variant with its search weight.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryVariant {
    pub text: String,
    pub weight: f64,
}

pub struct QueryExpander {
    synonyms: Vec<(&'static str, &'static [&'static str])>,
    acronyms: Vec<(&'static str, &'static str)>,
    rewrites: Vec<(Regex, &'static str)>,
    max_variants: usize,
}

impl QueryExpander {
    pub fn new(max_variants: usize) -> Self {
        let rewrites = [
            // Interrogatives collapse to their subject.
            (r"(?i)^how (?:do|does|can|to) (?:i |we )?", ""),
            (r"(?i)^what (?:is|are) (?:the )?", ""),
            (r"(?i)^why (?:is|does|do) ", ""),
            // Failure phrasings normalize to "<thing> error".
            (r"(?i)^(.+?) (?:is|keeps?) (?:failing|breaking|crashing)$", "$1 error"),
            (r"(?i)^(.+?) doesn'?t work$", "$1 error"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| {
            (Regex::new(pattern).expect("valid rewrite regex"), replacement)
        })
        .collect();

        Self {
            rewrites,
            synonyms: vec![
                ("bug", &["defect", "error"]),
                ("error", &["failure", "bug"]),
                ("fix", &["repair", "resolve"]),
                ("fast", &["quick", "performant"]),
                ("slow", &["latency", "performance"]),
                ("auth", &["authentication", "login"]),
                ("config", &["configuration", "settings"]),
                ("db", &["database", "store"]),
                ("test", &["spec", "check"]),
            ],
            acronyms: vec![
                ("fts", "full text search"),
                ("mmr", "maximal marginal relevance"),
                ("ws", "websocket"),
                ("sse", "server sent events"),
                ("acl", "access control"),
                ("wal", "write ahead logging"),
                ("knn", "nearest neighbor"),
                ("ci", "continuous integration"),
            ],
            max_variants,
        }
    }

    /// Expand a query into at most `max_variants` weighted variants. The
    /// original is always first, at weight 1.0; duplicates are dropped.
    pub fn expand(&self, query: &str) -> Vec<QueryVariant> {
        let mut variants = vec![QueryVariant {
            text: query.to_string(),
            weight: 1.0,
        }];

        let mut push = |text: String, variants: &mut Vec<QueryVariant>| {
            if variants.len() > self.max_variants {
                return;
            }
            let normalized = text.trim();
            if normalized.is_empty() {
                return;
            }
            if variants.iter().any(|v| v.text.eq_ignore_ascii_case(normalized)) {
                return;
            }
            variants.push(QueryVariant {
                text: normalized.to_string(),
                weight: VARIANT_WEIGHT,
            });
        };

        // Phrasal rewrites run on the whole query.
        for (regex, replacement) in &self.rewrites {
            if regex.is_match(query) {
                let rewritten = regex.replace(query, *replacement).to_string();
                push(rewritten, &mut variants);
            }
        }

        // Acronym expansion and synonym substitution run word-by-word.
        let lower = query.to_lowercase();
        for (acronym, expansion) in &self.acronyms {
            if lower.split_whitespace().any(|w| w == *acronym) {
                push(replace_word(query, acronym, expansion), &mut variants);
            }
        }
        for (word, subs) in &self.synonyms {
            if lower.split_whitespace().any(|w| w == *word) {
                for sub in subs.iter() {
                    push(replace_word(query, word, sub), &mut variants);
                }
            }
        }

        variants.truncate(self.max_variants + 1);
        variants
    }
}

impl Default for QueryExpander {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Replace whole-word, case-insensitive occurrences of `from` with `to`.
fn replace_word(query: &str, from: &str, to: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            if w.eq_ignore_ascii_case(from) {
                to.to_string()
            } else {
                w.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
