//! Record identifier normalization.
//!
//! A raw OAI identifier is first stripped of the configured prefix, then run
//! through the ordered list of rewrite rules. Rules are position-correlated
//! pairs (`id_search[i]` rewrites to `id_replace[i]`) and must be applied in
//! order: migrated configurations rely on earlier rules feeding later ones.

use anyhow::{Context, Result, ensure};
use regex::Regex;

/// Prefix strip + regex rewrite pipeline.
#[derive(Debug)]
pub struct IdNormalizer {
    prefix: Option<String>,
    rules: Vec<(Regex, String)>,
}

impl IdNormalizer {
    pub fn new(prefix: Option<&str>, search: &[String], replace: &[String]) -> Result<Self> {
        ensure!(
            search.len() == replace.len(),
            "id_search has {} patterns but id_replace has {} replacements",
            search.len(),
            replace.len()
        );
        let rules = search
            .iter()
            .zip(replace)
            .map(|(pattern, replacement)| {
                Ok((compile_rule(pattern)?, replacement.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
            rules,
        })
    }

    /// Normalize a raw identifier.
    pub fn normalize(&self, raw: &str) -> String {
        let mut id = match &self.prefix {
            Some(prefix) => raw.strip_prefix(prefix.as_str()).unwrap_or(raw),
            None => raw,
        }
        .to_string();
        for (pattern, replacement) in &self.rules {
            id = pattern.replace_all(&id, replacement.as_str()).into_owned();
        }
        id
    }
}

/// Compile one rewrite pattern.
///
/// Patterns may carry `/expr/flags` delimiters as found in legacy source
/// configurations; only the `i` flag is honored. Bare patterns are compiled
/// verbatim.
fn compile_rule(pattern: &str) -> Result<Regex> {
    let (body, flags) = split_delimited(pattern);
    let expr = if flags.contains('i') {
        format!("(?i){body}")
    } else {
        body.to_string()
    };
    Regex::new(&expr).with_context(|| format!("invalid id rewrite pattern {pattern:?}"))
}

fn split_delimited(pattern: &str) -> (&str, &str) {
    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(pos) = rest.rfind('/') {
            return (&rest[..pos], &rest[pos + 1..]);
        }
    }
    (pattern, "")
}
