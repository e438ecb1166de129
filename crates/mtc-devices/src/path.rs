//! Structural path matching.
//!
//! Supports the subset of XPath the agent's own descriptor paths use:
//! `//`-separated steps, each a tag (or `*`) with an optional predicate of
//! `@attr="value"` terms joined by `and`. A query matches a descriptor path
//! when its steps appear in the descriptor's steps in order.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    tag: String,
    attrs: BTreeMap<String, String>,
}

impl Step {
    fn matches(&self, target: &Step) -> bool {
        (self.tag == "*" || self.tag == target.tag)
            && self
                .attrs
                .iter()
                .all(|(k, v)| target.attrs.get(k) == Some(v))
    }
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    steps: Vec<Step>,
}

impl PathQuery {
    /// Parse a single path. Returns `None` for syntax this matcher does not
    /// understand.
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        if !expr.starts_with('/') {
            return None;
        }
        let steps = split_steps(expr)?
            .into_iter()
            .map(parse_step)
            .collect::<Option<Vec<_>>>()?;
        if steps.is_empty() {
            return None;
        }
        Some(Self { steps })
    }

    /// Whether this query selects the descriptor at `path`.
    pub fn matches(&self, path: &PathQuery) -> bool {
        let mut targets = path.steps.iter();
        self.steps
            .iter()
            .all(|step| targets.by_ref().any(|target| step.matches(target)))
    }
}

/// Split `expr` on `|` into individual path queries.
pub fn parse_multi(expr: &str) -> Option<Vec<PathQuery>> {
    expr.split('|')
        .filter(|p| !p.trim().is_empty())
        .map(PathQuery::parse)
        .collect()
}

fn split_steps(expr: &str) -> Option<Vec<&str>> {
    let mut steps = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;

    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.checked_sub(1)?,
            (None, '/') if depth == 0 => {
                if i > start {
                    steps.push(&expr[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return None;
    }
    if start < expr.len() {
        steps.push(&expr[start..]);
    }
    Some(steps)
}

fn parse_step(step: &str) -> Option<Step> {
    let step = step.trim();
    let (tag, predicate) = match step.find('[') {
        Some(open) => {
            let close = step.rfind(']')?;
            if close != step.len() - 1 || close < open {
                return None;
            }
            (&step[..open], Some(&step[open + 1..close]))
        }
        None => (step, None),
    };
    if tag.is_empty() {
        return None;
    }

    let mut attrs = BTreeMap::new();
    if let Some(predicate) = predicate {
        for term in split_and(predicate) {
            let (name, value) = parse_term(term)?;
            attrs.insert(name.to_string(), value.to_string());
        }
    }
    Some(Step {
        tag: tag.to_string(),
        attrs,
    })
}

fn split_and(predicate: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    let bytes = predicate.as_bytes();

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if bytes[i..].starts_with(b" and ") => {
                terms.push(predicate[start..i].trim());
                i += " and ".len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    terms.push(predicate[start..].trim());
    terms
}

fn parse_term(term: &str) -> Option<(&str, &str)> {
    let term = term.strip_prefix('@')?;
    let (name, value) = term.split_once('=')?;
    let value = value.trim();
    let unquoted = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))?;
    Some((name.trim(), unquoted))
}
