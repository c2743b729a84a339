//! Normalization of model responses into [`AnalysisSummary`] values.
//!
//! Models wrap the JSON we ask for in prose or code fences, translate key
//! names, and nest the payload inside wrapper objects. Parsing here is
//! deliberately forgiving about all of that and strict about exactly one
//! thing: the result must carry a non-empty title, otherwise the whole
//! analysis counts as failed.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{AnalysisError, AnalysisSummary, ComparisonResult, ComparisonRow};

/// Maximum nesting depth searched for the summary object.
const MAX_SEARCH_DEPTH: usize = 4;

/// Ordered alias table mapping raw key names to canonical fields.
///
/// Precedence is fixed: exact match in table order, then case-insensitive
/// match, then substring match, each pass in table order. Tests pin this
/// so adding an alias can't silently reshuffle existing mappings.
const ALIAS_RULES: &[(&str, &str)] = &[
    ("title", "title"),
    ("标题", "title"),
    ("题目", "title"),
    ("论文标题", "title"),
    ("paper_title", "title"),
    ("name", "title"),
    ("authors", "authors"),
    ("author", "authors"),
    ("作者", "authors"),
    ("publication", "publication"),
    ("venue", "publication"),
    ("journal", "publication"),
    ("conference", "publication"),
    ("期刊", "publication"),
    ("发表", "publication"),
    ("出处", "publication"),
    ("problem", "problem"),
    ("问题", "problem"),
    ("研究问题", "problem"),
    ("question", "problem"),
    ("challenge", "problem"),
    ("method", "method"),
    ("思路", "method"),
    ("方法", "method"),
    ("solution", "method"),
    ("idea", "method"),
    ("approach", "method"),
    ("contributions", "contributions"),
    ("contribution", "contributions"),
    ("贡献", "contributions"),
    ("创新点", "contributions"),
    ("innovation", "contributions"),
    ("results", "results"),
    ("result", "results"),
    ("结果", "results"),
    ("实验结果", "results"),
    ("findings", "results"),
    ("experiments", "results"),
    ("limitations", "limitations"),
    ("limitation", "limitations"),
    ("局限", "limitations"),
    ("不足", "limitations"),
    ("weaknesses", "limitations"),
    ("keywords", "keywords"),
    ("keyword", "keywords"),
    ("关键词", "keywords"),
];

/// Map a raw key name to its canonical field, if any rule matches.
pub fn canonical_key(raw: &str) -> Option<&'static str> {
    let key = raw.trim();
    if key.is_empty() {
        return None;
    }

    // Pass 1: exact
    for (alias, canonical) in ALIAS_RULES {
        if key == *alias {
            return Some(canonical);
        }
    }

    // Pass 2: case-insensitive
    let lowered = key.to_lowercase();
    for (alias, canonical) in ALIAS_RULES {
        if lowered == *alias {
            return Some(canonical);
        }
    }

    // Pass 3: substring, so composites like "paper title" and "论文题目" hit
    for (alias, canonical) in ALIAS_RULES {
        if lowered.contains(alias) {
            return Some(canonical);
        }
    }

    None
}

/// Extract the outermost JSON object span from a response that may be
/// wrapped in prose or code fences. Returns `None` when no `{..}` span
/// exists.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Render a JSON value as a flat display string for one summary field.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// True if the object exposes both a title-like and a problem-like key.
fn looks_like_summary(map: &Map<String, Value>) -> bool {
    let mut has_title = false;
    let mut has_problem = false;
    for key in map.keys() {
        match canonical_key(key) {
            Some("title") => has_title = true,
            Some("problem") => has_problem = true,
            _ => {}
        }
    }
    has_title && has_problem
}

/// Bounded recursive search for the first object that looks like a
/// summary, descending through wrapper objects and arrays.
pub fn find_summary_object(value: &Value, depth: usize) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) => {
            if looks_like_summary(map) {
                return Some(map);
            }
            if depth == 0 {
                return None;
            }
            map.values().find_map(|v| find_summary_object(v, depth - 1))
        }
        Value::Array(items) => {
            if depth == 0 {
                return None;
            }
            items.iter().find_map(|v| find_summary_object(v, depth - 1))
        }
        _ => None,
    }
}

/// Build a summary from a normalized object, routing keys through the
/// alias table. Later duplicate aliases do not overwrite an earlier
/// non-empty canonical value.
fn summary_from_map(map: &Map<String, Value>) -> AnalysisSummary {
    let mut summary = AnalysisSummary::default();
    let mut extra: BTreeMap<String, String> = BTreeMap::new();

    for (raw_key, value) in map {
        let text = value_to_string(value);
        if text.is_empty() {
            continue;
        }
        match canonical_key(raw_key) {
            Some("title") if summary.title.is_empty() => summary.title = text,
            Some("authors") => fill(&mut summary.authors, text),
            Some("publication") => fill(&mut summary.publication, text),
            Some("problem") => fill(&mut summary.problem, text),
            Some("method") => fill(&mut summary.method, text),
            Some("contributions") => fill(&mut summary.contributions, text),
            Some("results") => fill(&mut summary.results, text),
            Some("limitations") => fill(&mut summary.limitations, text),
            Some("keywords") => fill(&mut summary.keywords, text),
            Some(_) => {}
            None => {
                extra.entry(raw_key.clone()).or_insert(text);
            }
        }
    }

    summary.extra = extra;
    summary
}

fn fill(slot: &mut Option<String>, text: String) {
    if slot.is_none() {
        *slot = Some(text);
    }
}

/// Parse a raw model response into an [`AnalysisSummary`].
///
/// A missing or empty title is a failed analysis even when the HTTP call
/// itself succeeded.
pub fn parse_summary(text: &str) -> Result<AnalysisSummary, AnalysisError> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let span = extract_json_object(text).ok_or_else(|| {
                AnalysisError::MalformedResponse("no JSON object in response".into())
            })?;
            serde_json::from_str(span).map_err(|e| {
                AnalysisError::MalformedResponse(format!("invalid JSON: {e}"))
            })?
        }
    };

    let map = match find_summary_object(&value, MAX_SEARCH_DEPTH) {
        Some(map) => map,
        // No object carries both marker keys; fall back to the root
        // object and let title validation decide.
        None => value
            .as_object()
            .ok_or_else(|| AnalysisError::MalformedResponse("response is not an object".into()))?,
    };

    let summary = summary_from_map(map);
    if summary.title.trim().is_empty() {
        return Err(AnalysisError::MalformedResponse(
            "response has no title field".into(),
        ));
    }
    Ok(summary)
}

/// Row keys accepted for the comparison shape, beyond the main alias table.
fn row_field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    for name in names {
        if let Some(v) = map.get(*name) {
            return Some(v);
        }
    }
    map.iter()
        .find(|(k, _)| {
            let lowered = k.to_lowercase();
            names.iter().any(|n| lowered.contains(n))
        })
        .map(|(_, v)| v)
}

/// Parse a comparison response: a prose `summary` plus exactly one row
/// per input paper.
pub fn parse_comparison(
    text: &str,
    expected_rows: usize,
) -> Result<ComparisonResult, AnalysisError> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let span = extract_json_object(text).ok_or_else(|| {
                AnalysisError::MalformedResponse("no JSON object in comparison response".into())
            })?;
            serde_json::from_str(span).map_err(|e| {
                AnalysisError::MalformedResponse(format!("invalid comparison JSON: {e}"))
            })?
        }
    };

    let map = value
        .as_object()
        .ok_or_else(|| AnalysisError::MalformedResponse("comparison is not an object".into()))?;

    let summary = row_field(map, &["summary", "总结", "overview"])
        .map(value_to_string)
        .unwrap_or_default();
    if summary.is_empty() {
        return Err(AnalysisError::MalformedResponse(
            "comparison has no summary".into(),
        ));
    }

    let rows_value = row_field(map, &["papers", "rows", "论文"])
        .and_then(|v| v.as_array())
        .ok_or_else(|| AnalysisError::MalformedResponse("comparison has no paper rows".into()))?;

    let mut rows = Vec::with_capacity(rows_value.len());
    for item in rows_value {
        let row = item
            .as_object()
            .ok_or_else(|| AnalysisError::MalformedResponse("comparison row is not an object".into()))?;
        rows.push(ComparisonRow {
            title: row_field(row, &["title", "标题"])
                .map(value_to_string)
                .unwrap_or_default(),
            strengths: row_field(row, &["strengths", "优势", "pros"])
                .map(value_to_string)
                .unwrap_or_default(),
            weaknesses: row_field(row, &["weaknesses", "不足", "劣势", "cons"])
                .map(value_to_string)
                .unwrap_or_default(),
        });
    }

    if rows.len() != expected_rows {
        return Err(AnalysisError::MalformedResponse(format!(
            "expected {expected_rows} comparison rows, got {}",
            rows.len()
        )));
    }

    Ok(ComparisonResult { summary, rows })
}
