//! Adapter over RFC 8941-flavored "structured fields".
//!
//! Off-the-shelf structured-field crates parse a dictionary/list of items
//! whose parameters are themselves bare scalars — they reject a parameter
//! whose value is a parenthesized *list*, e.g. `delta=("text/plain"
//! "text/diff")` or `accept=("message/rfc822";delta="text/plain")`. That
//! shape is exactly what PREP's offer negotiation depends on, so this
//! adapter emulates it directly: parameters are parsed as either a scalar,
//! a list of bare values, or a list of nested items, and the negotiator
//! never has to care which.

use crate::error::PrepError;
use indexmap::IndexMap;
use std::fmt::Write as _;

/// A parameter's value: scalar, a flat list of bare values (`delta=(a b)`),
/// or a list of full sub-items (`accept=("message/rfc822";delta="text/plain")`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Scalar(String),
    List(Vec<String>),
    Items(Vec<StructuredItem>),
}

impl ParamValue {
    /// The scalar string, if this value is a plain scalar.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ParamValue::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

pub type ParamMap = IndexMap<String, ParamValue>;

/// Ordered triple `(bareValue, params, ?extraParams)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructuredItem {
    pub bare: String,
    pub params: ParamMap,
    pub extra_params: Option<ParamMap>,
}

impl StructuredItem {
    #[must_use]
    pub fn new(bare: impl Into<String>) -> Self {
        Self {
            bare: bare.into(),
            params: ParamMap::new(),
            extra_params: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), ParamValue::Scalar(value.into()));
        self
    }

    /// Bare-value equality used throughout the negotiator: case-insensitive.
    #[must_use]
    pub fn bare_eq(&self, other: &str) -> bool {
        self.bare.eq_ignore_ascii_case(other)
    }
}

pub type StructuredList = Vec<StructuredItem>;

/// A structured dictionary value, used for the `Events` response header.
#[derive(Debug, Clone, PartialEq)]
pub enum DictValue {
    Token(String),
    Str(String),
    Integer(i64),
    Bool(bool),
}

pub type StructuredDict = IndexMap<String, DictValue>;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parses a comma-separated structured list, e.g. the `"prep";accept=(...)`
/// candidate string built by `configure`.
pub fn parse_list(input: &str) -> Result<StructuredList, PrepError> {
    split_top_level(input.trim(), ',')
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_item(s.trim()))
        .collect()
}

/// Parses a single item: a bare value followed by `;name=value` parameters.
pub fn parse_item(input: &str) -> Result<StructuredItem, PrepError> {
    let segments = split_top_level(input, ';');
    let mut iter = segments.into_iter();
    let bare_raw = iter
        .next()
        .ok_or_else(|| PrepError::StructuredField("empty item".to_owned()))?;
    let bare = unquote(bare_raw.trim());

    let mut params = ParamMap::new();
    let mut extra_params: Option<ParamMap> = None;
    for seg in iter {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        let (name, value) = parse_param(seg)?;
        match value {
            ParamValue::Scalar(_) => {
                params.insert(name, value);
            }
            ParamValue::List(_) | ParamValue::Items(_) => {
                extra_params.get_or_insert_with(ParamMap::new).insert(name, value);
            }
        }
    }
    Ok(StructuredItem {
        bare,
        params,
        extra_params,
    })
}

fn parse_param(seg: &str) -> Result<(String, ParamValue), PrepError> {
    let (name, value) = seg
        .split_once('=')
        .ok_or_else(|| PrepError::StructuredField(format!("parameter missing '=': {seg}")))?;
    let name = name.trim().to_ascii_lowercase();
    let value = value.trim();

    if let Some(inner) = value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        let members = split_top_level(inner, ' ')
            .into_iter()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>();
        // A nested member either looks like a full item (carries its own
        // `;param=value` suffix) or is a bare alternative value.
        if members.iter().any(|m| m.contains(';')) {
            let items = members
                .into_iter()
                .map(parse_item)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((name, ParamValue::Items(items)))
        } else {
            let list = members.into_iter().map(unquote).collect();
            Ok((name, ParamValue::List(list)))
        }
    } else {
        Ok((name, ParamValue::Scalar(unquote(value))))
    }
}

/// Parses a structured dictionary: `key=value, key2=value2, flag`.
pub fn parse_dict(input: &str) -> Result<StructuredDict, PrepError> {
    let mut dict = StructuredDict::new();
    for seg in split_top_level(input.trim(), ',') {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        match seg.split_once('=') {
            Some((k, v)) => {
                dict.insert(k.trim().to_owned(), parse_dict_value(v.trim())?);
            }
            None => {
                dict.insert(seg.to_owned(), DictValue::Bool(true));
            }
        }
    }
    Ok(dict)
}

fn parse_dict_value(value: &str) -> Result<DictValue, PrepError> {
    if value == "?1" {
        return Ok(DictValue::Bool(true));
    }
    if value == "?0" {
        return Ok(DictValue::Bool(false));
    }
    if value.starts_with('"') {
        return Ok(DictValue::Str(unquote(value)));
    }
    if let Ok(n) = value.parse::<i64>() {
        return Ok(DictValue::Integer(n));
    }
    Ok(DictValue::Token(value.to_owned()))
}

/// Splits `input` on `delim` at the top level only: occurrences inside a
/// quoted string or parenthesized inner-list are not treated as separators.
fn split_top_level(input: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut depth = 0u32;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '(' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == delim && !in_quotes && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        inner.replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_owned()
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// True if `s` needs no quoting to round-trip as a structured-field token.
fn is_bare_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._:/*".contains(c))
}

fn quote_if_needed(s: &str) -> String {
    if is_bare_token(s) {
        s.to_owned()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

pub fn serialize_item(item: &StructuredItem) -> String {
    let mut out = quote_if_needed(&item.bare);
    for (name, value) in &item.params {
        let _ = write!(out, ";{name}={}", serialize_value(value));
    }
    if let Some(extra) = &item.extra_params {
        for (name, value) in extra {
            let _ = write!(out, ";{name}={}", serialize_value(value));
        }
    }
    out
}

fn serialize_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Scalar(s) => quote_if_needed(s),
        ParamValue::List(items) => {
            let members: Vec<String> = items.iter().map(|s| quote_if_needed(s)).collect();
            format!("({})", members.join(" "))
        }
        ParamValue::Items(items) => {
            let members: Vec<String> = items.iter().map(serialize_item).collect();
            format!("({})", members.join(" "))
        }
    }
}

pub fn serialize_list(list: &StructuredList) -> String {
    list.iter().map(serialize_item).collect::<Vec<_>>().join(", ")
}

pub fn serialize_dict(dict: &StructuredDict) -> String {
    dict.iter()
        .map(|(k, v)| format!("{k}={}", serialize_dict_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn serialize_dict_value(value: &DictValue) -> String {
    match value {
        DictValue::Token(s) => s.clone(),
        DictValue::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        DictValue::Integer(n) => n.to_string(),
        DictValue::Bool(true) => "?1".to_owned(),
        DictValue::Bool(false) => "?0".to_owned(),
    }
}

/// Appends `item` to an existing comma-separated structured-list header
/// value, preserving whatever was already there.
#[must_use]
pub fn append_item(existing: Option<&str>, item: &str) -> String {
    match existing {
        Some(prev) if !prev.trim().is_empty() => format!("{prev}, {item}"),
        _ => item.to_owned(),
    }
}
