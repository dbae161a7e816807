//! Content negotiation core.
//!
//! Matches a client's structured `Accept-Events` parameters against a
//! server-declared offer and produces the canonical negotiated
//! [`EventProfile`] used as the subscription key.

use crate::structured::{ParamMap, ParamValue, StructuredItem, StructuredList};
use std::cmp::Ordering;

/// The subscription key: currently just a negotiated `content-type` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventProfile {
    pub content_type: StructuredItem,
}

/// Result of matching one requested item against one allowed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    NoMatch,
    Full,
    /// Partial match: carries the request's mismatched/list-valued params.
    Partial(ParamMap),
}

/// Server's declared capabilities for a path.
#[derive(Debug, Clone, Default)]
pub struct AcceptEventsOffer {
    pub accept: StructuredList,
}

/// What the client requested, already parsed by the adjacent middleware
/// and handed to us as a plain value.
#[derive(Debug, Clone, Default)]
pub struct RequestedEvents {
    pub accept: Option<StructuredList>,
    pub duration: Option<u64>,
}

impl RequestedEvents {
    fn accept_or_wildcard(&self) -> StructuredList {
        self.accept
            .clone()
            .unwrap_or_else(|| vec![StructuredItem::new("*/*")])
    }
}

/// Matches one requested item against one allowed item using exact,
/// case-insensitive bare-value comparison (used for everything except
/// media types, which additionally support wildcards — see [`match_type`]).
#[must_use]
pub fn match_item(requested: &StructuredItem, allowed: &StructuredItem) -> MatchOutcome {
    match_with(requested, allowed, |r, a| r.eq_ignore_ascii_case(a))
}

/// As [`match_item`] but applies media-type wildcard rules (`*/*`, `type/*`).
#[must_use]
pub fn match_type(requested: &StructuredItem, allowed: &StructuredItem) -> MatchOutcome {
    match_with(requested, allowed, media_type_matches)
}

fn match_with(
    requested: &StructuredItem,
    allowed: &StructuredItem,
    bare_matches: impl Fn(&str, &str) -> bool,
) -> MatchOutcome {
    if !bare_matches(&requested.bare, &allowed.bare) {
        return MatchOutcome::NoMatch;
    }

    let mut mismatched = ParamMap::new();
    if let Some(extra) = &requested.extra_params {
        for (name, value) in extra {
            mismatched.insert(name.clone(), value.clone());
        }
    }
    for (name, req_value) in &requested.params {
        if name == "q" {
            continue;
        }
        match allowed.params.get(name) {
            Some(allowed_value) if allowed_value == req_value => {}
            _ => {
                mismatched.insert(name.clone(), req_value.clone());
            }
        }
    }

    if mismatched.is_empty() {
        MatchOutcome::Full
    } else {
        MatchOutcome::Partial(mismatched)
    }
}

fn split_media(bare: &str) -> (&str, &str) {
    bare.split_once('/').unwrap_or((bare, ""))
}

fn media_type_matches(requested: &str, allowed: &str) -> bool {
    let (req_type, req_sub) = split_media(requested);
    let (allowed_type, allowed_sub) = split_media(allowed);
    if req_type == "*" {
        return true;
    }
    if !req_type.eq_ignore_ascii_case(allowed_type) {
        return false;
    }
    req_sub == "*" || req_sub.eq_ignore_ascii_case(allowed_sub)
}

fn specificity(bare: &str) -> u8 {
    let (t, s) = split_media(bare);
    if t == "*" {
        0
    } else if s == "*" {
        1
    } else {
        2
    }
}

fn q_value(item: &StructuredItem) -> f64 {
    match item.params.get("q").and_then(ParamValue::as_scalar) {
        Some(q) => q.parse().unwrap_or(1.0),
        None => 1.0,
    }
}

/// Sorts by specificity descending, then `q` descending, stable on ties
/// (preserves insertion order).
#[must_use]
pub fn sort_by_q(items: &[StructuredItem]) -> Vec<&StructuredItem> {
    let mut indexed: Vec<(usize, &StructuredItem)> = items.iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        specificity(&b.bare)
            .cmp(&specificity(&a.bare))
            .then_with(|| q_value(b).partial_cmp(&q_value(a)).unwrap_or(Ordering::Equal))
            .then_with(|| ia.cmp(ib))
    });
    indexed.into_iter().map(|(_, item)| item).collect()
}

/// Every allowed item for which some requested item matches.
#[must_use]
pub fn negotiate_list(requested: &StructuredList, allowed: &StructuredList) -> StructuredList {
    allowed
        .iter()
        .filter_map(|allowed_item| {
            requested.iter().find_map(|req_item| {
                match match_item(req_item, allowed_item) {
                    MatchOutcome::NoMatch => None,
                    MatchOutcome::Full => Some(allowed_item.clone()),
                    MatchOutcome::Partial(extra) => {
                        let mut item = allowed_item.clone();
                        item.extra_params = Some(extra);
                        Some(item)
                    }
                }
            })
        })
        .collect()
}

/// First match wins, using `sort_by_q` on the requested side.
#[must_use]
pub fn negotiate_item(requested: &StructuredList, allowed: &StructuredList) -> Option<StructuredItem> {
    negotiate_with(requested, allowed, match_item)
}

/// As [`negotiate_item`] but over media types (wildcard-aware).
#[must_use]
pub fn negotiate_type(requested: &StructuredList, allowed: &StructuredList) -> Option<StructuredItem> {
    negotiate_with(requested, allowed, match_type)
}

fn negotiate_with(
    requested: &StructuredList,
    allowed: &StructuredList,
    matcher: impl Fn(&StructuredItem, &StructuredItem) -> MatchOutcome,
) -> Option<StructuredItem> {
    for req_item in sort_by_q(requested) {
        for allowed_item in allowed {
            match matcher(req_item, allowed_item) {
                MatchOutcome::NoMatch => continue,
                MatchOutcome::Full => return Some(allowed_item.clone()),
                MatchOutcome::Partial(extra) => {
                    let mut item = allowed_item.clone();
                    item.extra_params = Some(extra);
                    return Some(item);
                }
            }
        }
    }
    None
}

/// Only `accept` is processed today. Defaults the request's accept list to
/// `*/*` when absent.
#[must_use]
pub fn negotiate_content(
    requested: &RequestedEvents,
    allowed: &AcceptEventsOffer,
) -> Option<EventProfile> {
    let requested_accept = requested.accept_or_wildcard();
    let content_type = negotiate_type(&requested_accept, &allowed.accept)?;
    Some(EventProfile { content_type })
}

/// Strips `extra_params` and canonicalizes (lowercased names, sorted) —
/// the only form that may be used as a subscription key.
#[must_use]
pub fn cleanup(profile: EventProfile) -> EventProfile {
    EventProfile {
        content_type: cleanup_item(profile.content_type),
    }
}

fn cleanup_item(item: StructuredItem) -> StructuredItem {
    let mut params: ParamMap = item
        .params
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();
    params.sort_keys();
    StructuredItem {
        bare: item.bare.to_ascii_lowercase(),
        params,
        extra_params: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::StructuredItem;

    fn offer_with_delta() -> AcceptEventsOffer {
        AcceptEventsOffer {
            accept: vec![StructuredItem::new("message/rfc822").with_param("delta", "text/plain")],
        }
    }

    #[test]
    fn negotiates_partial_match_and_cleanup_strips_extras() {
        let mut requested_item = StructuredItem::new("message/rfc822");
        requested_item.extra_params = Some({
            let mut m = ParamMap::new();
            m.insert(
                "delta".to_owned(),
                ParamValue::List(vec!["text/plain".to_owned(), "text/diff".to_owned()]),
            );
            m
        });
        let requested = RequestedEvents {
            accept: Some(vec![requested_item]),
            duration: None,
        };

        let profile = negotiate_content(&requested, &offer_with_delta()).expect("should match");
        assert_eq!(profile.content_type.bare, "message/rfc822");
        assert_eq!(
            profile.content_type.params.get("delta"),
            Some(&ParamValue::Scalar("text/plain".to_owned()))
        );

        let cleaned = cleanup(profile);
        assert!(cleaned.content_type.extra_params.is_none());
    }

    #[test]
    fn no_overlapping_media_type_yields_none() {
        let requested = RequestedEvents {
            accept: Some(vec![StructuredItem::new("application/json")]),
            duration: None,
        };
        assert!(negotiate_content(&requested, &offer_with_delta()).is_none());
    }

    #[test]
    fn wildcard_request_matches_any_offer() {
        let requested = RequestedEvents::default();
        let profile = negotiate_content(&requested, &offer_with_delta()).unwrap();
        assert_eq!(profile.content_type.bare, "message/rfc822");
    }

    #[test]
    fn negotiate_content_is_idempotent() {
        let requested = RequestedEvents::default();
        let a = negotiate_content(&requested, &offer_with_delta());
        let b = negotiate_content(&requested, &offer_with_delta());
        assert_eq!(a, b);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let requested = RequestedEvents::default();
        let profile = negotiate_content(&requested, &offer_with_delta()).unwrap();
        let once = cleanup(profile.clone());
        let twice = cleanup(cleanup(profile));
        assert_eq!(once, twice);
    }

    #[test]
    fn sort_by_q_orders_by_specificity_then_q_then_insertion() {
        let items = vec![
            StructuredItem::new("*/*"),
            StructuredItem::new("text/*").with_param("q", "0.5"),
            StructuredItem::new("text/plain").with_param("q", "0.8"),
            StructuredItem::new("text/html"),
        ];
        let sorted = sort_by_q(&items);
        let bares: Vec<&str> = sorted.iter().map(|i| i.bare.as_str()).collect();
        assert_eq!(bares, vec!["text/html", "text/plain", "text/*", "*/*"]);
    }
}
