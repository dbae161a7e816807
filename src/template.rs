//! Renders `message/rfc822` notification bodies and per-part headers.

use crate::negotiate::EventProfile;

/// Fields available when rendering one notification body.
#[derive(Debug, Clone, Default)]
pub struct NotificationFields {
    pub method: String,
    pub date: String,
    pub e_tag: Option<String>,
    pub event_id: Option<String>,
    pub location: Option<String>,
    pub delta: Option<String>,
}

/// Renders the `message/rfc822` body: headers, a blank line, then the delta
/// body iff the verb is a write (`PUT`/`PATCH`/`POST`) and a delta was
/// supplied.
#[must_use]
pub fn rfc822(fields: &NotificationFields) -> String {
    let mut out = String::new();
    out.push_str(&format!("Method: {}\r\n", fields.method));
    out.push_str(&format!("Date: {}\r\n", fields.date));
    if let Some(event_id) = &fields.event_id {
        out.push_str(&format!("Event-ID: {event_id}\r\n"));
    }
    if let Some(e_tag) = &fields.e_tag {
        out.push_str(&format!("ETag: {e_tag}\r\n"));
    }
    if let Some(location) = &fields.location {
        out.push_str(&format!("Location: {location}\r\n"));
    }
    out.push_str("\r\n");
    if fields.method.starts_with('P') {
        if let Some(delta) = &fields.delta {
            out.push_str(delta);
        }
    }
    out
}

/// Renders `Canonical-Name: value` lines for every `content-*` entry of the
/// profile except `content-type: message/rfc822`, which is implicit for the
/// outer digest. Keys are rendered in Train-Case.
#[must_use]
pub fn header(profile: &EventProfile) -> String {
    let mut out = String::new();
    if !profile.content_type.bare_eq("message/rfc822") {
        out.push_str(&format!(
            "{}: {}\r\n",
            train_case("content-type"),
            profile.content_type.bare.to_ascii_lowercase()
        ));
    }
    out
}

fn train_case(key: &str) -> String {
    key.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::StructuredItem;

    #[test]
    fn rfc822_omits_optional_lines_when_absent() {
        let fields = NotificationFields {
            method: "PATCH".to_owned(),
            date: "Tue, 29 Oct 2024 16:56:32 GMT".to_owned(),
            ..Default::default()
        };
        let body = rfc822(&fields);
        assert_eq!(
            body,
            "Method: PATCH\r\nDate: Tue, 29 Oct 2024 16:56:32 GMT\r\n\r\n"
        );
    }

    #[test]
    fn rfc822_includes_delta_only_for_write_verbs() {
        let mut fields = NotificationFields {
            method: "PATCH".to_owned(),
            date: "Tue, 29 Oct 2024 16:56:32 GMT".to_owned(),
            delta: Some("{\"x\":1}".to_owned()),
            ..Default::default()
        };
        assert!(rfc822(&fields).ends_with("{\"x\":1}"));

        fields.method = "DELETE".to_owned();
        assert!(rfc822(&fields).ends_with("\r\n\r\n"));
    }

    #[test]
    fn rfc822_renders_all_optional_lines_in_order() {
        let fields = NotificationFields {
            method: "PUT".to_owned(),
            date: "Tue, 29 Oct 2024 16:56:32 GMT".to_owned(),
            e_tag: Some("\"abc\"".to_owned()),
            event_id: Some("a1b2c3".to_owned()),
            location: Some("/races/1".to_owned()),
            delta: None,
        };
        let body = rfc822(&fields);
        assert_eq!(
            body,
            "Method: PUT\r\nDate: Tue, 29 Oct 2024 16:56:32 GMT\r\nEvent-ID: a1b2c3\r\nETag: \"abc\"\r\nLocation: /races/1\r\n\r\n"
        );
    }

    #[test]
    fn header_skips_implicit_message_rfc822_content_type() {
        let profile = EventProfile {
            content_type: StructuredItem::new("message/rfc822"),
        };
        assert_eq!(header(&profile), "");
    }

    #[test]
    fn header_renders_train_case_for_non_default_content_type() {
        let profile = EventProfile {
            content_type: StructuredItem::new("application/json"),
        };
        assert_eq!(header(&profile), "Content-Type: application/json\r\n");
    }
}
