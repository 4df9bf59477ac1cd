use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use crate::profiles::{ExtractionKind, SiteProfile};

/// Field name → value bag for one listing row, before normalization.
/// Absent keys mean the source had nothing for that field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    fields: HashMap<String, String>,
}

impl RawItem {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: String) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut item = Self::default();
        for (name, value) in pairs {
            item.insert(name, value.to_string());
        }
        item
    }
}

/// Cheap per-handle probe: just enough to dedup and to apply the closed
/// and collection-day rules without paying for full extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemProbe {
    pub item_id: Option<String>,
    pub scheduled_date: Option<String>,
    pub status: Option<String>,
}

/// Polymorphic field extraction over one listing page. A handle is an
/// owned serialized fragment (container HTML or one payload object), so
/// probes and extraction can fan out without borrowing the page.
pub trait ExtractionStrategy: Send + Sync {
    fn handles(&self, html: &str) -> Vec<String>;
    fn probe(&self, handle: &str) -> ItemProbe;
    /// Full field-map extraction. `None` means the handle was malformed;
    /// the page goes on without it.
    fn extract(&self, handle: &str) -> Option<RawItem>;
}

pub fn strategy_for(profile: &'static SiteProfile) -> Box<dyn ExtractionStrategy> {
    match profile.strategy {
        ExtractionKind::Dom => Box::new(DomStrategy::new(profile)),
        ExtractionKind::EmbeddedScript { var } => Box::new(ScriptStrategy::new(profile, var)),
    }
}

// ---------------------------------------------------------------------------
// DOM strategy
// ---------------------------------------------------------------------------

/// `selector@attr` pulls an attribute; a bare selector pulls trimmed text.
fn split_attr(selector: &str) -> (&str, Option<&str>) {
    match selector.rsplit_once('@') {
        Some((css, attr)) if !attr.contains(']') => (css, Some(attr)),
        _ => (selector, None),
    }
}

fn query_fragment(fragment: &Html, selector: &Selector, attr: Option<&str>) -> Option<String> {
    let element = fragment.select(selector).next()?;
    let value = match attr {
        Some(attr) => element.value().attr(attr)?.to_string(),
        None => element.text().collect::<String>().trim().to_string(),
    };
    (!value.is_empty()).then_some(value)
}

pub struct DomStrategy {
    container: Selector,
    fields: Vec<(String, Selector, Option<String>)>,
}

impl DomStrategy {
    pub fn new(profile: &'static SiteProfile) -> Self {
        Self {
            container: Selector::parse(profile.listing.item_container).expect("valid selector"),
            fields: compile_fields(profile.listing.fields),
        }
    }

    fn field(&self, fragment: &Html, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(n, _, _)| n == name)
            .and_then(|(_, selector, attr)| query_fragment(fragment, selector, attr.as_deref()))
    }
}

fn compile_fields(
    fields: &'static [(&'static str, &'static str)],
) -> Vec<(String, Selector, Option<String>)> {
    fields
        .iter()
        .map(|(name, raw)| {
            let (css, attr) = split_attr(raw);
            (
                name.to_string(),
                Selector::parse(css).expect("valid selector"),
                attr.map(str::to_string),
            )
        })
        .collect()
}

impl ExtractionStrategy for DomStrategy {
    fn handles(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        document
            .select(&self.container)
            .map(|element| element.html())
            .collect()
    }

    fn probe(&self, handle: &str) -> ItemProbe {
        let fragment = Html::parse_fragment(handle);
        ItemProbe {
            item_id: self.field(&fragment, "id"),
            scheduled_date: self.field(&fragment, "scheduled_date"),
            status: self.field(&fragment, "status"),
        }
    }

    fn extract(&self, handle: &str) -> Option<RawItem> {
        let fragment = Html::parse_fragment(handle);
        let mut item = RawItem::default();
        for (name, selector, attr) in &self.fields {
            if let Some(value) = query_fragment(&fragment, selector, attr.as_deref()) {
                item.insert(name, value);
            }
        }
        Some(item)
    }
}

// ---------------------------------------------------------------------------
// Embedded-script strategy
// ---------------------------------------------------------------------------

/// Items arrive as a `window.<var> = …` payload; each handle is one array
/// element re-serialized as JSON. Field selectors are dot-paths into the
/// object.
pub struct ScriptStrategy {
    var: &'static str,
    fields: &'static [(&'static str, &'static str)],
}

impl ScriptStrategy {
    pub fn new(profile: &'static SiteProfile, var: &'static str) -> Self {
        Self {
            var,
            fields: profile.listing.fields,
        }
    }

    fn field(&self, object: &Value, name: &str) -> Option<String> {
        let path = self.fields.iter().find(|(n, _)| *n == name)?.1;
        value_at(object, path).and_then(scalar_to_string)
    }
}

impl ExtractionStrategy for ScriptStrategy {
    fn handles(&self, html: &str) -> Vec<String> {
        match script_payload(html, self.var) {
            Some(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
            Some(other) => {
                debug!(var = self.var, payload = %other, "Script payload is not an array");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn probe(&self, handle: &str) -> ItemProbe {
        let Ok(object) = serde_json::from_str::<Value>(handle) else {
            return ItemProbe::default();
        };
        ItemProbe {
            item_id: self.field(&object, "id"),
            scheduled_date: self.field(&object, "scheduled_date"),
            status: self.field(&object, "status"),
        }
    }

    fn extract(&self, handle: &str) -> Option<RawItem> {
        let object = serde_json::from_str::<Value>(handle).ok()?;
        let mut item = RawItem::default();
        for (name, _) in self.fields {
            if let Some(value) = self.field(&object, name) {
                item.insert(name, value);
            }
        }
        // Unmapped scalar fields ride along for the site-specific
        // metadata map.
        if let Value::Object(map) = &object {
            for (key, value) in map {
                if self.fields.iter().any(|(_, path)| path == key) {
                    continue;
                }
                if let Some(scalar) = scalar_to_string(value) {
                    item.insert(key, scalar);
                }
            }
        }
        Some(item)
    }
}

fn value_at<'a>(object: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = object;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Script payload parsing
// ---------------------------------------------------------------------------

static JSON_PARSE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"JSON\.parse\(\s*'((?:[^'\\]|\\.)*)'\s*\)"#).expect("valid regex")
});

static TEMPLATE_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`]*`").expect("valid regex"));

/// Locate and parse a `window.<var> = …` assignment in the page's scripts.
///
/// Two shapes are handled: `JSON.parse('…')` (unescape the literal, parse
/// as JSON) and a raw object/array literal (resolve nested `JSON.parse`
/// substrings, blank out template literals, then parse as JSON — the
/// payload is never evaluated as code). Any failure returns `None`; the
/// raw payload is logged for offline inspection instead of guessed at.
pub fn script_payload(html: &str, var: &str) -> Option<Value> {
    let document = Html::parse_document(html);
    let script_selector = Selector::parse("script").expect("valid selector");
    let assignment =
        Regex::new(&format!(r"window\.{}\s*=\s*", regex::escape(var))).expect("valid regex");

    for script in document.select(&script_selector) {
        let body = script.text().collect::<String>();
        let Some(found) = assignment.find(&body) else {
            continue;
        };
        let rest = &body[found.end()..];

        let trimmed = rest.trim_start();
        if trimmed.starts_with("JSON.parse(") {
            return parse_json_parse_literal(trimmed).or_else(|| {
                debug!(var, payload = trimmed, "Unparseable JSON.parse payload");
                None
            });
        }

        let Some(literal) = literal_span(rest) else {
            debug!(var, payload = rest, "No object or array literal after assignment");
            return None;
        };
        return parse_object_literal(literal).or_else(|| {
            debug!(var, payload = literal, "Unparseable script object literal");
            None
        });
    }

    None
}

/// `'…'` argument of a JSON.parse call: unescape, then parse.
fn parse_json_parse_literal(call: &str) -> Option<Value> {
    let captures = JSON_PARSE_CALL.captures(call)?;
    let unescaped = unescape_js(captures.get(1)?.as_str());
    serde_json::from_str(&unescaped).ok()
}

/// Raw-literal variant: substitute nested JSON.parse calls with their
/// parsed-and-reserialized value, blank template literals, parse the rest
/// with a JSON parser only.
fn parse_object_literal(literal: &str) -> Option<Value> {
    let mut text = literal.to_string();

    // Nested JSON.parse('…') substrings resolve innermost-first because
    // each replacement round reserializes to plain JSON.
    loop {
        let Some(captures) = JSON_PARSE_CALL.captures(&text) else {
            break;
        };
        let range = captures.get(0)?.range();
        let unescaped = unescape_js(captures.get(1)?.as_str());
        let value: Value = serde_json::from_str(&unescaped).ok()?;
        let serialized = value.to_string();
        text.replace_range(range, &serialized);
    }

    let text = TEMPLATE_LITERAL.replace_all(&text, "\"\"");
    serde_json::from_str(&text).ok()
}

/// Span of the `{…}` or `[…]` literal starting at the front of `rest`,
/// tracking strings and escapes so braces inside values don't end the
/// scan early.
fn literal_span(rest: &str) -> Option<&str> {
    let trimmed_start = rest.len() - rest.trim_start().len();
    let text = &rest[trimmed_start..];
    let mut chars = text.char_indices();
    let first = text.chars().next()?;
    if first != '{' && first != '[' {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (i, c) in chars.by_ref() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => in_string = Some(c),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Unescape a single-quoted JavaScript string literal's body.
fn unescape_js(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&code);
                    }
                }
            }
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TEST_SITE;

    fn page(body: &str) -> String {
        format!("<html><head><script>{body}</script></head><body></body></html>")
    }

    #[test]
    fn json_parse_payload_round_trips() {
        let html = page(r#"window.items = JSON.parse('[{"a":1}]');"#);
        let value = script_payload(&html, "items").unwrap();
        assert_eq!(value, serde_json::json!([{ "a": 1 }]));
    }

    #[test]
    fn escaped_json_parse_payload_unescapes() {
        let html = page(r#"window.items = JSON.parse('[{\"title\":\"Chrono \\u00e9dition\"}]');"#);
        let value = script_payload(&html, "items").unwrap();
        assert_eq!(value[0]["title"], "Chrono \u{e9}dition");
    }

    #[test]
    fn truncated_payload_yields_none() {
        let html = page(r#"window.items = JSON.parse('[{"a":1}"#);
        assert!(script_payload(&html, "items").is_none());
    }

    #[test]
    fn raw_literal_with_nested_parse_and_template() {
        let html = page(
            r#"window.items = [{"id": "9", "config": JSON.parse('{"limit":150}'), "banner": `new
arrivals`}];"#,
        );
        let value = script_payload(&html, "items").unwrap();
        assert_eq!(value[0]["id"], "9");
        assert_eq!(value[0]["config"]["limit"], 150);
        assert_eq!(value[0]["banner"], "");
    }

    #[test]
    fn missing_variable_yields_none() {
        let html = page(r#"window.other = JSON.parse('[]');"#);
        assert!(script_payload(&html, "items").is_none());
    }

    #[test]
    fn literal_span_ignores_braces_inside_strings() {
        let rest = r#"[{"note": "a } b"}]; window.next = 1;"#;
        assert_eq!(literal_span(rest), Some(r#"[{"note": "a } b"}]"#));
    }

    #[test]
    fn dom_strategy_missing_field_is_absent_not_error() {
        let strategy = DomStrategy::new(&TEST_SITE);
        let html = r#"
            <html><body>
            <div class="lot"><a class="lot-link" data-id="41">Omega Seamaster</a>
                <span class="price">¥12,000</span></div>
            <div class="lot"><a class="lot-link" data-id="42">No price here</a></div>
            </body></html>"#;

        let handles = strategy.handles(html);
        assert_eq!(handles.len(), 2);

        let full = strategy.extract(&handles[0]).unwrap();
        assert_eq!(full.get("id"), Some("41"));
        assert_eq!(full.get("title"), Some("Omega Seamaster"));
        assert_eq!(full.get("starting_price"), Some("¥12,000"));

        let partial = strategy.extract(&handles[1]).unwrap();
        assert_eq!(partial.get("id"), Some("42"));
        assert_eq!(partial.get("starting_price"), None);
    }

    #[test]
    fn script_strategy_maps_fields_and_keeps_extras() {
        let strategy = ScriptStrategy::new(&crate::profiles::PELICAN, "items");
        let html = page(
            r#"window.items = JSON.parse('[{"item_id":"77","title":"Birkin 30","start_price":220000,"lot_no":"A-12"}]');"#,
        );

        let handles = strategy.handles(&html);
        assert_eq!(handles.len(), 1);

        let probe = strategy.probe(&handles[0]);
        assert_eq!(probe.item_id.as_deref(), Some("77"));

        let item = strategy.extract(&handles[0]).unwrap();
        assert_eq!(item.get("title"), Some("Birkin 30"));
        assert_eq!(item.get("starting_price"), Some("220000"));
        assert_eq!(item.get("lot_no"), Some("A-12"));
    }

    #[test]
    fn malformed_handle_probes_empty() {
        let strategy = ScriptStrategy::new(&crate::profiles::PELICAN, "items");
        assert_eq!(strategy.probe("{not json"), ItemProbe::default());
    }
}
