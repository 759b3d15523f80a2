//! Permissive RSS / Atom / RDF parser.
//!
//! The document is read into a small element tree with `quick-xml`, then walked
//! depth-first once. The walk carries a [`WalkState`] with two region flags
//! (header, entry) and the detected [`Dialect`]; every element is visited,
//! whether or not it produced a field, because the dialects nest data-bearing
//! elements differently.
//!
//! Missing or odd elements leave the corresponding field empty. Only a document
//! that is not well-formed XML, or one nested deeper than [`MAX_ELEMENT_DEPTH`],
//! fails as a whole.

use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::{Article, ARTICLE_DATE_FORMAT, UNKNOWN_ARTICLE_DATE};

/// SEC-003: Maximum element nesting depth accepted by the parser.
pub const MAX_ELEMENT_DEPTH: usize = 256;

const NS_ATOM_03: &str = "http://purl.org/atom/ns#";
const NS_ATOM_10: &str = "http://www.w3.org/2005/Atom";

/// Character entities every document may use without declaring them.
const CUSTOM_ENTITIES: &[(&str, &str)] = &[("Uuml", "Ü")];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    Xml(String),

    /// SEC-003: Nesting depth exceeds safety limit.
    #[error("XML nesting depth exceeds maximum of {0} levels")]
    TooDeep(usize),
}

/// Syndication format detected from the root element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    #[default]
    Unknown,
    Rss091,
    Rss092,
    Rss094,
    Rss10,
    Rss20,
    /// Atom 0.3 in the `http://purl.org/atom/ns#` namespace.
    Atom03,
    /// Atom 0.3 identified only by `version="0.3"`.
    Atom03NoNamespace,
    Atom10,
    Rdf,
}

/// Canonical feed produced by [`parse_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub dialect: Dialect,
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: String,
    pub language: String,
    pub generator: String,
    pub update_period: String,
    pub update_frequency: String,
    pub articles: Vec<ParsedArticle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArticle {
    pub title: String,
    pub link: String,
    /// `description`
    pub summary: String,
    /// `content:encoded`, or Atom `summary`
    pub body: String,
    /// Publication date exactly as the document wrote it.
    pub published: String,
    pub guid: String,
    pub guid_is_permalink: bool,
    pub creator: String,
}

impl ParsedArticle {
    /// Convert to the storable article model for `feed_name`.
    ///
    /// The publication date is normalized with [`normalize_article_date`];
    /// `inserted_at` is the import timestamp.
    pub fn into_article(self, feed_name: &str, inserted_at: &str) -> Article {
        Article {
            id: 0,
            feed_name: feed_name.to_string(),
            published_at: normalize_article_date(&self.published),
            url: self.link,
            headline: self.title,
            summary: self.summary,
            body: self.body,
            inserted_at: inserted_at.to_string(),
        }
    }
}

impl ParsedFeed {
    pub fn into_articles(self, feed_name: &str, inserted_at: &str) -> Vec<Article> {
        self.articles
            .into_iter()
            .map(|article| article.into_article(feed_name, inserted_at))
            .collect()
    }
}

/// Render a feed's publication date in the sortable `YYYY-MM-DD HH:MM:SSZ` form.
///
/// Dates with an offset (RFC 2822, RFC 3339, or ISO 8601 with a `+hhmm`
/// offset) are converted to UTC. Offset-less
/// `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DD` values are taken as UTC. Anything else
/// yields [`UNKNOWN_ARTICLE_DATE`].
pub fn normalize_article_date(raw: &str) -> String {
    let raw = raw.trim();

    let parsed = DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        });

    match parsed {
        Some(at) => at.format(ARTICLE_DATE_FORMAT).to_string(),
        None => UNKNOWN_ARTICLE_DATE.to_string(),
    }
}

/// Parse a syndication document.
///
/// # Security
///
/// - SEC-002: `quick-xml` 0.37 never expands DTD entities itself. Entities are
///   resolved here from three sources only: the XML built-ins, the fixed
///   [`CUSTOM_ENTITIES`] table (whether or not the document has a DOCTYPE),
///   and literal `<!ENTITY name "value">` declarations in the internal subset. `SYSTEM`/`PUBLIC` entities are never resolved and no
///   DTD is ever fetched. Unresolved references are kept verbatim.
/// - SEC-003: Documents nested deeper than [`MAX_ELEMENT_DEPTH`] are rejected.
pub fn parse_document(xml: &str) -> Result<ParsedFeed, ParseError> {
    let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
    let root = build_tree(xml)?;

    let mut feed = ParsedFeed::default();
    let mut state = WalkState::default();
    walk(&root, &mut state, &mut feed);
    feed.dialect = state.dialect;

    tracing::debug!(
        dialect = ?feed.dialect,
        articles = feed.articles.len(),
        "Parsed feed document"
    );
    Ok(feed)
}

// ============================================================================
// Walk
// ============================================================================

/// Region flags and dialect carried through one parse.
///
/// Once an `item`/`entry` has been seen the entry flag stays set for the rest
/// of the document, so a late `channel` never reopens the header.
#[derive(Debug, Default)]
struct WalkState {
    in_header: bool,
    in_entry: bool,
    dialect: Dialect,
}

fn walk(element: &Element, state: &mut WalkState, feed: &mut ParsedFeed) {
    match element.name.as_str() {
        "feed" if !state.in_entry => {
            state.in_header = true;
            state.dialect = detect_atom_dialect(element);
        }
        "rss" if !state.in_entry => {
            state.in_header = true;
            if let Some(dialect) = detect_rss_dialect(element) {
                state.dialect = dialect;
            }
        }
        "RDF" if !state.in_entry => {
            state.in_header = true;
            state.dialect = Dialect::Rdf;
        }
        "channel" if !state.in_entry => state.in_header = true,
        "item" | "entry" => {
            state.in_header = false;
            state.in_entry = true;
            feed.articles.push(ParsedArticle::default());
        }
        name => apply_field(name, element, state, feed),
    }

    for child in element.child_elements() {
        walk(child, state, feed);
    }
}

fn apply_field(name: &str, element: &Element, state: &WalkState, feed: &mut ParsedFeed) {
    if state.in_entry {
        let Some(article) = feed.articles.last_mut() else {
            return;
        };
        match name {
            "title" => article.title = element.inner_text(),
            "link" | "id" => {
                let text = element.inner_text();
                article.link = if text.is_empty() {
                    element.first_href().unwrap_or_default().to_string()
                } else {
                    text
                };
            }
            "description" => article.summary = element.inner_text(),
            "pubDate" | "lastBuildDate" | "date" => article.published = element.inner_text(),
            "guid" => {
                let text = element.inner_text();
                if article.link.trim().is_empty() {
                    article.link = text.clone();
                }
                // Compares the element's own text, not the attribute value.
                // Unresolved: the literal reading compares an always-empty element
                // value and so never sets the flag. See DESIGN.md before changing.
                if element.attribute("isPermaLink").is_some() {
                    article.guid_is_permalink = text == "true";
                }
                article.guid = text;
            }
            "creator" => article.creator = element.inner_text(),
            "encoded" | "summary" => article.body = element.inner_text(),
            _ => {}
        }
    } else if state.in_header {
        match name {
            "title" => feed.title = element.inner_text(),
            "link" | "id" => feed.link = element.inner_text(),
            "description" => feed.description = element.inner_text(),
            "pubDate" | "lastBuildDate" | "date" => feed.published = element.inner_text(),
            "language" => feed.language = element.inner_text(),
            "generator" => feed.generator = element.inner_text(),
            "updatePeriod" => feed.update_period = element.inner_text(),
            "updateFrequency" => feed.update_frequency = element.inner_text(),
            _ => {}
        }
    }
}

fn detect_atom_dialect(element: &Element) -> Dialect {
    match element.namespace.as_deref() {
        Some(NS_ATOM_03) => Dialect::Atom03,
        Some(NS_ATOM_10) => Dialect::Atom10,
        _ => match element.attribute("version") {
            Some("0.3") => Dialect::Atom03NoNamespace,
            _ => Dialect::Atom10,
        },
    }
}

fn detect_rss_dialect(element: &Element) -> Option<Dialect> {
    match element.attribute("version")? {
        "0.91" => Some(Dialect::Rss091),
        "0.92" => Some(Dialect::Rss092),
        "0.94" => Some(Dialect::Rss094),
        "1.0" => Some(Dialect::Rss10),
        "2.0" => Some(Dialect::Rss20),
        _ => None,
    }
}

// ============================================================================
// Element tree
// ============================================================================

#[derive(Debug, Default)]
struct Element {
    /// Local name (`content:encoded` is stored as `encoded`).
    name: String,
    namespace: Option<String>,
    /// Attributes by local name.
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn first_href(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, value)| key == "href" && !value.trim().is_empty())
            .map(|(_, value)| value.as_str())
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// All descendant text, concatenated and trimmed.
    fn inner_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_string()
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => element.collect_text(out),
            }
        }
    }
}

/// An element still waiting for its end tag, with the namespace prefixes it declares.
struct OpenElement {
    element: Element,
    prefixes: Vec<(String, String)>,
}

fn build_tree(xml: &str) -> Result<Element, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut entities = EntityTable::default();
    let mut open: Vec<OpenElement> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::DocType(e)) => entities.declare_from_doctype(&String::from_utf8_lossy(&e)),
            Ok(Event::Start(e)) => {
                // SEC-003: Reject excessively nested documents
                if open.len() >= MAX_ELEMENT_DEPTH {
                    return Err(ParseError::TooDeep(MAX_ELEMENT_DEPTH));
                }
                let opened = open_element(&e, &open, &entities);
                open.push(opened);
            }
            Ok(Event::Empty(e)) => {
                if open.len() >= MAX_ELEMENT_DEPTH {
                    return Err(ParseError::TooDeep(MAX_ELEMENT_DEPTH));
                }
                let element = open_element(&e, &open, &entities).element;
                attach(&mut open, &mut root, element);
            }
            Ok(Event::End(_)) => {
                if let Some(closed) = open.pop() {
                    attach(&mut open, &mut root, closed.element);
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(parent) = open.last_mut() {
                    let text = entities.expand(&String::from_utf8_lossy(&e));
                    parent.element.children.push(Node::Text(text));
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(parent) = open.last_mut() {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    parent.element.children.push(Node::Text(text));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(unclosed) = open.last() {
        return Err(ParseError::Xml(format!(
            "unexpected end of document inside <{}>",
            unclosed.element.name
        )));
    }
    root.ok_or_else(|| ParseError::Xml("document has no root element".to_string()))
}

fn attach(open: &mut [OpenElement], root: &mut Option<Element>, element: Element) {
    match open.last_mut() {
        Some(parent) => parent.element.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => tracing::debug!(element = %element.name, "Ignoring element after document root"),
    }
}

fn open_element(e: &BytesStart<'_>, open: &[OpenElement], entities: &EntityTable) -> OpenElement {
    let qualified = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let (prefix, local) = split_qualified(&qualified);

    let mut attributes = Vec::new();
    let mut prefixes = Vec::new();
    let mut attrs = e.attributes();
    attrs.with_checks(false);
    for attr_result in attrs {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = entities.expand(&String::from_utf8_lossy(&attr.value));

        if key == "xmlns" {
            prefixes.push((String::new(), value));
        } else if let Some(declared) = key.strip_prefix("xmlns:") {
            prefixes.push((declared.to_string(), value));
        } else {
            let (_, local_key) = split_qualified(&key);
            attributes.push((local_key.to_string(), value));
        }
    }

    let namespace = prefixes
        .iter()
        .rev()
        .chain(open.iter().rev().flat_map(|o| o.prefixes.iter().rev()))
        .find(|(declared, _)| declared == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty());

    OpenElement {
        element: Element {
            name: local.to_string(),
            namespace,
            attributes,
            children: Vec::new(),
        },
        prefixes,
    }
}

fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", name),
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Literal general entities: the [`CUSTOM_ENTITIES`] table, overridden by any
/// declarations in the document's internal subset.
#[derive(Debug)]
struct EntityTable {
    declared: HashMap<String, String>,
}

impl Default for EntityTable {
    fn default() -> Self {
        let declared = CUSTOM_ENTITIES
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Self { declared }
    }
}

impl EntityTable {
    fn declare_from_doctype(&mut self, doctype: &str) {
        const MARKER: &str = "<!ENTITY";
        let mut rest = doctype;
        while let Some(start) = rest.find(MARKER) {
            rest = &rest[start + MARKER.len()..];
            let end = rest.find('>').unwrap_or(rest.len());
            if let Some((name, value)) = parse_entity_declaration(&rest[..end]) {
                self.declared.insert(name, value);
            }
            rest = &rest[end..];
        }
    }

    fn resolve(&self, name: &str) -> Option<&str> {
        resolve_predefined_entity(name).or_else(|| self.declared.get(name).map(String::as_str))
    }

    /// Replace entity and character references in raw text.
    ///
    /// Replacement text is never rescanned.
    fn expand(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            let after = &rest[amp + 1..];
            let Some(semi) = after.find(';') else {
                out.push_str(&rest[amp..]);
                return out;
            };
            let name = &after[..semi];
            match self.resolve_reference(name) {
                Some(replacement) => out.push_str(&replacement),
                None => {
                    out.push('&');
                    out.push_str(name);
                    out.push(';');
                }
            }
            rest = &after[semi + 1..];
        }

        out.push_str(rest);
        out
    }

    fn resolve_reference(&self, name: &str) -> Option<Cow<'_, str>> {
        if let Some(number) = name.strip_prefix('#') {
            let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            return char::from_u32(code).map(|c| Cow::Owned(c.to_string()));
        }
        self.resolve(name).map(Cow::Borrowed)
    }
}

/// `Uuml "Ü"` from `<!ENTITY Uuml "Ü">`; `None` for parameter and external entities.
fn parse_entity_declaration(decl: &str) -> Option<(String, String)> {
    let decl = decl.trim_start();
    if decl.starts_with('%') {
        return None;
    }
    let name_end = decl.find(char::is_whitespace)?;
    let (name, rest) = decl.split_at(name_end);
    let rest = rest.trim_start();

    // SYSTEM and PUBLIC identifiers are never dereferenced
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &rest[quote.len_utf8()..];
    let close = body.find(quote)?;
    let value = EntityTable::default().expand(&body[..close]);
    Some((name.to_string(), value))
}
