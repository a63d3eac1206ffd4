//! A minimal XML element tree over `quick-xml`, sufficient for the
//! upstream's envelopes: local-name navigation, attribute access and
//! serialization. The upstream mixes namespace prefixes freely and lies
//! about encodings, so the tree keeps qualified names as written and lookup
//! happens by local name.

use std::borrow::Cow;

use encoding_rs::Encoding;
use quick_xml::{events::Event, Reader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("malformed XML attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("malformed XML escape: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),
    #[error("XML document has no root element")]
    NoRoot,
    #[error("XML document has an unbalanced closing tag")]
    Unbalanced,
}

/// One parsed XML element. Mixed content is not preserved: all direct text
/// is concatenated into `text`, which is all the envelopes need.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    /// Qualified name as written, prefix included.
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    /// The tag name with any namespace prefix stripped.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_prefix, local)) => local,
            None => &self.name,
        }
    }

    /// First child element with the given local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    /// Trimmed text of the child with the given local name.
    pub fn child_text(&self, local: &str) -> Option<&str> {
        self.child(local).map(|c| c.text.trim())
    }

    /// Attribute value by name (exact, attributes are never prefixed here).
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Serialize the element (no XML declaration).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, false);
        out
    }

    /// Serialize the element with the root's attributes dropped. Used to
    /// rewrite a namespace-cluttered `<root xmlns:..=".." ..>` opening tag
    /// down to a plain `<root>`.
    pub fn to_xml_without_root_attrs(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, true);
        out
    }

    fn write_into(&self, out: &mut String, strip_attrs: bool) {
        out.push('<');
        out.push_str(&self.name);
        if !strip_attrs {
            for (key, value) in &self.attributes {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&escape(value));
                out.push('"');
            }
        }

        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        if !self.text.is_empty() {
            out.push_str(&escape(&self.text));
        }
        for child in &self.children {
            child.write_into(out, false);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Full escaping for serialized content, `&` included.
fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(raw);
    }
    let mut escaped = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Parse a document honoring its BOM / declared encoding. The upstream's
/// outer envelope may legitimately arrive in a Cyrillic legacy code page.
pub fn parse_bytes(bytes: &[u8]) -> Result<Element, XmlError> {
    let encoding = Encoding::for_bom(bytes)
        .map(|(encoding, _bom_len)| encoding)
        .or_else(|| sniff_declared_encoding(bytes))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    parse_str(&text)
}

/// Parse a document as UTF-8 regardless of what its declaration claims.
/// The upstream's inner envelopes declare a legacy encoding but are not
/// actually encoded in it once unwrapped.
pub fn parse_str(text: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    // The whole document is one empty element.
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = String::from_utf8_lossy(text.as_ref());
                    let unescaped = quick_xml::escape::unescape(&raw)?;
                    push_text(parent, &unescaped);
                }
            }
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = String::from_utf8_lossy(data.as_ref());
                    parent.text.push_str(&raw);
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(XmlError::Unbalanced)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    // Root closed; trailing content is ignored.
                    None => return Ok(element),
                }
            }
            Event::Eof =>
                return Err(if stack.is_empty() {
                    XmlError::NoRoot
                } else {
                    XmlError::Unbalanced
                }),
            // Declarations, comments, PIs and doctypes carry no content.
            _ => {}
        }
    }
}

fn element_from_start(
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<Element, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        let value = quick_xml::escape::unescape(&raw)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Append a text node, dropping indentation-only whitespace between tags.
fn push_text(parent: &mut Element, unescaped: &str) {
    if unescaped.trim().is_empty() {
        return;
    }
    parent.text.push_str(unescaped);
}

/// Scan the `<?xml ...?>` prolog for a declared encoding. Only
/// ASCII-compatible encodings can be declared this way; UTF-16 variants are
/// caught earlier by their BOM.
fn sniff_declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(256)];
    let head = std::str::from_utf8(head).ok().or_else(|| {
        // A legacy-encoded document may have non-ASCII bytes in the head's
        // tail; the prolog itself is ASCII.
        std::str::from_utf8(&head[..head.iter().position(|b| *b >= 0x80)?])
            .ok()
    })?;

    let prolog_end = head.find("?>").map(|i| i + 2).unwrap_or(head.len());
    let prolog = &head[..prolog_end];
    if !prolog.starts_with("<?xml") {
        return None;
    }

    let after = &prolog[prolog.find("encoding")? + "encoding".len()..];
    let after = after.trim_start().strip_prefix('=')?.trim_start();
    let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &after[1..];
    let label = &rest[..rest.find(quote)?];
    Encoding::for_label(label.as_bytes())
}
