//! Minimal XML element-tree reader and writer for probe documents.
//!
//! Covers the subset the probe schema uses: elements, attributes, text,
//! comments, the XML declaration, CDATA, self-closing tags and the
//! predefined entities. Parse errors carry the byte offset they were
//! detected at.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    pub pos: usize,
    pub reason: String,
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XML error at byte {}: {}", self.pos, self.reason)
    }
}

impl std::error::Error for XmlError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data directly inside this element, trimmed.
    pub text: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of a direct child element, if the child exists.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Parse a complete document and return its root element.
    pub fn parse(input: &str) -> Result<Element, XmlError> {
        let mut p = Parser {
            data: input.as_bytes(),
            pos: 0,
        };
        p.skip_misc()?;
        let root = p.parse_element()?;
        p.skip_misc()?;
        if p.pos < p.data.len() {
            return Err(p.err("trailing content after document root"));
        }
        Ok(root)
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: &str) -> XmlError {
        XmlError {
            pos: self.pos,
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.data[self.pos..].starts_with(s.as_bytes())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    // Whitespace, the XML declaration, processing instructions, comments
    // and DOCTYPE, in any order, outside the root element.
    fn skip_misc(&mut self) -> Result<(), XmlError> {
        loop {
            self.skip_whitespace();
            if self.starts_with("<?") {
                self.skip_until("?>")?;
            } else if self.starts_with("<!--") {
                self.skip_until("-->")?;
            } else if self.starts_with("<!DOCTYPE") {
                self.skip_until(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_until(&mut self, end: &str) -> Result<(), XmlError> {
        match self.data[self.pos..]
            .windows(end.len())
            .position(|w| w == end.as_bytes())
        {
            Some(off) => {
                self.pos += off + end.len();
                Ok(())
            }
            None => Err(self.err("unterminated markup")),
        }
    }

    fn parse_name(&mut self) -> Result<String, XmlError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b':') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.data[start..self.pos]).into_owned())
    }

    fn parse_element(&mut self) -> Result<Element, XmlError> {
        if self.peek() != Some(b'<') {
            return Err(self.err("expected element start"));
        }
        self.pos += 1;
        let name = self.parse_name()?;
        let mut element = Element {
            name,
            ..Element::default()
        };

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') => {
                    self.pos += 1;
                    if self.peek() != Some(b'>') {
                        return Err(self.err("malformed self-closing tag"));
                    }
                    self.pos += 1;
                    return Ok(element);
                }
                Some(_) => {
                    let key = self.parse_name()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b'=') {
                        return Err(self.err("expected '=' in attribute"));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = match self.peek() {
                        Some(q @ (b'"' | b'\'')) => q,
                        _ => return Err(self.err("expected quoted attribute value")),
                    };
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().map(|c| c != quote).unwrap_or(false) {
                        self.pos += 1;
                    }
                    if self.peek() != Some(quote) {
                        return Err(self.err("unterminated attribute value"));
                    }
                    let raw = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
                    self.pos += 1;
                    element.attributes.push((key, unescape(&raw, start)?));
                }
                None => return Err(self.err("unterminated start tag")),
            }
        }

        // Content until the matching end tag.
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated element")),
                Some(b'<') => {
                    if self.starts_with("</") {
                        self.pos += 2;
                        let end_name = self.parse_name()?;
                        if end_name != element.name {
                            return Err(self.err("mismatched end tag"));
                        }
                        self.skip_whitespace();
                        if self.peek() != Some(b'>') {
                            return Err(self.err("malformed end tag"));
                        }
                        self.pos += 1;
                        element.text = text.trim().to_string();
                        return Ok(element);
                    } else if self.starts_with("<!--") {
                        self.skip_until("-->")?;
                    } else if self.starts_with("<![CDATA[") {
                        self.pos += "<![CDATA[".len();
                        let start = self.pos;
                        self.skip_until("]]>")?;
                        text.push_str(&String::from_utf8_lossy(
                            &self.data[start..self.pos - "]]>".len()],
                        ));
                    } else if self.starts_with("<?") {
                        self.skip_until("?>")?;
                    } else {
                        element.children.push(self.parse_element()?);
                    }
                }
                Some(_) => {
                    let start = self.pos;
                    while self.peek().map(|c| c != b'<').unwrap_or(false) {
                        self.pos += 1;
                    }
                    let raw = String::from_utf8_lossy(&self.data[start..self.pos]).into_owned();
                    text.push_str(&unescape(&raw, start)?);
                }
            }
        }
    }
}

fn unescape(raw: &str, at: usize) -> Result<String, XmlError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest.find(';').ok_or(XmlError {
            pos: at,
            reason: "unterminated entity reference".to_string(),
        })?;
        let entity = &rest[1..end];
        match entity {
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "amp" => out.push('&'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|h| u32::from_str_radix(h, 16))
                    .or_else(|| entity.strip_prefix('#').map(|d| d.parse::<u32>()))
                    .and_then(|r| r.ok())
                    .and_then(char::from_u32);
                match code {
                    Some(c) => out.push(c),
                    None => {
                        return Err(XmlError {
                            pos: at,
                            reason: format!("unknown entity '&{entity};'"),
                        })
                    }
                }
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Indented document writer used when serializing the registry back to
/// probe-document form.
#[derive(Default)]
pub struct XmlWriter {
    out: String,
    depth: usize,
    stack: Vec<String>,
}

impl XmlWriter {
    pub fn new() -> XmlWriter {
        XmlWriter::default()
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    pub fn open(&mut self, name: &str) -> &mut Self {
        self.open_with(name, &[])
    }

    pub fn open_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> &mut Self {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        for (k, v) in attrs {
            self.out.push(' ');
            self.out.push_str(k);
            self.out.push_str("=\"");
            self.out.push_str(&escape(v));
            self.out.push('"');
        }
        self.out.push_str(">\n");
        self.depth += 1;
        self.stack.push(name.to_string());
        self
    }

    pub fn close(&mut self) -> &mut Self {
        let name = self.stack.pop().unwrap_or_default();
        self.depth -= 1;
        self.indent();
        self.out.push_str("</");
        self.out.push_str(&name);
        self.out.push_str(">\n");
        self
    }

    pub fn leaf(&mut self, name: &str, text: &str) -> &mut Self {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
        self.out.push_str(&escape(text));
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let doc = r#"<?xml version="1.0"?>
            <agent>
              <!-- probes -->
              <events>
                <event id="demo.event1">
                  <label>Event &amp; 1</label>
                </event>
              </events>
            </agent>"#;
        let root = Element::parse(doc).unwrap();
        assert_eq!(root.name, "agent");
        let event = root.child("events").unwrap().child("event").unwrap();
        assert_eq!(event.attr("id"), Some("demo.event1"));
        assert_eq!(event.child_text("label"), Some("Event & 1"));
    }

    #[test]
    fn rejects_non_xml() {
        assert!(Element::parse("").is_err());
        assert!(Element::parse("This is not an XML string").is_err());
        assert!(Element::parse("<a><b></a></b>").is_err());
        assert!(Element::parse("<a attr=oops></a>").is_err());
        assert!(Element::parse("<a></a><b></b>").is_err());
    }

    #[test]
    fn self_closing_and_numeric_entities() {
        let root = Element::parse("<m><name/><desc>&#65;&#x42;</desc></m>").unwrap();
        assert!(root.child("name").unwrap().text.is_empty());
        assert_eq!(root.child_text("desc"), Some("AB"));
    }

    #[test]
    fn writer_output_reparses() {
        let mut w = XmlWriter::new();
        w.open("agent");
        w.open_with("event", &[("id", "a<b")]);
        w.leaf("label", "x & y");
        w.close();
        w.close();
        let doc = w.finish();
        let root = Element::parse(&doc).unwrap();
        assert_eq!(root.child("event").unwrap().attr("id"), Some("a<b"));
        assert_eq!(root.child("event").unwrap().child_text("label"), Some("x & y"));
    }
}
