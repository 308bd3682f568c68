//! Generic XML element tree on top of xml-rs
//!
//! The document codec maps this tree to the database model. Elements the
//! model does not understand are kept as `XmlNode`s and written back as-is.

use super::MAX_ELEMENT_DEPTH;
use crate::error::{Error, Result};
use std::io::Write;
use xml::common::XmlVersion;
use xml::reader::{EventReader, ParserConfig, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriteEvent};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// An XML element with its attributes, text and child elements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Character data; only meaningful for elements without children
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Leaf element holding `text`
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: XmlNode) {
        self.children.push(child);
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Parse a complete document and return its root element
    pub fn parse(data: &[u8]) -> Result<XmlNode> {
        let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);

        let config = ParserConfig::new()
            .trim_whitespace(false)
            .whitespace_to_characters(true)
            .cdata_to_characters(true)
            .ignore_comments(true);
        let reader = EventReader::new_with_config(data, config);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root = None;

        for event in reader {
            let event = event.map_err(|e| Error::document(path_of(&stack), e.to_string()))?;
            match event {
                ReadEvent::StartElement {
                    name, attributes, ..
                } => {
                    if root.is_some() {
                        return Err(Error::document(
                            name.local_name,
                            "element after document root",
                        ));
                    }
                    if stack.len() >= MAX_ELEMENT_DEPTH {
                        let top = stack.first().map_or("/", |n| n.name.as_str());
                        return Err(Error::document(
                            top,
                            format!("elements nested deeper than {}", MAX_ELEMENT_DEPTH),
                        ));
                    }
                    let mut node = XmlNode::new(name.local_name);
                    node.attributes = attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect();
                    stack.push(node);
                }
                ReadEvent::EndElement { .. } => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::document("/", "unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                ReadEvent::Characters(text) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&text);
                    }
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::document(path_of(&stack), "unclosed element"));
        }
        root.ok_or_else(|| Error::document("/", "empty document"))
    }

    /// Serialize as a standalone UTF-8 document
    pub fn write_document<W: Write>(&self, out: W) -> Result<()> {
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .indent_string("\t")
            .create_writer(out);
        writer.write(WriteEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: Some(true),
        })?;
        self.write_element(&mut writer)
    }

    fn write_element<W: Write>(&self, writer: &mut EventWriter<W>) -> Result<()> {
        let mut start = WriteEvent::start_element(self.name.as_str());
        for (key, value) in &self.attributes {
            start = start.attr(key.as_str(), value.as_str());
        }
        writer.write(start)?;

        if self.children.is_empty() {
            if !self.text.is_empty() {
                writer.write(WriteEvent::characters(&self.text))?;
            }
        } else {
            for child in &self.children {
                child.write_element(writer)?;
            }
        }

        writer.write(WriteEvent::end_element())?;
        Ok(())
    }
}

fn path_of(stack: &[XmlNode]) -> String {
    if stack.is_empty() {
        return "/".to_string();
    }
    stack
        .iter()
        .map(|n| n.name.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_leaf_whitespace() {
        let doc = XmlNode::parse(b"<a>\n  <b x=\"1\">  spaced  </b>\n  <c/>\n</a>").unwrap();
        assert_eq!(doc.name, "a");
        assert_eq!(doc.children.len(), 2);
        let b = doc.child("b").unwrap();
        assert_eq!(b.text, "  spaced  ");
        assert_eq!(b.attr("x"), Some("1"));
        assert_eq!(doc.child("c").unwrap().text, "");
    }

    #[test]
    fn test_write_then_parse() {
        let doc = XmlNode::new("Root")
            .with_child(XmlNode::text("Value", "a < b & \"c\"").with_attr("Protected", "True"))
            .with_child(XmlNode::new("Empty"))
            .with_child(XmlNode::new("Nested").with_child(XmlNode::text("Leaf", " x ")));

        let mut out = Vec::new();
        doc.write_document(&mut out).unwrap();
        let parsed = XmlNode::parse(&out).unwrap();

        assert_eq!(parsed.children.len(), 3);
        assert_eq!(parsed.children[0].text, "a < b & \"c\"");
        assert_eq!(parsed.children[0].attr("Protected"), Some("True"));
        assert_eq!(parsed.children[1].text, "");
        assert_eq!(parsed.children[2].children[0].text, " x ");
    }

    #[test]
    fn test_bom_is_skipped() {
        let mut data = UTF8_BOM.to_vec();
        data.extend_from_slice(b"<a>t</a>");
        assert_eq!(XmlNode::parse(&data).unwrap().text, "t");
    }

    #[test]
    fn test_nesting_limit() {
        let mut doc = String::from("<KeePassFile><Meta>");
        for _ in 0..100_000 {
            doc.push_str("<X>");
        }
        let err = XmlNode::parse(doc.as_bytes()).unwrap_err();
        match err {
            Error::MalformedDocument { path, reason } => {
                assert_eq!(path, "KeePassFile");
                assert!(reason.contains("nested deeper"), "{}", reason);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let depth = MAX_ELEMENT_DEPTH;
        let ok = format!("{}{}", "<X>".repeat(depth), "</X>".repeat(depth));
        assert!(XmlNode::parse(ok.as_bytes()).is_ok());
    }

    #[test]
    fn test_unclosed_element_reports_path() {
        let err = XmlNode::parse(b"<KeePassFile><Root><Group>").unwrap_err();
        match err {
            Error::MalformedDocument { path, .. } => {
                assert!(path.starts_with("KeePassFile"), "{}", path)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
