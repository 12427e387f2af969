//! Owned XML element tree built on quick-xml.
//!
//! OAI-PMH payloads re-use common element names (`identifier`, `header`) at
//! several nesting levels, so navigation distinguishes immediate children
//! from arbitrary descendants. Elements keep their attributes verbatim,
//! including `xmlns` declarations, so fragments can be re-serialized with
//! inherited namespace bindings.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

/// The reserved XML namespace; its binding is implicit on every element.
pub const XML_NAMESPACE_URI: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// One XML element with attributes and ordered children.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Qualified name as written (`prefix:local` or `local`).
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Attribute value by exact qualified name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Immediate element children matching `local` (non-recursive).
    pub fn child_elements<'a, 'b: 'a>(
        &'a self,
        local: &'b str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter_map(move |node| match node {
            Node::Element(el) if el.local_name() == local => Some(el),
            _ => None,
        })
    }

    /// First immediate element child matching `local`.
    pub fn first_child<'a>(&'a self, local: &'a str) -> Option<&'a Element> {
        self.child_elements(local).next()
    }

    /// First immediate element child of any name.
    pub fn first_element_child(&self) -> Option<&Element> {
        self.children.iter().find_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    /// First descendant (depth-first, self excluded) with the local name.
    pub fn first_descendant(&self, local: &str) -> Option<&Element> {
        for node in &self.children {
            if let Node::Element(el) = node {
                if el.local_name() == local {
                    return Some(el);
                }
                if let Some(found) = el.first_descendant(local) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }

    /// Namespace declarations carried directly on this element.
    pub fn namespace_declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .filter(|(k, _)| k.as_str() == "xmlns" || k.starts_with("xmlns:"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize this element and its subtree to a string.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }

    fn serialize_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(&escape(t.as_str())),
                Node::Element(el) => el.serialize_into(out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Fold the namespace declarations of `el` into `scope`; a nearer
/// declaration replaces an outer one for the same prefix.
pub fn merge_namespace_scope(scope: &mut Vec<(String, String)>, el: &Element) {
    for (name, value) in el.namespace_declarations() {
        if let Some(slot) = scope.iter_mut().find(|(n, _)| n.as_str() == name) {
            slot.1 = value.to_string();
        } else {
            scope.push((name.to_string(), value.to_string()));
        }
    }
}

/// Copy in-scope namespace bindings onto a fragment root so the serialized
/// fragment stands alone. The reserved `xml` namespace is skipped, as is any
/// binding the element already declares itself.
pub fn with_inherited_namespaces(el: &Element, scope: &[(String, String)]) -> Element {
    let mut out = el.clone();
    for (name, value) in scope {
        if name.as_str() == "xmlns:xml" || value.as_str() == XML_NAMESPACE_URI {
            continue;
        }
        if out.attr(name).is_none() {
            out.attributes.push((name.clone(), value.clone()));
        }
    }
    out
}

/// Parse a complete document into its root element.
pub fn parse(text: &str) -> Result<Element, String> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if root.is_some() {
                    return Err("content after document element".into());
                }
                stack.push(element_from(&start)?);
            }
            Ok(Event::Empty(start)) => {
                if root.is_some() {
                    return Err("content after document element".into());
                }
                let el = element_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => root = Some(el),
                }
            }
            Ok(Event::End(_)) => {
                let el = stack.pop().ok_or("unbalanced end tag")?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => root = Some(el),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| e.to_string())?;
                    parent.children.push(Node::Text(text.into_owned()));
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                    parent.children.push(Node::Text(text));
                }
            }
            Ok(Event::Eof) => break,
            // Declarations, comments, PIs, doctype carry no record content.
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }

    if !stack.is_empty() {
        return Err("unclosed element at end of document".into());
    }
    root.ok_or_else(|| "document has no root element".into())
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| e.to_string())?
            .into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}
