//! Ordered XML element tree used for plist documents.
//!
//! Nodes live in an arena owned by the [`XmlDocument`] and are addressed by
//! [`NodeId`]. Text is stored exactly as it appeared in the source (entities are
//! left escaped) so that exporting an untouched document reproduces its content.
//! Text appended through the API is escaped on the way in.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::util::memchr_null;

/// Index of a node inside an [`XmlDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Text carried by a node.
#[derive(Debug, Clone, Default)]
enum Content {
    #[default]
    Empty,
    /// Escaped character data
    Text(String),
    /// Pre-serialized markup emitted as-is between the node's tags
    Verbatim(Rc<str>),
}

/// A single element.
#[derive(Debug, Clone)]
pub struct XmlNode {
    name: String,
    attributes: Option<String>,
    content: Content,
    children: Vec<NodeId>,
}

impl XmlNode {
    fn new(name: &str, attributes: Option<&str>, content: Content) -> Self {
        Self {
            name: name.to_string(),
            attributes: attributes.map(str::to_string),
            content,
            children: Vec::new(),
        }
    }

    /// Returns the element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw attribute string, if any.
    pub fn attributes(&self) -> Option<&str> {
        self.attributes.as_deref()
    }

    /// Returns the escaped character data of the element.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the child elements in document order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns the value of the named attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        parse_attributes(self.attributes.as_deref()?)
            .find_map(|(key, value)| (key == name).then_some(value))
    }
}

/// An XML document: optional prolog declarations plus one root element.
#[derive(Debug, Clone)]
pub struct XmlDocument {
    prolog: Vec<String>,
    nodes: Vec<XmlNode>,
    root: NodeId,
    references: HashMap<String, NodeId>,
}

impl XmlDocument {
    /// Parses a document from bytes.
    ///
    /// Parsing stops at the first NUL byte, so section contents padded with
    /// zeroes can be passed directly.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bytes = &bytes[..memchr_null(bytes)];
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::plist(e.valid_up_to(), "invalid UTF-8"))?;
        Parser::new(text).parse()
    }

    /// Returns the root element.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node for `id`.
    pub fn node(&self, id: NodeId) -> &XmlNode {
        &self.nodes[id.0]
    }

    /// Returns the number of children of `id`.
    pub fn child_count(&self, id: NodeId) -> usize {
        self.nodes[id.0].children.len()
    }

    /// Returns the child of `id` at `index`.
    pub fn child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[id.0].children.get(index).copied()
    }

    /// Follows an `IDREF` attribute to the node carrying the matching `ID`.
    ///
    /// Nodes without a resolvable reference resolve to themselves.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        let node = self.node(id);
        if !matches!(node.content, Content::Empty) || !node.children.is_empty() {
            return id;
        }
        node.attribute("IDREF")
            .and_then(|reference| self.references.get(reference))
            .copied()
            .unwrap_or(id)
    }

    /// Appends a child element whose text is escaped from `value`.
    pub fn append(
        &mut self,
        parent: NodeId,
        name: &str,
        attributes: Option<&str>,
        value: Option<&str>,
    ) -> Result<NodeId> {
        let content = match value {
            Some(value) => Content::Text(escape(value)),
            None => Content::Empty,
        };
        self.push_child(parent, XmlNode::new(name, attributes, content))
    }

    /// Appends a child element whose body is pre-serialized markup.
    ///
    /// The document keeps a shared reference to `markup`; it is emitted
    /// unchanged between the element's tags on export.
    pub fn append_verbatim(
        &mut self,
        parent: NodeId,
        name: &str,
        markup: Rc<str>,
    ) -> Result<NodeId> {
        self.push_child(parent, XmlNode::new(name, None, Content::Verbatim(markup)))
    }

    fn push_child(&mut self, parent: NodeId, node: XmlNode) -> Result<NodeId> {
        self.nodes
            .try_reserve(1)
            .map_err(|e| Error::out_of_memory("plist node", e))?;
        self.nodes[parent.0]
            .children
            .try_reserve(1)
            .map_err(|e| Error::out_of_memory("plist node", e))?;

        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Serializes the document.
    ///
    /// `skip` strips that many wrapper levels starting from the root: the
    /// prolog is only written when `skip` is zero, and each skipped level
    /// contributes only its body.
    pub fn export(&self, skip: usize) -> Result<String> {
        let with_prolog = skip == 0;
        let mut len = if with_prolog {
            self.prolog.iter().map(|decl| decl.len() + 1).sum()
        } else {
            0
        };
        len += self.exported_len(self.root, skip);

        let mut out = String::new();
        out.try_reserve_exact(len)
            .map_err(|e| Error::out_of_memory("exported plist", e))?;

        if with_prolog {
            for decl in &self.prolog {
                out.push_str(decl);
                out.push('\n');
            }
        }
        self.write_node(self.root, skip, &mut out);
        Ok(out)
    }

    fn exported_len(&self, id: NodeId, skip: usize) -> usize {
        let node = self.node(id);
        let body = match &node.content {
            Content::Empty => 0,
            Content::Text(text) => text.len(),
            Content::Verbatim(markup) => markup.len(),
        } + node
            .children
            .iter()
            .map(|&child| self.exported_len(child, skip.saturating_sub(1)))
            .sum::<usize>();

        if skip > 0 {
            return body;
        }

        let attrs = node.attributes.as_ref().map_or(0, |a| a.len() + 1);
        if body == 0 && node.children.is_empty() {
            // <name attrs/>
            node.name.len() + attrs + 3
        } else {
            // <name attrs>body</name>
            2 * node.name.len() + attrs + 5 + body
        }
    }

    fn write_node(&self, id: NodeId, skip: usize, out: &mut String) {
        let node = self.node(id);
        let empty = node.children.is_empty()
            && match &node.content {
                Content::Empty => true,
                Content::Text(text) => text.is_empty(),
                Content::Verbatim(markup) => markup.is_empty(),
            };

        if skip == 0 {
            out.push('<');
            out.push_str(&node.name);
            if let Some(attrs) = &node.attributes {
                out.push(' ');
                out.push_str(attrs);
            }
            if empty {
                out.push_str("/>");
                return;
            }
            out.push('>');
        }

        match &node.content {
            Content::Empty => {}
            Content::Text(text) => out.push_str(text),
            Content::Verbatim(markup) => out.push_str(markup),
        }
        for &child in &node.children {
            self.write_node(child, skip.saturating_sub(1), out);
        }

        if skip == 0 {
            out.push_str("</");
            out.push_str(&node.name);
            out.push('>');
        }
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    prolog: Vec<String>,
    nodes: Vec<XmlNode>,
    references: HashMap<String, NodeId>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            prolog: Vec::new(),
            nodes: Vec::new(),
            references: HashMap::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    /// Advances past `terminator`, returning the text before it.
    fn take_until(&mut self, terminator: &str, what: &str) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find(terminator)
            .ok_or_else(|| Error::plist(self.pos, format!("unterminated {what}")))?;
        self.pos += end + terminator.len();
        Ok(&rest[..end])
    }

    /// Finds the `>` closing a start tag, ignoring any inside quoted values.
    fn take_tag(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let mut quote = None;
        for (i, c) in rest.char_indices() {
            match (quote, c) {
                (None, '"' | '\'') => quote = Some(c),
                (Some(q), c) if q == c => quote = None,
                (None, '>') => {
                    self.pos += i + 1;
                    return Ok(&rest[..i]);
                }
                _ => {}
            }
        }
        Err(Error::plist(self.pos, "unterminated tag"))
    }

    /// Returns true if `parent` is a leaf element whose whitespace is content.
    fn holds_text(&self, parent: Option<NodeId>) -> bool {
        parent.is_some_and(|parent| {
            let node = &self.nodes[parent.0];
            node.children.is_empty() && !matches!(node.name.as_str(), "plist" | "dict" | "array")
        })
    }

    /// Appends escaped character data to `parent`.
    fn push_text(&mut self, parent: Option<NodeId>, text: String) -> Result<()> {
        let Some(parent) = parent else {
            return Err(Error::plist(self.pos, "text outside of root element"));
        };
        let node = &mut self.nodes[parent.0];
        if !node.children.is_empty() {
            return Err(Error::plist(self.pos, "mixed content is not supported"));
        }
        match &mut node.content {
            Content::Text(existing) => existing.push_str(&text),
            content => *content = Content::Text(text),
        }
        Ok(())
    }

    fn parse(mut self) -> Result<XmlDocument> {
        let mut stack: Vec<NodeId> = Vec::new();
        let mut root = None;

        while self.pos < self.text.len() {
            let rest = self.rest();

            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                let chunk = &rest[..end];
                let keep = !chunk.trim().is_empty()
                    || (rest[end..].starts_with("</") && self.holds_text(stack.last().copied()));
                if keep {
                    self.push_text(stack.last().copied(), chunk.to_string())?;
                }
                self.pos += end;
                continue;
            }

            if rest.starts_with("<![CDATA[") {
                self.pos += 9;
                let data = self.take_until("]]>", "CDATA section")?;
                self.push_text(stack.last().copied(), escape(data))?;
            } else if rest.starts_with("<!--") {
                self.pos += 4;
                self.take_until("-->", "comment")?;
            } else if rest.starts_with("<?") {
                let start = self.pos;
                self.take_until("?>", "declaration")?;
                if root.is_none() {
                    self.prolog.push(self.text[start..self.pos].to_string());
                }
            } else if rest.starts_with("<!") {
                let start = self.pos;
                self.take_until(">", "declaration")?;
                if root.is_some() {
                    return Err(Error::plist(start, "declaration after root element"));
                }
                self.prolog.push(self.text[start..self.pos].to_string());
            } else if rest.starts_with("</") {
                let start = self.pos;
                self.pos += 2;
                let name = self.take_until(">", "closing tag")?.trim();
                match stack.pop() {
                    Some(open) if self.nodes[open.0].name == name => {}
                    _ => {
                        return Err(Error::plist(
                            start,
                            format!("unexpected closing tag </{name}>"),
                        ))
                    }
                }
            } else {
                let start = self.pos;
                self.pos += 1;
                let tag = self.take_tag()?;
                let (tag, self_closing) = match tag.strip_suffix('/') {
                    Some(tag) => (tag, true),
                    None => (tag, false),
                };
                let tag = tag.trim();
                let (name, attributes) = match tag.find(char::is_whitespace) {
                    Some(split) => (&tag[..split], Some(tag[split..].trim())),
                    None => (tag, None),
                };
                if name.is_empty() {
                    return Err(Error::plist(start, "empty element name"));
                }
                let attributes = attributes.filter(|a| !a.is_empty());

                let id = NodeId(self.nodes.len());
                self.nodes.push(XmlNode::new(name, attributes, Content::Empty));

                if let Some(value) = self.nodes[id.0].attribute("ID") {
                    self.references.insert(value.to_string(), id);
                }

                match stack.last() {
                    Some(&parent) => {
                        if matches!(self.nodes[parent.0].content, Content::Text(_)) {
                            return Err(Error::plist(start, "mixed content is not supported"));
                        }
                        self.nodes[parent.0].children.push(id);
                    }
                    None if root.is_none() => root = Some(id),
                    None => return Err(Error::plist(start, "multiple root elements")),
                }

                if !self_closing {
                    stack.push(id);
                }
            }
        }

        if let Some(&open) = stack.last() {
            return Err(Error::plist(
                self.text.len(),
                format!("unclosed element <{}>", self.nodes[open.0].name),
            ));
        }

        let root = root.ok_or_else(|| Error::plist(0, "document has no root element"))?;

        Ok(XmlDocument {
            prolog: self.prolog,
            nodes: self.nodes,
            root,
            references: self.references,
        })
    }
}

// =============================================================================
// Escaping
// =============================================================================

/// Iterates over `key="value"` pairs of a raw attribute string.
fn parse_attributes(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        rest = rest.trim_start();
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &after[1..];
        let end = body.find(quote)?;
        rest = &body[end + 1..];
        Some((key, &body[..end]))
    })
}

/// Escapes character data for inclusion in an element body.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Resolves the predefined and numeric character entities in `raw`.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(str::parse))
                .and_then(|code| code.ok())
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
