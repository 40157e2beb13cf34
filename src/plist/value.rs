//! Property-list interpretation of an [`XmlDocument`].
//!
//! Plist dictionaries are stored as alternating `<key>` and value elements;
//! these helpers pair them up, follow `IDREF` references and read typed
//! scalar values.

use std::borrow::Cow;

use super::document::{unescape, NodeId, XmlDocument};

/// Plist element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Variants are named after their elements
pub enum PlistType {
    Dict,
    Array,
    String,
    Integer,
    Real,
    Data,
    Date,
    True,
    False,
    Key,
}

impl PlistType {
    /// Maps an element name to its plist type.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dict" => PlistType::Dict,
            "array" => PlistType::Array,
            "string" => PlistType::String,
            "integer" => PlistType::Integer,
            "real" => PlistType::Real,
            "data" => PlistType::Data,
            "date" => PlistType::Date,
            "true" => PlistType::True,
            "false" => PlistType::False,
            "key" => PlistType::Key,
            _ => return None,
        })
    }
}

/// Returns the plist root: the first child of a `<plist>` wrapper, or the
/// document root itself when there is no wrapper.
pub fn plist_root(doc: &XmlDocument) -> Option<NodeId> {
    let root = doc.root();
    if doc.node(root).name() == "plist" {
        doc.child(root, 0)
    } else {
        Some(root)
    }
}

/// Returns how many wrapper levels enclose the plist root, counting the root.
pub fn plist_depth(doc: &XmlDocument) -> usize {
    if doc.node(doc.root()).name() == "plist" {
        2
    } else {
        1
    }
}

/// Returns the resolved node if it has the requested type.
pub fn cast(doc: &XmlDocument, node: NodeId, ty: PlistType) -> Option<NodeId> {
    let node = doc.resolve(node);
    (PlistType::from_name(doc.node(node).name()) == Some(ty)).then_some(node)
}

/// Returns the number of key/value pairs in a dictionary.
pub fn dict_len(doc: &XmlDocument, dict: NodeId) -> usize {
    doc.child_count(dict) / 2
}

/// Iterates over `(key, value)` pairs of a dictionary in document order.
///
/// A pair whose key element is not a `<key>` yields `None` for the key.
pub fn dict_entries(doc: &XmlDocument, dict: NodeId) -> impl Iterator<Item = (Option<&str>, NodeId)> {
    doc.node(dict).children().chunks_exact(2).map(move |pair| {
        let key = doc.node(pair[0]);
        let key = (key.name() == "key").then(|| key.text().unwrap_or(""));
        (key, pair[1])
    })
}

/// Looks up the first value stored under `key`.
pub fn dict_get(doc: &XmlDocument, dict: NodeId, key: &str) -> Option<NodeId> {
    dict_entries(doc, dict).find_map(|(k, value)| (k == Some(key)).then_some(value))
}

/// Reads an `<integer>` value.
///
/// Accepts `0x`-prefixed hexadecimal and decimal, with an optional leading
/// minus sign stored as its two's complement.
pub fn integer_value(doc: &XmlDocument, node: NodeId) -> Option<u64> {
    let node = cast(doc, node, PlistType::Integer)?;
    parse_integer(doc.node(node).text()?.trim())
}

fn parse_integer(text: &str) -> Option<u64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Reads a `<string>` value with entities resolved.
pub fn string_value(doc: &XmlDocument, node: NodeId) -> Option<Cow<'_, str>> {
    let node = cast(doc, node, PlistType::String)?;
    let raw = doc.node(node).text().unwrap_or("");
    Some(if raw.contains('&') {
        Cow::Owned(unescape(raw))
    } else {
        Cow::Borrowed(raw)
    })
}

/// Borrowed view of a plist dictionary.
#[derive(Debug, Clone, Copy)]
pub struct PlistDict<'d> {
    doc: &'d XmlDocument,
    node: NodeId,
}

impl<'d> PlistDict<'d> {
    /// Wraps `node` if it resolves to a dictionary.
    pub fn new(doc: &'d XmlDocument, node: NodeId) -> Option<Self> {
        cast(doc, node, PlistType::Dict).map(|node| Self { doc, node })
    }

    /// Returns the dictionary node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the document the dictionary belongs to.
    pub fn document(&self) -> &'d XmlDocument {
        self.doc
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        dict_len(self.doc, self.node)
    }

    /// Returns true if the dictionary has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &'d str> {
        dict_entries(self.doc, self.node).filter_map(|(key, _)| key)
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<NodeId> {
        dict_get(self.doc, self.node, key)
    }

    /// Reads a string value.
    pub fn string(&self, key: &str) -> Option<Cow<'d, str>> {
        string_value(self.doc, self.get(key)?)
    }

    /// Reads an integer value.
    pub fn integer(&self, key: &str) -> Option<u64> {
        integer_value(self.doc, self.get(key)?)
    }

    /// Reads a nested dictionary.
    pub fn dict(&self, key: &str) -> Option<PlistDict<'d>> {
        PlistDict::new(self.doc, self.get(key)?)
    }
}
