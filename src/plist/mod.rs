//! XML property-list documents.
//!
//! [`XmlDocument`] is an order-preserving element tree that can be mutated and
//! exported back to text; the [`value`] helpers interpret it as a plist.

mod document;
pub mod value;

pub use document::{escape, unescape, NodeId, XmlDocument, XmlNode};
pub use value::{PlistDict, PlistType};
