//! KeePass XML document: generic tree, scalar encodings, reader and writer

pub mod node;
pub mod values;

pub(crate) mod reader;
pub(crate) mod writer;

pub use node::XmlNode;

/// Deepest group nesting accepted when reading or writing
pub(crate) const MAX_DEPTH: usize = 256;

/// Deepest element nesting the parser builds; leaves room for the
/// KeePassFile/Root prefix and entry content below the deepest group
pub(crate) const MAX_ELEMENT_DEPTH: usize = MAX_DEPTH + 16;
