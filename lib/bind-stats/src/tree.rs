use std::num::ParseIntError;

use roxmltree::{Document, Node, ParsingOptions};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

/// A statistics tree error.
///
/// Every variant means the document cannot be trusted for the current cycle, and the whole cycle is abandoned.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum TreeError {
    /// The document is not well-formed XML.
    #[snafu(display("statistics document is not well-formed XML: {}", source))]
    InvalidXml {
        /// Source of the error.
        source: roxmltree::Error,
    },

    /// The document root does not match any known statistics layout.
    #[snafu(display(
        "unsupported statistics layout: root element '{}' (version {})",
        root,
        version.as_deref().unwrap_or("unknown")
    ))]
    UnsupportedLayout {
        /// Name of the root element.
        root: String,

        /// Value of the root `version` attribute, if any.
        version: Option<String>,
    },

    /// An expected child element was missing.
    #[snafu(display("missing element '{}' under '{}'", child, path))]
    MissingChild {
        /// Path of the parent element.
        path: String,

        /// Name of the missing child.
        child: String,
    },

    /// An expected attribute was missing.
    #[snafu(display("missing attribute '{}' on '{}'", attribute, path))]
    MissingAttribute {
        /// Path of the element.
        path: String,

        /// Name of the missing attribute.
        attribute: String,
    },

    /// An element that should hold a value had no text.
    #[snafu(display("element '{}' has no value", path))]
    MissingValue {
        /// Path of the element.
        path: String,
    },

    /// A counter's value was not an integer.
    #[snafu(display("counter '{}' has non-integer value '{}': {}", path, value, source))]
    InvalidCounter {
        /// Path of the counter element.
        path: String,

        /// The offending text.
        value: String,

        /// Source of the error.
        source: ParseIntError,
    },

    /// A counter was nested deeper than a single counter group.
    #[snafu(display("counter '{}' is nested more than one level deep", path))]
    UnexpectedNesting {
        /// Path of the counter element.
        path: String,
    },
}

/// A node in a parsed statistics document.
///
/// The tree owns all of its data, and keeps only what the flattener needs: element names, attributes, trimmed text,
/// and element children in document order. Every node also records its slash-delimited path from the document root,
/// which is used when reporting malformed documents.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsNode {
    name: String,
    path: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<StatsNode>,
}

impl StatsNode {
    /// Parses a statistics XML document into a tree rooted at the document's root element.
    ///
    /// # Errors
    ///
    /// If the document is not well-formed XML, an error is returned.
    pub fn parse(document: &str) -> Result<Self, TreeError> {
        // The statistics channel serves a DOCTYPE on some BIND releases.
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let document = Document::parse_with_options(document, options).context(InvalidXml)?;

        Ok(Self::from_element(document.root_element(), ""))
    }

    fn from_element(node: Node<'_, '_>, parent_path: &str) -> Self {
        let name = node.tag_name().name().to_string();
        let path = format!("{}/{}", parent_path, name);

        let attributes = node
            .attributes()
            .map(|attr| (attr.name().to_string(), attr.value().to_string()))
            .collect();

        let text = node
            .children()
            .filter(|child| child.is_text())
            .filter_map(|child| child.text())
            .collect::<String>();
        let text = text.trim();
        let text = (!text.is_empty()).then(|| text.to_string());

        let children = node
            .children()
            .filter(|child| child.is_element())
            .map(|child| Self::from_element(child, &path))
            .collect();

        Self {
            name,
            path,
            attributes,
            text,
            children,
        }
    }

    /// Returns the element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the slash-delimited path of this node from the document root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the trimmed text content, if the element has any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Returns the value of the given attribute, if present.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attr_name, _)| attr_name == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the element children, in document order.
    pub fn children(&self) -> &[StatsNode] {
        &self.children
    }

    /// Returns the first child element with the given name.
    pub fn child(&self, name: &str) -> Option<&StatsNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Returns all child elements with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StatsNode> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Returns `true` if the element has no element children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the first child element with the given name.
    ///
    /// # Errors
    ///
    /// If no such child exists, an error is returned.
    pub fn require_child(&self, name: &str) -> Result<&StatsNode, TreeError> {
        self.child(name).context(MissingChild {
            path: self.path.as_str(),
            child: name,
        })
    }

    /// Returns the value of the given attribute.
    ///
    /// # Errors
    ///
    /// If the attribute is not present, an error is returned.
    pub fn require_attribute(&self, name: &str) -> Result<&str, TreeError> {
        self.attribute(name).context(MissingAttribute {
            path: self.path.as_str(),
            attribute: name,
        })
    }

    /// Returns the trimmed text content.
    ///
    /// # Errors
    ///
    /// If the element has no text, an error is returned.
    pub fn require_text(&self) -> Result<&str, TreeError> {
        self.text().context(MissingValue { path: self.path.as_str() })
    }

    /// Parses the text content as an integer counter value.
    ///
    /// # Errors
    ///
    /// If the element has no text, or the text is not an integer, an error is returned.
    pub fn counter_value(&self) -> Result<i64, TreeError> {
        let text = self.require_text()?;
        text.parse::<i64>().context(InvalidCounter {
            path: self.path.as_str(),
            value: text,
        })
    }
}
