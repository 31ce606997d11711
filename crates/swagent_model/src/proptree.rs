use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Ordered key/value tree used for JSON input, structured output, and every
/// intermediate result the host handlers build. A node carries a string
/// scalar plus an ordered child sequence; map children have unique non-empty
/// keys tracked in a side index, array children have empty keys and never
/// enter the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropTree {
    data: String,
    children: Vec<(String, PropTree)>,
    index: HashMap<String, usize>,
}

impl PropTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(data: impl Into<String>) -> Self {
        PropTree {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<String>) {
        self.data = data.into();
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// A node counts as array-shaped while no child key is indexed, so a
    /// node that never had a named child behaves as an array even when empty.
    pub fn is_array(&self) -> bool {
        self.index.is_empty()
    }

    pub fn child_exists(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Keyed access that establishes presence: a missing key is appended as
    /// an empty leaf. Handlers rely on this to emit empty fields.
    pub fn at(&mut self, key: &str) -> &mut PropTree {
        if let Some(&pos) = self.index.get(key) {
            return &mut self.children[pos].1;
        }
        let pos = self.children.len();
        self.index.insert(key.to_string(), pos);
        self.children.push((key.to_string(), PropTree::default()));
        &mut self.children[pos].1
    }

    pub fn get(&self, key: &str) -> Option<&PropTree> {
        self.index.get(key).map(|&pos| &self.children[pos].1)
    }

    /// Read-only lookup collapsing a missing key to the empty string, the
    /// shared-empty-leaf behavior of the read path.
    pub fn child_data(&self, key: &str) -> &str {
        self.get(key).map(PropTree::data).unwrap_or("")
    }

    pub fn at_index(&self, idx: usize) -> Option<&PropTree> {
        self.children.get(idx).map(|(_, child)| child)
    }

    /// Array append: the child gets an empty key and never joins the index.
    pub fn push(&mut self, child: PropTree) -> &mut PropTree {
        self.children.push((String::new(), child));
        let last = self.children.len() - 1;
        &mut self.children[last].1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropTree)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn from_json(text: &str) -> Result<PropTree> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Ok(Self::from_value(&value)),
            Err(err) => bail!("Unable to parse command input as JSON:\n{err}"),
        }
    }

    fn from_value(value: &Value) -> PropTree {
        match value {
            Value::Null => PropTree::leaf(""),
            Value::Bool(b) => PropTree::leaf(if *b { "1" } else { "0" }),
            Value::Number(n) => PropTree::leaf(n.to_string()),
            Value::String(s) => PropTree::leaf(s.as_str()),
            Value::Array(items) => {
                let mut tree = PropTree::new();
                // Decoded arrays stay array-shaped: the decimal-index keys
                // are carried on the entries but never indexed, so they are
                // skipped again on output.
                for (i, item) in items.iter().enumerate() {
                    tree.children.push((i.to_string(), Self::from_value(item)));
                }
                tree
            }
            Value::Object(map) => {
                let mut tree = PropTree::new();
                for (key, item) in map {
                    *tree.at(key) = Self::from_value(item);
                }
                tree
            }
        }
    }

    pub fn to_value(&self) -> Value {
        if !self.has_children() {
            Value::String(self.data.clone())
        } else if self.is_array() {
            Value::Array(self.children.iter().map(|(_, c)| c.to_value()).collect())
        } else {
            let mut map = serde_json::Map::new();
            for (key, child) in &self.children {
                if key.is_empty() {
                    continue;
                }
                map.insert(key.clone(), child.to_value());
            }
            Value::Object(map)
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_default()
    }
}

impl PartialEq<str> for PropTree {
    fn eq(&self, other: &str) -> bool {
        self.data == other
    }
}

impl PartialEq<&str> for PropTree {
    fn eq(&self, other: &&str) -> bool {
        self.data == *other
    }
}
