use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// One flat row headed for storage: field name to scalar (or JSON) value.
///
/// `serde_json::Map` keeps keys sorted, which gives a stable column order and
/// a stable serialization for content hashing.
pub type Row = Map<String, JsonValue>;

/// A closed markup element, owned by whoever pulled it from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Direct children with the given tag.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Grandchildren reached through `parent/child`, e.g. `WorkoutRoute/Location`.
    pub fn find_all<'a>(
        &'a self,
        parent: &'a str,
        child: &'a str,
    ) -> impl Iterator<Item = &'a Self> + 'a {
        self.children_named(parent)
            .flat_map(move |p| p.children_named(child))
    }

    /// Attributes as a row of text values.
    pub fn attrs_row(&self) -> Row {
        self.attrs
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect()
    }
}

/// Key of the last row written by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Rowid(i64),
    Hash(String),
}

impl From<RowKey> for JsonValue {
    fn from(key: RowKey) -> Self {
        match key {
            RowKey::Rowid(id) => Self::from(id),
            RowKey::Hash(h) => Self::String(h),
        }
    }
}

/// Progress notifications emitted during a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// This many more bytes of the main document were consumed.
    Advanced(u64),
    /// The run completed; sent exactly once, after everything else.
    Finished,
}
