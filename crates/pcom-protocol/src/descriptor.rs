//! Format descriptors learned from devices.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::format;

/// Kind of item a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    /// A command.
    Command,
    /// A property.
    Property,
    /// A datastream.
    Stream,
}

impl ItemKind {
    /// Name of the content field that carries the item (`COMMAND`, `PROPERTY`
    /// or `STREAM`).
    pub const fn content_key(self) -> &'static str {
        match self {
            ItemKind::Command => "COMMAND",
            ItemKind::Property => "PROPERTY",
            ItemKind::Stream => "STREAM",
        }
    }

    /// Kind code used in item enumeration records.
    pub const fn code(self) -> u8 {
        match self {
            ItemKind::Command => 0,
            ItemKind::Property => 1,
            ItemKind::Stream => 2,
        }
    }

    /// Parse an enumeration kind code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ItemKind::Command),
            1 => Some(ItemKind::Property),
            2 => Some(ItemKind::Stream),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.content_key())
    }
}

/// Parameter layout of one command, property or stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Item-local id carried in the response code field.
    pub id: u16,
    /// Human-readable name.
    pub name: String,
    /// Format string of the data section.
    pub format: String,
    /// Names of the input parameters, in data order.
    #[serde(default)]
    pub input_params: Vec<String>,
    /// Names of the output parameters, in data order.
    #[serde(default)]
    pub output_params: Vec<String>,
}

impl FormatDescriptor {
    /// Create a descriptor with no parameter names.
    pub fn new(id: u16, name: impl Into<String>, format: impl Into<String>) -> Self {
        FormatDescriptor {
            id,
            name: name.into(),
            format: format.into(),
            input_params: Vec::new(),
            output_params: Vec::new(),
        }
    }

    /// Set the input parameter names.
    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_params = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the output parameter names.
    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_params = names.into_iter().map(Into::into).collect();
        self
    }

    /// Parse an enumeration spec of the form `name|format|in1,in2|out1,out2`.
    ///
    /// Trailing sections may be omitted. The format is validated.
    pub fn parse_spec(id: u16, spec: &str) -> ProtocolResult<Self> {
        let mut parts = spec.split('|');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(ProtocolError::MissingField("item name"));
        }
        let fmt = parts.next().unwrap_or_default().trim();
        format::expand(fmt)?;

        let names = |section: Option<&str>| -> Vec<String> {
            section
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        let inputs = names(parts.next());
        let outputs = names(parts.next());

        Ok(FormatDescriptor::new(id, name, fmt)
            .with_inputs(inputs)
            .with_outputs(outputs))
    }

    /// Render as an enumeration spec.
    pub fn to_spec(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.name,
            self.format,
            self.input_params.join(","),
            self.output_params.join(",")
        )
    }
}

#[derive(Debug, Clone, Default)]
struct ItemSet {
    by_id: BTreeMap<u16, FormatDescriptor>,
    by_name: HashMap<String, u16>,
}

/// Per-destination table of format descriptors.
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    items: HashMap<(u16, ItemKind), ItemSet>,
}

impl DescriptorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a descriptor. Returns the replaced descriptor, if any.
    pub fn insert(
        &mut self,
        destination: u16,
        kind: ItemKind,
        descriptor: FormatDescriptor,
    ) -> Option<FormatDescriptor> {
        let set = self.items.entry((destination, kind)).or_default();
        let previous = set.by_id.remove(&descriptor.id);
        if let Some(old) = &previous {
            set.by_name.remove(&old.name);
        }
        set.by_name.insert(descriptor.name.clone(), descriptor.id);
        set.by_id.insert(descriptor.id, descriptor);
        previous
    }

    /// Look up by item-local id.
    pub fn get(&self, destination: u16, kind: ItemKind, id: u16) -> Option<&FormatDescriptor> {
        self.items.get(&(destination, kind))?.by_id.get(&id)
    }

    /// Look up by name.
    pub fn find(&self, destination: u16, kind: ItemKind, name: &str) -> Option<&FormatDescriptor> {
        let set = self.items.get(&(destination, kind))?;
        set.by_name.get(name).and_then(|id| set.by_id.get(id))
    }

    /// Look up by a content value: strings are names, numbers are ids.
    pub fn lookup(&self, destination: u16, kind: ItemKind, item: &Value) -> Option<&FormatDescriptor> {
        match item {
            Value::String(name) => self.find(destination, kind, name),
            Value::Number(n) => {
                let id = n.as_u64().and_then(|id| u16::try_from(id).ok())?;
                self.get(destination, kind, id)
            }
            _ => None,
        }
    }

    /// Descriptors of one kind on a destination, ordered by id.
    pub fn items(&self, destination: u16, kind: ItemKind) -> impl Iterator<Item = &FormatDescriptor> {
        self.items
            .get(&(destination, kind))
            .into_iter()
            .flat_map(|set| set.by_id.values())
    }

    /// All destinations with at least one descriptor, sorted.
    pub fn destinations(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.items.keys().map(|(dest, _)| *dest).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Total number of descriptors.
    pub fn len(&self) -> usize {
        self.items.values().map(|set| set.by_id.len()).sum()
    }

    /// Whether the table holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn home() -> FormatDescriptor {
        FormatDescriptor::new(5, "home", "B").with_inputs(["motor_num"])
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let mut table = DescriptorTable::new();
        table.insert(0x0101, ItemKind::Command, home());

        assert_eq!(table.find(0x0101, ItemKind::Command, "home"), Some(&home()));
        assert_eq!(table.get(0x0101, ItemKind::Command, 5), Some(&home()));
        assert_eq!(table.lookup(0x0101, ItemKind::Command, &json!("home")), Some(&home()));
        assert_eq!(table.lookup(0x0101, ItemKind::Command, &json!(5)), Some(&home()));
        assert!(table.lookup(0x0101, ItemKind::Property, &json!("home")).is_none());
        assert!(table.lookup(0x0102, ItemKind::Command, &json!(5)).is_none());
    }

    #[test]
    fn test_insert_replaces_name_index() {
        let mut table = DescriptorTable::new();
        table.insert(1, ItemKind::Property, FormatDescriptor::new(2, "speed", "H"));
        let old = table.insert(1, ItemKind::Property, FormatDescriptor::new(2, "velocity", "H"));

        assert_eq!(old.map(|d| d.name), Some("speed".to_string()));
        assert!(table.find(1, ItemKind::Property, "speed").is_none());
        assert!(table.find(1, ItemKind::Property, "velocity").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_destinations_sorted() {
        let mut table = DescriptorTable::new();
        table.insert(0x0201, ItemKind::Stream, FormatDescriptor::new(1, "pos", "f"));
        table.insert(0x0101, ItemKind::Command, home());
        table.insert(0x0101, ItemKind::Property, FormatDescriptor::new(1, "speed", "H"));

        assert_eq!(table.destinations(), vec![0x0101, 0x0201]);
        assert_eq!(table.items(0x0101, ItemKind::Command).count(), 1);
    }

    #[test]
    fn test_parse_spec() {
        let d = FormatDescriptor::parse_spec(7, "move|2hB|x, y,speed|ok").unwrap();
        assert_eq!(d.name, "move");
        assert_eq!(d.format, "2hB");
        assert_eq!(d.input_params, vec!["x", "y", "speed"]);
        assert_eq!(d.output_params, vec!["ok"]);
        assert_eq!(d.to_spec(), "move|2hB|x,y,speed|ok");

        let bare = FormatDescriptor::parse_spec(1, "stop").unwrap();
        assert_eq!(bare.format, "");
        assert!(bare.input_params.is_empty());
    }

    #[test]
    fn test_parse_spec_rejects_bad_input() {
        assert!(FormatDescriptor::parse_spec(1, "|B").is_err());
        assert!(matches!(
            FormatDescriptor::parse_spec(1, "bad|3z"),
            Err(ProtocolError::InvalidFormat { .. })
        ));
    }
}
