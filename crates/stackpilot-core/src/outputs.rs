//! Engine outputs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Where an output value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrigin {
    /// Reported by the provisioning engine
    #[default]
    Engine,
    /// Found by querying the cloud platform
    Discovered,
    /// Constructed from naming conventions
    Derived,
    /// Stand-in that needs manual follow-up
    Placeholder,
}

impl std::fmt::Display for OutputOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputOrigin::Engine => write!(f, "engine"),
            OutputOrigin::Discovered => write!(f, "discovered"),
            OutputOrigin::Derived => write!(f, "derived"),
            OutputOrigin::Placeholder => write!(f, "placeholder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: Value,

    #[serde(default)]
    pub sensitive: bool,

    #[serde(default)]
    pub origin: OutputOrigin,
}

impl OutputValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            sensitive: false,
            origin: OutputOrigin::Engine,
        }
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    pub fn with_origin(mut self, origin: OutputOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// The value with any `{"value": ...}` wrapping peeled off
    pub fn resolved(&self) -> &Value {
        let mut current = &self.value;
        while let Value::Object(map) = current {
            match map.get("value") {
                Some(inner) if map.len() == 1 => current = inner,
                _ => break,
            }
        }
        current
    }

    pub fn as_str(&self) -> Option<&str> {
        self.resolved().as_str()
    }

    pub fn is_placeholder(&self) -> bool {
        self.origin == OutputOrigin::Placeholder
    }
}

/// Output name -> value, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSet {
    entries: BTreeMap<String, OutputValue>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: OutputValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, OutputValue::new(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.entries.get(name)
    }

    /// Present and not JSON null
    pub fn has_value(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.resolved().is_null())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of outputs that still hold a placeholder
    pub fn placeholders(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_placeholder())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Parse the JSON document printed by `terraform output -json`
    ///
    /// Each entry is `{"sensitive": bool, "type": ..., "value": ...}`.
    /// Bare values are accepted as well.
    pub fn from_engine_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, Value> = serde_json::from_str(text)?;
        let mut set = OutputSet::new();
        for (name, entry) in raw {
            let value = match entry {
                Value::Object(mut map) if map.contains_key("value") => {
                    let sensitive = map
                        .get("sensitive")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let value = map.remove("value").unwrap_or(Value::Null);
                    OutputValue::new(value).sensitive(sensitive)
                }
                other => OutputValue::new(other),
            };
            set.insert(name, value);
        }
        Ok(set)
    }
}

impl FromIterator<(String, OutputValue)> for OutputSet {
    fn from_iter<I: IntoIterator<Item = (String, OutputValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
