//! Device Description File (DDF) store
//!
//! A DDF declares how one product maps onto resources: match criteria
//! (manufacturer and model id), the sub-devices to create and, per item,
//! the `read`, `parse` and `write` access parameter objects interpreted by
//! the access functions. Descriptions are cached and swapped atomically on
//! reload.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

/// One item of a DDF sub-device with its access parameter objects.
///
/// Each parameter object carries a function selector `fn` (default `zcl`)
/// plus function specific fields; unknown selectors disable the item.
#[derive(Debug, Clone, Deserialize)]
pub struct DdfItem {
    /// Item suffix, e.g. `state/temperature`.
    pub name: String,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub awake: Option<bool>,
    #[serde(default)]
    pub read: Value,
    #[serde(default)]
    pub parse: Value,
    #[serde(default)]
    pub write: Value,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A sub-device entry: the resource kind, its REST type and the
/// endpoint/cluster pair the unique id is derived from.
#[derive(Debug, Clone, Deserialize)]
pub struct DdfSubDevice {
    /// Resource kind prefix, `/sensors` or `/lights`.
    #[serde(rename = "type")]
    pub kind: String,
    /// REST type, e.g. `ZHAOpenClose`.
    #[serde(default)]
    pub restapi: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: u8,
    #[serde(default)]
    pub cluster: u16,
    pub items: Vec<DdfItem>,
}

fn default_endpoint() -> u8 {
    1
}

/// A parsed device description.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescription {
    #[serde(deserialize_with = "string_or_list")]
    pub manufacturername: Vec<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub modelid: Vec<String>,
    #[serde(default)]
    pub product: String,
    pub subdevices: Vec<DdfSubDevice>,
}

/// DDF match fields accept a single string or a list of aliases.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl DeviceDescription {
    /// All (manufacturer, model) combinations this description matches.
    pub fn match_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.manufacturername.iter().flat_map(move |mfr| {
            self.modelid.iter().map(move |model| match_key(mfr, model))
        })
    }
}

fn match_key(manufacturer: &str, model: &str) -> String {
    format!("{manufacturer}\u{1f}{model}")
}

/// The process-wide DDF cache.
#[derive(Debug, Default)]
pub struct DdfStore {
    by_match: DashMap<String, Arc<DeviceDescription>>,
}

impl DdfStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a DDF JSON document and registers it for all its match keys.
    /// An existing description for the same keys is replaced atomically.
    ///
    /// Returns the parsed description so callers can emit `ddf.reload` for
    /// devices matching it.
    pub fn load_str(&self, json: &str) -> Result<Arc<DeviceDescription>, serde_json::Error> {
        let description: DeviceDescription = serde_json::from_str(json)?;
        let description = Arc::new(description);

        for key in description.match_keys() {
            self.by_match.insert(key, Arc::clone(&description));
        }

        tracing::debug!(product = %description.product, "DDF loaded");
        Ok(description)
    }

    /// Looks up the description matching \p manufacturer and \p model.
    #[must_use]
    pub fn get(&self, manufacturer: &str, model: &str) -> Option<Arc<DeviceDescription>> {
        self.by_match
            .get(&match_key(manufacturer, model))
            .map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_match.is_empty()
    }
}
