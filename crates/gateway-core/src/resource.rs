//! Resource and ResourceItem model
//!
//! A `Resource` is a named collection of typed items surfaced through the
//! REST API (`/devices`, `/lights`, `/sensors`, `/alarmsystems`). Items are
//! identified by interned suffix strings such as `state/on` and carry the
//! change tracking (timestamps, push flags, value source) the rest of the
//! core builds on.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::clock::SteadyTime;

// Resource kind prefixes
pub const R_DEVICES: &str = "/devices";
pub const R_LIGHTS: &str = "/lights";
pub const R_SENSORS: &str = "/sensors";
pub const R_GROUPS: &str = "/groups";
pub const R_ALARMSYSTEMS: &str = "/alarmsystems";
pub const R_CONFIG: &str = "/config";

// attr/* suffixes
pub const RATTR_ID: &str = "attr/id";
pub const RATTR_NAME: &str = "attr/name";
pub const RATTR_TYPE: &str = "attr/type";
pub const RATTR_UNIQUEID: &str = "attr/uniqueid";
pub const RATTR_MODELID: &str = "attr/modelid";
pub const RATTR_MANUFACTURER_NAME: &str = "attr/manufacturername";
pub const RATTR_EXT_ADDRESS: &str = "attr/extaddress";
pub const RATTR_NWK_ADDRESS: &str = "attr/nwkaddress";
pub const RATTR_LAST_SEEN: &str = "attr/lastseen";

// state/* suffixes
pub const RSTATE_ON: &str = "state/on";
pub const RSTATE_REACHABLE: &str = "state/reachable";
pub const RSTATE_ALARM: &str = "state/alarm";
pub const RSTATE_ACTION: &str = "state/action";
pub const RSTATE_ARM_STATE: &str = "state/armstate";
pub const RSTATE_SECONDS_REMAINING: &str = "state/secondsremaining";
pub const RSTATE_PANEL: &str = "state/panel";
pub const RSTATE_BUTTON_EVENT: &str = "state/buttonevent";
pub const RSTATE_CARBON_MONOXIDE: &str = "state/carbonmonoxide";
pub const RSTATE_FIRE: &str = "state/fire";
pub const RSTATE_LOW_BATTERY: &str = "state/lowbattery";
pub const RSTATE_OPEN: &str = "state/open";
pub const RSTATE_PRESENCE: &str = "state/presence";
pub const RSTATE_TAMPERED: &str = "state/tampered";
pub const RSTATE_TEMPERATURE: &str = "state/temperature";
pub const RSTATE_TEST: &str = "state/test";
pub const RSTATE_VIBRATION: &str = "state/vibration";
pub const RSTATE_WATER: &str = "state/water";
pub const RSTATE_AIR_QUALITY: &str = "state/airquality";
pub const RSTATE_AIR_QUALITY_PPB: &str = "state/airqualityppb";
pub const RSTATE_BATTERY: &str = "state/battery";
pub const RSTATE_LAST_UPDATED: &str = "state/lastupdated";
pub const RSTATE_LAST_SET: &str = "state/lastset";
pub const RSTATE_LOCALTIME: &str = "state/localtime";
pub const RSTATE_UTC: &str = "state/utc";

// config/* suffixes
pub const RCONFIG_ON: &str = "config/on";
pub const RCONFIG_BATTERY: &str = "config/battery";
pub const RCONFIG_OFFSET: &str = "config/offset";
pub const RCONFIG_REACHABLE: &str = "config/reachable";
pub const RCONFIG_DURATION: &str = "config/duration";
pub const RCONFIG_CONFIGURED: &str = "config/configured";
pub const RCONFIG_ARM_MODE: &str = "config/armmode";
pub const RCONFIG_ALARM_SYSTEM_ID: &str = "config/alarmsystemid";
pub const RCONFIG_DISARMED_ENTRY_DELAY: &str = "config/disarmed/entrydelay";
pub const RCONFIG_DISARMED_EXIT_DELAY: &str = "config/disarmed/exitdelay";
pub const RCONFIG_ARMED_STAY_ENTRY_DELAY: &str = "config/armedstay/entrydelay";
pub const RCONFIG_ARMED_STAY_EXIT_DELAY: &str = "config/armedstay/exitdelay";
pub const RCONFIG_ARMED_STAY_TRIGGER_DURATION: &str = "config/armedstay/triggerduration";
pub const RCONFIG_ARMED_NIGHT_ENTRY_DELAY: &str = "config/armednight/entrydelay";
pub const RCONFIG_ARMED_NIGHT_EXIT_DELAY: &str = "config/armednight/exitdelay";
pub const RCONFIG_ARMED_NIGHT_TRIGGER_DURATION: &str = "config/armednight/triggerduration";
pub const RCONFIG_ARMED_AWAY_ENTRY_DELAY: &str = "config/armedaway/entrydelay";
pub const RCONFIG_ARMED_AWAY_EXIT_DELAY: &str = "config/armedaway/exitdelay";
pub const RCONFIG_ARMED_AWAY_TRIGGER_DURATION: &str = "config/armedaway/triggerduration";

/// Unique key of a physical device, the MAC address for wired devices.
pub type DeviceKey = u64;

/// Item data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Unknown,
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Real,
    String,
    Time,
    TimePattern,
}

impl DataType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        use DataType::*;
        matches!(self, UInt8 | UInt16 | UInt32 | UInt64 | Int8 | Int16 | Int32 | Int64)
    }
}

/// Who produced the value currently stored in an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSource {
    #[default]
    Unknown,
    Device,
    Api,
    Rule,
}

/// Item flags
pub mod item_flags {
    pub const PUSH_ON_SET: u16 = 1 << 0;
    pub const PUSH_ON_CHANGE: u16 = 1 << 1;
    pub const PUSH_PENDING_SET: u16 = 1 << 2;
    pub const PUSH_PENDING_CHANGE: u16 = 1 << 3;
    pub const NEED_STORE: u16 = 1 << 4;
    pub const AWAKE_ON_SET: u16 = 1 << 5;
    pub const IMPLICIT: u16 = 1 << 6;
    pub const ZCL_UNSUPPORTED: u16 = 1 << 7;
    pub const PUBLIC: u16 = 1 << 8;
}

/// Immutable description of one item suffix: its type and validity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceItemDescriptor {
    pub data_type: DataType,
    pub suffix: &'static str,
    pub valid_min: i64,
    pub valid_max: i64,
}

impl ResourceItemDescriptor {
    const fn new(data_type: DataType, suffix: &'static str) -> Self {
        Self { data_type, suffix, valid_min: 0, valid_max: 0 }
    }

    const fn ranged(data_type: DataType, suffix: &'static str, min: i64, max: i64) -> Self {
        Self { data_type, suffix, valid_min: min, valid_max: max }
    }
}

/// The process-wide descriptor table. Exactly one descriptor exists per
/// suffix; `Resource::add_item` refuses suffixes not listed here.
pub static RESOURCE_ITEM_DESCRIPTORS: &[ResourceItemDescriptor] = &[
    ResourceItemDescriptor::new(DataType::String, RATTR_ID),
    ResourceItemDescriptor::new(DataType::String, RATTR_NAME),
    ResourceItemDescriptor::new(DataType::String, RATTR_TYPE),
    ResourceItemDescriptor::new(DataType::String, RATTR_UNIQUEID),
    ResourceItemDescriptor::new(DataType::String, RATTR_MODELID),
    ResourceItemDescriptor::new(DataType::String, RATTR_MANUFACTURER_NAME),
    ResourceItemDescriptor::new(DataType::UInt64, RATTR_EXT_ADDRESS),
    ResourceItemDescriptor::new(DataType::UInt16, RATTR_NWK_ADDRESS),
    ResourceItemDescriptor::new(DataType::Time, RATTR_LAST_SEEN),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_ON),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_REACHABLE),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_ALARM),
    ResourceItemDescriptor::new(DataType::UInt32, RSTATE_ACTION),
    ResourceItemDescriptor::new(DataType::UInt32, RSTATE_ARM_STATE),
    ResourceItemDescriptor::ranged(DataType::UInt32, RSTATE_SECONDS_REMAINING, 0, 255),
    ResourceItemDescriptor::new(DataType::String, RSTATE_PANEL),
    ResourceItemDescriptor::new(DataType::UInt32, RSTATE_BUTTON_EVENT),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_CARBON_MONOXIDE),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_FIRE),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_LOW_BATTERY),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_OPEN),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_PRESENCE),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_TAMPERED),
    ResourceItemDescriptor::ranged(DataType::Int16, RSTATE_TEMPERATURE, -27315, 32767),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_TEST),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_VIBRATION),
    ResourceItemDescriptor::new(DataType::Bool, RSTATE_WATER),
    ResourceItemDescriptor::new(DataType::String, RSTATE_AIR_QUALITY),
    ResourceItemDescriptor::new(DataType::UInt32, RSTATE_AIR_QUALITY_PPB),
    ResourceItemDescriptor::ranged(DataType::UInt8, RSTATE_BATTERY, 0, 100),
    ResourceItemDescriptor::new(DataType::Time, RSTATE_LAST_UPDATED),
    ResourceItemDescriptor::new(DataType::Time, RSTATE_LAST_SET),
    ResourceItemDescriptor::new(DataType::Time, RSTATE_LOCALTIME),
    ResourceItemDescriptor::new(DataType::Time, RSTATE_UTC),
    ResourceItemDescriptor::new(DataType::Bool, RCONFIG_ON),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_BATTERY, 0, 100),
    ResourceItemDescriptor::ranged(DataType::Int32, RCONFIG_OFFSET, i32::MIN as i64, i32::MAX as i64),
    ResourceItemDescriptor::new(DataType::Bool, RCONFIG_REACHABLE),
    ResourceItemDescriptor::ranged(DataType::UInt32, RCONFIG_DURATION, 0, 65535),
    ResourceItemDescriptor::new(DataType::Bool, RCONFIG_CONFIGURED),
    ResourceItemDescriptor::new(DataType::String, RCONFIG_ARM_MODE),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ALARM_SYSTEM_ID, 1, 4),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_DISARMED_ENTRY_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_DISARMED_EXIT_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_STAY_ENTRY_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_STAY_EXIT_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_STAY_TRIGGER_DURATION, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_NIGHT_ENTRY_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_NIGHT_EXIT_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_NIGHT_TRIGGER_DURATION, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_AWAY_ENTRY_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_AWAY_EXIT_DELAY, 0, 255),
    ResourceItemDescriptor::ranged(DataType::UInt8, RCONFIG_ARMED_AWAY_TRIGGER_DURATION, 0, 255),
];

/// Looks up the interned descriptor for a suffix.
#[must_use]
pub fn descriptor_for_suffix(suffix: &str) -> Option<&'static ResourceItemDescriptor> {
    RESOURCE_ITEM_DESCRIPTORS.iter().find(|d| d.suffix == suffix)
}

/// Errors raised by `set_value`; no partial mutation happens on failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetValueError {
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    #[error("bad value format for {0}")]
    BadFormat(&'static str),

    #[error("unknown suffix {0}")]
    UnknownSuffix(String),
}

/// The discriminated union an item stores.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ItemValue {
    #[default]
    None,
    Bool(bool),
    Num(i64),
    Real(f64),
    Str(String),
    /// Milliseconds since the Unix epoch.
    Time(i64),
}

/// Cached ZCL addressing decoded once from an item's access parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZclParam {
    pub valid: bool,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub manufacturer_code: u16,
    pub attributes: [u16; ZclParam::MAX_ATTRIBUTES],
    pub attribute_count: usize,
    pub command_id: u8,
    pub has_command_id: bool,
}

impl ZclParam {
    pub const MAX_ATTRIBUTES: usize = 8;

    #[must_use]
    pub fn has_attribute(&self, id: u16) -> bool {
        self.attributes[..self.attribute_count].contains(&id)
    }
}

/// A typed, aged, change-tracked cell of a resource.
#[derive(Debug, Clone)]
pub struct ResourceItem {
    descriptor: &'static ResourceItemDescriptor,
    value: ItemValue,
    num_prev: i64,
    last_set: Option<DateTime<Utc>>,
    last_changed: Option<DateTime<Utc>>,
    last_zcl_report: SteadyTime,
    flags: u16,
    source: ValueSource,
    read_params: Value,
    parse_params: Value,
    write_params: Value,
    zcl_param: Option<ZclParam>,
    parse_inited: bool,
    rules: Vec<u32>,
}

impl ResourceItem {
    #[must_use]
    pub fn new(descriptor: &'static ResourceItemDescriptor) -> Self {
        Self {
            descriptor,
            value: ItemValue::None,
            num_prev: 0,
            last_set: None,
            last_changed: None,
            last_zcl_report: SteadyTime(0),
            flags: item_flags::PUBLIC,
            source: ValueSource::Unknown,
            read_params: Value::Null,
            parse_params: Value::Null,
            write_params: Value::Null,
            zcl_param: None,
            parse_inited: false,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &'static ResourceItemDescriptor {
        self.descriptor
    }

    #[must_use]
    pub fn suffix(&self) -> &'static str {
        self.descriptor.suffix
    }

    #[must_use]
    pub fn value(&self) -> &ItemValue {
        &self.value
    }

    #[must_use]
    pub fn to_bool(&self) -> bool {
        match &self.value {
            ItemValue::Bool(b) => *b,
            ItemValue::Num(n) => *n != 0,
            _ => false,
        }
    }

    #[must_use]
    pub fn to_number(&self) -> i64 {
        match &self.value {
            ItemValue::Bool(b) => i64::from(*b),
            ItemValue::Num(n) => *n,
            ItemValue::Real(r) => *r as i64,
            ItemValue::Time(t) => *t,
            _ => 0,
        }
    }

    #[must_use]
    pub fn to_number_previous(&self) -> i64 {
        self.num_prev
    }

    #[must_use]
    pub fn to_str(&self) -> &str {
        match &self.value {
            ItemValue::Str(s) => s.as_str(),
            _ => "",
        }
    }

    #[must_use]
    pub fn last_set(&self) -> Option<DateTime<Utc>> {
        self.last_set
    }

    #[must_use]
    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }

    #[must_use]
    pub fn value_source(&self) -> ValueSource {
        self.source
    }

    #[must_use]
    pub fn last_zcl_report(&self) -> SteadyTime {
        self.last_zcl_report
    }

    pub fn set_last_zcl_report(&mut self, t: SteadyTime) {
        self.last_zcl_report = t;
    }

    // flag helpers

    #[must_use]
    pub fn need_push_set(&self) -> bool {
        self.flags & item_flags::PUSH_PENDING_SET != 0
    }

    #[must_use]
    pub fn need_push_change(&self) -> bool {
        self.flags & item_flags::PUSH_PENDING_CHANGE != 0
    }

    #[must_use]
    pub fn need_store(&self) -> bool {
        self.flags & item_flags::NEED_STORE != 0
    }

    /// Cleared by the HTTP/WebSocket fan-out after pushing.
    pub fn clear_need_push(&mut self) {
        self.flags &= !(item_flags::PUSH_PENDING_SET | item_flags::PUSH_PENDING_CHANGE);
    }

    /// Cleared by the persistence worker after storing.
    pub fn clear_need_store(&mut self) {
        self.flags &= !item_flags::NEED_STORE;
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.flags & item_flags::PUBLIC != 0
    }

    pub fn set_is_public(&mut self, public: bool) {
        if public {
            self.flags |= item_flags::PUBLIC;
        } else {
            self.flags &= !item_flags::PUBLIC;
        }
    }

    #[must_use]
    pub fn awake_on_set(&self) -> bool {
        self.flags & item_flags::AWAKE_ON_SET != 0
    }

    pub fn set_awake_on_set(&mut self, on: bool) {
        if on {
            self.flags |= item_flags::AWAKE_ON_SET;
        } else {
            self.flags &= !item_flags::AWAKE_ON_SET;
        }
    }

    #[must_use]
    pub fn zcl_unsupported(&self) -> bool {
        self.flags & item_flags::ZCL_UNSUPPORTED != 0
    }

    /// Marked when the device reports the bound attribute as unsupported so
    /// the read path stops retrying.
    pub fn set_zcl_unsupported(&mut self) {
        self.flags |= item_flags::ZCL_UNSUPPORTED;
    }

    // access parameters

    #[must_use]
    pub fn read_parameters(&self) -> &Value {
        &self.read_params
    }

    #[must_use]
    pub fn parse_parameters(&self) -> &Value {
        &self.parse_params
    }

    #[must_use]
    pub fn write_parameters(&self) -> &Value {
        &self.write_params
    }

    pub fn set_read_parameters(&mut self, params: Value) {
        self.read_params = params;
    }

    pub fn set_parse_parameters(&mut self, params: Value) {
        self.parse_params = params;
        self.parse_inited = false;
        self.zcl_param = None;
    }

    pub fn set_write_parameters(&mut self, params: Value) {
        self.write_params = params;
    }

    #[must_use]
    pub fn zcl_param(&self) -> Option<&ZclParam> {
        self.zcl_param.as_ref()
    }

    pub fn set_zcl_param(&mut self, param: ZclParam) {
        self.zcl_param = Some(param);
    }

    #[must_use]
    pub fn parse_inited(&self) -> bool {
        self.parse_inited
    }

    pub fn set_parse_inited(&mut self) {
        self.parse_inited = true;
    }

    /// Registers a rule handle referencing this item (sorted, deduplicated).
    pub fn in_rule(&mut self, rule_handle: u32) {
        match self.rules.binary_search(&rule_handle) {
            Ok(_) => {}
            Err(pos) => self.rules.insert(pos, rule_handle),
        }
    }

    #[must_use]
    pub fn rules_involved(&self) -> &[u32] {
        &self.rules
    }

    /// Sets the value, validating type and range per the descriptor.
    ///
    /// On success `last_set` always advances and the set-push flag is set.
    /// Only an actual value change advances `last_changed` and additionally
    /// sets the change-push and need-store flags. Push flags are additive
    /// until the fan-out clears them.
    pub fn set_value(&mut self, value: ItemValue, source: ValueSource) -> Result<(), SetValueError> {
        let new_value = coerce_value(self.descriptor, value)?;

        let changed = new_value != self.value;
        let now = Utc::now();

        if changed {
            self.num_prev = self.to_number();
            self.value = new_value;
            self.last_changed = Some(now);
            self.flags |= item_flags::PUSH_PENDING_CHANGE | item_flags::NEED_STORE;
        }

        self.last_set = Some(now);
        self.flags |= item_flags::PUSH_PENDING_SET;
        self.source = source;

        Ok(())
    }

    /// Sets the value from a JSON variant (number, bool, string).
    pub fn set_variant(&mut self, value: &Value, source: ValueSource) -> Result<(), SetValueError> {
        self.set_value(variant_to_item_value(self.descriptor, value)?, source)
    }

    /// The item value rendered as JSON for API output.
    ///
    /// Time items with no valid `last_set` render as the empty string.
    #[must_use]
    pub fn to_variant(&self) -> Value {
        match &self.value {
            ItemValue::None => match self.descriptor.data_type {
                DataType::String | DataType::Time | DataType::TimePattern => Value::String(String::new()),
                DataType::Bool => Value::Bool(false),
                _ => Value::from(0),
            },
            ItemValue::Bool(b) => Value::Bool(*b),
            ItemValue::Num(n) => Value::from(*n),
            ItemValue::Real(r) => serde_json::Number::from_f64(*r).map_or(Value::from(0), Value::Number),
            ItemValue::Str(s) => Value::String(s.clone()),
            ItemValue::Time(ms) => {
                if self.last_set.is_none() {
                    Value::String(String::new())
                } else {
                    Value::String(render_time(self.descriptor.suffix, *ms))
                }
            }
        }
    }
}

fn in_range(descriptor: &ResourceItemDescriptor, num: i64) -> bool {
    if descriptor.valid_min == 0 && descriptor.valid_max == 0 {
        return true;
    }
    num >= descriptor.valid_min && num <= descriptor.valid_max
}

/// Converts a raw `ItemValue` into the representation the descriptor's data
/// type stores, enforcing the validity range.
fn coerce_value(
    descriptor: &'static ResourceItemDescriptor,
    value: ItemValue,
) -> Result<ItemValue, SetValueError> {
    let suffix = descriptor.suffix;

    match descriptor.data_type {
        DataType::Bool => match value {
            ItemValue::Bool(b) => Ok(ItemValue::Bool(b)),
            ItemValue::Num(n) => Ok(ItemValue::Bool(n != 0)),
            ItemValue::Str(s) if s == "true" => Ok(ItemValue::Bool(true)),
            ItemValue::Str(s) if s == "false" => Ok(ItemValue::Bool(false)),
            _ => Err(SetValueError::BadFormat(suffix)),
        },
        DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64 => {
            let num = match value {
                ItemValue::Bool(b) => i64::from(b),
                ItemValue::Num(n) => n,
                ItemValue::Real(r) if r.fract() == 0.0 => r as i64,
                ItemValue::Str(s) => s.parse::<i64>().map_err(|_| SetValueError::BadFormat(suffix))?,
                _ => return Err(SetValueError::BadFormat(suffix)),
            };
            if !in_range(descriptor, num) {
                return Err(SetValueError::OutOfRange(suffix));
            }
            Ok(ItemValue::Num(num))
        }
        DataType::Real => match value {
            ItemValue::Real(r) => Ok(ItemValue::Real(r)),
            ItemValue::Num(n) => Ok(ItemValue::Real(n as f64)),
            ItemValue::Str(s) => s
                .parse::<f64>()
                .map(ItemValue::Real)
                .map_err(|_| SetValueError::BadFormat(suffix)),
            _ => Err(SetValueError::BadFormat(suffix)),
        },
        DataType::String | DataType::TimePattern => match value {
            ItemValue::Str(s) => Ok(ItemValue::Str(s)),
            _ => Err(SetValueError::BadFormat(suffix)),
        },
        DataType::Time => match value {
            ItemValue::Time(ms) => Ok(ItemValue::Time(ms)),
            ItemValue::Num(ms) => Ok(ItemValue::Time(ms)),
            ItemValue::Str(s) => parse_time(&s)
                .map(ItemValue::Time)
                .ok_or(SetValueError::BadFormat(suffix)),
            _ => Err(SetValueError::BadFormat(suffix)),
        },
        DataType::Unknown => Err(SetValueError::BadFormat(suffix)),
    }
}

fn variant_to_item_value(
    descriptor: &'static ResourceItemDescriptor,
    value: &Value,
) -> Result<ItemValue, SetValueError> {
    match value {
        Value::Bool(b) => Ok(ItemValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ItemValue::Num(i))
            } else if let Some(u) = n.as_u64() {
                i64::try_from(u)
                    .map(ItemValue::Num)
                    .map_err(|_| SetValueError::OutOfRange(descriptor.suffix))
            } else if let Some(f) = n.as_f64() {
                Ok(ItemValue::Real(f))
            } else {
                Err(SetValueError::BadFormat(descriptor.suffix))
            }
        }
        Value::String(s) => Ok(ItemValue::Str(s.clone())),
        _ => Err(SetValueError::BadFormat(descriptor.suffix)),
    }
}

/// Parses ISO-8601 time with or without milliseconds and trailing `Z` into
/// milliseconds since the Unix epoch.
#[must_use]
pub fn parse_time(s: &str) -> Option<i64> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.3fZ",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.3f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    None
}

/// Renders a time item; `state/lastupdated` carries milliseconds without a
/// zone marker, everything else renders whole seconds with `Z`.
#[must_use]
pub fn render_time(suffix: &str, ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    if suffix == RSTATE_LAST_UPDATED {
        dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

/// A named collection of items plus the state changes attached to it.
#[derive(Debug, Default)]
pub struct Resource {
    prefix: &'static str,
    items: Vec<ResourceItem>,
    state_changes: Vec<crate::state_change::StateChange>,
    parent_device: Option<DeviceKey>,
}

impl Resource {
    #[must_use]
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, items: Vec::new(), state_changes: Vec::new(), parent_device: None }
    }

    #[must_use]
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    #[must_use]
    pub fn parent_device(&self) -> Option<DeviceKey> {
        self.parent_device
    }

    pub fn set_parent_device(&mut self, key: DeviceKey) {
        self.parent_device = Some(key);
    }

    /// Adds an item for \p suffix if not present and returns it.
    ///
    /// Panics in debug builds when no descriptor exists; the descriptor
    /// table is frozen after startup, a miss is a programming defect.
    pub fn add_item(&mut self, suffix: &str) -> Option<&mut ResourceItem> {
        debug_assert!(descriptor_for_suffix(suffix).is_some(), "no descriptor for {suffix}");
        let descriptor = descriptor_for_suffix(suffix)?;

        if let Some(pos) = self.items.iter().position(|i| i.suffix() == suffix) {
            return Some(&mut self.items[pos]);
        }

        self.items.push(ResourceItem::new(descriptor));
        self.items.last_mut()
    }

    pub fn remove_item(&mut self, suffix: &str) {
        self.items.retain(|i| i.suffix() != suffix);
    }

    #[must_use]
    pub fn item(&self, suffix: &str) -> Option<&ResourceItem> {
        self.items.iter().find(|i| i.suffix() == suffix)
    }

    pub fn item_mut(&mut self, suffix: &str) -> Option<&mut ResourceItem> {
        self.items.iter_mut().find(|i| i.suffix() == suffix)
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn item_for_index(&self, index: usize) -> Option<&ResourceItem> {
        self.items.get(index)
    }

    pub fn item_for_index_mut(&mut self, index: usize) -> Option<&mut ResourceItem> {
        self.items.get_mut(index)
    }

    pub fn items(&self) -> impl Iterator<Item = &ResourceItem> {
        self.items.iter()
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut ResourceItem> {
        self.items.iter_mut()
    }

    #[must_use]
    pub fn to_bool(&self, suffix: &str) -> bool {
        self.item(suffix).is_some_and(ResourceItem::to_bool)
    }

    #[must_use]
    pub fn to_number(&self, suffix: &str) -> i64 {
        self.item(suffix).map_or(0, ResourceItem::to_number)
    }

    #[must_use]
    pub fn to_str(&self, suffix: &str) -> &str {
        self.item(suffix).map_or("", ResourceItem::to_str)
    }

    #[must_use]
    pub fn unique_id(&self) -> &str {
        self.to_str(RATTR_UNIQUEID)
    }

    /// Sets an item value by suffix.
    pub fn set_value(
        &mut self,
        suffix: &str,
        value: ItemValue,
        source: ValueSource,
    ) -> Result<(), SetValueError> {
        let item = self
            .item_mut(suffix)
            .ok_or_else(|| SetValueError::UnknownSuffix(suffix.to_string()))?;
        item.set_value(value, source)
    }

    #[must_use]
    pub fn to_variant(&self, suffix: &str) -> Value {
        self.item(suffix).map_or(Value::Null, ResourceItem::to_variant)
    }

    // state changes

    pub fn add_state_change(&mut self, change: crate::state_change::StateChange) {
        if let Some(existing) = self.state_changes.iter_mut().find(|c| **c == change) {
            *existing = change;
            return;
        }
        self.state_changes.push(change);
    }

    #[must_use]
    pub fn state_changes(&self) -> &[crate::state_change::StateChange] {
        &self.state_changes
    }

    pub fn state_changes_mut(&mut self) -> &mut Vec<crate::state_change::StateChange> {
        &mut self.state_changes
    }

    /// Drops finished and failed state changes.
    pub fn cleanup_state_changes(&mut self) {
        use crate::state_change::ScState;
        self.state_changes
            .retain(|c| c.state() != ScState::Finished && c.state() != ScState::Failed);
    }
}

/// Owner of the light and sensor resources; devices resolve their
/// sub-devices through this container by (prefix, unique id).
#[derive(Debug, Default)]
pub struct ResourceContainer {
    pub lights: Vec<Resource>,
    pub sensors: Vec<Resource>,
}

impl ResourceContainer {
    #[must_use]
    pub fn get(&self, prefix: &str, identifier: &str) -> Option<&Resource> {
        self.vec_for(prefix)?
            .iter()
            .find(|r| r.unique_id() == identifier || r.to_str(RATTR_ID) == identifier)
    }

    pub fn get_mut(&mut self, prefix: &str, identifier: &str) -> Option<&mut Resource> {
        self.vec_for_mut(prefix)?
            .iter_mut()
            .find(|r| r.unique_id() == identifier || r.to_str(RATTR_ID) == identifier)
    }

    pub fn add(&mut self, resource: Resource) -> Option<&mut Resource> {
        let prefix = resource.prefix();
        let vec = self.vec_for_mut(prefix)?;
        vec.push(resource);
        vec.last_mut()
    }

    fn vec_for(&self, prefix: &str) -> Option<&Vec<Resource>> {
        match prefix {
            R_LIGHTS => Some(&self.lights),
            R_SENSORS => Some(&self.sensors),
            _ => None,
        }
    }

    fn vec_for_mut(&mut self, prefix: &str) -> Option<&mut Vec<Resource>> {
        match prefix {
            R_LIGHTS => Some(&mut self.lights),
            R_SENSORS => Some(&mut self.sensors),
            _ => None,
        }
    }
}
