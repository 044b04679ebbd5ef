//! REST surface for `/alarmsystems`
//!
//! Bridge-style request/response shapes: successes are lists of
//! `{"success": {"/alarmsystems/1/config/armmode": "armed_away"}}` entries,
//! errors are `{"error": {"type", "address", "description"}}` objects with
//! HTTP 400 for JSON/value errors, 404 for missing resources and 503 for
//! internal failures.

use std::sync::Arc;

use alarm_system::device_table::entry_flags;
use alarm_system::{panel_status_to_string, ArmMode};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::resource::{
    RATTR_NAME, RATTR_TYPE, RCONFIG_ARMED_AWAY_ENTRY_DELAY, RCONFIG_ARMED_AWAY_EXIT_DELAY,
    RCONFIG_ARMED_AWAY_TRIGGER_DURATION, RCONFIG_ARMED_NIGHT_ENTRY_DELAY,
    RCONFIG_ARMED_NIGHT_EXIT_DELAY, RCONFIG_ARMED_NIGHT_TRIGGER_DURATION,
    RCONFIG_ARMED_STAY_ENTRY_DELAY, RCONFIG_ARMED_STAY_EXIT_DELAY,
    RCONFIG_ARMED_STAY_TRIGGER_DURATION, RCONFIG_ARM_MODE, RCONFIG_CONFIGURED,
    RCONFIG_DISARMED_ENTRY_DELAY, RCONFIG_DISARMED_EXIT_DELAY, RSTATE_ACTION,
    RSTATE_BUTTON_EVENT, RSTATE_ON, RSTATE_OPEN, RSTATE_PRESENCE, RSTATE_SECONDS_REMAINING,
    RSTATE_VIBRATION, R_LIGHTS, R_SENSORS,
};
use gateway_core::{ItemValue, Resource};
use serde_json::{json, Map, Value};

use crate::{ApiState, Gateway};

/// Writable per-mode configuration fields and their item suffixes.
const CONFIG_FIELDS: [(&str, &str); 11] = [
    ("disarmed_entry_delay", RCONFIG_DISARMED_ENTRY_DELAY),
    ("disarmed_exit_delay", RCONFIG_DISARMED_EXIT_DELAY),
    ("armed_away_entry_delay", RCONFIG_ARMED_AWAY_ENTRY_DELAY),
    ("armed_away_exit_delay", RCONFIG_ARMED_AWAY_EXIT_DELAY),
    ("armed_away_trigger_duration", RCONFIG_ARMED_AWAY_TRIGGER_DURATION),
    ("armed_stay_entry_delay", RCONFIG_ARMED_STAY_ENTRY_DELAY),
    ("armed_stay_exit_delay", RCONFIG_ARMED_STAY_EXIT_DELAY),
    ("armed_stay_trigger_duration", RCONFIG_ARMED_STAY_TRIGGER_DURATION),
    ("armed_night_entry_delay", RCONFIG_ARMED_NIGHT_ENTRY_DELAY),
    ("armed_night_exit_delay", RCONFIG_ARMED_NIGHT_EXIT_DELAY),
    ("armed_night_trigger_duration", RCONFIG_ARMED_NIGHT_TRIGGER_DURATION),
];

/// Trigger items a device may fan into the alarm system with, in
/// auto-selection order.
const TRIGGER_SUFFIXES: [&str; 5] = [
    RSTATE_PRESENCE,
    RSTATE_VIBRATION,
    RSTATE_OPEN,
    RSTATE_BUTTON_EVENT,
    RSTATE_ON,
];

/// Bridge-style API error.
pub struct ApiError {
    status: StatusCode,
    error_type: i32,
    address: String,
    description: String,
}

impl ApiError {
    pub fn invalid_json(address: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: 2,
            address: address.into(),
            description: "body contains invalid JSON".into(),
        }
    }

    pub fn not_found(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            status: StatusCode::NOT_FOUND,
            error_type: 3,
            description: format!("resource, {address}, not available"),
            address,
        }
    }

    pub fn invalid_value(address: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: 7,
            address: address.into(),
            description: description.into(),
        }
    }

    pub fn internal(address: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error_type: 901,
            address: address.into(),
            description: "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.error_type,
                "address": self.address,
                "description": self.description,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

fn success_entry(address: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(address, value);
    json!({ "success": Value::Object(map) })
}

fn parse_body(body: &str, address: &str) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ApiError::invalid_json(address)),
    }
}

/// JSON view of one alarm system.
fn alarm_system_to_json(gateway: &Gateway, id: u32) -> Option<Value> {
    let system = gateway.alarms.get(id)?;
    let r = system.resource();

    let mut config = Map::new();
    config.insert("armmode".into(), r.to_variant(RCONFIG_ARM_MODE));
    config.insert("configured".into(), r.to_variant(RCONFIG_CONFIGURED));
    for (field, suffix) in CONFIG_FIELDS {
        config.insert(field.into(), r.to_variant(suffix));
    }

    let state = json!({
        "armstate": panel_status_to_string(system.ias_ace_panel_status()),
        "seconds_remaining": r.to_variant(RSTATE_SECONDS_REMAINING),
    });

    let mut devices = Map::new();
    for i in 0..gateway.dev_table.size() {
        let entry = gateway.dev_table.at(i);
        if !entry.is_valid() || u32::from(entry.alarm_system_id) != id {
            continue;
        }

        let mut device = Map::new();
        device.insert("armmask".into(), Value::String(entry.arm_mask_string().to_string()));
        if let Some(trigger) = gateway.triggers.get(entry.unique_id()) {
            device.insert("trigger".into(), Value::String(trigger.clone()));
        }
        devices.insert(entry.unique_id().to_string(), Value::Object(device));
    }

    Some(json!({
        "name": r.to_variant(RATTR_NAME),
        "config": Value::Object(config),
        "state": state,
        "devices": Value::Object(devices),
    }))
}

/// GET /alarmsystems
pub async fn get_all(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let gateway = state.gateway.lock().map_err(|_| ApiError::internal("/alarmsystems"))?;

    let mut map = Map::new();
    for system in &gateway.alarms.systems {
        let id = system.id();
        if let Some(value) = alarm_system_to_json(&gateway, id) {
            map.insert(id.to_string(), value);
        }
    }

    Ok(Json(Value::Object(map)))
}

/// GET /alarmsystems/{id}
pub async fn get_one(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}");
    let gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;

    alarm_system_to_json(&gateway, id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(address))
}

/// PUT /alarmsystems/{id}: name update.
pub async fn put_attributes(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}");
    let map = parse_body(&body, &address)?;

    let mut gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;
    let gateway = &mut *gateway;

    if gateway.alarms.get(id).is_none() {
        return Err(ApiError::not_found(address));
    }

    let mut result = Vec::new();

    for (field, value) in map {
        if field != "name" {
            return Err(ApiError::invalid_value(
                format!("{address}/{field}"),
                format!("parameter, {field}, not available"),
            ));
        }

        let Some(name) = value.as_str() else {
            return Err(ApiError::invalid_value(
                format!("{address}/name"),
                "invalid value for parameter, name",
            ));
        };

        let store = Arc::clone(&gateway.store);
        let Some(system) = gateway.alarms.get_mut(id) else {
            return Err(ApiError::not_found(address));
        };
        system.set_value(
            RATTR_NAME,
            ItemValue::Str(name.to_string()),
            &mut gateway.core.bus,
            store.as_ref(),
        );

        result.push(success_entry(format!("{address}/name"), value.clone()));
    }

    Ok(Json(Value::Array(result)))
}

/// PUT /alarmsystems/{id}/config: per-mode delays, trigger durations and
/// the PIN (`code0`).
pub async fn put_config(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}/config");
    let map = parse_body(&body, &address)?;

    let mut gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;
    let gateway = &mut *gateway;

    if gateway.alarms.get(id).is_none() {
        return Err(ApiError::not_found(format!("/alarmsystems/{id}")));
    }

    let store = Arc::clone(&gateway.store);
    let mut result = Vec::new();

    for (field, value) in map {
        if field == "code0" {
            let Some(code) = value.as_str() else {
                return Err(ApiError::invalid_value(
                    format!("{address}/code0"),
                    "invalid value for parameter, code0",
                ));
            };
            if code.len() < 4 || code.len() > 16 {
                return Err(ApiError::invalid_value(
                    format!("{address}/code0"),
                    "invalid value for parameter, code0",
                ));
            }

            let Some(system) = gateway.alarms.get_mut(id) else {
                return Err(ApiError::not_found(format!("/alarmsystems/{id}")));
            };
            if !system.set_code(0, code, &mut gateway.core.bus, store.as_ref()) {
                return Err(ApiError::internal(format!("{address}/code0")));
            }

            // never echo the PIN back
            result.push(success_entry(format!("{address}/code0"), Value::String("****".into())));
            continue;
        }

        let Some(suffix) = CONFIG_FIELDS.iter().find(|(f, _)| *f == field).map(|(_, s)| *s)
        else {
            return Err(ApiError::invalid_value(
                format!("{address}/{field}"),
                format!("parameter, {field}, not available"),
            ));
        };

        let Some(num) = value.as_i64().filter(|n| (0..=255).contains(n)) else {
            return Err(ApiError::invalid_value(
                format!("{address}/{field}"),
                format!("invalid value for parameter, {field}"),
            ));
        };

        let Some(system) = gateway.alarms.get_mut(id) else {
            return Err(ApiError::not_found(format!("/alarmsystems/{id}")));
        };
        if !system.set_value(suffix, ItemValue::Num(num), &mut gateway.core.bus, store.as_ref()) {
            return Err(ApiError::invalid_value(
                format!("{address}/{field}"),
                format!("invalid value for parameter, {field}"),
            ));
        }

        result.push(success_entry(format!("{address}/{field}"), value.clone()));
    }

    Ok(Json(Value::Array(result)))
}

async fn put_arm_mode(
    state: Arc<ApiState>,
    id: u32,
    mode: ArmMode,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}/{}", mode.to_str());
    let map = parse_body(&body, &address)?;

    let Some(code0) = map.get("code0").and_then(Value::as_str) else {
        return Err(ApiError::invalid_value(
            format!("{address}/code0"),
            "missing parameter, code0",
        ));
    };

    let mut gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;
    let gateway = &mut *gateway;

    let store = Arc::clone(&gateway.store);
    let dev_table = &gateway.dev_table;

    let Some(system) = gateway.alarms.get_mut(id) else {
        return Err(ApiError::not_found(format!("/alarmsystems/{id}")));
    };

    if !system.is_valid_code(code0, 0, dev_table, store.as_ref()) {
        return Err(ApiError::invalid_value(
            format!("{address}/code0"),
            "invalid value, code0",
        ));
    }

    system.set_target_arm_mode(mode, &mut gateway.core.bus, store.as_ref());

    Ok(Json(success_entry(
        format!("/alarmsystems/{id}/config/armmode"),
        Value::String(mode.to_str().to_string()),
    )))
}

/// PUT /alarmsystems/{id}/disarm
pub async fn put_disarm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    put_arm_mode(state, id, ArmMode::Disarmed, body).await
}

/// PUT /alarmsystems/{id}/arm_stay
pub async fn put_arm_stay(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    put_arm_mode(state, id, ArmMode::ArmedStay, body).await
}

/// PUT /alarmsystems/{id}/arm_night
pub async fn put_arm_night(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    put_arm_mode(state, id, ArmMode::ArmedNight, body).await
}

/// PUT /alarmsystems/{id}/arm_away
pub async fn put_arm_away(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    put_arm_mode(state, id, ArmMode::ArmedAway, body).await
}

fn find_target_resource<'a>(gateway: &'a Gateway, unique_id: &str) -> Option<&'a Resource> {
    gateway
        .core
        .resources
        .get(R_SENSORS, unique_id)
        .or_else(|| gateway.core.resources.get(R_LIGHTS, unique_id))
}

/// An IAS ACE keypad or keyfob may be added without an arm mask.
fn is_keypad(r: &Resource) -> bool {
    r.item(RSTATE_ACTION).is_some() || r.to_str(RATTR_TYPE) == "ZHAAncillaryControl"
}

fn parse_arm_mask(mask: &str) -> Option<u32> {
    let mut flags = 0u32;
    for c in mask.chars() {
        match c {
            'A' => flags |= entry_flags::ARMED_AWAY,
            'S' => flags |= entry_flags::ARMED_STAY,
            'N' => flags |= entry_flags::ARMED_NIGHT,
            _ => return None,
        }
    }
    Some(flags)
}

/// PUT /alarmsystems/{id}/device/{uniqueid}
pub async fn put_device(
    State(state): State<Arc<ApiState>>,
    Path((id, unique_id)): Path<(u32, String)>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}/device/{unique_id}");
    let map = if body.trim().is_empty() {
        Map::new()
    } else {
        parse_body(&body, &address)?
    };

    let mut gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;
    let gateway = &mut *gateway;

    if gateway.alarms.get(id).is_none() {
        return Err(ApiError::not_found(format!("/alarmsystems/{id}")));
    }

    let Some(target) = find_target_resource(gateway, &unique_id) else {
        return Err(ApiError::not_found(address));
    };

    let keypad = is_keypad(target);

    let mut flags = 0u32;
    if keypad {
        flags |= entry_flags::IAS_ACE;
    }

    match map.get("armmask").and_then(Value::as_str) {
        Some(mask) => match parse_arm_mask(mask) {
            Some(mask_flags) => flags |= mask_flags,
            None => {
                return Err(ApiError::invalid_value(
                    format!("{address}/armmask"),
                    "invalid value for parameter, armmask",
                ));
            }
        },
        None if !keypad => {
            return Err(ApiError::invalid_value(
                format!("{address}/armmask"),
                "missing parameter, armmask",
            ));
        }
        None => {}
    }

    // trigger: explicit, or first match on the target device
    let trigger = match map.get("trigger").and_then(Value::as_str) {
        Some(trigger) => {
            if !TRIGGER_SUFFIXES.contains(&trigger) || target.item(trigger).is_none() {
                return Err(ApiError::invalid_value(
                    format!("{address}/trigger"),
                    "invalid value for parameter, trigger",
                ));
            }
            Some(trigger.to_string())
        }
        None => TRIGGER_SUFFIXES
            .iter()
            .find(|suffix| target.item(suffix).is_some())
            .map(|s| (*s).to_string()),
    };

    let store = Arc::clone(&gateway.store);
    if !gateway.dev_table.put(&unique_id, flags, id as u8, store.as_ref()) {
        return Err(ApiError::invalid_value(address, "invalid value for parameter, device"));
    }

    let entry = gateway.dev_table.get(&unique_id);
    let armmask = entry.arm_mask_string().to_string();

    match trigger {
        Some(trigger) => {
            gateway.triggers.insert(unique_id.clone(), trigger);
        }
        None => {
            gateway.triggers.remove(&unique_id);
        }
    }

    Ok(Json(Value::Array(vec![success_entry(
        format!("{address}/armmask"),
        Value::String(armmask),
    )])))
}

/// DELETE /alarmsystems/{id}/device/{uniqueid}
pub async fn delete_device(
    State(state): State<Arc<ApiState>>,
    Path((id, unique_id)): Path<(u32, String)>,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/alarmsystems/{id}/device/{unique_id}");

    let mut gateway = state.gateway.lock().map_err(|_| ApiError::internal(address.clone()))?;
    let gateway = &mut *gateway;

    let entry = gateway.dev_table.get(&unique_id);
    if !entry.is_valid() || u32::from(entry.alarm_system_id) != id {
        return Err(ApiError::not_found(address));
    }

    let store = Arc::clone(&gateway.store);
    if !gateway.dev_table.erase(&unique_id, store.as_ref()) {
        return Err(ApiError::internal(address));
    }

    gateway.triggers.remove(&unique_id);

    Ok(Json(Value::Array(vec![success_entry(address, Value::String("deleted".into()))])))
}
