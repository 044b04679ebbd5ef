//! DDF-driven access functions
//!
//! The read, parse and write families share one shape: they are selected by
//! the `fn` field of an item's access parameter object and operate on the
//! resource/item pair using the APS boundary. Parse functions feed decoded
//! attributes through the JS sandbox; the typical expression is
//! `Item.val = Attr.val + R.item('config/offset').val`.

use serde_json::Value;

use zigbee_aps::zcl::{
    zcl_command, zcl_status, Reader, ZCL_FC_CLUSTER_COMMAND, ZCL_FC_DISABLE_DEFAULT_RESPONSE,
    ZCL_FC_MANUFACTURER_SPECIFIC, ZCL_FC_PROFILE_COMMAND,
};
use zigbee_aps::{
    clusters, data_type, Address, ApsDataIndication, ApsDataRequest, Node, ZclAttribute, ZclFrame,
    ZclValue,
};

use crate::aps_wrapper::ApsSend;
use crate::clock::{system_now_ms, SteadyTime};
use crate::js::{DeviceJs, JsEvalResult};
use crate::resource::{
    DataType, ItemValue, Resource, ValueSource, ZclParam, RSTATE_ALARM, RSTATE_CARBON_MONOXIDE,
    RSTATE_FIRE, RSTATE_LAST_SET, RSTATE_LOCALTIME, RSTATE_LOW_BATTERY, RSTATE_OPEN,
    RSTATE_PRESENCE, RSTATE_TAMPERED, RSTATE_TEST, RSTATE_UTC, RSTATE_VIBRATION, RSTATE_WATER,
};
use crate::uniqueid::parse_unique_id;

/// Accept incoming commands from any endpoint.
pub const BROADCAST_ENDPOINT: u8 = 255;
/// Use the endpoint encoded in the resource's unique id.
pub const AUTO_ENDPOINT: u8 = 0;

const TIME_CLUSTER_ATTR_TIME: u16 = 0x0000;
const TIME_CLUSTER_ATTR_LOCAL_TIME: u16 = 0x0007;
const TIME_CLUSTER_ATTR_LAST_SET_TIME: u16 = 0x0008;

/// Seconds between 2000-01-01T00:00:00Z (the ZCL epoch) and the Unix epoch.
const ZCL_EPOCH_OFFSET_S: i64 = 946_684_800;

/// Tuya cluster command ids
mod tuya_cmd {
    pub const TY_DATA_REQUEST: u8 = 0x00;
    pub const TY_DATA_RESPONSE: u8 = 0x01;
    pub const TY_DATA_REPORT: u8 = 0x02;
    pub const TY_DATA_QUERY: u8 = 0x03;
    pub const TUYA_MCU_SYNC_TIME: u8 = 0x24;
}

/// Tuya datapoint value types
mod tuya_dt {
    pub const RAW: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const VALUE: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const ENUM: u8 = 0x04;
    pub const BITMAP: u8 = 0x05;
}

/// IAS Zone cluster: status change notification command and status bits.
mod ias_zone {
    pub const CMD_STATUS_CHANGE_NOTIFICATION: u8 = 0x00;
    pub const ATTR_ZONE_STATUS: u16 = 0x0002;
    pub const STATUS_ALARM1: u16 = 0x0001;
    pub const STATUS_ALARM2: u16 = 0x0002;
    pub const STATUS_TAMPER: u16 = 0x0004;
    pub const STATUS_BATTERY: u16 = 0x0008;
    pub const STATUS_TEST: u16 = 0x0100;
}

/// Result of a read function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub is_enqueued: bool,
    pub aps_req_id: u8,
    pub sequence_number: u8,
}

/// NWK and extended address of the device a resource belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceAddress {
    pub nwk: u16,
    pub ext: u64,
}

impl DeviceAddress {
    #[must_use]
    pub fn aps(&self) -> Address {
        Address::nwk_and_ext(self.nwk, self.ext)
    }
}

/// Mutable state shared by all access function invocations.
#[derive(Debug, Default)]
pub struct AccessState {
    /// The Tuya all-data query is rate limited globally; the device-side
    /// report timer re-arms on each received query.
    pub last_tuya_query: Option<SteadyTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFunction {
    Zcl,
    TuyaAllData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFunction {
    Zcl,
    Tuya,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFunction {
    Zcl,
    XiaomiSpecial,
    IasZoneStatus,
    Tuya,
    NumToStr,
    Time,
    TuyaTime,
}

fn function_name(params: &Value) -> Option<&str> {
    let map = params.as_object()?;
    if map.is_empty() {
        return None;
    }
    // `fn` defaults to the generic ZCL handler
    Some(map.get("fn").and_then(Value::as_str).unwrap_or("zcl"))
}

/// Selects the read function; unknown selectors disable the item.
#[must_use]
pub fn get_read_function(params: &Value) -> Option<ReadFunction> {
    match function_name(params)? {
        "zcl" => Some(ReadFunction::Zcl),
        "tuya" => Some(ReadFunction::TuyaAllData),
        _ => None,
    }
}

#[must_use]
pub fn get_write_function(params: &Value) -> Option<WriteFunction> {
    match function_name(params)? {
        "zcl" => Some(WriteFunction::Zcl),
        "tuya" => Some(WriteFunction::Tuya),
        "time" => Some(WriteFunction::Time),
        _ => None,
    }
}

#[must_use]
pub fn get_parse_function(params: &Value) -> Option<ParseFunction> {
    match function_name(params)? {
        "zcl" => Some(ParseFunction::Zcl),
        "xiaomi:special" => Some(ParseFunction::XiaomiSpecial),
        "ias:zonestatus" => Some(ParseFunction::IasZoneStatus),
        "tuya" => Some(ParseFunction::Tuya),
        "numtostr" => Some(ParseFunction::NumToStr),
        "time" => Some(ParseFunction::Time),
        "tuyatime" => Some(ParseFunction::TuyaTime),
        _ => None,
    }
}

/// Reads an unsigned integer which may be a JSON number or a string
/// (decimal or `0x` hex), bounded by \p max.
#[must_use]
pub fn variant_to_uint(value: &Value, max: u64) -> Option<u64> {
    let v = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()?
            } else {
                s.parse::<u64>().ok()?
            }
        }
        _ => return None,
    };

    (v <= max).then_some(v)
}

/// Extracts the common ZCL parameters (`ep`, `cl`, `at`, `mf`, `cmd`) from
/// an access parameter object.
#[must_use]
pub fn get_zcl_param(params: &Value) -> ZclParam {
    let mut result = ZclParam::default();

    let Some(map) = params.as_object() else {
        return result;
    };
    if !map.contains_key("cl") {
        return result;
    }

    let ep = match map.get("ep") {
        Some(v) => match variant_to_uint(v, u8::MAX as u64) {
            Some(ep) => ep as u8,
            None => return result,
        },
        None => AUTO_ENDPOINT,
    };

    let Some(cl) = map.get("cl").and_then(|v| variant_to_uint(v, u16::MAX as u64)) else {
        return result;
    };

    let mf = match map.get("mf") {
        Some(v) => match variant_to_uint(v, u16::MAX as u64) {
            Some(mf) => mf as u16,
            None => return result,
        },
        None => 0,
    };

    if let Some(cmd) = map.get("cmd") {
        match variant_to_uint(cmd, u8::MAX as u64) {
            Some(cmd) => {
                result.command_id = cmd as u8;
                result.has_command_id = true;
            }
            None => return result,
        }
    }

    match map.get("at") {
        None => {
            // guard against a missing "at" when the expression uses Attr
            if map.get("eval").and_then(Value::as_str).is_some_and(|e| e.contains("Attr")) {
                return result;
            }
        }
        Some(Value::String(s)) => {
            match variant_to_uint(&Value::String(s.clone()), u16::MAX as u64) {
                Some(at) => {
                    result.attributes[0] = at as u16;
                    result.attribute_count = 1;
                }
                None => return result,
            }
        }
        Some(Value::Array(list)) => {
            for at in list {
                if result.attribute_count == ZclParam::MAX_ATTRIBUTES {
                    break;
                }
                match variant_to_uint(at, u16::MAX as u64) {
                    Some(at) => {
                        result.attributes[result.attribute_count] = at as u16;
                        result.attribute_count += 1;
                    }
                    None => return result,
                }
            }
            if result.attribute_count != list.len() {
                return result;
            }
        }
        Some(_) => return result,
    }

    result.endpoint = ep;
    result.cluster_id = cl as u16;
    result.manufacturer_code = mf;
    result.valid = true;
    result
}

/// Derives the endpoint from the resource's unique id (`-ee` part).
#[must_use]
pub fn resolve_auto_endpoint(r: &Resource) -> u8 {
    parse_unique_id(r.unique_id())
        .map(|p| p.endpoint)
        .filter(|ep| *ep < BROADCAST_ENDPOINT)
        .unwrap_or(AUTO_ENDPOINT)
}

// ---------------------------------------------------------------------------
// read functions

/// Builds and sends a ZCL Read Attributes request per the item's `read`
/// parameters: `{"fn": "zcl", "ep": ep, "cl": cl, "at": at, "mf": mf}`.
fn read_zcl_attribute(
    r: &Resource,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
) -> ReadResult {
    let mut result = ReadResult::default();

    let mut param = get_zcl_param(params);
    if !param.valid {
        return result;
    }

    if param.endpoint == AUTO_ENDPOINT {
        param.endpoint = resolve_auto_endpoint(r);
        if param.endpoint == AUTO_ENDPOINT {
            return result;
        }
    }

    let mut frame_control = ZCL_FC_PROFILE_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE;
    if param.manufacturer_code != 0 {
        frame_control |= ZCL_FC_MANUFACTURER_SPECIFIC;
    }

    let mut payload = Vec::with_capacity(param.attribute_count * 2);
    for at in &param.attributes[..param.attribute_count] {
        payload.extend_from_slice(&at.to_le_bytes());
    }

    let frame = ZclFrame {
        frame_control,
        manufacturer_code: param.manufacturer_code,
        sequence_number: ctrl.next_zcl_sequence(),
        command_id: zcl_command::READ_ATTRIBUTES,
        payload,
    };

    let mut req = ApsDataRequest::unicast(addr.aps(), param.endpoint, param.cluster_id, frame.serialize());
    req.dst_addr_mode = zigbee_aps::AddressMode::Nwk;

    match ctrl.send(&req) {
        Ok(id) => {
            result.is_enqueued = true;
            result.aps_req_id = id;
            result.sequence_number = frame.sequence_number;
        }
        Err(err) => {
            tracing::debug!("read {}: {err}", r.unique_id());
        }
    }

    result
}

/// Sends a Tuya data query which makes the device report all datapoints.
/// Rate limited globally: the device-side report timer resets on each
/// received query, so a single query drains everything.
fn read_tuya_all_data(
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    state: &mut AccessState,
    now: SteadyTime,
) -> ReadResult {
    let mut result = ReadResult::default();

    if let Some(last) = state.last_tuya_query {
        if now.elapsed_since(last) < 15_000 {
            return result;
        }
    }
    state.last_tuya_query = Some(now);

    let frame = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
        manufacturer_code: 0,
        sequence_number: ctrl.next_zcl_sequence(),
        command_id: tuya_cmd::TY_DATA_QUERY,
        payload: Vec::new(),
    };

    let req = ApsDataRequest::unicast(addr.aps(), 1, clusters::TUYA, frame.serialize());

    if let Ok(id) = ctrl.send(&req) {
        result.is_enqueued = true;
        result.aps_req_id = id;
        result.sequence_number = frame.sequence_number;
    }

    result
}

/// Dispatches the read function bound to \p params.
pub fn read_item(
    r: &Resource,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
    state: &mut AccessState,
    now: SteadyTime,
) -> ReadResult {
    match get_read_function(params) {
        Some(ReadFunction::Zcl) => read_zcl_attribute(r, addr, ctrl, params),
        Some(ReadFunction::TuyaAllData) => read_tuya_all_data(addr, ctrl, state, now),
        None => ReadResult::default(),
    }
}

// ---------------------------------------------------------------------------
// parse helpers

/// Runs the `eval` expression with \p attr bound and applies recorded item
/// writes back to the resource with source `Device`.
fn eval_zcl_attribute(
    r: &mut Resource,
    suffix: &str,
    node: Option<&Node>,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    attr_index: usize,
    attr: &ZclAttribute,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    let Some(expr) = params.get("eval").and_then(Value::as_str) else {
        return false;
    };
    if expr.is_empty() {
        return false;
    }

    js.reset();
    js.set_resource(r);
    if let Some(node) = node {
        js.set_node(node);
    }
    let Some(item) = r.item(suffix) else {
        return false;
    };
    js.set_item(item);
    js.set_zcl_attribute(attr_index, attr);
    js.set_zcl_frame(frame);
    js.set_aps_indication(ind);

    if js.evaluate(expr) == JsEvalResult::Ok {
        tracing::trace!(
            "{}/{} expression: {} --> {}",
            r.unique_id(),
            suffix,
            expr,
            js.result()
        );
        apply_js_writes(r, js) > 0 || !js.result().is_null()
    } else {
        tracing::debug!(
            "failed to evaluate expression for {}/{}: {}, err: {}",
            r.unique_id(),
            suffix,
            expr,
            js.error_string()
        );
        false
    }
}

/// Like `eval_zcl_attribute` without a bound attribute (whole-frame eval).
fn eval_zcl_frame(
    r: &mut Resource,
    suffix: &str,
    node: Option<&Node>,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    let Some(expr) = params.get("eval").and_then(Value::as_str) else {
        return false;
    };
    if expr.is_empty() {
        return false;
    }

    js.reset();
    js.set_resource(r);
    if let Some(node) = node {
        js.set_node(node);
    }
    let Some(item) = r.item(suffix) else {
        return false;
    };
    js.set_item(item);
    js.set_zcl_frame(frame);
    js.set_aps_indication(ind);

    if js.evaluate(expr) == JsEvalResult::Ok {
        apply_js_writes(r, js) > 0 || !js.result().is_null()
    } else {
        tracing::debug!(
            "failed to evaluate expression for {}/{}: {}, err: {}",
            r.unique_id(),
            suffix,
            expr,
            js.error_string()
        );
        false
    }
}

/// Applies the sandbox's recorded item writes; returns how many stuck.
fn apply_js_writes(r: &mut Resource, js: &DeviceJs) -> usize {
    let mut applied = 0;

    for (suffix, value) in js.items_set() {
        let Some(item) = r.item_mut(suffix) else {
            continue;
        };
        match item.set_variant(value, ValueSource::Device) {
            Ok(()) => applied += 1,
            Err(err) => tracing::warn!("{}: {err}", suffix),
        }
    }

    applied
}

// ---------------------------------------------------------------------------
// parse functions

/// The generic ZCL parse: `{"fn": "zcl", "ep", "cl", "at", "mf", "eval"}`.
/// Walks read-response and report payloads, binds each matched attribute
/// and evaluates the expression.
fn parse_zcl_attribute(
    r: &mut Resource,
    suffix: &'static str,
    node: Option<&Node>,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    params: &Value,
    js: &mut DeviceJs,
    now: SteadyTime,
) -> bool {
    let mut result = false;

    // decode and cache the ZCL parameters on first use
    if r.item(suffix).is_some_and(|i| i.zcl_param().is_none()) {
        let mut param = get_zcl_param(params);
        if !param.valid {
            return result;
        }
        if param.endpoint == AUTO_ENDPOINT {
            param.endpoint = resolve_auto_endpoint(r);
            if param.endpoint == AUTO_ENDPOINT {
                return result;
            }
        }
        if let Some(item) = r.item_mut(suffix) {
            item.set_zcl_param(param);
            item.set_parse_inited();
        }
    }

    let Some(zcl_param) = r.item(suffix).and_then(|i| i.zcl_param()).copied() else {
        return result;
    };

    if zcl_param.has_command_id {
        if zcl_param.command_id != frame.command_id {
            return result;
        }
    } else if frame.command_id != zcl_command::READ_ATTRIBUTES_RESPONSE
        && frame.command_id != zcl_command::REPORT_ATTRIBUTES
    {
        return result;
    }

    if zcl_param.manufacturer_code != frame.manufacturer_code {
        return result;
    }

    if ind.cluster_id != zcl_param.cluster_id {
        return result;
    }

    if zcl_param.endpoint < BROADCAST_ENDPOINT && zcl_param.endpoint != ind.src_endpoint {
        return result;
    }

    if zcl_param.attribute_count == 0 {
        // attributes are optional; evaluate over the whole frame
        return eval_zcl_frame(r, suffix, node, ind, frame, params, js);
    }

    if frame.payload.is_empty() {
        return result;
    }

    let mut reader = Reader::new(&frame.payload);
    let mut attr_index = 0usize;

    while !reader.at_end() {
        let Ok(attr_id) = reader.u16_le() else { break };

        if frame.command_id == zcl_command::READ_ATTRIBUTES_RESPONSE {
            let Ok(status) = reader.u8() else { break };
            if status != zcl_status::SUCCESS {
                if status == zcl_status::UNSUPPORTED_ATTRIBUTE && zcl_param.has_attribute(attr_id) {
                    if let Some(item) = r.item_mut(suffix) {
                        item.set_zcl_unsupported();
                    }
                }
                continue;
            }
        }

        let Ok(dt) = reader.u8() else { break };
        let mut attr = ZclAttribute::new(attr_id, dt);
        if attr.read_value(&mut reader).is_err() {
            break;
        }

        if zcl_param.has_attribute(attr.id)
            && eval_zcl_attribute(r, suffix, node, ind, frame, attr_index, &attr, params, js)
        {
            if frame.command_id == zcl_command::REPORT_ATTRIBUTES {
                if let Some(item) = r.item_mut(suffix) {
                    item.set_last_zcl_report(now);
                }
            }
            result = true;
        }

        attr_index += 1;
    }

    result
}

/// Walks the Xiaomi composite attribute (0xff01 tagged string, 0xff02
/// struct with running index, 0x00f7 tagged octet string) and extracts the
/// value for \p rtag.
fn parse_xiaomi_tag(rtag: u8, frame: &ZclFrame) -> Option<ZclAttribute> {
    let mut reader = Reader::new(&frame.payload);

    let mut attr_id: u16 = 0;
    let mut struct_elements: u16 = 0;

    while attr_id == 0 && !reader.at_end() {
        let a = reader.u16_le().ok()?;
        let dt = reader.u8().ok()?;

        let mut length = 0u8;
        if dt == data_type::CHARACTER_STRING || dt == data_type::OCTET_STRING {
            length = reader.u8().ok()?;
        }

        if a == 0xff01 && dt == data_type::CHARACTER_STRING {
            attr_id = a;
        } else if a == 0xff02 && dt == data_type::STRUCT {
            attr_id = a;
            struct_elements = reader.u16_le().ok()?;
        } else if a == 0x00f7 && dt == data_type::OCTET_STRING {
            attr_id = a;
        }

        if dt == data_type::CHARACTER_STRING && attr_id != 0xff01 {
            reader.skip(usize::from(length)).ok()?;
        }
    }

    if attr_id == 0 || reader.at_end() {
        return None;
    }

    let mut tag: u8 = 0;

    while !reader.at_end() {
        if attr_id == 0xff01 || attr_id == 0x00f7 {
            tag = reader.u8().ok()?;
        }

        let dt = reader.u8().ok()?;
        let mut attr = ZclAttribute::new(u16::from(tag), dt);
        attr.read_value(&mut reader).ok()?;

        if tag == rtag {
            return Some(attr);
        }

        if struct_elements > 0 {
            tag += 1; // running struct index
        }
    }

    None
}

/// `{"fn": "xiaomi:special", "ep", "at": 0xff01|0xff02|0x00f7, "idx", "eval"}`
fn parse_xiaomi_special(
    r: &mut Resource,
    suffix: &'static str,
    node: Option<&Node>,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    params: &Value,
    js: &mut DeviceJs,
    _now: SteadyTime,
) -> bool {
    if frame.command_id != zcl_command::REPORT_ATTRIBUTES {
        return false;
    }

    // must be basic or lumi specific cluster
    if ind.cluster_id != clusters::BASIC && ind.cluster_id != clusters::XIAOMI_LUMI {
        return false;
    }

    if r.item(suffix).is_some_and(|i| i.zcl_param().is_none()) {
        let Some(map) = params.as_object() else {
            return false;
        };

        let mut param = ZclParam {
            endpoint: BROADCAST_ENDPOINT,
            cluster_id: ind.cluster_id,
            ..ZclParam::default()
        };
        if ind.cluster_id == clusters::XIAOMI_LUMI {
            param.manufacturer_code = 0x115f;
        }

        if let Some(ep) = map.get("ep") {
            match variant_to_uint(ep, u8::MAX as u64) {
                Some(ep) => param.endpoint = ep as u8,
                None => return false,
            }
        }

        let Some(at) = map.get("at").and_then(|v| variant_to_uint(v, u16::MAX as u64)) else {
            return false;
        };
        let Some(idx) = map.get("idx").and_then(|v| variant_to_uint(v, u16::MAX as u64)) else {
            return false;
        };

        debug_assert!(at == 0xff01 || at == 0xff02 || at == 0x00f7);

        param.attribute_count = 2;
        param.attributes[0] = at as u16;
        // keep the tag/idx as second "attribute id"
        param.attributes[1] = idx as u16;

        if param.endpoint == AUTO_ENDPOINT {
            param.endpoint = resolve_auto_endpoint(r);
            if param.endpoint == AUTO_ENDPOINT {
                return false;
            }
        }

        param.valid = true;
        if let Some(item) = r.item_mut(suffix) {
            item.set_zcl_param(param);
            item.set_parse_inited();
        }
    }

    let Some(zcl_param) = r.item(suffix).and_then(|i| i.zcl_param()).copied() else {
        return false;
    };

    if frame.payload.is_empty() {
        return false;
    }

    if zcl_param.endpoint < BROADCAST_ENDPOINT && zcl_param.endpoint != ind.src_endpoint {
        return false;
    }

    debug_assert_eq!(zcl_param.attribute_count, 2);
    let Some(attr) = parse_xiaomi_tag(zcl_param.attributes[1] as u8, frame) else {
        return false;
    };

    eval_zcl_attribute(r, suffix, node, ind, frame, 0, &attr, params, js)
}

/// `{"fn": "ias:zonestatus", "mask": "alarm1,alarm2"}`: combines the IAS
/// status change notification command with read/report of attribute 0x0002.
fn parse_ias_zone_status(
    r: &mut Resource,
    suffix: &'static str,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    params: &Value,
    now: SteadyTime,
) -> bool {
    use ias_zone::*;

    if ind.cluster_id != clusters::IAS_ZONE {
        return false;
    }

    if ind.src_endpoint != resolve_auto_endpoint(r) {
        return false;
    }

    if frame.is_cluster_command() {
        if frame.command_id != CMD_STATUS_CHANGE_NOTIFICATION {
            return false;
        }
    } else if frame.command_id != zcl_command::READ_ATTRIBUTES_RESPONSE
        && frame.command_id != zcl_command::REPORT_ATTRIBUTES
    {
        return false;
    }

    let mut reader = Reader::new(&frame.payload);
    let mut zone_status: Option<u16> = None;

    while !reader.at_end() {
        if frame.is_cluster_command() {
            let Ok(status) = reader.u16_le() else { break };
            zone_status = Some(status);
            // extended status, zone id, delay
            let _ = reader.u8();
            let _ = reader.u8();
            let _ = reader.u16_le();
            break;
        }

        let Ok(attr_id) = reader.u16_le() else { break };

        if frame.command_id == zcl_command::READ_ATTRIBUTES_RESPONSE {
            let Ok(status) = reader.u8() else { break };
            if status != zcl_status::SUCCESS {
                continue;
            }
        }

        let Ok(dt) = reader.u8() else { break };
        let mut attr = ZclAttribute::new(attr_id, dt);
        if attr.read_value(&mut reader).is_err() {
            break;
        }

        if attr.id == ATTR_ZONE_STATUS {
            zone_status = attr.value.as_i64().map(|v| v as u16);
            break;
        }
    }

    let Some(zone_status) = zone_status else {
        return false;
    };

    let mut mask: u16 = 0;

    match suffix {
        RSTATE_ALARM | RSTATE_CARBON_MONOXIDE | RSTATE_FIRE | RSTATE_OPEN | RSTATE_PRESENCE
        | RSTATE_VIBRATION | RSTATE_WATER => {
            if let Some(spec) = params.get("mask").and_then(Value::as_str) {
                for part in spec.split(',') {
                    match part.trim() {
                        "alarm1" => mask |= STATUS_ALARM1,
                        "alarm2" => mask |= STATUS_ALARM2,
                        _ => {}
                    }
                }
            }
        }
        RSTATE_TAMPERED => mask |= STATUS_TAMPER,
        RSTATE_LOW_BATTERY => mask |= STATUS_BATTERY,
        RSTATE_TEST => mask |= STATUS_TEST,
        _ => return false,
    }

    let Some(item) = r.item_mut(suffix) else {
        return false;
    };

    if item.set_value(ItemValue::Bool(zone_status & mask != 0), ValueSource::Device).is_err() {
        return false;
    }
    item.set_last_zcl_report(now);

    true
}

/// `{"fn": "tuya", "dpid": id, "eval": expr}`: decodes the big-endian
/// datapoint list and lifts the matching DPID into the Attr pipeline.
fn parse_tuya_data(
    r: &mut Resource,
    suffix: &'static str,
    node: Option<&Node>,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    params: &Value,
    js: &mut DeviceJs,
    now: SteadyTime,
) -> bool {
    use tuya_cmd::*;

    let mut result = false;

    if ind.cluster_id != clusters::TUYA
        || !(frame.command_id == TY_DATA_REPORT || frame.command_id == TY_DATA_RESPONSE)
    {
        return result;
    }

    if r.item(suffix).is_some_and(|i| i.zcl_param().is_none()) {
        let Some(map) = params.as_object() else {
            return result;
        };
        if !map.contains_key("dpid") || !map.contains_key("eval") {
            return result;
        }
        let Some(dpid) = map.get("dpid").and_then(|v| variant_to_uint(v, 255)) else {
            return result;
        };

        let param = ZclParam {
            valid: true,
            endpoint: ind.src_endpoint,
            cluster_id: ind.cluster_id,
            attributes: {
                let mut a = [0u16; ZclParam::MAX_ATTRIBUTES];
                a[0] = dpid as u16;
                a
            },
            attribute_count: 1,
            ..ZclParam::default()
        };

        if let Some(item) = r.item_mut(suffix) {
            item.set_zcl_param(param);
            item.set_parse_inited();
        }
    }

    let Some(zcl_param) = r.item(suffix).and_then(|i| i.zcl_param()).copied() else {
        return result;
    };

    let mut reader = Reader::new(&frame.payload);
    let Ok(seq) = reader.u16_be() else {
        return result;
    };

    // a message can contain multiple datapoints
    while !reader.at_end() {
        let Ok(dpid) = reader.u8() else { break };
        let Ok(dt) = reader.u8() else { break };
        let Ok(length) = reader.u16_be() else { break };

        let (value, zcl_dt) = match dt {
            tuya_dt::RAW | tuya_dt::STRING => return result,
            tuya_dt::BOOL => match reader.u8() {
                Ok(v) => (ZclValue::Bool(v != 0), data_type::BOOLEAN),
                Err(_) => return result,
            },
            tuya_dt::ENUM => match reader.u8() {
                Ok(v) => (ZclValue::U64(u64::from(v)), data_type::UINT8),
                Err(_) => return result,
            },
            // docs aren't clear, assume signed
            tuya_dt::VALUE => match reader.u32_be() {
                Ok(v) => (ZclValue::I64(i64::from(v as i32)), data_type::INT32),
                Err(_) => return result,
            },
            tuya_dt::BITMAP => match length {
                1 => match reader.u8() {
                    Ok(v) => (ZclValue::U64(u64::from(v)), data_type::UINT8),
                    Err(_) => return result,
                },
                2 => match reader.u16_be() {
                    Ok(v) => (ZclValue::U64(u64::from(v)), data_type::UINT16),
                    Err(_) => return result,
                },
                4 => match reader.u32_be() {
                    Ok(v) => (ZclValue::U64(u64::from(v)), data_type::UINT32),
                    Err(_) => return result,
                },
                _ => return result,
            },
            _ => return result, // unknown datatype
        };

        if u16::from(dpid) == zcl_param.attributes[0] {
            let attr = ZclAttribute { id: u16::from(dpid), data_type: zcl_dt, value };

            if eval_zcl_attribute(r, suffix, node, ind, frame, 0, &attr, params, js) {
                if let Some(item) = r.item_mut(suffix) {
                    item.set_last_zcl_report(now);
                }
                result = true;
            }
        }

        tracing::trace!(
            "TY_DATA seq {seq}, dpid: {dpid:#04x}, type: {dt:#04x}, length: {length}"
        );
    }

    result
}

/// `{"fn": "tuyatime"}`: answers TY_DATA_SYNC_TIME with UTC and local
/// seconds since the Unix epoch (big-endian).
fn parse_tuya_time(
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    ctrl: &mut dyn ApsSend,
) -> bool {
    if frame.is_default_response() || frame.command_id != tuya_cmd::TUYA_MCU_SYNC_TIME {
        return false;
    }

    let mut reader = Reader::new(&frame.payload);
    let Ok(seq) = reader.u16_be() else {
        return false;
    };

    let utc = chrono::Utc::now();
    let utc_secs = utc.timestamp() as u32;
    let local_offset = chrono::Local::now().offset().local_minus_utc();
    let local_secs = (utc.timestamp() + i64::from(local_offset)) as u32;

    let mut payload = Vec::with_capacity(10);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&utc_secs.to_be_bytes());
    payload.extend_from_slice(&local_secs.to_be_bytes());

    let out = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
        manufacturer_code: 0,
        sequence_number: ctrl.next_zcl_sequence(),
        command_id: tuya_cmd::TUYA_MCU_SYNC_TIME,
        payload,
    };

    let req = ApsDataRequest::unicast(
        ind.src_address,
        ind.src_endpoint,
        clusters::TUYA,
        out.serialize(),
    );

    ctrl.send(&req).is_ok()
}

/// `{"fn": "time"}`: updates `state/utc`, `state/localtime` and
/// `state/lastset` from the time cluster; when UTC drift exceeds 10 s the
/// device clock is rewritten and re-read.
fn parse_and_sync_time(
    r: &mut Resource,
    suffix: &'static str,
    addr: DeviceAddress,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    ctrl: &mut dyn ApsSend,
    state: &mut AccessState,
    now: SteadyTime,
) -> bool {
    let mut result = false;

    if ind.cluster_id != clusters::TIME {
        return result;
    }

    if ind.src_endpoint != resolve_auto_endpoint(r) {
        return result;
    }

    if frame.command_id != zcl_command::READ_ATTRIBUTES_RESPONSE
        && frame.command_id != zcl_command::REPORT_ATTRIBUTES
    {
        return result;
    }

    let mut reader = Reader::new(&frame.payload);

    while !reader.at_end() {
        let Ok(attr_id) = reader.u16_le() else { break };

        if frame.command_id == zcl_command::READ_ATTRIBUTES_RESPONSE {
            let Ok(status) = reader.u8() else { break };
            if status != zcl_status::SUCCESS {
                continue;
            }
        }

        let Ok(dt) = reader.u8() else { break };
        let mut attr = ZclAttribute::new(attr_id, dt);
        if attr.read_value(&mut reader).is_err() {
            break;
        }

        let Some(secs) = attr.value.as_i64() else { continue };

        match attr_id {
            TIME_CLUSTER_ATTR_TIME if suffix == RSTATE_UTC => {
                let device_ms = (ZCL_EPOCH_OFFSET_S + secs) * 1000;
                let drift_s = (device_ms - system_now_ms()) / 1000;

                if let Some(item) = r.item_mut(suffix) {
                    let _ = item.set_value(ItemValue::Time(device_ms), ValueSource::Device);
                    item.set_last_zcl_report(now);
                }

                if !(-10..=10).contains(&drift_s) {
                    tracing::debug!("{}/{}: time drift of {drift_s} s", r.unique_id(), suffix);

                    if write_time_data(addr, r, ctrl) {
                        // verify the drift got eliminated
                        let read_params =
                            r.item(suffix).map(|i| i.read_parameters().clone()).unwrap_or_default();
                        let res = read_item(r, addr, ctrl, &read_params, state, now);
                        if res.is_enqueued {
                            tracing::debug!("{} time verification queued", r.unique_id());
                        }
                    }
                }

                result = true;
            }
            TIME_CLUSTER_ATTR_LOCAL_TIME if suffix == RSTATE_LOCALTIME => {
                let offset = chrono::Local::now().offset().local_minus_utc();
                let ms = (ZCL_EPOCH_OFFSET_S + secs - i64::from(offset)) * 1000;
                if let Some(item) = r.item_mut(suffix) {
                    let _ = item.set_value(ItemValue::Time(ms), ValueSource::Device);
                    item.set_last_zcl_report(now);
                }
                result = true;
            }
            TIME_CLUSTER_ATTR_LAST_SET_TIME if suffix == RSTATE_LAST_SET => {
                let ms = (ZCL_EPOCH_OFFSET_S + secs) * 1000;
                if let Some(item) = r.item_mut(suffix) {
                    let _ = item.set_value(ItemValue::Time(ms), ValueSource::Device);
                    item.set_last_zcl_report(now);
                }
                result = true;
            }
            _ => {}
        }
    }

    result
}

/// `{"fn": "numtostr", "srcitem": suffix, "op": lt|le|eq|gt|ge, "to": [..]}`
/// Maps a numeric source item onto a string via a sorted threshold/label
/// list of even length.
fn parse_numeric_to_string(r: &mut Resource, suffix: &'static str, params: &Value) -> bool {
    let item_type = match r.item(suffix) {
        Some(item) => item.descriptor().data_type,
        None => return false,
    };
    if item_type != DataType::String {
        return false;
    }

    let Some(map) = params.as_object() else {
        return false;
    };

    let (Some(src_suffix), Some(op), Some(to)) = (
        map.get("srcitem").and_then(Value::as_str),
        map.get("op").and_then(Value::as_str),
        map.get("to").and_then(Value::as_array),
    ) else {
        return false;
    };

    if to.len() % 2 != 0 {
        return false;
    }

    let Some(src) = r.item(src_suffix) else {
        return false;
    };

    if !(src.need_push_change() || src.need_push_set()) {
        return false; // only update if needed
    }

    let num = src.to_number();
    let src_report = src.last_zcl_report();

    let matches = |threshold: i64| match op {
        "le" => num <= threshold,
        "lt" => num < threshold,
        "eq" => num == threshold,
        "ge" => num >= threshold,
        "gt" => num > threshold,
        _ => false,
    };

    let mut label: Option<&str> = None;
    for pair in to.chunks_exact(2) {
        if let (Some(threshold), Some(s)) = (pair[0].as_i64(), pair[1].as_str()) {
            if matches(threshold) {
                label = Some(s);
                break;
            }
        }
    }

    let Some(label) = label.filter(|l| !l.is_empty()) else {
        return false;
    };

    let Some(item) = r.item_mut(suffix) else {
        return false;
    };
    if item.set_value(ItemValue::Str(label.to_string()), ValueSource::Device).is_err() {
        return false;
    }
    item.set_last_zcl_report(src_report); // treat as report

    true
}

/// Dispatches the parse function bound to \p params over an indication.
#[allow(clippy::too_many_arguments)]
pub fn parse_item(
    r: &mut Resource,
    suffix: &'static str,
    node: Option<&Node>,
    addr: DeviceAddress,
    ind: &ApsDataIndication,
    frame: &ZclFrame,
    ctrl: &mut dyn ApsSend,
    js: &mut DeviceJs,
    state: &mut AccessState,
    now: SteadyTime,
) -> bool {
    let params = match r.item(suffix) {
        Some(item) => item.parse_parameters().clone(),
        None => return false,
    };

    match get_parse_function(&params) {
        Some(ParseFunction::Zcl) => {
            parse_zcl_attribute(r, suffix, node, ind, frame, &params, js, now)
        }
        Some(ParseFunction::XiaomiSpecial) => {
            parse_xiaomi_special(r, suffix, node, ind, frame, &params, js, now)
        }
        Some(ParseFunction::IasZoneStatus) => {
            parse_ias_zone_status(r, suffix, ind, frame, &params, now)
        }
        Some(ParseFunction::Tuya) => {
            parse_tuya_data(r, suffix, node, ind, frame, &params, js, now)
        }
        Some(ParseFunction::NumToStr) => parse_numeric_to_string(r, suffix, &params),
        Some(ParseFunction::Time) => {
            parse_and_sync_time(r, suffix, addr, ind, frame, ctrl, state, now)
        }
        Some(ParseFunction::TuyaTime) => parse_tuya_time(ind, frame, ctrl),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// write functions

/// `{"fn": "zcl", "ep", "cl", "at", "dt", "mf", "eval"}`: runs `eval`
/// over the item and sends a ZCL Write Attributes request with the result
/// serialized as the declared data type.
fn write_zcl_attribute(
    r: &Resource,
    item: &crate::resource::ResourceItem,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    let suffix = item.suffix();
    let mut param = get_zcl_param(params);

    if !param.valid || param.attribute_count != 1 {
        return false;
    }

    if param.endpoint == AUTO_ENDPOINT {
        param.endpoint = resolve_auto_endpoint(r);
        if param.endpoint == AUTO_ENDPOINT {
            return false;
        }
    }

    let map = params.as_object();
    let Some(dt) = map
        .and_then(|m| m.get("dt"))
        .and_then(|v| variant_to_uint(v, u8::MAX as u64))
    else {
        return false;
    };
    let Some(expr) = map.and_then(|m| m.get("eval")).and_then(Value::as_str) else {
        return false;
    };
    if expr.is_empty() {
        return false;
    }

    js.reset();
    js.set_resource(r);
    js.set_item(item);

    if js.evaluate(expr) != JsEvalResult::Ok {
        tracing::debug!(
            "failed to evaluate write expression for {}/{}: {}, err: {}",
            r.unique_id(),
            suffix,
            expr,
            js.error_string()
        );
        return false;
    }

    let Some(value) = json_to_zcl_value(js.result(), dt as u8) else {
        return false;
    };

    let attribute = ZclAttribute { id: param.attributes[0], data_type: dt as u8, value };

    let mut payload = Vec::new();
    payload.extend_from_slice(&attribute.id.to_le_bytes());
    payload.push(attribute.data_type);
    if attribute.write_value(&mut payload).is_err() {
        return false;
    }

    let mut frame_control = ZCL_FC_PROFILE_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE;
    if param.manufacturer_code != 0 {
        frame_control |= ZCL_FC_MANUFACTURER_SPECIFIC;
    }

    let frame = ZclFrame {
        frame_control,
        manufacturer_code: param.manufacturer_code,
        sequence_number: ctrl.next_zcl_sequence(),
        command_id: zcl_command::WRITE_ATTRIBUTES,
        payload,
    };

    tracing::debug!(
        "write {}/{}: ep {:#04x} cl {:#06x} at {:#06x} dt {:#04x} mf {:#06x}",
        r.unique_id(),
        suffix,
        param.endpoint,
        param.cluster_id,
        param.attributes[0],
        dt,
        param.manufacturer_code
    );

    let req =
        ApsDataRequest::unicast(addr.aps(), param.endpoint, param.cluster_id, frame.serialize());
    ctrl.send(&req).is_ok()
}

/// Converts a JS result into a `ZclValue` for the declared data type.
fn json_to_zcl_value(value: &Value, dt: u8) -> Option<ZclValue> {
    use zigbee_aps::zcl::numeric_type_info;

    if dt == data_type::CHARACTER_STRING {
        return value.as_str().map(|s| ZclValue::Str(s.to_string()));
    }

    let (_, signed) = numeric_type_info(dt)?;

    let num = match value {
        Value::Bool(b) => i64::from(*b),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };

    if dt == data_type::BOOLEAN {
        Some(ZclValue::Bool(num != 0))
    } else if signed {
        Some(ZclValue::I64(num))
    } else {
        Some(ZclValue::U64(num as u64))
    }
}

/// `{"fn": "tuya", "dpid", "dt", "eval"}`: sends a TY_DATA_REQUEST with
/// the evaluated value, inner fields big-endian.
fn write_tuya_data(
    r: &Resource,
    item: &crate::resource::ResourceItem,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    let suffix = item.suffix();
    let Some(map) = params.as_object() else {
        return false;
    };

    let Some(dpid) = map.get("dpid").and_then(|v| variant_to_uint(v, 255)) else {
        return false;
    };
    let Some(dt) = map.get("dt").and_then(|v| variant_to_uint(v, u8::MAX as u64)) else {
        return false;
    };
    let Some(expr) = map.get("eval").and_then(Value::as_str).filter(|e| !e.is_empty()) else {
        return false;
    };

    let tuya_type = match dt as u8 {
        data_type::BOOLEAN => tuya_dt::BOOL,
        data_type::INT32 => tuya_dt::VALUE,
        data_type::ENUM8 => tuya_dt::ENUM,
        data_type::BITMAP8 | data_type::BITMAP16 | data_type::BITMAP32 => tuya_dt::BITMAP,
        _ => return false, // unsupported datatype
    };

    js.reset();
    js.set_resource(r);
    js.set_item(item);

    if js.evaluate(expr) != JsEvalResult::Ok {
        tracing::debug!(
            "failed to evaluate Tuya write expression for {}/{}: {}, err: {}",
            r.unique_id(),
            suffix,
            expr,
            js.error_string()
        );
        return false;
    }

    let num = match js.result() {
        Value::Bool(b) => i64::from(*b),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => return false,
    };

    let seq = u16::from(ctrl.next_zcl_sequence());

    let mut payload = Vec::new();
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.push(dpid as u8);
    payload.push(tuya_type);

    match dt as u8 {
        data_type::BOOLEAN | data_type::ENUM8 | data_type::BITMAP8 => {
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.push(num as u8);
        }
        data_type::BITMAP16 => {
            payload.extend_from_slice(&2u16.to_be_bytes());
            payload.extend_from_slice(&(num as u16).to_be_bytes());
        }
        data_type::INT32 => {
            payload.extend_from_slice(&4u16.to_be_bytes());
            payload.extend_from_slice(&(num as i32).to_be_bytes());
        }
        data_type::BITMAP32 => {
            payload.extend_from_slice(&4u16.to_be_bytes());
            payload.extend_from_slice(&(num as u32).to_be_bytes());
        }
        _ => return false,
    }

    let frame = ZclFrame {
        frame_control: ZCL_FC_CLUSTER_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
        manufacturer_code: 0,
        sequence_number: seq as u8,
        command_id: tuya_cmd::TY_DATA_REQUEST,
        payload,
    };

    let req = ApsDataRequest::unicast(addr.aps(), 1, clusters::TUYA, frame.serialize());
    ctrl.send(&req).is_ok()
}

/// `{"fn": "time"}`: writes the current time attributes to the device's
/// time cluster, syncing its RTC.
fn write_time_data(addr: DeviceAddress, r: &Resource, ctrl: &mut dyn ApsSend) -> bool {
    let endpoint = resolve_auto_endpoint(r);
    if endpoint == AUTO_ENDPOINT {
        return false;
    }

    let now = chrono::Utc::now();
    let time_now = (now.timestamp() - ZCL_EPOCH_OFFSET_S) as u32;
    // TimeStatus: Master | MasterZoneDst | Superseding
    let time_status: u8 = 0x0d;
    let time_zone = chrono::Local::now().offset().local_minus_utc();
    let valid_until = time_now + 3600 * 24;

    let mut payload = Vec::new();

    payload.extend_from_slice(&TIME_CLUSTER_ATTR_TIME.to_le_bytes());
    payload.push(data_type::UTC_TIME);
    payload.extend_from_slice(&time_now.to_le_bytes());

    payload.extend_from_slice(&0x0001u16.to_le_bytes()); // TimeStatus
    payload.push(data_type::BITMAP8);
    payload.push(time_status);

    payload.extend_from_slice(&0x0002u16.to_le_bytes()); // TimeZone
    payload.push(data_type::INT32);
    payload.extend_from_slice(&time_zone.to_le_bytes());

    payload.extend_from_slice(&0x0009u16.to_le_bytes()); // ValidUntilTime
    payload.push(data_type::UTC_TIME);
    payload.extend_from_slice(&valid_until.to_le_bytes());

    let frame = ZclFrame {
        frame_control: ZCL_FC_PROFILE_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
        manufacturer_code: 0,
        sequence_number: ctrl.next_zcl_sequence(),
        command_id: zcl_command::WRITE_ATTRIBUTES,
        payload,
    };

    let req = ApsDataRequest::unicast(addr.aps(), endpoint, clusters::TIME, frame.serialize());
    ctrl.send(&req).is_ok()
}

/// Dispatches the write function bound to \p params.
pub fn write_item(
    r: &Resource,
    suffix: &str,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    let Some(item) = r.item(suffix) else {
        return false;
    };
    // clone so the borrow on `r` can be handed to the JS snapshot
    let item = item.clone();
    write_item_with(r, &item, addr, ctrl, params, js)
}

/// Like `write_item` but writes the value of \p item, which may be a copy
/// of the resource's item carrying a target value instead of the current
/// one. Used by the StateChange convergence loop.
pub fn write_item_with(
    r: &Resource,
    item: &crate::resource::ResourceItem,
    addr: DeviceAddress,
    ctrl: &mut dyn ApsSend,
    params: &Value,
    js: &mut DeviceJs,
) -> bool {
    match get_write_function(params) {
        Some(WriteFunction::Zcl) => write_zcl_attribute(r, item, addr, ctrl, params, js),
        Some(WriteFunction::Tuya) => write_tuya_data(r, item, addr, ctrl, params, js),
        Some(WriteFunction::Time) => write_time_data(addr, r, ctrl),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aps_wrapper::ApsCtrlWrapper;
    use crate::resource::{
        RATTR_UNIQUEID, RCONFIG_BATTERY, RSTATE_AIR_QUALITY, RSTATE_AIR_QUALITY_PPB, RSTATE_OPEN,
        RSTATE_TEMPERATURE, R_SENSORS,
    };
    use serde_json::json;
    use zigbee_aps::controller::testing::MockController;
    use zigbee_aps::AddressMode;

    fn sensor(uniqueid: &str) -> Resource {
        let mut r = Resource::new(R_SENSORS);
        r.add_item(RATTR_UNIQUEID).unwrap();
        r.set_value(RATTR_UNIQUEID, ItemValue::Str(uniqueid.into()), ValueSource::Api).unwrap();
        r
    }

    fn indication(cluster_id: u16, src_endpoint: u8, frame: &ZclFrame) -> ApsDataIndication {
        ApsDataIndication {
            dst_addr_mode: AddressMode::Nwk,
            dst_address: Address::nwk(0),
            dst_endpoint: 1,
            src_addr_mode: AddressMode::Nwk,
            src_address: Address::nwk_and_ext(0x1234, 0xcafe),
            src_endpoint,
            profile_id: zigbee_aps::profiles::HOME_AUTOMATION,
            cluster_id,
            asdu: frame.serialize(),
            lqi: 255,
            rssi: -40,
        }
    }

    fn report_frame(payload: Vec<u8>) -> ZclFrame {
        ZclFrame {
            frame_control: ZCL_FC_PROFILE_COMMAND | ZCL_FC_DIRECTION_SERVER_TO_CLIENT_BIT,
            manufacturer_code: 0,
            sequence_number: 9,
            command_id: zcl_command::REPORT_ATTRIBUTES,
            payload,
        }
    }

    const ZCL_FC_DIRECTION_SERVER_TO_CLIENT_BIT: u8 = 0x08;

    #[test]
    fn zcl_param_extraction() {
        let params = json!({"ep": 1, "cl": "0x0402", "at": "0x0000", "mf": "0x110b"});
        let p = get_zcl_param(&params);
        assert!(p.valid);
        assert_eq!(p.endpoint, 1);
        assert_eq!(p.cluster_id, 0x0402);
        assert_eq!(p.attribute_count, 1);
        assert_eq!(p.attributes[0], 0x0000);
        assert_eq!(p.manufacturer_code, 0x110b);

        let params = json!({"cl": "0x0001", "at": ["0x0020", "0x0021"]});
        let p = get_zcl_param(&params);
        assert!(p.valid);
        assert_eq!(p.attribute_count, 2);
        assert_eq!(p.attributes[..2], [0x0020, 0x0021]);

        // "at" missing while the expression uses Attr
        let params = json!({"cl": "0x0001", "eval": "Item.val = Attr.val"});
        assert!(!get_zcl_param(&params).valid);
    }

    #[test]
    fn unknown_fn_disables_item() {
        assert_eq!(get_parse_function(&json!({"fn": "wibble"})), None);
        assert_eq!(get_read_function(&json!({"fn": "wibble"})), None);
        assert_eq!(get_parse_function(&Value::Null), None);
        // fn defaults to zcl
        assert_eq!(get_parse_function(&json!({"cl": "0x0000"})), Some(ParseFunction::Zcl));
    }

    #[test]
    fn read_builds_read_attributes_request() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let r = sensor("28:6d:97:00:01:06:41:79-02");
        let addr = DeviceAddress { nwk: 0x1234, ext: 0x286d_9700_0106_4179 };
        let params = json!({"fn": "zcl", "cl": "0x0402", "at": "0x0000"});
        let mut state = AccessState::default();

        let result = read_item(&r, addr, &mut wrapper, &params, &mut state, SteadyTime(0));
        assert!(result.is_enqueued);

        let sent = &wrapper.inner().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cluster_id, 0x0402);
        // auto endpoint resolved from the unique id
        assert_eq!(sent[0].dst_endpoint, 0x02);

        let frame = ZclFrame::parse(&sent[0].asdu).unwrap();
        assert_eq!(frame.command_id, zcl_command::READ_ATTRIBUTES);
        assert_eq!(frame.payload, vec![0x00, 0x00]);
        assert_eq!(frame.sequence_number, result.sequence_number);
    }

    #[test]
    fn tuya_read_is_rate_limited() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let r = sensor("28:6d:97:00:01:06:41:79-01");
        let addr = DeviceAddress { nwk: 0x1234, ext: 1 };
        let params = json!({"fn": "tuya"});
        let mut state = AccessState::default();

        assert!(read_item(&r, addr, &mut wrapper, &params, &mut state, SteadyTime(0)).is_enqueued);
        // second query 5 s later is suppressed
        assert!(!read_item(&r, addr, &mut wrapper, &params, &mut state, SteadyTime(5_000)).is_enqueued);
        // after 15 s it goes out again
        assert!(read_item(&r, addr, &mut wrapper, &params, &mut state, SteadyTime(15_100)).is_enqueued);
        assert_eq!(wrapper.inner().sent.len(), 2);
    }

    #[test]
    fn parse_zcl_report_with_offset() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut state = AccessState::default();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RSTATE_TEMPERATURE).unwrap();
        r.add_item(crate::resource::RCONFIG_OFFSET).unwrap();
        r.set_value(crate::resource::RCONFIG_OFFSET, ItemValue::Num(50), ValueSource::Api).unwrap();
        r.item_mut(RSTATE_TEMPERATURE).unwrap().set_parse_parameters(
            json!({"fn": "zcl", "ep": 1, "cl": "0x0402", "at": "0x0000",
                   "eval": "Item.val = Attr.val + R.item('config/offset').val"}),
        );

        // int16 report: attr 0x0000, type 0x29, value 2100
        let mut payload = vec![0x00, 0x00, 0x29];
        payload.extend_from_slice(&2100i16.to_le_bytes());
        let frame = report_frame(payload);
        let ind = indication(0x0402, 1, &frame);

        let ok = parse_item(
            &mut r,
            RSTATE_TEMPERATURE,
            None,
            DeviceAddress::default(),
            &ind,
            &frame,
            &mut wrapper,
            &mut js,
            &mut state,
            SteadyTime(77),
        );
        assert!(ok);
        assert_eq!(r.to_number(RSTATE_TEMPERATURE), 2150);
        let item = r.item(RSTATE_TEMPERATURE).unwrap();
        assert_eq!(item.value_source(), ValueSource::Device);
        assert_eq!(item.last_zcl_report(), SteadyTime(77));
    }

    #[test]
    fn parse_zcl_unsupported_attribute_marks_item() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut state = AccessState::default();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RSTATE_TEMPERATURE).unwrap();
        r.item_mut(RSTATE_TEMPERATURE).unwrap().set_parse_parameters(
            json!({"fn": "zcl", "ep": 1, "cl": "0x0402", "at": "0x0000", "eval": "Item.val = Attr.val"}),
        );

        let frame = ZclFrame {
            frame_control: ZCL_FC_PROFILE_COMMAND,
            manufacturer_code: 0,
            sequence_number: 2,
            command_id: zcl_command::READ_ATTRIBUTES_RESPONSE,
            payload: vec![0x00, 0x00, zcl_status::UNSUPPORTED_ATTRIBUTE],
        };
        let ind = indication(0x0402, 1, &frame);

        parse_item(
            &mut r,
            RSTATE_TEMPERATURE,
            None,
            DeviceAddress::default(),
            &ind,
            &frame,
            &mut wrapper,
            &mut js,
            &mut state,
            SteadyTime(0),
        );
        assert!(r.item(RSTATE_TEMPERATURE).unwrap().zcl_unsupported());
    }

    #[test]
    fn parse_xiaomi_special_tag() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut state = AccessState::default();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RCONFIG_BATTERY).unwrap();
        r.item_mut(RCONFIG_BATTERY).unwrap().set_parse_parameters(
            json!({"fn": "xiaomi:special", "at": "0xff01", "idx": "0x01",
                   "eval": "Item.val = Math.round(Attr.val / 31)"}),
        );

        // basic cluster report: attr 0xff01, char string, tagged values:
        // tag 0x01 (battery mV, u16) = 3100, tag 0x03 (temp, i8) = 21
        let mut inner = Vec::new();
        inner.push(0x01); // tag 1
        inner.push(data_type::UINT16);
        inner.extend_from_slice(&3100u16.to_le_bytes());
        inner.push(0x03); // tag 3
        inner.push(data_type::INT8);
        inner.push(21);

        let mut payload = vec![0x01, 0xff, data_type::CHARACTER_STRING, inner.len() as u8];
        payload.extend_from_slice(&inner);

        let frame = report_frame(payload);
        let ind = indication(clusters::BASIC, 1, &frame);

        let ok = parse_item(
            &mut r,
            RCONFIG_BATTERY,
            None,
            DeviceAddress::default(),
            &ind,
            &frame,
            &mut wrapper,
            &mut js,
            &mut state,
            SteadyTime(0),
        );
        assert!(ok, "err: {}", js.error_string());
        assert_eq!(r.to_number(RCONFIG_BATTERY), 100);
    }

    #[test]
    fn parse_ias_zone_notification() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut state = AccessState::default();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01-0500");
        r.add_item(RSTATE_OPEN).unwrap();
        r.item_mut(RSTATE_OPEN)
            .unwrap()
            .set_parse_parameters(json!({"fn": "ias:zonestatus", "mask": "alarm1,alarm2"}));

        // status change notification: zone status alarm1
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x0001u16.to_le_bytes());
        payload.push(0); // extended status
        payload.push(5); // zone id
        payload.extend_from_slice(&0u16.to_le_bytes()); // delay

        let frame = ZclFrame {
            frame_control: ZCL_FC_CLUSTER_COMMAND,
            manufacturer_code: 0,
            sequence_number: 3,
            command_id: ias_zone::CMD_STATUS_CHANGE_NOTIFICATION,
            payload,
        };
        let ind = indication(clusters::IAS_ZONE, 1, &frame);

        let ok = parse_item(
            &mut r,
            RSTATE_OPEN,
            None,
            DeviceAddress::default(),
            &ind,
            &frame,
            &mut wrapper,
            &mut js,
            &mut state,
            SteadyTime(0),
        );
        assert!(ok);
        assert!(r.to_bool(RSTATE_OPEN));
    }

    #[test]
    fn parse_tuya_datapoint() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();
        let mut state = AccessState::default();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RSTATE_TEMPERATURE).unwrap();
        r.item_mut(RSTATE_TEMPERATURE)
            .unwrap()
            .set_parse_parameters(json!({"fn": "tuya", "dpid": 2, "eval": "Item.val = Attr.val"}));

        // seq | dpid 2 | type value | len 4 | 0x00000015 (big endian)
        let payload = vec![0x00, 0x4c, 0x02, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x15];
        let frame = ZclFrame {
            frame_control: ZCL_FC_CLUSTER_COMMAND,
            manufacturer_code: 0,
            sequence_number: 4,
            command_id: tuya_cmd::TY_DATA_REPORT,
            payload,
        };
        let ind = indication(clusters::TUYA, 1, &frame);

        let ok = parse_item(
            &mut r,
            RSTATE_TEMPERATURE,
            None,
            DeviceAddress::default(),
            &ind,
            &frame,
            &mut wrapper,
            &mut js,
            &mut state,
            SteadyTime(0),
        );
        assert!(ok, "err: {}", js.error_string());
        assert_eq!(r.to_number(RSTATE_TEMPERATURE), 0x15);
    }

    #[test]
    fn numtostr_maps_thresholds() {
        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RSTATE_AIR_QUALITY).unwrap();
        r.add_item(RSTATE_AIR_QUALITY_PPB).unwrap();
        r.set_value(RSTATE_AIR_QUALITY_PPB, ItemValue::Num(60), ValueSource::Device).unwrap();

        let params = json!({
            "fn": "numtostr", "srcitem": "state/airqualityppb", "op": "le",
            "to": [65, "good", 65535, "bad"]
        });

        assert!(parse_numeric_to_string(&mut r, RSTATE_AIR_QUALITY, &params));
        assert_eq!(r.to_str(RSTATE_AIR_QUALITY), "good");

        r.set_value(RSTATE_AIR_QUALITY_PPB, ItemValue::Num(500), ValueSource::Device).unwrap();
        assert!(parse_numeric_to_string(&mut r, RSTATE_AIR_QUALITY, &params));
        assert_eq!(r.to_str(RSTATE_AIR_QUALITY), "bad");
    }

    #[test]
    fn write_zcl_attribute_builds_frame() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());
        let mut js = DeviceJs::new();

        let mut r = sensor("28:6d:97:00:01:06:41:79-01");
        r.add_item(RCONFIG_BATTERY).unwrap();
        r.set_value(RCONFIG_BATTERY, ItemValue::Num(0x15), ValueSource::Api).unwrap();

        let params = json!({"cl": "0x0000", "at": "0xff0d", "dt": "0x20", "mf": "0x115f", "eval": "Item.val"});
        let addr = DeviceAddress { nwk: 0x1234, ext: 0xcafe };

        assert!(write_item(&r, RCONFIG_BATTERY, addr, &mut wrapper, &params, &mut js));

        let sent = &wrapper.inner().sent;
        assert_eq!(sent.len(), 1);
        let frame = ZclFrame::parse(&sent[0].asdu).unwrap();
        assert_eq!(frame.command_id, zcl_command::WRITE_ATTRIBUTES);
        assert!(frame.is_manufacturer_specific());
        assert_eq!(frame.manufacturer_code, 0x115f);
        // attr id | data type | value
        assert_eq!(frame.payload, vec![0x0d, 0xff, 0x20, 0x15]);
    }

    #[test]
    fn tuya_time_sync_replies() {
        let mut wrapper = ApsCtrlWrapper::new(MockController::default());

        let frame = ZclFrame {
            frame_control: ZCL_FC_CLUSTER_COMMAND,
            manufacturer_code: 0,
            sequence_number: 11,
            command_id: tuya_cmd::TUYA_MCU_SYNC_TIME,
            payload: vec![0x00, 0x08],
        };
        let ind = indication(clusters::TUYA, 1, &frame);

        assert!(parse_tuya_time(&ind, &frame, &mut wrapper));

        let sent = &wrapper.inner().sent;
        assert_eq!(sent.len(), 1);
        let out = ZclFrame::parse(&sent[0].asdu).unwrap();
        assert_eq!(out.command_id, tuya_cmd::TUYA_MCU_SYNC_TIME);
        // seq echoed big-endian + 2×4 bytes of time
        assert_eq!(out.payload.len(), 10);
        assert_eq!(&out.payload[..2], &[0x00, 0x08]);
    }
}
