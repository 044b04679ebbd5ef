//! JavaScript expression sandbox for DDF `eval` parameters
//!
//! Expressions see a small frozen object model:
//!
//! | Global     | Members                                              |
//! |------------|------------------------------------------------------|
//! | `R`        | `item(suffix)`, `endpoints`, `hasCluster(ep, cl[,side])` |
//! | `Item`     | `val` (r/w), `name` (r): the item bound to the eval |
//! | `Attr`     | `val`, `id`, `index`, `dataType` (r)                 |
//! | `ZclFrame` | `cmd`, `payloadSize`, `isClCmd`, `at(i)`             |
//! | `SrcEp`, `ClusterId` | numbers of the current indication          |
//! | `Utils`    | `padStart`, `log10`                                  |
//!
//! Only the bound item is writable; assigning any other item's `val`
//! throws a `TypeError`. Writes are recorded into the per-evaluation
//! `items_set` list which the driver applies back to the resource.
//! `evaluate` must be preceded by `reset`; the engine context is rebuilt
//! from scratch on every reset so a failing script cannot poison later
//! evaluations.

use std::fmt::Write as _;

use boa_engine::{Context, Source};
use serde_json::{Map, Value};

use zigbee_aps::{ApsDataIndication, Node, ZclAttribute, ZclFrame, ZclValue};

use crate::resource::{ItemValue, Resource, ResourceItem};

/// Largest integer exactly representable in an f64; larger item values
/// surface as strings in the sandbox.
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Converts an item value into its JS representation.
#[must_use]
pub fn item_value_to_js(value: &ItemValue) -> Value {
    match value {
        ItemValue::None => Value::Null,
        ItemValue::Bool(b) => Value::Bool(*b),
        ItemValue::Num(n) => {
            if n.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                Value::String(n.to_string())
            } else {
                Value::from(*n)
            }
        }
        ItemValue::Real(r) => serde_json::Number::from_f64(*r).map_or(Value::Null, Value::Number),
        ItemValue::Str(s) => Value::String(s.clone()),
        ItemValue::Time(ms) => Value::from(*ms),
    }
}

fn zcl_value_to_js(value: &ZclValue) -> Value {
    match value {
        ZclValue::None => Value::Null,
        ZclValue::Bool(b) => Value::Bool(*b),
        ZclValue::U64(v) => {
            if *v > MAX_SAFE_INTEGER as u64 {
                Value::String(v.to_string())
            } else {
                Value::from(*v)
            }
        }
        ZclValue::I64(v) => {
            if v.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                Value::String(v.to_string())
            } else {
                Value::from(*v)
            }
        }
        ZclValue::Real(r) => serde_json::Number::from_f64(*r).map_or(Value::Null, Value::Number),
        ZclValue::Str(s) => Value::String(s.clone()),
        ZclValue::Bytes(b) => Value::Array(b.iter().map(|v| Value::from(*v)).collect()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsEvalResult {
    Ok,
    Error,
}

/// The reusable evaluation engine. One instance exists per core; it is
/// reset before every evaluation and must not be reentered.
pub struct DeviceJs {
    // `Context` is `!Send` because it contains `Rc`-based GC internals.
    // `DeviceJs` is only ever reached through the gateway's single
    // `std::sync::Mutex`, which serializes all access, so moving the
    // whole value across threads (never concurrently) is sound.
    context: Option<Context>,
    items: Map<String, Value>,
    bound_suffix: Option<String>,
    endpoints: Vec<u8>,
    clusters: Map<String, Value>,
    attr: Option<Value>,
    frame_cmd: Option<u8>,
    frame_payload: Vec<u8>,
    frame_is_cluster_cmd: bool,
    src_ep: Option<u8>,
    cluster_id: Option<u16>,
    items_set: Vec<(String, Value)>,
    result: Value,
    error: String,
}

// SAFETY: `DeviceJs` is only ever reached through the gateway's single
// `std::sync::Mutex`, which serializes all access; the `Rc`-based GC
// internals of `Context` are never touched concurrently from two threads.
unsafe impl Send for DeviceJs {}

impl Default for DeviceJs {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceJs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: None,
            items: Map::new(),
            bound_suffix: None,
            endpoints: Vec::new(),
            clusters: Map::new(),
            attr: None,
            frame_cmd: None,
            frame_payload: Vec::new(),
            frame_is_cluster_cmd: false,
            src_ep: None,
            cluster_id: None,
            items_set: Vec::new(),
            result: Value::Null,
            error: String::new(),
        }
    }

    /// Wipes all per-evaluation state and rebuilds the engine context.
    pub fn reset(&mut self) {
        self.context = Some(Context::default());
        self.items.clear();
        self.bound_suffix = None;
        self.endpoints.clear();
        self.clusters.clear();
        self.attr = None;
        self.frame_cmd = None;
        self.frame_payload.clear();
        self.frame_is_cluster_cmd = false;
        self.src_ep = None;
        self.cluster_id = None;
        self.items_set.clear();
        self.result = Value::Null;
        self.error.clear();
    }

    /// Snapshots the item values of \p r for `R.item(..)` access.
    pub fn set_resource(&mut self, r: &Resource) {
        for item in r.items() {
            self.items
                .insert(item.suffix().to_string(), item_value_to_js(item.value()));
        }
    }

    /// Publishes the device endpoint list and cluster sets for
    /// `R.endpoints` and `R.hasCluster`.
    pub fn set_node(&mut self, node: &Node) {
        self.endpoints = node.endpoints.clone();
        for sd in &node.simple_descriptors {
            let entry = serde_json::json!({
                "in": sd.in_clusters,
                "out": sd.out_clusters,
            });
            self.clusters.insert(sd.endpoint.to_string(), entry);
        }
    }

    /// Binds the item whose `val` the expression may write.
    pub fn set_item(&mut self, item: &ResourceItem) {
        self.bound_suffix = Some(item.suffix().to_string());
        self.items
            .insert(item.suffix().to_string(), item_value_to_js(item.value()));
    }

    pub fn set_zcl_attribute(&mut self, index: usize, attr: &ZclAttribute) {
        self.attr = Some(serde_json::json!({
            "val": zcl_value_to_js(&attr.value),
            "id": attr.id,
            "index": index,
            "dataType": attr.data_type,
        }));
    }

    pub fn set_zcl_frame(&mut self, frame: &ZclFrame) {
        self.frame_cmd = Some(frame.command_id);
        self.frame_payload = frame.payload.clone();
        self.frame_is_cluster_cmd = frame.is_cluster_command();
    }

    pub fn set_aps_indication(&mut self, ind: &ApsDataIndication) {
        self.src_ep = Some(ind.src_endpoint);
        self.cluster_id = Some(ind.cluster_id);
    }

    /// Evaluates \p expr. The completion value of the script becomes the
    /// result; item writes are collected into `items_set`.
    pub fn evaluate(&mut self, expr: &str) -> JsEvalResult {
        let Some(mut context) = self.context.take() else {
            self.error = "evaluate() without reset()".into();
            return JsEvalResult::Error;
        };

        let prelude = self.build_prelude();

        if let Err(err) = context.eval(Source::from_bytes(prelude.as_bytes())) {
            self.error = format!("prelude: {err}");
            return JsEvalResult::Error;
        }

        let completion = match context.eval(Source::from_bytes(expr.as_bytes())) {
            Ok(value) => value,
            Err(err) => {
                self.error = err.to_string();
                return JsEvalResult::Error;
            }
        };

        self.result = if completion.is_undefined() || completion.is_null() {
            Value::Null
        } else {
            completion.to_json(&mut context).unwrap_or(Value::Null)
        };

        // collect writes
        match context.eval(Source::from_bytes(b"JSON.stringify(__written)")) {
            Ok(value) => {
                if let Ok(Value::String(s)) = value.to_json(&mut context) {
                    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&s) {
                        self.items_set = map.into_iter().collect();
                    }
                }
            }
            Err(err) => {
                self.error = err.to_string();
                return JsEvalResult::Error;
            }
        }

        JsEvalResult::Ok
    }

    /// The completion value of the last successful evaluation.
    #[must_use]
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// Items written during the last evaluation, `(suffix, value)` pairs.
    #[must_use]
    pub fn items_set(&self) -> &[(String, Value)] {
        &self.items_set
    }

    #[must_use]
    pub fn error_string(&self) -> &str {
        &self.error
    }

    fn build_prelude(&self) -> String {
        let mut src = String::with_capacity(1024);

        src.push_str("'use strict';\n");

        let _ = writeln!(
            src,
            "const __items = {};",
            Value::Object(self.items.clone())
        );
        src.push_str("const __written = {};\n");

        match &self.bound_suffix {
            Some(suffix) => {
                let _ = writeln!(src, "const __bound = {};", Value::String(suffix.clone()));
            }
            None => src.push_str("const __bound = null;\n"),
        }

        let _ = writeln!(
            src,
            "const __clusters = {};",
            Value::Object(self.clusters.clone())
        );

        src.push_str(
            "function __item(n) {\n\
             \x20 return {\n\
             \x20   get val() { return (n in __items) ? __items[n] : null; },\n\
             \x20   set val(v) {\n\
             \x20     if (n !== __bound) { throw new TypeError('item ' + n + ' is read only'); }\n\
             \x20     __items[n] = v; __written[n] = v;\n\
             \x20   },\n\
             \x20   get name() { return n; }\n\
             \x20 };\n\
             }\n",
        );

        let _ = writeln!(
            src,
            "const R = {{\n\
             \x20 item: __item,\n\
             \x20 endpoints: {},\n\
             \x20 hasCluster: function(ep, cl, side) {{\n\
             \x20   const e = __clusters[String(ep)];\n\
             \x20   if (!e) return false;\n\
             \x20   if (side === 'out') return e.out.indexOf(cl) >= 0;\n\
             \x20   if (side === 'in') return e['in'].indexOf(cl) >= 0;\n\
             \x20   return e['in'].indexOf(cl) >= 0 || e.out.indexOf(cl) >= 0;\n\
             \x20 }}\n\
             }};",
            serde_json::to_string(&self.endpoints).unwrap_or_else(|_| "[]".into())
        );

        if self.bound_suffix.is_some() {
            src.push_str("const Item = __item(__bound);\n");
        }

        if let Some(attr) = &self.attr {
            let _ = writeln!(src, "const Attr = {attr};");
        }

        if let Some(cmd) = self.frame_cmd {
            let _ = writeln!(
                src,
                "const __payload = {};",
                serde_json::to_string(&self.frame_payload).unwrap_or_else(|_| "[]".into())
            );
            let _ = writeln!(
                src,
                "const ZclFrame = {{ cmd: {cmd}, payloadSize: __payload.length, \
                 isClCmd: {}, at: function(i) {{ return __payload[i]; }} }};",
                self.frame_is_cluster_cmd
            );
        }

        if let Some(ep) = self.src_ep {
            let _ = writeln!(src, "const SrcEp = {ep};");
        }
        if let Some(cl) = self.cluster_id {
            let _ = writeln!(src, "const ClusterId = {cl};");
        }

        src.push_str(
            "const Utils = {\n\
             \x20 padStart: function(s, len, pad) { return String(s).padStart(len, pad); },\n\
             \x20 log10: function(x) { return Math.log10(x); }\n\
             };\n",
        );

        src
    }
}
