// src/broker/ngsi.rs
//
// NGSI-LD payload codec.
//
// Ingress accepts both attribute forms:
//   normalized  {"queues": {"type": "Property", "value": [3, 5]}}
//   simplified  {"queues": [3, 5]}
// Egress always emits the normalized form.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::BrokerError;
use crate::types::{urn, AirQualityObserved, TrafficFlowObserved};

pub const ATTR_QUEUES: &str = "queues";
pub const ATTR_PHASE: &str = "phase";
pub const ATTR_PM25: &str = "pm25";
pub const ATTR_FORCE_PHASE: &str = "forcePhase";
pub const ATTR_VEHICLE_COUNT: &str = "vehicleCount";
pub const ATTR_AVG_SPEED: &str = "avgSpeed";
pub const ATTR_OBSERVED_FROM: &str = "dateObservedFrom";
pub const ATTR_OBSERVED_TO: &str = "dateObservedTo";

/// One known attribute as seen in an inbound entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed<T> {
    Present(T),
    Missing,
    /// Present but not decodable; carries the offending JSON.
    Malformed(String),
}

impl<T> Observed<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            Observed::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Observed::Malformed(_))
    }
}

impl<T> Default for Observed<T> {
    fn default() -> Self {
        Observed::Missing
    }
}

/// What one notified entity said about the intersection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialState {
    pub entity_id: String,
    pub entity_type: String,
    pub queues: Observed<Vec<u32>>,
    pub phase: Observed<usize>,
    pub pm25: Observed<f64>,
    pub force_phase: Observed<usize>,
    pub observed_to: Option<String>,
}

impl PartialState {
    pub fn tls_id(&self) -> Option<&str> {
        urn::tls_of(&self.entity_id)
    }

    /// Overlay every attribute `other` carries; missing ones keep ours.
    pub fn merge(&mut self, other: PartialState) {
        if !matches!(other.queues, Observed::Missing) {
            self.queues = other.queues;
        }
        if !matches!(other.phase, Observed::Missing) {
            self.phase = other.phase;
        }
        if !matches!(other.pm25, Observed::Missing) {
            self.pm25 = other.pm25;
        }
        if !matches!(other.force_phase, Observed::Missing) {
            self.force_phase = other.force_phase;
        }
        if other.observed_to.is_some() {
            self.observed_to = other.observed_to;
        }
    }

    /// Names of known attributes that were present but malformed.
    pub fn malformed_attrs(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.queues.is_malformed() {
            out.push(ATTR_QUEUES);
        }
        if self.phase.is_malformed() {
            out.push(ATTR_PHASE);
        }
        if self.pm25.is_malformed() {
            out.push(ATTR_PM25);
        }
        if self.force_phase.is_malformed() {
            out.push(ATTR_FORCE_PHASE);
        }
        out
    }
}

/// Broker notification envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub notified_at: Option<String>,
    pub data: Vec<Value>,
}

/// Unwrap an attribute to its value, whichever form it was sent in.
pub fn attr_value<'a>(entity: &'a Value, name: &str) -> Option<&'a Value> {
    let raw = entity.get(name)?;
    match raw {
        Value::Object(obj) => match obj.get("value") {
            Some(v) => Some(v),
            None => obj.get("object").or(Some(raw)),
        },
        other => Some(other),
    }
}

fn decode_count(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    // Integral floats such as 3.0 are accepted.
    let f = v.as_f64()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

fn observe<T>(entity: &Value, name: &str, decode: impl Fn(&Value) -> Option<T>) -> Observed<T> {
    match attr_value(entity, name) {
        None | Some(Value::Null) => Observed::Missing,
        Some(v) => match decode(v) {
            Some(t) => Observed::Present(t),
            None => Observed::Malformed(v.to_string()),
        },
    }
}

/// Decode one entity into a partial state. Only `id` is required.
pub fn parse_entity(entity: &Value) -> Result<PartialState, BrokerError> {
    let entity_id = entity
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Decode(format!("entity without id: {entity}")))?
        .to_string();
    let entity_type = entity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let queues = observe(entity, ATTR_QUEUES, |v| {
        v.as_array()?.iter().map(decode_count).collect::<Option<Vec<u32>>>()
    });
    let phase = observe(entity, ATTR_PHASE, |v| decode_count(v).map(|p| p as usize));
    let pm25 = observe(entity, ATTR_PM25, |v| v.as_f64().filter(|f| f.is_finite()));
    let force_phase = observe(entity, ATTR_FORCE_PHASE, |v| {
        decode_count(v).map(|p| p as usize)
    });
    let observed_to = attr_value(entity, ATTR_OBSERVED_TO)
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(PartialState {
        entity_id,
        entity_type,
        queues,
        phase,
        pm25,
        force_phase,
        observed_to,
    })
}

/// Parse a notification body.
///
/// An unreadable envelope is an error; individual entities that cannot be
/// decoded are skipped and returned as the second element.
pub fn parse_notification(body: &[u8]) -> Result<(Vec<PartialState>, Vec<BrokerError>), BrokerError> {
    let envelope: Notification = serde_json::from_slice(body)
        .map_err(|err| BrokerError::Decode(format!("notification envelope: {err}")))?;
    let mut states = Vec::with_capacity(envelope.data.len());
    let mut skipped = Vec::new();
    for entity in &envelope.data {
        match parse_entity(entity) {
            Ok(s) => states.push(s),
            Err(err) => skipped.push(err),
        }
    }
    Ok((states, skipped))
}

pub fn property(value: Value) -> Value {
    json!({ "type": "Property", "value": value })
}

pub fn flow_attrs(flow: &TrafficFlowObserved) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert(ATTR_QUEUES.to_string(), property(json!(flow.queues)));
    attrs.insert(ATTR_PHASE.to_string(), property(json!(flow.phase)));
    attrs.insert(ATTR_VEHICLE_COUNT.to_string(), property(json!(flow.vehicle_count)));
    attrs.insert(
        ATTR_AVG_SPEED.to_string(),
        property(json!(crate::types::clamp_non_negative(flow.avg_speed))),
    );
    attrs.insert(
        ATTR_OBSERVED_FROM.to_string(),
        property(json!(flow.date_observed_from)),
    );
    attrs.insert(ATTR_OBSERVED_TO.to_string(), property(json!(flow.date_observed_to)));
    attrs
}

pub fn air_attrs(air: &AirQualityObserved) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert(
        ATTR_PM25.to_string(),
        property(json!(crate::types::clamp_non_negative(air.pm25))),
    );
    attrs
}

pub fn force_phase_attrs(phase: usize) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert(ATTR_FORCE_PHASE.to_string(), property(json!(phase)));
    attrs
}

/// Full entity document for creation.
pub fn entity_document(id: &str, entity_type: &str, attrs: &Map<String, Value>) -> Value {
    let mut doc = Map::new();
    doc.insert("id".to_string(), json!(id));
    doc.insert("type".to_string(), json!(entity_type));
    for (k, v) in attrs {
        doc.insert(k.clone(), v.clone());
    }
    Value::Object(doc)
}

/// Re-emit the known content of a partial state in normalized form.
pub fn to_normalized(state: &PartialState) -> Value {
    let mut attrs = Map::new();
    if let Observed::Present(q) = &state.queues {
        attrs.insert(ATTR_QUEUES.to_string(), property(json!(q)));
    }
    if let Observed::Present(p) = &state.phase {
        attrs.insert(ATTR_PHASE.to_string(), property(json!(p)));
    }
    if let Observed::Present(v) = &state.pm25 {
        attrs.insert(ATTR_PM25.to_string(), property(json!(v)));
    }
    if let Observed::Present(p) = &state.force_phase {
        attrs.insert(ATTR_FORCE_PHASE.to_string(), property(json!(p)));
    }
    if let Some(to) = &state.observed_to {
        attrs.insert(ATTR_OBSERVED_TO.to_string(), property(json!(to)));
    }
    entity_document(&state.entity_id, &state.entity_type, &attrs)
}
