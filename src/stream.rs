//! Prediction ingestion: wire-shape normalization and the bounded history.
//!
//! Two event shapes have been observed on the stream channel:
//! - the full shape: `predicted_class`, `confidence`, `uncertainty`,
//!   `probabilities` (flat, or nested one level as emitted by the model
//!   server), and an `xai` object (flat, or with the importance arrays under
//!   a `grad_cam` key);
//! - a reduced shape carrying only `predicted_class` and `confidence`.
//!
//! All schema knowledge lives in [`normalize`]; everything downstream sees
//! only [`CanonicalPrediction`].

use std::collections::VecDeque;
use std::time::SystemTime;

use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
use crate::record::{
    CanonicalPrediction, ChannelContribution, MotorClass, XaiPayload, CLASS_COUNT,
};

/// Maximum number of records the history retains; oldest are evicted first.
pub const PREDICTION_CAPACITY: usize = 50;

fn malformed(msg: impl Into<String>) -> ClientError {
    ClientError::MalformedEvent(msg.into())
}

fn clamp01(v: f64) -> f32 {
    v.clamp(0.0, 1.0) as f32
}

/// Adapt a raw stream event into a [`CanonicalPrediction`].
///
/// Total: any input yields either a record or [`ClientError::MalformedEvent`],
/// never a panic. Shape detection is structural; there is no version tag to
/// trust.
pub fn normalize(raw: &Value) -> Result<CanonicalPrediction, ClientError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| malformed("event is not a JSON object"))?;

    let class_index = obj
        .get("predicted_class")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing or non-integer predicted_class"))?;
    let predicted = MotorClass::from_index(class_index)
        .ok_or_else(|| malformed(format!("predicted_class {class_index} out of range")))?;

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .map(clamp01)
        .ok_or_else(|| malformed("missing or non-numeric confidence"))?;

    // Reduced shape: uncertainty is the confidence complement when absent.
    let uncertainty = match obj.get("uncertainty") {
        Some(v) => v
            .as_f64()
            .map(clamp01)
            .ok_or_else(|| malformed("non-numeric uncertainty"))?,
        None => 1.0 - confidence,
    };

    let probabilities = match obj.get("probabilities") {
        Some(v) => parse_probabilities(v)?,
        None => spread_probabilities(predicted, confidence),
    };

    let trial_number = obj
        .get("trial_number")
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32);
    let inference_time_ms = obj
        .get("inference_time_ms")
        .and_then(Value::as_f64)
        .map(|v| v as f32);

    Ok(CanonicalPrediction {
        predicted,
        confidence,
        uncertainty,
        probabilities,
        received_at: SystemTime::now(),
        trial_number,
        inference_time_ms,
        xai: obj.get("xai").and_then(parse_xai),
    })
}

/// Accept either a flat `[p0..p3]` or the singly nested `[[p0..p3]]` the
/// model server emits for a batch of one.
fn parse_probabilities(v: &Value) -> Result<[f32; CLASS_COUNT], ClientError> {
    let arr = v
        .as_array()
        .ok_or_else(|| malformed("probabilities is not an array"))?;
    let flat = match arr.as_slice() {
        [Value::Array(inner)] => inner.as_slice(),
        _ => arr.as_slice(),
    };
    if flat.len() != CLASS_COUNT {
        return Err(malformed(format!(
            "probabilities has length {}, expected {CLASS_COUNT}",
            flat.len()
        )));
    }
    let mut out = [0.0f32; CLASS_COUNT];
    for (slot, value) in out.iter_mut().zip(flat) {
        *slot = value
            .as_f64()
            .map(clamp01)
            .ok_or_else(|| malformed("non-numeric probability entry"))?;
    }
    Ok(out)
}

/// Fill-in for the reduced shape: the predicted class keeps its confidence,
/// the remainder is spread uniformly over the other classes.
fn spread_probabilities(predicted: MotorClass, confidence: f32) -> [f32; CLASS_COUNT] {
    let rest = (1.0 - confidence) / (CLASS_COUNT as f32 - 1.0);
    let mut out = [rest; CLASS_COUNT];
    out[predicted.index()] = confidence;
    out
}

/// Adapt either xai layout. Anything that fits neither yields `None`;
/// a record without saliency is still a valid record.
fn parse_xai(v: &Value) -> Option<XaiPayload> {
    let obj = v.as_object()?;

    // Importance arrays live either at the top level or under `grad_cam`;
    // `top_channels` is a sibling of whichever holds them.
    let body = match obj.get("grad_cam").and_then(Value::as_object) {
        Some(inner) => inner,
        None => obj,
    };

    let channel_names: Vec<String> = body
        .get("channel_names")?
        .as_array()?
        .iter()
        .map(|n| n.as_str().map(str::to_string))
        .collect::<Option<_>>()?;
    let channel_importance = parse_weight_vec(body.get("channel_importance")?)?;
    let time_importance = parse_weight_vec(body.get("time_importance")?)?;

    let top_channels = obj
        .get("top_channels")
        .or_else(|| body.get("top_channels"))
        .and_then(parse_top_channels);

    Some(XaiPayload {
        channel_names,
        channel_importance,
        top_channels,
        time_importance,
    })
}

fn parse_weight_vec(v: &Value) -> Option<Vec<f32>> {
    v.as_array()?
        .iter()
        .map(|w| w.as_f64().map(clamp01))
        .collect()
}

fn parse_top_channels(v: &Value) -> Option<Vec<ChannelContribution>> {
    v.as_array()?
        .iter()
        .map(|entry| {
            let obj = entry.as_object()?;
            Some(ChannelContribution {
                name: obj.get("name")?.as_str()?.to_string(),
                importance: obj.get("importance")?.as_f64().map(clamp01)?,
            })
        })
        .collect()
}

/// Arrival-ordered, capacity-bounded prediction history, scoped to one session.
///
/// Records append at the back; the oldest drop off the front once
/// [`PREDICTION_CAPACITY`] is reached. `latest()` is O(1). Order is strictly
/// delivery order, never re-sorted by timestamp or any other key.
#[derive(Debug, Default)]
pub struct PredictionStream {
    session: Option<u64>,
    buf: VecDeque<CanonicalPrediction>,
}

impl PredictionStream {
    pub fn new() -> Self {
        Self {
            session: None,
            buf: VecDeque::with_capacity(PREDICTION_CAPACITY),
        }
    }

    /// Rebind the buffer to a new session, discarding all prior history.
    pub fn begin_session(&mut self, session_id: u64) {
        self.session = Some(session_id);
        self.buf.clear();
    }

    /// The session this buffer currently belongs to.
    pub fn session(&self) -> Option<u64> {
        self.session
    }

    /// Normalize and append one raw event for `session_id`.
    ///
    /// Returns `Ok(true)` when the record was appended, `Ok(false)` when it
    /// was valid but tagged for a session this buffer no longer tracks (a
    /// late delivery after stop/restart), and an error when malformed. The
    /// buffer is untouched in both non-append cases.
    pub fn ingest(&mut self, session_id: u64, raw: &Value) -> Result<bool, ClientError> {
        let record = normalize(raw)?;
        if self.session != Some(session_id) {
            debug!(session_id, "dropping event for inactive session");
            return Ok(false);
        }
        self.append(record);
        Ok(true)
    }

    /// Append in arrival order, evicting the oldest record past capacity.
    pub fn append(&mut self, record: CanonicalPrediction) {
        self.buf.push_back(record);
        if self.buf.len() > PREDICTION_CAPACITY {
            self.buf.pop_front();
        }
    }

    /// Most recent record, O(1).
    pub fn latest(&self) -> Option<&CanonicalPrediction> {
        self.buf.back()
    }

    /// History in delivery order, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &CanonicalPrediction> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_full_shape() {
        let raw = json!({
            "predicted_class": 1,
            "class_name": "Right Hand",
            "confidence": 0.87,
            "uncertainty": 0.04,
            "probabilities": [0.05, 0.87, 0.05, 0.03],
            "inference_time_ms": 47,
            "trial_number": 12,
        });
        let rec = normalize(&raw).unwrap();
        assert_eq!(rec.predicted, MotorClass::RightHand);
        assert_eq!(rec.label(), "Right Hand");
        assert!((rec.confidence - 0.87).abs() < 1e-6);
        assert!((rec.probabilities[1] - 0.87).abs() < 1e-6);
        assert_eq!(rec.trial_number, Some(12));
        assert!(rec.xai.is_none());
    }

    #[test]
    fn normalizes_nested_probabilities() {
        // Shape emitted by the model server for a batch of one.
        let raw = json!({
            "predicted_class": 0,
            "confidence": 0.6,
            "probabilities": [[0.6, 0.2, 0.1, 0.1]],
        });
        let rec = normalize(&raw).unwrap();
        assert!((rec.probabilities[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn reduced_shape_fills_in_complements() {
        let raw = json!({ "predicted_class": 2, "confidence": 0.7 });
        let rec = normalize(&raw).unwrap();
        assert_eq!(rec.predicted, MotorClass::BothFeet);
        assert!((rec.uncertainty - 0.3).abs() < 1e-6);
        assert!((rec.probabilities[2] - 0.7).abs() < 1e-6);
        assert!((rec.probabilities[0] - 0.1).abs() < 1e-6);
        let sum: f32 = rec.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(rec.xai.is_none());
    }

    #[test]
    fn normalizes_flat_xai() {
        let raw = json!({
            "predicted_class": 1,
            "confidence": 0.9,
            "xai": {
                "channel_names": ["C3", "C4"],
                "channel_importance": [0.8, 0.4],
                "top_channels": [{"name": "C3", "importance": 0.8}],
                "time_importance": [0.1, 0.9, 0.2],
            },
        });
        let xai = normalize(&raw).unwrap().xai.unwrap();
        assert_eq!(xai.channel_names, vec!["C3", "C4"]);
        assert_eq!(xai.top_channels.unwrap().len(), 1);
        assert_eq!(xai.time_importance.len(), 3);
    }

    #[test]
    fn normalizes_grad_cam_nested_xai() {
        let raw = json!({
            "predicted_class": 1,
            "confidence": 0.9,
            "xai": {
                "grad_cam": {
                    "channel_names": ["C3", "Cz"],
                    "channel_importance": [0.5, 0.3],
                    "time_importance": [0.2, 0.4],
                },
                "top_channels": [{"name": "C3", "importance": 0.5}],
            },
        });
        let xai = normalize(&raw).unwrap().xai.unwrap();
        assert_eq!(xai.channel_names, vec!["C3", "Cz"]);
        assert_eq!(xai.top_channels.unwrap()[0].name, "C3");
    }

    #[test]
    fn garbage_xai_drops_payload_not_record() {
        let raw = json!({
            "predicted_class": 0,
            "confidence": 0.5,
            "xai": {"unexpected": true},
        });
        let rec = normalize(&raw).unwrap();
        assert!(rec.xai.is_none());
    }

    #[test]
    fn rejects_incompatible_shapes() {
        assert!(normalize(&json!("not an object")).is_err());
        assert!(normalize(&json!({ "confidence": 0.5 })).is_err());
        assert!(normalize(&json!({ "predicted_class": 9, "confidence": 0.5 })).is_err());
        assert!(normalize(&json!({ "predicted_class": 1 })).is_err());
        assert!(normalize(&json!({
            "predicted_class": 1,
            "confidence": 0.5,
            "probabilities": [0.5, 0.5],
        }))
        .is_err());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let raw = json!({ "predicted_class": 0, "confidence": 1.7, "uncertainty": -0.2 });
        let rec = normalize(&raw).unwrap();
        assert_eq!(rec.confidence, 1.0);
        assert_eq!(rec.uncertainty, 0.0);
    }

    fn event(class: u64, trial: u64) -> Value {
        json!({ "predicted_class": class, "confidence": 0.8, "trial_number": trial })
    }

    #[test]
    fn buffer_caps_at_capacity_and_keeps_arrival_order() {
        let mut stream = PredictionStream::new();
        stream.begin_session(1);
        for i in 0..51u64 {
            assert!(stream.ingest(1, &event(i % 4, i)).unwrap());
            assert!(stream.len() <= PREDICTION_CAPACITY);
        }
        assert_eq!(stream.len(), PREDICTION_CAPACITY);
        // The very first event was evicted; order is strictly arrival order.
        let trials: Vec<u32> = stream.history().filter_map(|r| r.trial_number).collect();
        assert_eq!(trials.first(), Some(&1));
        assert_eq!(trials.last(), Some(&50));
        assert!(trials.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stream.latest().unwrap().trial_number, Some(50));
    }

    #[test]
    fn malformed_events_leave_buffer_unmutated() {
        let mut stream = PredictionStream::new();
        stream.begin_session(1);
        stream.ingest(1, &event(0, 0)).unwrap();
        let err = stream.ingest(1, &json!({"predicted_class": 99, "confidence": 0.2}));
        assert!(matches!(err, Err(ClientError::MalformedEvent(_))));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn stale_session_events_are_dropped_silently() {
        let mut stream = PredictionStream::new();
        stream.begin_session(2);
        assert!(!stream.ingest(1, &event(0, 0)).unwrap());
        assert!(stream.is_empty());
    }

    #[test]
    fn new_session_clears_history() {
        let mut stream = PredictionStream::new();
        stream.begin_session(1);
        stream.ingest(1, &event(0, 0)).unwrap();
        stream.begin_session(2);
        assert!(stream.is_empty());
        assert_eq!(stream.session(), Some(2));
    }
}
