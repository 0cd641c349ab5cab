//! Canonical data model for streamed classifier output.
//!
//! Every inbound wire shape is adapted into [`CanonicalPrediction`] at the
//! ingestion boundary; nothing downstream ever touches a raw event.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Number of motor-imagery classes the decoder distinguishes.
pub const CLASS_COUNT: usize = 4;

/// The four motor-imagery classes, in wire index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorClass {
    LeftHand,
    RightHand,
    BothFeet,
    Tongue,
}

impl MotorClass {
    /// Map a wire class index onto a class. Indices outside `0..=3` have no
    /// meaning and yield `None`.
    pub fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(MotorClass::LeftHand),
            1 => Some(MotorClass::RightHand),
            2 => Some(MotorClass::BothFeet),
            3 => Some(MotorClass::Tongue),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            MotorClass::LeftHand => 0,
            MotorClass::RightHand => 1,
            MotorClass::BothFeet => 2,
            MotorClass::Tongue => 3,
        }
    }

    /// Operator-facing display label.
    pub fn label(self) -> &'static str {
        match self {
            MotorClass::LeftHand => "Left Hand",
            MotorClass::RightHand => "Right Hand",
            MotorClass::BothFeet => "Both Feet",
            MotorClass::Tongue => "Tongue",
        }
    }
}

/// One channel with its saliency weight, as ranked by the XAI engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelContribution {
    pub name: String,
    pub importance: f32,
}

/// Saliency payload attached to a prediction.
///
/// `channel_names` and `channel_importance` are parallel arrays; when their
/// lengths disagree the payload is treated as unavailable by the projector,
/// without invalidating the record it rides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XaiPayload {
    pub channel_names: Vec<String>,
    pub channel_importance: Vec<f32>,
    /// Pre-ranked top contributors, when the backend supplied them.
    /// Derived from `channel_importance` otherwise.
    pub top_channels: Option<Vec<ChannelContribution>>,
    pub time_importance: Vec<f32>,
}

/// The single normalized prediction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPrediction {
    pub predicted: MotorClass,
    /// Softmax confidence of the predicted class, in [0,1].
    pub confidence: f32,
    /// Model-reported confidence complement, in [0,1].
    pub uncertainty: f32,
    /// Per-class probabilities in class index order, summing to ~1.
    pub probabilities: [f32; CLASS_COUNT],
    /// Arrival stamp, assigned at normalization time.
    pub received_at: SystemTime,
    /// Trial counter, when the stream carries one.
    pub trial_number: Option<u32>,
    /// Backend-measured inference latency, when carried.
    pub inference_time_ms: Option<f32>,
    pub xai: Option<XaiPayload>,
}

impl CanonicalPrediction {
    /// Display label for the predicted class.
    pub fn label(&self) -> &'static str {
        self.predicted.label()
    }
}
