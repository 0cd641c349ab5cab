//! Explainability projections over a canonical record's saliency payload.
//!
//! Pure derivations only; the saliency numbers themselves come from the
//! backend's Grad-CAM engine and are consumed here as-is.

use serde::{Deserialize, Serialize};

use crate::record::{CanonicalPrediction, ChannelContribution, XaiPayload};

/// Fixed analysis window the time-importance axis spans, in milliseconds.
pub const XAI_WINDOW_MS: f32 = 3000.0;

/// Number of channels surfaced in the top-contributor list when the backend
/// did not rank them itself.
pub const TOP_CHANNEL_COUNT: usize = 5;

/// One cell of the time-axis heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSample {
    /// Offset of this sample from trial onset, in milliseconds.
    pub offset_ms: f32,
    /// Saliency weight in [0,1].
    pub weight: f32,
}

/// Ranked view of one record's saliency payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainabilityView {
    /// Every channel, sorted by importance descending. Ties keep the
    /// original electrode order.
    pub ranked: Vec<ChannelContribution>,
    /// The strongest contributors, at most [`TOP_CHANNEL_COUNT`] unless the
    /// backend supplied its own list.
    pub top_channels: Vec<ChannelContribution>,
    /// Uniform time axis over [`XAI_WINDOW_MS`]; same length as the
    /// payload's `time_importance`.
    pub heatmap: Vec<HeatmapSample>,
}

/// Project a record's saliency payload into display-ready rankings.
///
/// Returns `None` when the record carries no payload or when the parallel
/// channel arrays disagree in length. XAI is then unavailable for this
/// record, which stays valid otherwise.
pub fn project(prediction: &CanonicalPrediction) -> Option<ExplainabilityView> {
    project_payload(prediction.xai.as_ref()?)
}

pub fn project_payload(xai: &XaiPayload) -> Option<ExplainabilityView> {
    if xai.channel_names.len() != xai.channel_importance.len() {
        return None;
    }

    let mut ranked: Vec<(usize, ChannelContribution)> = xai
        .channel_names
        .iter()
        .zip(&xai.channel_importance)
        .enumerate()
        .map(|(i, (name, &importance))| {
            (
                i,
                ChannelContribution {
                    name: name.clone(),
                    importance,
                },
            )
        })
        .collect();
    // Descending by importance; ties break on the original channel index.
    ranked.sort_by(|(ia, a), (ib, b)| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ia.cmp(ib))
    });
    let ranked: Vec<ChannelContribution> = ranked.into_iter().map(|(_, c)| c).collect();

    let top_channels = match &xai.top_channels {
        Some(supplied) if !supplied.is_empty() => supplied.clone(),
        _ => ranked
            .iter()
            .take(TOP_CHANNEL_COUNT)
            .cloned()
            .collect(),
    };

    let step = XAI_WINDOW_MS / xai.time_importance.len().max(1) as f32;
    let heatmap = xai
        .time_importance
        .iter()
        .enumerate()
        .map(|(i, &weight)| HeatmapSample {
            offset_ms: i as f32 * step,
            weight,
        })
        .collect();

    Some(ExplainabilityView {
        ranked,
        top_channels,
        heatmap,
    })
}
