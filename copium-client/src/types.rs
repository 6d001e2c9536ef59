//! Common types for the CopiumMeter client

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Affect label assigned to a piece of text
///
/// Declaration order is the fixed label index table used by the on-device
/// model (`LABEL_0` = copium ... `LABEL_3` = neutral).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Copium,
    Sarcastic,
    Sincere,
    Neutral,
}

impl Label {
    /// All labels in index order
    pub const ALL: [Label; 4] = [
        Label::Copium,
        Label::Sarcastic,
        Label::Sincere,
        Label::Neutral,
    ];

    /// Position of the label in the model's output table
    pub fn index(self) -> usize {
        match self {
            Self::Copium => 0,
            Self::Sarcastic => 1,
            Self::Sincere => 2,
            Self::Neutral => 3,
        }
    }

    /// Look up a label by its model output index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Look up a label by name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|label| label.key().eq_ignore_ascii_case(name.trim()))
    }

    /// Look up a label by its emoji
    pub fn from_emoji(emoji: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.emoji() == emoji)
    }

    /// Lowercase identifier (`copium`, `sarcastic`, ...)
    pub fn key(self) -> &'static str {
        match self {
            Self::Copium => "copium",
            Self::Sarcastic => "sarcastic",
            Self::Sincere => "sincere",
            Self::Neutral => "neutral",
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Self::Copium => "Copium",
            Self::Sarcastic => "Sarcastic",
            Self::Sincere => "Sincere",
            Self::Neutral => "Neutral",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Self::Copium => "💀",
            Self::Sarcastic => "🙃",
            Self::Sincere => "😌",
            Self::Neutral => "😐",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Copium => "Denial, coping, rationalization",
            Self::Sarcastic => "Irony, mockery, exaggeration",
            Self::Sincere => "Genuine, honest, appreciative",
            Self::Neutral => "Factual, objective, informational",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inference backend, in fallback priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// Model running in-process, available offline once loaded
    OnDeviceModel,
    /// Hosted inference endpoint
    RemoteApi,
    /// Pattern-count heuristic, always available
    HeuristicScorer,
}

impl BackendTier {
    /// Tiers in the order the fallback chain tries them
    pub const PRIORITY: [BackendTier; 3] = [
        BackendTier::OnDeviceModel,
        BackendTier::RemoteApi,
        BackendTier::HeuristicScorer,
    ];
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnDeviceModel => "on-device model",
            Self::RemoteApi => "remote API",
            Self::HeuristicScorer => "heuristic scorer",
        };
        f.write_str(name)
    }
}

/// Per-label percentage scores
pub type Distribution = BTreeMap<Label, f64>;

/// Canonical classification result shared by every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Winning label; always a maximum of `distribution`
    pub label: Label,
    /// Confidence reported by the winning backend, in `[0, 100]`
    pub confidence: f64,
    /// Scores for all four labels, summing to 100 within rounding
    pub distribution: Distribution,
    /// Backend that produced this result
    pub backend: BackendTier,
}

impl ClassificationResult {
    /// Score for a single label (0 when absent)
    pub fn score(&self, label: Label) -> f64 {
        self.distribution.get(&label).copied().unwrap_or(0.0)
    }

    /// Labels sorted by descending score
    pub fn ranked(&self) -> Vec<(Label, f64)> {
        let mut ranked: Vec<(Label, f64)> =
            self.distribution.iter().map(|(l, s)| (*l, *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_index_table() {
        for (i, label) in Label::ALL.iter().enumerate() {
            assert_eq!(label.index(), i);
            assert_eq!(Label::from_index(i), Some(*label));
        }
        assert_eq!(Label::from_index(4), None);
    }

    #[test]
    fn test_label_from_name_is_case_insensitive() {
        assert_eq!(Label::from_name("COPIUM"), Some(Label::Copium));
        assert_eq!(Label::from_name("Sarcastic"), Some(Label::Sarcastic));
        assert_eq!(Label::from_name("unknown"), None);
    }

    #[test]
    fn test_label_from_emoji() {
        assert_eq!(Label::from_emoji("😌"), Some(Label::Sincere));
        assert_eq!(Label::from_emoji("❓"), None);
    }

    #[test]
    fn test_label_serde_lowercase() {
        let json = serde_json::to_string(&Label::Neutral).unwrap();
        assert_eq!(json, "\"neutral\"");
    }

    #[test]
    fn test_ranked_orders_by_score() {
        let result = ClassificationResult {
            label: Label::Sincere,
            confidence: 70.0,
            distribution: Distribution::from([
                (Label::Copium, 10.0),
                (Label::Sarcastic, 5.0),
                (Label::Sincere, 70.0),
                (Label::Neutral, 15.0),
            ]),
            backend: BackendTier::RemoteApi,
        };

        let ranked = result.ranked();
        assert_eq!(ranked[0].0, Label::Sincere);
        assert_eq!(ranked[3].0, Label::Sarcastic);
        assert_eq!(result.score(Label::Neutral), 15.0);
    }
}
