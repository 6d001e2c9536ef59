//! Response normalization
//!
//! Converts backend-native output into a [`ClassificationResult`]. Every
//! result leaving this module satisfies:
//! - all four labels present, scores non-negative, summing to 100 within
//!   [`SUM_TOLERANCE`]
//! - `distribution[label]` is a maximum of the distribution
//!
//! Output that cannot meet these is a [`BackendError::MalformedResponse`].

use crate::backend::{LabelCounts, LabelProbability, RawOutput};
use crate::error::BackendError;
use crate::types::{BackendTier, ClassificationResult, Distribution, Label};
use regex::Regex;
use std::sync::LazyLock;

/// Allowed deviation of a distribution's sum from 100
pub const SUM_TOLERANCE: f64 = 0.5;

/// Confidence reported when the heuristic cannot pick a label
pub const UNDECIDED_CONFIDENCE: f64 = 50.0;

/// Upper bound on heuristic confidence
pub const HEURISTIC_MAX_CONFIDENCE: f64 = 99.0;

static HEADLINE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"##\s*(💀|🙃|😌|😐)\s*(\w+)\s*\((\d+(?:\.\d+)?)%\)"));

static BREAKDOWN: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"-\s*(💀|🙃|😌|😐)\s*\*\*(\w+)\*\*:.*?(\d+(?:\.\d+)?)%"));

pub type Result<T> = std::result::Result<T, BackendError>;

/// Normalize the raw output of `tier`
pub fn normalize(tier: BackendTier, raw: RawOutput) -> Result<ClassificationResult> {
    match (tier, raw) {
        (BackendTier::OnDeviceModel, RawOutput::OnDevice(probabilities)) => {
            normalize_on_device(&probabilities)
        }
        (BackendTier::RemoteApi, RawOutput::Remote(markdown)) => normalize_remote(&markdown),
        (BackendTier::HeuristicScorer, RawOutput::Heuristic(counts)) => {
            Ok(normalize_heuristic(&counts))
        }
        (tier, raw) => Err(BackendError::malformed(format!(
            "{tier} produced output of another backend: {raw:?}"
        ))),
    }
}

fn normalize_on_device(probabilities: &[LabelProbability]) -> Result<ClassificationResult> {
    if probabilities.is_empty() {
        return Err(BackendError::malformed("model returned no scores"));
    }

    let mut distribution = empty_distribution();
    let mut seen = Vec::with_capacity(probabilities.len());
    for entry in probabilities {
        let label = Label::from_index(entry.index).ok_or_else(|| {
            BackendError::malformed(format!("label index {} out of range", entry.index))
        })?;
        if !entry.probability.is_finite() || !(0.0..=1.0).contains(&entry.probability) {
            return Err(BackendError::malformed(format!(
                "probability {} for {label} is not in [0, 1]",
                entry.probability
            )));
        }
        if seen.contains(&label) {
            return Err(BackendError::malformed(format!("duplicate score for {label}")));
        }
        seen.push(label);
        distribution.insert(label, entry.probability * 100.0);
    }

    // Highest score first; equal scores fall back to index order
    let (label, confidence) = ranked(&distribution)[0];
    let distribution = rescale(distribution)?;

    Ok(ClassificationResult {
        label,
        confidence,
        distribution,
        backend: BackendTier::OnDeviceModel,
    })
}

fn normalize_remote(markdown: &str) -> Result<ClassificationResult> {
    let (headline_re, breakdown_re) = match (&*HEADLINE, &*BREAKDOWN) {
        (Ok(h), Ok(b)) => (h, b),
        (Err(e), _) | (_, Err(e)) => return Err(BackendError::malformed(e.to_string())),
    };
    let headline = headline_re
        .captures(markdown)
        .ok_or_else(|| BackendError::malformed("response has no parseable headline"))?;
    let label = parse_label(&headline[2])?;
    let confidence = parse_percent(&headline[3])?;

    let mut breakdown = Distribution::new();
    for line in breakdown_re.captures_iter(markdown) {
        let entry = parse_label(&line[2])?;
        let score = parse_percent(&line[3])?;
        if breakdown.insert(entry, score).is_some() {
            return Err(BackendError::malformed(format!("{entry} listed twice in breakdown")));
        }
    }

    breakdown.entry(label).or_insert(confidence);
    let missing: Vec<Label> = Label::ALL
        .into_iter()
        .filter(|l| !breakdown.contains_key(l))
        .collect();
    if !missing.is_empty() {
        let remaining = (100.0 - breakdown.values().sum::<f64>()).max(0.0);
        let share = remaining / missing.len() as f64;
        for l in missing {
            breakdown.insert(l, share);
        }
    }

    let distribution = rescale(breakdown)?;
    let top = ranked(&distribution)[0].1;
    if distribution[&label] < top {
        return Err(BackendError::malformed(format!(
            "headline {label} is not the highest score in the breakdown"
        )));
    }

    Ok(ClassificationResult {
        label,
        confidence,
        distribution,
        backend: BackendTier::RemoteApi,
    })
}

fn normalize_heuristic(counts: &LabelCounts) -> ClassificationResult {
    let count = |label: &Label| counts.get(label).copied().unwrap_or(0);
    let total: u64 = Label::ALL.iter().map(|l| u64::from(count(l))).sum();
    let best = Label::ALL.iter().map(count).max().unwrap_or(0);
    let leaders: Vec<Label> = Label::ALL
        .into_iter()
        .filter(|l| count(l) == best)
        .collect();

    if total == 0 || leaders.len() > 1 {
        // Undecided: neutral holds half the mass, the contenders share the rest
        let contenders: Vec<Label> = if total == 0 {
            Label::ALL.into_iter().filter(|l| *l != Label::Neutral).collect()
        } else {
            leaders.into_iter().filter(|l| *l != Label::Neutral).collect()
        };
        let mut distribution = empty_distribution();
        distribution.insert(Label::Neutral, UNDECIDED_CONFIDENCE);
        let share = (100.0 - UNDECIDED_CONFIDENCE) / contenders.len().max(1) as f64;
        for label in contenders {
            distribution.insert(label, share);
        }

        return ClassificationResult {
            label: Label::Neutral,
            confidence: UNDECIDED_CONFIDENCE,
            distribution,
            backend: BackendTier::HeuristicScorer,
        };
    }

    let label = leaders[0];
    let distribution = Label::ALL
        .into_iter()
        .map(|l| (l, count(&l) as f64 * 100.0 / total as f64))
        .collect();
    let confidence = (50.0 + 15.0 * best as f64).min(HEURISTIC_MAX_CONFIDENCE);

    ClassificationResult {
        label,
        confidence,
        distribution,
        backend: BackendTier::HeuristicScorer,
    }
}

fn empty_distribution() -> Distribution {
    Label::ALL.into_iter().map(|l| (l, 0.0)).collect()
}

fn ranked(distribution: &Distribution) -> Vec<(Label, f64)> {
    let mut ranked: Vec<(Label, f64)> = distribution.iter().map(|(l, s)| (*l, *s)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Scale so the scores sum to 100 when they drift past the tolerance
fn rescale(distribution: Distribution) -> Result<Distribution> {
    let sum: f64 = distribution.values().sum();
    if (sum - 100.0).abs() <= SUM_TOLERANCE {
        return Ok(distribution);
    }
    if sum <= 0.0 {
        return Err(BackendError::malformed("scores sum to zero"));
    }
    Ok(distribution
        .into_iter()
        .map(|(label, score)| (label, score * 100.0 / sum))
        .collect())
}

fn parse_label(name: &str) -> Result<Label> {
    Label::from_name(name).ok_or_else(|| BackendError::malformed(format!("unknown label {name:?}")))
}

fn parse_percent(value: &str) -> Result<f64> {
    let percent: f64 = value
        .parse()
        .map_err(|_| BackendError::malformed(format!("invalid percentage {value:?}")))?;
    if percent > 100.0 {
        return Err(BackendError::malformed(format!("percentage {percent} exceeds 100")));
    }
    Ok(percent)
}
