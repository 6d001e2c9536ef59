//! Pattern-count heuristic scorer
//!
//! Scores text by counting matched patterns per label under a versioned,
//! serde-loadable [`HeuristicPolicy`]. Always ready and never fails, which
//! makes it the terminal tier of the fallback chain.

use super::{Backend, RawOutput};
use crate::error::{BackendError, ConfigError};
use crate::types::{BackendTier, Label};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weighted match counts per label
pub type LabelCounts = BTreeMap<Label, u32>;

/// One pattern and the weight it adds when it matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub label: Label,
    /// Regular expression, matched case-insensitively
    pub pattern: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Extra weight for `label` when it already matched and the text contains
/// any of `keywords`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostRule {
    pub label: Label,
    pub keywords: Vec<String>,
    pub bonus: u32,
}

/// Versioned classification policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicPolicy {
    pub version: u32,
    pub rules: Vec<PatternRule>,
    #[serde(default)]
    pub boosts: Vec<BoostRule>,
}

impl HeuristicPolicy {
    /// Built-in policy
    pub fn default_v1() -> Self {
        let copium = [
            r"it'?s? fine",
            r"i'?m? not even mad",
            r"whatever",
            r"didn'?t want",
            r"doesn'?t matter",
            r"who cares",
            r"at least",
            r"could be worse",
            r"i'?m? over it",
            r"no big deal",
            r"anyway",
            r"i guess",
        ];
        let sarcastic = [
            r"oh great",
            r"just what i needed",
            r"how wonderful",
            r"so excited",
            r"can'?t wait",
            r"amazing",
            r"totally",
            r"obviously",
            r"sure",
            r"right",
        ];
        let sincere = [
            r"thank you",
            r"thanks",
            r"appreciate",
            r"grateful",
            r"love this",
            r"really helped",
            r"glad",
        ];

        let rules = [
            (Label::Copium, &copium[..]),
            (Label::Sarcastic, &sarcastic[..]),
            (Label::Sincere, &sincere[..]),
        ]
        .into_iter()
        .flat_map(|(label, patterns)| {
            patterns.iter().map(move |pattern| PatternRule {
                label,
                pattern: pattern.to_string(),
                weight: 1,
            })
        })
        .collect();

        Self {
            version: 1,
            rules,
            boosts: vec![BoostRule {
                label: Label::Copium,
                keywords: vec!["anyway".to_string(), "fine".to_string()],
                bonus: 2,
            }],
        }
    }

    /// Compile every pattern; an invalid pattern rejects the whole policy
    pub fn compile(&self) -> Result<HeuristicScorer, ConfigError> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (rule.label, regex, rule.weight))
                    .map_err(|source| ConfigError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HeuristicScorer {
            version: self.version,
            rules,
            boosts: self.boosts.clone(),
        })
    }
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// Compiled policy
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    version: u32,
    rules: Vec<(Label, Regex, u32)>,
    boosts: Vec<BoostRule>,
}

impl HeuristicScorer {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Weighted match count for every label (zero entries included)
    pub fn score(&self, text: &str) -> LabelCounts {
        let mut counts: LabelCounts = Label::ALL.iter().map(|label| (*label, 0)).collect();

        for (label, regex, weight) in &self.rules {
            if regex.is_match(text) {
                let count = counts.entry(*label).or_default();
                *count = count.saturating_add(*weight);
            }
        }

        let lower = text.to_lowercase();
        for boost in &self.boosts {
            let matched = counts.get(&boost.label).is_some_and(|c| *c > 0);
            if matched && boost.keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
                let count = counts.entry(boost.label).or_default();
                *count = count.saturating_add(boost.bonus);
            }
        }
        counts
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        // The built-in patterns are fixed literals
        HeuristicPolicy::default_v1()
            .compile()
            .unwrap_or_else(|_| HeuristicScorer {
                version: 1,
                rules: Vec::new(),
                boosts: Vec::new(),
            })
    }
}

/// Terminal backend tier
pub struct HeuristicBackend {
    scorer: HeuristicScorer,
}

impl HeuristicBackend {
    pub fn new(scorer: HeuristicScorer) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl Backend for HeuristicBackend {
    fn tier(&self) -> BackendTier {
        BackendTier::HeuristicScorer
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn infer(&self, text: &str) -> Result<RawOutput, BackendError> {
        Ok(RawOutput::Heuristic(self.scorer.score(text)))
    }
}
