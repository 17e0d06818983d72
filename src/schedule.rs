//! Theme rotation schedule
//!
//! Ingest runs several times a day; each slot scans a different theme.
//! Themes carry a track tier: free themes feed the public channel,
//! premium themes feed paid deep-dives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a theme feeds the free channel or the paid track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackTier {
    Free,
    Premium,
}

/// A scan theme with its search keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub name: String,
    pub tier: TrackTier,
    pub keywords: Vec<String>,
}

impl Theme {
    pub fn new(name: impl Into<String>, tier: TrackTier, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            tier,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Hour-of-day theme rotation.
#[derive(Debug, Clone)]
pub struct Schedule {
    slots: BTreeMap<u32, Theme>,
}

impl Default for Schedule {
    fn default() -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(
            2,
            Theme::new(
                "Deep Research",
                TrackTier::Premium,
                &[
                    "commerce research paper",
                    "trade technology study",
                    "digital transformation research",
                ],
            ),
        );
        slots.insert(
            6,
            Theme::new(
                "AI Tools & Agents",
                TrackTier::Free,
                &["AI agent launch", "new AI tool product", "AI automation startup", "LLM application"],
            ),
        );
        slots.insert(
            10,
            Theme::new(
                "Cross-border Commerce",
                TrackTier::Free,
                &["cross-border ecommerce trend", "marketplace seller update", "global logistics DTC"],
            ),
        );
        slots.insert(
            14,
            Theme::new(
                "SaaS & Digital Trade",
                TrackTier::Premium,
                &["SaaS startup funding", "B2B SaaS product launch", "trade compliance software"],
            ),
        );
        slots.insert(
            18,
            Theme::new(
                "Crypto & Web3",
                TrackTier::Premium,
                &["crypto regulation update", "stablecoin cross-border payment", "blockchain trade finance"],
            ),
        );
        slots.insert(
            22,
            Theme::new(
                "General Tech",
                TrackTier::Free,
                &["trending tech product", "tech startup launch", "developer tool release"],
            ),
        );
        Self { slots }
    }
}

impl Schedule {
    /// Theme for an hour: the nearest slot at or before it, wrapping to the
    /// earliest slot for the hours before the first one.
    pub fn theme_for_hour(&self, hour: u32) -> &Theme {
        let mut best = self.slots.values().next().expect("schedule has at least one slot");
        for (h, theme) in &self.slots {
            if *h <= hour {
                best = theme;
            }
        }
        best
    }

    /// Ad hoc theme from a manual override; the name doubles as the
    /// keyword, and tier is looked up from the named slot when it matches.
    pub fn theme_override(&self, name: &str) -> Theme {
        let tier = self
            .slots
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .map(|t| t.tier)
            .unwrap_or(TrackTier::Free);
        Theme::new(name, tier, &[name])
    }

    pub fn slot_hours(&self) -> Vec<u32> {
        self.slots.keys().copied().collect()
    }
}
