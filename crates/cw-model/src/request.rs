//! Session request surface: what adapters hand to `run_session`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::event::GateIssue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSpec {
    pub display_id: String,
    pub statement: String,
    pub exclusion_clause: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default = "default_cardinality")]
    pub story_cardinality: usize,
}

fn default_cardinality() -> usize {
    1
}

impl RootSpec {
    #[must_use]
    pub fn new(
        display_id: impl Into<String>,
        statement: impl Into<String>,
        exclusion_clause: impl Into<String>,
    ) -> Self {
        Self {
            display_id: display_id.into(),
            statement: statement.into(),
            exclusion_clause: exclusion_clause.into(),
            components: Vec::new(),
            story_cardinality: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    items: BTreeMap<String, EvidenceItem>,
}

impl EvidenceBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: EvidenceItem) {
        self.items.insert(item.id.clone(), item);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&EvidenceItem> {
        self.items.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Declared MECE pairing between two named roots, referenced by display id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDeclaration {
    pub left: String,
    pub right: String,
    /// Overlap score for the pair; the MECE certificate requires it to
    /// stay at or below the configured maximum.
    pub overlap: u8,
    /// Non-empty statement of what would discriminate the pair.
    pub discriminator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// The scoped question the hypothesis set answers.
    pub claim: String,
    pub roots: Vec<RootSpec>,
    #[serde(default)]
    pub pair_declarations: Vec<PairDeclaration>,
    #[serde(default)]
    pub evidence: EvidenceBundle,
    pub config: Config,
    pub credits: u64,
    /// Declared frame-adequacy score; computed from the evidence bundle
    /// when absent.
    #[serde(default)]
    pub frame_adequacy: Option<f64>,
}

/// Anti-vagueness and standalone-hypothesis findings surfaced before any
/// credit is spent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<GateIssue>,
}

impl ValidationReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{EvidenceBundle, EvidenceItem, RootSpec, SessionRequest};
    use crate::config::Config;

    #[test]
    fn request_round_trips_through_json() {
        let mut evidence = EvidenceBundle::new();
        evidence.insert(EvidenceItem {
            id: "e1".to_owned(),
            text: "the valve log shows a fault".to_owned(),
            source: None,
        });
        let request = SessionRequest {
            claim: "why did the pump fail".to_owned(),
            roots: vec![RootSpec::new("H1", "Alpha mechanism", "not beta")],
            pair_declarations: Vec::new(),
            evidence,
            config: Config::default(),
            credits: 10,
            frame_adequacy: None,
        };
        let json = serde_json::to_string(&request).expect("serialize");
        let parsed: SessionRequest = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, request);
    }

    #[test]
    fn story_cardinality_defaults_to_one() {
        let spec: RootSpec = serde_json::from_str(
            r#"{"display_id":"H1","statement":"alpha","exclusion_clause":"x"}"#,
        )
        .expect("parse");
        assert_eq!(spec.story_cardinality, 1);
        assert!(spec.components.is_empty());
    }
}
