//! Attack-type label mapping.
//!
//! The classifier emits integer class ids. The mapping file
//! (`label_mapping.json`) is an object of `"attack name": id` pairs; class
//! id 0 is always the benign class. The reverse table (id → name) is built
//! once at startup in file order, so if two names share an id the later one
//! wins. That case is logged because it usually means a bad mapping file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

/// Class id reserved for benign traffic.
pub const BENIGN_CLASS: u32 = 0;

/// Label table used when no mapping file is present.
pub const DEFAULT_LABELS: [(&str, u32); 16] = [
    ("Benign", 0),
    ("Bot", 1),
    ("Brute Force -Web", 2),
    ("Brute Force -XSS", 3),
    ("DDOS attack-HOIC", 4),
    ("DDOS attack-LOIC-UDP", 5),
    ("DDoS attacks-LOIC-HTTP", 6),
    ("DoS attacks-GoldenEye", 7),
    ("DoS attacks-Hulk", 8),
    ("DoS attacks-SlowHTTPTest", 9),
    ("DoS attacks-Slowloris", 10),
    ("FTP-BruteForce", 11),
    ("Infilteration", 12),
    ("Label", 13),
    ("SQL Injection", 14),
    ("SSH-Bruteforce", 15),
];

/// Resolved label information for one prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackInfo {
    pub attack_type: String,
    pub is_vulnerable: bool,
    pub vulnerability_status: &'static str,
}

/// Bidirectional attack-type mapping. Immutable after construction.
#[derive(Debug, Clone)]
pub struct LabelMapping {
    /// name → id, in load order
    entries: Vec<(String, u32)>,
    /// id → name, last write wins
    reverse: BTreeMap<u32, String>,
}

impl LabelMapping {
    pub fn from_entries(entries: Vec<(String, u32)>) -> Self {
        let mut reverse = BTreeMap::new();
        for (name, id) in &entries {
            if let Some(previous) = reverse.insert(*id, name.clone()) {
                warn!(
                    class_id = id,
                    previous = %previous,
                    replacement = %name,
                    "duplicate class id in label mapping; later name wins"
                );
            }
        }
        Self { entries, reverse }
    }

    pub fn default_labels() -> Self {
        Self::from_entries(
            DEFAULT_LABELS
                .iter()
                .map(|(name, id)| (name.to_string(), *id))
                .collect(),
        )
    }

    /// Load from a JSON object file, falling back to [`DEFAULT_LABELS`].
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            warn!(path = %path.display(), "label mapping file not found, using default labels");
            return Self::default_labels();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read label mapping, using default labels");
                return Self::default_labels();
            }
        };
        match Self::parse(&content) {
            Ok(mapping) => {
                info!(count = mapping.len(), "loaded attack type labels");
                mapping
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse label mapping, using default labels");
                Self::default_labels()
            }
        }
    }

    /// Parse a `{"name": id, ...}` document. Entries with ids that are not
    /// non-negative integers are skipped.
    pub fn parse(json: &str) -> eyre::Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            match value.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(id) => entries.push((name, id)),
                None => warn!(name = %name, value = %value, "skipping label with invalid class id"),
            }
        }
        if entries.is_empty() {
            eyre::bail!("label mapping contains no usable entries");
        }
        Ok(Self::from_entries(entries))
    }

    /// Resolve a class id. Never fails: unknown ids get a placeholder name.
    pub fn resolve(&self, class_id: u32) -> AttackInfo {
        let attack_type = self
            .reverse
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("Unknown ({})", class_id));
        let is_vulnerable = class_id != BENIGN_CLASS;
        AttackInfo {
            attack_type,
            is_vulnerable,
            vulnerability_status: if is_vulnerable {
                "Attack Detected"
            } else {
                "Safe (Benign)"
            },
        }
    }

    /// name → id, as loaded.
    pub fn entries(&self) -> &[(String, u32)] {
        &self.entries
    }

    /// id → name.
    pub fn reverse(&self) -> &BTreeMap<u32, String> {
        &self.reverse
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LabelMapping {
    fn default() -> Self {
        Self::default_labels()
    }
}
