use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Step;
use crate::error::{Error, Result};
use crate::store;

/// Catalog of known target models and the steps declared for each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    /// Manufacturer string -> model id used when no alias matches
    #[serde(default)]
    pub manufacturer_defaults: BTreeMap<String, String>,
}

/// One model (or model class) in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Declared steps. `None` marks a legacy entry using the conventional
    /// `drivers/<id>/` layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    /// Free-form legacy resource declarations, carried but not interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

/// How a target was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedBy {
    Alias(String),
    ManufacturerDefault(String),
}

/// Result of target resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub model_id: String,
    pub resolved_by: ResolvedBy,
    /// Other model ids whose aliases also matched; non-empty means the pick
    /// came down to manifest order and deserves operator review
    pub also_matched: Vec<String>,
}

impl Resolution {
    pub fn is_ambiguous(&self) -> bool {
        !self.also_matched.is_empty()
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        store::read_json(path)?
            .ok_or_else(|| Error::Manifest(format!("manifest not found: {}", path.display())))
    }

    pub fn model(&self, id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Resolve a detected model string to a manifest model id.
    ///
    /// Aliases match as case-sensitive substrings of `model`; the first entry
    /// in manifest order wins. Falls back to the manufacturer default, then
    /// `None`.
    pub fn resolve_target(&self, model: &str, manufacturer: &str) -> Option<Resolution> {
        let mut matches: Vec<(&str, &str)> = Vec::new();
        for entry in &self.models {
            let hit = entry
                .aliases
                .iter()
                .find(|alias| !alias.is_empty() && model.contains(alias.as_str()));
            if let Some(alias) = hit {
                matches.push((entry.id.as_str(), alias.as_str()));
            }
        }

        if let Some(((id, alias), rest)) = matches.split_first() {
            let also_matched: Vec<String> = rest.iter().map(|(id, _)| id.to_string()).collect();
            if !also_matched.is_empty() {
                warn!(
                    model,
                    picked = *id,
                    others = ?also_matched,
                    "Model string matches several manifest entries"
                );
            }
            return Some(Resolution {
                model_id: id.to_string(),
                resolved_by: ResolvedBy::Alias(alias.to_string()),
                also_matched,
            });
        }

        let wanted = manufacturer.trim();
        let default = self.manufacturer_defaults.get(wanted).or_else(|| {
            self.manufacturer_defaults
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
                .map(|(_, id)| id)
        });

        match default {
            Some(id) => {
                debug!(manufacturer, model_id = %id, "Resolved by manufacturer default");
                Some(Resolution {
                    model_id: id.clone(),
                    resolved_by: ResolvedBy::ManufacturerDefault(wanted.to_string()),
                    also_matched: Vec::new(),
                })
            }
            None => None,
        }
    }
}
