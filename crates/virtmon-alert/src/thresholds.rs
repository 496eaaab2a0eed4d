use crate::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use virtmon_common::types::{CustomThresholdConfig, MetricValue, ThresholdBand};
use virtmon_storage::{files, load_document, save_document, DurableStore};

/// Resolves the effective threshold for a rule/guest pair, honouring
/// per-guest overrides.
///
/// Overrides are keyed by `(endpoint_id, vmid)` without the node so live
/// migration does not orphan them. Mutations persist eagerly to
/// `custom-thresholds.json`.
pub struct ThresholdResolver {
    store: Arc<dyn DurableStore>,
    configs: HashMap<String, CustomThresholdConfig>,
}

impl ThresholdResolver {
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let configs = load_document(store.as_ref(), files::CUSTOM_THRESHOLDS)?.unwrap_or_default();
        Ok(Self { store, configs })
    }

    pub fn get_thresholds(&self, endpoint_id: &str, vmid: &str) -> Option<&CustomThresholdConfig> {
        self.configs.get(&config_key(endpoint_id, vmid))
    }

    pub fn configs(&self) -> impl Iterator<Item = &CustomThresholdConfig> {
        self.configs.values()
    }

    pub fn set_thresholds(&mut self, config: CustomThresholdConfig) -> Result<()> {
        validate_config(&config)?;
        self.configs.insert(config.key(), config);
        self.persist();
        Ok(())
    }

    /// Returns whether an override existed.
    pub fn remove_thresholds(&mut self, endpoint_id: &str, vmid: &str) -> bool {
        let removed = self.configs.remove(&config_key(endpoint_id, vmid)).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn toggle_thresholds(&mut self, endpoint_id: &str, vmid: &str, enabled: bool) -> Result<()> {
        let config = self
            .configs
            .get_mut(&config_key(endpoint_id, vmid))
            .ok_or_else(|| {
                EngineError::InvalidThresholds(format!(
                    "no custom thresholds configured for {endpoint_id}:{vmid}"
                ))
            })?;
        config.enabled = enabled;
        self.persist();
        Ok(())
    }

    /// Effective threshold for a rule: the override's warning bound when an
    /// enabled config covers the metric, otherwise the rule's own threshold.
    pub fn effective_threshold(
        &self,
        metric: &str,
        rule_threshold: &MetricValue,
        endpoint_id: &str,
        vmid: &str,
    ) -> MetricValue {
        if let Some(config) = self.get_thresholds(endpoint_id, vmid) {
            if config.enabled {
                if let Some(band) = config.band(metric) {
                    return MetricValue::Number(band.warning);
                }
            }
        }
        rule_threshold.clone()
    }

    fn persist(&self) {
        if let Err(e) = save_document(self.store.as_ref(), files::CUSTOM_THRESHOLDS, &self.configs)
        {
            tracing::error!(error = %e, "Failed to persist custom thresholds");
        }
    }
}

fn config_key(endpoint_id: &str, vmid: &str) -> String {
    format!("{endpoint_id}:{vmid}")
}

fn validate_config(config: &CustomThresholdConfig) -> Result<()> {
    if config.endpoint_id.trim().is_empty() || config.vmid.trim().is_empty() {
        return Err(EngineError::InvalidThresholds(
            "endpoint_id and vmid must not be empty".into(),
        ));
    }
    let bands = [
        ("cpu", config.cpu),
        ("memory", config.memory),
        ("disk", config.disk),
    ];
    for (metric, band) in bands {
        if let Some(ThresholdBand { warning, critical }) = band {
            if !(0.0..=100.0).contains(&warning) || !(0.0..=100.0).contains(&critical) {
                return Err(EngineError::InvalidThresholds(format!(
                    "{metric}: thresholds must be within 0-100 (got warning={warning}, critical={critical})"
                )));
            }
            if warning >= critical {
                return Err(EngineError::InvalidThresholds(format!(
                    "{metric}: warning ({warning}) must be below critical ({critical})"
                )));
            }
        }
    }
    Ok(())
}
