//! In-memory operational warning store.
//!
//! Collected warnings are what the monitoring collaborators read; routing
//! code only ever appends. Retention is bounded by count and age.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use courier_core::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    pub max_warnings: usize,
    pub max_warning_age_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1000,
            max_warning_age_hours: 24,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        let warning = Warning::new(category, severity, message.into(), source.into());
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(id = %id, category = ?category, severity = ?severity, "Added warning");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn get_all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn get_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        match warnings.get_mut(id) {
            Some(warning) => {
                warning.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    /// Drop warnings past the retention age. Called from the janitor task.
    pub fn cleanup(&self) {
        let cutoff_minutes = self.config.max_warning_age_hours * 60;
        let mut warnings = self.warnings.write();
        warnings.retain(|_, w| w.age_minutes() < cutoff_minutes);
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        if let Some(oldest_id) = warnings
            .values()
            .min_by_key(|w| w.created_at)
            .map(|w| w.id.clone())
        {
            warnings.remove(&oldest_id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_filters_warnings() {
        let service = WarningService::default();
        service.add_warning(
            WarningCategory::Routing,
            WarningSeverity::Warn,
            "queue missing identifier",
            "test",
        );
        service.add_warning(
            WarningCategory::PoolHealth,
            WarningSeverity::Critical,
            "pool limit reached",
            "test",
        );

        assert_eq!(service.count(), 2);
        assert_eq!(service.get_by_severity(WarningSeverity::Critical).len(), 1);
        assert_eq!(service.get_by_category(WarningCategory::Routing).len(), 1);
    }

    #[test]
    fn bounded_retention_evicts_oldest() {
        let service = WarningService::new(WarningServiceConfig {
            max_warnings: 2,
            max_warning_age_hours: 24,
        });

        for i in 0..3 {
            service.add_warning(
                WarningCategory::Processing,
                WarningSeverity::Info,
                format!("warning {i}"),
                "test",
            );
        }

        assert_eq!(service.count(), 2);
    }

    #[test]
    fn acknowledge_unknown_id_is_false() {
        let service = WarningService::default();
        assert!(!service.acknowledge("nope"));

        let id = service.add_warning(
            WarningCategory::Processing,
            WarningSeverity::Info,
            "x",
            "test",
        );
        assert!(service.acknowledge(&id));
    }
}
