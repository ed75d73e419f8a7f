//! Strategy registry and selection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    AutoMerge, ContentConflict, LocalWins, ManualMerge, RemoteWins, ResolutionResult,
    ResolutionStrategy, StrategyInfo, StrategyOutput,
};
use crate::config::ResolutionConfig;
use crate::errors::ResolutionError;

const AUTO_MERGE: &str = "auto_merge";
const MANUAL_MERGE: &str = "manual_merge";

/// Owns the named strategies and picks one per conflict.
///
/// Strategies are kept in registration order; selection walks that order.
pub struct ResolutionStrategyManager {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
    default_strategy: String,
}

impl Default for ResolutionStrategyManager {
    fn default() -> Self {
        Self::with_builtin_strategies()
    }
}

impl ResolutionStrategyManager {
    /// An empty registry whose default is `manual_merge`.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            default_strategy: MANUAL_MERGE.to_string(),
        }
    }

    /// A registry holding local_wins, remote_wins, auto_merge and manual_merge.
    pub fn with_builtin_strategies() -> Self {
        let mut manager = Self::new();
        manager.register_strategy(Arc::new(LocalWins));
        manager.register_strategy(Arc::new(RemoteWins));
        manager.register_strategy(Arc::new(AutoMerge));
        manager.register_strategy(Arc::new(ManualMerge));
        manager
    }

    /// Built-in registry with the configured default strategy.
    pub fn from_config(config: &ResolutionConfig) -> Result<Self, ResolutionError> {
        let mut manager = Self::with_builtin_strategies();
        manager.set_default_strategy(&config.default_strategy)?;
        Ok(manager)
    }

    /// Register a strategy, replacing any existing one with the same name in
    /// place.
    pub fn register_strategy(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        let name = strategy.name().to_string();
        match self.strategies.iter().position(|s| s.name() == name) {
            Some(index) => {
                debug!(strategy = %name, "replacing registered strategy");
                self.strategies[index] = strategy;
            }
            None => {
                debug!(strategy = %name, "registering strategy");
                self.strategies.push(strategy);
            }
        }
    }

    pub fn get_strategy(&self, name: &str) -> Result<Arc<dyn ResolutionStrategy>, ResolutionError> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| ResolutionError::StrategyNotFound(name.to_string()))
    }

    /// Change the fallback strategy. The name must already be registered.
    pub fn set_default_strategy(&mut self, name: &str) -> Result<(), ResolutionError> {
        self.get_strategy(name)?;
        info!(strategy = name, "default resolution strategy set");
        self.default_strategy = name.to_string();
        Ok(())
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    pub fn available_strategies(&self) -> Vec<StrategyInfo> {
        self.strategies
            .iter()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                auto_resolves: s.auto_resolves(),
                description: s.description().to_string(),
            })
            .collect()
    }

    /// Pick a strategy for `conflict`.
    ///
    /// AutoMerge wins whenever it applies. Otherwise the first registered
    /// strategy, other than manual_merge, that can auto-resolve is used, and
    /// failing that the default strategy.
    pub fn select_best_strategy(
        &self,
        conflict: &ContentConflict,
    ) -> Result<Arc<dyn ResolutionStrategy>, ResolutionError> {
        if let Ok(auto) = self.get_strategy(AUTO_MERGE) {
            if auto.can_auto_resolve(conflict) {
                return Ok(auto);
            }
        }

        if let Some(strategy) = self
            .strategies
            .iter()
            .filter(|s| s.name() != MANUAL_MERGE && s.name() != AUTO_MERGE)
            .find(|s| s.can_auto_resolve(conflict))
        {
            return Ok(Arc::clone(strategy));
        }

        self.get_strategy(&self.default_strategy)
    }

    /// Resolve `conflict` with the named strategy, or the best one.
    ///
    /// Never fails: unknown strategies, strategy errors and panics all come
    /// back as [`ResolutionResult::Failed`] with `requires_manual` set.
    pub fn resolve_conflict(
        &self,
        conflict: &ContentConflict,
        strategy_name: Option<&str>,
    ) -> ResolutionResult {
        let strategy = match strategy_name {
            Some(name) => self.get_strategy(name),
            None => self.select_best_strategy(conflict),
        };
        let strategy = match strategy {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(error = %e, "no strategy available for conflict");
                return failed(e.to_string());
            }
        };

        let name = strategy.name().to_string();
        let auto_resolved = strategy.can_auto_resolve(conflict);
        debug!(strategy = %name, fields = conflict.conflicts.len(), "resolving conflict");

        let outcome = catch_unwind(AssertUnwindSafe(|| strategy.resolve(conflict)));
        match outcome {
            Ok(Ok(StrategyOutput::Resolved(resolution))) => {
                info!(strategy = %name, winner = %resolution.winner, auto_resolved, "conflict resolved");
                ResolutionResult::Resolved {
                    resolution,
                    strategy_used: name,
                    auto_resolved,
                }
            }
            Ok(Ok(StrategyOutput::Manual(data))) => {
                info!(strategy = %name, fields = data.fields.len(), "conflict requires manual resolution");
                ResolutionResult::ManualRequired {
                    manual_resolution_data: data,
                    strategy_used: name,
                }
            }
            Ok(Err(e)) => {
                warn!(strategy = %name, error = %e, "strategy failed");
                failed(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "strategy panicked".to_string());
                warn!(strategy = %name, error = %message, "strategy panicked");
                failed(format!("{name}: {message}"))
            }
        }
    }
}

fn failed(error: String) -> ResolutionResult {
    ResolutionResult::Failed {
        error,
        requires_manual: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Snapshot, ThreeWayDiffEngine};
    use crate::resolution::Winner;
    use serde_json::{json, Value};

    fn conflict(local: Value, remote: Value, ancestor: Value) -> ContentConflict {
        let diff = ThreeWayDiffEngine::compare_versions(
            Some(&Snapshot::from_json(local).unwrap()),
            Some(&Snapshot::from_json(remote).unwrap()),
            Some(&Snapshot::from_json(ancestor).unwrap()),
        );
        ContentConflict::from_diff(&diff)
    }

    struct Exploding;

    impl ResolutionStrategy for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        fn description(&self) -> &str {
            "panics on resolve"
        }
        fn auto_resolves(&self) -> bool {
            true
        }
        fn can_auto_resolve(&self, _conflict: &ContentConflict) -> bool {
            true
        }
        fn resolve(&self, _conflict: &ContentConflict) -> Result<StrategyOutput, ResolutionError> {
            panic!("kaboom")
        }
    }

    #[test]
    fn test_builtin_registry() {
        let manager = ResolutionStrategyManager::with_builtin_strategies();
        let names: Vec<String> = manager
            .available_strategies()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, crate::resolution::BUILTIN_STRATEGY_NAMES);
        assert_eq!(manager.default_strategy(), "manual_merge");
        assert!(!manager.available_strategies()[3].auto_resolves);
    }

    #[test]
    fn test_select_prefers_auto_merge() {
        let manager = ResolutionStrategyManager::with_builtin_strategies();
        let c = conflict(
            json!({"title": "A2", "tags": ["x"]}),
            json!({"title": "A", "tags": ["x", "y"]}),
            json!({"title": "A", "tags": ["x"]}),
        );
        assert_eq!(manager.select_best_strategy(&c).unwrap().name(), "auto_merge");

        let empty = conflict(json!({}), json!({}), json!({}));
        assert_eq!(manager.select_best_strategy(&empty).unwrap().name(), "auto_merge");
    }

    #[test]
    fn test_select_falls_back_to_default() {
        let manager = ResolutionStrategyManager::with_builtin_strategies();
        let c = conflict(json!({"a": 1}), json!({"a": 2}), json!({"a": 0})).with_structural(true);
        assert_eq!(manager.select_best_strategy(&c).unwrap().name(), "manual_merge");

        let plain = conflict(json!({"a": 1}), json!({"a": 2}), json!({"a": 0}));
        assert_eq!(manager.select_best_strategy(&plain).unwrap().name(), "local_wins");
    }

    #[test]
    fn test_resolve_named_strategy() {
        let manager = ResolutionStrategyManager::with_builtin_strategies();
        let c = conflict(json!({"a": 1}), json!({"a": 2}), json!({"a": 0}));

        let result = manager.resolve_conflict(&c, Some("remote_wins"));
        assert!(result.is_success());
        assert_eq!(result.strategy_used(), Some("remote_wins"));
        assert_eq!(result.resolution().unwrap().winner, Winner::Remote);

        let result = manager.resolve_conflict(&c, Some("manual_merge"));
        assert!(matches!(result, ResolutionResult::ManualRequired { .. }));
        assert!(result.requires_manual());
    }

    #[test]
    fn test_auto_selected_result_is_marked() {
        let manager = ResolutionStrategyManager::with_builtin_strategies();
        let c = conflict(json!({"a": 1, "b": 0}), json!({"a": 0, "b": 2}), json!({"a": 0, "b": 0}));
        match manager.resolve_conflict(&c, None) {
            ResolutionResult::Resolved {
                strategy_used,
                auto_resolved,
                ..
            } => {
                assert_eq!(strategy_used, "auto_merge");
                assert!(auto_resolved);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_failures_become_results() {
        let mut manager = ResolutionStrategyManager::with_builtin_strategies();
        let c = conflict(json!({"a": 1}), json!({"a": 2}), json!({"a": 0}));

        let unknown = manager.resolve_conflict(&c, Some("newest_wins"));
        assert!(matches!(
            unknown,
            ResolutionResult::Failed { requires_manual: true, .. }
        ));

        let refused = manager.resolve_conflict(&c, Some("auto_merge"));
        assert!(matches!(refused, ResolutionResult::Failed { .. }));

        manager.register_strategy(Arc::new(Exploding));
        match manager.resolve_conflict(&c, Some("exploding")) {
            ResolutionResult::Failed { error, requires_manual } => {
                assert!(error.contains("kaboom"));
                assert!(requires_manual);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_default_strategy_must_exist() {
        let mut manager = ResolutionStrategyManager::with_builtin_strategies();
        assert!(matches!(
            manager.set_default_strategy("newest_wins"),
            Err(ResolutionError::StrategyNotFound(_))
        ));
        manager.set_default_strategy("remote_wins").unwrap();
        assert_eq!(manager.default_strategy(), "remote_wins");

        let config = ResolutionConfig {
            default_strategy: "local_wins".into(),
        };
        let manager = ResolutionStrategyManager::from_config(&config).unwrap();
        assert_eq!(manager.default_strategy(), "local_wins");
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut manager = ResolutionStrategyManager::with_builtin_strategies();
        manager.register_strategy(Arc::new(LocalWins));
        assert_eq!(manager.available_strategies().len(), 4);
    }
}
