use crate::accounting::pot::RunSettings;
use crate::model::events::{EventDirection, TxEventTypeKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Module registry build failures. All of these abort pot construction before any event is
/// processed; silently overriding a colliding rule would corrupt tax results.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Event type {key} is claimed by both the {first} and {second} modules")]
    Collision {
        key: TxEventTypeKey,
        first: &'static str,
        second: &'static str,
    },

    #[error("Module {module} registered event type {key} with take = 0")]
    InvalidTake {
        module: &'static str,
        key: TxEventTypeKey,
    },

    #[error("Module {module} registered an event type with an empty counterparty tag")]
    MalformedCounterparty { module: &'static str },
}

/// Whether the matched leg adds to or removes from the cost-basis ledger.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TxMethod {
    Acquisition,
    Spend,
}

/// How a consumed multi-event group is interpreted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum TxMultitakeTreatment {
    /// The group is a single exchange of the spent asset for the received asset.
    Swap,
}

/// Interpretation rule for one decoded event type.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TxEventSettings {
    /// Whether the matched event(s) contribute to taxable PnL.
    pub taxable: bool,

    /// Whether the full spent value is debited, instead of just the realized gain or loss.
    pub count_entire_amount_spend: bool,

    /// Whether disposal triggers a cost-basis gain calculation at all. Basis-neutral
    /// transfers still reduce the ledger.
    pub count_cost_basis_pnl: bool,

    pub method: TxMethod,

    /// Number of consecutive raw events (including the triggering one) this rule consumes.
    pub take: usize,

    pub multitake_treatment: Option<TxMultitakeTreatment>,
}

impl TxEventSettings {
    /// The fallback for event types no module claims: keep balances correct, touch no PnL.
    ///
    /// Neutral-direction events have no ledger effect and resolve to `None`.
    pub fn conservative(direction: EventDirection) -> Option<Self> {
        let method = match direction {
            EventDirection::In => TxMethod::Acquisition,
            EventDirection::Out => TxMethod::Spend,
            EventDirection::Neutral => return None,
        };

        Some(Self {
            taxable: false,
            count_entire_amount_spend: false,
            count_cost_basis_pnl: false,
            method,
            take: 1,
            multitake_treatment: None,
        })
    }
}

/// A per-protocol table of interpretation rules.
///
/// `event_settings` is called once per run, after run configuration is known, so a table may
/// depend on run-scoped settings such as the profit currency.
pub trait ModuleAccountant {
    fn module_key(&self) -> &'static str;

    fn event_settings(&self, run: &RunSettings) -> HashMap<TxEventTypeKey, TxEventSettings>;
}

/// Registered protocol modules, merged into one rule table per run.
#[derive(Default)]
pub struct ModuleSettingsRegistry {
    modules: Vec<Box<dyn ModuleAccountant>>,
}

impl ModuleSettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in protocol modules.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::modules::EthereumAccountant));
        registry.register(Box::new(crate::modules::CompoundAccountant));
        registry.register(Box::new(crate::modules::UniswapAccountant));

        registry
    }

    pub fn register(&mut self, module: Box<dyn ModuleAccountant>) {
        self.modules.push(module);
    }

    /// Evaluate every module's table and merge them, rejecting cross-module collisions.
    pub fn build(&self, run: &RunSettings) -> Result<TxEventRules, SettingsError> {
        let mut rules = HashMap::new();
        let mut owners: HashMap<TxEventTypeKey, &'static str> = HashMap::new();

        for module in &self.modules {
            let module_key = module.module_key();
            for (key, settings) in module.event_settings(run) {
                if settings.take == 0 {
                    return Err(SettingsError::InvalidTake {
                        module: module_key,
                        key,
                    });
                }
                if key.counterparty.as_deref() == Some("") {
                    return Err(SettingsError::MalformedCounterparty { module: module_key });
                }
                if let Some(first) = owners.insert(key.clone(), module_key) {
                    return Err(SettingsError::Collision {
                        key,
                        first,
                        second: module_key,
                    });
                }
                rules.insert(key, settings);
            }
        }

        Ok(TxEventRules { rules })
    }
}

/// The merged rule table for one run.
#[derive(Debug, Default)]
pub struct TxEventRules {
    rules: HashMap<TxEventTypeKey, TxEventSettings>,
}

impl TxEventRules {
    /// Match a decoded event's composite key, preferring the counterparty-tagged rule.
    pub fn resolve(&self, key: &TxEventTypeKey) -> Option<&TxEventSettings> {
        self.rules
            .get(key)
            .or_else(|| self.rules.get(&key.without_counterparty()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::asset::Asset;
    use crate::model::events::{HistoryEventSubType, HistoryEventType};

    struct TestModule {
        key: &'static str,
        table: HashMap<TxEventTypeKey, TxEventSettings>,
    }

    impl ModuleAccountant for TestModule {
        fn module_key(&self) -> &'static str {
            self.key
        }

        fn event_settings(&self, _run: &RunSettings) -> HashMap<TxEventTypeKey, TxEventSettings> {
            self.table.clone()
        }
    }

    fn acquisition() -> TxEventSettings {
        TxEventSettings {
            taxable: true,
            count_entire_amount_spend: false,
            count_cost_basis_pnl: false,
            method: TxMethod::Acquisition,
            take: 1,
            multitake_treatment: None,
        }
    }

    fn run_settings() -> RunSettings {
        RunSettings::new(
            Asset::from("EUR"),
            chrono::DateTime::UNIX_EPOCH,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_collision_is_rejected() {
        let key = TxEventTypeKey::with_counterparty(
            HistoryEventType::Receive,
            HistoryEventSubType::Reward,
            "compound",
        );

        let mut registry = ModuleSettingsRegistry::new();
        registry.register(Box::new(TestModule {
            key: "alpha",
            table: HashMap::from([(key.clone(), acquisition())]),
        }));
        registry.register(Box::new(TestModule {
            key: "beta",
            table: HashMap::from([(key.clone(), acquisition())]),
        }));

        match registry.build(&run_settings()) {
            Err(SettingsError::Collision { first, second, key: collided }) => {
                assert_eq!((first, second), ("alpha", "beta"));
                assert_eq!(collided, key);
            }
            other => panic!("Expected a collision, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_take_is_rejected() {
        let mut settings = acquisition();
        settings.take = 0;

        let mut registry = ModuleSettingsRegistry::new();
        registry.register(Box::new(TestModule {
            key: "alpha",
            table: HashMap::from([(
                TxEventTypeKey::new(HistoryEventType::Receive, HistoryEventSubType::None),
                settings,
            )]),
        }));

        assert!(matches!(
            registry.build(&run_settings()),
            Err(SettingsError::InvalidTake { module: "alpha", .. }),
        ));
    }

    #[test]
    fn test_counterparty_fallback_resolution() {
        let untagged = TxEventTypeKey::new(HistoryEventType::Receive, HistoryEventSubType::Airdrop);

        let mut registry = ModuleSettingsRegistry::new();
        registry.register(Box::new(TestModule {
            key: "airdrops",
            table: HashMap::from([(untagged.clone(), acquisition())]),
        }));
        let rules = registry.build(&run_settings()).unwrap();

        // A tagged lookup falls back to the untagged rule.
        let tagged = TxEventTypeKey::with_counterparty(
            HistoryEventType::Receive,
            HistoryEventSubType::Airdrop,
            "optimism",
        );
        assert_eq!(rules.resolve(&tagged), Some(&acquisition()));
        assert_eq!(rules.resolve(&untagged), Some(&acquisition()));

        // No match at all stays unmatched; the pot applies the conservative default.
        let unknown = TxEventTypeKey::new(HistoryEventType::Spend, HistoryEventSubType::None);
        assert_eq!(rules.resolve(&unknown), None);
    }
}
