//! Static tag-based provider routing.

use af_core::config::{RoutingConfig, RoutingRule};
use af_core::types::Task;
use serde::{Deserialize, Serialize};

/// Where a task is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub provider: String,
    pub tool: String,
}

/// Ordered `(tagSet, provider)` rules with a default.
///
/// Lookup is a pure function of the task's tags and the table: rules are
/// tried in order and the first rule sharing a tag with the task wins.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default_provider: String,
    default_tool: String,
}

impl RoutingTable {
    pub fn new(
        rules: Vec<RoutingRule>,
        default_provider: impl Into<String>,
        default_tool: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            default_provider: default_provider.into(),
            default_tool: default_tool.into(),
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(
            config.rules.clone(),
            config.default_provider.clone(),
            config.default_tool.clone(),
        )
    }

    pub fn route(&self, tags: &[String]) -> Route {
        let matched = self
            .rules
            .iter()
            .find(|rule| rule.tags.iter().any(|rule_tag| tags.contains(rule_tag)));

        match matched {
            Some(rule) => Route {
                provider: rule.provider.clone(),
                tool: rule
                    .tool
                    .clone()
                    .unwrap_or_else(|| self.default_tool.clone()),
            },
            None => Route {
                provider: self.default_provider.clone(),
                tool: self.default_tool.clone(),
            },
        }
    }

    pub fn route_task(&self, task: &Task) -> Route {
        self.route(&task.tags)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}
