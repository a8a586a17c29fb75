//! Detection rules and the ordered rule engine.
//!
//! A rule is a predicate over the traces of one key plus an optional
//! remediation. Rules run in registration order every time an operation
//! starts on a key; a rule that fires produces a
//! [`RaceCondition`](crate::RaceCondition).

use crate::race::{RaceType, Severity};
use crate::trace::{OperationKind, OperationTrace};
use reconcile_types::{Timestamp, TraceId};
use std::fmt;
use std::sync::Arc;

/// The traces a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct RuleContext {
    /// The key that was touched.
    pub key: String,
    /// Evaluation time.
    pub now: Timestamp,
    /// Active traces plus recently finished ones for the key, oldest start first.
    pub traces: Vec<OperationTrace>,
}

impl RuleContext {
    /// Pending traces of a kind, oldest start first.
    pub fn pending(&self, kind: OperationKind) -> impl Iterator<Item = &OperationTrace> {
        self.of_kind(kind).filter(|t| t.is_pending())
    }

    /// Traces of a kind, oldest start first.
    pub fn of_kind(&self, kind: OperationKind) -> impl Iterator<Item = &OperationTrace> {
        self.traces.iter().filter(move |t| t.kind == kind)
    }
}

/// A corrective action requested by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    /// Fail a pending trace with the given error.
    Fail { id: TraceId, error: String },
}

/// Predicate deciding whether a rule fires.
pub type RuleCondition = Arc<dyn Fn(&RuleContext) -> bool + Send + Sync>;

/// Produces the remediations for a firing rule.
pub type RuleResolver = Arc<dyn Fn(&RuleContext) -> Vec<Remediation> + Send + Sync>;

/// A race detection rule.
#[derive(Clone)]
pub struct DetectionRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub race_type: RaceType,
    pub severity: Severity,
    pub description: String,
    /// Whether the resolver runs as soon as the rule fires.
    pub auto_resolve: bool,
    condition: RuleCondition,
    resolver: Option<RuleResolver>,
}

impl DetectionRule {
    /// Creates an enabled, flag-only rule.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        race_type: RaceType,
        severity: Severity,
        condition: impl Fn(&RuleContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            race_type,
            severity,
            description: String::new(),
            auto_resolve: false,
            condition: Arc::new(condition),
            resolver: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attaches a remediation and turns on auto-resolution.
    #[must_use]
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&RuleContext) -> Vec<Remediation> + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self.auto_resolve = true;
        self
    }

    #[must_use]
    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    /// Whether the rule fires for this context.
    pub fn matches(&self, ctx: &RuleContext) -> bool {
        (self.condition)(ctx)
    }

    /// Remediations to apply now, if the rule auto-resolves.
    pub fn remediate(&self, ctx: &RuleContext) -> Option<Vec<Remediation>> {
        match &self.resolver {
            Some(resolve) if self.auto_resolve => Some(resolve(ctx)),
            _ => None,
        }
    }
}

impl fmt::Debug for DetectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("race_type", &self.race_type)
            .field("severity", &self.severity)
            .field("auto_resolve", &self.auto_resolve)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct DetectionRuleEngine {
    rules: Vec<DetectionRule>,
}

impl DetectionRuleEngine {
    /// Creates an engine with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine holding `rules` in order.
    pub fn with_rules(rules: Vec<DetectionRule>) -> Self {
        Self { rules }
    }

    /// Adds a rule at the end, or replaces a rule with the same id in place.
    /// Returns whether a rule was replaced.
    pub fn add(&mut self, rule: DetectionRule) -> bool {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule;
                true
            }
            None => {
                self.rules.push(rule);
                false
            }
        }
    }

    /// Removes a rule. Returns whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    /// Enables or disables a rule. Returns whether it exists.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&DetectionRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Enabled rules in evaluation order.
    pub fn enabled(&self) -> impl Iterator<Item = &DetectionRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// All rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &DetectionRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
