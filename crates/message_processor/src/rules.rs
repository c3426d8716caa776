//! Derivation rules: ordered, pure functions from a stored message to the
//! actions it requires.

use common::{Action, ActionKind, PipelineConfig, StoredMessage};
use serde_json::json;
use std::sync::Arc;

pub type RuleFn = dyn Fn(&StoredMessage, &PipelineConfig) -> Vec<ActionKind> + Send + Sync;

#[derive(Clone)]
struct NamedRule {
    name: &'static str,
    derive: Arc<RuleFn>,
}

/// Ordered list of derivation rules.
///
/// Actions come out in rule order, and within a rule in the order the rule
/// returns them.
#[derive(Clone, Default)]
pub struct RuleSet {
    rules: Vec<NamedRule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rule<F>(mut self, name: &'static str, rule: F) -> Self
    where
        F: Fn(&StoredMessage, &PipelineConfig) -> Vec<ActionKind> + Send + Sync + 'static,
    {
        self.rules.push(NamedRule {
            name,
            derive: Arc::new(rule),
        });
        self
    }

    /// Broadcast, republish, low-battery alert, status alert, alert script
    pub fn standard() -> Self {
        Self::empty()
            .with_rule("broadcast", broadcast_rule)
            .with_rule("republish", republish_rule)
            .with_rule("low_battery", low_battery_rule)
            .with_rule("status_alert", status_alert_rule)
            .with_rule("alert_script", alert_script_rule)
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    pub fn derive(&self, message: &StoredMessage, config: &PipelineConfig) -> Vec<Action> {
        self.rules
            .iter()
            .flat_map(|rule| {
                (rule.derive)(message, config)
                    .into_iter()
                    .map(move |kind| Action::new(message.id, rule.name, kind))
            })
            .collect()
    }
}

pub fn broadcast_rule(message: &StoredMessage, _config: &PipelineConfig) -> Vec<ActionKind> {
    vec![ActionKind::SseBroadcast {
        event: message.to_event_json(),
    }]
}

pub fn republish_rule(message: &StoredMessage, config: &PipelineConfig) -> Vec<ActionKind> {
    vec![ActionKind::PublishMessage {
        topic: config.publish_topic.clone(),
        payload: message.to_event_json(),
    }]
}

fn is_low_battery(message: &StoredMessage, config: &PipelineConfig) -> bool {
    message
        .packet
        .battery_level()
        .is_some_and(|level| level < config.low_battery_threshold)
}

pub fn low_battery_rule(message: &StoredMessage, config: &PipelineConfig) -> Vec<ActionKind> {
    if !is_low_battery(message, config) {
        return Vec::new();
    }
    vec![ActionKind::PublishMessage {
        topic: config.alert_topic(),
        payload: json!({
            "message_id": message.id,
            "device_id": message.packet.device_id(),
            "reason": "low_battery",
            "battery_level": message.packet.battery_level(),
            "threshold": config.low_battery_threshold,
        }),
    }]
}

pub fn status_alert_rule(message: &StoredMessage, config: &PipelineConfig) -> Vec<ActionKind> {
    if config.is_healthy_status(message.packet.status()) {
        return Vec::new();
    }
    vec![ActionKind::PublishMessage {
        topic: config.alert_topic(),
        payload: json!({
            "message_id": message.id,
            "device_id": message.packet.device_id(),
            "reason": "status",
            "status": message.packet.status(),
        }),
    }]
}

/// One script invocation per alert reason, when a script is configured
pub fn alert_script_rule(message: &StoredMessage, config: &PipelineConfig) -> Vec<ActionKind> {
    let Some(command) = config.alert_script.as_ref() else {
        return Vec::new();
    };

    let mut reasons = Vec::new();
    if is_low_battery(message, config) {
        reasons.push("low_battery");
    }
    if !config.is_healthy_status(message.packet.status()) {
        reasons.push("status");
    }

    reasons
        .into_iter()
        .map(|reason| ActionKind::InvokeScript {
            command: command.clone(),
            args: vec![
                message.packet.device_id().to_string(),
                reason.to_string(),
                message.id.to_string(),
            ],
        })
        .collect()
}
