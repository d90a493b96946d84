//! Scheduled triggers
//!
//! A schedule is configured either as a bare expression string or as a table
//! with an expression and options. Definitions are normalized eagerly so a
//! bad schedule is reported at startup, before any invocation.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use localfn_core::{EmulatorError, ErrorCode};

use crate::dispatcher::Dispatcher;
use crate::overrides;

const ACCOUNT_ID: &str = "000000000000";
const REGION: &str = "us-east-1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Schedule definition has no rate")]
    MissingRate,

    #[error("Invalid schedule expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid schedule definition: {0}")]
    Invalid(String),
}

impl From<ScheduleError> for EmulatorError {
    fn from(e: ScheduleError) -> Self {
        EmulatorError::new(ErrorCode::Configuration, e.to_string())
    }
}

/// Definition as written in configuration
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawDefinition {
    Expression(String),
    Table {
        rate: Option<String>,
        enabled: Option<bool>,
        input: Option<Value>,
        name: Option<String>,
        description: Option<String>,
    },
}

/// Normalized schedule trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition")]
pub struct ScheduleEventDefinition {
    pub rate: String,
    pub enabled: bool,
    pub input: Option<Value>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl TryFrom<RawDefinition> for ScheduleEventDefinition {
    type Error = ScheduleError;

    fn try_from(raw: RawDefinition) -> Result<Self, Self::Error> {
        let definition = match raw {
            RawDefinition::Expression(rate) => Self {
                rate,
                enabled: true,
                input: None,
                name: None,
                description: None,
            },
            RawDefinition::Table {
                rate,
                enabled,
                input,
                name,
                description,
            } => Self {
                rate: rate.ok_or(ScheduleError::MissingRate)?,
                enabled: enabled.unwrap_or(true),
                input,
                name,
                description,
            },
        };

        if definition.rate.trim().is_empty() {
            return Err(ScheduleError::MissingRate);
        }
        ScheduleExpression::parse(&definition.rate)?;

        Ok(definition)
    }
}

impl ScheduleEventDefinition {
    /// Normalize a configuration value: a bare expression string or a table
    pub fn from_value(value: Value) -> Result<Self, ScheduleError> {
        let raw: RawDefinition = serde_json::from_value(value)
            .map_err(|e| ScheduleError::Invalid(e.to_string()))?;
        Self::try_from(raw)
    }

    pub fn expression(&self) -> Result<ScheduleExpression, ScheduleError> {
        ScheduleExpression::parse(&self.rate)
    }
}

impl FromStr for ScheduleEventDefinition {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(RawDefinition::Expression(s.to_string()))
    }
}

/// Parsed schedule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    Rate(Duration),
    /// Accepted but never fired locally
    Cron(String),
}

impl ScheduleExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let expression = expression.trim();
        let invalid = || ScheduleError::InvalidExpression(expression.to_string());

        if let Some(body) = expression
            .strip_prefix("cron(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            if body.split_whitespace().count() != 6 {
                return Err(invalid());
            }
            return Ok(Self::Cron(body.to_string()));
        }

        let body = expression
            .strip_prefix("rate(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;

        let mut parts = body.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        let amount: u64 = amount.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }

        let unit_secs = match unit {
            "minute" | "minutes" => 60,
            "hour" | "hours" => 60 * 60,
            "day" | "days" => 24 * 60 * 60,
            _ => return Err(invalid()),
        };

        amount
            .checked_mul(unit_secs)
            .map(|secs| Self::Rate(Duration::from_secs(secs)))
            .ok_or_else(invalid)
    }
}

/// Event delivered for one firing of `definition` on `function_key`
pub fn scheduled_event(function_key: &str, definition: &ScheduleEventDefinition) -> Value {
    match &definition.input {
        Some(Value::String(raw)) => {
            overrides::parse_json(raw, "schedule input").unwrap_or_else(|| Value::String(raw.clone()))
        }
        Some(input) => input.clone(),
        None => {
            let rule = definition
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-schedule", function_key));

            json!({
                "version": "0",
                "id": uuid::Uuid::new_v4().to_string(),
                "detail-type": "Scheduled Event",
                "source": "aws.events",
                "account": ACCOUNT_ID,
                "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                "region": REGION,
                "resources": [format!("arn:aws:events:{}:{}:rule/{}", REGION, ACCOUNT_ID, rule)],
                "detail": {},
            })
        }
    }
}

/// Start firing `definition` against `function_key`.
///
/// Returns `None` for disabled definitions and for cron expressions. Firings
/// that come due while the previous invocation is still running are skipped.
pub fn spawn_scheduler(
    dispatcher: Dispatcher,
    function_key: impl Into<String>,
    definition: ScheduleEventDefinition,
) -> Option<JoinHandle<()>> {
    let function_key = function_key.into();

    if !definition.enabled {
        debug!(function = %function_key, rate = %definition.rate, "Schedule disabled");
        return None;
    }

    let period = match definition.expression() {
        Ok(ScheduleExpression::Rate(period)) => period,
        Ok(ScheduleExpression::Cron(_)) => {
            warn!(function = %function_key, rate = %definition.rate, "Cron schedules are not run locally");
            return None;
        }
        Err(e) => {
            warn!(function = %function_key, error = %e, "Not scheduling invalid expression");
            return None;
        }
    };

    info!(
        function = %function_key,
        rate = %definition.rate,
        period_secs = period.as_secs(),
        "Scheduled function"
    );

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let event = scheduled_event(&function_key, &definition);
            let reply = dispatcher.invoke(&function_key, event).await;
            debug!(function = %function_key, status = reply.status_code, "Scheduled invocation finished");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerError, Sandbox, SandboxEngine, SandboxSpec};
    use crate::function::FunctionConfig;
    use crate::handler::handler_fn;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bare_rate_defaults() {
        let definition: ScheduleEventDefinition = "rate(5 minutes)".parse().unwrap();
        assert_eq!(
            definition,
            ScheduleEventDefinition {
                rate: "rate(5 minutes)".to_string(),
                enabled: true,
                input: None,
                name: None,
                description: None,
            }
        );
    }

    #[test]
    fn test_table_preserves_disabled() {
        let definition =
            ScheduleEventDefinition::from_value(json!({"rate": "rate(1 hour)", "enabled": false}))
                .unwrap();
        assert_eq!(definition.rate, "rate(1 hour)");
        assert!(!definition.enabled);
    }

    #[test]
    fn test_table_defaults_enabled() {
        let definition = ScheduleEventDefinition::from_value(json!({
            "rate": "rate(2 days)",
            "name": "nightly",
            "description": "cleanup",
            "enabled": null,
        }))
        .unwrap();
        assert!(definition.enabled);
        assert_eq!(definition.name.as_deref(), Some("nightly"));
        assert_eq!(definition.description.as_deref(), Some("cleanup"));
    }

    #[test]
    fn test_missing_rate_is_a_configuration_error() {
        assert_eq!(
            ScheduleEventDefinition::from_value(json!({"enabled": true})),
            Err(ScheduleError::MissingRate)
        );
        assert_eq!("".parse::<ScheduleEventDefinition>(), Err(ScheduleError::MissingRate));

        let error: EmulatorError = ScheduleError::MissingRate.into();
        assert_eq!(error.code, ErrorCode::Configuration);
    }

    #[test]
    fn test_deserialize_from_config_value() {
        let definitions: Vec<ScheduleEventDefinition> = serde_json::from_value(json!([
            "rate(1 minute)",
            {"rate": "cron(0 12 * * ? *)", "enabled": false},
        ]))
        .unwrap();
        assert_eq!(definitions.len(), 2);
        assert!(definitions[0].enabled);
        assert!(!definitions[1].enabled);

        let bad: Result<Vec<ScheduleEventDefinition>, _> =
            serde_json::from_value(json!([{"name": "x"}]));
        assert!(bad.is_err());
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(
            ScheduleExpression::parse("rate(1 minute)"),
            Ok(ScheduleExpression::Rate(Duration::from_secs(60)))
        );
        assert_eq!(
            ScheduleExpression::parse("rate(3 hours)"),
            Ok(ScheduleExpression::Rate(Duration::from_secs(3 * 3600)))
        );
        assert_eq!(
            ScheduleExpression::parse("cron(0 12 * * ? *)"),
            Ok(ScheduleExpression::Cron("0 12 * * ? *".to_string()))
        );

        for bad in [
            "rate(0 minutes)",
            "rate(5 weeks)",
            "rate(five minutes)",
            "every 5 minutes",
            "cron(* *)",
            "rate(999999999999999999 days)",
        ] {
            assert!(ScheduleExpression::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_overflowing_rate_is_configuration_error() {
        let err = "rate(999999999999999999 days)"
            .parse::<ScheduleEventDefinition>()
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidExpression(_)));

        let err: EmulatorError = err.into();
        assert_eq!(err.code, ErrorCode::Configuration);
    }

    #[test]
    fn test_scheduled_event_shape() {
        let definition: ScheduleEventDefinition = "rate(5 minutes)".parse().unwrap();
        let event = scheduled_event("report", &definition);

        assert_eq!(event["detail-type"], "Scheduled Event");
        assert_eq!(event["source"], "aws.events");
        assert_eq!(event["detail"], json!({}));
        assert_eq!(
            event["resources"][0],
            "arn:aws:events:us-east-1:000000000000:rule/report-schedule"
        );
        assert!(event["time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_scheduled_event_uses_input_verbatim() {
        let mut definition: ScheduleEventDefinition = "rate(5 minutes)".parse().unwrap();

        definition.input = Some(json!({"key": "value"}));
        assert_eq!(scheduled_event("report", &definition), json!({"key": "value"}));

        definition.input = Some(json!("{\"key\":1}"));
        assert_eq!(scheduled_event("report", &definition), json!({"key": 1}));

        definition.input = Some(json!("plain"));
        assert_eq!(scheduled_event("report", &definition), json!("plain"));
    }

    struct NoEngine;

    #[async_trait]
    impl SandboxEngine for NoEngine {
        async fn ensure_image(&self, _: &str) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn start(&self, _: &SandboxSpec) -> Result<Sandbox, ContainerError> {
            Err(ContainerError::NotAvailable("no engine".into()))
        }
        async fn wait(&self, _: &str) -> Result<i64, ContainerError> {
            Ok(0)
        }
        async fn stop(&self, _: &str) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disabled_and_cron_are_not_spawned() {
        let dispatcher = Dispatcher::new(Arc::new(NoEngine));

        let disabled =
            ScheduleEventDefinition::from_value(json!({"rate": "rate(1 minute)", "enabled": false}))
                .unwrap();
        assert!(spawn_scheduler(dispatcher.clone(), "f", disabled).is_none());

        let cron: ScheduleEventDefinition = "cron(0 12 * * ? *)".parse().unwrap();
        assert!(spawn_scheduler(dispatcher, "f", cron).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_fires_at_rate() {
        let dispatcher = Dispatcher::new(Arc::new(NoEngine));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        dispatcher.handlers().register(
            "tick.handler",
            handler_fn(move |event: Value, _ctx| {
                let counter = counter.clone();
                async move {
                    assert_eq!(event["source"], "aws.events");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
        dispatcher
            .register_function(FunctionConfig::new("tick", "tick.handler"))
            .unwrap();

        let definition: ScheduleEventDefinition = "rate(1 minute)".parse().unwrap();
        let task = spawn_scheduler(dispatcher, "tick", definition).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        task.abort();
    }
}
