//! Pub/sub message bus.
//!
//! One namespaced channel carries policy, hook and command
//! notifications to every node. Wire shape is `{event, data}`; payloads
//! decode into the closed [`BusEvent`] set and unknown events are
//! logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Result, StevedoreError};
use crate::jobs::CtlCommand;
use crate::period::PeriodicJobPolicy;
use crate::db::{keys, RedisPool};

/// Maximum restart attempts of the subscriber loop.
const RETRY_TIMES: u32 = 5;

/// Keepalive probe cadence while the subscriber is blocked.
const PING_INTERVAL: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Hook registration broadcast to all nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookData {
    pub job_id: String,
    pub hook_url: String,
}

/// Control command broadcast to all nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandData {
    pub job_id: String,
    pub command: CtlCommand,
}

/// The closed set of events the bus carries.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    SchedulePeriodicPolicy(PeriodicJobPolicy),
    UnSchedulePeriodicPolicy(PeriodicJobPolicy),
    RegisterStatusHook(HookData),
    FireCommand(CommandData),
}

impl BusEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SchedulePeriodicPolicy(_) => "SchedulePeriodicPolicy",
            Self::UnSchedulePeriodicPolicy(_) => "UnSchedulePeriodicPolicy",
            Self::RegisterStatusHook(_) => "RegisterStatusHook",
            Self::FireCommand(_) => "FireCommand",
        }
    }
}

/// Raw wire message.
#[derive(Debug, Serialize, Deserialize)]
struct Message {
    event: String,
    data: Value,
}

/// Serialize an event to its wire form.
pub fn encode(event: &BusEvent) -> Result<String> {
    let data = match event {
        BusEvent::SchedulePeriodicPolicy(p) | BusEvent::UnSchedulePeriodicPolicy(p) => {
            serde_json::to_value(p)?
        }
        BusEvent::RegisterStatusHook(h) => serde_json::to_value(h)?,
        // Commands travel as a [job_id, command] pair.
        BusEvent::FireCommand(c) => {
            Value::Array(vec![c.job_id.clone().into(), c.command.as_str().into()])
        }
    };

    let msg = Message {
        event: event.event_name().to_string(),
        data,
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Decode a wire payload; `Ok(None)` marks an unknown event.
pub fn decode(payload: &str) -> Result<Option<BusEvent>> {
    let msg: Message = serde_json::from_str(payload)?;

    let event = match msg.event.as_str() {
        "SchedulePeriodicPolicy" => {
            BusEvent::SchedulePeriodicPolicy(serde_json::from_value(msg.data)?)
        }
        "UnSchedulePeriodicPolicy" => {
            BusEvent::UnSchedulePeriodicPolicy(serde_json::from_value(msg.data)?)
        }
        "RegisterStatusHook" => BusEvent::RegisterStatusHook(serde_json::from_value(msg.data)?),
        "FireCommand" => {
            let pair: Vec<String> = serde_json::from_value(msg.data)?;
            if pair.len() != 2 {
                return Err(StevedoreError::internal("malformed op command payload"));
            }
            let command = CtlCommand::parse(&pair[1]).ok_or_else(|| {
                StevedoreError::internal(format!("unknown op command '{}'", pair[1]))
            })?;
            BusEvent::FireCommand(CommandData {
                job_id: pair[0].clone(),
                command,
            })
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Message Server
// ═══════════════════════════════════════════════════════════════════════════════

/// Receiver side of the bus; the work pool implements this.
#[async_trait]
pub trait BusEventHandler: Send + Sync {
    async fn handle(&self, event: BusEvent) -> Result<()>;
}

/// Pub/sub server bound to the namespaced notification channel.
#[derive(Clone)]
pub struct MessageServer {
    redis: RedisPool,
    channel: String,
}

impl MessageServer {
    pub fn new(redis: RedisPool) -> Self {
        let channel = keys::notifications(redis.namespace());
        Self { redis, channel }
    }

    /// Publish one event to all nodes.
    pub async fn publish(&self, event: &BusEvent) -> Result<()> {
        let payload = encode(event)?;
        let mut conn = self.redis.conn().await?;
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await?;

        counter!("stevedore_bus_events_total", "event" => event.event_name(), "direction" => "out")
            .increment(1);
        Ok(())
    }

    /// Run the subscriber loop until shutdown.
    ///
    /// Redis failures restart the loop up to [`RETRY_TIMES`] times with
    /// a `2^n + 5` second backoff; exhaustion surfaces the error to the
    /// caller, which reports it to the bootstrap error channel.
    pub async fn run(
        &self,
        handler: Arc<dyn BusEventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempts = 0u32;

        loop {
            match self.serve(handler.clone(), &mut shutdown).await {
                Ok(()) => {
                    info!("message server is stopped");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "message server exited with error");
                    if attempts >= RETRY_TIMES {
                        return Err(e);
                    }
                    attempts += 1;
                    let delay = Duration::from_secs(2u64.pow(attempts) + 5);
                    info!(attempt = attempts, delay_secs = delay.as_secs(), "restarting message server");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn serve(
        &self,
        handler: Arc<dyn BusEventHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pubsub = self.redis.pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!(channel = %self.channel, "subscribed redis channel");

        // The pub/sub connection is consumed by the stream, so the
        // keepalive probe runs on a separate pooled connection.
        let mut ping_conn = self.redis.conn().await?;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let msg = msg.ok_or_else(|| {
                        StevedoreError::internal("pub/sub channel of message server closed")
                    })?;
                    let payload: String = msg.get_payload().map_err(StevedoreError::from)?;
                    self.dispatch(&payload, handler.as_ref()).await;
                }
                _ = ping.tick() => {
                    redis::cmd("PING")
                        .query_async::<_, String>(&mut ping_conn)
                        .await
                        .map_err(StevedoreError::from)?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&self, payload: &str, handler: &dyn BusEventHandler) {
        match decode(payload) {
            Ok(Some(event)) => {
                counter!(
                    "stevedore_bus_events_total",
                    "event" => event.event_name(),
                    "direction" => "in"
                )
                .increment(1);
                info!(event = event.event_name(), "received bus event");
                if let Err(e) = handler.handle(event).await {
                    error!(error = %e, "failed to fire bus event handler");
                }
            }
            Ok(None) => warn!(payload, "no handler to handle event"),
            Err(e) => warn!(error = %e, payload, "read invalid message"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Parameters;

    fn sample_policy() -> PeriodicJobPolicy {
        PeriodicJobPolicy {
            policy_id: "p1".into(),
            job_name: "demo".into(),
            parameters: Parameters::new(),
            cron_spec: "0 * * * * *".into(),
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_policy_event_roundtrip() {
        let event = BusEvent::SchedulePeriodicPolicy(sample_policy());
        let wire = encode(&event).unwrap();
        assert!(wire.contains("\"event\":\"SchedulePeriodicPolicy\""));

        let back = decode(&wire).unwrap().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_hook_event_roundtrip() {
        let event = BusEvent::RegisterStatusHook(HookData {
            job_id: "j1".into(),
            hook_url: "http://sink/".into(),
        });
        let wire = encode(&event).unwrap();
        let back = decode(&wire).unwrap().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_command_event_wire_shape() {
        let event = BusEvent::FireCommand(CommandData {
            job_id: "j1".into(),
            command: CtlCommand::Stop,
        });
        let wire = encode(&event).unwrap();
        // Commands travel as a [job_id, command] pair.
        assert!(wire.contains("[\"j1\",\"stop\"]"));

        let back = decode(&wire).unwrap().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_event_is_dropped() {
        let wire = r#"{"event":"SomethingNew","data":{}}"#;
        assert!(decode(wire).unwrap().is_none());
    }

    #[test]
    fn test_malformed_command_rejected() {
        let wire = r#"{"event":"FireCommand","data":["only-one"]}"#;
        assert!(decode(wire).is_err());

        let wire = r#"{"event":"FireCommand","data":["j1","explode"]}"#;
        assert!(decode(wire).is_err());
    }
}
