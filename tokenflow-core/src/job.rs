use crate::error::{EngineError, Result};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for newly created jobs.
pub const DEFAULT_RETRIES: u32 = 3;

pub const TIMER_HANDLER: &str = "timer";
pub const ASYNC_CONTINUATION_HANDLER: &str = "async-continuation";
pub const BATCH_SEED_HANDLER: &str = "batch-seed";
pub const BATCH_MONITOR_HANDLER: &str = "batch-monitor";
pub const BATCH_EXECUTION_HANDLER: &str = "batch-execution";

/// A persisted deferred-execution record. Mutated only inside commands, with
/// the revision checked on flush.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    pub revision: u32,
    pub handler_type: String,
    /// Opaque payload interpreted by the matching handler.
    pub configuration: serde_json::Value,
    pub due: DateTime<Utc>,
    pub priority: i64,
    pub retries: u32,
    /// How many attempts have failed so far; drives backoff arithmetic.
    pub failure_count: u32,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub suspended: bool,
    /// Terminal failure stops silently instead of raising an incident.
    pub skip_incident: bool,
    pub instance_id: Option<InstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
}

impl JobEntity {
    pub fn new(handler_type: &str, configuration: serde_json::Value, due: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            revision: 0,
            handler_type: handler_type.to_string(),
            configuration,
            due,
            priority: 0,
            retries: DEFAULT_RETRIES,
            failure_count: 0,
            lock_owner: None,
            lock_expiration: None,
            failure_message: None,
            suspended: false,
            skip_incident: false,
            instance_id: None,
            execution_id: None,
            batch_id: None,
            created_at: due,
        }
    }

    pub fn timer(
        instance_id: InstanceId,
        execution_id: ExecutionId,
        due: DateTime<Utc>,
    ) -> Result<Self> {
        let config = serde_json::to_value(TimerConfig { execution_id })
            .map_err(|e| EngineError::ProcessEngine(format!("serialize timer config: {e}")))?;
        let mut job = Self::new(TIMER_HANDLER, config, due);
        job.instance_id = Some(instance_id);
        job.execution_id = Some(execution_id);
        Ok(job)
    }

    pub fn async_continuation(
        instance_id: InstanceId,
        execution_id: ExecutionId,
        activity_id: &str,
        due: DateTime<Utc>,
    ) -> Result<Self> {
        let config = serde_json::to_value(AsyncContinuationConfig {
            execution_id,
            activity_id: activity_id.to_string(),
        })
        .map_err(|e| EngineError::ProcessEngine(format!("serialize continuation config: {e}")))?;
        let mut job = Self::new(ASYNC_CONTINUATION_HANDLER, config, due);
        job.instance_id = Some(instance_id);
        job.execution_id = Some(execution_id);
        Ok(job)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration) {
            (Some(_), Some(expiration)) => expiration > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Eligible for acquisition: due, unlocked (or lock expired), not
    /// suspended, and not stalled at zero retries.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.retries > 0 && self.due <= now && !self.is_locked(now)
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }

    pub fn parse_configuration<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.configuration.clone()).map_err(|e| {
            EngineError::ProcessEngine(format!(
                "invalid configuration for {} job {}: {e}",
                self.handler_type, self.id
            ))
        })
    }
}

// ─── Handler configurations ───────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub execution_id: ExecutionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncContinuationConfig {
    pub execution_id: ExecutionId,
    /// The activity the execution was parked at; the continuation resumes
    /// exactly there.
    pub activity_id: String,
}

// ─── Retry backoff ────────────────────────────────────────────

/// Reschedule policy applied when a job fails with retries remaining.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Job stays due immediately.
    None,
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// delay = base_delay_ms * factor^(attempt - 1)
    Exponential { base_delay_ms: u64, factor: f64 },
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::zero();
        }
        let ms = match self {
            BackoffPolicy::None => 0,
            BackoffPolicy::Fixed { delay_ms } => *delay_ms as i64,
            BackoffPolicy::Exponential {
                base_delay_ms,
                factor,
            } => {
                let scaled = (*base_delay_ms as f64) * factor.powi(attempt as i32 - 1);
                scaled.min(i64::MAX as f64) as i64
            }
        };
        Duration::milliseconds(ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_delay_ms: 10_000,
            factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquirability() {
        let now = Utc::now();
        let mut job = JobEntity::new("timer", serde_json::json!({}), now);
        assert!(job.is_acquirable(now));

        job.due = now + Duration::seconds(10);
        assert!(!job.is_acquirable(now));
        job.due = now;

        job.lock_owner = Some("node-1".into());
        job.lock_expiration = Some(now + Duration::minutes(5));
        assert!(!job.is_acquirable(now));

        // Expired locks do not block acquisition.
        job.lock_expiration = Some(now - Duration::seconds(1));
        assert!(job.is_acquirable(now));

        job.clear_lock();
        job.retries = 0;
        assert!(!job.is_acquirable(now));
        job.retries = 1;
        job.suspended = true;
        assert!(!job.is_acquirable(now));
    }

    #[test]
    fn continuation_config_round_trip() {
        let config = AsyncContinuationConfig {
            execution_id: Uuid::now_v7(),
            activity_id: "review".to_string(),
        };
        let job = JobEntity::async_continuation(
            Uuid::now_v7(),
            config.execution_id,
            &config.activity_id,
            Utc::now(),
        )
        .unwrap();
        let parsed: AsyncContinuationConfig = job.parse_configuration().unwrap();
        assert_eq!(parsed.execution_id, config.execution_id);
        assert_eq!(parsed.activity_id, config.activity_id);
    }

    #[test]
    fn backoff_delays() {
        assert_eq!(BackoffPolicy::None.delay(5), Duration::zero());
        assert_eq!(
            BackoffPolicy::Fixed { delay_ms: 1000 }.delay(3),
            Duration::milliseconds(1000)
        );
        let exp = BackoffPolicy::Exponential {
            base_delay_ms: 1000,
            factor: 2.0,
        };
        assert_eq!(exp.delay(1), Duration::milliseconds(1000));
        assert_eq!(exp.delay(2), Duration::milliseconds(2000));
        assert_eq!(exp.delay(3), Duration::milliseconds(4000));
    }
}
