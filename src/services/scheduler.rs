//! Отложенные задачи с доставкой "хотя бы один раз".
//!
//! Задачи лежат в Redis sorted set, score это время запуска (unix, мс).
//! Воркер забирает созревшие задачи, сдвигая их score на время аренды
//! (lease). Если обработка не дошла до `complete`, задача снова станет
//! видимой после истечения аренды и будет повторена. Поэтому обработчики
//! обязаны быть идемпотентными.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::redis_client::RedisClient;

const QUEUE_KEY: &str = "tasks:delayed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Освободить бронь, если она так и не была оплачена.
    ReleaseUnpaidBooking { booking_id: Uuid },
    ShowReminder { booking_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
    pub task: Task,
    // Исходный элемент sorted set, чтобы удалить ровно его
    #[serde(skip)]
    member: Option<String>,
}

impl ScheduledTask {
    pub fn new(run_at: DateTime<Utc>, task: Task) -> Self {
        Self { id: Uuid::new_v4(), run_at, task, member: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("task encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule_at(&self, run_at: DateTime<Utc>, task: Task) -> Result<ScheduledTask, SchedulerError>;

    /// Забирает до `limit` созревших задач и прячет их на время `lease`.
    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError>;

    /// Окончательно удаляет успешно обработанную задачу.
    async fn complete(&self, task: &ScheduledTask) -> Result<(), SchedulerError>;
}

// Выборка и аренда одним атомарным шагом: задачу, которую уже сдвинул
// другой воркер, ZRANGEBYSCORE здесь просто не вернёт
const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZADD', KEYS[1], 'XX', ARGV[3], member)
end
return due
"#;

#[derive(Clone)]
pub struct RedisScheduler {
    redis: RedisClient,
    lease_script: redis::Script,
}

impl RedisScheduler {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis, lease_script: redis::Script::new(LEASE_SCRIPT) }
    }
}

#[async_trait]
impl TaskScheduler for RedisScheduler {
    async fn schedule_at(&self, run_at: DateTime<Utc>, task: Task) -> Result<ScheduledTask, SchedulerError> {
        let scheduled = ScheduledTask::new(run_at, task);
        let member = serde_json::to_string(&scheduled)?;
        let mut conn = self.redis.conn.clone();
        let _: () = conn.zadd(QUEUE_KEY, member, run_at.timestamp_millis()).await?;
        Ok(scheduled)
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let mut conn = self.redis.conn.clone();
        let lease_until = (now + lease).timestamp_millis();
        let members: Vec<String> = self
            .lease_script
            .key(QUEUE_KEY)
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(lease_until)
            .invoke_async(&mut conn)
            .await?;

        let mut leased = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<ScheduledTask>(&member) {
                Ok(mut task) => {
                    task.member = Some(member);
                    leased.push(task);
                }
                Err(e) => {
                    tracing::error!("Dropping undecodable task {}: {}", member, e);
                    let _: i64 = conn.zrem(QUEUE_KEY, &member).await?;
                }
            }
        }

        Ok(leased)
    }

    async fn complete(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let member = match &task.member {
            Some(member) => member.clone(),
            None => serde_json::to_string(task)?,
        };
        let mut conn = self.redis.conn.clone();
        let _: i64 = conn.zrem(QUEUE_KEY, member).await?;
        Ok(())
    }
}

/// Планировщик в памяти процесса, для тестов и запуска без Redis.
/// Не переживает рестарт.
#[derive(Default)]
pub struct MemoryScheduler {
    // (видима с, задача)
    queue: Mutex<Vec<(DateTime<Utc>, ScheduledTask)>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<ScheduledTask> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl TaskScheduler for MemoryScheduler {
    async fn schedule_at(&self, run_at: DateTime<Utc>, task: Task) -> Result<ScheduledTask, SchedulerError> {
        let scheduled = ScheduledTask::new(run_at, task);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((run_at, scheduled.clone()));
        Ok(scheduled)
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.sort_by_key(|(visible_at, _)| *visible_at);

        let mut leased = Vec::new();
        for (visible_at, task) in queue.iter_mut() {
            if leased.len() >= limit || *visible_at > now {
                break;
            }
            *visible_at = now + lease;
            leased.push(task.clone());
        }
        Ok(leased)
    }

    async fn complete(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, t)| t.id != task.id);
        Ok(())
    }
}
