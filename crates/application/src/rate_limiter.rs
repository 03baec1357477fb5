use std::time::{Duration, Instant};

use dashmap::DashMap;
use domain::UserId;

/// 用户在当前窗口内的发送配额
#[derive(Debug, Clone)]
struct UserQuota {
    message_count: u32,
    window_start: Instant,
}

impl UserQuota {
    fn new(now: Instant) -> Self {
        Self {
            message_count: 0,
            window_start: now,
        }
    }
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {current}/{max} messages per window")]
    RateLimitExceeded { current: u32, max: u32 },
}

/// 按发送者计数的固定窗口限流器。
///
/// 每个用户一把分片锁，计数与检查在同一把锁下完成。
pub struct MessageRateLimiter {
    max_messages: u32,
    window_duration: Duration,
    user_quotas: DashMap<UserId, UserQuota>,
}

impl MessageRateLimiter {
    pub fn new(max_messages_per_minute: u32) -> Self {
        Self::with_window(max_messages_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(max_messages: u32, window_duration: Duration) -> Self {
        Self {
            max_messages,
            window_duration,
            user_quotas: DashMap::new(),
        }
    }

    /// 检查并占用一个配额；0 表示不限流
    pub fn check_and_record(&self, user_id: UserId) -> Result<(), RateLimitError> {
        if self.max_messages == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut quota = self
            .user_quotas
            .entry(user_id)
            .or_insert_with(|| UserQuota::new(now));

        if now.duration_since(quota.window_start) >= self.window_duration {
            *quota = UserQuota::new(now);
        }

        if quota.message_count >= self.max_messages {
            return Err(RateLimitError::RateLimitExceeded {
                current: quota.message_count,
                max: self.max_messages,
            });
        }

        quota.message_count += 1;
        Ok(())
    }

    /// 当前窗口内已用配额
    pub fn usage(&self, user_id: UserId) -> u32 {
        self.user_quotas
            .get(&user_id)
            .filter(|quota| quota.window_start.elapsed() < self.window_duration)
            .map(|quota| quota.message_count)
            .unwrap_or(0)
    }

    /// 清理过期的配额记录，返回清掉的用户数
    pub fn cleanup_expired(&self) -> usize {
        let window_duration = self.window_duration;
        let before = self.user_quotas.len();
        self.user_quotas
            .retain(|_, quota| quota.window_start.elapsed() < window_duration * 2);
        before.saturating_sub(self.user_quotas.len())
    }

    /// 当前持有配额记录的用户数
    pub fn tracked_users(&self) -> usize {
        self.user_quotas.len()
    }
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self::new(60)
    }
}
