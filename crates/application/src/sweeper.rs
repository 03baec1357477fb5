use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::rate_limiter::MessageRateLimiter;
use crate::services::PresenceService;

/// 周期性清理过期在线记录和过期的限流配额，取消令牌触发后退出
pub fn spawn_presence_sweeper(
    service: PresenceService,
    rate_limiter: Arc<MessageRateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = interval.as_millis() as u64, "在线状态清理任务启动");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = service.sweep_expired();
                    if evicted > 0 {
                        tracing::info!(evicted, "清理过期在线记录");
                    }
                    let released = rate_limiter.cleanup_expired();
                    if released > 0 {
                        tracing::debug!(released, "清理过期限流配额");
                    }
                }
            }
        }

        tracing::info!("在线状态清理任务退出");
    })
}
