// 指数退避与只读调用重试
//
// 只有 is_retryable() 的错误（网络 / 超时）会重试；
// 节点拒绝、revert 等确定性错误立即返回

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::RpcConfig;
use crate::error::EngineResult;

/// 指数退避序列
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// 返回当前间隔并推进到下一档
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(next).min(self.max);
        delay
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// 不重试（写操作使用）
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, 2.0)
    }
}

/// 带退避的重试执行
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, will retry"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
