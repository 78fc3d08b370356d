use std::time::Duration;

use crate::config::Config;
use crate::core::error::Error;
use crate::core::policy::{RequestRetrier, RetryResponder};
use crate::core::request::Request;
use crate::core::session_manager::SessionManager;
use crate::core::transport::TransportErrorKind;

/// 指数退避重试器
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetrier {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 添加抖动因子避免重试风暴
    pub retryable_statuses: Vec<u16>,
}

impl Default for ExponentialBackoffRetrier {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% 的抖动
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl ExponentialBackoffRetrier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.retry_count,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter_factor: config.retry_jitter,
            ..Default::default()
        }
    }

    pub fn should_retry(&self, error: &Error, retry_count: u32) -> bool {
        if retry_count >= self.max_retries {
            return false;
        }

        // 根据错误类型判断是否可重试
        match error {
            Error::Transport(e) => matches!(
                e.kind,
                TransportErrorKind::Dns
                    | TransportErrorKind::Connect
                    | TransportErrorKind::Tls
                    | TransportErrorKind::Timeout
                    | TransportErrorKind::Reset
                    | TransportErrorKind::Read
            ),
            // 服务器错误中，5xx 和限流通常可以重试
            Error::ResponseValidation { status, .. } => self.retryable_statuses.contains(status),
            Error::Adaptation(_) => true,
            _ => false, // 其他错误不重试
        }
    }

    pub fn get_delay(&self, retry_count: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        // 先在浮点域封顶，溢出成无穷或 NaN 时直接取上限
        let final_delay = delay_secs + jitter;
        if !final_delay.is_finite() {
            return self.max_delay;
        }
        Duration::from_secs_f64(final_delay.clamp(0.0, max_secs))
    }
}

impl RequestRetrier for ExponentialBackoffRetrier {
    fn should(&self, _manager: &SessionManager, request: &Request, error: &Error, responder: RetryResponder) {
        let retry_count = request.retry_count();
        if self.should_retry(error, retry_count) {
            responder.respond(true, self.get_delay(retry_count));
        } else {
            log::debug!("请求 #{} 不再重试 (已重试 {} 次): {}", request.id(), retry_count, error);
            responder.respond(false, Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::description::RequestDescription;
    use crate::core::transport::TransportError;
    use crate::test_support::{MockTransport, Step};

    #[test]
    fn test_should_retry_by_kind() {
        let retrier = ExponentialBackoffRetrier::default();
        let reset = Error::Transport(TransportError::new(TransportErrorKind::Reset, "reset"));
        assert!(retrier.should_retry(&reset, 0));
        assert!(!retrier.should_retry(&reset, 3));

        let redirect = Error::Transport(TransportError::new(TransportErrorKind::Redirect, "loop"));
        assert!(!retrier.should_retry(&redirect, 0));

        let unavailable = Error::ResponseValidation { status: 503, reason: String::new() };
        assert!(retrier.should_retry(&unavailable, 0));
        let not_found = Error::ResponseValidation { status: 404, reason: String::new() };
        assert!(!retrier.should_retry(&not_found, 0));
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let retrier = ExponentialBackoffRetrier {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(retrier.get_delay(0), Duration::from_millis(100));
        assert_eq!(retrier.get_delay(1), Duration::from_millis(200));
        assert_eq!(retrier.get_delay(5), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_for_huge_retry_count_is_capped() {
        let retrier = ExponentialBackoffRetrier::default();
        assert_eq!(retrier.get_delay(64), retrier.max_delay);
        assert_eq!(retrier.get_delay(u32::MAX), retrier.max_delay);

        let no_jitter = ExponentialBackoffRetrier { jitter_factor: 0.0, ..Default::default() };
        assert_eq!(no_jitter.get_delay(2000), no_jitter.max_delay);
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.retry_count = 7;
        config.retry_delay_ms = 250;
        let retrier = ExponentialBackoffRetrier::from_config(&config);
        assert_eq!(retrier.max_retries, 7);
        assert_eq!(retrier.base_delay, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            transport.script(vec![Step::Fail(TransportError::new(TransportErrorKind::Timeout, "超时"))]);
        }
        let retrier = ExponentialBackoffRetrier {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let manager = SessionManager::builder(transport.clone()).retrier(retrier).build().unwrap();

        let request = manager.request(RequestDescription::get("https://example.com/slow").unwrap());
        let response = request.data_response().await;
        assert_eq!(response.error.and_then(|e| e.transport_kind()), Some(TransportErrorKind::Timeout));
        assert_eq!(request.retry_count(), 2);
        assert_eq!(transport.created().len(), 3);
    }
}
