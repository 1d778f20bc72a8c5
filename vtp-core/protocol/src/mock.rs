//! 模拟服务适配器
//!
//! 按请求载荷中的键字段 (如 `method`、`topic`、`signal`) 查找预设响应，
//! 用于在没有真实车端服务时驱动测试计划，也可在运行期修改默认响应。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::{AdapterError, AdapterRequest, ProtocolAdapter, ProtocolKind, Result};

/// 预设响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockResponse {
    /// 返回值
    #[serde(default)]
    pub value: serde_json::Value,

    /// 响应延迟 (毫秒)
    #[serde(default)]
    pub delay_ms: u64,

    /// 注入的调用错误
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MockResponse {
    pub fn value(value: serde_json::Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// 模拟服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockServiceConfig {
    /// 协议类型
    pub kind: ProtocolKind,

    /// 载荷中用于查找响应的字段 (缺省按协议类型推断)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,

    /// 键 -> 响应
    #[serde(default)]
    pub responses: HashMap<String, MockResponse>,

    /// 没有匹配键时使用的默认响应
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_response: Option<MockResponse>,

    /// 没有任何响应可用时原样返回请求载荷
    #[serde(default)]
    pub echo: bool,
}

/// 模拟服务适配器
pub struct MockServiceAdapter {
    kind: ProtocolKind,
    key_field: String,
    responses: RwLock<HashMap<String, MockResponse>>,
    default_response: RwLock<Option<MockResponse>>,
    echo: bool,
}

impl MockServiceAdapter {
    /// 根据配置创建模拟服务
    pub fn new(config: MockServiceConfig) -> Self {
        let key_field = config
            .key_field
            .unwrap_or_else(|| config.kind.default_key_field().to_string());

        Self {
            kind: config.kind,
            key_field,
            responses: RwLock::new(config.responses),
            default_response: RwLock::new(config.default_response),
            echo: config.echo,
        }
    }

    /// 创建回显服务 (返回请求载荷)
    pub fn echo(kind: ProtocolKind) -> Self {
        Self::new(MockServiceConfig {
            kind,
            key_field: None,
            responses: HashMap::new(),
            default_response: None,
            echo: true,
        })
    }

    /// 追加预设响应
    pub fn with_response(mut self, key: &str, response: MockResponse) -> Self {
        self.responses.get_mut().insert(key.to_string(), response);
        self
    }

    /// 设置默认响应
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        *self.default_response.get_mut() = Some(response);
        self
    }

    /// 查找键字段名
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// 运行期设置某个键的响应
    pub async fn set_response(&self, key: &str, response: MockResponse) {
        debug!("{} 模拟服务设置响应: {}", self.kind, key);
        self.responses
            .write()
            .await
            .insert(key.to_string(), response);
    }

    /// 运行期设置默认响应
    pub async fn set_default_response(&self, response: Option<MockResponse>) {
        *self.default_response.write().await = response;
    }

    /// 获取某个键当前生效的响应
    pub async fn response_for(&self, key: &str) -> Option<MockResponse> {
        if let Some(response) = self.responses.read().await.get(key) {
            return Some(response.clone());
        }
        self.default_response.read().await.clone()
    }
}

#[async_trait]
impl ProtocolAdapter for MockServiceAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn name(&self) -> String {
        format!("mock-{}", self.kind)
    }

    async fn execute(&self, request: AdapterRequest) -> Result<serde_json::Value> {
        let key = request.payload_str(&self.key_field).unwrap_or_default();

        let response = match self.response_for(key).await {
            Some(response) => response,
            None if self.echo => return Ok(request.payload.clone()),
            None => {
                return Err(AdapterError::NotConnected(format!(
                    "{} 模拟服务没有 {}={} 的响应",
                    self.kind, self.key_field, key
                )))
            }
        };

        if response.delay_ms > 0 {
            let wake_at = Instant::now() + Duration::from_millis(response.delay_ms);
            let timed_out = wake_at > request.deadline;

            tokio::select! {
                _ = request.cancel.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep_until(wake_at.min(request.deadline)) => {}
            }

            if timed_out {
                return Err(AdapterError::Timeout);
            }
        }

        match response.error {
            Some(message) => Err(AdapterError::CallFailed(message)),
            None => Ok(response.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn request(payload: serde_json::Value, timeout: Duration) -> AdapterRequest {
        AdapterRequest::new(
            "step",
            payload,
            Instant::now() + timeout,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_response_by_key() {
        let adapter = MockServiceAdapter::new(MockServiceConfig {
            kind: ProtocolKind::Rpc,
            key_field: None,
            responses: HashMap::new(),
            default_response: None,
            echo: false,
        })
        .with_response("getDoorState", MockResponse::value(json!({"locked": true})));

        assert_eq!(adapter.key_field(), "method");

        let value = adapter
            .execute(request(json!({"method": "getDoorState"}), Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, json!({"locked": true}));

        let err = adapter
            .execute(request(json!({"method": "unknown"}), Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_default_response_and_runtime_update() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Fsa)
            .with_default_response(MockResponse::value(json!({"result": 0})));

        let value = adapter
            .execute(request(json!({"function": "seatHeat"}), Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, json!({"result": 0}));

        adapter
            .set_response("seatHeat", MockResponse::value(json!({"result": 3})))
            .await;
        let value = adapter
            .execute(request(json!({"function": "seatHeat"}), Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, json!({"result": 3}));
    }

    #[tokio::test]
    async fn test_injected_error() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Dtc)
            .with_response("P0301", MockResponse::error("cloud unreachable"));

        let err = adapter
            .execute(request(json!({"event": "P0301"}), Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::CallFailed("cloud unreachable".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_past_deadline_times_out() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Can)
            .with_response("VehSpd", MockResponse::value(json!(88)).with_delay(5_000));

        let err = adapter
            .execute(request(json!({"signal": "VehSpd"}), Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_delay() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Topic)
            .with_response("adas/state", MockResponse::value(json!({})).with_delay(60_000));

        let req = request(json!({"topic": "adas/state"}), Duration::from_secs(120));
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = adapter.execute(req).await.unwrap_err();
        assert_eq!(err, AdapterError::Cancelled);
    }
}
