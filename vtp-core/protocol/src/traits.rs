//! 协议适配器抽象接口

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, Result};

/// 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// 通用 RPC 调用
    Rpc,

    /// 发布/订阅主题
    Topic,

    /// CAN 信号
    Can,

    /// SOME-IP 服务
    SomeIp,

    /// FSA 服务
    Fsa,

    /// 车端到云端诊断事件 (DTC)
    Dtc,

    /// 云端到车端事件 (CTD)
    Ctd,
}

impl ProtocolKind {
    /// 所有协议类型
    pub const ALL: [ProtocolKind; 7] = [
        ProtocolKind::Rpc,
        ProtocolKind::Topic,
        ProtocolKind::Can,
        ProtocolKind::SomeIp,
        ProtocolKind::Fsa,
        ProtocolKind::Dtc,
        ProtocolKind::Ctd,
    ];

    /// 协议名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Rpc => "rpc",
            ProtocolKind::Topic => "topic",
            ProtocolKind::Can => "can",
            ProtocolKind::SomeIp => "someip",
            ProtocolKind::Fsa => "fsa",
            ProtocolKind::Dtc => "dtc",
            ProtocolKind::Ctd => "ctd",
        }
    }

    /// 请求载荷中用于定位服务响应的字段名
    pub fn default_key_field(&self) -> &'static str {
        match self {
            ProtocolKind::Rpc | ProtocolKind::SomeIp => "method",
            ProtocolKind::Topic => "topic",
            ProtocolKind::Can => "signal",
            ProtocolKind::Fsa => "function",
            ProtocolKind::Dtc | ProtocolKind::Ctd => "event",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rpc" => Ok(ProtocolKind::Rpc),
            "topic" => Ok(ProtocolKind::Topic),
            "can" => Ok(ProtocolKind::Can),
            "someip" | "some-ip" | "some_ip" => Ok(ProtocolKind::SomeIp),
            "fsa" => Ok(ProtocolKind::Fsa),
            "dtc" => Ok(ProtocolKind::Dtc),
            "ctd" => Ok(ProtocolKind::Ctd),
            other => Err(AdapterError::UnknownProtocol(other.to_string())),
        }
    }
}

/// 单次适配器调用的请求
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    /// 步骤 ID
    pub step_id: String,

    /// 协议相关的请求载荷 (引擎不解析)
    pub payload: serde_json::Value,

    /// 调用截止时间
    pub deadline: Instant,

    /// 取消信号，适配器必须在其触发后尽快返回
    pub cancel: CancellationToken,
}

impl AdapterRequest {
    pub fn new(
        step_id: impl Into<String>,
        payload: serde_json::Value,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            payload,
            deadline,
            cancel,
        }
    }

    /// 距离截止时间的剩余时长
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 读取载荷中的字符串字段
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

/// 协议适配器 trait
///
/// 每种协议集成都必须实现此 trait 才能被执行引擎驱动。
/// 发送 CAN 帧、SOME-IP 调用、发布云端事件等副作用都只发生在适配器内部。
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// 适配器处理的协议类型
    fn kind(&self) -> ProtocolKind;

    /// 执行一次调用，返回观测到的实际值
    ///
    /// 实现必须在 `request.deadline` 之前返回，并在 `request.cancel` 触发后尽快返回
    /// [`AdapterError::Cancelled`]。
    async fn execute(&self, request: AdapterRequest) -> Result<serde_json::Value>;

    /// 适配器名称
    fn name(&self) -> String {
        self.kind().to_string()
    }
}
