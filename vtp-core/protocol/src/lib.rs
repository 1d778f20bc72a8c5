//! VTP 协议层
//!
//! 为 RPC、Topic、CAN、SOME-IP、FSA、DTC、CTD 提供统一的适配器抽象接口。
//! 报文的线上格式由各适配器自行负责，执行引擎只通过 [`ProtocolAdapter`] 与之交互。

pub mod mock;
pub mod registry;
pub mod traits;

pub use mock::{MockResponse, MockServiceAdapter, MockServiceConfig};
pub use registry::AdapterRegistry;
pub use traits::{AdapterRequest, ProtocolAdapter, ProtocolKind};

use thiserror::Error;

/// 协议适配器错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("协议 {0} 未注册适配器")]
    AdapterNotFound(String),

    #[error("协议 {0} 已注册适配器")]
    AdapterAlreadyRegistered(String),

    #[error("未知的协议类型: {0}")]
    UnknownProtocol(String),

    #[error("服务未连接: {0}")]
    NotConnected(String),

    #[error("请求参数无效: {0}")]
    InvalidPayload(String),

    #[error("调用失败: {0}")]
    CallFailed(String),

    #[error("超时")]
    Timeout,

    #[error("调用已取消")]
    Cancelled,
}

impl AdapterError {
    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
