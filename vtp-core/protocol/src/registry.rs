//! 适配器注册表

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{AdapterError, ProtocolAdapter, ProtocolKind, Result};

/// 适配器注册表
///
/// 每种协议类型最多对应一个适配器实例，执行引擎按步骤的协议类型查找。
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<ProtocolKind, Arc<dyn ProtocolAdapter>>>>,
}

impl AdapterRegistry {
    /// 创建新的适配器注册表
    pub fn new() -> Self {
        Self {
            adapters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册适配器
    pub async fn register(&self, adapter: Arc<dyn ProtocolAdapter>) -> Result<()> {
        let kind = adapter.kind();
        info!("注册协议适配器: {} ({})", kind, adapter.name());

        let mut adapters = self.adapters.write().await;

        if adapters.contains_key(&kind) {
            return Err(AdapterError::AdapterAlreadyRegistered(kind.to_string()));
        }

        adapters.insert(kind, adapter);

        Ok(())
    }

    /// 注册或替换适配器，返回被替换的旧实例
    pub async fn replace(
        &self,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> Option<Arc<dyn ProtocolAdapter>> {
        let kind = adapter.kind();
        info!("替换协议适配器: {}", kind);

        self.adapters.write().await.insert(kind, adapter)
    }

    /// 注销适配器
    pub async fn unregister(&self, kind: ProtocolKind) -> Result<()> {
        info!("注销协议适配器: {}", kind);

        self.adapters
            .write()
            .await
            .remove(&kind)
            .ok_or_else(|| AdapterError::AdapterNotFound(kind.to_string()))?;

        Ok(())
    }

    /// 获取适配器
    pub async fn get(&self, kind: ProtocolKind) -> Result<Arc<dyn ProtocolAdapter>> {
        debug!("获取协议适配器: {}", kind);

        self.adapters
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| AdapterError::AdapterNotFound(kind.to_string()))
    }

    /// 列出所有已注册的协议类型
    pub async fn list(&self) -> Vec<ProtocolKind> {
        let mut kinds: Vec<ProtocolKind> = self.adapters.read().await.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// 检查协议是否已注册
    pub async fn is_registered(&self, kind: ProtocolKind) -> bool {
        self.adapters.read().await.contains_key(&kind)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdapterRequest, MockServiceAdapter};

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = AdapterRegistry::new();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_kind() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(MockServiceAdapter::echo(ProtocolKind::Can)))
            .await
            .unwrap();

        let err = registry
            .register(Arc::new(MockServiceAdapter::echo(ProtocolKind::Can)))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::AdapterAlreadyRegistered("can".to_string()));

        // replace 不受限制
        let previous = registry
            .replace(Arc::new(MockServiceAdapter::echo(ProtocolKind::Can)))
            .await;
        assert!(previous.is_some());
    }

    #[tokio::test]
    async fn test_get_and_unregister() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(MockServiceAdapter::echo(ProtocolKind::SomeIp)))
            .await
            .unwrap();
        registry
            .register(Arc::new(MockServiceAdapter::echo(ProtocolKind::Rpc)))
            .await
            .unwrap();

        assert_eq!(
            registry.list().await,
            vec![ProtocolKind::Rpc, ProtocolKind::SomeIp]
        );

        let adapter = registry.get(ProtocolKind::SomeIp).await.unwrap();
        let request = AdapterRequest::new(
            "step-1",
            serde_json::json!({"method": "getSpeed"}),
            tokio::time::Instant::now() + std::time::Duration::from_secs(1),
            tokio_util::sync::CancellationToken::new(),
        );
        let value = adapter.execute(request).await.unwrap();
        assert_eq!(value["method"], "getSpeed");

        registry.unregister(ProtocolKind::SomeIp).await.unwrap();
        assert!(!registry.is_registered(ProtocolKind::SomeIp).await);
        assert!(matches!(
            registry.get(ProtocolKind::SomeIp).await,
            Err(AdapterError::AdapterNotFound(_))
        ));
        assert!(registry.unregister(ProtocolKind::SomeIp).await.is_err());
    }
}
