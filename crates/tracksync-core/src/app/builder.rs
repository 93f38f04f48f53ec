//! SyncEngineBuilder - engine の組み立て
//!
//! # Fail-fast 設計
//! - 設定は build() 時に検証する。不備があれば一切の I/O の前に BuildError
//! - gateway は必須。ストアは省略すると設定のパスでファイル実装を使う

use std::sync::Arc;

use crate::config::Config;
use crate::domain::SyncError;
use crate::impls::{JsonSnapshotStore, MarkdownStore};
use crate::ports::{IdGenerator, RecordStore, RemoteGateway, SnapshotStore, SystemClock, UlidGenerator};

use super::engine::SyncEngine;
use super::resolver::PolicyTable;
use super::retry::RetryPolicy;

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    InvalidConfig(#[from] SyncError),
}

/// # 使用例
/// ```ignore
/// let engine = SyncEngine::builder()
///     .config(Config::from_file(path)?)
///     .gateway(Arc::new(GitHubGateway::from_env(&config)?))
///     .build()?;
/// let report = engine.run(false).await?;
/// ```
#[derive(Default)]
pub struct SyncEngineBuilder {
    config: Option<Config>,
    records: Option<Arc<dyn RecordStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    gateway: Option<Arc<dyn RemoteGateway>>,
    ids: Option<Arc<dyn IdGenerator>>,
    policy: Option<PolicyTable>,
    retry: Option<RetryPolicy>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn RemoteGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Override the field authority table.
    pub fn policy(mut self, policy: PolicyTable) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the retry policy from the configuration.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<SyncEngine, BuildError> {
        let config = self.config.ok_or(BuildError::MissingComponent("config"))?;
        config.validate()?;
        let gateway = self.gateway.ok_or(BuildError::MissingComponent("gateway"))?;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));
        let records = self.records.unwrap_or_else(|| {
            Arc::new(MarkdownStore::new(
                config.tracker_file.clone(),
                config.sections.clone(),
                Arc::clone(&ids),
            ))
        });
        let snapshots = self
            .snapshots
            .unwrap_or_else(|| Arc::new(JsonSnapshotStore::new(config.snapshot_file.clone())));
        let retry = self.retry.unwrap_or_else(|| config.retry.policy());

        Ok(SyncEngine {
            config,
            records,
            snapshots,
            gateway,
            ids,
            policy: self.policy.unwrap_or_default(),
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryGateway;

    #[test]
    fn gateway_is_required() {
        let result = SyncEngineBuilder::new()
            .config(Config::new("octo", "tracker", &["TODO"]))
            .build();
        assert!(matches!(result, Err(BuildError::MissingComponent("gateway"))));
    }

    #[test]
    fn invalid_config_fails_the_build() {
        let mut config = Config::new("octo", "tracker", &["TODO"]);
        config.concurrency = 0;
        let result = SyncEngineBuilder::new()
            .config(config)
            .gateway(Arc::new(InMemoryGateway::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidConfig(SyncError::Configuration { .. }))
        ));
    }

    #[test]
    fn file_stores_are_the_default() {
        let engine = SyncEngineBuilder::new()
            .config(Config::new("octo", "tracker", &["TODO"]))
            .gateway(Arc::new(InMemoryGateway::new()))
            .build()
            .unwrap();
        assert_eq!(engine.config().retry.max_attempts, 4);
    }
}
