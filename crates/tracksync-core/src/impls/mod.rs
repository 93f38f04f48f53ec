//! Impls - ports の実装
//!
//! # 本番用
//! - **MarkdownStore**: tracker.md
//! - **JsonSnapshotStore**: スナップショット（JSON）
//! - **GitHubGateway**: GitHub Issues + Projects v2
//!
//! # テスト用
//! - **InMemoryRecordStore** / **InMemorySnapshotStore**
//! - **InMemoryGateway**: 失敗注入つきのリモート

pub mod atomic;
pub mod github;
pub mod inmem_gateway;
pub mod inmem_store;
pub mod json_snapshot;
pub mod markdown;

pub use self::github::GitHubGateway;
pub use self::inmem_gateway::InMemoryGateway;
pub use self::inmem_store::{InMemoryRecordStore, InMemorySnapshotStore};
pub use self::json_snapshot::JsonSnapshotStore;
pub use self::markdown::MarkdownStore;
