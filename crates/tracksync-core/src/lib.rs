//! tracksync-core
//!
//! tracker.md（ローカルのタスク一覧）と GitHub Issues / Projects board を
//! 双方向に同期するためのコア。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, snapshot, change, plan, errors）
//! - **ports**: 抽象化レイヤー（RecordStore, SnapshotStore, RemoteGateway, Clock, IdGenerator）
//! - **app**: 同期ロジック（detector, resolver, planner, executor, engine, builder）
//! - **impls**: 実装（Markdown / JSON ファイル、GitHub、テスト用 in-memory）
//! - **config**: `config.yaml` の読み込みと検証
//! - **lock**: run 単位のロックファイル

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod lock;
pub mod ports;

pub use self::app::{SyncEngine, SyncEngineBuilder, SyncReport};
pub use self::config::Config;
pub use self::domain::SyncError;
