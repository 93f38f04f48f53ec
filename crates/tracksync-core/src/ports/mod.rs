//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。reconciliation のロジックは
//! ここに定義した trait だけに依存し、tracker.md / GitHub / ファイルシステムの
//! 詳細は `impls` 側に閉じ込めます。
//!
//! # 設計原則
//! - ローカルの正本は RecordStore（tracker.md）
//! - リモートは RemoteGateway（issue CRUD + board 操作）
//! - 三者マージのベースは SnapshotStore

pub mod clock;
pub mod id_generator;
pub mod record_store;
pub mod remote_gateway;
pub mod snapshot_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::record_store::{RecordStore, StagedWrite};
pub use self::remote_gateway::RemoteGateway;
pub use self::snapshot_store::SnapshotStore;
