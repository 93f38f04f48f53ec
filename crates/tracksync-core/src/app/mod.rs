//! App - アプリケーション層
//!
//! ports を組み合わせて 1 回の同期 run を実装します。
//!
//! # 主要コンポーネント
//! - **Detector**: レコード・issue・スナップショットを突き合わせて分類
//! - **Resolver**: フィールドごとの権威ルールで競合を解決
//! - **Planner**: 解決結果から順序つきの操作列（Plan）を作る
//! - **Executor**: Plan を id ごとに並行実行（retry つき）
//! - **SyncEngine / SyncEngineBuilder**: 全体のワイヤリングと flush

pub mod builder;
pub mod detector;
pub mod engine;
pub mod executor;
pub mod planner;
pub mod report;
pub mod resolver;
pub mod retry;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, SyncEngineBuilder};
pub use self::detector::{Detection, Detector, EntityState, Orphan};
pub use self::engine::{Prepared, SyncEngine};
pub use self::executor::{Execution, Executor};
pub use self::planner::Planner;
pub use self::report::{CreatedIssue, SyncFailure, SyncReport};
pub use self::resolver::{FieldDecision, PolicyTable, Resolution, Resolver, Rule};
pub use self::retry::RetryPolicy;
