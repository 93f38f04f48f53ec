//! IdGenerator port - ID 生成の抽象化
//!
//! 新しい TaskId が必要になるのは 2 か所だけです:
//! - tracker.md に `id:` の無いタスクがあったとき（読み込み時に一度だけ割り当て）
//! - orphan issue を pull してローカルに作るとき
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。`task-<ULID>` 形式。

use ulid::Ulid;

use crate::domain::TaskId;
use crate::ports::Clock;

/// IdGenerator は衝突しない TaskId を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（executor から共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は Clock を使って時刻ベースの ULID を生成します。
/// テストでは FixedClock を渡すと timestamp 部分が固定されます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::new(format!("task-{ulid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("task-"));
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);

        let ulid1: Ulid = id1.as_str().trim_start_matches("task-").parse().unwrap();
        let ulid2: Ulid = id2.as_str().trim_start_matches("task-").parse().unwrap();
        assert_eq!(ulid1.timestamp_ms(), ulid2.timestamp_ms());
        assert_eq!(ulid1.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
