use thiserror::Error;

/// fast store 故障统一表现为不可达：上层把它当作"索引无效"处理，
/// read 路径回退 primary store，rebuild/verify 直接失败。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fast store unavailable: {0}")]
    Unavailable(String),
}

/// pipeline 批量写入的单个操作。
#[derive(Clone, Debug)]
pub enum FastOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    ZAdd { set: String, member: String, score: u64 },
    ZRem { set: String, member: String },
    ZClear { set: String },
}

/// 内存型二级存储的类型化操作面。无业务逻辑。
///
/// 有序结构语义：按 (score, member) 升序；member 在一个结构内唯一，
/// 重复 ZAdd 即更新 score。
pub trait FastStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// 原子计数器。键不存在按 0 起算，返回新值。
    fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    fn sorted_set_add(&self, set: &str, member: &str, score: u64) -> Result<(), StoreError>;
    fn sorted_set_remove(&self, set: &str, member: &str) -> Result<(), StoreError>;

    /// 按 rank 取 `count` 个成员，从 `start` 偏移开始；`descending` 反向。
    fn sorted_set_range(
        &self,
        set: &str,
        start: u64,
        count: u64,
        descending: bool,
    ) -> Result<Vec<String>, StoreError>;

    /// 全量导出 (member, score)，verify 的漂移判定用（score=updatedAt 毫秒）。
    fn sorted_set_scores(&self, set: &str) -> Result<Vec<(String, u64)>, StoreError>;

    fn sorted_set_card(&self, set: &str) -> Result<u64, StoreError>;
    fn sorted_set_clear(&self, set: &str) -> Result<(), StoreError>;

    /// 批量应用。"atomic-enough"：要么全部进入，要么整体失败；
    /// 不承诺对并发读者的隔离。
    fn pipeline(&self, ops: Vec<FastOp>) -> Result<(), StoreError>;
}
