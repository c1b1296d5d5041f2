use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::store::fast::{FastOp, FastStore, StoreError};

/// 单个有序结构：BTreeSet 按 (score, member) 排序 + member→score 反查。
/// 两者在同一把锁下更新，彼此不会漂移。
#[derive(Default)]
struct SortedSet {
    by_rank: BTreeSet<(u64, String)>,
    scores: HashMap<String, u64>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: u64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.by_rank.remove(&(old, member.to_string()));
        }
        self.by_rank.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.by_rank.remove(&(old, member.to_string()));
        }
    }
}

/// 进程内 fast store 参考实现。
///
/// hash 空间走 DashMap（读多写多、无全局锁），有序结构集中在一把 RwLock 下
/// （数量少、访问粒度是整个结构）。`available` 开关用于测试/演练时模拟宕机：
/// 关掉后所有操作返回 `StoreError::Unavailable`。
pub struct MemoryFastStore {
    kv: DashMap<String, Vec<u8>>,
    sets: RwLock<HashMap<String, SortedSet>>,
    available: AtomicBool,
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self {
            kv: DashMap::new(),
            sets: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟故障注入开关。
    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::Release);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        }
    }

    fn apply(&self, op: &FastOp) {
        match op {
            FastOp::Set { key, value } => {
                self.kv.insert(key.clone(), value.clone());
            }
            FastOp::Delete { key } => {
                self.kv.remove(key);
            }
            FastOp::ZAdd { set, member, score } => {
                self.sets
                    .write()
                    .entry(set.clone())
                    .or_default()
                    .add(member, *score);
            }
            FastOp::ZRem { set, member } => {
                if let Some(s) = self.sets.write().get_mut(set) {
                    s.remove(member);
                }
            }
            FastOp::ZClear { set } => {
                self.sets.write().remove(set);
            }
        }
    }
}

impl FastStore for MemoryFastStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.kv.remove(key);
        Ok(())
    }

    fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.check()?;
        // entry API 持桶锁，parse+写回对并发 incr 是原子的。
        let mut entry = self.kv.entry(key.to_string()).or_insert_with(|| b"0".to_vec());
        let cur: i64 = std::str::from_utf8(entry.value())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let next = cur + delta;
        *entry.value_mut() = next.to_string().into_bytes();
        Ok(next)
    }

    fn sorted_set_add(&self, set: &str, member: &str, score: u64) -> Result<(), StoreError> {
        self.check()?;
        self.sets
            .write()
            .entry(set.to_string())
            .or_default()
            .add(member, score);
        Ok(())
    }

    fn sorted_set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(s) = self.sets.write().get_mut(set) {
            s.remove(member);
        }
        Ok(())
    }

    fn sorted_set_range(
        &self,
        set: &str,
        start: u64,
        count: u64,
        descending: bool,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let sets = self.sets.read();
        let Some(s) = sets.get(set) else {
            return Ok(Vec::new());
        };
        let take = count as usize;
        let skip = start as usize;
        let out = if descending {
            s.by_rank
                .iter()
                .rev()
                .skip(skip)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        } else {
            s.by_rank
                .iter()
                .skip(skip)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        };
        Ok(out)
    }

    fn sorted_set_scores(&self, set: &str) -> Result<Vec<(String, u64)>, StoreError> {
        self.check()?;
        let sets = self.sets.read();
        let Some(s) = sets.get(set) else {
            return Ok(Vec::new());
        };
        Ok(s.by_rank
            .iter()
            .map(|(score, m)| (m.clone(), *score))
            .collect())
    }

    fn sorted_set_card(&self, set: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self
            .sets
            .read()
            .get(set)
            .map(|s| s.by_rank.len() as u64)
            .unwrap_or(0))
    }

    fn sorted_set_clear(&self, set: &str) -> Result<(), StoreError> {
        self.check()?;
        self.sets.write().remove(set);
        Ok(())
    }

    fn pipeline(&self, ops: Vec<FastOp>) -> Result<(), StoreError> {
        self.check()?;
        for op in &ops {
            self.apply(op);
        }
        Ok(())
    }
}
