use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

/// 进程内的简易资源仓库，按自增 ID 有序保存
pub struct Repository<T> {
    records: RwLock<BTreeMap<i64, T>>,
    next_id: AtomicI64,
}

impl<T> Default for Repository<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl<T: Clone> Repository<T> {
    /// 分配 ID 后由 `build` 构造记录
    pub async fn insert(&self, build: impl FnOnce(i64) -> T) -> T {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = build(id);
        self.records.write().await.insert(id, record.clone());
        record
    }

    pub async fn get(&self, id: i64) -> Option<T> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn list(&self, skip: usize, limit: usize, filter: impl Fn(&T) -> bool) -> Vec<T> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| filter(r))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn update(&self, id: i64, apply: impl FnOnce(&mut T)) -> Option<T> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id)?;
        apply(record);
        Some(record.clone())
    }

    pub async fn remove(&self, id: i64) -> bool {
        self.records.write().await.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_sequential_and_listing_paginates() {
        let repo = Repository::<(i64, &str)>::default();
        for name in ["a", "b", "c"] {
            repo.insert(|id| (id, name)).await;
        }

        assert_eq!(repo.get(2).await, Some((2, "b")));
        assert_eq!(repo.list(1, 1, |_| true).await, vec![(2, "b")]);
        assert_eq!(repo.list(0, 10, |r| r.1 != "a").await.len(), 2);

        assert!(repo.remove(1).await);
        assert!(!repo.remove(1).await);
        assert_eq!(repo.update(3, |r| r.1 = "z").await, Some((3, "z")));
        assert_eq!(repo.update(9, |_| {}).await, None);
    }
}
