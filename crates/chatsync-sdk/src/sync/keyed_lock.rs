//! 按实体身份串行化的异步锁表，以及按 key 排队的后台任务

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

/// 每个 key 一把互斥锁，不同 key 互不阻塞
#[derive(Debug)]
pub struct KeyedLock<K> {
    locks: Arc<RwLock<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 获取 key 对应的锁（持有 guard 期间同 key 的其他调用方等待）
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.get_lock(key).await.lock_owned().await
    }

    async fn get_lock(&self, key: &K) -> Arc<Mutex<()>> {
        // 先尝试读锁
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }

        // 需要创建新锁，获取写锁
        let mut locks = self.locks.write().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 在 key 的锁内执行 `work`，结束后释放空闲的锁
    pub async fn run<F: Future>(&self, key: &K, work: F) -> F::Output {
        let guard = self.lock(key).await;
        let output = work.await;
        drop(guard);
        self.release(key).await;
        output
    }

    /// 没有其他持有者或等待者时移除 key 的锁
    ///
    /// 表里的一份引用之外再无引用才移除；拿到锁的调用方总是先克隆 `Arc`，
    /// 所以正在等待的调用方会让锁保留下来。
    pub async fn release(&self, key: &K) {
        let mut locks = self.locks.write().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}

/// 同 key 的任务按提交顺序依次执行，不同 key 互不等待
pub struct KeyedQueue<K> {
    tails: Arc<parking_lot::Mutex<HashMap<K, JoinHandle<()>>>>,
}

impl<K> Clone for KeyedQueue<K> {
    fn clone(&self) -> Self {
        Self {
            tails: self.tails.clone(),
        }
    }
}

impl<K> Default for KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tails: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// 排在同 key 的上一个任务之后执行
    pub fn submit<F>(&self, key: K, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tails = self.tails.lock();
        tails.retain(|_, tail| !tail.is_finished());
        let previous = tails.remove(&key);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await;
        });
        tails.insert(key, handle);
    }

    /// 还有未完成任务的 key 数
    pub fn pending(&self) -> usize {
        let mut tails = self.tails.lock();
        tails.retain(|_, tail| !tail.is_finished());
        tails.len()
    }

    /// 等待当前已提交的任务全部结束
    pub async fn drain(&self) {
        let tails: Vec<JoinHandle<()>> = self.tails.lock().drain().map(|(_, tail)| tail).collect();
        for tail in tails {
            let _ = tail.await;
        }
    }
}
