use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-identity async mutexes
///
/// Operations on the same call, channel, groupcall or confbridge hold the
/// matching guard for their read-modify-write so they are applied one at a time.
///
/// ```
/// # use rvoip_call_manager::store::IdentityLocks;
/// # use uuid::Uuid;
/// # tokio_test::block_on(async {
/// let locks = IdentityLocks::new();
/// let call_id = Uuid::new_v4();
/// {
///     let _guard = locks.call(call_id).await;
///     assert_eq!(locks.prune(), 0);
/// }
/// assert_eq!(locks.prune(), 1);
/// # })
/// ```
#[derive(Default)]
pub struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    pub async fn call(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock(format!("call:{}", id)).await
    }

    pub async fn channel(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock(format!("channel:{}", id)).await
    }

    pub async fn groupcall(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock(format!("groupcall:{}", id)).await
    }

    pub async fn confbridge(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock(format!("confbridge:{}", id)).await
    }

    pub async fn external_media(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock(format!("external_media:{}", id)).await
    }

    pub async fn recording(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.lock(format!("recording:{}", id)).await
    }

    /// Drop mutexes nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
