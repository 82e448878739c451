/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Single-use, short-TTL tokens exchanged from a bearer token, used to authenticate a
//! `GET /ws` upgrade that cannot carry an `Authorization` header.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

use chat_core::ConnectionKeyEntry;

/// How often the reaper sweeps the map for expired keys, independent of `ttl`.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A map of outstanding connection keys, with a background task that evicts expired
/// entries nobody ever redeemed.
///
/// `issue` and `consume` are the only two operations a caller needs: a key is either
/// redeemed once via `consume`, or it eventually perishes on its own.
pub struct ConnectionKeyStore {
    entries: Arc<DashMap<Uuid, ConnectionKeyEntry>>,
    ttl: Duration,
    _drop_tx: oneshot::Sender<()>,
}

impl ConnectionKeyStore {
    pub fn new(ttl: Duration) -> Self {
        let entries: Arc<DashMap<Uuid, ConnectionKeyEntry>> = Arc::new(DashMap::new());
        let (drop_tx, mut drop_rx) = oneshot::channel();

        let watched = Arc::clone(&entries);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut drop_rx => break,
                    _ = interval.tick() => {
                        let now = OffsetDateTime::now_utc();
                        let before = watched.len();
                        watched.retain(|_, entry| !entry.is_expired(now));
                        let reaped = before - watched.len();
                        if reaped > 0 {
                            trace!(reaped, "swept expired connection keys");
                        }
                    }
                }
            }
        });

        Self {
            entries,
            ttl,
            _drop_tx: drop_tx,
        }
    }

    /// Mints a new key bound to `user_id` and, optionally, an existing session.
    pub fn issue(&self, user_id: String, session_id: Option<i64>) -> ConnectionKeyEntry {
        let entry = ConnectionKeyEntry {
            key: Uuid::now_v7(),
            user_id,
            session_id,
            expires_at: OffsetDateTime::now_utc() + self.ttl,
        };
        self.entries.insert(entry.key, entry.clone());
        entry
    }

    /// Redeems `key`, returning the bound identity exactly once. A second call with the
    /// same key, or a call after expiry, returns `None`.
    pub fn consume(&self, key: Uuid) -> Option<ConnectionKeyEntry> {
        let (_, entry) = self.entries.remove(&key)?;
        if entry.is_expired(OffsetDateTime::now_utc()) {
            None
        } else {
            Some(entry)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn issued_key_is_consumed_exactly_once() {
        let store = ConnectionKeyStore::new(Duration::from_secs(60));
        let entry = store.issue("user-1".to_string(), Some(42));

        let consumed = store.consume(entry.key).expect("key should resolve");
        assert_eq!(consumed.user_id, "user-1");
        assert_eq!(consumed.session_id, Some(42));

        assert!(store.consume(entry.key).is_none());
    }

    #[tokio::test]
    async fn unknown_key_resolves_to_none() {
        let store = ConnectionKeyStore::new(Duration::from_secs(60));
        assert!(store.consume(Uuid::now_v7()).is_none());
    }

    #[tokio::test]
    async fn expired_key_resolves_to_none() {
        let store = ConnectionKeyStore::new(Duration::from_millis(1));
        let entry = store.issue("user-1".to_string(), None);

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.consume(entry.key).is_none());
    }

    #[tokio::test]
    async fn reaper_sweeps_expired_entries_from_the_map() {
        let store = ConnectionKeyStore::new(Duration::from_millis(1));
        store.issue("user-1".to_string(), None);

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_millis(500)).await;

        assert_eq!(store.entries.len(), 0);
    }
}
