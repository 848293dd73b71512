use crate::api::config::{fingerprint, ConfigKey, ConfigSnapshot};
use crate::api::events::ChangeEvent;
use crate::common::subscription::EventSender;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Cache Data for Config
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CacheData {
    pub(crate) content: String,
    pub(crate) md5: String,
    pub(crate) last_modified: i64,
    /// false while the value only comes from a local publish
    pub(crate) confirmed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CacheSlot {
    Present(CacheData),
    /// The server reported the config as absent. Snapshots not newer than
    /// the last value seen before the removal cannot bring it back.
    Absent { last_modified: Option<i64> },
}

struct Entry {
    slot: CacheSlot,
    /// Bumped on every write to the entry.
    stamp: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<ConfigKey, Entry>,
    next_stamp: u64,
}

impl Entries {
    fn stamp(&self, key: &ConfigKey) -> u64 {
        self.map.get(key).map(|e| e.stamp).unwrap_or(0)
    }

    fn slot(&self, key: &ConfigKey) -> Option<&CacheSlot> {
        self.map.get(key).map(|e| &e.slot)
    }

    fn set(&mut self, key: &ConfigKey, slot: CacheSlot) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.map.insert(key.clone(), Entry { slot, stamp });
    }
}

/// Last-known config values.
pub(crate) struct ConfigCache {
    entries: Mutex<Entries>,
    events: EventSender,
}

impl ConfigCache {
    pub(crate) fn new(events: EventSender) -> Self {
        ConfigCache {
            entries: Mutex::new(Entries::default()),
            events,
        }
    }

    pub(crate) fn get(&self, key: &ConfigKey) -> Option<CacheSlot> {
        self.lock_entries().slot(key).cloned()
    }

    pub(crate) fn content(&self, key: &ConfigKey) -> Option<String> {
        match self.lock_entries().slot(key) {
            Some(CacheSlot::Present(data)) => Some(data.content.clone()),
            _ => None,
        }
    }

    /// Write stamp of `key`, taken before a fetch and handed back with its
    /// answer to [`ConfigCache::apply_fetched`].
    pub(crate) fn stamp(&self, key: &ConfigKey) -> u64 {
        self.lock_entries().stamp(key)
    }

    /// Store an authoritative snapshot, returns whether the content changed.
    ///
    /// Ignored when the fingerprint matches the cached one, or when the
    /// snapshot is older than the cached value. A locally published value
    /// only yields to a strictly newer snapshot.
    pub(crate) fn upsert(&self, key: &ConfigKey, snapshot: ConfigSnapshot) -> bool {
        let mut entries = self.lock_entries();
        self.upsert_in(&mut entries, key, snapshot)
    }

    /// Apply the answer of a fetch started at write stamp `stamp`.
    ///
    /// An "absent" answer only removes what the fetch could have seen: it is
    /// dropped when the entry was written after the fetch started, or holds
    /// a publish not yet confirmed. A snapshot never revives a removal that
    /// happened after the fetch started.
    pub(crate) fn apply_fetched(&self, key: &ConfigKey, fetched: Option<ConfigSnapshot>, stamp: u64) -> bool {
        let mut entries = self.lock_entries();
        let moved = entries.stamp(key) != stamp;
        match fetched {
            None => {
                let unconfirmed = matches!(
                    entries.slot(key),
                    Some(CacheSlot::Present(data)) if !data.confirmed
                );
                if moved || unconfirmed {
                    debug!(config = %key, moved, unconfirmed, "outdated absent answer dropped");
                    return false;
                }
                self.remove_in(&mut entries, key)
            }
            Some(snapshot) => {
                if moved && matches!(entries.slot(key), Some(CacheSlot::Absent { .. })) {
                    debug!(config = %key, "snapshot older than removal dropped");
                    return false;
                }
                self.upsert_in(&mut entries, key, snapshot)
            }
        }
    }

    /// Store a value just published by this client, ahead of the server's
    /// confirmation.
    pub(crate) fn upsert_local(&self, key: &ConfigKey, content: &str) -> bool {
        let md5 = fingerprint(content);
        let mut entries = self.lock_entries();
        let last_modified = match entries.slot(key) {
            Some(CacheSlot::Present(data)) if data.md5 == md5 => return false,
            Some(CacheSlot::Present(data)) => data.last_modified,
            Some(CacheSlot::Absent { last_modified }) => last_modified.unwrap_or(0),
            None => 0,
        };
        debug!(config = %key, md5 = %md5, "published config cached");
        entries.set(
            key,
            CacheSlot::Present(CacheData {
                content: content.to_string(),
                md5: md5.clone(),
                last_modified,
                confirmed: false,
            }),
        );
        let _ = self.events.send(ChangeEvent::ConfigChanged {
            data_id: key.data_id.clone(),
            group: key.group.clone(),
            content: Some(content.to_string()),
            fingerprint: Some(md5),
        });
        true
    }

    /// Record that the server has no such config, returns whether a cached
    /// value was dropped.
    pub(crate) fn remove(&self, key: &ConfigKey) -> bool {
        let mut entries = self.lock_entries();
        self.remove_in(&mut entries, key)
    }

    fn upsert_in(&self, entries: &mut Entries, key: &ConfigKey, snapshot: ConfigSnapshot) -> bool {
        let entry = entries.map.get_mut(key);
        match entry.map(|e| (&mut e.slot, &mut e.stamp)) {
            Some((CacheSlot::Present(data), stamp)) => {
                if data.md5 == snapshot.fingerprint {
                    if !data.confirmed {
                        debug!(config = %key, "published config confirmed");
                    }
                    data.confirmed = true;
                    data.last_modified = data.last_modified.max(snapshot.last_modified);
                    entries.next_stamp += 1;
                    *stamp = entries.next_stamp;
                    return false;
                }
                let stale = if data.confirmed {
                    snapshot.last_modified < data.last_modified
                } else {
                    snapshot.last_modified <= data.last_modified
                };
                if stale {
                    debug!(
                        config = %key,
                        last_modified = snapshot.last_modified,
                        cached = data.last_modified,
                        "stale config snapshot dropped"
                    );
                    return false;
                }
            }
            Some((
                CacheSlot::Absent {
                    last_modified: Some(removed_at),
                },
                _,
            )) if snapshot.last_modified <= *removed_at => {
                debug!(
                    config = %key,
                    last_modified = snapshot.last_modified,
                    removed_at = *removed_at,
                    "snapshot of removed config dropped"
                );
                return false;
            }
            _ => {}
        }
        info!(config = %key, md5 = %snapshot.fingerprint, "config updated");
        let event = ChangeEvent::ConfigChanged {
            data_id: key.data_id.clone(),
            group: key.group.clone(),
            content: Some(snapshot.content.clone()),
            fingerprint: Some(snapshot.fingerprint.clone()),
        };
        entries.set(
            key,
            CacheSlot::Present(CacheData {
                content: snapshot.content,
                md5: snapshot.fingerprint,
                last_modified: snapshot.last_modified,
                confirmed: true,
            }),
        );
        // sent under the lock so events of one key keep their order
        let _ = self.events.send(event);
        true
    }

    fn remove_in(&self, entries: &mut Entries, key: &ConfigKey) -> bool {
        let last_modified = match entries.slot(key) {
            Some(CacheSlot::Present(data)) => data.last_modified,
            Some(CacheSlot::Absent { .. }) => return false,
            None => {
                entries.set(key, CacheSlot::Absent { last_modified: None });
                return false;
            }
        };
        entries.set(
            key,
            CacheSlot::Absent {
                last_modified: Some(last_modified),
            },
        );
        info!(config = %key, "config removed");
        let _ = self.events.send(ChangeEvent::ConfigChanged {
            data_id: key.data_id.clone(),
            group: key.group.clone(),
            content: None,
            fingerprint: None,
        });
        true
    }

    fn lock_entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
