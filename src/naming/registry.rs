use crate::api::error::{Error, Result};
use crate::api::events::{ChangeEvent, InstancesDiff};
use crate::api::naming::{Instance, InstanceKey, ServiceKey, ServiceView};
use crate::common::subscription::EventSender;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Last-known instances per service.
pub(crate) struct InstanceRegistry {
    services: Mutex<HashMap<ServiceKey, ServiceView>>,
    events: EventSender,
}

impl InstanceRegistry {
    pub(crate) fn new(events: EventSender) -> Self {
        InstanceRegistry {
            services: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replace the instances of `key` if `version` is newer than the stored
    /// one, returns whether it was applied.
    pub(crate) fn upsert(&self, key: &ServiceKey, instances: Vec<Instance>, version: u64) -> bool {
        let mut services = self.lock_services();
        let old = match services.get(key) {
            Some(stored) if version <= stored.version => {
                debug!(service = %key, version, stored = stored.version, "stale service view dropped");
                return false;
            }
            Some(stored) => stored.instances.clone(),
            None => Vec::new(),
        };
        let diff = diff(&old, &instances);
        info!(
            service = %key,
            version,
            instances = instances.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "service view updated"
        );
        services.insert(
            key.clone(),
            ServiceView {
                service_name: key.service_name.clone(),
                group: key.group.clone(),
                version,
                instances: instances.clone(),
            },
        );
        // sent under the lock so events of one key keep version order
        let _ = self.events.send(ChangeEvent::InstancesChanged {
            service_name: key.service_name.clone(),
            group: key.group.clone(),
            version,
            instances,
            diff,
        });
        true
    }

    /// The cached view, restricted to `cluster` when given.
    pub(crate) fn get(&self, key: &ServiceKey, cluster: Option<&str>) -> Option<ServiceView> {
        let services = self.lock_services();
        let mut view = services.get(key)?.clone();
        if let Some(cluster) = cluster {
            view.instances.retain(|i| i.cluster_name == cluster);
        }
        Some(view)
    }

    pub(crate) fn select_healthy(&self, key: &ServiceKey) -> Result<Instance> {
        let services = self.lock_services();
        let candidates: Vec<&Instance> = services
            .get(key)
            .map(|view| view.instances.iter().filter(|i| i.is_available()).collect())
            .unwrap_or_default();
        pick_weighted(&candidates)
            .cloned()
            .ok_or_else(|| Error::NoHealthyInstance {
                service_name: key.service_name.clone(),
                group: key.group.clone(),
            })
    }

    fn lock_services(&self) -> MutexGuard<'_, HashMap<ServiceKey, ServiceView>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Weighted random pick. Non-positive weights count as zero; when every
/// weight is zero the pick is uniform.
pub(crate) fn pick_weighted<'a>(candidates: &[&'a Instance]) -> Option<&'a Instance> {
    if candidates.is_empty() {
        return None;
    }
    let total: f64 = candidates.iter().map(|i| i.weight.max(0.0)).sum();
    if total <= 0.0 {
        return Some(candidates[fastrand::usize(..candidates.len())]);
    }
    let mut point = fastrand::f64() * total;
    for candidate in candidates.iter().copied() {
        let weight = candidate.weight.max(0.0);
        if point < weight {
            return Some(candidate);
        }
        point -= weight;
    }
    candidates.iter().rev().find(|i| i.weight > 0.0).copied()
}

fn diff(old: &[Instance], new: &[Instance]) -> InstancesDiff {
    let old_by_key: HashMap<InstanceKey, &Instance> = old.iter().map(|i| (i.key(), i)).collect();
    let new_by_key: HashMap<InstanceKey, &Instance> = new.iter().map(|i| (i.key(), i)).collect();
    let mut diff = InstancesDiff::default();
    for instance in new {
        match old_by_key.get(&instance.key()) {
            None => diff.added.push(instance.clone()),
            Some(previous) if *previous != instance => diff.modified.push(instance.clone()),
            Some(_) => {}
        }
    }
    for instance in old {
        if !new_by_key.contains_key(&instance.key()) {
            diff.removed.push(instance.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::constants::DEFAULT_GROUP;
    use tokio::sync::mpsc;

    fn registry() -> (InstanceRegistry, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InstanceRegistry::new(tx), rx)
    }

    fn service() -> ServiceKey {
        ServiceKey::new("demo-svc1", DEFAULT_GROUP)
    }

    #[test]
    fn test_upsert_keeps_the_highest_version() {
        let (registry, mut events) = registry();
        let key = service();
        for (version, port) in [(3, 3), (1, 1), (5, 5), (5, 6), (4, 4)] {
            registry.upsert(&key, vec![Instance::new("10.0.0.1", port)], version);
        }
        let view = registry.get(&key, None).unwrap();
        assert_eq!(view.version, 5);
        assert_eq!(view.instances[0].port, 5);

        let mut applied = Vec::new();
        while let Ok(ChangeEvent::InstancesChanged { version, .. }) = events.try_recv() {
            applied.push(version);
        }
        assert_eq!(applied, vec![3, 5]);
    }

    #[test]
    fn test_upsert_reports_diff() {
        let (registry, mut events) = registry();
        let key = service();
        let a = Instance::new("10.0.0.1", 80);
        let b = Instance::new("10.0.0.2", 80);
        registry.upsert(&key, vec![a.clone(), b.clone()], 1);
        let _ = events.try_recv();

        let c = Instance::new("10.0.0.3", 80);
        registry.upsert(&key, vec![a.clone().healthy(false), c.clone()], 2);
        match events.try_recv().unwrap() {
            ChangeEvent::InstancesChanged { diff, instances, .. } => {
                assert_eq!(instances.len(), 2);
                assert_eq!(diff.added, vec![c]);
                assert_eq!(diff.removed, vec![b]);
                assert_eq!(diff.modified, vec![a.healthy(false)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_select_healthy_skips_unavailable() {
        let (registry, _events) = registry();
        let key = service();
        registry.upsert(
            &key,
            vec![
                Instance::new("10.0.0.1", 80).healthy(false),
                Instance::new("10.0.0.2", 80).enabled(false),
                Instance::new("10.0.0.3", 80),
            ],
            1,
        );
        for _ in 0..100 {
            assert_eq!(registry.select_healthy(&key).unwrap().ip, "10.0.0.3");
        }
    }

    #[test]
    fn test_select_healthy_without_candidates() {
        let (registry, _events) = registry();
        let key = service();
        assert!(matches!(
            registry.select_healthy(&key),
            Err(Error::NoHealthyInstance { .. })
        ));
        registry.upsert(&key, vec![Instance::new("10.0.0.1", 80).healthy(false)], 1);
        assert!(matches!(
            registry.select_healthy(&key),
            Err(Error::NoHealthyInstance { .. })
        ));
    }

    #[test]
    fn test_get_filters_cluster() {
        let (registry, _events) = registry();
        let key = service();
        registry.upsert(
            &key,
            vec![
                Instance::new("10.0.0.1", 80),
                Instance::new("10.0.0.2", 80).cluster("EDGE"),
            ],
            1,
        );
        let edge = registry.get(&key, Some("EDGE")).unwrap();
        assert_eq!(edge.instances.len(), 1);
        assert_eq!(edge.version, 1);
        assert!(registry.get(&ServiceKey::new("other", DEFAULT_GROUP), None).is_none());
    }

    #[test]
    fn test_pick_weighted_follows_weights() {
        let heavy = Instance::new("10.0.0.1", 80).weight(100.0);
        let light = Instance::new("10.0.0.2", 80).weight(1.0);
        let zero = Instance::new("10.0.0.3", 80).weight(0.0);
        let candidates = vec![&heavy, &light, &zero];
        let mut heavy_hits = 0;
        for _ in 0..1000 {
            let picked = pick_weighted(&candidates).unwrap();
            assert_ne!(picked.ip, "10.0.0.3");
            if picked.ip == "10.0.0.1" {
                heavy_hits += 1;
            }
        }
        assert!(heavy_hits > 900, "heavy picked {} times", heavy_hits);

        let zeros = vec![&zero];
        assert_eq!(pick_weighted(&zeros).unwrap().ip, "10.0.0.3");
    }
}
