use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{
    CapabilityProfile, CellId, DomainError, GeoPoint, NearbyFilter, NearbySitter, OfflineReason,
    PresenceChange, PresenceDelta, SitterPresence, Timestamp, UserId,
};

use crate::clock::Clock;
use crate::geo_index::GeoIndex;

/// 在线状态注册表参数
#[derive(Debug, Clone)]
pub struct PresenceSettings {
    /// 心跳最大年龄，超过即视为离线
    pub ttl: Duration,
    pub cell_size_degrees: f64,
    pub max_radius_meters: f64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            cell_size_degrees: 0.05,
            max_radius_meters: 50_000.0,
        }
    }
}

/// 在线看护者的权威内存表，并维护网格索引。
///
/// 每个看护者一个分片锁（DashMap），互不相关的看护者之间不会竞争。
/// 所有方法只修改内存并返回需要推送的增量，由调用方在锁释放后再通知。
pub struct PresenceRegistry {
    entries: DashMap<UserId, SitterPresence>,
    index: GeoIndex,
    settings: PresenceSettings,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl PresenceRegistry {
    pub fn new(settings: PresenceSettings, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(settings.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        Self {
            entries: DashMap::new(),
            index: GeoIndex::new(),
            settings,
            ttl,
            clock,
        }
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    fn is_expired(&self, presence: &SitterPresence, now: Timestamp) -> bool {
        now - presence.last_heartbeat_at >= self.ttl
    }

    fn cell_of(&self, location: GeoPoint) -> CellId {
        CellId::containing(location, self.settings.cell_size_degrees)
    }

    /// 写入或更新位置，刷新心跳并重建索引
    pub fn update_location(
        &self,
        sitter_id: UserId,
        location: GeoPoint,
        address: Option<String>,
        profile: CapabilityProfile,
    ) -> Vec<PresenceDelta> {
        let now = self.clock.now();
        let new_cell = self.cell_of(location);
        let mut deltas = Vec::with_capacity(2);

        match self.entries.entry(sitter_id) {
            Entry::Occupied(mut occupied) => {
                let revived = self.is_expired(occupied.get(), now);
                let old_cell = self.cell_of(occupied.get().location);

                let presence = occupied.get_mut();
                presence.location = location;
                presence.address = address;
                presence.profile = profile;
                presence.last_heartbeat_at = now;
                if revived {
                    presence.online_since = now;
                }
                let snapshot = presence.clone();

                if old_cell != new_cell {
                    self.index.relocate(sitter_id, old_cell, new_cell);
                    if !revived {
                        deltas.push(delta(sitter_id, old_cell, offline(OfflineReason::MovedAway), now));
                    }
                    deltas.push(delta(
                        sitter_id,
                        new_cell,
                        PresenceChange::Online { presence: snapshot },
                        now,
                    ));
                } else if revived {
                    deltas.push(delta(
                        sitter_id,
                        new_cell,
                        PresenceChange::Online { presence: snapshot },
                        now,
                    ));
                } else {
                    deltas.push(delta(
                        sitter_id,
                        new_cell,
                        PresenceChange::Moved { presence: snapshot },
                        now,
                    ));
                }
            }
            Entry::Vacant(vacant) => {
                let presence = SitterPresence::new(sitter_id, location, address, profile, now);
                self.index.insert(new_cell, sitter_id);
                vacant.insert(presence.clone());
                deltas.push(delta(sitter_id, new_cell, PresenceChange::Online { presence }, now));
            }
        }

        deltas
    }

    /// 显式上线/下线。
    ///
    /// 下线立即删除条目；上线只刷新已知条目的心跳，没有已知位置时返回
    /// [`DomainError::PresenceNotFound`]，调用方需要改走 [`Self::update_location`]。
    pub fn set_online(
        &self,
        sitter_id: UserId,
        online: bool,
    ) -> Result<Vec<PresenceDelta>, DomainError> {
        let now = self.clock.now();

        if !online {
            return Ok(self
                .remove_if(sitter_id, OfflineReason::WentOffline, |_| true)
                .into_iter()
                .collect());
        }

        match self.entries.get_mut(&sitter_id) {
            Some(mut presence) => {
                let revived = self.is_expired(&presence, now);
                presence.last_heartbeat_at = now;
                if revived {
                    presence.online_since = now;
                    let cell = self.cell_of(presence.location);
                    let snapshot = presence.clone();
                    return Ok(vec![delta(
                        sitter_id,
                        cell,
                        PresenceChange::Online { presence: snapshot },
                        now,
                    )]);
                }
                Ok(Vec::new())
            }
            None => Err(DomainError::PresenceNotFound),
        }
    }

    /// 当前在线记录；过期但尚未被清理的条目视为不存在
    pub fn get(&self, sitter_id: UserId) -> Option<SitterPresence> {
        let now = self.clock.now();
        self.entries
            .get(&sitter_id)
            .filter(|presence| !self.is_expired(presence, now))
            .map(|presence| presence.clone())
    }

    pub fn is_online(&self, sitter_id: UserId) -> bool {
        self.get(sitter_id).is_some()
    }

    pub fn online_count(&self) -> usize {
        self.entries.len()
    }

    /// 半径内的看护者，按距离升序，距离相同按 ID 排序。
    ///
    /// 每次调用都是一次全新的快照查询，不保留游标状态。
    pub fn query_nearby(
        &self,
        center: GeoPoint,
        radius_meters: f64,
        filter: &NearbyFilter,
    ) -> Result<Vec<NearbySitter>, DomainError> {
        if !radius_meters.is_finite() || radius_meters <= 0.0 {
            return Err(DomainError::invalid_argument("radius", "must be positive"));
        }
        if radius_meters > self.settings.max_radius_meters {
            return Err(DomainError::invalid_argument(
                "radius",
                format!("must not exceed {} meters", self.settings.max_radius_meters),
            ));
        }

        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for cell in CellId::covering(center, radius_meters, self.settings.cell_size_degrees) {
            // 先拿到单元成员快照并释放索引锁，再逐个读取注册表
            for sitter_id in self.index.members(cell) {
                if !seen.insert(sitter_id) {
                    continue;
                }
                let Some(presence) = self.entries.get(&sitter_id) else {
                    continue;
                };
                if self.is_expired(&presence, now) || !filter.matches(&presence.profile) {
                    continue;
                }
                let distance_meters = center.distance_meters(&presence.location);
                if distance_meters <= radius_meters {
                    results.push(NearbySitter {
                        presence: presence.clone(),
                        distance_meters,
                    });
                }
            }
        }

        results.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.presence.sitter_id.cmp(&b.presence.sitter_id))
        });
        Ok(results)
    }

    /// 清理所有心跳超时的条目，每次只持有被清理条目的锁
    pub fn sweep_expired(&self) -> Vec<PresenceDelta> {
        let now = self.clock.now();
        let expired: Vec<UserId> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|sitter_id| {
                self.remove_if(sitter_id, OfflineReason::Expired, |presence| {
                    self.is_expired(presence, now)
                })
            })
            .collect()
    }

    fn remove_if(
        &self,
        sitter_id: UserId,
        reason: OfflineReason,
        predicate: impl FnOnce(&SitterPresence) -> bool,
    ) -> Option<PresenceDelta> {
        match self.entries.entry(sitter_id) {
            Entry::Occupied(occupied) if predicate(occupied.get()) => {
                let cell = self.cell_of(occupied.get().location);
                self.index.remove(cell, sitter_id);
                occupied.remove();
                tracing::info!(sitter_id = %sitter_id, reason = ?reason, "看护者下线");
                Some(delta(sitter_id, cell, offline(reason), self.clock.now()))
            }
            _ => None,
        }
    }
}

fn offline(reason: OfflineReason) -> PresenceChange {
    PresenceChange::Offline { reason }
}

fn delta(sitter_id: UserId, cell: CellId, change: PresenceChange, at: Timestamp) -> PresenceDelta {
    PresenceDelta {
        sitter_id,
        cell,
        change,
        at,
    }
}
