use std::sync::Arc;

use domain::{
    CapabilityProfile, DomainError, GeoPoint, NearbyFilter, NearbySitter, PresenceChange,
    PresenceDelta, RealtimeEvent, SitterPresence, Topic, UserId,
};

use crate::{broker::DeliveryBroker, presence::PresenceRegistry};

/// 在线状态用例：修改注册表，然后把增量发布到对应的网格主题
#[derive(Clone)]
pub struct PresenceService {
    registry: Arc<PresenceRegistry>,
    broker: DeliveryBroker,
}

impl PresenceService {
    pub fn new(registry: Arc<PresenceRegistry>, broker: DeliveryBroker) -> Self {
        Self { registry, broker }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// 更新位置并推送增量，返回写入后的记录
    pub fn update_location(
        &self,
        sitter_id: UserId,
        location: GeoPoint,
        address: Option<String>,
        profile: CapabilityProfile,
    ) -> Result<SitterPresence, DomainError> {
        let deltas = self
            .registry
            .update_location(sitter_id, location, address, profile);
        let presence = deltas.iter().rev().find_map(|delta| match &delta.change {
            PresenceChange::Online { presence } | PresenceChange::Moved { presence } => {
                Some(presence.clone())
            }
            PresenceChange::Offline { .. } => None,
        });
        self.publish(deltas);
        presence.ok_or(DomainError::PresenceNotFound)
    }

    pub fn set_online(&self, sitter_id: UserId, online: bool) -> Result<(), DomainError> {
        let deltas = self.registry.set_online(sitter_id, online)?;
        self.publish(deltas);
        Ok(())
    }

    pub fn query_nearby(
        &self,
        center: GeoPoint,
        radius_meters: f64,
        filter: &NearbyFilter,
    ) -> Result<Vec<NearbySitter>, DomainError> {
        self.registry.query_nearby(center, radius_meters, filter)
    }

    pub fn get(&self, sitter_id: UserId) -> Option<SitterPresence> {
        self.registry.get(sitter_id)
    }

    /// 清理过期条目并推送下线事件，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let deltas = self.registry.sweep_expired();
        let evicted = deltas.len();
        self.publish(deltas);
        evicted
    }

    fn publish(&self, deltas: Vec<PresenceDelta>) {
        for delta in deltas {
            let topic = Topic::GeoCell(delta.cell);
            self.broker.publish(&topic, RealtimeEvent::Presence { delta });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::PresenceSettings;
    use domain::CellId;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn deltas_are_published_on_cell_topics() {
        let clock = Arc::new(ManualClock::default());
        let settings = PresenceSettings::default();
        let cell_size = settings.cell_size_degrees;
        let registry = Arc::new(PresenceRegistry::new(settings, clock.clone()));
        let broker = DeliveryBroker::new(16);
        let service = PresenceService::new(registry, broker.clone());

        let location = GeoPoint::new(14.6, 120.9).unwrap();
        let cell = CellId::containing(location, cell_size);
        let mut watcher = broker.open_session(UserId::from(Uuid::new_v4()));
        watcher.subscribe(Topic::GeoCell(cell));

        let sitter = UserId::from(Uuid::new_v4());
        let stored = service
            .update_location(sitter, location, Some("Makati".into()), CapabilityProfile::default())
            .unwrap();
        assert_eq!(stored.address.as_deref(), Some("Makati"));
        let event = watcher.try_recv().unwrap();
        assert!(matches!(
            event.event.as_ref(),
            RealtimeEvent::Presence { delta } if matches!(delta.change, PresenceChange::Online { .. })
        ));

        clock.advance(Duration::from_secs(61));
        assert_eq!(service.sweep_expired(), 1);
        assert!(matches!(
            watcher.try_recv().unwrap().event.as_ref(),
            RealtimeEvent::Presence { delta } if matches!(delta.change, PresenceChange::Offline { .. })
        ));
        assert!(service.get(sitter).is_none());
    }
}
