//! 看护者在线状态实体

use serde::{Deserialize, Serialize};

use crate::value_objects::{CellId, GeoPoint, Timestamp, UserId};

/// 可照看的宠物种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Dog,
    Cat,
    Bird,
    SmallAnimal,
    Reptile,
    Fish,
    Other,
}

/// 看护者能力档案（费率、可照看物种、特长）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CapabilityProfile {
    /// 每小时费率，单位：分
    pub hourly_rate_cents: u32,
    #[serde(default)]
    pub species: Vec<Species>,
    #[serde(default)]
    pub specialties: Vec<String>,
}

/// 在线看护者的位置与心跳记录。
///
/// 仅当 `now - last_heartbeat_at < presence_ttl` 时存在于注册表中；
/// 离线即删除，不做原地标记。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitterPresence {
    pub sitter_id: UserId,
    pub location: GeoPoint,
    pub address: Option<String>,
    pub last_heartbeat_at: Timestamp,
    pub online_since: Timestamp,
    pub profile: CapabilityProfile,
}

impl SitterPresence {
    pub fn new(
        sitter_id: UserId,
        location: GeoPoint,
        address: Option<String>,
        profile: CapabilityProfile,
        now: Timestamp,
    ) -> Self {
        Self {
            sitter_id,
            location,
            address,
            last_heartbeat_at: now,
            online_since: now,
            profile,
        }
    }

    pub fn cell(&self, cell_size_degrees: f64) -> CellId {
        CellId::containing(self.location, cell_size_degrees)
    }
}

/// 附近查询的过滤条件，所有字段均为可选
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearbyFilter {
    pub species: Option<Species>,
    pub max_hourly_rate_cents: Option<u32>,
    pub specialty: Option<String>,
}

impl NearbyFilter {
    pub fn matches(&self, profile: &CapabilityProfile) -> bool {
        if let Some(species) = self.species {
            if !profile.species.contains(&species) {
                return false;
            }
        }
        if let Some(max_rate) = self.max_hourly_rate_cents {
            if profile.hourly_rate_cents > max_rate {
                return false;
            }
        }
        if let Some(specialty) = &self.specialty {
            let wanted = specialty.trim();
            if !profile
                .specialties
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(wanted))
            {
                return false;
            }
        }
        true
    }
}

/// 附近查询的单条结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbySitter {
    #[serde(flatten)]
    pub presence: SitterPresence,
    pub distance_meters: f64,
}

/// 看护者离开某个网格单元的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// 移动到了其他单元（仍在线）
    MovedAway,
    /// 主动下线
    WentOffline,
    /// 心跳超时被清理
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PresenceChange {
    /// 在该单元中出现（首次上线或从其他单元移入）
    Online { presence: SitterPresence },
    /// 仍在该单元内，位置或档案更新
    Moved { presence: SitterPresence },
    /// 从该单元中消失
    Offline { reason: OfflineReason },
}

/// 发布到 `presence.geo:<cell>` 的在线状态增量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub sitter_id: UserId,
    pub cell: CellId,
    pub change: PresenceChange,
    pub at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CapabilityProfile {
        CapabilityProfile {
            hourly_rate_cents: 1_500,
            species: vec![Species::Dog, Species::Cat],
            specialties: vec!["Senior pets".into(), "medication".into()],
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(NearbyFilter::default().matches(&profile()));
    }

    #[test]
    fn filter_by_species_rate_and_specialty() {
        let p = profile();

        let dogs = NearbyFilter {
            species: Some(Species::Dog),
            ..Default::default()
        };
        assert!(dogs.matches(&p));

        let birds = NearbyFilter {
            species: Some(Species::Bird),
            ..Default::default()
        };
        assert!(!birds.matches(&p));

        let cheap = NearbyFilter {
            max_hourly_rate_cents: Some(1_000),
            ..Default::default()
        };
        assert!(!cheap.matches(&p));

        let meds = NearbyFilter {
            specialty: Some(" Medication ".into()),
            ..Default::default()
        };
        assert!(meds.matches(&p));
    }
}
