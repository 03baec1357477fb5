use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 地球平均半径（米），用于 haversine 距离计算。
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// 每纬度对应的近似米数。
const METERS_PER_DEGREE: f64 = 111_320.0;

/// 用户唯一标识（宠物主人与看护者共用）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// 会话唯一标识。由参与者无序对确定性推导，见 [`crate::Conversation::id_for`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConversationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<ConversationId> for Uuid {
    fn from(value: ConversationId) -> Self {
        value.0
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 客户端提供的幂等键，`(conversation_id, client_nonce)` 唯一。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientNonce(String);

impl ClientNonce {
    pub const MAX_LEN: usize = 128;

    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("client_nonce", "cannot be empty"));
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_argument("client_nonce", "too long"));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// 生成随机 nonce（客户端离线排队时使用）
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientNonce {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientNonce> for String {
    fn from(value: ClientNonce) -> Self {
        value.0
    }
}

/// 消息正文，去除首尾空白后非空且不超过长度上限。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody(String);

impl MessageBody {
    pub fn new(raw: impl Into<String>, max_chars: usize) -> Result<Self, DomainError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("body", "cannot be empty"));
        }
        if trimmed.chars().count() > max_chars {
            return Err(DomainError::invalid_argument(
                "body",
                format!("exceeds {max_chars} characters"),
            ));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// 经纬度坐标（WGS84，单位：度）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, DomainError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::invalid_argument("latitude", "must be within [-90, 90]"));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::invalid_argument(
                "longitude",
                "must be within [-180, 180]",
            ));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// haversine 大圆距离（米）
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }
}

/// 固定大小的经纬度网格单元。
///
/// 单元按 `floor(坐标 / cell_size)` 编号；文本形式为 `"<lat_idx>:<lon_idx>"`，
/// 也是 `presence.geo:<cell>` 主题的后缀。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId {
    pub lat_idx: i32,
    pub lon_idx: i32,
}

impl CellId {
    pub fn new(lat_idx: i32, lon_idx: i32) -> Self {
        Self { lat_idx, lon_idx }
    }

    /// 包含该坐标的单元
    pub fn containing(point: GeoPoint, cell_size_degrees: f64) -> Self {
        Self {
            lat_idx: (point.latitude / cell_size_degrees).floor() as i32,
            lon_idx: (point.longitude / cell_size_degrees).floor() as i32,
        }
    }

    /// 覆盖以 `center` 为圆心、`radius_meters` 为半径的圆的所有单元。
    ///
    /// 结果至少包含圆心所在单元及其 8 个相邻单元，靠近单元边界的查询不会漏掉邻格。
    pub fn covering(center: GeoPoint, radius_meters: f64, cell_size_degrees: f64) -> Vec<CellId> {
        let home = Self::containing(center, cell_size_degrees);

        let lat_delta = radius_meters / METERS_PER_DEGREE;
        let cos_lat = center.latitude.to_radians().cos().abs().max(0.01);
        let lon_delta = radius_meters / (METERS_PER_DEGREE * cos_lat);

        let lat_lo = ((center.latitude - lat_delta) / cell_size_degrees).floor() as i32;
        let lat_hi = ((center.latitude + lat_delta) / cell_size_degrees).floor() as i32;
        let lon_lo = ((center.longitude - lon_delta) / cell_size_degrees).floor() as i32;
        let lon_hi = ((center.longitude + lon_delta) / cell_size_degrees).floor() as i32;

        let lat_range = lat_lo.min(home.lat_idx - 1)..=lat_hi.max(home.lat_idx + 1);
        let lon_range = lon_lo.min(home.lon_idx - 1)..=lon_hi.max(home.lon_idx + 1);

        let mut cells = Vec::new();
        for lat_idx in lat_range {
            for lon_idx in lon_range.clone() {
                cells.push(CellId { lat_idx, lon_idx });
            }
        }
        cells
    }

    /// 单元中心坐标
    pub fn center(&self, cell_size_degrees: f64) -> GeoPoint {
        GeoPoint {
            latitude: (self.lat_idx as f64 + 0.5) * cell_size_degrees,
            longitude: (self.lon_idx as f64 + 0.5) * cell_size_degrees,
        }
    }

    /// 从中心到角点的距离（米），以此半径查询可以覆盖整个单元
    pub fn circumradius_meters(&self, cell_size_degrees: f64) -> f64 {
        let center = self.center(cell_size_degrees);
        let corner = GeoPoint {
            latitude: self.lat_idx as f64 * cell_size_degrees,
            longitude: self.lon_idx as f64 * cell_size_degrees,
        };
        center.distance_meters(&corner)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lat_idx, self.lon_idx)
    }
}

impl FromStr for CellId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(':')
            .ok_or_else(|| DomainError::invalid_argument("cell", "expected <lat>:<lon>"))?;
        let lat_idx = lat
            .parse()
            .map_err(|_| DomainError::invalid_argument("cell", "invalid latitude index"))?;
        let lon_idx = lon
            .parse()
            .map_err(|_| DomainError::invalid_argument("cell", "invalid longitude index"))?;
        Ok(Self { lat_idx, lon_idx })
    }
}

impl Serialize for CellId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CellId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: f64 = 0.05;

    #[test]
    fn geo_point_rejects_out_of_range() {
        assert!(GeoPoint::new(91.0, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -180.5).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(14.6, 120.9).is_ok());
    }

    #[test]
    fn distance_is_roughly_correct() {
        // 马尼拉市区两点，约 1.1km
        let a = GeoPoint::new(14.60, 120.98).unwrap();
        let b = GeoPoint::new(14.61, 120.98).unwrap();
        let d = a.distance_meters(&b);
        assert!((1_100.0..1_120.0).contains(&d), "distance was {d}");
        assert_eq!(a.distance_meters(&a), 0.0);
    }

    #[test]
    fn covering_always_includes_neighbours() {
        let center = GeoPoint::new(14.6, 120.9).unwrap();
        let home = CellId::containing(center, CELL);
        let cells = CellId::covering(center, 10.0, CELL);

        assert_eq!(cells.len(), 9);
        for d_lat in -1..=1 {
            for d_lon in -1..=1 {
                let neighbour = CellId::new(home.lat_idx + d_lat, home.lon_idx + d_lon);
                assert!(cells.contains(&neighbour), "missing {neighbour}");
            }
        }
    }

    #[test]
    fn covering_grows_with_radius() {
        let center = GeoPoint::new(14.6, 120.9).unwrap();
        let small = CellId::covering(center, 1_000.0, CELL);
        let large = CellId::covering(center, 20_000.0, CELL);
        assert!(large.len() > small.len());
    }

    #[test]
    fn cell_id_text_form() {
        let cell = CellId::new(292, -2418);
        assert_eq!(cell.to_string(), "292:-2418");
        assert_eq!("292:-2418".parse::<CellId>().unwrap(), cell);
        assert!("292".parse::<CellId>().is_err());
    }

    #[test]
    fn nonce_and_body_validation() {
        assert!(ClientNonce::new("  ").is_err());
        assert!(ClientNonce::new("x".repeat(129)).is_err());
        assert_eq!(ClientNonce::new(" n1 ").unwrap().as_str(), "n1");

        assert!(MessageBody::new("   ", 10).is_err());
        assert!(MessageBody::new("12345678901", 10).is_err());
        assert_eq!(MessageBody::new(" Hi ", 10).unwrap().as_str(), "Hi");
    }
}
