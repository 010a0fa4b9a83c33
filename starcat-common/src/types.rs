use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-point scale for stored coordinates (units per light year)
pub const FIXED_POINT_SCALE: f64 = 128.0;

/// Convert light years to the stored fixed-point representation
pub fn to_fixed(value: f64) -> i32 {
    (value * FIXED_POINT_SCALE).round() as i32
}

/// Convert a stored fixed-point coordinate back to light years
pub fn from_fixed(value: i32) -> f64 {
    value as f64 / FIXED_POINT_SCALE
}

/// Galactic position in light years (Sol at the origin)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_fixed(x: i32, y: i32, z: i32) -> Self {
        Self::new(from_fixed(x), from_fixed(y), from_fixed(z))
    }

    pub fn to_fixed(&self) -> (i32, i32, i32) {
        (to_fixed(self.x), to_fixed(self.y), to_fixed(self.z))
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// True when every component converts to fixed point without saturating
    pub fn fits_fixed(&self) -> bool {
        let fits = |v: f64| {
            let scaled = (v * FIXED_POINT_SCALE).round();
            scaled >= i32::MIN as f64 && scaled <= i32::MAX as f64
        };
        fits(self.x) && fits(self.y) && fits(self.z)
    }

    pub fn distance_sq(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn distance(&self, other: &Position) -> f64 {
        self.distance_sq(other).sqrt()
    }

    pub fn sub(&self, other: &Position) -> Position {
        Position::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn dot(&self, other: &Position) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Position) -> Position {
        Position::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length(&self) -> f64 {
        self.dot(self).sqrt()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// A star system as stored in the catalog
///
/// Coordinates are fixed-point (see [`FIXED_POINT_SCALE`]) so that merge
/// comparisons are exact integer deltas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemRecord {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub edsm_id: i64,
    pub grid_id: i32,
    pub sector_id: i64,
}

impl SystemRecord {
    pub fn position(&self) -> Position {
        Position::from_fixed(self.x, self.y, self.z)
    }

    pub fn set_position(&mut self, position: &Position) {
        let (x, y, z) = position.to_fixed();
        self.x = x;
        self.y = y;
        self.z = z;
    }

    pub fn distance_to(&self, position: &Position) -> f64 {
        self.position().distance(position)
    }
}

impl std::fmt::Display for SystemRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [edsm {}]", self.name, self.position(), self.edsm_id)
    }
}

/// One point of a bulk position extract, ready for a vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarVertex {
    pub position: [f32; 3],
    /// ARGB colour
    pub color: u32,
}

/// Coordinates block of an EDSM system record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdsmCoords {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl EdsmCoords {
    /// Position in light years, if all three components are present and finite
    pub fn position(&self) -> Option<Position> {
        let position = Position::new(self.x?, self.y?, self.z?);
        position.is_finite().then_some(position)
    }
}

/// One record of the EDSM systems dump
///
/// Unknown fields (`id64`, `coordsLocked`, ...) are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdsmSystemJson {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub coords: Option<EdsmCoords>,
}

impl EdsmSystemJson {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.date.as_deref().and_then(parse_edsm_date)
    }
}

/// Parse an EDSM timestamp ("2015-05-12 15:29:33", or RFC 3339)
pub fn parse_edsm_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Entry of the `states` array in an EDDB record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EddbState {
    #[serde(default)]
    pub name: Option<String>,
}

/// One record of the EDDB populated-systems dump
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EddbSystemJson {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub edsm_id: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub is_populated: Option<bool>,
    #[serde(default)]
    pub population: Option<i64>,
    #[serde(default)]
    pub controlling_minor_faction: Option<String>,
    #[serde(default)]
    pub government: Option<String>,
    #[serde(default)]
    pub allegiance: Option<String>,
    #[serde(default)]
    pub states: Vec<EddbState>,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default)]
    pub primary_economy: Option<String>,
    #[serde(default)]
    pub needs_permit: Option<bool>,
    #[serde(default)]
    pub power: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
}

impl EddbSystemJson {
    /// Name of the first listed state, which is the one the catalog keeps
    pub fn primary_state(&self) -> Option<&str> {
        self.states.first().and_then(|s| s.name.as_deref())
    }
}

/// Enrichment data for a populated system, joined to the catalog by EDSM id
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EddbInfo {
    pub edsm_id: i64,
    pub eddb_id: i64,
    pub updated_at: i64,
    pub population: i64,
    pub faction: Option<String>,
    pub government: Option<String>,
    pub allegiance: Option<String>,
    pub state: Option<String>,
    pub security: Option<String>,
    pub primary_economy: Option<String>,
    pub needs_permit: bool,
    pub power: Option<String>,
    pub power_state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_conversion() {
        assert_eq!(to_fixed(1.0), 128);
        assert_eq!(to_fixed(-25.21875), -3228);
        assert_eq!(from_fixed(64), 0.5);
        assert_eq!(to_fixed(0.0039), 0);
    }

    #[test]
    fn test_edsm_record_ignores_unknown_fields() {
        let json = r#"{"id":27,"id64":10477373803,"name":"Sol","coords":{"x":0,"y":0,"z":0},"coordsLocked":true,"date":"2015-05-12 15:29:33"}"#;
        let record: EdsmSystemJson = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, Some(27));
        assert_eq!(record.name.as_deref(), Some("Sol"));
        assert_eq!(record.coords.as_ref().unwrap().position(), Some(Position::default()));
        let ts = record.timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2015-05-12T15:29:33+00:00");
    }

    #[test]
    fn test_fits_fixed() {
        assert!(Position::new(65000.0, -30000.0, 16_000_000.0).fits_fixed());
        assert!(!Position::new(2.0e7, 0.0, 0.0).fits_fixed());
        assert!(!Position::new(0.0, -2.0e7, 0.0).fits_fixed());
        assert!(!Position::new(f64::NAN, 0.0, 0.0).fits_fixed());
    }

    #[test]
    fn test_coords_missing_component() {
        let coords = EdsmCoords { x: Some(1.0), y: None, z: Some(2.0) };
        assert!(coords.position().is_none());
    }

    #[test]
    fn test_parse_rfc3339_date() {
        let ts = parse_edsm_date("2020-01-02T03:04:05Z").unwrap();
        assert_eq!(ts.timestamp(), 1577934245);
        assert!(parse_edsm_date("yesterday").is_none());
    }

    #[test]
    fn test_eddb_primary_state() {
        let json = r#"{"id":1,"edsm_id":5,"is_populated":true,"states":[{"id":80,"name":"Boom"},{"id":16,"name":"War"}]}"#;
        let record: EddbSystemJson = serde_json::from_str(json).unwrap();
        assert_eq!(record.primary_state(), Some("Boom"));
    }
}
