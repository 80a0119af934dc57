//! Value types shared by every layer of the canvas.
//!
//! Positions and colors can only be built through their validating
//! constructors (or through serde, which routes through the same checks),
//! so a `Position` or `Color` in hand is always in range.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Number of columns on the canvas.
pub const GRID_WIDTH: u16 = 1024;
/// Number of rows on the canvas.
pub const GRID_HEIGHT: u16 = 1024;
/// Number of palette entries; colors are indices `0..PALETTE_SIZE`.
pub const PALETTE_SIZE: u8 = 16;

// ───────────────────────────────────────────────────────────────────
// Position / Color
// ───────────────────────────────────────────────────────────────────

/// A cell coordinate, `0 ≤ x < GRID_WIDTH`, `0 ≤ y < GRID_HEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PositionRepr", into = "PositionRepr")]
pub struct Position {
    x: u16,
    y: u16,
}

#[derive(Serialize, Deserialize)]
struct PositionRepr {
    x: i64,
    y: i64,
}

impl Position {
    /// Build a position, returning `None` when either axis is off the grid.
    pub fn new(x: i64, y: i64) -> Option<Self> {
        let in_x = (0..GRID_WIDTH as i64).contains(&x);
        let in_y = (0..GRID_HEIGHT as i64).contains(&y);
        (in_x && in_y).then(|| Self {
            x: x as u16,
            y: y as u16,
        })
    }

    pub fn x(&self) -> u16 {
        self.x
    }

    pub fn y(&self) -> u16 {
        self.y
    }

    /// Big-endian `(y, x)` key; sorts in row-major order.
    pub fn to_key(&self) -> [u8; 4] {
        let mut key = [0u8; 4];
        key[..2].copy_from_slice(&self.y.to_be_bytes());
        key[2..].copy_from_slice(&self.x.to_be_bytes());
        key
    }

    /// Inverse of [`Position::to_key`].
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 4 {
            return None;
        }
        let y = u16::from_be_bytes([key[0], key[1]]);
        let x = u16::from_be_bytes([key[2], key[3]]);
        Self::new(x as i64, y as i64)
    }
}

impl TryFrom<PositionRepr> for Position {
    type Error = String;

    fn try_from(repr: PositionRepr) -> Result<Self, Self::Error> {
        Position::new(repr.x, repr.y)
            .ok_or_else(|| format!("position ({}, {}) is off the grid", repr.x, repr.y))
    }
}

impl From<Position> for PositionRepr {
    fn from(p: Position) -> Self {
        Self {
            x: p.x as i64,
            y: p.y as i64,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A palette index, `0 ≤ color < PALETTE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Color(u8);

impl Color {
    pub fn new(value: i64) -> Option<Self> {
        (0..PALETTE_SIZE as i64)
            .contains(&value)
            .then_some(Self(value as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Color {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Color::new(value).ok_or_else(|| format!("color {value} is outside the palette"))
    }
}

impl From<Color> for i64 {
    fn from(c: Color) -> Self {
        c.0 as i64
    }
}

// ───────────────────────────────────────────────────────────────────
// Timestamp
// ───────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Parse either a decimal millisecond count or an RFC 3339 string.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(millis) = trimmed.parse::<i64>() {
            return Some(Self(millis));
        }
        DateTime::parse_from_rfc3339(trimmed)
            .ok()
            .map(|dt| Self(dt.timestamp_millis()))
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Time remaining until `self`, zero if already past.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn to_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Opaque per-client token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(Uuid);

impl IdentityId {
    /// Fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(token: &str) -> Option<Self> {
        Uuid::parse_str(token.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persisted identity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    /// `None` until the identity's first successful placement.
    pub next_allowed_at: Option<Timestamp>,
}

/// Announced to subscribers when an identity is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCreatedRecord {
    pub id: IdentityId,
}

// ───────────────────────────────────────────────────────────────────
// Cells and change records
// ───────────────────────────────────────────────────────────────────

/// Current state of one grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub position: Position,
    pub color: Color,
    pub placed_at: Timestamp,
}

/// One committed placement, as appended to the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Feed sequence number; strictly increasing in commit order.
    pub sequence: u64,
    pub position: Position,
    pub color: Color,
    pub placed_at: Timestamp,
}

impl ChangeRecord {
    pub fn cell(&self) -> Cell {
        Cell {
            position: self.position,
            color: self.color,
            placed_at: self.placed_at,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Scalar request operand
// ───────────────────────────────────────────────────────────────────

/// A numeric request field as received from a caller.
///
/// Deserializes from any JSON value: whole numbers become `Integer`,
/// everything else becomes `NotInteger` carrying a short description of what
/// was received. Rejection happens during validation, not decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Integer(i64),
    NotInteger(String),
}

impl Scalar {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Scalar::Integer(v) => Some(*v),
            Scalar::NotInteger(_) => None,
        }
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Scalar::NotInteger("missing".into())
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Integer(v)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Integer(v) => write!(f, "{v}"),
            Scalar::NotInteger(desc) => f.write_str(desc),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Integer(v) => serializer.serialize_i64(*v),
            Scalar::NotInteger(desc) => serializer.serialize_str(desc),
        }
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
        Ok(Scalar::NotInteger(format!("boolean {v}")))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
        Ok(Scalar::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
        // Too large for i64 is still an integer; range checks reject it later.
        Ok(Scalar::Integer(i64::try_from(v).unwrap_or(i64::MAX)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
        if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Ok(Scalar::Integer(v as i64))
        } else {
            Ok(Scalar::NotInteger(format!("number {v}")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
        Ok(Scalar::NotInteger(format!("string {v:?}")))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::NotInteger("null".into()))
    }

    fn visit_none<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::NotInteger("null".into()))
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Scalar, D::Error> {
        d.deserialize_any(ScalarVisitor)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Scalar, A::Error> {
        while seq.next_element::<de::IgnoredAny>()?.is_some() {}
        Ok(Scalar::NotInteger("array".into()))
    }

    fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Scalar, A::Error> {
        while map.next_entry::<de::IgnoredAny, de::IgnoredAny>()?.is_some() {}
        Ok(Scalar::NotInteger("object".into()))
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}
