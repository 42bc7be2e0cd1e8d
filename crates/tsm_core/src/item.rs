use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Dialect-independent item identifier (the game's numeric item id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ItemId(NonZeroU32);

impl ItemId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for ItemId {
    type Error = String;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| "item id must be a positive integer".to_string())
    }
}

impl From<ItemId> for u32 {
    fn from(id: ItemId) -> Self {
        id.get()
    }
}

impl FromStr for ItemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid item id {s:?}"))?;
        Self::try_from(raw)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Binding rule reported by the item database for a scraped item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindType {
    None,
    OnPickup,
    OnEquip,
    OnUse,
    Quest,
    Account,
    Warbound,
    Unknown(i32),
}

impl BindType {
    pub const NONE_RAW: i32 = 0;
    pub const ON_PICKUP_RAW: i32 = 1;
    pub const ON_EQUIP_RAW: i32 = 2;
    pub const ON_USE_RAW: i32 = 3;
    pub const QUEST_RAW: i32 = 4;
    pub const ACCOUNT_RAW: i32 = 5;
    pub const WARBOUND_RAW: i32 = 6;

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            Self::NONE_RAW => Self::None,
            Self::ON_PICKUP_RAW => Self::OnPickup,
            Self::ON_EQUIP_RAW => Self::OnEquip,
            Self::ON_USE_RAW => Self::OnUse,
            Self::QUEST_RAW => Self::Quest,
            Self::ACCOUNT_RAW => Self::Account,
            Self::WARBOUND_RAW => Self::Warbound,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(&self) -> i32 {
        match *self {
            Self::None => Self::NONE_RAW,
            Self::OnPickup => Self::ON_PICKUP_RAW,
            Self::OnEquip => Self::ON_EQUIP_RAW,
            Self::OnUse => Self::ON_USE_RAW,
            Self::Quest => Self::QUEST_RAW,
            Self::Account => Self::ACCOUNT_RAW,
            Self::Warbound => Self::WARBOUND_RAW,
            Self::Unknown(other) => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::None => "No Binding",
            Self::OnPickup => "Bind on Pickup",
            Self::OnEquip => "Bind on Equip",
            Self::OnUse => "Bind on Use",
            Self::Quest => "Quest Item",
            Self::Account => "Bind to Account",
            Self::Warbound => "Warbound",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for BindType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Unknown(v) => write!(f, "Unknown ({})", v),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Normalized record handed over by the item-database fetchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub category: String,
    #[serde(default = "unknown_bind", with = "bind_raw")]
    pub bind: BindType,
}

fn unknown_bind() -> BindType {
    BindType::Unknown(-1)
}

mod bind_raw {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::BindType;

    pub fn serialize<S: Serializer>(bind: &BindType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(bind.raw())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BindType, D::Error> {
        i32::deserialize(deserializer).map(BindType::from_raw)
    }
}

/// How an item id is written into a group's item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemEncoding {
    /// `item:12345:0:0:0:0:0:0`
    CompoundDescriptor,
    /// `i:12345`
    PrefixedId,
    /// `12345`
    BareId,
}

const COMPOUND_PREFIX: &str = "item:";
const COMPOUND_ZERO_FIELDS: usize = 6;
const PREFIXED_PREFIX: &str = "i:";

impl ItemEncoding {
    pub fn encode(&self, id: ItemId) -> String {
        match self {
            Self::CompoundDescriptor => {
                let mut out = format!("{COMPOUND_PREFIX}{id}");
                for _ in 0..COMPOUND_ZERO_FIELDS {
                    out.push_str(":0");
                }
                out
            }
            Self::PrefixedId => format!("{PREFIXED_PREFIX}{id}"),
            Self::BareId => id.to_string(),
        }
    }

    /// Decodes only the canonical form; anything else (random suffixes,
    /// battle pets, leading zeros) is not an item this engine owns.
    pub fn decode(&self, raw: &str) -> Option<ItemId> {
        let digits = match self {
            Self::CompoundDescriptor => {
                let fields: Vec<&str> = raw.strip_prefix(COMPOUND_PREFIX)?.split(':').collect();
                if fields.len() != 1 + COMPOUND_ZERO_FIELDS
                    || !fields[1..].iter().all(|field| *field == "0")
                {
                    return None;
                }
                fields[0]
            }
            Self::PrefixedId => raw.strip_prefix(PREFIXED_PREFIX)?,
            Self::BareId => raw,
        };
        if digits.is_empty()
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || digits.starts_with('0')
        {
            return None;
        }
        digits.parse::<u32>().ok().and_then(ItemId::new)
    }
}
