//! Schema-variant detection and canonical-to-literal address translation.
//!
//! The same addon is shipped by different server projects, and each one lays
//! out groups and their items differently. Everything above this module works
//! on canonical group paths; the [`AddressMap`] says where those live in the
//! document at hand.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::item::ItemEncoding;
use crate::scanner::{Document, Key, SpanId, Value};

pub const ROOT_KEY: &str = "TradeSkillMasterDB";
pub const DEFAULT_PROFILE: &str = "Default";

const PROFILES_KEY: &str = "profiles";
const GROUPS_KEY: &str = "groups";
const ITEMS_KEY: &str = "items";
const GROUP_ITEMS_KEY: &str = "groupItems";
const SCOPE_KEYS_KEY: &str = "_scopeKeys";
const SCOPE_PROFILE_KEY: &str = "profile";
const RETAIL_PROFILE_PREFIX: &str = "p@";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// WotLK 3.3.5a TSM2 layout: items as a keyed set inside each group.
    Classic,
    /// Private-server fork: item lists in a sibling `groupItems` container.
    Ascension,
    /// TSM4 scoped-key layout: `p@<profile>@userData@groups`.
    Retail,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classic => "Classic",
            Self::Ascension => "Ascension",
            Self::Retail => "Retail",
        }
    }

    pub fn encoding(&self) -> ItemEncoding {
        match self {
            Self::Classic => ItemEncoding::CompoundDescriptor,
            Self::Ascension => ItemEncoding::BareId,
            Self::Retail => ItemEncoding::PrefixedId,
        }
    }

    pub fn item_shape(&self) -> ItemListShape {
        match self {
            Self::Classic => ItemListShape::KeyedSet,
            Self::Ascension | Self::Retail => ItemListShape::Array,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal key sequence, global name first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<KeyPath> {
        (self.0.len() > 1).then(|| Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn resolve(&self, doc: &Document) -> Option<SpanId> {
        let keys: Vec<&str> = self.0.iter().map(String::as_str).collect();
        doc.lookup(&keys)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemListShape {
    /// `["<encoded>"] = true,`
    KeyedSet,
    /// `"<encoded>", -- [n]` or `<encoded>, -- [n]`
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemListLocation {
    /// A sub-table under `key` inside each group entry.
    InGroup { key: &'static str },
    /// A separate container whose entries are keyed by group path.
    Sibling { container: KeyPath },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxDefault {
    EmptyTable,
    Integer(i64),
}

/// Bookkeeping key the host addon expects next to the group data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxKey {
    pub parent: KeyPath,
    pub key: String,
    pub default: AuxDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMap {
    pub dialect: Dialect,
    pub profile: String,
    pub profiles: Vec<String>,
    pub group_container: KeyPath,
    pub item_list: ItemListLocation,
    pub item_shape: ItemListShape,
    pub encoding: ItemEncoding,
    pub aux: Vec<AuxKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    #[error("unrecognized SavedVariables layout: {0}")]
    Unrecognized(String),
    #[error("profile {requested:?} not found (available: {})", available.join(", "))]
    ProfileNotFound {
        requested: String,
        available: Vec<String>,
    },
}

/// Decides the dialect from structural markers, in priority order.
pub fn classify(doc: &Document) -> Result<Dialect, DialectError> {
    let root = doc
        .lookup(&[ROOT_KEY])
        .ok_or_else(|| DialectError::Unrecognized(format!("no `{ROOT_KEY}` table")))?;

    if doc.entry(root, SCOPE_KEYS_KEY).is_some() {
        return Ok(Dialect::Retail);
    }

    let profiles = doc.child_table(root, PROFILES_KEY).ok_or_else(|| {
        DialectError::Unrecognized(format!(
            "`{ROOT_KEY}` has neither `{SCOPE_KEYS_KEY}` nor `{PROFILES_KEY}`"
        ))
    })?;
    let profile_tables: Vec<SpanId> = doc
        .span(profiles)
        .entries
        .iter()
        .filter_map(|entry| entry.table())
        .collect();

    if profile_tables
        .iter()
        .any(|&p| doc.child_table(p, GROUP_ITEMS_KEY).is_some())
    {
        return Ok(Dialect::Ascension);
    }
    if profile_tables
        .iter()
        .any(|&p| doc.child_table(p, GROUPS_KEY).is_some())
    {
        return Ok(Dialect::Classic);
    }

    Err(DialectError::Unrecognized(format!(
        "no profile under `{ROOT_KEY}.{PROFILES_KEY}` holds a `{GROUPS_KEY}` table"
    )))
}

/// Classifies the document and builds the address map for one profile.
pub fn resolve(doc: &Document, profile: Option<&str>) -> Result<AddressMap, DialectError> {
    let dialect = classify(doc)?;
    let profiles = profile_names(doc, dialect);
    let profile = select_profile(&profiles, profile, dialect)?;
    debug!(dialect = %dialect, profile = %profile, "resolved address map");

    let map = match dialect {
        Dialect::Classic => AddressMap {
            dialect,
            group_container: KeyPath::new([ROOT_KEY, PROFILES_KEY, profile.as_str(), GROUPS_KEY]),
            item_list: ItemListLocation::InGroup { key: ITEMS_KEY },
            item_shape: dialect.item_shape(),
            encoding: dialect.encoding(),
            aux: vec![AuxKey {
                parent: KeyPath::new([ROOT_KEY, PROFILES_KEY, profile.as_str()]),
                key: "groupTreeStatus".to_string(),
                default: AuxDefault::EmptyTable,
            }],
            profiles,
            profile,
        },
        Dialect::Ascension => AddressMap {
            dialect,
            group_container: KeyPath::new([ROOT_KEY, PROFILES_KEY, profile.as_str(), GROUPS_KEY]),
            item_list: ItemListLocation::Sibling {
                container: KeyPath::new([ROOT_KEY, PROFILES_KEY, profile.as_str(), GROUP_ITEMS_KEY]),
            },
            item_shape: dialect.item_shape(),
            encoding: dialect.encoding(),
            aux: vec![AuxKey {
                parent: KeyPath::new([ROOT_KEY, PROFILES_KEY, profile.as_str()]),
                key: "groupItemsVersion".to_string(),
                default: AuxDefault::Integer(2),
            }],
            profiles,
            profile,
        },
        Dialect::Retail => AddressMap {
            dialect,
            group_container: KeyPath::new([
                ROOT_KEY.to_string(),
                retail_key(&profile, "userData", GROUPS_KEY),
            ]),
            item_list: ItemListLocation::InGroup { key: ITEMS_KEY },
            item_shape: dialect.item_shape(),
            encoding: dialect.encoding(),
            aux: vec![AuxKey {
                parent: KeyPath::new([ROOT_KEY]),
                key: retail_key(&profile, "internalData", "groupTreeCollapsedStatus"),
                default: AuxDefault::EmptyTable,
            }],
            profiles,
            profile,
        },
    };

    Ok(map)
}

fn retail_key(profile: &str, scope: &str, name: &str) -> String {
    format!("{RETAIL_PROFILE_PREFIX}{profile}@{scope}@{name}")
}

fn profile_names(doc: &Document, dialect: Dialect) -> Vec<String> {
    let Some(root) = doc.lookup(&[ROOT_KEY]) else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };

    match dialect {
        Dialect::Classic | Dialect::Ascension => {
            if let Some(profiles) = doc.child_table(root, PROFILES_KEY) {
                for entry in &doc.span(profiles).entries {
                    if let (Key::Name(name), Some(_)) = (&entry.key, entry.table()) {
                        push(name);
                    }
                }
            }
        }
        Dialect::Retail => {
            if let Some(scope_profiles) = doc
                .child_table(root, SCOPE_KEYS_KEY)
                .and_then(|scope| doc.child_table(scope, SCOPE_PROFILE_KEY))
            {
                for entry in &doc.span(scope_profiles).entries {
                    if let Value::Str(name) = &entry.value {
                        push(name);
                    }
                }
            }
            for entry in &doc.span(root).entries {
                let Some(rest) = entry
                    .key
                    .as_name()
                    .and_then(|k| k.strip_prefix(RETAIL_PROFILE_PREFIX))
                else {
                    continue;
                };
                if let Some((name, _)) = rest.split_once('@') {
                    push(name);
                }
            }
        }
    }

    names
}

fn select_profile(
    profiles: &[String],
    requested: Option<&str>,
    dialect: Dialect,
) -> Result<String, DialectError> {
    match requested {
        Some(name) if profiles.iter().any(|p| p == name) => Ok(name.to_string()),
        Some(name) => Err(DialectError::ProfileNotFound {
            requested: name.to_string(),
            available: profiles.to_vec(),
        }),
        None if profiles.iter().any(|p| p == DEFAULT_PROFILE) => Ok(DEFAULT_PROFILE.to_string()),
        None => match profiles.first() {
            Some(first) => Ok(first.clone()),
            None if dialect == Dialect::Retail => Ok(DEFAULT_PROFILE.to_string()),
            None => Err(DialectError::Unrecognized("document has no profiles".to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Document {
        Document::scan(text).expect("scan")
    }

    #[test]
    fn scope_keys_marker_wins() {
        let doc = scan(
            "TradeSkillMasterDB = {\n\t[\"_scopeKeys\"] = {\n\t\t[\"profile\"] = {\n\t\t\t\"Main\", -- [1]\n\t\t},\n\t},\n\t[\"profiles\"] = {\n\t\t[\"Default\"] = {\n\t\t\t[\"groups\"] = {\n\t\t\t},\n\t\t},\n\t},\n}\n",
        );
        let map = resolve(&doc, None).expect("resolve");
        assert_eq!(map.dialect, Dialect::Retail);
        assert_eq!(map.profile, "Main");
        assert_eq!(
            map.group_container.to_string(),
            "TradeSkillMasterDB.p@Main@userData@groups"
        );
    }

    #[test]
    fn group_items_marks_ascension() {
        let doc = scan(
            "TradeSkillMasterDB = {\n\t[\"profiles\"] = {\n\t\t[\"Default\"] = {\n\t\t\t[\"groups\"] = {\n\t\t\t},\n\t\t\t[\"groupItems\"] = {\n\t\t\t},\n\t\t},\n\t},\n}\n",
        );
        let map = resolve(&doc, None).expect("resolve");
        assert_eq!(map.dialect, Dialect::Ascension);
        assert_eq!(map.encoding, ItemEncoding::BareId);
        assert!(matches!(map.item_list, ItemListLocation::Sibling { .. }));
    }

    #[test]
    fn plain_groups_marks_classic() {
        let doc = scan(
            "TradeSkillMasterDB = {\n\t[\"profiles\"] = {\n\t\t[\"Alt\"] = {\n\t\t\t[\"groups\"] = {\n\t\t\t},\n\t\t},\n\t},\n}\n",
        );
        let map = resolve(&doc, None).expect("resolve");
        assert_eq!(map.dialect, Dialect::Classic);
        assert_eq!(map.profile, "Alt");
        assert_eq!(map.item_shape, ItemListShape::KeyedSet);
    }

    #[test]
    fn reports_unrecognized_layout() {
        let doc = scan("TradeSkillMasterDB = {\n\t[\"profiles\"] = {\n\t},\n}\n");
        assert!(matches!(classify(&doc), Err(DialectError::Unrecognized(_))));

        let doc = scan("SomethingElseDB = {\n}\n");
        assert!(matches!(classify(&doc), Err(DialectError::Unrecognized(_))));
    }

    #[test]
    fn reports_missing_profile() {
        let doc = scan(
            "TradeSkillMasterDB = {\n\t[\"profiles\"] = {\n\t\t[\"Default\"] = {\n\t\t\t[\"groups\"] = {\n\t\t\t},\n\t\t},\n\t},\n}\n",
        );
        let err = resolve(&doc, Some("Nope")).expect_err("missing profile");
        assert!(matches!(err, DialectError::ProfileNotFound { .. }));
    }
}
