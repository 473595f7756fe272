//! The player character and its variable map.
//!
//! Identity and rolled traits are fixed once a character is built. The only
//! state that changes during play lives in `Variables`, whose key set is fixed
//! at creation: updates may overwrite existing keys but can never add or
//! remove one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The cultivation ladder, lowest rung first.
pub const REALMS: [&str; 9] = [
    "Qi-Refining",
    "Foundation Establishment",
    "Golden Core",
    "Nascent Soul",
    "Spirit Transformation",
    "Void Refinement",
    "Body Integration",
    "Mahayana",
    "Tribulation Transcendence",
];

/// Every variable a freshly built character carries.
pub const VARIABLE_KEYS: [&str; 10] = [
    "lifespan",
    "realm",
    "renown",
    "sect",
    "charisma",
    "fortune",
    "condition",
    "technique",
    "currency",
    "killing-intent",
];

/// Unique identifier for characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub String);

impl CharacterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CharacterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    #[serde(alias = "男")]
    Male,
    #[serde(alias = "女")]
    Female,
    /// Neither; some cultivators shed gender entirely.
    #[serde(alias = "无相")]
    Formless,
}

impl Gender {
    pub fn name(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::Formless => "Formless",
        }
    }

    /// Parse a user-supplied label.
    pub fn from_label(s: &str) -> Option<Gender> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" | "男" => Some(Gender::Male),
            "female" | "f" | "女" => Some(Gender::Female),
            "formless" | "none" | "无相" => Some(Gender::Formless),
            _ => None,
        }
    }
}

/// Rarity of a rolled trait, ordered from most common to rarest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeGrade {
    #[default]
    #[serde(alias = "凡品")]
    Mortal,
    #[serde(alias = "灵品")]
    Spirit,
    #[serde(alias = "地品")]
    Earth,
    #[serde(alias = "天品", alias = "神品")]
    Heaven,
}

impl AttributeGrade {
    pub fn name(&self) -> &'static str {
        match self {
            AttributeGrade::Mortal => "Mortal",
            AttributeGrade::Spirit => "Spirit",
            AttributeGrade::Earth => "Earth",
            AttributeGrade::Heaven => "Heaven",
        }
    }
}

/// A rolled trait: physique, comprehension or starting relic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeRoll {
    pub name: String,
    pub grade: AttributeGrade,
    pub description: String,
    /// Flavour bonuses, descriptive rather than numeric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonuses: Option<BTreeMap<String, String>>,
}

impl AttributeRoll {
    pub fn new(
        name: impl Into<String>,
        grade: AttributeGrade,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            grade,
            description: description.into(),
            bonuses: None,
        }
    }

    pub fn with_bonus(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bonuses
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// In-world calendar date. All parts start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDate {
    pub year: u32,
    pub month: u32,
    pub day: u32,
}

impl Default for GameDate {
    fn default() -> Self {
        Self {
            year: 1,
            month: 1,
            day: 1,
        }
    }
}

impl fmt::Display for GameDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Year {}, Month {}, Day {}", self.year, self.month, self.day)
    }
}

/// A variable value: text or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Number(Number),
    Text(String),
}

impl VarValue {
    /// Convert a JSON scalar. Booleans, nulls, arrays and objects have no
    /// variable representation.
    pub fn from_json(value: &Value) -> Option<VarValue> {
        match value {
            Value::Number(n) => Some(VarValue::Number(n.clone())),
            Value::String(s) => Some(VarValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<&str> for VarValue {
    fn from(s: &str) -> Self {
        VarValue::Text(s.to_string())
    }
}

impl From<String> for VarValue {
    fn from(s: String) -> Self {
        VarValue::Text(s)
    }
}

impl From<i64> for VarValue {
    fn from(n: i64) -> Self {
        VarValue::Number(n.into())
    }
}

impl From<u32> for VarValue {
    fn from(n: u32) -> Self {
        VarValue::Number(n.into())
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Number(n) => write!(f, "{n}"),
            VarValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// What a merge did with each key of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<String>,
    /// Unknown keys, and known keys whose value was not a string or number.
    pub ignored: Vec<String>,
}

/// The mutable state of a character, keyed by a vocabulary fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, VarValue>);

impl Variables {
    /// The standard vocabulary with starting values for a character of `age`.
    pub fn starting(age: u32) -> Self {
        [
            ("lifespan", VarValue::from(age)),
            ("realm", REALMS[0].into()),
            ("renown", "Unknown".into()),
            ("sect", "None".into()),
            ("charisma", "Ordinary".into()),
            ("fortune", "Average".into()),
            ("condition", "Healthy".into()),
            ("technique", "None".into()),
            ("currency", VarValue::from(0u32)),
            ("killing-intent", "None".into()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Display text for a key, empty when absent.
    pub fn text(&self, key: &str) -> String {
        self.get(key).map(ToString::to_string).unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whitelist merge: overwrite keys that already exist, ignore the rest.
    pub fn merge(&mut self, update: &Map<String, Value>) -> MergeReport {
        let mut report = MergeReport::default();

        for (key, value) in update {
            match (self.0.get_mut(key), VarValue::from_json(value)) {
                (Some(slot), Some(new_value)) => {
                    *slot = new_value;
                    report.applied.push(key.clone());
                }
                _ => report.ignored.push(key.clone()),
            }
        }

        report
    }
}

impl FromIterator<(String, VarValue)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, VarValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A player character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    pub gender: Gender,
    pub race: String,
    /// The Dao the character walks.
    pub path: String,
    pub appearance: String,

    #[serde(alias = "rootBone")]
    pub physique: AttributeRoll,
    #[serde(alias = "talent")]
    pub comprehension: AttributeRoll,
    #[serde(alias = "spiritTreasure")]
    pub relic: AttributeRoll,

    pub variables: Variables,
    #[serde(default)]
    pub inventory: Vec<String>,

    pub location: String,
    #[serde(alias = "currentDate")]
    pub date: GameDate,
}

const LEGACY_REALM_KEY: &str = "境界";

impl Character {
    /// Short description used for save slots, e.g. `"Qi-Refining · Azure Cloud Town"`.
    ///
    /// Characters imported from old saves keep the realm under `境界`.
    pub fn summary(&self) -> String {
        let realm = match self
            .variables
            .get("realm")
            .or_else(|| self.variables.get(LEGACY_REALM_KEY))
        {
            Some(realm) => realm.to_string(),
            None => "Unknown".to_string(),
        };
        format!("{realm} · {}", self.location)
    }
}

/// Apply a parsed state update, returning the updated character.
///
/// Only keys already present in the character's variables are written;
/// anything else is dropped without error.
pub fn apply_state_update(character: &Character, update: &Map<String, Value>) -> Character {
    let mut updated = character.clone();
    let report = updated.variables.merge(update);

    if !report.applied.is_empty() {
        tracing::info!(keys = ?report.applied, "Applied state update");
    }
    if !report.ignored.is_empty() {
        tracing::debug!(keys = ?report.ignored, "Ignored state keys");
    }

    updated
}

/// Assembles a character from already-chosen identity and rolled traits.
#[derive(Debug, Clone)]
pub struct CharacterBuilder {
    name: String,
    gender: Gender,
    race: String,
    path: String,
    appearance: String,
    physique: AttributeRoll,
    comprehension: AttributeRoll,
    relic: AttributeRoll,
    location: String,
    date: GameDate,
    age: u32,
    inventory: Vec<String>,
}

impl CharacterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gender: Gender::default(),
            race: "Human".to_string(),
            path: "Orthodox Dao".to_string(),
            appearance: "Plain features and a steady gaze".to_string(),
            physique: AttributeRoll::new(
                "Mortal Body",
                AttributeGrade::Mortal,
                "The most common constitution, clouded with impurities.",
            ),
            comprehension: AttributeRoll::new(
                "Ordinary Mind",
                AttributeGrade::Mortal,
                "Neither quick nor slow to grasp the Dao.",
            ),
            relic: AttributeRoll::new(
                "Worn Jade Pendant",
                AttributeGrade::Mortal,
                "A keepsake with the faintest trace of spiritual energy.",
            ),
            location: "Azure Cloud Town".to_string(),
            date: GameDate::default(),
            age: 16,
            inventory: Vec::new(),
        }
    }

    pub fn gender(mut self, gender: Gender) -> Self {
        self.gender = gender;
        self
    }

    pub fn race(mut self, race: impl Into<String>) -> Self {
        self.race = race.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn appearance(mut self, appearance: impl Into<String>) -> Self {
        self.appearance = appearance.into();
        self
    }

    pub fn physique(mut self, roll: AttributeRoll) -> Self {
        self.physique = roll;
        self
    }

    pub fn comprehension(mut self, roll: AttributeRoll) -> Self {
        self.comprehension = roll;
        self
    }

    pub fn relic(mut self, roll: AttributeRoll) -> Self {
        self.relic = roll;
        self
    }

    /// Starting region.
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn date(mut self, date: GameDate) -> Self {
        self.date = date;
        self
    }

    /// Age in years; seeds the `lifespan` variable.
    pub fn age(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    pub fn item(mut self, item: impl Into<String>) -> Self {
        self.inventory.push(item.into());
        self
    }

    pub fn build(self) -> Character {
        Character {
            id: CharacterId::new(),
            name: self.name,
            gender: self.gender,
            race: self.race,
            path: self.path,
            appearance: self.appearance,
            physique: self.physique,
            comprehension: self.comprehension,
            relic: self.relic,
            variables: Variables::starting(self.age),
            inventory: self.inventory,
            location: self.location,
            date: self.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_starting_variables() {
        let character = CharacterBuilder::new("Lin Feng").age(18).build();
        let keys: Vec<&str> = character.variables.keys().collect();

        assert_eq!(keys.len(), VARIABLE_KEYS.len());
        for key in VARIABLE_KEYS {
            assert!(character.variables.contains_key(key), "missing {key}");
        }
        assert_eq!(character.variables.get("lifespan"), Some(&VarValue::from(18u32)));
        assert_eq!(character.variables.text("realm"), "Qi-Refining");
        assert_eq!(character.variables.text("currency"), "0");
    }

    #[test]
    fn test_merge_is_whitelisted() {
        let character = CharacterBuilder::new("Lin Feng").build();
        let updated = apply_state_update(
            &character,
            &update(json!({"currency": 150, "realm": "Golden Core", "mana": 9})),
        );

        assert_eq!(updated.variables.text("currency"), "150");
        assert_eq!(updated.variables.text("realm"), "Golden Core");
        assert!(!updated.variables.contains_key("mana"));
        assert_eq!(updated.variables.len(), character.variables.len());
        // The input character is untouched.
        assert_eq!(character.variables.text("currency"), "0");
    }

    #[test]
    fn test_merge_ignores_non_scalars() {
        let mut variables = Variables::starting(16);
        let report = variables.merge(&update(json!({
            "condition": null,
            "sect": ["a"],
            "renown": true,
            "fortune": "Blessed",
        })));

        assert_eq!(report.applied, vec!["fortune".to_string()]);
        assert_eq!(report.ignored.len(), 3);
        assert_eq!(variables.text("condition"), "Healthy");
    }

    #[test]
    fn test_merge_never_changes_key_set() {
        let updates = [
            json!({}),
            json!({"a": 1, "b": 2}),
            json!({"realm": {"nested": true}, "lifespan": 80}),
            json!({"currency": -3.5, "killing-intent": "Faint"}),
        ];
        let original = Variables::starting(20);

        for u in updates {
            let mut variables = original.clone();
            variables.merge(&update(u));
            let before: Vec<&str> = original.keys().collect();
            let after: Vec<&str> = variables.keys().collect();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_summary() {
        let character = CharacterBuilder::new("Lin Feng")
            .location("Misty Peak")
            .build();
        assert_eq!(character.summary(), "Qi-Refining · Misty Peak");
    }

    #[test]
    fn test_grade_ordering() {
        assert!(AttributeGrade::Mortal < AttributeGrade::Spirit);
        assert!(AttributeGrade::Earth < AttributeGrade::Heaven);
    }

    #[test]
    fn test_legacy_character_shape() {
        let legacy = json!({
            "id": "1718000000000",
            "name": "林风",
            "gender": "女",
            "race": "人族",
            "path": "剑修",
            "appearance": "白衣胜雪",
            "rootBone": {"name": "凡俗肉身", "grade": "凡品", "description": "..."},
            "talent": {"name": "过目不忘", "grade": "灵品", "description": "...",
                       "bonuses": {"悟性": "极佳"}},
            "spiritTreasure": {"name": "残破玉佩", "grade": "天品", "description": "..."},
            "variables": {"境界": "炼气期", "灵石": 0},
            "inventory": ["干粮"],
            "location": "青云镇",
            "currentDate": {"year": 1, "month": 1, "day": 1}
        });

        let character: Character = serde_json::from_value(legacy).unwrap();
        assert_eq!(character.gender, Gender::Female);
        assert_eq!(character.physique.grade, AttributeGrade::Mortal);
        assert_eq!(character.comprehension.grade, AttributeGrade::Spirit);
        assert!(character.comprehension.bonuses.is_some());
        assert_eq!(character.relic.grade, AttributeGrade::Heaven);
        assert_eq!(character.date, GameDate::default());
        assert_eq!(character.variables.get("灵石"), Some(&VarValue::from(0i64)));
        assert_eq!(character.summary(), "炼气期 · 青云镇");
    }

    #[test]
    fn test_character_roundtrip() {
        let character = CharacterBuilder::new("Lin Feng")
            .gender(Gender::Formless)
            .relic(AttributeRoll::new("Bronze Mirror", AttributeGrade::Earth, "Reflects the past.")
                .with_bonus("insight", "Sees through illusions"))
            .item("Dry rations")
            .build();

        let json = serde_json::to_string(&character).unwrap();
        let back: Character = serde_json::from_str(&json).unwrap();
        assert_eq!(back, character);
    }
}
