//! Typed, named, observable parameter cells.
//!
//! Every user-visible setting is one of these, collected into registries at
//! the global, per-port, and per-channel levels. Items own their parse /
//! format / validate logic so the command parser can stay completely
//! generic. Lookups are case-insensitive; canonical display casing is kept
//! for responses.

use std::collections::BTreeMap;

/// When an item refuses mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    None,
    /// Cannot change while the board is running.
    WhileRunning,
    /// Reported but never settable from the command surface.
    ReadOnly,
}

#[derive(Debug, Clone)]
pub enum ItemKind {
    Bool { value: bool },
    Int { value: i64, min: i64, max: i64 },
    Double { value: f64, min: f64, max: f64, step: f64 },
    /// Doubles constrained to a fixed set (sample rate, stim step size).
    DiscreteDouble { value: f64, allowed: Vec<f64> },
    Enum { index: usize, variants: Vec<&'static str> },
    Text { value: String },
}

#[derive(Debug, Clone)]
pub struct StateItem {
    name: String,
    kind: ItemKind,
    restriction: Restriction,
}

/// Outcome of a set: either the stored value changed (or was re-set to the
/// same thing), or the candidate was rejected with a human-readable
/// description of the acceptable values.
pub type SetResult = Result<bool, String>;

impl StateItem {
    pub fn bool_item(name: &str, value: bool) -> StateItem {
        StateItem { name: name.to_owned(), kind: ItemKind::Bool { value }, restriction: Restriction::None }
    }

    pub fn int_item(name: &str, value: i64, min: i64, max: i64) -> StateItem {
        StateItem {
            name: name.to_owned(),
            kind: ItemKind::Int { value, min, max },
            restriction: Restriction::None,
        }
    }

    pub fn double_item(name: &str, value: f64, min: f64, max: f64, step: f64) -> StateItem {
        StateItem {
            name: name.to_owned(),
            kind: ItemKind::Double { value, min, max, step },
            restriction: Restriction::None,
        }
    }

    pub fn discrete_double_item(name: &str, value: f64, allowed: Vec<f64>) -> StateItem {
        StateItem {
            name: name.to_owned(),
            kind: ItemKind::DiscreteDouble { value, allowed },
            restriction: Restriction::None,
        }
    }

    pub fn enum_item(name: &str, index: usize, variants: Vec<&'static str>) -> StateItem {
        assert!(index < variants.len());
        StateItem {
            name: name.to_owned(),
            kind: ItemKind::Enum { index, variants },
            restriction: Restriction::None,
        }
    }

    pub fn text_item(name: &str, value: &str) -> StateItem {
        StateItem {
            name: name.to_owned(),
            kind: ItemKind::Text { value: value.to_owned() },
            restriction: Restriction::None,
        }
    }

    pub fn restricted_while_running(mut self) -> StateItem {
        self.restriction = Restriction::WhileRunning;
        self
    }

    pub fn read_only(mut self) -> StateItem {
        self.restriction = Restriction::ReadOnly;
        self
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn restriction(&self) -> Restriction { self.restriction }

    /// True when the item cannot be set in the given run state.
    pub fn is_restricted(&self, running: bool) -> bool {
        match self.restriction {
            Restriction::None => false,
            Restriction::WhileRunning => running,
            Restriction::ReadOnly => true,
        }
    }

    pub fn restrict_message(&self) -> String {
        match self.restriction {
            Restriction::ReadOnly => format!("{} is read only", self.name),
            _ => format!("{} cannot be set while the board is running", self.name),
        }
    }

    /// Parse and store `text`. All-or-nothing: on rejection the stored value
    /// is untouched and the error describes the acceptable values.
    pub fn set_from_str(&mut self, text: &str) -> SetResult {
        let text = text.trim();
        match &mut self.kind {
            ItemKind::Bool { value } => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => {
                    let changed = !*value;
                    *value = true;
                    Ok(changed)
                }
                "false" | "0" => {
                    let changed = *value;
                    *value = false;
                    Ok(changed)
                }
                _ => Err("True or False".to_owned()),
            },
            ItemKind::Int { value, min, max } => {
                let parsed: i64 =
                    text.parse().map_err(|_| format!("integer between {} and {}", min, max))?;
                if parsed < *min || parsed > *max {
                    return Err(format!("integer between {} and {}", min, max));
                }
                let changed = *value != parsed;
                *value = parsed;
                Ok(changed)
            }
            ItemKind::Double { value, min, max, .. } => {
                let parsed: f64 =
                    text.parse().map_err(|_| format!("number between {} and {}", min, max))?;
                if !parsed.is_finite() || parsed < *min || parsed > *max {
                    return Err(format!("number between {} and {}", min, max));
                }
                let changed = *value != parsed;
                *value = parsed;
                Ok(changed)
            }
            ItemKind::DiscreteDouble { value, allowed } => {
                let parsed: f64 = text.parse().map_err(|_| list_of_doubles(allowed))?;
                let matched = allowed.iter().find(|&&a| (a - parsed).abs() < 1e-6);
                match matched {
                    Some(&a) => {
                        let changed = *value != a;
                        *value = a;
                        Ok(changed)
                    }
                    None => Err(list_of_doubles(allowed)),
                }
            }
            ItemKind::Enum { index, variants } => {
                let found = variants.iter().position(|v| v.eq_ignore_ascii_case(text));
                match found {
                    Some(i) => {
                        let changed = *index != i;
                        *index = i;
                        Ok(changed)
                    }
                    None => Err(variants.join(", ")),
                }
            }
            ItemKind::Text { value } => {
                let changed = value != text;
                *value = text.to_owned();
                Ok(changed)
            }
        }
    }

    /// Canonical string form; round-trips through `set_from_str`.
    pub fn value_string(&self) -> String {
        match &self.kind {
            ItemKind::Bool { value } => if *value { "True".into() } else { "False".into() },
            ItemKind::Int { value, .. } => value.to_string(),
            ItemKind::Double { value, .. } | ItemKind::DiscreteDouble { value, .. } => {
                format_double(*value)
            }
            ItemKind::Enum { index, variants } => variants[*index].to_owned(),
            ItemKind::Text { value } => value.clone(),
        }
    }

    pub fn valid_values(&self) -> String {
        match &self.kind {
            ItemKind::Bool { .. } => "True or False".to_owned(),
            ItemKind::Int { min, max, .. } => format!("integer between {} and {}", min, max),
            ItemKind::Double { min, max, .. } => format!("number between {} and {}", min, max),
            ItemKind::DiscreteDouble { allowed, .. } => list_of_doubles(allowed),
            ItemKind::Enum { variants, .. } => variants.join(", "),
            ItemKind::Text { .. } => "any text".to_owned(),
        }
    }

    pub fn as_bool(&self) -> bool {
        match &self.kind {
            ItemKind::Bool { value } => *value,
            _ => panic!("{} is not a Bool item", self.name),
        }
    }

    pub fn set_bool(&mut self, v: bool) -> bool {
        match &mut self.kind {
            ItemKind::Bool { value } => {
                let changed = *value != v;
                *value = v;
                changed
            }
            _ => panic!("{} is not a Bool item", self.name),
        }
    }

    pub fn as_int(&self) -> i64 {
        match &self.kind {
            ItemKind::Int { value, .. } => *value,
            _ => panic!("{} is not an Int item", self.name),
        }
    }

    pub fn as_double(&self) -> f64 {
        match &self.kind {
            ItemKind::Double { value, .. } | ItemKind::DiscreteDouble { value, .. } => *value,
            _ => panic!("{} is not a Double item", self.name),
        }
    }

    pub fn enum_index(&self) -> usize {
        match &self.kind {
            ItemKind::Enum { index, .. } => *index,
            _ => panic!("{} is not an Enum item", self.name),
        }
    }

    pub fn as_text(&self) -> &str {
        match &self.kind {
            ItemKind::Text { value } => value,
            _ => panic!("{} is not a Text item", self.name),
        }
    }
}

fn format_double(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        // keep a trailing ".0" so doubles stay visually distinct from ints
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

fn list_of_doubles(allowed: &[f64]) -> String {
    allowed.iter().map(|v| format_double(*v)).collect::<Vec<_>>().join(", ")
}

/// Case-insensitive registry of items, keyed by lowercased name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    items: BTreeMap<String, StateItem>,
}

impl Registry {
    pub fn new() -> Registry { Registry { items: BTreeMap::new() } }

    pub fn insert(&mut self, item: StateItem) {
        let key = item.name().to_ascii_lowercase();
        let prior = self.items.insert(key, item);
        debug_assert!(prior.is_none(), "duplicate registry item");
    }

    pub fn locate(&self, name: &str) -> Option<&StateItem> {
        self.items.get(&name.to_ascii_lowercase())
    }

    pub fn locate_mut(&mut self, name: &str) -> Option<&mut StateItem> {
        self.items.get_mut(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateItem> {
        self.items.values()
    }
}

/// Composite item exposing `.path` and `.basefilename` sub-keys.
#[derive(Debug, Clone)]
pub struct FilenameItem {
    name: String,
    path: String,
    base: String,
}

impl FilenameItem {
    pub fn new(name: &str) -> FilenameItem {
        FilenameItem { name: name.to_owned(), path: String::new(), base: String::new() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn path(&self) -> &str { &self.path }
    pub fn base_filename(&self) -> &str { &self.base }

    pub fn set_path(&mut self, path: &str) -> bool {
        let changed = self.path != path;
        self.path = path.to_owned();
        changed
    }

    pub fn set_base_filename(&mut self, base: &str) -> bool {
        let changed = self.base != base;
        self.base = base.to_owned();
        changed
    }

    /// Both halves must be present before a recording can start.
    pub fn is_valid(&self) -> bool { !self.path.is_empty() && !self.base.is_empty() }

    pub fn full_path(&self) -> String {
        if self.path.ends_with('/') || self.path.ends_with('\\') {
            format!("{}{}", self.path, self.base)
        } else {
            format!("{}/{}", self.path, self.base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_rejection_leaves_value() {
        let mut item = StateItem::int_item("TCPNumDataBlocksWrite", 1, 1, 100);
        assert_eq!(item.set_from_str("50"), Ok(true));
        let err = item.set_from_str("500").unwrap_err();
        assert!(err.contains("between 1 and 100"));
        assert_eq!(item.as_int(), 50);
    }

    #[test]
    fn enum_is_case_insensitive_and_canonical() {
        let mut item = StateItem::enum_item("TriggerPolarity", 0, vec!["Rising", "Falling"]);
        assert_eq!(item.set_from_str("fAlLiNg"), Ok(true));
        assert_eq!(item.value_string(), "Falling");
        assert!(item.set_from_str("sideways").is_err());
        assert_eq!(item.value_string(), "Falling");
    }

    #[test]
    fn discrete_double_matches_with_tolerance() {
        let mut item = StateItem::discrete_double_item(
            "SampleRateHertz",
            30000.0,
            vec![10000.0, 20000.0, 25000.0, 30000.0],
        );
        assert_eq!(item.set_from_str("20000.0"), Ok(true));
        assert_eq!(item.as_double(), 20000.0);
        assert!(item.set_from_str("44100").is_err());
        assert_eq!(item.as_double(), 20000.0);
    }

    #[test]
    fn value_string_round_trips() {
        let mut items = vec![
            StateItem::bool_item("AudioEnabled", true),
            StateItem::int_item("AudioVolume", 50, 0, 100),
            StateItem::double_item("TriggerAnalogVoltageThreshold", 1.25, -10.0, 10.0, 0.01),
            StateItem::enum_item("WriteToDiskLatency", 2, vec!["Highest", "High", "Medium", "Low", "Lowest"]),
            StateItem::text_item("Note1", "hello world"),
        ];
        for item in items.iter_mut() {
            let text = item.value_string();
            assert_eq!(item.set_from_str(&text), Ok(false), "{} did not round-trip", item.name());
            assert_eq!(item.value_string(), text);
        }
    }

    #[test]
    fn registry_lookup_ignores_case() {
        let mut reg = Registry::new();
        reg.insert(StateItem::bool_item("AudioEnabled", false));
        assert!(reg.locate("audioenabled").is_some());
        assert!(reg.locate("AUDIOENABLED").is_some());
        assert!(reg.locate("audio_enabled").is_none());
    }

    #[test]
    fn filename_validity() {
        let mut f = FilenameItem::new("Filename");
        assert!(!f.is_valid());
        f.set_path("/data");
        assert!(!f.is_valid());
        f.set_base_filename("session1");
        assert!(f.is_valid());
        assert_eq!(f.full_path(), "/data/session1");
    }
}
