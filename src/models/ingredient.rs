use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Traffic-light zone assigned to an ingredient by the classification model.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Zone {
    Green,
    Yellow,
    Red,
    #[default]
    Unzoned,
}

/// An ingredient attached to a food record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    pub name: String,
    pub zone: Zone,
    pub organic: bool,
    pub category: String,
}

impl Ingredient {
    pub fn unzoned(name: impl Into<String>, organic: bool, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: Zone::Unzoned,
            organic,
            category: category.into(),
        }
    }

    pub fn is_unzoned(&self) -> bool {
        self.zone == Zone::Unzoned
    }
}

/// Ingredient as returned by the vision model, before normalisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedIngredient {
    pub name: String,

    #[serde(default)]
    pub organic: bool,

    #[serde(default, alias = "foodGroup", alias = "food_group")]
    pub category: Option<String>,
}

/// Zone decision for a single ingredient name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneAssignment {
    pub name: String,
    pub zone: Zone,
}

/// Canonical form used for storage and case-insensitive matching.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lowercase, trim and deduplicate extracted ingredients.
///
/// Every ingredient starts `unzoned`. Duplicates collapse onto the first
/// occurrence: `organic` is OR-ed and the first non-empty category wins.
/// Names that are empty after trimming are dropped.
pub fn normalize_ingredients(raw: Vec<ExtractedIngredient>) -> Vec<Ingredient> {
    let mut out: Vec<Ingredient> = Vec::with_capacity(raw.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in raw {
        let name = canonical_name(&item.name);
        if name.is_empty() {
            continue;
        }
        let category = item
            .category
            .map(|c| c.trim().to_lowercase())
            .unwrap_or_default();

        match index.get(&name) {
            Some(&pos) => {
                let existing = &mut out[pos];
                existing.organic |= item.organic;
                if existing.category.is_empty() {
                    existing.category = category;
                }
            }
            None => {
                index.insert(name.clone(), out.len());
                out.push(Ingredient::unzoned(name, item.organic, category));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, organic: bool, category: Option<&str>) -> ExtractedIngredient {
        ExtractedIngredient {
            name: name.to_string(),
            organic,
            category: category.map(str::to_string),
        }
    }

    #[test]
    fn test_normalize_lowercases_and_trims() {
        let out = normalize_ingredients(vec![raw("  Brown Rice ", false, Some("Grains"))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "brown rice");
        assert_eq!(out[0].category, "grains");
        assert_eq!(out[0].zone, Zone::Unzoned);
    }

    #[test]
    fn test_normalize_dedupes_case_insensitively() {
        let out = normalize_ingredients(vec![
            raw("Spinach", false, None),
            raw("SPINACH", true, Some("vegetables")),
            raw("salmon", false, Some("protein")),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "spinach");
        assert!(out[0].organic);
        assert_eq!(out[0].category, "vegetables");
        assert_eq!(out[1].name, "salmon");
    }

    #[test]
    fn test_normalize_drops_blank_names() {
        let out = normalize_ingredients(vec![raw("   ", false, None), raw("", true, None)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_zone_parses_case_insensitively() {
        assert_eq!("Green".parse::<Zone>().unwrap(), Zone::Green);
        assert_eq!("RED".parse::<Zone>().unwrap(), Zone::Red);
        assert!("purple".parse::<Zone>().is_err());
        assert_eq!(Zone::Yellow.to_string(), "yellow");
    }

    #[test]
    fn test_extracted_accepts_food_group_alias() {
        let parsed: ExtractedIngredient =
            serde_json::from_str(r#"{"name":"Kale","foodGroup":"Vegetables"}"#).unwrap();
        assert_eq!(parsed.category.as_deref(), Some("Vegetables"));
        assert!(!parsed.organic);
    }
}
