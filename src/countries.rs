use crate::model::Country;
use std::cmp::Ordering;
use std::collections::HashSet;

pub const UNKNOWN_FLAG: &str = "🌍";

const CATALOG: &[(&str, &str, &str)] = &[
    ("us", "United States", "🇺🇸"),
    ("uk", "United Kingdom", "🇬🇧"),
    ("de", "Germany", "🇩🇪"),
    ("jp", "Japan", "🇯🇵"),
    ("ca", "Canada", "🇨🇦"),
    ("au", "Australia", "🇦🇺"),
    ("nl", "Netherlands", "🇳🇱"),
    ("fr", "France", "🇫🇷"),
    ("it", "Italy", "🇮🇹"),
    ("es", "Spain", "🇪🇸"),
    ("ch", "Switzerland", "🇨🇭"),
    ("sg", "Singapore", "🇸🇬"),
    ("no", "Norway", "🇳🇴"),
    ("se", "Sweden", "🇸🇪"),
    ("dk", "Denmark", "🇩🇰"),
    ("pl", "Poland", "🇵🇱"),
    ("be", "Belgium", "🇧🇪"),
    ("at", "Austria", "🇦🇹"),
    ("cz", "Czech Republic", "🇨🇿"),
    ("fi", "Finland", "🇫🇮"),
    ("ie", "Ireland", "🇮🇪"),
    ("pt", "Portugal", "🇵🇹"),
    ("gr", "Greece", "🇬🇷"),
    ("hu", "Hungary", "🇭🇺"),
];

pub fn catalog() -> Vec<Country> {
    CATALOG.iter().map(|entry| to_country(*entry)).collect()
}

fn to_country((code, name, flag): (&str, &str, &str)) -> Country {
    Country {
        code: code.to_string(),
        name: name.to_string(),
        flag: flag.to_string(),
    }
}

/// Case-insensitive catalog lookup.
pub fn lookup(code: &str) -> Option<Country> {
    let code = code.trim().to_lowercase();
    CATALOG
        .iter()
        .find(|(entry, _, _)| *entry == code)
        .map(|entry| to_country(*entry))
}

/// Catalog entry for `code`, or a placeholder identity for codes the catalog does not know.
///
/// The control plane is authoritative over which countries exist, so nodes in unknown
/// countries are shown with the placeholder rather than dropped.
pub fn resolve(code: &str) -> Country {
    lookup(code).unwrap_or_else(|| Country {
        code: code.to_lowercase(),
        name: code.to_uppercase(),
        flag: UNKNOWN_FLAG.to_string(),
    })
}

pub fn display(code: &str) -> String {
    let country = resolve(code);
    format!("{} {}", country.flag, country.name)
}

/// Favorites first, then alphabetical within each group.
pub fn sort_by_favorites(countries: &[String], favorites: &[String]) -> Vec<String> {
    let favorites: HashSet<String> = favorites
        .iter()
        .map(|code| code.trim().to_lowercase())
        .filter(|code| !code.is_empty())
        .collect();
    let mut sorted = countries.to_vec();
    sorted.sort_by(|a, b| {
        let a_fav = favorites.contains(&a.to_lowercase());
        let b_fav = favorites.contains(&b.to_lowercase());
        match (a_fav, b_fav) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.cmp(b),
        }
    });
    sorted
}
