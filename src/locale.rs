use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::marketplace::{LocalePartition, Marketplace};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, sqlx::FromRow)]
pub struct LocalePair {
    pub language: String,
    pub country: String,
}

impl LocalePair {
    pub fn new(language: &str, country: &str) -> Self {
        Self {
            language: language.trim().to_ascii_lowercase(),
            country: country.trim().to_ascii_uppercase(),
        }
    }

    pub fn fallback(marketplace: Marketplace) -> Self {
        let p = marketplace.profile();
        Self::new(p.fallback_language, p.fallback_country)
    }
}

impl fmt::Display for LocalePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.language, self.country)
    }
}

/// Languages served first when an app has many locales.
const PRIORITY_LANGUAGES: [&str; 10] = ["en", "zh", "ja", "ko", "de", "fr", "es", "pt", "ru", "it"];

fn language_rank(lang: &str) -> usize {
    let base = lang.split(['-', '_']).next().unwrap_or(lang);
    PRIORITY_LANGUAGES
        .iter()
        .position(|l| *l == base)
        .unwrap_or(PRIORITY_LANGUAGES.len())
}

/// Turns the raw discovered locale set into the harvest partitions for a marketplace:
/// normalizes case, collapses duplicates (country-only marketplaces keep one entry per
/// country), orders priority languages first, and falls back to the marketplace default
/// when nothing usable is known.
pub fn partition_locales(marketplace: Marketplace, raw: &[LocalePair]) -> Vec<LocalePair> {
    let mut pairs: Vec<LocalePair> = raw
        .iter()
        .filter(|p| !p.country.trim().is_empty())
        .map(|p| LocalePair::new(&p.language, &p.country))
        .collect();
    pairs.sort_by(|a, b| {
        language_rank(&a.language)
            .cmp(&language_rank(&b.language))
            .then_with(|| a.cmp(b))
    });

    let out: Vec<LocalePair> = match marketplace.profile().partition {
        LocalePartition::CountryOnly => {
            let mut seen: HashSet<String> = HashSet::new();
            pairs
                .into_iter()
                .filter(|p| seen.insert(p.country.clone()))
                .collect()
        }
        LocalePartition::LanguageAndCountry => {
            let mut seen: HashSet<(String, String)> = HashSet::new();
            pairs
                .into_iter()
                .filter(|p| seen.insert((p.language.clone(), p.country.clone())))
                .collect()
        }
    };

    if out.is_empty() {
        vec![LocalePair::fallback(marketplace)]
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp(l: &str, c: &str) -> LocalePair {
        LocalePair::new(l, c)
    }

    #[test]
    fn empty_set_falls_back() {
        assert_eq!(
            partition_locales(Marketplace::PlayStore, &[]),
            vec![lp("en", "US")]
        );
        assert_eq!(
            partition_locales(Marketplace::AppStore, &[lp("fr", " ")]),
            vec![lp("en", "US")]
        );
    }

    #[test]
    fn country_only_marketplace_collapses_languages() {
        let raw = [lp("fr", "ca"), lp("en", "CA"), lp("de", "DE")];
        let got = partition_locales(Marketplace::AppStore, &raw);
        assert_eq!(got, vec![lp("en", "CA"), lp("de", "DE")]);
    }

    #[test]
    fn language_and_country_keeps_pairs_in_priority_order() {
        let raw = [lp("sv", "SE"), lp("fr", "CA"), lp("EN", "ca"), lp("en", "CA")];
        let got = partition_locales(Marketplace::PlayStore, &raw);
        assert_eq!(got, vec![lp("en", "CA"), lp("fr", "CA"), lp("sv", "SE")]);
    }

    #[test]
    fn regional_language_codes_rank_by_base() {
        assert_eq!(language_rank("zh-Hans"), 1);
        assert_eq!(language_rank("pt_BR"), 7);
        assert_eq!(language_rank("xx"), PRIORITY_LANGUAGES.len());
    }
}
