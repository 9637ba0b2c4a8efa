use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two marketplaces the harvester talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    AppStore,
    PlayStore,
}

/// How a marketplace splits its review listing across locales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalePartition {
    /// Listing varies by storefront country only; language is ignored.
    CountryOnly,
    /// Listing varies by (language, country).
    LanguageAndCountry,
}

/// Static per-marketplace configuration. Everything that used to be a string comparison on
/// the marketplace name lives here.
#[derive(Debug)]
pub struct MarketplaceProfile {
    pub marketplace: Marketplace,
    pub key: &'static str,
    /// Canonical endpoint used to probe whether an outbound address is usable.
    pub probe_url: &'static str,
    /// Probe bodies at or below this size are treated as block pages.
    pub min_probe_bytes: usize,
    pub partition: LocalePartition,
    pub fallback_language: &'static str,
    pub fallback_country: &'static str,
    /// Hard cap on pages the listing endpoint will serve per locale.
    pub max_pages: Option<u32>,
    pub page_size: u32,
    /// Default per-run review budget for one app.
    pub default_budget: u64,
}

static PROFILES: [MarketplaceProfile; 2] = [
    MarketplaceProfile {
        marketplace: Marketplace::AppStore,
        key: "app_store",
        probe_url: "https://itunes.apple.com/us/rss/customerreviews/page=1/id=284882215/sortBy=mostRecent/json",
        min_probe_bytes: 100,
        partition: LocalePartition::CountryOnly,
        fallback_language: "en",
        fallback_country: "US",
        max_pages: Some(10),
        page_size: 50,
        default_budget: 50_000,
    },
    MarketplaceProfile {
        marketplace: Marketplace::PlayStore,
        key: "play_store",
        probe_url: "https://play.google.com/store/apps/details?id=com.whatsapp&hl=en&gl=us",
        min_probe_bytes: 100,
        partition: LocalePartition::LanguageAndCountry,
        fallback_language: "en",
        fallback_country: "US",
        max_pages: None,
        page_size: 100,
        default_budget: 50_000,
    },
];

impl Marketplace {
    pub const ALL: [Marketplace; 2] = [Marketplace::AppStore, Marketplace::PlayStore];

    pub fn profile(self) -> &'static MarketplaceProfile {
        match self {
            Marketplace::AppStore => &PROFILES[0],
            Marketplace::PlayStore => &PROFILES[1],
        }
    }

    pub fn as_str(self) -> &'static str {
        self.profile().key
    }

    /// CLI spelling (kebab-case), used when re-invoking ourselves for child collectors.
    pub fn cli_name(self) -> &'static str {
        match self {
            Marketplace::AppStore => "app-store",
            Marketplace::PlayStore => "play-store",
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "app_store" | "appstore" | "ios" => Ok(Marketplace::AppStore),
            "play_store" | "playstore" | "android" => Ok(Marketplace::PlayStore),
            other => Err(anyhow::anyhow!("unknown marketplace: {other}")),
        }
    }
}
