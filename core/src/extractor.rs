//! Entity & intent extraction.
//!
//! Turns a raw question into an [`Entities`] set by looking up folded,
//! token-boundary phrases against:
//!
//! - the snapshot vocabulary (brands and product keywords that appear in
//!   the rule tables, plus country codes they reference);
//! - a fixed table of country names per locale and their ISO codes;
//! - a fixed alias table mapping everyday product words to the canonical
//!   keywords used by policy sheets.
//!
//! Extraction is a pure transform. Unrecognized words are ignored and empty
//! input yields an empty set, never an error.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy_store::PolicySnapshot;
use crate::text::{token_eq, NormalizedText, Phrase};

/// Token rules selected per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    /// English (default).
    #[default]
    En,
    /// French.
    Fr,
    /// Arabic.
    Ar,
}

impl Locale {
    /// Parses a language tag such as `fr` or `fr-FR`. Unknown tags map to `En`.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let primary = tag.trim().split(['-', '_']).next().unwrap_or_default();
        match primary.to_ascii_lowercase().as_str() {
            "fr" => Self::Fr,
            "ar" => Self::Ar,
            _ => Self::En,
        }
    }

    /// Lowercase language tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Fr => "fr",
            Self::Ar => "ar",
        }
    }

    const fn stopwords(self) -> &'static [&'static str] {
        match self {
            Self::En => &[
                "a", "an", "the", "can", "i", "sell", "selling", "buy", "in", "on", "to", "of", "for",
                "and", "or", "is", "it", "my", "with", "what", "how", "do", "are", "be",
            ],
            Self::Fr => &[
                "le", "la", "les", "un", "une", "des", "de", "du", "en", "au", "aux", "et", "ou", "je",
                "vendre", "puis", "est", "sur", "pour", "avec",
            ],
            Self::Ar => &["في", "من", "على", "هل", "يمكنني", "بيع", "و", "او"],
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Fixed tables
// ───────────────────────────────────────────────────────────────────────────

struct CountryNames {
    code: &'static str,
    en: &'static [&'static str],
    fr: &'static [&'static str],
    ar: &'static [&'static str],
}

const COUNTRIES: &[CountryNames] = &[
    CountryNames { code: "NG", en: &["nigeria"], fr: &["nigeria"], ar: &["نيجيريا"] },
    CountryNames { code: "GH", en: &["ghana"], fr: &["ghana"], ar: &["غانا"] },
    CountryNames { code: "KE", en: &["kenya"], fr: &["kenya"], ar: &["كينيا"] },
    CountryNames { code: "EG", en: &["egypt"], fr: &["egypte"], ar: &["مصر"] },
    CountryNames { code: "UG", en: &["uganda"], fr: &["ouganda"], ar: &["أوغندا"] },
    CountryNames { code: "TZ", en: &["tanzania"], fr: &["tanzanie"], ar: &["تنزانيا"] },
    CountryNames { code: "ZA", en: &["south africa"], fr: &["afrique du sud"], ar: &["جنوب أفريقيا"] },
    CountryNames { code: "MA", en: &["morocco"], fr: &["maroc"], ar: &["المغرب"] },
    CountryNames { code: "DZ", en: &["algeria"], fr: &["algérie"], ar: &["الجزائر"] },
    CountryNames { code: "TN", en: &["tunisia"], fr: &["tunisie"], ar: &["تونس"] },
    CountryNames { code: "SN", en: &["senegal"], fr: &["sénégal"], ar: &["السنغال"] },
    CountryNames { code: "CI", en: &["ivory coast", "cote d'ivoire"], fr: &["côte d'ivoire"], ar: &["ساحل العاج"] },
    CountryNames { code: "CM", en: &["cameroon"], fr: &["cameroun"], ar: &["الكاميرون"] },
];

/// Canonical policy keyword followed by the everyday words that mean it.
const PRODUCT_ALIASES: &[(&str, &[&str])] = &[
    (
        "drones or remotely controlled aircraft",
        &["drone", "remotely controlled aircraft", "rc drone", "quadcopter", "uav", "unmanned aerial vehicle"],
    ),
    ("firearms and weapons", &["gun", "pistol", "rifle", "shotgun", "handgun", "firearm", "weapon"]),
    ("knives and sharp weapons", &["knife", "knives", "blade", "blades", "sharp objects"]),
    ("sharp objects", &["sharp object", "sharp items", "pointed objects"]),
    ("night vision devices", &["night vision", "night vision goggles"]),
    ("spy products", &["spy camera", "hidden camera", "nanny cam"]),
    ("remote controls", &["remote", "remote control", "remote controller", "tv remote"]),
    ("video games", &["video game", "computer games", "computer game", "gaming", "games"]),
    ("dietary supplements", &["supplement", "vitamin", "nutrition supplement"]),
    ("covid-19 test kits", &["covid test", "coronavirus test", "rapid test", "antigen test"]),
    ("dialysis machines", &["dialysis", "kidney machine"]),
    ("ventilators", &["ventilator", "breathing machine"]),
    ("catheters", &["catheter"]),
    ("radioactive products", &["radioactive", "nuclear"]),
    ("toxic substances", &["toxic", "poison", "hazardous materials"]),
    ("certain reptile skins", &["reptile skin", "crocodile skin", "snake skin", "lizard skin"]),
    ("camouflage clothing / items", &["camo", "camouflage", "military pattern"]),
    ("adult products", &["adult toy", "intimate products"]),
    ("nicotine products", &["nicotine", "vape", "e-cigarette", "e cig"]),
    ("medical devices", &["medical device", "medical equipment", "healthcare device"]),
    ("all tracking devices", &["gps tracker", "tracking device", "location tracker"]),
    ("gsm signal booster", &["gsm booster", "signal booster", "mobile booster", "cell booster"]),
    ("camera spectacles / smart glasses", &["smart glasses", "camera glasses", "recording glasses", "spy glasses"]),
];

const CATEGORY_HINTS: &[(&str, &str)] = &[
    ("shoe", "Fashion"),
    ("sneaker", "Fashion"),
    ("clothing", "Fashion"),
    ("clothes", "Fashion"),
    ("dress", "Fashion"),
    ("shirt", "Fashion"),
    ("pants", "Fashion"),
    ("bag", "Fashion"),
    ("watch", "Fashion"),
    ("phone", "Electronics"),
    ("smartphone", "Electronics"),
    ("laptop", "Electronics"),
    ("computer", "Electronics"),
    ("headphone", "Electronics"),
    ("earphone", "Electronics"),
    ("drug", "Health"),
    ("medicine", "Health"),
    ("medication", "Health"),
    ("supplement", "Health"),
    ("cosmetic", "Beauty"),
    ("makeup", "Beauty"),
    ("skincare", "Beauty"),
    ("perfume", "Beauty"),
    ("fragrance", "Beauty"),
];

struct CountryPhrase {
    code: &'static str,
    locale: Locale,
    phrase: Phrase,
}

static COUNTRY_PHRASES: Lazy<Vec<CountryPhrase>> = Lazy::new(|| {
    let mut out = Vec::new();
    for country in COUNTRIES {
        for (locale, names) in [(Locale::En, country.en), (Locale::Fr, country.fr), (Locale::Ar, country.ar)] {
            out.extend(names.iter().filter_map(|n| Phrase::new(n)).map(|phrase| CountryPhrase {
                code: country.code,
                locale,
                phrase,
            }));
        }
    }
    out
});

static ALIAS_PHRASES: Lazy<Vec<(String, Vec<Phrase>)>> = Lazy::new(|| {
    PRODUCT_ALIASES
        .iter()
        .filter_map(|(canonical, aliases)| {
            let key = Phrase::new(canonical)?.key;
            Some((key, aliases.iter().filter_map(|a| Phrase::new(a)).collect()))
        })
        .collect()
});

/// ISO code for a country cell written either as a code in the fixed table
/// or as a country name in any supported locale.
#[must_use]
pub fn country_code(raw: &str) -> Option<&'static str> {
    let trimmed = raw.trim();
    if let Some(country) = COUNTRIES.iter().find(|c| c.code.eq_ignore_ascii_case(trimmed)) {
        return Some(country.code);
    }
    let phrase = Phrase::new(trimmed)?;
    COUNTRY_PHRASES
        .iter()
        .find(|c| c.phrase.key == phrase.key)
        .map(|c| c.code)
}

static ISO_CODE_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b[A-Z]{2}\b").ok());

// ───────────────────────────────────────────────────────────────────────────
// Entities
// ───────────────────────────────────────────────────────────────────────────

/// Listing traits that the original question hints at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListingFlags {
    /// `used`, `secondhand`, `pre-owned`.
    pub used: bool,
    /// `fake`, `counterfeit`, `replica`, `knockoff`.
    pub counterfeit: bool,
    /// `refurbished`, `renewed`.
    pub refurbished: bool,
    /// `bulk`, `wholesale`, `wholesaler`.
    pub bulk: bool,
}

impl ListingFlags {
    fn detect(text: &NormalizedText) -> Self {
        let any = |words: &[&str]| words.iter().filter_map(|w| Phrase::new(w)).any(|p| text.contains(&p));
        Self {
            used: any(&["used", "secondhand", "second hand", "pre-owned"]),
            counterfeit: any(&["fake", "counterfeit", "replica", "knockoff"]),
            refurbished: any(&["refurbished", "renewed"]),
            bulk: any(&["bulk", "wholesale", "wholesaler"]),
        }
    }
}

/// What was recognized in one question.
///
/// Brands and products are stored as folded phrase keys, which is also how
/// the snapshot indexes its rows. Sets are ordered so that evaluation and
/// serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Entities {
    /// Brand keys present in the snapshot vocabulary.
    pub brands: BTreeSet<String>,
    /// Product keys present in the snapshot vocabulary.
    pub products: BTreeSet<String>,
    /// ISO 3166 alpha-2 codes.
    pub countries: BTreeSet<String>,
    /// Locale used for extraction.
    pub locale: Locale,
    /// Broad category hints, used only for prompt context.
    pub categories: BTreeSet<String>,
    /// Listing traits, used only for prompt context.
    pub flags: ListingFlags,
    /// Normalized question; the blacklist is matched against this.
    #[serde(skip)]
    pub text: NormalizedText,
}

impl Entities {
    /// `true` if nothing at all was recognized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brands.is_empty() && self.products.is_empty() && self.countries.is_empty()
    }
}

fn is_stopword_phrase(phrase: &Phrase, locale: Locale) -> bool {
    match phrase.tokens.as_slice() {
        [only] => locale.stopwords().iter().any(|s| s == only),
        _ => false,
    }
}

/// Extracts entities from `raw` with the token rules of `locale`.
#[must_use]
pub fn extract(raw: &str, locale: Locale, snapshot: &PolicySnapshot) -> Entities {
    let text = NormalizedText::new(raw);
    let mut entities = Entities {
        locale,
        ..Entities::default()
    };
    if text.is_empty() {
        return entities;
    }
    let vocabulary = snapshot.vocabulary();

    for phrase in &vocabulary.brands {
        if !is_stopword_phrase(phrase, locale) && text.contains(phrase) {
            entities.brands.insert(phrase.key.clone());
        }
    }

    for phrase in &vocabulary.products {
        if !is_stopword_phrase(phrase, locale) && text.contains(phrase) {
            entities.products.insert(phrase.key.clone());
        }
    }
    for (canonical, aliases) in ALIAS_PHRASES.iter() {
        if snapshot.category_rows(canonical).next().is_some() && aliases.iter().any(|a| text.contains(a)) {
            entities.products.insert(canonical.clone());
        }
    }

    for country in COUNTRY_PHRASES.iter() {
        if (country.locale == Locale::En || country.locale == locale) && text.contains(&country.phrase) {
            entities.countries.insert(country.code.to_string());
        }
    }
    if let Some(re) = ISO_CODE_RE.as_ref() {
        for m in re.find_iter(raw) {
            let code = m.as_str();
            let known = COUNTRIES.iter().any(|c| c.code == code) || vocabulary.country_codes.contains(code);
            if known {
                entities.countries.insert(code.to_string());
            }
        }
    }

    for (hint, category) in CATEGORY_HINTS {
        if text.tokens.iter().any(|t| token_eq(t, hint)) {
            entities.categories.insert((*category).to_string());
        }
    }
    entities.flags = ListingFlags::detect(&text);
    entities.text = text;
    entities
}
