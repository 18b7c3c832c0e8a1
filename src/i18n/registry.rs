//! Language registry: single source of truth for language codes and names.
//!
//! The registry serves two lookups. Language identification produces ISO 639-3
//! codes that must be folded into the two-letter codes users store in their
//! profiles, and the LLM backend needs a human-readable name for the target
//! language. Only a fixed set of languages has a display name; every other
//! code falls back to English.

use std::sync::OnceLock;

/// Metadata for one language.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// ISO 639-1 language code (e.g., "en", "fr")
    pub code: &'static str,

    /// ISO 639-3 codes a detector may report for this language
    pub iso639_3: &'static [&'static str],

    /// English name of the language (e.g., "French")
    pub name: &'static str,

    /// Native name of the language (e.g., "Français")
    pub native_name: &'static str,

    /// Whether the name is offered to translation backends
    pub translatable: bool,
}

pub struct LanguageRegistry {
    languages: Vec<LanguageConfig>,
}

static REGISTRY: OnceLock<LanguageRegistry> = OnceLock::new();

/// Code every lookup falls back to.
pub const DEFAULT_LANGUAGE: &str = "en";

impl LanguageRegistry {
    pub fn get() -> &'static LanguageRegistry {
        REGISTRY.get_or_init(|| LanguageRegistry {
            languages: default_languages(),
        })
    }

    pub fn get_by_code(&self, code: &str) -> Option<&LanguageConfig> {
        self.languages.iter().find(|lang| lang.code == code)
    }

    /// Map an ISO 639-3 code to its ISO 639-1 counterpart.
    pub fn code_for_iso639_3(&self, code3: &str) -> Option<&'static str> {
        self.languages
            .iter()
            .find(|lang| lang.iso639_3.contains(&code3))
            .map(|lang| lang.code)
    }

    /// Human-readable name used in translation prompts.
    ///
    /// Unknown or non-translatable codes get the English name.
    pub fn display_name(&self, code: &str) -> &'static str {
        self.get_by_code(code)
            .filter(|lang| lang.translatable)
            .map(|lang| lang.name)
            .unwrap_or("English")
    }

    pub fn list_translatable(&self) -> Vec<&LanguageConfig> {
        self.languages.iter().filter(|lang| lang.translatable).collect()
    }
}

fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            code: "en",
            iso639_3: &["eng"],
            name: "English",
            native_name: "English",
            translatable: true,
        },
        LanguageConfig {
            code: "ko",
            iso639_3: &["kor"],
            name: "Korean",
            native_name: "한국어",
            translatable: true,
        },
        LanguageConfig {
            code: "fr",
            iso639_3: &["fra"],
            name: "French",
            native_name: "Français",
            translatable: true,
        },
        LanguageConfig {
            code: "es",
            iso639_3: &["spa"],
            name: "Spanish",
            native_name: "Español",
            translatable: true,
        },
        LanguageConfig {
            code: "de",
            iso639_3: &["deu"],
            name: "German",
            native_name: "Deutsch",
            translatable: true,
        },
        LanguageConfig {
            code: "zh",
            iso639_3: &["zho", "cmn"],
            name: "Chinese",
            native_name: "中文",
            translatable: true,
        },
        LanguageConfig {
            code: "ja",
            iso639_3: &["jpn"],
            name: "Japanese",
            native_name: "日本語",
            translatable: true,
        },
        LanguageConfig {
            code: "ru",
            iso639_3: &["rus"],
            name: "Russian",
            native_name: "Русский",
            translatable: true,
        },
        LanguageConfig {
            code: "it",
            iso639_3: &["ita"],
            name: "Italian",
            native_name: "Italiano",
            translatable: true,
        },
        // Detection only
        LanguageConfig {
            code: "pt",
            iso639_3: &["por"],
            name: "Portuguese",
            native_name: "Português",
            translatable: false,
        },
        LanguageConfig {
            code: "nl",
            iso639_3: &["nld"],
            name: "Dutch",
            native_name: "Nederlands",
            translatable: false,
        },
        LanguageConfig {
            code: "ar",
            iso639_3: &["ara", "arb"],
            name: "Arabic",
            native_name: "العربية",
            translatable: false,
        },
        LanguageConfig {
            code: "hi",
            iso639_3: &["hin"],
            name: "Hindi",
            native_name: "हिन्दी",
            translatable: false,
        },
        LanguageConfig {
            code: "tr",
            iso639_3: &["tur"],
            name: "Turkish",
            native_name: "Türkçe",
            translatable: false,
        },
        LanguageConfig {
            code: "pl",
            iso639_3: &["pol"],
            name: "Polish",
            native_name: "Polski",
            translatable: false,
        },
        LanguageConfig {
            code: "uk",
            iso639_3: &["ukr"],
            name: "Ukrainian",
            native_name: "Українська",
            translatable: false,
        },
        LanguageConfig {
            code: "vi",
            iso639_3: &["vie"],
            name: "Vietnamese",
            native_name: "Tiếng Việt",
            translatable: false,
        },
    ]
}
