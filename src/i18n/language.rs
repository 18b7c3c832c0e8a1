//! Source and target language resolution.
//!
//! Detection never fails a send: every ambiguous path degrades to
//! [`DEFAULT_LANGUAGE`], at worst costing a redundant translation.

use crate::i18n::{LanguageRegistry, DEFAULT_LANGUAGE};
use crate::models::User;
use std::sync::Arc;

/// Texts shorter than this (in characters, after trimming) are not run
/// through language identification.
pub const MIN_DETECTION_CHARS: usize = 10;

/// Sentinel a detector returns when it cannot decide.
pub const UNDETERMINED: &str = "und";

/// Statistical language identification.
pub trait LanguageDetector: Send + Sync {
    /// Returns an ISO 639-3 code, or [`UNDETERMINED`].
    fn detect(&self, text: &str) -> String;
}

/// Trigram-based detection backed by `whatlang`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> String {
        match whatlang::detect_lang(text) {
            Some(lang) => lang.code().to_string(),
            None => UNDETERMINED.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct LanguageResolver {
    detector: Arc<dyn LanguageDetector>,
}

impl Default for LanguageResolver {
    fn default() -> Self {
        Self::new(Arc::new(WhatlangDetector))
    }
}

impl LanguageResolver {
    pub fn new(detector: Arc<dyn LanguageDetector>) -> Self {
        Self { detector }
    }

    /// Determine the language a message was written in.
    ///
    /// A non-empty `explicit_override` is trusted and returned unchanged.
    pub fn resolve_source_language(&self, text: &str, explicit_override: Option<&str>) -> String {
        if let Some(code) = explicit_override {
            if !code.trim().is_empty() {
                return code.to_string();
            }
        }

        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_DETECTION_CHARS {
            return DEFAULT_LANGUAGE.to_string();
        }

        let code3 = self.detector.detect(trimmed);
        if code3 == UNDETERMINED {
            return DEFAULT_LANGUAGE.to_string();
        }

        LanguageRegistry::get()
            .code_for_iso639_3(&code3)
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string()
    }
}

/// The language a user wants to read messages in.
pub fn resolve_target_language(user: &User) -> String {
    match user.preferred_language.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => DEFAULT_LANGUAGE.to_string(),
    }
}
