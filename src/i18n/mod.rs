//! Language handling: code registry, source/target resolution, and
//! translation metrics.
//!
//! # Example
//!
//! ```rust,ignore
//! use polyglot_chat::i18n::{LanguageResolver, LanguageRegistry};
//!
//! let resolver = LanguageResolver::default();
//! let source = resolver.resolve_source_language("Bonjour tout le monde !", None);
//! let name = LanguageRegistry::get().display_name(&source);
//! ```

mod language;
mod metrics;
mod registry;

pub use language::{
    resolve_target_language, LanguageDetector, LanguageResolver, WhatlangDetector,
    MIN_DETECTION_CHARS, UNDETERMINED,
};
pub use metrics::{BackendCounters, MetricsReport, TranslationMetrics};
pub use registry::{LanguageConfig, LanguageRegistry, DEFAULT_LANGUAGE};
