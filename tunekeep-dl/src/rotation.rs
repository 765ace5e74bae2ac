//! Failure classification and rotation policy
//!
//! Maps a fetch error message to a [`FailureSignal`] by case-insensitive
//! substring search against two phrase lists, then decides whether the
//! attempt moves to the next client variant or the next credential set.

use tunekeep_common::config::SignalConfig;

/// Phrases meaning "this credential/client pairing is refused"
pub const DEFAULT_BLOCK_PHRASES: &[&str] = &[
    "Sign in to confirm you’re not a bot",
    "Sign in to confirm you're not a bot",
    "HTTP Error 429",
    "HTTP Error 403",
    "Forbidden",
    "410: Gone",
    "HTTP Error 410",
    "This video is private",
    "Private video",
    "not available in your country",
    "proxy",
];

/// Phrases meaning "this client variant got no usable format"
pub const DEFAULT_SOFT_FORMAT_PHRASES: &[&str] = &[
    "Only images are available for download",
    "Requested format is not available",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    SoftFormat,
    Block,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDecision {
    /// Stay on the current credential set, try the next client variant
    NextVariant,
    /// Abandon the current credential set
    NextCredential,
}

/// Phrase lists used by [`SignalCatalogue::classify`]
#[derive(Debug, Clone)]
pub struct SignalCatalogue {
    block: Vec<String>,
    soft_format: Vec<String>,
}

impl Default for SignalCatalogue {
    fn default() -> Self {
        Self::new(
            DEFAULT_BLOCK_PHRASES.iter().map(|s| s.to_string()).collect(),
            DEFAULT_SOFT_FORMAT_PHRASES.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl SignalCatalogue {
    pub fn new(block: Vec<String>, soft_format: Vec<String>) -> Self {
        Self {
            block: normalize(block),
            soft_format: normalize(soft_format),
        }
    }

    /// Defaults with each list replaced by its configured override, if any
    pub fn from_config(config: &SignalConfig) -> Self {
        let defaults = Self::default();
        Self {
            block: config.block_phrases.clone().map(normalize).unwrap_or(defaults.block),
            soft_format: config
                .soft_format_phrases
                .clone()
                .map(normalize)
                .unwrap_or(defaults.soft_format),
        }
    }

    /// Classify an error message. Soft-format phrases are checked first.
    pub fn classify(&self, message: &str) -> FailureSignal {
        let message = message.to_lowercase();
        if self.soft_format.iter().any(|p| message.contains(p.as_str())) {
            FailureSignal::SoftFormat
        } else if self.block.iter().any(|p| message.contains(p.as_str())) {
            FailureSignal::Block
        } else {
            FailureSignal::Other
        }
    }
}

/// Rotation policy
///
/// | signal     | credentialed  | anonymous     |
/// |------------|---------------|---------------|
/// | SoftFormat | NextVariant   | NextVariant   |
/// | Block      | NextCredential| NextVariant   |
/// | Other      | NextVariant   | NextVariant   |
///
/// An anonymous attempt has no credential to rotate, so it always moves on
/// to the next variant.
pub fn decide(signal: FailureSignal, credentialed: bool) -> RotationDecision {
    match signal {
        FailureSignal::Block if credentialed => RotationDecision::NextCredential,
        _ => RotationDecision::NextVariant,
    }
}

fn normalize(phrases: Vec<String>) -> Vec<String> {
    phrases
        .into_iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
