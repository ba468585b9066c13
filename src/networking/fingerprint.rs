//! Coarse OS family guesses from probe metadata.
//!
//! These are heuristics. Routers decrement TTLs and service names collide, so
//! misclassification is expected.

use std::fmt;

/// OS family label attached to a discovered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    LinuxAndroid,
    Windows,
    AppleOs,
    Android,
    Linux,
    Unknown,
}

impl OsFamily {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LinuxAndroid => "Linux/Android",
            Self::Windows => "Windows",
            Self::AppleOs => "iOS/MacOS",
            Self::Android => "Android",
            Self::Linux => "Linux",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::Unknown
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Service-type substrings checked in priority order
const SERVICE_TAG_RULES: &[(&str, OsFamily)] = &[
    ("_android", OsFamily::Android),
    ("_apple", OsFamily::AppleOs),
    ("_windows", OsFamily::Windows),
    ("_linux", OsFamily::Linux),
];

/// Guess the OS family from the TTL of an echo reply
pub fn by_ttl(ttl: u8) -> OsFamily {
    match ttl {
        64 => OsFamily::LinuxAndroid,
        128 => OsFamily::Windows,
        255 => OsFamily::AppleOs,
        _ => OsFamily::Unknown,
    }
}

/// Guess the OS family from announced mDNS service types.
///
/// Rules are tried in order; the first rule matching any tag wins.
pub fn by_service_tags<I, S>(tags: I) -> OsFamily
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tags: Vec<S> = tags.into_iter().collect();

    SERVICE_TAG_RULES
        .iter()
        .find(|(needle, _)| tags.iter().any(|tag| tag.as_ref().contains(needle)))
        .map(|(_, family)| *family)
        .unwrap_or(OsFamily::Unknown)
}
