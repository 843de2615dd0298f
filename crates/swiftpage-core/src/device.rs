//! Device classification from request headers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse device class. Pages render differently per class, so learned
/// page properties are kept apart per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Desktop browsers and anything unrecognized.
    #[default]
    Desktop,
    /// Tablets.
    Tablet,
    /// Phones.
    Mobile,
}

impl DeviceClass {
    /// Suffix appended to property-cache keys.
    pub const fn key_suffix(&self) -> &'static str {
        match self {
            Self::Desktop => "@Desktop",
            Self::Tablet => "@Tablet",
            Self::Mobile => "@Mobile",
        }
    }

    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a user agent onto a device class.
pub trait DeviceClassifier: Send + Sync {
    /// Classifies `user_agent`; `None` means the header was absent.
    fn classify(&self, user_agent: Option<&str>) -> DeviceClass;
}

/// Substring-based classifier covering the common mobile and tablet
/// user agents.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserAgentClassifier;

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "kindle", "silk/", "playbook"];
const MOBILE_MARKERS: &[&str] = &[
    "iphone",
    "ipod",
    "windows phone",
    "blackberry",
    "opera mini",
    "mobile",
];

impl DeviceClassifier for UserAgentClassifier {
    fn classify(&self, user_agent: Option<&str>) -> DeviceClass {
        let Some(ua) = user_agent else {
            return DeviceClass::Desktop;
        };
        let ua = ua.to_ascii_lowercase();
        if TABLET_MARKERS.iter().any(|m| ua.contains(m)) {
            return DeviceClass::Tablet;
        }
        // Android tablets omit "mobile".
        if ua.contains("android") && !ua.contains("mobile") {
            return DeviceClass::Tablet;
        }
        if MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
            return DeviceClass::Mobile;
        }
        DeviceClass::Desktop
    }
}
