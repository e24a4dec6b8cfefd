//! Static video profile catalog.

use crate::error::{TypesError, TypesResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named encoding target.
///
/// Profiles are static; serde represents a profile by its catalog name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct VideoProfile {
    /// Catalog name, e.g. `P240p30fps16x9`
    pub name: &'static str,
    /// `WIDTHxHEIGHT`
    pub resolution: &'static str,
    /// Target bitrate in ffmpeg notation, e.g. `600k`
    pub bitrate: &'static str,
    /// Frames per second
    pub framerate: u32,
    /// Display aspect ratio
    pub aspect_ratio: &'static str,
    /// Codec tag
    pub codec: &'static str,
}

const fn profile(
    name: &'static str,
    resolution: &'static str,
    bitrate: &'static str,
    framerate: u32,
    aspect_ratio: &'static str,
) -> VideoProfile {
    VideoProfile {
        name,
        resolution,
        bitrate,
        framerate,
        aspect_ratio,
        codec: "H264",
    }
}

/// Every profile a job may request.
pub const VIDEO_PROFILES: [VideoProfile; 9] = [
    profile("P720p60fps16x9", "1280x720", "6000k", 60, "16:9"),
    profile("P720p30fps16x9", "1280x720", "4000k", 30, "16:9"),
    profile("P720p30fps4x3", "960x720", "4000k", 30, "4:3"),
    profile("P576p30fps16x9", "1024x576", "1500k", 30, "16:9"),
    profile("P360p30fps16x9", "640x360", "1200k", 30, "16:9"),
    profile("P360p30fps4x3", "480x360", "1000k", 30, "4:3"),
    profile("P240p30fps16x9", "426x240", "600k", 30, "16:9"),
    profile("P240p30fps4x3", "320x240", "600k", 30, "4:3"),
    profile("P144p30fps16x9", "256x144", "400k", 30, "16:9"),
];

/// Look up a profile by exact catalog name.
pub fn lookup_profile(name: &str) -> Option<VideoProfile> {
    VIDEO_PROFILES.iter().find(|p| p.name == name).copied()
}

/// Resolve a transcoding-options tag into profiles.
///
/// A tag is one or more comma-separated catalog names. Order is preserved and
/// repeats are dropped. Any unknown name rejects the whole tag.
pub fn parse_profile_tag(tag: &str) -> TypesResult<Vec<VideoProfile>> {
    let mut profiles = Vec::new();
    for name in tag.split(',').map(str::trim) {
        let profile =
            lookup_profile(name).ok_or_else(|| TypesError::UnknownProfile(name.to_string()))?;
        if !profiles.contains(&profile) {
            profiles.push(profile);
        }
    }
    Ok(profiles)
}

impl VideoProfile {
    /// Width and height parsed from the resolution string.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = self.resolution.split_once('x')?;
        Some((w.parse().ok()?, h.parse().ok()?))
    }

    /// Bitrate in kbit/s.
    pub fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate.strip_suffix('k')?.parse().ok()
    }
}

impl fmt::Display for VideoProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl TryFrom<String> for VideoProfile {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        lookup_profile(&value).ok_or(TypesError::UnknownProfile(value))
    }
}

impl<'de> Deserialize<'de> for VideoProfile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        VideoProfile::try_from(name).map_err(serde::de::Error::custom)
    }
}

impl From<VideoProfile> for String {
    fn from(profile: VideoProfile) -> Self {
        profile.name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_profile() {
        let p = lookup_profile("P240p30fps16x9").unwrap();
        assert_eq!(p.resolution, "426x240");
        assert_eq!(p.bitrate_kbps(), Some(600));
        assert_eq!(p.dimensions(), Some((426, 240)));
        assert_eq!(p.codec, "H264");
    }

    #[test]
    fn test_lookup_is_exact() {
        assert!(lookup_profile("unknown").is_none());
        assert!(lookup_profile("p240p30fps16x9").is_none());
    }

    #[test]
    fn test_parse_tag_multiple() {
        let profiles = parse_profile_tag("P240p30fps16x9, P360p30fps16x9,P240p30fps16x9").unwrap();
        let names: Vec<_> = profiles.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["P240p30fps16x9", "P360p30fps16x9"]);
    }

    #[test]
    fn test_parse_tag_unknown() {
        assert_eq!(
            parse_profile_tag("P240p30fps16x9,unknown"),
            Err(TypesError::UnknownProfile("unknown".to_string()))
        );
        assert!(parse_profile_tag("").is_err());
    }

    #[test]
    fn test_catalog_dimensions_parse() {
        for p in VIDEO_PROFILES {
            assert!(p.dimensions().is_some(), "{}", p.name);
            assert!(p.bitrate_kbps().is_some(), "{}", p.name);
        }
    }

    #[test]
    fn test_serde_uses_catalog_name() {
        let p = lookup_profile("P360p30fps16x9").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"P360p30fps16x9\"");
        let back: VideoProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<VideoProfile>("\"P9000p\"").is_err());
    }
}
