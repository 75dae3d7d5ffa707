//! Static camera model registry (marketName <-> platform/sysid).
//!
//! Mirrors `CameraModelDatabase` from the reference implementation: a closed set of
//! commercial model identifiers mapped to their hardware platform code and 16-bit
//! sysid. Immutable and process-wide.

use std::collections::HashMap;
use std::sync::LazyLock;

macro_rules! platform_table {
    ($($name:expr => $platform:expr),* $(,)?) => {
        &[$(($name, $platform)),*]
    };
}

macro_rules! sysid_table {
    ($($name:expr => $sysid:expr),* $(,)?) => {
        &[$(($name, $sysid as u16)),*]
    };
}

const PLATFORMS: &[(&str, &str)] = platform_table! {
    // Early cameras
    "UVC" => "s2l",
    "UVC_PRO" => "s2l",
    "UVC_DOME" => "s2l",
    "UVC_MICRO" => "s2l",

    // G3 Series
    "UVC_G3" => "s2lm",
    "UVC_G3_DOME" => "s2lm",
    "UVC_G3_MICRO" => "s2lm",
    "UVC_G3_MINI" => "s2lm",
    "UVC_G3_INSTANT" => "s2lm",
    "UVC_G3_PRO" => "s2lm",
    "UVC_G3_FLEX" => "s2lm",

    // G4 Series
    "UVC_G4_BULLET" => "s5l",
    "UVC_G4_PRO" => "s5l",
    "UVC_G4_PTZ" => "s5l",
    "UVC_G4_DOME" => "s5l",
    "UVC_G4_INSTANT" => "cv22",
    "UVC_G4_DOORBELL" => "cv22",
    "UVC_G4_DOORBELL_PRO" => "cv25z",
    "UVC_G4_DOORBELL_PRO_WHITE" => "cv25z",
    "UVC_G4_DOORBELL_PRO_POE" => "cv25z",
    "UVC_G4_DOORBELL_PRO_POE_WHITE" => "cv25z",

    // G5 Series
    "UVC_G5_BULLET" => "cv2x",
    "UVC_G5_DOME" => "cv2x",
    "UVC_G5_FLEX" => "cv2x",
    "UVC_G5_PRO" => "cv2x",
    "UVC_G5_PTZ" => "cv2x",
    "UVC_G5_DOME_ULTRA" => "cv2x",
    "UVC_G5_DOME_ULTRA_BLACK" => "cv2x",
    "UVC_G5_TURRET_ULTRA" => "cv2x",
    "UVC_G5_TURRET_ULTRA_BLACK" => "cv2x",

    // G6 Series
    "UVC_G6_BULLET" => "cv2x",
    "UVC_G6_BULLET_BLACK" => "cv2x",
    "UVC_G6_DOME" => "cv2x",
    "UVC_G6_DOME_BLACK" => "cv2x",
    "UVC_G6_TURRET" => "cv2x",
    "UVC_G6_TURRET_BLACK" => "cv2x",
    "UVC_G6_INSTANT" => "cv2x",
    "UVC_G6_PTZ" => "cv2x",
    "UVC_G6_PTZ_BLACK" => "cv2x",
    "UVC_G6_PRO_360" => "cv2x",
    "UVC_G6_PRO_360_BLACK" => "cv2x",
    "UVC_G6_PRO_BULLET" => "cv2x",
    "UVC_G6_180" => "cv2x",

    // AI Series
    "UVC_AI_360" => "cv25z",
    "UVC_AI_360_WHITE" => "cv25z",
    "UVC_AI_BULLET" => "cv25z",
    "UVC_AI_DSLR" => "cv25z",
    "UVC_AI_PRO" => "cv25z",
    "UVC_AI_PRO_WHITE" => "cv25z",
    "UVC_AI_PRO_LPR" => "cv25z",
    "UVC_AI_LPR" => "cv25z",
    "UVC_AI_THETA" => "cv25z",
    "UVC_AI_DOME" => "cv25z",
    "UVC_AI_TURRET" => "cv25z",
    "UVC_AI_PTZ" => "cv25z",
    "UVC_AI_PTZ_WHITE" => "cv25z",
    "UVC_AI_PTZ_PRECISION" => "cv25z",
    "UVC_AI_PTZ_PRECISION_WHITE" => "cv25z",

    // Doorbell Lite
    "UVC_DOORBELL_LITE" => "cv22",
    "UVC_DOORBELL_LITE_WHITE" => "cv22",

    // Other
    "AFI_VC" => "s2l",
    "VISION_PRO" => "cv25z",
};

const SYSIDS: &[(&str, u16)] = sysid_table! {
    "AFI_VC" => 0xa553,
    "UVC" => 0xa524,
    "UVC_AI_360" => 0xa5a0,
    "UVC_AI_BULLET" => 0xa5a2,
    "UVC_AI_THETA" => 0xa5a3,
    "UVC_AI_DSLR" => 0xa5b0,
    "UVC_AI_PRO" => 0xa5a4,
    "UVC_AI_DOME" => 0xa5a5,
    "UVC_AI_TURRET" => 0xa5a6,
    "UVC_AI_LPR" => 0xa5a7,
    "UVC_DOME" => 0xa525,
    "UVC_G3" => 0xa531,
    "UVC_G3_DOME" => 0xa533,
    "UVC_G3_FLEX" => 0xa534,
    "UVC_G3_MICRO" => 0xa552,
    "UVC_G3_INSTANT" => 0xa590,
    "UVC_G3_PRO" => 0xa532,
    "UVC_G4_PRO" => 0xa563,
    "UVC_G4_PTZ" => 0xa564,
    "UVC_G4_DOORBELL" => 0xa571,
    "UVC_G4_DOORBELL_PRO" => 0xa574,
    "UVC_G4_DOORBELL_PRO_WHITE" => 0xa576,
    "UVC_G4_DOORBELL_PRO_POE" => 0xa575,
    "UVC_G4_BULLET" => 0xa572,
    "UVC_G4_DOME" => 0xa573,
    "UVC_G4_INSTANT" => 0xa595,
    "UVC_G5_BULLET" => 0xa591,
    "UVC_G5_DOME" => 0xa592,
    "UVC_G5_FLEX" => 0xa593,
    "UVC_G5_PRO" => 0xa598,
    "UVC_G5_PTZ" => 0xa59b,
    "UVC_G5_DOME_ULTRA" => 0xa59d,
    "UVC_G5_TURRET_ULTRA" => 0xa59c,
    "UVC_MICRO" => 0xa526,
    "UVC_PRO" => 0xa521,
    "VISION_PRO" => 0xa551,
    "UVC_G6_BULLET" => 0xa600,
    "UVC_G6_BULLET_BLACK" => 0xa06a,
    "UVC_G6_TURRET" => 0xa601,
    "UVC_G6_TURRET_BLACK" => 0xa06b,
    "UVC_G6_DOME" => 0xa602,
    "UVC_G6_DOME_BLACK" => 0xa06c,
    "UVC_G6_INSTANT" => 0xa603,
    "UVC_AI_PTZ" => 0xa604,
    "UVC_AI_PTZ_WHITE" => 0xa065,
    "UVC_G6_PTZ" => 0xa605,
    "UVC_G6_PTZ_BLACK" => 0xa606,
    "UVC_DOORBELL_LITE" => 0xa061,
    "UVC_DOORBELL_LITE_WHITE" => 0xa062,
    "UVC_G6_PRO_360" => 0xa60f,
    "UVC_G6_PRO_360_BLACK" => 0xa060,
    "UVC_G6_PRO_BULLET" => 0xa607,
    "UVC_G6_180" => 0xa60e,
    "UVC_AI_PTZ_PRECISION" => 0xa067,
    "UVC_AI_PTZ_PRECISION_WHITE" => 0xa066,
};

const EOL_TYPES: &[&str] = &["UVC", "UVC_PRO", "UVC_DOME", "UVC_MICRO"];

static PLATFORM_MAP: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| PLATFORMS.iter().copied().collect());

static SYSID_MAP: LazyLock<HashMap<&'static str, u16>> =
    LazyLock::new(|| SYSIDS.iter().copied().collect());

static SYSID_TO_MODEL: LazyLock<HashMap<u16, &'static str>> =
    LazyLock::new(|| SYSIDS.iter().map(|(name, id)| (*id, *name)).collect());

/// Hardware platform code for a marketName, e.g. `UVC_G4_DOME` -> `s5l`.
pub fn platform(market_name: &str) -> Option<&'static str> {
    PLATFORM_MAP.get(market_name).copied()
}

/// 16-bit sysid for a marketName, e.g. `UVC_G4_DOME` -> `0xa573`.
pub fn sysid(market_name: &str) -> Option<u16> {
    SYSID_MAP.get(market_name).copied()
}

/// Reverse lookup: marketName for a 16-bit sysid, if known.
pub fn model_by_sysid(id: u16) -> Option<&'static str> {
    SYSID_TO_MODEL.get(&id).copied()
}

/// Whether the original source flags this marketName end-of-life.
pub fn is_eol(market_name: &str) -> bool {
    EOL_TYPES.contains(&market_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_resolves_platform_and_sysid() {
        assert_eq!(platform("UVC_G4_DOME"), Some("s5l"));
        assert_eq!(sysid("UVC_G4_DOME"), Some(0xa573));
    }

    #[test]
    fn unknown_model_resolves_to_none() {
        assert_eq!(platform("NOT_A_REAL_MODEL"), None);
        assert_eq!(sysid("NOT_A_REAL_MODEL"), None);
    }

    #[test]
    fn sysid_reverse_lookup_matches_forward() {
        let id = sysid("UVC_G4_DOME").unwrap();
        assert_eq!(model_by_sysid(id), Some("UVC_G4_DOME"));
    }

    #[test]
    fn eol_list_matches_source() {
        assert!(is_eol("UVC"));
        assert!(!is_eol("UVC_G4_DOME"));
    }
}
