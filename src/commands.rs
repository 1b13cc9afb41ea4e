//! Command codes and payload helpers for common receiver features.
//!
//! The session transports any command code; this module only names the
//! handful that most integrations need and knows how to read their replies.

use crate::error::{ArcamError, Result};
use crate::protocol::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const POWER: u8 = 0x00;
pub const SOFTWARE_VERSION: u8 = 0x04;
pub const RC5_SIMULATE: u8 = 0x08;
pub const VOLUME: u8 = 0x0D;
pub const MUTE: u8 = 0x0E;
pub const SOURCE: u8 = 0x1D;

/// Parameter asking for the current value instead of setting one
pub const STATUS_REQUEST: u8 = 0xF0;

/// Highest volume step accepted by the receiver
pub const VOLUME_MAX: u8 = 99;

/// RC5 system/command pair for mute toggle
pub const RC5_MUTE: [u8; 2] = [0x10, 0x0D];

/// Input source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Cd,
    Bd,
    Av,
    Stb,
    Sat,
    Pvr,
    Vcr,
    Aux,
    Game,
    Net,
    Fm,
    Dab,
    Bt,
    Usb,
    Uhd,
}

impl Source {
    /// All sources, ordered by status code
    pub const ALL: [Source; 15] = [
        Source::Cd,
        Source::Bd,
        Source::Av,
        Source::Stb,
        Source::Sat,
        Source::Pvr,
        Source::Vcr,
        Source::Aux,
        Source::Game,
        Source::Net,
        Source::Fm,
        Source::Dab,
        Source::Bt,
        Source::Usb,
        Source::Uhd,
    ];

    /// Short name as printed on the front panel
    pub fn name(self) -> &'static str {
        match self {
            Source::Cd => "CD",
            Source::Bd => "BD",
            Source::Av => "AV",
            Source::Stb => "STB",
            Source::Sat => "SAT",
            Source::Pvr => "PVR",
            Source::Vcr => "VCR",
            Source::Aux => "AUX",
            Source::Game => "GAME",
            Source::Net => "NET",
            Source::Fm => "FM",
            Source::Dab => "DAB",
            Source::Bt => "BT",
            Source::Usb => "USB",
            Source::Uhd => "UHD",
        }
    }

    /// Value reported by a source status query
    pub fn status_code(self) -> u8 {
        Self::ALL.iter().position(|&s| s == self).unwrap_or_default() as u8
    }

    pub fn from_status_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// RC5 system/command pair that selects this source
    pub fn rc5(self) -> [u8; 2] {
        let command = match self {
            Source::Cd => 0x76,
            Source::Bd => 0x62,
            Source::Av => 0x5E,
            Source::Stb => 0x64,
            Source::Sat => 0x1B,
            Source::Pvr => 0x60,
            // VCR and AUX share an IR code
            Source::Vcr | Source::Aux => 0x63,
            Source::Game => 0x61,
            Source::Net => 0x5C,
            Source::Fm => 0x1C,
            Source::Dab => 0x48,
            Source::Bt => 0x7A,
            Source::Usb => 0x7B,
            Source::Uhd => 0x7D,
        };
        [0x10, command]
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Source {
    type Err = ArcamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|source| source.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ArcamError::Encoding(format!("unknown source: {}", s)))
    }
}

impl Command {
    pub fn power_on(zone: u8) -> Self {
        Self::new(zone, POWER, [0x01])
    }

    /// Put the zone into standby
    pub fn power_off(zone: u8) -> Self {
        Self::new(zone, POWER, [0x00])
    }

    pub fn power_status(zone: u8) -> Self {
        Self::new(zone, POWER, [STATUS_REQUEST])
    }

    /// Set the volume step, 0 to [`VOLUME_MAX`]
    pub fn set_volume(zone: u8, volume: u8) -> Result<Self> {
        if volume > VOLUME_MAX {
            return Err(ArcamError::Encoding(format!(
                "invalid volume: {} (must be 0-{})",
                volume, VOLUME_MAX
            )));
        }
        Ok(Self::new(zone, VOLUME, [volume]))
    }

    pub fn volume_status(zone: u8) -> Self {
        Self::new(zone, VOLUME, [STATUS_REQUEST])
    }

    pub fn mute_status(zone: u8) -> Self {
        Self::new(zone, MUTE, [STATUS_REQUEST])
    }

    pub fn toggle_mute(zone: u8) -> Self {
        Self::simulate_rc5(zone, RC5_MUTE)
    }

    pub fn source_status(zone: u8) -> Self {
        Self::new(zone, SOURCE, [STATUS_REQUEST])
    }

    pub fn select_source(zone: u8, source: Source) -> Self {
        Self::simulate_rc5(zone, source.rc5())
    }

    pub fn software_version(zone: u8) -> Self {
        Self::new(zone, SOFTWARE_VERSION, [STATUS_REQUEST])
    }

    /// Simulate an IR remote key press
    pub fn simulate_rc5(zone: u8, rc5: [u8; 2]) -> Self {
        Self::new(zone, RC5_SIMULATE, rc5)
    }
}

fn single_byte(payload: &[u8], what: &str) -> Result<u8> {
    match payload {
        [value] => Ok(*value),
        _ => Err(ArcamError::InvalidResponse(format!(
            "{} payload must be 1 byte, got {}",
            what,
            payload.len()
        ))),
    }
}

pub fn decode_power(payload: &[u8]) -> Result<bool> {
    Ok(single_byte(payload, "power")? == 0x01)
}

pub fn decode_volume(payload: &[u8]) -> Result<u8> {
    single_byte(payload, "volume")
}

pub fn decode_mute(payload: &[u8]) -> Result<bool> {
    Ok(single_byte(payload, "mute")? == 0x01)
}

pub fn decode_source(payload: &[u8]) -> Result<Source> {
    let code = single_byte(payload, "source")?;
    Source::from_status_code(code)
        .ok_or_else(|| ArcamError::InvalidResponse(format!("unknown source code 0x{:02X}", code)))
}

/// Software version text, e.g. `"2.01/0.03/1."`
pub fn decode_software_version(payload: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(payload)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| ArcamError::InvalidResponse("version is not ASCII".to_string()))?;
    Ok(text.trim_end_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    #[test]
    fn test_power_commands() {
        assert_eq!(
            encode(&Command::power_on(1)).unwrap(),
            vec![0x21, 0x01, 0x00, 0x01, 0x01, 0x0D]
        );
        assert_eq!(Command::power_off(2).payload(), &[0x00]);
        assert_eq!(Command::power_status(1).payload(), &[STATUS_REQUEST]);
    }

    #[test]
    fn test_set_volume_bounds() {
        assert_eq!(Command::set_volume(1, 45).unwrap().payload(), &[45]);
        assert_eq!(Command::set_volume(1, VOLUME_MAX).unwrap().code(), VOLUME);
        assert!(matches!(
            Command::set_volume(1, 100),
            Err(ArcamError::Encoding(_))
        ));
    }

    #[test]
    fn test_rc5_commands() {
        let mute = Command::toggle_mute(1);
        assert_eq!(mute.code(), RC5_SIMULATE);
        assert_eq!(mute.payload(), &RC5_MUTE);

        let bd = Command::select_source(1, Source::Bd);
        assert_eq!(
            encode(&bd).unwrap(),
            vec![0x21, 0x01, 0x08, 0x02, 0x10, 0x62, 0x0D]
        );
    }

    #[test]
    fn test_source_codes() {
        assert_eq!(Source::Cd.status_code(), 0x00);
        assert_eq!(Source::Uhd.status_code(), 0x0E);
        for source in Source::ALL {
            assert_eq!(Source::from_status_code(source.status_code()), Some(source));
        }
        assert_eq!(Source::from_status_code(0x0F), None);
        assert_eq!(Source::Vcr.rc5(), Source::Aux.rc5());
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!("bd".parse::<Source>().unwrap(), Source::Bd);
        assert_eq!(" Game ".parse::<Source>().unwrap(), Source::Game);
        assert!("LASERDISC".parse::<Source>().is_err());
        assert_eq!(Source::Stb.to_string(), "STB");
    }

    #[test]
    fn test_decoders() {
        assert!(decode_power(&[0x01]).unwrap());
        assert!(!decode_power(&[0x00]).unwrap());
        assert_eq!(decode_volume(&[0x2D]).unwrap(), 45);
        assert!(decode_mute(&[0x01]).unwrap());
        assert_eq!(decode_source(&[0x03]).unwrap(), Source::Stb);
        assert!(matches!(
            decode_volume(&[]),
            Err(ArcamError::InvalidResponse(_))
        ));
        assert!(decode_power(&[0x01, 0x00]).is_err());
        assert!(decode_source(&[0x42]).is_err());
    }

    #[test]
    fn test_decode_software_version() {
        assert_eq!(
            decode_software_version(b"2.01/0.03/1.").unwrap(),
            "2.01/0.03/1."
        );
        assert_eq!(decode_software_version(b"1.5\0\0").unwrap(), "1.5");
        assert!(decode_software_version(&[0xFF, 0xFE]).is_err());
    }
}
