//! Board configuration record
//!
//! A fixed little-endian record: every field takes four bytes in declaration
//! order (floats as IEEE-754 bits, booleans as 0/1), followed by a `u32`
//! checksum over all preceding bytes.

use crate::error::{Result, StorageError};
use serde::Serialize;
use std::fmt;

/// Seed of the weighted checksum
pub const CHECKSUM_SEED: u32 = 0x4841_4156;

/// `SEED + Σ (i+1)·byte[i]`, wrapping.
pub fn weighted_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().enumerate().fold(CHECKSUM_SEED, |sum, (i, &b)| {
        sum.wrapping_add((i as u32).wrapping_add(1).wrapping_mul(b as u32))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldKind {
    U32,
    F32,
    Bool,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldKind::U32 => "u32",
            FieldKind::F32 => "f32",
            FieldKind::Bool => "bool",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ConfigValue {
    U32(u32),
    F32(f32),
    Bool(bool),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::U32(v) => write!(f, "{}", v),
            ConfigValue::F32(v) => write!(f, "{}", v),
            ConfigValue::Bool(v) => write!(f, "{}", if *v { 1 } else { 0 }),
        }
    }
}

fn invalid(key: &str, text: &str, kind: FieldKind) -> StorageError {
    StorageError::Parameter(format!("{:?} is not a valid {} for {}", text, kind, key))
}

trait FieldValue: Copy {
    const KIND: FieldKind;
    fn to_raw(self) -> u32;
    /// `None` for bit patterns the field cannot hold.
    fn from_raw(raw: u32) -> Option<Self>;
    fn parse(key: &str, text: &str) -> Result<Self>;
    fn to_value(self) -> ConfigValue;
}

impl FieldValue for u32 {
    const KIND: FieldKind = FieldKind::U32;

    fn to_raw(self) -> u32 {
        self
    }

    fn from_raw(raw: u32) -> Option<Self> {
        Some(raw)
    }

    /// Integers, or decimal text with no fractional part.
    fn parse(key: &str, text: &str) -> Result<Self> {
        let text = text.trim();
        if !text.contains('.') {
            return text.parse().map_err(|_| invalid(key, text, Self::KIND));
        }
        let value: f64 = text.parse().map_err(|_| invalid(key, text, Self::KIND))?;
        if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
            return Err(invalid(key, text, Self::KIND));
        }
        Ok(value as u32)
    }

    fn to_value(self) -> ConfigValue {
        ConfigValue::U32(self)
    }
}

impl FieldValue for f32 {
    const KIND: FieldKind = FieldKind::F32;

    fn to_raw(self) -> u32 {
        self.to_bits()
    }

    fn from_raw(raw: u32) -> Option<Self> {
        Some(f32::from_bits(raw))
    }

    fn parse(key: &str, text: &str) -> Result<Self> {
        let value: f32 = text
            .trim()
            .parse()
            .map_err(|_| invalid(key, text, Self::KIND))?;
        if !value.is_finite() {
            return Err(invalid(key, text, Self::KIND));
        }
        Ok(value)
    }

    fn to_value(self) -> ConfigValue {
        ConfigValue::F32(self)
    }
}

impl FieldValue for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn to_raw(self) -> u32 {
        self as u32
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn parse(key: &str, text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(invalid(key, text, Self::KIND)),
        }
    }

    fn to_value(self) -> ConfigValue {
        ConfigValue::Bool(self)
    }
}

fn unknown(key: &str) -> StorageError {
    StorageError::Parameter(format!("unknown config key {:?}", key))
}

macro_rules! board_config {
    ($( $name:ident : $ty:ty = $default:expr, $desc:literal; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        pub struct BoardConfig {
            $(
                #[doc = $desc]
                pub $name: $ty,
            )*
            /// Weighted checksum over every preceding byte
            pub checksum: u32,
        }

        const FIELD_COUNT: usize = [$(stringify!($name)),*].len();

        /// Encoded record length, checksum included
        pub const RECORD_LEN: usize = 4 * (FIELD_COUNT + 1);

        impl Default for BoardConfig {
            fn default() -> Self {
                let mut config = BoardConfig {
                    $( $name: $default, )*
                    checksum: 0,
                };
                config.seal();
                config
            }
        }

        impl BoardConfig {
            /// Schema: name, kind and description of every field
            pub const FIELDS: &'static [(&'static str, FieldKind, &'static str)] = &[
                $( (stringify!($name), <$ty as FieldValue>::KIND, $desc), )*
            ];

            /// Record bytes covered by the checksum.
            pub fn body_bytes(&self) -> Vec<u8> {
                let mut bytes = Vec::with_capacity(RECORD_LEN - 4);
                $( bytes.extend_from_slice(&FieldValue::to_raw(self.$name).to_le_bytes()); )*
                bytes
            }

            /// Decode a record. The checksum is carried, not verified; a boolean
            /// field holding anything but 0 or 1 is [`StorageError::Data`].
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != RECORD_LEN {
                    return Err(StorageError::Data(format!(
                        "config record of {} bytes, expected {}",
                        bytes.len(),
                        RECORD_LEN
                    )));
                }
                let mut words = bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                let mut next = || words.next().unwrap_or(0);
                Ok(BoardConfig {
                    $(
                        $name: <$ty as FieldValue>::from_raw(next()).ok_or_else(|| {
                            StorageError::Data(format!("{} out of range", stringify!($name)))
                        })?,
                    )*
                    checksum: next(),
                })
            }

            pub fn get(&self, key: &str) -> Result<ConfigValue> {
                match key {
                    $( stringify!($name) => Ok(FieldValue::to_value(self.$name)), )*
                    _ => Err(unknown(key)),
                }
            }

            /// Parse `text` for `key`'s type and apply it. The checksum is
            /// left stale until the next seal.
            pub fn set(&mut self, key: &str, text: &str) -> Result<ConfigValue> {
                match key {
                    $(
                        stringify!($name) => {
                            self.$name = <$ty as FieldValue>::parse(key, text)?;
                            Ok(FieldValue::to_value(self.$name))
                        }
                    )*
                    _ => Err(unknown(key)),
                }
            }
        }
    };
}

board_config! {
    control_loop_period_ms: u32 = 10, "Period between state estimation updates (ms)";
    sensor_loop_period_ms: u32 = 100, "Period between sensor reads without control requests (ms)";
    storage_loop_period_ms: u32 = 1000, "Period between file system flushes and pause checks (ms)";
    gps_loop_period_ms: u32 = 200, "Period between GPS polls (ms)";
    pspcom_rx_loop_period_ms: u32 = 100, "Period for checking incoming telemetry messages (ms)";
    pspcom_tx_ground_loop_period_ms: u32 = 5000, "Period for sending telemetry on the ground (ms)";
    pspcom_tx_flight_loop_period_ms: u32 = 1000, "Period for sending telemetry in flight (ms)";
    state_init_time_ms: u32 = 10000, "Duration to determine baseline sensor values (ms)";
    boost_detect_period_ms: u32 = 500, "Time for accel to exceed threshold for launch detection (ms)";
    launch_detect_replay: bool = true, "Replay state estimation over the launch detection interval (1/0)";
    min_fast_vel_mps: f32 = 300.0, "Minimum velocity considered fast (m/s)";
    min_boost_acc_mps2: f32 = 25.0, "Minimum acceleration for boost detection (m/s^2)";
    max_coast_acc_mps2: f32 = 0.0, "Maximum acceleration for coast detection (m/s^2)";
    max_grounded_alt_m: f32 = 100.0, "Maximum altitude to be considered grounded (m)";
    min_grounded_time_ms: f32 = 10000.0, "Minimum grounded time for transition (ms)";
    stage_is_separator_bool: bool = true, "Fire the stage separation charge (1/0)";
    stage_sep_lockout_ms: u32 = 4500, "Lockout after launch for stage separation (ms)";
    stage_sep_delay_ms: u32 = 800, "Delay after burnout for stage separation (ms)";
    stage_min_sep_velocity_mps: f32 = -1e9, "Minimum separation velocity (m/s)";
    stage_max_sep_velocity_mps: f32 = 1e9, "Maximum separation velocity (m/s)";
    stage_min_sep_altitude_m: f32 = 100.0, "Minimum separation altitude (m)";
    stage_max_sep_altitude_m: f32 = 1e9, "Maximum separation altitude (m)";
    stage_min_sep_angle_deg: f32 = -1e4, "Minimum angle from vertical for separation (deg)";
    stage_max_sep_angle_deg: f32 = 1e4, "Maximum angle from vertical for separation (deg)";
    stage_sep_pyro_channel: u32 = 2, "Pyro channel for stage separation";
    stage_is_igniter_bool: bool = false, "Ignite the next motor after separation (1/0)";
    stage_ignite_lockout_ms: u32 = 5000, "Lockout after launch for ignition (ms)";
    stage_min_ignite_velocity_mps: f32 = 60.96, "Minimum velocity for ignition (m/s)";
    stage_max_ignite_velocity_mps: f32 = 1e6, "Maximum velocity for ignition (m/s)";
    stage_min_ignite_altitude_m: f32 = 100.0, "Minimum altitude for ignition (m)";
    stage_max_ignite_altitude_m: f32 = 1e6, "Maximum altitude for ignition (m)";
    stage_min_ignite_angle_deg: f32 = 0.0, "Minimum angle from vertical for ignition (deg)";
    stage_max_ignite_angle_deg: f32 = 0.0, "Maximum angle from vertical for ignition (deg)";
    stage_ignite_pyro_channel: u32 = 2, "Pyro channel for stage ignition";
    main_height_m: f32 = 300.0, "Altitude for deploying the main parachute (m)";
    drogue_delay_ms: u32 = 0, "Delay after apogee for drogue deployment (ms)";
    deploy_lockout_ms: u32 = 10000, "Lockout after launch for pyro deployment (ms)";
    telemetry_frequency_hz: u32 = 433_000_000, "Telemetry carrier frequency (Hz)";
}

impl BoardConfig {
    pub fn field_names() -> impl Iterator<Item = &'static str> {
        Self::FIELDS.iter().map(|(name, _, _)| *name)
    }

    pub fn kind_of(key: &str) -> Option<FieldKind> {
        Self::FIELDS
            .iter()
            .find(|(name, _, _)| *name == key)
            .map(|(_, kind, _)| *kind)
    }

    pub fn compute_checksum(&self) -> u32 {
        weighted_checksum(&self.body_bytes())
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        bytes.extend_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// One line per field: `name (kind) = value  # description`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (name, kind, desc) in Self::FIELDS {
            let value = self
                .get(name)
                .map(|v| v.to_string())
                .unwrap_or_default();
            out.push_str(&format!("{} ({}) = {}  # {}\n", name, kind, value, desc));
        }
        out.push_str(&format!("checksum = {:08x}\n", self.checksum));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_formula() {
        assert_eq!(weighted_checksum(&[0x01, 0x02]), CHECKSUM_SEED + 5);
        assert_eq!(weighted_checksum(&[]), CHECKSUM_SEED);
    }

    #[test]
    fn test_checksum_wraps() {
        let bytes = vec![0xFF; 100_000];
        // Must not panic on overflow.
        let _ = weighted_checksum(&bytes);
    }

    #[test]
    fn test_defaults_are_sealed() {
        let config = BoardConfig::default();
        assert!(config.is_valid());
        assert_eq!(config.storage_loop_period_ms, 1000);
        assert_eq!(config.telemetry_frequency_hz, 433_000_000);
        assert!(config.launch_detect_replay);
        assert_eq!(config.to_bytes().len(), RECORD_LEN);
    }

    #[test]
    fn test_record_round_trip_keeps_checksum() {
        let mut config = BoardConfig::default();
        config.main_height_m = 250.5;
        config.seal();
        let decoded = BoardConfig::from_bytes(&config.to_bytes()).unwrap();
        assert_eq!(decoded, config);
        assert!(decoded.is_valid());

        let mut bytes = config.to_bytes();
        bytes[0] ^= 1;
        assert!(!BoardConfig::from_bytes(&bytes).unwrap().is_valid());
        assert!(BoardConfig::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_set_coerces_by_field_kind() {
        let mut config = BoardConfig::default();
        assert_eq!(
            config.set("storage_loop_period_ms", "250").unwrap(),
            ConfigValue::U32(250)
        );
        assert_eq!(
            config.set("storage_loop_period_ms", "300.0").unwrap(),
            ConfigValue::U32(300)
        );
        assert!(config.set("storage_loop_period_ms", "1.5").is_err());
        assert!(config.set("storage_loop_period_ms", "-1").is_err());

        assert_eq!(config.set("main_height_m", "150").unwrap(), ConfigValue::F32(150.0));
        assert_eq!(
            config.set("launch_detect_replay", "0").unwrap(),
            ConfigValue::Bool(false)
        );
        assert!(config.set("launch_detect_replay", "maybe").is_err());
        assert!(matches!(
            config.set("no_such_key", "1"),
            Err(StorageError::Parameter(_))
        ));
        assert!(!config.is_valid());
    }

    #[test]
    fn test_schema_lookup() {
        assert_eq!(BoardConfig::kind_of("main_height_m"), Some(FieldKind::F32));
        assert_eq!(BoardConfig::kind_of("checksum"), None);
        assert_eq!(BoardConfig::field_names().count(), FIELD_COUNT);
        let text = BoardConfig::default().describe();
        assert!(text.contains("storage_loop_period_ms (u32) = 1000"));
    }
}
