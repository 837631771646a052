use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-', '_' or '.'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                if raw.starts_with('.') {
                    return Err(format!("{} must not start with '.'", $kind));
                }
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(RunId, "run id");
define_id_type!(ProcessId, "process id");
define_id_type!(TaskName, "task name");
define_id_type!(StepId, "step id");
define_id_type!(EffectId, "effect id");
define_id_type!(BreakpointId, "breakpoint id");

impl EffectId {
    /// Counter-derived id: `0007-sast-scan`.
    pub fn from_sequence(task: &TaskName, sequence: u64) -> Self {
        Self(format!("{sequence:04}-{task}"))
    }

    /// Caller-keyed id: `k.sast-scan.image-3`. Keys may not contain '.', so the
    /// last segment is always the key.
    pub fn from_key(task: &TaskName, key: &str) -> Result<Self, String> {
        validate_identifier_value("effect key", key)?;
        if key.contains('.') {
            return Err("effect key must not contain '.'".to_string());
        }
        Ok(Self(format!("k.{task}.{key}")))
    }
}

impl BreakpointId {
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("bp-{sequence:04}"))
    }
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        let idx = (value % 36) as usize;
        chars.push(BASE36_ALPHABET[idx] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

pub fn generate_run_id(now: i64) -> Result<RunId, String> {
    let timestamp =
        u64::try_from(now).map_err(|_| "run id requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate run id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE;
    let ts = base36_encode_u64(timestamp);
    let suffix = base36_encode_fixed_u32(sample, 4);
    RunId::parse(&format!("run-{ts}-{suffix}"))
}
