//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNPQRSTUVWXZ";
const NUMBERS: &[u8] = b"0123456789";
const VOWELS: &str = "AEIOU";
const ODD: &str = "13579";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bomb serial number '{0}'")]
pub struct InvalidSerial(String);

/// The six-character serial printed on the bomb casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BombSerial(String);

/// Allowed characters for each serial position.
fn position_pools() -> [Vec<u8>; 6] {
    let both: Vec<u8> = LETTERS.iter().chain(NUMBERS).copied().collect();
    [
        both.clone(),
        both,
        NUMBERS.to_vec(),
        LETTERS.to_vec(),
        LETTERS.to_vec(),
        NUMBERS.to_vec(),
    ]
}

impl BombSerial {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let serial = position_pools()
            .iter()
            .filter_map(|pool| pool.choose(rng).map(|&byte| char::from(byte)))
            .collect();
        Self(serial)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether any of `chars` appears in the serial.
    pub fn has(&self, chars: &str) -> bool {
        self.0.chars().any(|c| chars.contains(c))
    }

    pub fn last_is(&self, chars: &str) -> bool {
        self.0.chars().last().is_some_and(|c| chars.contains(c))
    }

    pub fn has_vowel(&self) -> bool {
        self.has(VOWELS)
    }

    pub fn last_is_odd(&self) -> bool {
        self.last_is(ODD)
    }
}

impl FromStr for BombSerial {
    type Err = InvalidSerial;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        let pools = position_pools();
        let valid = upper.len() == pools.len()
            && upper
                .bytes()
                .zip(pools.iter())
                .all(|(byte, pool)| pool.contains(&byte));
        if valid {
            Ok(Self(upper))
        } else {
            Err(InvalidSerial(value.to_owned()))
        }
    }
}

impl fmt::Display for BombSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
