// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static configuration knobs.
//!
//! Values are looked up by name in a [`ConfigStore`]. [`NfcConfig`] is the
//! default store; it is filled from the `libnfc-*.conf` text format:
//!
//! ```text
//! # comment
//! NAME=10
//! NAME=0x1F
//! NAME="string"
//! NAME={01:02:03}
//! ```

use anyhow::Context;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_OFFHOST_ROUTE: &str = "DEFAULT_OFFHOST_ROUTE";
pub const DEFAULT_NFCF_ROUTE: &str = "DEFAULT_NFCF_ROUTE";
pub const DEFAULT_ROUTE: &str = "DEFAULT_ROUTE";
pub const NXP_DEFAULT_SE: &str = "NXP_DEFAULT_SE";
pub const AID_MATCHING_MODE: &str = "AID_MATCHING_MODE";
pub const DEFAULT_SYS_CODE_ROUTE: &str = "DEFAULT_SYS_CODE_ROUTE";
pub const DEFAULT_SYS_CODE_PWR_STATE: &str = "DEFAULT_SYS_CODE_PWR_STATE";
pub const DEFAULT_SYS_CODE: &str = "DEFAULT_SYS_CODE";
pub const HOST_LISTEN_TECH_MASK: &str = "HOST_LISTEN_TECH_MASK";
pub const FORWARD_FUNCTIONALITY_ENABLE: &str = "FORWARD_FUNCTIONALITY_ENABLE";
pub const DEFAULT_FELICA_CLT_PWR_STATE: &str = "DEFAULT_FELICA_CLT_PWR_STATE";
pub const DEFAULT_AID_ROUTE: &str = "DEFAULT_AID_ROUTE";
pub const DEFAULT_AID_PWR_STATE: &str = "DEFAULT_AID_PWR_STATE";
pub const UICC_LISTEN_TECH_MASK: &str = "UICC_LISTEN_TECH_MASK";
/// Spelling matches the key found in deployed configuration files.
pub const DEFAULT_GSMA_PWR_STATE: &str = "DEFUALT_GSMA_PWR_STATE";
pub const CHECK_DEFAULT_PROTO_SE_ID: &str = "CHECK_DEFAULT_PROTO_SE_ID";
pub const NXP_CE_ROUTE_STRICT_DISABLE: &str = "NXP_CE_ROUTE_STRICT_DISABLE";
pub const NXP_DUAL_UICC_ENABLE: &str = "NXP_DUAL_UICC_ENABLE";
pub const NXP_UICC2_SELECTED: &str = "NXP_UICC2_SELECTED";
pub const DEFAULT_TECH_ABF_ROUTE: &str = "DEFAULT_TECH_ABF_ROUTE";
pub const DEFAULT_TECH_ABF_PWR_STATE: &str = "DEFAULT_TECH_ABF_PWR_STATE";
pub const DEFAULT_ISODEP_ROUTE: &str = "DEFAULT_ISODEP_ROUTE";
pub const DEFAULT_ISODEP_PWR_STATE: &str = "DEFAULT_ISODEP_PWR_STATE";
pub const NXP_DEFAULT_NFCEE_TIMEOUT: &str = "NXP_DEFAULT_NFCEE_TIMEOUT";
pub const NXP_EE_RECOVERY_TIMEOUT: &str = "NXP_EE_RECOVERY_TIMEOUT";

/// Read-only key/value lookup.
pub trait ConfigStore: Send + Sync {
    /// Unsigned value of `key`, or `default` when the key is absent or
    /// does not hold a number.
    fn get_unsigned(&self, key: &str, default: u32) -> u32;

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;

    fn get_string(&self, key: &str) -> Option<String>;

    fn has_key(&self, key: &str) -> bool;
}

/// Value of a configuration entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Unsigned(u32),
    Bytes(Vec<u8>),
    String(String),
}

/// Immutable configuration store.
#[derive(Clone, Debug, Default)]
pub struct NfcConfig {
    values: HashMap<String, ConfigValue>,
}

/// Programmatic construction of an [`NfcConfig`].
#[derive(Debug, Default)]
pub struct NfcConfigBuilder {
    values: HashMap<String, ConfigValue>,
}

impl NfcConfigBuilder {
    pub fn unsigned(mut self, key: &str, value: u32) -> Self {
        self.values.insert(key.to_owned(), ConfigValue::Unsigned(value));
        self
    }

    pub fn bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.values.insert(key.to_owned(), ConfigValue::Bytes(value.to_vec()));
        self
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_owned(), ConfigValue::String(value.to_owned()));
        self
    }

    pub fn build(self) -> NfcConfig {
        NfcConfig { values: self.values }
    }
}

impl NfcConfig {
    pub fn builder() -> NfcConfigBuilder {
        NfcConfigBuilder::default()
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<NfcConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let config = NfcConfig::parse(&text);
        debug!("loaded {} configuration entries from {}", config.len(), path.display());
        Ok(config)
    }

    /// Parse configuration text. Malformed entries are skipped.
    pub fn parse(text: &str) -> NfcConfig {
        let mut values = HashMap::new();
        let mut pending: Option<String> = None;

        for line in text.lines() {
            // Byte arrays may span several lines until the closing brace.
            let entry = match pending.take() {
                Some(mut partial) => {
                    partial.push(' ');
                    partial.push_str(line);
                    partial
                }
                None => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    trimmed.to_owned()
                }
            };
            if entry.contains('{') && !entry.contains('}') {
                pending = Some(entry);
                continue;
            }
            match parse_entry(&entry) {
                Some((name, value)) => {
                    values.insert(name, value);
                }
                None => warn!("skipping malformed configuration entry: {}", entry),
            }
        }

        if let Some(partial) = pending {
            warn!("skipping unterminated configuration entry: {}", partial);
        }
        NfcConfig { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }
}

impl ConfigStore for NfcConfig {
    fn get_unsigned(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            Some(ConfigValue::Unsigned(value)) => *value,
            _ => default,
        }
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.values.get(key) {
            Some(ConfigValue::Bytes(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some(ConfigValue::String(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn has_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

fn parse_entry(entry: &str) -> Option<(String, ConfigValue)> {
    let (name, value) = entry.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let value = value.trim();
    let value = if let Some(rest) = value.strip_prefix('"') {
        let (string, _) = rest.split_once('"')?;
        ConfigValue::String(string.to_owned())
    } else if let Some(rest) = value.strip_prefix('{') {
        let (body, _) = rest.split_once('}')?;
        let bytes = body
            .split(|c: char| c == ':' || c == ',' || c == '-' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(|token| u8::from_str_radix(token, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        ConfigValue::Bytes(bytes)
    } else {
        let number = value.split('#').next().unwrap_or_default().trim();
        let parsed = match number.strip_prefix("0x").or_else(|| number.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse::<u32>().ok()?,
        };
        ConfigValue::Unsigned(parsed)
    };

    Some((name.to_owned(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Listen mode routing
DEFAULT_OFFHOST_ROUTE=0x80
DEFAULT_AID_PWR_STATE=59   # trailing comment
NXP_DEFAULT_SE=0x02
DEFAULT_SYS_CODE={FE:FE}
NXP_CORE_CONF={ 20, 02, 07,
        01, 32 }
NFA_STORAGE="/data/nfc"
not a valid line
BROKEN={zz}
"#;

    #[test]
    fn parses_every_value_kind() {
        let config = NfcConfig::parse(SAMPLE);
        assert_eq!(config.get_unsigned(DEFAULT_OFFHOST_ROUTE, 0), 0x80);
        assert_eq!(config.get_unsigned(DEFAULT_AID_PWR_STATE, 0), 59);
        assert_eq!(config.get_bytes(DEFAULT_SYS_CODE), Some(vec![0xFE, 0xFE]));
        assert_eq!(config.get_bytes("NXP_CORE_CONF"), Some(vec![0x20, 0x02, 0x07, 0x01, 0x32]));
        assert_eq!(config.get_string("NFA_STORAGE").as_deref(), Some("/data/nfc"));
        assert!(!config.has_key("BROKEN"));
        assert_eq!(config.len(), 6);
    }

    #[test]
    fn missing_or_mistyped_keys_use_defaults() {
        let config = NfcConfig::parse(SAMPLE);
        assert_eq!(config.get_unsigned(HOST_LISTEN_TECH_MASK, 0x03), 0x03);
        assert_eq!(config.get_unsigned(DEFAULT_SYS_CODE, 7), 7);
        assert_eq!(config.get_bytes(DEFAULT_OFFHOST_ROUTE), None);
    }

    #[test]
    fn later_definitions_override() {
        let config = NfcConfig::parse("DEFAULT_ROUTE=1\nDEFAULT_ROUTE=2\n");
        assert_eq!(config.get_unsigned(DEFAULT_ROUTE, 0), 2);
    }

    #[test]
    fn builder_sets_values() {
        let config = NfcConfig::builder()
            .unsigned(DEFAULT_NFCF_ROUTE, 0xC0)
            .bytes(DEFAULT_SYS_CODE, &[0x12, 0xFC])
            .build();
        assert!(config.has_key(DEFAULT_NFCF_ROUTE));
        assert_eq!(config.get_unsigned(DEFAULT_NFCF_ROUTE, 0), 0xC0);
        assert_eq!(config.get_bytes(DEFAULT_SYS_CODE), Some(vec![0x12, 0xFC]));
    }
}
