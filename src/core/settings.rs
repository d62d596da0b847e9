//! Per-address settings resolved through wildcard matching.

use parking_lot::RwLock;
use serde::Deserialize;

use crate::core::address::{Address, ANY_WORDS, SINGLE_WORD};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    pub dead_letter_address: Option<String>,
    pub expiry_address: Option<String>,
    /// Deliveries after which a cancelled reference goes to the dead letter address.
    pub max_delivery_attempts: u32,
    pub redelivery_delay_ms: u64,
    /// Producer credits stop being granted once this many bytes are unconsumed.
    pub max_size_bytes: Option<u64>,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            dead_letter_address: None,
            expiry_address: None,
            max_delivery_attempts: 10,
            redelivery_delay_ms: 0,
            max_size_bytes: None,
        }
    }
}

/// Settings registered under address patterns. The most specific match
/// wins: an exact address first, then patterns with fewer `#`, then fewer
/// `*`, then the longest pattern.
#[derive(Debug, Default)]
pub struct AddressSettingsRepository {
    default: AddressSettings,
    entries: RwLock<Vec<(Address, AddressSettings)>>,
}

impl AddressSettingsRepository {
    pub fn new(default: AddressSettings) -> Self {
        Self {
            default,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add_match(&self, pattern: &str, settings: AddressSettings) {
        let pattern = Address::new(pattern);
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = settings,
            None => entries.push((pattern, settings)),
        }
        entries.sort_by_key(|(p, _)| specificity(p));
    }

    pub fn remove_match(&self, pattern: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(p, _)| p.as_str() != pattern);
        entries.len() != before
    }

    pub fn get_match(&self, address: &Address) -> AddressSettings {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|(pattern, _)| pattern == address || pattern_matches(pattern, address))
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

fn pattern_matches(pattern: &Address, address: &Address) -> bool {
    pattern.contains_wildcard() && pattern.matches(address)
}

/// Sort key, smaller is more specific.
fn specificity(pattern: &Address) -> (usize, usize, std::cmp::Reverse<usize>) {
    let any = pattern.parts().iter().filter(|p| *p == ANY_WORDS).count();
    let single = pattern.parts().iter().filter(|p| *p == SINGLE_WORD).count();
    (any, single, std::cmp::Reverse(pattern.as_str().len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_dla(dla: &str) -> AddressSettings {
        AddressSettings {
            dead_letter_address: Some(dla.to_string()),
            ..AddressSettings::default()
        }
    }

    #[test]
    fn most_specific_match_wins() {
        let repo = AddressSettingsRepository::default();
        repo.add_match("#", with_dla("catch-all"));
        repo.add_match("orders.#", with_dla("orders-dla"));
        repo.add_match("orders.*.priority", with_dla("priority-dla"));
        repo.add_match("orders.eu.priority", with_dla("eu-dla"));

        let get = |a: &str| repo.get_match(&Address::new(a)).dead_letter_address;
        assert_eq!(get("orders.eu.priority").as_deref(), Some("eu-dla"));
        assert_eq!(get("orders.us.priority").as_deref(), Some("priority-dla"));
        assert_eq!(get("orders.us").as_deref(), Some("orders-dla"));
        assert_eq!(get("billing").as_deref(), Some("catch-all"));
    }

    #[test]
    fn falls_back_to_default() {
        let repo = AddressSettingsRepository::new(AddressSettings {
            max_delivery_attempts: 3,
            ..AddressSettings::default()
        });
        assert_eq!(repo.get_match(&Address::new("x")).max_delivery_attempts, 3);
        repo.add_match("x", with_dla("d"));
        assert!(repo.remove_match("x"));
        assert_eq!(repo.get_match(&Address::new("x")).dead_letter_address, None);
    }
}
