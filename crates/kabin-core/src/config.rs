//! Configuration document and manager.
//!
//! One JSON document (`config/system.json`) describes features, relay-card
//! hardware, zones, and locker display overrides. A [`ConfigManager`] owns
//! the in-memory copy behind a readers–writer lock; every service reads
//! through it and nobody parses the file directly. Mutations validate the
//! candidate document first — a failed update leaves both the file and the
//! running configuration untouched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Channels per relay card. Fixed by the card family in the field.
pub const CHANNELS_PER_CARD: u16 = 16;

/// Number of rotated configuration backups kept next to the document.
const BACKUP_SLOTS: u32 = 5;

// ── Document types ───────────────────────────────────────────────────

/// An inclusive locker-id range, serialized as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerRange(pub i64, pub i64);

impl LockerRange {
    /// Number of locker ids covered.
    #[must_use]
    pub fn len(self) -> i64 {
        (self.1 - self.0 + 1).max(0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(self, locker_id: i64) -> bool {
        locker_id >= self.0 && locker_id <= self.1
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.0 <= other.1 && other.0 <= self.1
    }
}

/// Feature switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// When false, zone configuration is ignored and the legacy linear
    /// hardware mapping applies.
    #[serde(default)]
    pub zones_enabled: bool,
    /// Gate for the staff emergency-open-all path.
    #[serde(default)]
    pub emergency_open_enabled: bool,
}

/// Declared bus hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(default)]
    pub relay_cards: Vec<RelayCard>,
}

/// One addressable relay card on the RS-485 bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCard {
    pub slave_address: u8,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(rename = "type", default)]
    pub card_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A named contiguous set of locker ranges bound to an ordered card list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ranges: Vec<LockerRange>,
    #[serde(default)]
    pub relay_cards: Vec<u8>,
}

impl ZoneConfig {
    /// Total locker ids covered by this zone's ranges.
    #[must_use]
    pub fn covered(&self) -> i64 {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// Hardware capacity of this zone's card list.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.relay_cards.len() as u32 * u32::from(CHANNELS_PER_CARD)
    }

    #[must_use]
    pub fn contains(&self, locker_id: i64) -> bool {
        self.ranges.iter().any(|r| r.contains(locker_id))
    }
}

/// Per-locker operator overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerOverride {
    pub locker_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub config_version: u64,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub lockers: Vec<LockerOverride>,
}

fn default_channels() -> u16 {
    CHANNELS_PER_CARD
}

fn default_true() -> bool {
    true
}

impl SystemConfig {
    /// Total channel capacity of all enabled relay cards.
    #[must_use]
    pub fn total_capacity(&self) -> u32 {
        self.hardware
            .relay_cards
            .iter()
            .filter(|c| c.enabled)
            .map(|c| u32::from(c.channels))
            .sum()
    }

    /// Sum of locker ids covered by every zone with ranges.
    #[must_use]
    pub fn total_covered(&self) -> i64 {
        self.zones
            .iter()
            .filter(|z| z.enabled)
            .map(ZoneConfig::covered)
            .sum()
    }

    /// Look up a zone by id, enabled or not.
    #[must_use]
    pub fn zone(&self, id: &str) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// The enabled zone covering this locker id, if any.
    #[must_use]
    pub fn zone_of(&self, locker_id: i64) -> Option<&ZoneConfig> {
        self.zones
            .iter()
            .find(|z| z.enabled && z.contains(locker_id))
    }

    /// Operator override for a locker id, if declared.
    #[must_use]
    pub fn locker_override(&self, locker_id: i64) -> Option<&LockerOverride> {
        self.lockers.iter().find(|o| o.locker_id == locker_id)
    }

    /// Hex SHA-256 of the canonical JSON form. Carried in heartbeats so
    /// kiosks can detect configuration drift.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Encode`] if serialization fails.
    pub fn hash(&self) -> Result<String, ConfigError> {
        let bytes = serde_json::to_vec(self).map_err(ConfigError::Encode)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Prune zone card references that no longer exist in hardware, force
    /// zones with no cards to disabled with empty ranges, and sort + merge
    /// adjacent ranges within each zone.
    pub fn normalize(&mut self) {
        let declared: Vec<u8> = self
            .hardware
            .relay_cards
            .iter()
            .map(|c| c.slave_address)
            .collect();

        for zone in &mut self.zones {
            zone.relay_cards.retain(|addr| declared.contains(addr));
            if zone.relay_cards.is_empty() {
                zone.enabled = false;
                zone.ranges.clear();
            }
            zone.ranges.retain(|r| !r.is_empty());
            zone.ranges.sort_by_key(|r| r.0);
            zone.ranges = merge_adjacent(&zone.ranges);
        }
    }

    /// Rewrite enabled zones' ranges so each covers exactly its card
    /// capacity, allocating locker ids sequentially in declaration order.
    pub fn rebalance(&mut self) {
        if !self.features.zones_enabled {
            return;
        }
        let mut cursor: i64 = 0;
        for zone in &mut self.zones {
            if !zone.enabled {
                continue;
            }
            let capacity = i64::from(zone.capacity());
            if capacity == 0 {
                zone.ranges.clear();
                continue;
            }
            zone.ranges = vec![LockerRange(cursor + 1, cursor + capacity)];
            cursor += capacity;
        }
    }

    /// Structural validation. Checked on load and before every persisted
    /// update.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_zone_ids: Vec<&str> = Vec::new();
        for zone in &self.zones {
            if seen_zone_ids.contains(&zone.id.as_str()) {
                return Err(ConfigError::Validation {
                    reason: format!("duplicate zone id '{}'", zone.id),
                });
            }
            seen_zone_ids.push(&zone.id);

            for addr in &zone.relay_cards {
                if !self
                    .hardware
                    .relay_cards
                    .iter()
                    .any(|c| c.slave_address == *addr)
                {
                    return Err(ConfigError::UnknownRelayCard {
                        zone: zone.id.clone(),
                        slave_address: *addr,
                    });
                }
            }

            for range in &zone.ranges {
                if range.0 < 1 || range.1 < range.0 {
                    return Err(ConfigError::Validation {
                        reason: format!(
                            "zone '{}' has invalid range [{}, {}]",
                            zone.id, range.0, range.1
                        ),
                    });
                }
            }
        }

        // A relay card belongs to at most one zone.
        for (i, a) in self.zones.iter().enumerate() {
            for b in self.zones.iter().skip(i + 1) {
                if a.relay_cards.iter().any(|addr| b.relay_cards.contains(addr)) {
                    return Err(ConfigError::Validation {
                        reason: format!(
                            "zones '{}' and '{}' share a relay card",
                            a.id, b.id
                        ),
                    });
                }
            }
        }

        // No two zones with ranges may overlap — a stale disabled zone
        // colliding with an enabled one is as much of a wiring hazard.
        for (i, a) in self.zones.iter().enumerate() {
            for b in self.zones.iter().skip(i + 1) {
                for ra in &a.ranges {
                    for rb in &b.ranges {
                        if ra.overlaps(*rb) {
                            return Err(ConfigError::RangeOverlap {
                                zone_a: a.id.clone(),
                                zone_b: b.id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut seen_cards: Vec<u8> = Vec::new();
        for card in &self.hardware.relay_cards {
            if seen_cards.contains(&card.slave_address) {
                return Err(ConfigError::Validation {
                    reason: format!("duplicate relay card address {}", card.slave_address),
                });
            }
            seen_cards.push(card.slave_address);
        }

        Ok(())
    }
}

/// Merge ranges that touch or overlap. Input must be sorted by start.
fn merge_adjacent(ranges: &[LockerRange]) -> Vec<LockerRange> {
    let mut merged: Vec<LockerRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.0 <= last.1 + 1 => last.1 = last.1.max(r.1),
            _ => merged.push(*r),
        }
    }
    merged
}

// ── Manager ──────────────────────────────────────────────────────────

/// Outcome of an automatic zone extension, for event reporting.
#[derive(Debug, Clone)]
pub struct ZoneExtension {
    pub zone: String,
    pub added_cards: Vec<u8>,
    pub ranges: Vec<LockerRange>,
}

/// Owns the configuration document. Constructed once at process start and
/// passed down explicitly; there is no global instance.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    inner: RwLock<Held>,
}

#[derive(Debug)]
struct Held {
    config: SystemConfig,
    hash: String,
}

impl ConfigManager {
    /// Load (or create) the document at `path`, normalizing and validating
    /// it before use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] / [`ConfigError::Parse`] on file
    /// problems, or a validation error if the document is structurally
    /// invalid.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut config = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let raw = tokio::fs::read(&path).await.map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            info!(path = %path.display(), "no configuration document, starting from defaults");
            SystemConfig::default()
        };

        config.normalize();
        config.validate()?;
        let hash = config.hash()?;

        Ok(Self {
            path,
            inner: RwLock::new(Held { config, hash }),
        })
    }

    /// A clone of the current document.
    pub async fn snapshot(&self) -> SystemConfig {
        self.inner.read().await.config.clone()
    }

    /// Current configuration hash.
    pub async fn hash(&self) -> String {
        self.inner.read().await.hash.clone()
    }

    /// Apply a mutation: clone the current document, run `mutate`, then
    /// normalize → rebalance → validate → persist → swap in. Any failure
    /// leaves the current configuration in force.
    ///
    /// # Errors
    ///
    /// Propagates the mutation's error, a validation error, or an I/O
    /// error from persistence.
    pub async fn update<F>(&self, mutate: F) -> Result<SystemConfig, ConfigError>
    where
        F: FnOnce(&mut SystemConfig) -> Result<(), ConfigError>,
    {
        let mut held = self.inner.write().await;

        let mut candidate = held.config.clone();
        mutate(&mut candidate)?;
        candidate.normalize();
        candidate.rebalance();
        candidate.validate()?;
        candidate.config_version += 1;

        let hash = candidate.hash()?;
        self.persist(&candidate).await?;

        info!(config_version = candidate.config_version, "configuration updated");
        held.config = candidate.clone();
        held.hash = hash;
        Ok(candidate)
    }

    /// Register newly discovered relay cards and, when zones are enabled,
    /// extend the last enabled zone to cover the added capacity.
    ///
    /// Returns the extension outcome when a zone grew, `None` when the
    /// cards were only recorded (zones disabled, or no enabled zone).
    ///
    /// # Errors
    ///
    /// A validation failure (for example the extended range colliding with
    /// a disabled zone) rolls the whole change back.
    pub async fn register_relay_cards(
        &self,
        new_cards: Vec<RelayCard>,
    ) -> Result<Option<ZoneExtension>, ConfigError> {
        let added: Vec<u8> = new_cards.iter().map(|c| c.slave_address).collect();
        let mut extension: Option<ZoneExtension> = None;

        let updated = self.update(|config| {
            for card in new_cards {
                if config
                    .hardware
                    .relay_cards
                    .iter()
                    .any(|c| c.slave_address == card.slave_address)
                {
                    return Err(ConfigError::Validation {
                        reason: format!(
                            "relay card {} is already declared",
                            card.slave_address
                        ),
                    });
                }
                config.hardware.relay_cards.push(card);
            }

            if config.features.zones_enabled {
                let Some(zone) = config.zones.iter_mut().rev().find(|z| z.enabled) else {
                    warn!("relay cards added but no enabled zone to extend");
                    return Ok(());
                };
                zone.relay_cards.extend(added.iter().copied());
            }
            Ok(())
        })
        .await?;

        if updated.features.zones_enabled {
            if let Some(zone) = updated
                .zones
                .iter()
                .filter(|z| z.enabled)
                .find(|z| added.iter().any(|a| z.relay_cards.contains(a)))
            {
                extension = Some(ZoneExtension {
                    zone: zone.id.clone(),
                    added_cards: added,
                    ranges: zone.ranges.clone(),
                });
            }
        }

        Ok(extension)
    }

    /// Rotate backups, then write atomically (temp file + rename).
    async fn persist(&self, config: &SystemConfig) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
            }
        }

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            self.rotate_backups().await?;
        }

        let bytes = serde_json::to_vec_pretty(config).map_err(ConfigError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }

    /// Shift `system.json.N` up one slot and copy the live file into `.1`.
    async fn rotate_backups(&self) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        for slot in (1..BACKUP_SLOTS).rev() {
            let from = backup_path(&self.path, slot);
            let to = backup_path(&self.path, slot + 1);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                tokio::fs::rename(&from, &to).await.map_err(io_err)?;
            }
        }
        tokio::fs::copy(&self.path, backup_path(&self.path, 1))
            .await
            .map_err(io_err)?;
        Ok(())
    }
}

fn backup_path(path: &Path, slot: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{slot}"));
    PathBuf::from(os)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn card(addr: u8) -> RelayCard {
        RelayCard {
            slave_address: addr,
            channels: 16,
            card_type: "relay16".to_owned(),
            description: String::new(),
            enabled: true,
        }
    }

    fn two_zone_config() -> SystemConfig {
        SystemConfig {
            config_version: 1,
            features: Features {
                zones_enabled: true,
                emergency_open_enabled: false,
            },
            hardware: Hardware {
                relay_cards: vec![card(1), card(2), card(3), card(4)],
            },
            zones: vec![
                ZoneConfig {
                    id: "mens".to_owned(),
                    name: "Erkek".to_owned(),
                    enabled: true,
                    ranges: vec![LockerRange(1, 32)],
                    relay_cards: vec![1, 2],
                },
                ZoneConfig {
                    id: "womens".to_owned(),
                    name: "Kadın".to_owned(),
                    enabled: true,
                    ranges: vec![LockerRange(33, 64)],
                    relay_cards: vec![3, 4],
                },
            ],
            lockers: vec![],
        }
    }

    #[test]
    fn normalize_merges_adjacent_ranges() {
        let mut config = two_zone_config();
        config.zones[0].ranges = vec![LockerRange(17, 32), LockerRange(1, 16)];
        config.normalize();
        assert_eq!(config.zones[0].ranges, vec![LockerRange(1, 32)]);
    }

    #[test]
    fn normalize_prunes_unknown_cards_and_disables_empty_zones() {
        let mut config = two_zone_config();
        config.zones[1].relay_cards = vec![9, 10];
        config.normalize();
        assert!(!config.zones[1].enabled);
        assert!(config.zones[1].ranges.is_empty());
        assert!(config.zones[1].relay_cards.is_empty());
    }

    #[test]
    fn validate_rejects_overlapping_zones() {
        let mut config = two_zone_config();
        config.zones[1].ranges = vec![LockerRange(30, 64)];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::RangeOverlap { .. }));
    }

    #[test]
    fn rebalance_allocates_sequentially() {
        let mut config = two_zone_config();
        config.zones[1].relay_cards = vec![3, 4, 5];
        config.hardware.relay_cards.push(card(5));
        config.rebalance();
        assert_eq!(config.zones[0].ranges, vec![LockerRange(1, 32)]);
        assert_eq!(config.zones[1].ranges, vec![LockerRange(33, 80)]);
    }

    #[tokio::test]
    async fn register_relay_cards_extends_last_enabled_zone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&two_zone_config()).unwrap(),
        )
        .await
        .unwrap();

        let manager = ConfigManager::load(&path).await.unwrap();
        let extension = manager
            .register_relay_cards(vec![card(5)])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(extension.zone, "womens");
        assert_eq!(extension.added_cards, vec![5]);
        assert_eq!(extension.ranges, vec![LockerRange(33, 80)]);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.total_capacity(), 80);
        assert_eq!(snapshot.zone("womens").unwrap().relay_cards, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn failed_update_preserves_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        tokio::fs::write(&path, serde_json::to_vec(&two_zone_config()).unwrap())
            .await
            .unwrap();

        let manager = ConfigManager::load(&path).await.unwrap();
        let before = manager.snapshot().await;

        let result = manager
            .update(|config| {
                config.zones.push(ZoneConfig {
                    id: "mens".to_owned(),
                    name: "duplicate".to_owned(),
                    enabled: true,
                    ranges: vec![],
                    relay_cards: vec![],
                });
                Ok(())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(manager.snapshot().await, before);
    }

    #[tokio::test]
    async fn update_rotates_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        tokio::fs::write(&path, serde_json::to_vec(&two_zone_config()).unwrap())
            .await
            .unwrap();

        let manager = ConfigManager::load(&path).await.unwrap();
        manager
            .update(|config| {
                config.features.emergency_open_enabled = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(tokio::fs::try_exists(dir.path().join("system.json.1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hash_changes_with_content() {
        let config = two_zone_config();
        let mut other = config.clone();
        other.features.emergency_open_enabled = true;
        assert_ne!(config.hash().unwrap(), other.hash().unwrap());
    }
}
