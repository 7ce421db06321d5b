//! Zone-aware hardware mapping.
//!
//! Maps a locker id to the relay coil that unlatches it. With zones enabled
//! the locker's 1-based position within the zone's concatenated ranges picks
//! a card from the zone's ordered card list and a channel on that card. The
//! legacy linear mapping exists only for installations that predate zones.

use crate::config::{SystemConfig, ZoneConfig, CHANNELS_PER_CARD};
use crate::error::ZoneError;

/// The physical coil a locker's latch is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CoilAddress {
    pub slave_address: u8,
    /// 1-based channel on the card.
    pub channel: u16,
}

/// 1-based position of `locker_id` within the concatenation of the zone's
/// ranges in declaration order. `None` when no range covers the id.
#[must_use]
pub fn position_in_zone(zone: &ZoneConfig, locker_id: i64) -> Option<u32> {
    let mut offset: i64 = 0;
    for range in &zone.ranges {
        if range.contains(locker_id) {
            return u32::try_from(offset + (locker_id - range.0) + 1).ok();
        }
        offset += range.len();
    }
    None
}

/// Resolve a locker within a specific zone.
///
/// # Errors
///
/// - [`ZoneError::NotInZone`] when no range of the zone covers the id.
/// - [`ZoneError::CapacityExceeded`] when the position lands past the
///   zone's relay card capacity.
pub fn resolve_in_zone(zone: &ZoneConfig, locker_id: i64) -> Result<CoilAddress, ZoneError> {
    let position = position_in_zone(zone, locker_id).ok_or(ZoneError::NotInZone { locker_id })?;

    let capacity = zone.capacity();
    if position > capacity {
        return Err(ZoneError::CapacityExceeded {
            locker_id,
            capacity,
        });
    }

    let card_index = (position - 1) / u32::from(CHANNELS_PER_CARD);
    let channel = ((position - 1) % u32::from(CHANNELS_PER_CARD)) + 1;
    let slave_address = *zone
        .relay_cards
        .get(card_index as usize)
        .ok_or(ZoneError::CapacityExceeded {
            locker_id,
            capacity,
        })?;

    Ok(CoilAddress {
        slave_address,
        channel: channel as u16,
    })
}

/// Legacy linear mapping: card 1 carries lockers 1–16, card 2 carries
/// 17–32, and so on. Only valid when zones are disabled.
#[must_use]
pub fn legacy_resolve(locker_id: i64) -> CoilAddress {
    let index = (locker_id - 1).max(0);
    CoilAddress {
        slave_address: (index / i64::from(CHANNELS_PER_CARD) + 1) as u8,
        channel: (index % i64::from(CHANNELS_PER_CARD) + 1) as u16,
    }
}

/// Resolve a locker through the whole configuration: zone-aware when zones
/// are enabled, legacy linear otherwise.
///
/// # Errors
///
/// With zones enabled, [`ZoneError::NotInZone`] when no enabled zone covers
/// the id, or a capacity error from the owning zone.
pub fn resolve(config: &SystemConfig, locker_id: i64) -> Result<CoilAddress, ZoneError> {
    if !config.features.zones_enabled {
        return Ok(legacy_resolve(locker_id));
    }
    let zone = config
        .zone_of(locker_id)
        .ok_or(ZoneError::NotInZone { locker_id })?;
    resolve_in_zone(zone, locker_id)
}

/// Validate a caller-supplied zone filter against the configuration.
///
/// # Errors
///
/// [`ZoneError::UnknownZone`] when the id names no enabled zone.
pub fn require_zone<'a>(config: &'a SystemConfig, zone_id: &str) -> Result<&'a ZoneConfig, ZoneError> {
    config
        .zone(zone_id)
        .filter(|z| z.enabled)
        .ok_or_else(|| ZoneError::UnknownZone {
            zone: zone_id.to_owned(),
        })
}

/// Check that a locker-scoped operation's zone filter actually covers the
/// locker.
///
/// # Errors
///
/// [`ZoneError::UnknownZone`] or [`ZoneError::ZoneMismatch`].
pub fn require_locker_in_zone(
    config: &SystemConfig,
    zone_id: &str,
    locker_id: i64,
) -> Result<(), ZoneError> {
    let zone = require_zone(config, zone_id)?;
    if zone.contains(locker_id) {
        Ok(())
    } else {
        Err(ZoneError::ZoneMismatch {
            zone: zone_id.to_owned(),
            locker_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Features, Hardware, LockerRange, RelayCard};

    fn card(addr: u8) -> RelayCard {
        RelayCard {
            slave_address: addr,
            channels: 16,
            card_type: "relay16".to_owned(),
            description: String::new(),
            enabled: true,
        }
    }

    fn zone(id: &str, ranges: Vec<LockerRange>, cards: Vec<u8>) -> ZoneConfig {
        ZoneConfig {
            id: id.to_owned(),
            name: id.to_owned(),
            enabled: true,
            ranges,
            relay_cards: cards,
        }
    }

    fn config() -> SystemConfig {
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
                zone("mens", vec![LockerRange(1, 32)], vec![1, 2]),
                zone("womens", vec![LockerRange(33, 64)], vec![3, 4]),
            ],
            lockers: vec![],
        }
    }

    #[test]
    fn first_locker_maps_to_first_channel() {
        let addr = resolve(&config(), 1).unwrap();
        assert_eq!(addr, CoilAddress { slave_address: 1, channel: 1 });
    }

    #[test]
    fn position_crosses_card_boundary() {
        let addr = resolve(&config(), 17).unwrap();
        assert_eq!(addr, CoilAddress { slave_address: 2, channel: 1 });
    }

    #[test]
    fn second_zone_starts_on_its_own_cards() {
        let addr = resolve(&config(), 33).unwrap();
        assert_eq!(addr, CoilAddress { slave_address: 3, channel: 1 });
    }

    #[test]
    fn last_in_range_maps_to_channel_16_of_last_card() {
        let addr = resolve(&config(), 64).unwrap();
        assert_eq!(addr, CoilAddress { slave_address: 4, channel: 16 });
    }

    #[test]
    fn one_past_capacity_is_rejected() {
        let mut cfg = config();
        // Grow the range without adding a card: position 33 exceeds 2×16.
        cfg.zones[1].ranges = vec![LockerRange(33, 80)];
        let err = resolve(&cfg, 66).unwrap_err();
        assert!(matches!(err, ZoneError::CapacityExceeded { capacity: 32, .. }));
    }

    #[test]
    fn uncovered_locker_is_not_in_zone() {
        let err = resolve(&config(), 99).unwrap_err();
        assert!(matches!(err, ZoneError::NotInZone { locker_id: 99 }));
    }

    #[test]
    fn zones_disabled_falls_back_to_linear() {
        let mut cfg = config();
        cfg.features.zones_enabled = false;
        assert_eq!(
            resolve(&cfg, 7).unwrap(),
            CoilAddress { slave_address: 1, channel: 7 }
        );
        assert_eq!(
            resolve(&cfg, 17).unwrap(),
            CoilAddress { slave_address: 2, channel: 1 }
        );
    }

    #[test]
    fn split_ranges_concatenate_for_position() {
        let z = zone(
            "split",
            vec![LockerRange(1, 8), LockerRange(21, 28)],
            vec![5],
        );
        // Locker 21 is position 9 → channel 9 on the only card.
        assert_eq!(position_in_zone(&z, 21), Some(9));
        assert_eq!(
            resolve_in_zone(&z, 21).unwrap(),
            CoilAddress { slave_address: 5, channel: 9 }
        );
    }

    #[test]
    fn unknown_zone_filter_is_rejected() {
        let err = require_zone(&config(), "unknown").unwrap_err();
        assert!(matches!(err, ZoneError::UnknownZone { .. }));
    }

    #[test]
    fn zone_mismatch_is_detected() {
        let err = require_locker_in_zone(&config(), "mens", 40).unwrap_err();
        assert!(matches!(err, ZoneError::ZoneMismatch { locker_id: 40, .. }));
    }
}
