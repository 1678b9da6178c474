//! Receive Acceptance Filter
//!
//! Packet filter bits and the multicast list, and the decision of whether a
//! received frame goes upward.

use crate::error::{AdapterError, Result};
use crate::ethernet::MacAddress;
use bitflags::bitflags;
use relay_config::defaults::adapter::MAX_MULTICAST_LIST;

bitflags! {
    /// Supported packet filter bits, using the NDIS bit values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFilter: u32 {
        const DIRECTED = 0x0001;
        const MULTICAST = 0x0002;
        const ALL_MULTICAST = 0x0004;
        const BROADCAST = 0x0008;
        const PROMISCUOUS = 0x0020;
    }
}

/// Current filter configuration of an adapter
#[derive(Debug, Clone)]
pub struct FilterState {
    filter: PacketFilter,
    multicast: Vec<MacAddress>,
    /// Multicast list limit reported by the transport, never above
    /// `MAX_MULTICAST_LIST`
    max_multicast: usize,
    /// Configured promiscuous mode accepts everything regardless of `filter`
    promiscuous_mode: bool,
}

impl FilterState {
    pub fn new(promiscuous_mode: bool) -> Self {
        Self {
            filter: PacketFilter::empty(),
            multicast: Vec::new(),
            max_multicast: MAX_MULTICAST_LIST,
            promiscuous_mode,
        }
    }

    pub fn max_multicast(&self) -> usize {
        self.max_multicast
    }

    /// Adopt the transport's multicast limit, clamped to what the adapter
    /// can track. Returns the limit in effect.
    pub fn set_max_multicast(&mut self, reported: usize) -> usize {
        self.max_multicast = reported.min(MAX_MULTICAST_LIST);
        self.max_multicast
    }

    pub fn filter(&self) -> PacketFilter {
        self.filter
    }

    pub fn multicast_list(&self) -> &[MacAddress] {
        &self.multicast
    }

    /// Replace the filter; any unsupported bit rejects the whole request
    pub fn set_filter_bits(&mut self, bits: u32) -> Result<PacketFilter> {
        let filter = PacketFilter::from_bits(bits).ok_or(AdapterError::NotSupported {
            bits: bits & !PacketFilter::all().bits(),
        })?;
        self.filter = filter;
        Ok(filter)
    }

    /// Replace the multicast list
    pub fn set_multicast_list(&mut self, addresses: Vec<MacAddress>) -> Result<()> {
        if addresses.len() > self.max_multicast {
            return Err(AdapterError::MulticastListFull {
                requested: addresses.len(),
                max: self.max_multicast,
            });
        }
        if let Some(bad) = addresses.iter().find(|a| !a.is_multicast()) {
            return Err(AdapterError::invalid_address(format!(
                "{} is not a multicast address",
                bad
            )));
        }
        self.multicast = addresses;
        Ok(())
    }

    /// Whether a frame addressed to `station` should be indicated upward
    pub fn accepts(&self, frame: &[u8], station: MacAddress) -> bool {
        if self.promiscuous_mode || self.filter.contains(PacketFilter::PROMISCUOUS) {
            return true;
        }

        let Some(destination) = MacAddress::destination_of(frame) else {
            return false;
        };

        if destination.is_broadcast() {
            self.filter.contains(PacketFilter::BROADCAST)
        } else if destination.is_multicast() {
            self.filter.contains(PacketFilter::ALL_MULTICAST)
                || (self.filter.contains(PacketFilter::MULTICAST)
                    && self.multicast.contains(&destination))
        } else {
            self.filter.contains(PacketFilter::DIRECTED) && destination == station
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATION: MacAddress = MacAddress([0x02, 0x50, 0xf2, 0x00, 0x01, 0x80]);
    const OTHER: MacAddress = MacAddress([0x02, 0x50, 0xf2, 0x00, 0x01, 0x99]);
    const GROUP: MacAddress = MacAddress([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    const OTHER_GROUP: MacAddress = MacAddress([0x01, 0x00, 0x5e, 0x00, 0x00, 0x02]);

    fn frame_to(destination: MacAddress) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[..6].copy_from_slice(&destination.0);
        frame
    }

    fn state(bits: PacketFilter) -> FilterState {
        let mut state = FilterState::new(false);
        state.set_filter_bits(bits.bits()).unwrap();
        state.set_multicast_list(vec![GROUP]).unwrap();
        state
    }

    #[test]
    fn test_acceptance_matrix() {
        let cases = [
            (PacketFilter::empty(), STATION, false),
            (PacketFilter::DIRECTED, STATION, true),
            (PacketFilter::DIRECTED, OTHER, false),
            (PacketFilter::DIRECTED, MacAddress::BROADCAST, false),
            (PacketFilter::BROADCAST, MacAddress::BROADCAST, true),
            (PacketFilter::MULTICAST, GROUP, true),
            (PacketFilter::MULTICAST, OTHER_GROUP, false),
            (PacketFilter::ALL_MULTICAST, OTHER_GROUP, true),
            (PacketFilter::ALL_MULTICAST, MacAddress::BROADCAST, false),
            (PacketFilter::PROMISCUOUS, OTHER, true),
        ];

        for (bits, destination, expected) in cases {
            assert_eq!(
                state(bits).accepts(&frame_to(destination), STATION),
                expected,
                "filter {:?} destination {}",
                bits,
                destination
            );
        }
    }

    #[test]
    fn test_promiscuous_mode_ignores_filter() {
        let state = FilterState::new(true);
        assert!(state.accepts(&frame_to(OTHER), STATION));
    }

    #[test]
    fn test_short_frames_rejected() {
        let state = state(PacketFilter::all());
        assert!(state.accepts(&frame_to(STATION), STATION));
        let mut state = state;
        state.set_filter_bits(PacketFilter::DIRECTED.bits()).unwrap();
        assert!(!state.accepts(&[0u8; 8], STATION));
    }

    #[test]
    fn test_unsupported_bits_rejected() {
        let mut state = FilterState::new(false);
        state.set_filter_bits(PacketFilter::DIRECTED.bits()).unwrap();
        let err = state.set_filter_bits(0x0001 | 0x0010).unwrap_err();
        assert!(matches!(err, AdapterError::NotSupported { bits: 0x0010 }));
        assert_eq!(state.filter(), PacketFilter::DIRECTED);
    }

    #[test]
    fn test_multicast_list_limits() {
        let mut state = FilterState::new(false);
        let full: Vec<_> = (0..MAX_MULTICAST_LIST as u8)
            .map(|i| MacAddress([0x01, 0, 0x5e, 0, 0, i]))
            .collect();
        state.set_multicast_list(full.clone()).unwrap();
        assert_eq!(state.multicast_list().len(), MAX_MULTICAST_LIST);

        let mut too_many = full;
        too_many.push(GROUP);
        assert!(matches!(
            state.set_multicast_list(too_many),
            Err(AdapterError::MulticastListFull { requested: 33, max: 32 })
        ));

        assert!(matches!(
            state.set_multicast_list(vec![STATION]),
            Err(AdapterError::InvalidAddress { .. })
        ));
        assert_eq!(state.multicast_list().len(), MAX_MULTICAST_LIST);
    }

    #[test]
    fn test_reported_limit_is_clamped() {
        let mut state = FilterState::new(false);
        assert_eq!(state.set_max_multicast(4), 4);
        let five: Vec<_> = (0..5u8).map(|i| MacAddress([0x01, 0, 0x5e, 0, 0, i])).collect();
        assert!(matches!(
            state.set_multicast_list(five),
            Err(AdapterError::MulticastListFull { requested: 5, max: 4 })
        ));

        assert_eq!(state.set_max_multicast(1024), MAX_MULTICAST_LIST);
    }
}
