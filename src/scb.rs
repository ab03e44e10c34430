//! Service Control Blocks.
//!
//! One Service Control Block (SCB) exists per known Hands-Free peer,
//! created when its service-level connection comes up and freed when it
//! goes down. Blocks live in a fixed pool; their index plus one is the
//! stable handle passed across every external boundary, with handle `0`
//! reserved for "none".

use crate::address::BluetoothAddress;
use crate::codec::{MsbcParameterSet, ScoCodec};
use crate::constants::{INVALID_SCO_INDEX, MAX_AG_PEERS};
use crate::controller::ScoIndex;

/// Stable handle for a Service Control Block. `0` means "none".
pub type ScbHandle = u16;

/// Local gateway feature bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AgFeatures(pub u32);

impl AgFeatures {
    /// Codec negotiation supported.
    pub const CODEC_NEGOTIATION: u32 = 0x0200;
    /// eSCO links supported.
    pub const ESCO: u32 = 0x0400;

    /// Check if a feature bit is set.
    #[must_use]
    pub const fn supports(&self, feature: u32) -> bool {
        (self.0 & feature) != 0
    }
}

/// Peer (Hands-Free side) feature bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerFeatures(pub u32);

impl PeerFeatures {
    /// Codec negotiation supported.
    pub const CODEC_NEGOTIATION: u32 = 0x0080;
    /// eSCO links supported.
    pub const ESCO: u32 = 0x0100;

    /// Check if a feature bit is set.
    #[must_use]
    pub const fn supports(&self, feature: u32) -> bool {
        (self.0 & feature) != 0
    }
}

/// Per-peer state relevant to the audio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceControlBlock {
    /// Peer device address.
    pub peer_addr: BluetoothAddress,
    /// Identifier of the application owning this peer.
    pub app_id: u8,
    /// Whether the service-level connection is up.
    pub svc_conn: bool,
    /// Controller handle of a pending or open connection, or
    /// [`INVALID_SCO_INDEX`].
    pub sco_idx: ScoIndex,
    /// Local feature bits.
    pub features: AgFeatures,
    /// Peer feature bits.
    pub peer_features: PeerFeatures,
    /// Peer Hands-Free profile version.
    pub peer_version: u16,
    /// Preferred codec for the next connection.
    pub sco_codec: ScoCodec,
    /// Codec of the attempt in flight or the open link.
    pub inuse_codec: Option<ScoCodec>,
    /// The preferred codec changed since the last negotiation.
    pub codec_updated: bool,
    /// Force narrowband on the next attempt.
    pub codec_fallback: bool,
    /// mSBC parameter set for the next wideband attempt.
    pub codec_msbc_settings: MsbcParameterSet,
    /// Retry the current attempt with plain SCO packet types.
    pub retry_with_sco_only: bool,
}

impl ServiceControlBlock {
    /// Create a fresh block for a peer.
    #[must_use]
    pub fn new(peer_addr: BluetoothAddress, app_id: u8) -> Self {
        Self {
            peer_addr,
            app_id,
            svc_conn: false,
            sco_idx: INVALID_SCO_INDEX,
            features: AgFeatures::default(),
            peer_features: PeerFeatures::default(),
            peer_version: 0,
            sco_codec: ScoCodec::default(),
            inuse_codec: None,
            codec_updated: false,
            codec_fallback: false,
            codec_msbc_settings: MsbcParameterSet::default(),
            retry_with_sco_only: false,
        }
    }
}

/// Fixed-capacity pool of Service Control Blocks.
#[derive(Debug)]
pub struct ScbRegistry {
    blocks: [Option<ServiceControlBlock>; MAX_AG_PEERS],
}

impl ScbRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: [None; MAX_AG_PEERS],
        }
    }

    /// Allocate a block for a peer. Returns its handle, or `None` when the
    /// pool is exhausted.
    pub fn alloc(&mut self, peer_addr: BluetoothAddress, app_id: u8) -> Option<ScbHandle> {
        for (i, slot) in self.blocks.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ServiceControlBlock::new(peer_addr, app_id));
                return Some(Self::handle_for(i));
            }
        }
        None
    }

    /// Free a block. Returns false for an unknown handle.
    pub fn free(&mut self, handle: ScbHandle) -> bool {
        match Self::slot_for(handle) {
            Some(i) if self.blocks[i].is_some() => {
                self.blocks[i] = None;
                true
            }
            _ => false,
        }
    }

    /// Block behind a handle.
    #[must_use]
    pub fn get(&self, handle: ScbHandle) -> Option<&ServiceControlBlock> {
        Self::slot_for(handle).and_then(|i| self.blocks[i].as_ref())
    }

    /// Mutable block behind a handle.
    pub fn get_mut(&mut self, handle: ScbHandle) -> Option<&mut ServiceControlBlock> {
        Self::slot_for(handle).and_then(|i| self.blocks[i].as_mut())
    }

    /// Handle of the first in-use block whose peer address matches.
    #[must_use]
    pub fn by_addr(&self, addr: BluetoothAddress) -> Option<ScbHandle> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.is_some_and(|scb| scb.peer_addr == addr))
            .map(|(i, _)| Self::handle_for(i))
    }

    /// Whether any block other than `handle` is in use.
    #[must_use]
    pub fn other_in_use(&self, handle: ScbHandle) -> bool {
        self.blocks
            .iter()
            .enumerate()
            .any(|(i, slot)| slot.is_some() && Self::handle_for(i) != handle)
    }

    /// Number of blocks in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no blocks are in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    const fn handle_for(slot: usize) -> ScbHandle {
        slot as ScbHandle + 1
    }

    fn slot_for(handle: ScbHandle) -> Option<usize> {
        let handle = handle as usize;
        if handle >= 1 && handle <= MAX_AG_PEERS {
            Some(handle - 1)
        } else {
            None
        }
    }
}

impl Default for ScbRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BluetoothAddress {
        BluetoothAddress::new([0x12, 0x34, 0x56, 0x78, 0x9A, last])
    }

    #[test]
    fn test_alloc_and_lookup() {
        let mut registry = ScbRegistry::new();

        let a = registry.alloc(addr(0x01), 1).unwrap();
        let b = registry.alloc(addr(0x02), 2).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.get(a).unwrap().peer_addr, addr(0x01));
        assert_eq!(registry.get(b).unwrap().app_id, 2);
        assert_eq!(registry.by_addr(addr(0x02)), Some(b));
        assert_eq!(registry.by_addr(addr(0x7F)), None);
    }

    #[test]
    fn test_handles_are_stable_across_free() {
        let mut registry = ScbRegistry::new();

        let a = registry.alloc(addr(0x01), 1).unwrap();
        let b = registry.alloc(addr(0x02), 2).unwrap();

        assert!(registry.free(a));
        assert_eq!(registry.get(a), None);
        // Freeing one slot must not move the other block.
        assert_eq!(registry.get(b).unwrap().peer_addr, addr(0x02));

        // The freed slot is reusable.
        let c = registry.alloc(addr(0x03), 3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut registry = ScbRegistry::new();

        for i in 0..MAX_AG_PEERS {
            assert!(registry.alloc(addr(i as u8), i as u8).is_some());
        }
        assert_eq!(registry.alloc(addr(0xEE), 0xEE), None);
    }

    #[test]
    fn test_handle_zero_is_none() {
        let mut registry = ScbRegistry::new();
        registry.alloc(addr(0x01), 1).unwrap();

        assert_eq!(registry.get(0), None);
        assert!(!registry.free(0));
    }

    #[test]
    fn test_other_in_use() {
        let mut registry = ScbRegistry::new();
        let a = registry.alloc(addr(0x01), 1).unwrap();
        assert!(!registry.other_in_use(a));

        let b = registry.alloc(addr(0x02), 2).unwrap();
        assert!(registry.other_in_use(a));

        registry.free(b);
        assert!(!registry.other_in_use(a));
    }

    #[test]
    fn test_new_block_defaults() {
        let scb = ServiceControlBlock::new(addr(0x01), 7);
        assert_eq!(scb.sco_idx, INVALID_SCO_INDEX);
        assert_eq!(scb.sco_codec, ScoCodec::Cvsd);
        assert_eq!(scb.inuse_codec, None);
        assert_eq!(scb.codec_msbc_settings, MsbcParameterSet::T2);
        assert!(!scb.svc_conn);
        assert!(!scb.codec_updated);
        assert!(!scb.codec_fallback);
        assert!(!scb.retry_with_sco_only);
    }
}
