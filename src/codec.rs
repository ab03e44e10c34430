//! Voice codecs and eSCO parameter sets.
//!
//! The gateway speaks two codecs over the synchronous link: CVSD, the
//! mandatory narrowband baseline, and mSBC, the wideband codec carried over
//! eSCO. mSBC comes with two parameter sets from the Hands-Free profile,
//! T2 (preferred, more bandwidth) and T1 (the safe fallback). Each codec
//! maps to a fixed set of controller parameters defined here.

/// Voice codec carried over the synchronous link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScoCodec {
    /// CVSD narrowband voice (64 kbit/s), the mandatory baseline.
    #[default]
    Cvsd,
    /// mSBC wideband voice, eSCO only.
    Msbc,
}

/// mSBC eSCO parameter set.
///
/// T2 is attempted first; T1 is the retry when the controller rejects T2.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsbcParameterSet {
    /// Safe settings, EV3 packets only.
    T1,
    /// Preferred settings, allows 2-EV3.
    #[default]
    T2,
}

/// SCO/eSCO packet-type mask bits.
///
/// The low bits enable packet formats; the `NO_*` bits *disable* specific
/// EDR eSCO packets, following the HCI Setup Synchronous Connection
/// convention.
pub mod pkt_types {
    /// HV1 SCO packets.
    pub const HV1: u16 = 0x0001;
    /// HV2 SCO packets.
    pub const HV2: u16 = 0x0002;
    /// HV3 SCO packets.
    pub const HV3: u16 = 0x0004;
    /// EV3 eSCO packets.
    pub const EV3: u16 = 0x0008;
    /// EV4 eSCO packets.
    pub const EV4: u16 = 0x0010;
    /// EV5 eSCO packets.
    pub const EV5: u16 = 0x0020;
    /// 2-EV3 EDR packets may not be used.
    pub const NO_2_EV3: u16 = 0x0040;
    /// 3-EV3 EDR packets may not be used.
    pub const NO_3_EV3: u16 = 0x0080;
    /// 2-EV5 EDR packets may not be used.
    pub const NO_2_EV5: u16 = 0x0100;
    /// 3-EV5 EDR packets may not be used.
    pub const NO_3_EV5: u16 = 0x0200;

    /// Plain SCO formats only.
    pub const SCO_LINK_ONLY: u16 = HV1 | HV2 | HV3;
    /// Basic-rate eSCO formats only.
    pub const ESCO_LINK_ONLY: u16 = EV3 | EV4 | EV5;
    /// Every EDR eSCO packet disabled. A mask equal to this value means the
    /// attempt has been downgraded to basic-rate packets.
    pub const NO_EDR_ESCO: u16 = NO_2_EV3 | NO_3_EV3 | NO_2_EV5 | NO_3_EV5;
}

/// Retransmission effort requested from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RetransmissionEffort {
    /// No retransmissions.
    Off = 0x00,
    /// Retransmit, optimize for power consumption.
    Power = 0x01,
    /// Retransmit, optimize for link quality.
    Quality = 0x02,
    /// Leave the choice to the controller.
    DontCare = 0xFF,
}

/// Air coding format for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodingFormat {
    /// CVSD air coding.
    Cvsd,
    /// Transparent data, host-side codec (mSBC).
    Transparent,
}

/// Where synchronous audio data is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScoDataPath {
    /// Hardware PCM interface.
    Pcm,
    /// Over HCI, through the host.
    Hci,
}

/// Parameters for one synchronous-connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EscoParameters {
    /// Transmit bandwidth in octets per second.
    pub transmit_bandwidth: u32,
    /// Receive bandwidth in octets per second.
    pub receive_bandwidth: u32,
    /// Maximum acceptable latency in milliseconds.
    pub max_latency_ms: u16,
    /// Allowed packet formats, see [`pkt_types`].
    pub packet_types: u16,
    /// Requested retransmission effort.
    pub retransmission_effort: RetransmissionEffort,
    /// Air coding format.
    pub coding_format: CodingFormat,
    /// Input data path for host-routed audio.
    pub input_data_path: ScoDataPath,
}

/// 64 kbit/s expressed in octets per second.
const BANDWIDTH_64KBIT: u32 = 8000;

impl EscoParameters {
    /// Parameter set for a CVSD link. Allows every SCO and basic-rate eSCO
    /// format, EDR disabled.
    #[must_use]
    pub const fn cvsd() -> Self {
        Self {
            transmit_bandwidth: BANDWIDTH_64KBIT,
            receive_bandwidth: BANDWIDTH_64KBIT,
            max_latency_ms: 12,
            packet_types: pkt_types::SCO_LINK_ONLY
                | pkt_types::ESCO_LINK_ONLY
                | pkt_types::NO_EDR_ESCO,
            retransmission_effort: RetransmissionEffort::Power,
            coding_format: CodingFormat::Cvsd,
            input_data_path: ScoDataPath::Pcm,
        }
    }

    /// mSBC T1 safe settings, EV3 only.
    #[must_use]
    pub const fn msbc_t1() -> Self {
        Self {
            transmit_bandwidth: BANDWIDTH_64KBIT,
            receive_bandwidth: BANDWIDTH_64KBIT,
            max_latency_ms: 8,
            packet_types: pkt_types::EV3 | pkt_types::NO_EDR_ESCO,
            retransmission_effort: RetransmissionEffort::Quality,
            coding_format: CodingFormat::Transparent,
            input_data_path: ScoDataPath::Pcm,
        }
    }

    /// mSBC T2 preferred settings, EV3 plus 2-EV3.
    #[must_use]
    pub const fn msbc_t2() -> Self {
        Self {
            transmit_bandwidth: BANDWIDTH_64KBIT,
            receive_bandwidth: BANDWIDTH_64KBIT,
            max_latency_ms: 13,
            packet_types: pkt_types::EV3
                | pkt_types::NO_3_EV3
                | pkt_types::NO_2_EV5
                | pkt_types::NO_3_EV5,
            retransmission_effort: RetransmissionEffort::Quality,
            coding_format: CodingFormat::Transparent,
            input_data_path: ScoDataPath::Pcm,
        }
    }

    /// Parameter set for the given codec and mSBC settings preference.
    #[must_use]
    pub const fn for_codec(codec: ScoCodec, msbc_settings: MsbcParameterSet) -> Self {
        match (codec, msbc_settings) {
            (ScoCodec::Cvsd, _) => Self::cvsd(),
            (ScoCodec::Msbc, MsbcParameterSet::T2) => Self::msbc_t2(),
            (ScoCodec::Msbc, MsbcParameterSet::T1) => Self::msbc_t1(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_edr_esco_mask() {
        assert_eq!(pkt_types::NO_EDR_ESCO, 0x03C0);
        assert_eq!(
            pkt_types::NO_EDR_ESCO,
            pkt_types::NO_2_EV3 | pkt_types::NO_3_EV3 | pkt_types::NO_2_EV5 | pkt_types::NO_3_EV5
        );
    }

    #[test]
    fn test_cvsd_parameters() {
        let params = EscoParameters::cvsd();
        assert_eq!(params.max_latency_ms, 12);
        assert_eq!(params.coding_format, CodingFormat::Cvsd);
        assert_eq!(params.retransmission_effort, RetransmissionEffort::Power);
        // Every base format allowed, every EDR format disabled.
        assert_eq!(
            params.packet_types & pkt_types::SCO_LINK_ONLY,
            pkt_types::SCO_LINK_ONLY
        );
        assert_eq!(
            params.packet_types & pkt_types::NO_EDR_ESCO,
            pkt_types::NO_EDR_ESCO
        );
    }

    #[test]
    fn test_msbc_parameters() {
        let t1 = EscoParameters::msbc_t1();
        let t2 = EscoParameters::msbc_t2();

        assert_eq!(t1.max_latency_ms, 8);
        assert_eq!(t2.max_latency_ms, 13);
        assert_eq!(t1.coding_format, CodingFormat::Transparent);
        assert_eq!(t2.coding_format, CodingFormat::Transparent);

        // T1 allows no EDR packets at all; T2 allows 2-EV3.
        assert_eq!(t1.packet_types & pkt_types::NO_EDR_ESCO, pkt_types::NO_EDR_ESCO);
        assert_eq!(t2.packet_types & pkt_types::NO_2_EV3, 0);
        assert_ne!(t2.packet_types & pkt_types::NO_3_EV3, 0);
    }

    #[test]
    fn test_for_codec_selection() {
        assert_eq!(
            EscoParameters::for_codec(ScoCodec::Cvsd, MsbcParameterSet::T2),
            EscoParameters::cvsd()
        );
        assert_eq!(
            EscoParameters::for_codec(ScoCodec::Msbc, MsbcParameterSet::T2),
            EscoParameters::msbc_t2()
        );
        assert_eq!(
            EscoParameters::for_codec(ScoCodec::Msbc, MsbcParameterSet::T1),
            EscoParameters::msbc_t1()
        );
    }
}
