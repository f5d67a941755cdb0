// The transient decoded-message record consumed by the tracker.

use std::sync::Arc;

use crate::net::ClientStats;

/// Where a piece of data came from, in order of increasing priority.
/// Higher always wins; lower may overwrite only once the higher value has
/// gone stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    Invalid,
    Indirect,
    ModeAc,
    Sbs,
    Mlat,
    ModeS,
    Jaero,
    ModeSChecked,
    Tisb,
    Adsr,
    Adsb,
    Prio,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Invalid => "invalid",
            Source::Indirect => "indirect",
            Source::ModeAc => "mode_ac",
            Source::Sbs => "sbs",
            Source::Mlat => "mlat",
            Source::ModeS => "mode_s",
            Source::Jaero => "jaero",
            Source::ModeSChecked => "mode_s_checked",
            Source::Tisb => "tisb",
            Source::Adsr => "adsr",
            Source::Adsb => "adsb_icao",
            Source::Prio => "prio",
        }
    }
}

/// What sort of address a message carries and who sent it.
/// Lower values are better quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddrType {
    AdsbIcao = 0,
    AdsbIcaoNt = 1,
    AdsrIcao = 2,
    TisbIcao = 3,
    Jaero = 4,
    Mlat = 5,
    Other = 6,
    ModeS = 7,
    AdsbOther = 8,
    AdsrOther = 9,
    TisbTrackfile = 10,
    TisbOther = 11,
    ModeA = 12,
    Unknown = 15,
}

impl AddrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrType::AdsbIcao => "adsb_icao",
            AddrType::AdsbIcaoNt => "adsb_icao_nt",
            AddrType::AdsrIcao => "adsr_icao",
            AddrType::TisbIcao => "tisb_icao",
            AddrType::Jaero => "adsc",
            AddrType::Mlat => "mlat",
            AddrType::Other => "other",
            AddrType::ModeS => "mode_s",
            AddrType::AdsbOther => "adsb_other",
            AddrType::AdsrOther => "adsr_other",
            AddrType::TisbTrackfile => "tisb_trackfile",
            AddrType::TisbOther => "tisb_other",
            AddrType::ModeA => "mode_ac",
            AddrType::Unknown => "unknown",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AirGround {
    #[default]
    Invalid,
    Ground,
    Airborne,
    Uncertain,
}

impl AirGround {
    pub fn as_u8(&self) -> u8 {
        match self {
            AirGround::Invalid => 0,
            AirGround::Ground => 1,
            AirGround::Airborne => 2,
            AirGround::Uncertain => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => AirGround::Ground,
            2 => AirGround::Airborne,
            3 => AirGround::Uncertain,
            _ => AirGround::Invalid,
        }
    }
}

/// How a reported heading angle is to be interpreted. The two deferred
/// variants are disambiguated by the HRD / TAH bits cached from the last
/// operational status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingType {
    GroundTrack,
    True,
    Magnetic,
    MagneticOrTrue,
    TrackOrHeading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CprType {
    #[default]
    Airborne,
    Surface,
    Coarse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emergency {
    None,
    General,
    Lifeguard,
    Minfuel,
    Nordo,
    Unlawful,
    Downed,
    Reserved,
}

impl Emergency {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Emergency::None,
            1 => Emergency::General,
            2 => Emergency::Lifeguard,
            3 => Emergency::Minfuel,
            4 => Emergency::Nordo,
            5 => Emergency::Unlawful,
            6 => Emergency::Downed,
            _ => Emergency::Reserved,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Emergency::None => 0,
            Emergency::General => 1,
            Emergency::Lifeguard => 2,
            Emergency::Minfuel => 3,
            Emergency::Nordo => 4,
            Emergency::Unlawful => 5,
            Emergency::Downed => 6,
            Emergency::Reserved => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Emergency::None => "none",
            Emergency::General => "general",
            Emergency::Lifeguard => "lifeguard",
            Emergency::Minfuel => "minfuel",
            Emergency::Nordo => "nordo",
            Emergency::Unlawful => "unlawful",
            Emergency::Downed => "downed",
            Emergency::Reserved => "reserved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilType {
    Unknown,
    PerSample,
    PerHour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAltSource {
    Unknown,
    Aircraft,
    Mcp,
    Fms,
}

// Autopilot engagement bits reported in target state messages.
pub const NAV_MODE_AUTOPILOT: u8 = 1;
pub const NAV_MODE_VNAV: u8 = 2;
pub const NAV_MODE_ALT_HOLD: u8 = 4;
pub const NAV_MODE_APPROACH: u8 = 8;
pub const NAV_MODE_LNAV: u8 = 16;
pub const NAV_MODE_TCAS: u8 = 32;

/// One undecoded CPR frame as carried in a position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CprFrame {
    pub odd: bool,
    pub typ: CprType,
    pub lat: u32,
    pub lon: u32,
    pub nucp: u8,
}

/// A position after CPR decode (or direct from SBS).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPos {
    pub lat: f64,
    pub lon: f64,
    pub nic: u8,
    pub rc: u32,
}

pub const RC_UNKNOWN: u32 = u32::MAX;

/// Integrity / accuracy subfields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy {
    pub nic_a: Option<bool>,
    pub nic_b: Option<bool>,
    pub nic_c: Option<bool>,
    pub nic_baro: Option<bool>,
    pub nac_p: Option<u8>,
    pub nac_v: Option<u8>,
    pub sil: Option<(u8, SilType)>,
    pub gva: Option<u8>,
    pub sda: Option<u8>,
}

/// Operational status fields the tracker caches.
#[derive(Debug, Clone, Copy)]
pub struct OpStatus {
    pub version: u8,
    pub hrd: Option<HeadingType>,
    pub tah: Option<HeadingType>,
}

/// Navigation intent (target state & status / vertical intent).
#[derive(Debug, Clone, Copy, Default)]
pub struct Nav {
    pub mcp_altitude: Option<u32>,
    pub fms_altitude: Option<u32>,
    pub qnh: Option<f64>,
    pub heading: Option<f64>,
    pub modes: Option<u8>,
    pub altitude_source: Option<NavAltSource>,
}

/// The decoded frame plus parsed fields. Messages are never stored; the
/// tracker consumes one and the record is dropped.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// 12 MHz hardware timestamp from the framing layer, 0 if none.
    pub timestamp_12mhz: u64,
    /// System time of reception, milliseconds.
    pub sys_timestamp: u64,
    /// 64-bit receiver id from the framing layer, 0 if none.
    pub receiver_id: u64,
    /// RSSI in [0..1] as a fraction of full scale power, 0 if unknown.
    pub signal_level: f64,

    /// Raw frame bytes for verbatim forwarding.
    pub raw: [u8; 14],
    pub raw_len: u8,

    pub df: u8,
    pub metype: u8,
    pub mesub: u8,
    pub addr: u32,
    pub addr_type: Option<AddrType>,
    /// Interrogator id from the CRC residual of a DF11.
    pub iid: u32,
    pub crc: u32,

    pub source: Option<Source>,
    pub remote: bool,
    pub sbs_in: bool,
    pub receiver_count_mlat: u16,

    // Tracker outcome flags.
    pub reduce_forward: bool,
    pub garbage: bool,
    pub duplicate: bool,
    pub pos_ignore: bool,
    pub pos_bad: bool,
    pub json_pos: bool,

    // Decoded fields; None when the frame did not carry them.
    pub altitude_baro: Option<i32>,
    pub alt_q_bit: bool,
    pub altitude_geom: Option<i32>,
    pub geom_delta: Option<i32>,
    pub heading: Option<(f64, HeadingType)>,
    pub track_rate: Option<f64>,
    pub roll: Option<f64>,
    pub gs_v0: Option<f64>,
    pub gs_v2: Option<f64>,
    pub ias: Option<u32>,
    pub tas: Option<u32>,
    pub mach: Option<f64>,
    pub baro_rate: Option<i32>,
    pub geom_rate: Option<i32>,
    pub squawk: Option<u16>,
    pub callsign: Option<String>,
    pub category: Option<u8>,
    pub emergency: Option<Emergency>,
    pub airground: AirGround,
    pub spi: Option<bool>,
    pub alert: Option<bool>,

    pub cpr: Option<CprFrame>,
    /// Direct position from an SBS line.
    pub sbs_pos: Option<(f64, f64)>,
    /// Result of CPR decode, written back by the tracker.
    pub decoded: Option<DecodedPos>,

    pub accuracy: Accuracy,
    pub opstatus: Option<OpStatus>,
    pub nav: Nav,

    /// Accounting handle for the connection the message arrived on.
    pub client: Option<Arc<ClientStats>>,
}

impl Message {
    pub fn new(sys_timestamp: u64) -> Self {
        Message { sys_timestamp, ..Default::default() }
    }

    /// Groundspeed appropriate for the given ADS-B version.
    pub fn gs_selected(&self, version: i8) -> Option<f64> {
        if version == 2 {
            self.gs_v2.or(self.gs_v0)
        } else {
            self.gs_v0.or(self.gs_v2)
        }
    }

    /// Whether this message carries a candidate position.
    pub fn has_position(&self) -> bool {
        self.cpr.is_some() || self.sbs_pos.is_some()
    }

    pub fn set_raw(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(14);
        self.raw[..n].copy_from_slice(&bytes[..n]);
        self.raw_len = n as u8;
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw[..self.raw_len as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ordering() {
        assert!(Source::Invalid < Source::Indirect);
        assert!(Source::Sbs < Source::Mlat);
        assert!(Source::Mlat < Source::ModeS);
        assert!(Source::Jaero < Source::ModeSChecked);
        assert!(Source::ModeSChecked < Source::Tisb);
        assert!(Source::Adsr < Source::Adsb);
        assert!(Source::Adsb < Source::Prio);
    }

    #[test]
    fn test_addrtype_priority() {
        assert!(AddrType::AdsbIcao < AddrType::TisbIcao);
        assert!(AddrType::Mlat < AddrType::ModeA);
    }

    #[test]
    fn test_gs_selected_version() {
        let mut mm = Message::new(0);
        mm.gs_v0 = Some(100.0);
        mm.gs_v2 = Some(110.0);
        assert_eq!(mm.gs_selected(0), Some(100.0));
        assert_eq!(mm.gs_selected(2), Some(110.0));
        mm.gs_v2 = None;
        assert_eq!(mm.gs_selected(2), Some(100.0));
    }

    #[test]
    fn test_raw_roundtrip() {
        let mut mm = Message::new(0);
        let frame = [0x8du8, 0x4b, 0x18, 0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0x12, 0x34];
        mm.set_raw(&frame);
        assert_eq!(mm.raw_bytes(), &frame);
    }
}
