// The long-lived per-aircraft record: fused scalars with per-field
// validity, position state, CPR scratch, and the quantized StateAll
// serialization used by the trace and the state files.

use bytemuck::{Pod, Zeroable};

use crate::clock::{MINUTES, SECONDS};
use crate::globe::TILE_NONE;
use crate::modes::message::{
    AddrType, AirGround, CprType, Emergency, HeadingType, Message, NavAltSource, SilType, Source,
    RC_UNKNOWN,
};

/// Set on addresses that are not ICAO-assigned (TIS-B track files etc).
pub const NON_ICAO_ADDRESS: u32 = 1 << 24;

/// A field is considered fresh for this long; a worse source may not
/// overwrite a fresh value.
pub const TRACK_STALE: u64 = 60 * SECONDS;
/// Most fields expire after this.
pub const TRACK_EXPIRE: u64 = 90 * SECONDS;
/// Slow-changing fields (callsign, squawk, air/ground) last longer.
pub const TRACK_EXPIRE_LONG: u64 = 240 * SECONDS;
/// Wind / temperature derivation input freshness bound.
pub const TRACK_WT_TIMEOUT: u64 = 45 * SECONDS;
/// Upper bound of the barometric-altitude reliability counter.
pub const ALTITUDE_BARO_RELIABLE_MAX: i32 = 20;
/// Ring size for recent RSSI samples.
pub const SIGNAL_RING: usize = 8;
/// Recent receiver-id ring length.
pub const RECEIVER_ID_RING: usize = 12;

impl Default for Source {
    fn default() -> Self {
        Source::Invalid
    }
}

/// Per-field validity: who supplied the value, when, and whether it has
/// gone stale. `last_source` never goes backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validity {
    pub source: Source,
    pub last_source: Source,
    pub updated: u64,
    pub stale: bool,
    pub next_reduce_forward: u64,
}

/// How often a field's updates are forwarded on the reduced-rate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceRate {
    Rare,
    Often,
    VeryOften,
}

impl Validity {
    pub fn valid(&self) -> bool {
        self.source != Source::Invalid
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.updated)
    }

    pub fn invalidate(&mut self) {
        self.source = Source::Invalid;
    }

    /// Staleness / expiry bookkeeping, run by the sweeper.
    pub fn update(&mut self, now: u64, expire: u64) {
        if self.source == Source::Invalid {
            return;
        }
        self.stale = now > self.updated + TRACK_STALE;
        if now > self.updated + expire {
            self.source = Source::Invalid;
        }
    }
}

/// Should new data from `source` replace this field? On accept, the
/// validity is updated and the message may be flagged for reduced-rate
/// forwarding.
pub fn accept_data(
    d: &mut Validity,
    source: Source,
    mm: &mut Message,
    reduce: ReduceRate,
    reduce_interval: u64,
) -> bool {
    let receive_time = mm.sys_timestamp;

    if source == Source::Invalid {
        return false;
    }
    if receive_time < d.updated {
        return false;
    }
    if source < d.source && receive_time < d.updated + TRACK_STALE {
        return false;
    }

    // keep MLAT and satellite data from churning better sources
    if source < d.last_source {
        if source <= Source::Mlat && receive_time < d.updated + 30 * SECONDS {
            return false;
        }
        if source == Source::Jaero && receive_time < d.updated + 600 * SECONDS {
            return false;
        }
    }

    // priority input records itself as ADS-B so plain ADS-B cannot
    // override it later
    d.source = if source == Source::Prio { Source::Adsb } else { source };
    d.last_source = d.source;
    d.updated = receive_time;
    d.stale = false;

    if receive_time > d.next_reduce_forward && !mm.sbs_in {
        d.next_reduce_forward = receive_time
            + match reduce {
                ReduceRate::Rare => reduce_interval * 4,
                ReduceRate::Often => reduce_interval,
                ReduceRate::VeryOften => reduce_interval / 2,
            };
        // keep global CPR possible even at very large intervals
        if reduce_interval > 7000 && mm.cpr.is_some() {
            d.next_reduce_forward = receive_time + 7000;
        }
        mm.reduce_forward = true;
    }
    true
}

/// Validity for a value combined from two others: the worse source, the
/// later timestamp.
pub fn combine_validity(from1: &Validity, from2: &Validity, now: u64) -> Validity {
    if from1.source == Source::Invalid {
        return *from2;
    }
    if from2.source == Source::Invalid {
        return *from1;
    }
    let source = from1.source.min(from2.source);
    let updated = from1.updated.max(from2.updated);
    Validity {
        source,
        last_source: source,
        updated,
        stale: now > updated + TRACK_STALE,
        next_reduce_forward: 0,
    }
}

/// Order two validities: positive when lhs is preferable.
pub fn compare_validity(lhs: &Validity, rhs: &Validity) -> i32 {
    if !lhs.stale && lhs.source > rhs.source {
        1
    } else if !rhs.stale && lhs.source < rhs.source {
        -1
    } else if lhs.updated >= rhs.updated {
        1
    } else {
        -1
    }
}

/// One CPR frame stashed on the aircraft for global decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct CprScratch {
    pub valid: Validity,
    pub typ: CprType,
    pub lat: u32,
    pub lon: u32,
    pub nic: u8,
    pub rc: u32,
}

/// The long-lived aircraft record. Scalar state only; the trajectory
/// lives beside it in the registry slot so a position-message rollback
/// can restore the scalars with a plain clone.
#[derive(Debug, Clone)]
pub struct Aircraft {
    pub addr: u32,
    pub addr_type: AddrType,
    pub addrtype_updated: u64,

    // from the metadata db, if it was present at load
    pub registration: Option<String>,
    pub type_code: Option<String>,
    pub type_long: Option<String>,
    pub db_flags: u32,

    /// Last address-reliable message.
    pub seen: u64,
    pub messages: u32,

    pub signal_level: [f64; SIGNAL_RING],
    pub signal_next: usize,
    pub no_signal_count: u8,

    pub adsb_version: i8,
    pub adsr_version: i8,
    pub tisb_version: i8,
    pub adsb_hrd: HeadingType,
    pub adsb_tah: HeadingType,

    pub callsign: String,
    pub callsign_valid: Validity,

    pub altitude_baro: i32,
    pub altitude_baro_valid: Validity,
    pub alt_reliable: i32,
    pub altitude_geom: i32,
    pub altitude_geom_valid: Validity,
    pub geom_delta: i32,
    pub geom_delta_valid: Validity,

    pub gs: f64,
    pub gs_valid: Validity,
    pub gs_last_pos: f64,
    pub ias: u32,
    pub ias_valid: Validity,
    pub tas: u32,
    pub tas_valid: Validity,
    pub mach: f64,
    pub mach_valid: Validity,

    pub track: f64,
    pub track_valid: Validity,
    pub calc_track: f64,
    pub track_rate: f64,
    pub track_rate_valid: Validity,
    pub roll: f64,
    pub roll_valid: Validity,
    pub mag_heading: f64,
    pub mag_heading_valid: Validity,
    pub true_heading: f64,
    pub true_heading_valid: Validity,

    pub baro_rate: i32,
    pub baro_rate_valid: Validity,
    pub geom_rate: i32,
    pub geom_rate_valid: Validity,

    pub squawk: u16,
    pub squawk_valid: Validity,
    pub mode_a_hit: bool,
    pub mode_c_hit: bool,

    pub emergency: Emergency,
    pub emergency_valid: Validity,
    pub category: u8,
    pub category_updated: u64,
    pub airground: AirGround,
    pub airground_valid: Validity,

    pub nav_qnh: f64,
    pub nav_qnh_valid: Validity,
    pub nav_altitude_mcp: u32,
    pub nav_altitude_mcp_valid: Validity,
    pub nav_altitude_fms: u32,
    pub nav_altitude_fms_valid: Validity,
    pub nav_altitude_src: NavAltSource,
    pub nav_altitude_src_valid: Validity,
    pub nav_heading: f64,
    pub nav_heading_valid: Validity,
    pub nav_modes: u8,
    pub nav_modes_valid: Validity,

    pub alert: bool,
    pub alert_valid: Validity,
    pub spi: bool,
    pub spi_valid: Validity,

    pub nic_a: bool,
    pub nic_a_valid: Validity,
    pub nic_c: bool,
    pub nic_c_valid: Validity,
    pub nic_baro: bool,
    pub nic_baro_valid: Validity,
    pub nac_p: u8,
    pub nac_p_valid: Validity,
    pub nac_v: u8,
    pub nac_v_valid: Validity,
    pub sil: u8,
    pub sil_type: Option<SilType>,
    pub sil_valid: Validity,
    pub gva: u8,
    pub gva_valid: Validity,
    pub sda: u8,
    pub sda_valid: Validity,

    // position state
    pub lat: f64,
    pub lon: f64,
    pub pos_nic: u8,
    pub pos_rc: u32,
    pub position_valid: Validity,
    pub pos_surface: bool,
    pub seen_pos: u64,
    pub seen_pos_reliable: u64,
    pub seen_pos_global: u64,
    pub lat_reliable: f64,
    pub lon_reliable: f64,
    pub pos_reliable_odd: i32,
    pub pos_reliable_even: i32,
    pub last_cpr_type: Option<CprType>,

    pub cpr_even: CprScratch,
    pub cpr_odd: CprScratch,

    // rough reference from the receiver that heard a clean DF11
    pub rr_lat: f64,
    pub rr_lon: f64,
    pub rr_seen: u64,

    pub last_pos_receiver_id: u64,
    pub receiver_count_mlat: u16,
    pub receiver_ids: [u16; RECEIVER_ID_RING],
    pub receiver_ids_next: usize,

    // derived
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub wind_updated: u64,
    pub wind_altitude: i32,
    pub oat: f64,
    pub tat: f64,
    pub oat_updated: u64,

    pub globe_index: i32,
    pub next_reduce_forward_df11: u64,
}

impl Aircraft {
    pub fn new(addr: u32, now: u64) -> Self {
        Aircraft {
            addr,
            addr_type: AddrType::Unknown,
            addrtype_updated: now,
            registration: None,
            type_code: None,
            type_long: None,
            db_flags: 0,
            seen: now,
            messages: 0,
            signal_level: [0.0; SIGNAL_RING],
            signal_next: 0,
            no_signal_count: 0,
            adsb_version: -1,
            adsr_version: -1,
            tisb_version: -1,
            adsb_hrd: HeadingType::Magnetic,
            adsb_tah: HeadingType::GroundTrack,
            callsign: String::new(),
            callsign_valid: Validity::default(),
            altitude_baro: 0,
            altitude_baro_valid: Validity::default(),
            alt_reliable: 0,
            altitude_geom: 0,
            altitude_geom_valid: Validity::default(),
            geom_delta: 0,
            geom_delta_valid: Validity::default(),
            gs: 0.0,
            gs_valid: Validity::default(),
            gs_last_pos: 0.0,
            ias: 0,
            ias_valid: Validity::default(),
            tas: 0,
            tas_valid: Validity::default(),
            mach: 0.0,
            mach_valid: Validity::default(),
            track: 0.0,
            track_valid: Validity::default(),
            calc_track: 0.0,
            track_rate: 0.0,
            track_rate_valid: Validity::default(),
            roll: 0.0,
            roll_valid: Validity::default(),
            mag_heading: 0.0,
            mag_heading_valid: Validity::default(),
            true_heading: 0.0,
            true_heading_valid: Validity::default(),
            baro_rate: 0,
            baro_rate_valid: Validity::default(),
            geom_rate: 0,
            geom_rate_valid: Validity::default(),
            squawk: 0,
            squawk_valid: Validity::default(),
            mode_a_hit: false,
            mode_c_hit: false,
            emergency: Emergency::None,
            emergency_valid: Validity::default(),
            category: 0,
            category_updated: 0,
            airground: AirGround::Invalid,
            airground_valid: Validity::default(),
            nav_qnh: 0.0,
            nav_qnh_valid: Validity::default(),
            nav_altitude_mcp: 0,
            nav_altitude_mcp_valid: Validity::default(),
            nav_altitude_fms: 0,
            nav_altitude_fms_valid: Validity::default(),
            nav_altitude_src: NavAltSource::Unknown,
            nav_altitude_src_valid: Validity::default(),
            nav_heading: 0.0,
            nav_heading_valid: Validity::default(),
            nav_modes: 0,
            nav_modes_valid: Validity::default(),
            alert: false,
            alert_valid: Validity::default(),
            spi: false,
            spi_valid: Validity::default(),
            nic_a: false,
            nic_a_valid: Validity::default(),
            nic_c: false,
            nic_c_valid: Validity::default(),
            nic_baro: false,
            nic_baro_valid: Validity::default(),
            nac_p: 0,
            nac_p_valid: Validity::default(),
            nac_v: 0,
            nac_v_valid: Validity::default(),
            sil: 0,
            sil_type: None,
            sil_valid: Validity::default(),
            gva: 0,
            gva_valid: Validity::default(),
            sda: 0,
            sda_valid: Validity::default(),
            lat: 0.0,
            lon: 0.0,
            pos_nic: 0,
            pos_rc: 0,
            position_valid: Validity::default(),
            pos_surface: false,
            seen_pos: 0,
            seen_pos_reliable: 0,
            seen_pos_global: 0,
            lat_reliable: 0.0,
            lon_reliable: 0.0,
            pos_reliable_odd: 0,
            pos_reliable_even: 0,
            last_cpr_type: None,
            cpr_even: CprScratch::default(),
            cpr_odd: CprScratch::default(),
            rr_lat: 0.0,
            rr_lon: 0.0,
            rr_seen: 0,
            last_pos_receiver_id: 0,
            receiver_count_mlat: 0,
            receiver_ids: [0; RECEIVER_ID_RING],
            receiver_ids_next: 0,
            wind_speed: 0.0,
            wind_direction: 0.0,
            wind_updated: 0,
            wind_altitude: 0,
            oat: 0.0,
            tat: 0.0,
            oat_updated: 0,
            globe_index: TILE_NONE,
            next_reduce_forward_df11: 0,
        }
    }

    pub fn non_icao(&self) -> bool {
        self.addr & NON_ICAO_ADDRESS != 0
    }

    pub fn hex(&self) -> String {
        if self.non_icao() {
            format!("~{:06x}", self.addr & 0xffffff)
        } else {
            format!("{:06x}", self.addr & 0xffffff)
        }
    }

    /// Mean of the signal ring, for output documents.
    pub fn rssi(&self) -> f64 {
        let sum: f64 = self.signal_level.iter().sum();
        let mean = sum / SIGNAL_RING as f64;
        if mean <= 0.0 {
            return -50.0;
        }
        10.0 * mean.log10()
    }

    /// Track a new RSSI sample; a run of silent messages zeroes the ring.
    pub fn record_signal(&mut self, level: f64) {
        if level > 0.0 {
            self.signal_level[self.signal_next] = level;
            self.signal_next = (self.signal_next + 1) % SIGNAL_RING;
            if self.no_signal_count >= 10 {
                for s in self.signal_level.iter_mut() {
                    *s = level.max(0.0);
                }
            }
            self.no_signal_count = 0;
        } else if self.no_signal_count < 10 {
            self.no_signal_count += 1;
            if self.no_signal_count >= 10 {
                self.signal_level = [0.0; SIGNAL_RING];
            }
        }
    }

    /// Both reliability counters at or above the threshold.
    pub fn pos_reliable(&self, threshold: i32) -> bool {
        let needed = threshold.max(1);
        self.position_valid.valid()
            && self.pos_reliable_odd >= needed
            && self.pos_reliable_even >= needed
    }
}

// StateAll flag bits: which validities were set at snapshot time plus a
// handful of boolean values.
const SA_CALLSIGN: u64 = 1 << 0;
const SA_ALTITUDE_BARO: u64 = 1 << 1;
const SA_ALTITUDE_GEOM: u64 = 1 << 2;
const SA_GEOM_DELTA: u64 = 1 << 3;
const SA_GS: u64 = 1 << 4;
const SA_IAS: u64 = 1 << 5;
const SA_TAS: u64 = 1 << 6;
const SA_MACH: u64 = 1 << 7;
const SA_TRACK: u64 = 1 << 8;
const SA_TRACK_RATE: u64 = 1 << 9;
const SA_ROLL: u64 = 1 << 10;
const SA_MAG_HEADING: u64 = 1 << 11;
const SA_TRUE_HEADING: u64 = 1 << 12;
const SA_BARO_RATE: u64 = 1 << 13;
const SA_GEOM_RATE: u64 = 1 << 14;
const SA_NIC_A_VALID: u64 = 1 << 15;
const SA_NIC_C_VALID: u64 = 1 << 16;
const SA_NIC_BARO_VALID: u64 = 1 << 17;
const SA_NAC_P: u64 = 1 << 18;
const SA_NAC_V: u64 = 1 << 19;
const SA_SIL: u64 = 1 << 20;
const SA_GVA: u64 = 1 << 21;
const SA_SDA: u64 = 1 << 22;
const SA_SQUAWK: u64 = 1 << 23;
const SA_EMERGENCY: u64 = 1 << 24;
const SA_AIRGROUND: u64 = 1 << 25;
const SA_NAV_QNH: u64 = 1 << 26;
const SA_NAV_ALT_MCP: u64 = 1 << 27;
const SA_NAV_ALT_FMS: u64 = 1 << 28;
const SA_NAV_ALT_SRC: u64 = 1 << 29;
const SA_NAV_HEADING: u64 = 1 << 30;
const SA_NAV_MODES: u64 = 1 << 31;
const SA_POSITION: u64 = 1 << 32;
const SA_ALERT_VALID: u64 = 1 << 33;
const SA_SPI_VALID: u64 = 1 << 34;
const SA_WIND: u64 = 1 << 35;
const SA_TEMP: u64 = 1 << 36;
const SA_NIC_A: u64 = 1 << 37;
const SA_NIC_C: u64 = 1 << 38;
const SA_NIC_BARO: u64 = 1 << 39;
const SA_ALERT: u64 = 1 << 40;
const SA_SPI: u64 = 1 << 41;

/// Dense snapshot of the fused fields, paired with every fourth trace
/// point and stored in the state files. All quantizations are documented
/// on the fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct StateAll {
    pub flags: u64,
    /// feet
    pub altitude_baro: i32,
    /// meters
    pub pos_rc: i32,
    /// 25 ft units
    pub altitude_geom: i16,
    /// feet
    pub geom_delta: i16,
    /// 8 fpm units
    pub baro_rate: i16,
    /// 8 fpm units
    pub geom_rate: i16,
    /// 0.1 millibar units
    pub nav_qnh: i16,
    /// 0.1 kt units
    pub gs: i16,
    /// 0.001 Mach units
    pub mach: i16,
    /// 0.01 deg/s units
    pub track_rate: i16,
    /// 0.01 deg units
    pub roll: i16,
    /// 1/90 deg units
    pub track: i16,
    pub mag_heading: i16,
    pub true_heading: i16,
    pub nav_heading: i16,
    /// degrees
    pub wind_direction: i16,
    /// knots
    pub wind_speed: i16,
    /// degrees C
    pub oat: i16,
    pub tat: i16,
    pub squawk: u16,
    pub ias: u16,
    pub tas: u16,
    /// 4 ft units
    pub nav_altitude_mcp: u16,
    pub nav_altitude_fms: u16,
    pub callsign: [u8; 8],
    pub pos_nic: u8,
    pub category: u8,
    pub emergency: u8,
    pub airground: u8,
    pub addr_type: u8,
    pub nav_modes: u8,
    pub nav_altitude_src: u8,
    pub sil_type: u8,
    /// 15 = unset
    pub adsb_version: u8,
    pub adsr_version: u8,
    pub tisb_version: u8,
    pub nac_p: u8,
    pub nac_v: u8,
    pub sil: u8,
    pub gva: u8,
    pub sda: u8,
    pub _pad: [u8; 4],
}

fn vstate(now: u64, v: &Validity, position_valid: &Validity) -> bool {
    // treat a field as set if it is valid, or went stale only as long
    // ago as the position did (otherwise short gaps drop everything)
    v.valid() || (v.updated != 0 && v.updated + TRACK_EXPIRE >= position_valid.updated)
}

fn addr_type_from_u8(v: u8) -> AddrType {
    match v {
        0 => AddrType::AdsbIcao,
        1 => AddrType::AdsbIcaoNt,
        2 => AddrType::AdsrIcao,
        3 => AddrType::TisbIcao,
        4 => AddrType::Jaero,
        5 => AddrType::Mlat,
        6 => AddrType::Other,
        7 => AddrType::ModeS,
        8 => AddrType::AdsbOther,
        9 => AddrType::AdsrOther,
        10 => AddrType::TisbTrackfile,
        11 => AddrType::TisbOther,
        12 => AddrType::ModeA,
        _ => AddrType::Unknown,
    }
}

fn nav_alt_src_to_u8(v: NavAltSource) -> u8 {
    match v {
        NavAltSource::Unknown => 0,
        NavAltSource::Aircraft => 1,
        NavAltSource::Mcp => 2,
        NavAltSource::Fms => 3,
    }
}

fn nav_alt_src_from_u8(v: u8) -> NavAltSource {
    match v {
        1 => NavAltSource::Aircraft,
        2 => NavAltSource::Mcp,
        3 => NavAltSource::Fms,
        _ => NavAltSource::Unknown,
    }
}

fn sil_type_to_u8(v: Option<SilType>) -> u8 {
    match v {
        None => 0,
        Some(SilType::Unknown) => 1,
        Some(SilType::PerSample) => 2,
        Some(SilType::PerHour) => 3,
    }
}

fn sil_type_from_u8(v: u8) -> Option<SilType> {
    match v {
        1 => Some(SilType::Unknown),
        2 => Some(SilType::PerSample),
        3 => Some(SilType::PerHour),
        _ => None,
    }
}

pub fn to_state_all(a: &Aircraft, now: u64) -> StateAll {
    let mut s = StateAll::default();

    let bytes = a.callsign.as_bytes();
    for i in 0..8 {
        s.callsign[i] = *bytes.get(i).unwrap_or(&b' ');
    }

    s.altitude_baro = a.altitude_baro;
    s.pos_nic = a.pos_nic;
    s.pos_rc = if a.pos_rc == RC_UNKNOWN { -1 } else { a.pos_rc as i32 };
    s.altitude_geom = (a.altitude_geom as f64 / 25.0).round() as i16;
    s.geom_delta = a.geom_delta.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    s.baro_rate = (a.baro_rate as f64 / 8.0).round() as i16;
    s.geom_rate = (a.geom_rate as f64 / 8.0).round() as i16;
    s.ias = a.ias as u16;
    s.tas = a.tas as u16;

    s.squawk = a.squawk;
    s.category = a.category;
    s.nav_altitude_mcp = (a.nav_altitude_mcp as f64 / 4.0).round() as u16;
    s.nav_altitude_fms = (a.nav_altitude_fms as f64 / 4.0).round() as u16;
    s.nav_qnh = (a.nav_qnh * 10.0).round() as i16;
    s.gs = (a.gs * 10.0).round() as i16;
    s.mach = (a.mach * 1000.0).round() as i16;
    s.track_rate = (a.track_rate * 100.0).round() as i16;
    s.roll = (a.roll * 100.0).round() as i16;
    s.track = (a.track * 90.0).round() as i16;
    s.mag_heading = (a.mag_heading * 90.0).round() as i16;
    s.true_heading = (a.true_heading * 90.0).round() as i16;
    s.nav_heading = (a.nav_heading * 90.0).round() as i16;

    s.emergency = a.emergency.as_u8();
    s.airground = a.airground.as_u8();
    s.addr_type = a.addr_type as u8;
    s.nav_modes = a.nav_modes;
    s.nav_altitude_src = nav_alt_src_to_u8(a.nav_altitude_src);
    s.sil_type = sil_type_to_u8(a.sil_type);

    if now < a.wind_updated + TRACK_EXPIRE && (a.wind_altitude - a.altitude_baro).abs() < 500 {
        s.wind_direction = a.wind_direction.round() as i16;
        s.wind_speed = a.wind_speed.round() as i16;
        s.flags |= SA_WIND;
    }
    if now < a.oat_updated + TRACK_EXPIRE {
        s.oat = a.oat.round() as i16;
        s.tat = a.tat.round() as i16;
        s.flags |= SA_TEMP;
    }

    s.adsb_version = if a.adsb_version < 0 { 15 } else { a.adsb_version as u8 };
    s.adsr_version = if a.adsr_version < 0 { 15 } else { a.adsr_version as u8 };
    s.tisb_version = if a.tisb_version < 0 { 15 } else { a.tisb_version as u8 };

    s.nac_p = a.nac_p;
    s.nac_v = a.nac_v;
    s.sil = a.sil;
    s.gva = a.gva;
    s.sda = a.sda;
    if a.nic_a {
        s.flags |= SA_NIC_A;
    }
    if a.nic_c {
        s.flags |= SA_NIC_C;
    }
    if a.nic_baro {
        s.flags |= SA_NIC_BARO;
    }
    if a.alert {
        s.flags |= SA_ALERT;
    }
    if a.spi {
        s.flags |= SA_SPI;
    }

    let pv = &a.position_valid;
    let mut set = |bit: u64, v: &Validity| {
        if vstate(now, v, pv) {
            s.flags |= bit;
        }
    };
    set(SA_CALLSIGN, &a.callsign_valid);
    set(SA_ALTITUDE_BARO, &a.altitude_baro_valid);
    set(SA_ALTITUDE_GEOM, &a.altitude_geom_valid);
    set(SA_GEOM_DELTA, &a.geom_delta_valid);
    set(SA_GS, &a.gs_valid);
    set(SA_IAS, &a.ias_valid);
    set(SA_TAS, &a.tas_valid);
    set(SA_MACH, &a.mach_valid);
    set(SA_TRACK, &a.track_valid);
    set(SA_TRACK_RATE, &a.track_rate_valid);
    set(SA_ROLL, &a.roll_valid);
    set(SA_MAG_HEADING, &a.mag_heading_valid);
    set(SA_TRUE_HEADING, &a.true_heading_valid);
    set(SA_BARO_RATE, &a.baro_rate_valid);
    set(SA_GEOM_RATE, &a.geom_rate_valid);
    set(SA_NIC_A_VALID, &a.nic_a_valid);
    set(SA_NIC_C_VALID, &a.nic_c_valid);
    set(SA_NIC_BARO_VALID, &a.nic_baro_valid);
    set(SA_NAC_P, &a.nac_p_valid);
    set(SA_NAC_V, &a.nac_v_valid);
    set(SA_SIL, &a.sil_valid);
    set(SA_GVA, &a.gva_valid);
    set(SA_SDA, &a.sda_valid);
    set(SA_SQUAWK, &a.squawk_valid);
    set(SA_EMERGENCY, &a.emergency_valid);
    set(SA_AIRGROUND, &a.airground_valid);
    set(SA_NAV_QNH, &a.nav_qnh_valid);
    set(SA_NAV_ALT_MCP, &a.nav_altitude_mcp_valid);
    set(SA_NAV_ALT_FMS, &a.nav_altitude_fms_valid);
    set(SA_NAV_ALT_SRC, &a.nav_altitude_src_valid);
    set(SA_NAV_HEADING, &a.nav_heading_valid);
    set(SA_NAV_MODES, &a.nav_modes_valid);
    set(SA_POSITION, &a.position_valid);
    set(SA_ALERT_VALID, &a.alert_valid);
    set(SA_SPI_VALID, &a.spi_valid);

    s
}

pub fn from_state_all(s: &StateAll, a: &mut Aircraft, ts: u64) {
    let end = s.callsign.iter().position(|&b| b == 0).unwrap_or(8);
    a.callsign = String::from_utf8_lossy(&s.callsign[..end]).into_owned();

    a.altitude_baro = s.altitude_baro;
    a.pos_nic = s.pos_nic;
    a.pos_rc = if s.pos_rc < 0 { RC_UNKNOWN } else { s.pos_rc as u32 };
    a.altitude_geom = s.altitude_geom as i32 * 25;
    a.geom_delta = s.geom_delta as i32;
    a.baro_rate = s.baro_rate as i32 * 8;
    a.geom_rate = s.geom_rate as i32 * 8;
    a.ias = s.ias as u32;
    a.tas = s.tas as u32;

    a.squawk = s.squawk;
    a.category = s.category;
    a.nav_altitude_mcp = s.nav_altitude_mcp as u32 * 4;
    a.nav_altitude_fms = s.nav_altitude_fms as u32 * 4;
    a.nav_qnh = s.nav_qnh as f64 / 10.0;
    a.gs = s.gs as f64 / 10.0;
    a.mach = s.mach as f64 / 1000.0;
    a.track_rate = s.track_rate as f64 / 100.0;
    a.roll = s.roll as f64 / 100.0;
    a.track = s.track as f64 / 90.0;
    a.mag_heading = s.mag_heading as f64 / 90.0;
    a.true_heading = s.true_heading as f64 / 90.0;
    a.nav_heading = s.nav_heading as f64 / 90.0;

    a.emergency = Emergency::from_u8(s.emergency);
    a.airground = AirGround::from_u8(s.airground);
    a.addr_type = addr_type_from_u8(s.addr_type);
    a.nav_modes = s.nav_modes;
    a.nav_altitude_src = nav_alt_src_from_u8(s.nav_altitude_src);
    a.sil_type = sil_type_from_u8(s.sil_type);

    if s.flags & SA_WIND != 0 {
        a.wind_direction = s.wind_direction as f64;
        a.wind_speed = s.wind_speed as f64;
        a.wind_updated = ts.saturating_sub(5000);
        a.wind_altitude = a.altitude_baro;
    }
    if s.flags & SA_TEMP != 0 {
        a.oat = s.oat as f64;
        a.tat = s.tat as f64;
        a.oat_updated = ts.saturating_sub(5000);
    }

    a.adsb_version = if s.adsb_version == 15 { -1 } else { s.adsb_version as i8 };
    a.adsr_version = if s.adsr_version == 15 { -1 } else { s.adsr_version as i8 };
    a.tisb_version = if s.tisb_version == 15 { -1 } else { s.tisb_version as i8 };

    a.nac_p = s.nac_p;
    a.nac_v = s.nac_v;
    a.sil = s.sil;
    a.gva = s.gva;
    a.sda = s.sda;
    a.nic_a = s.flags & SA_NIC_A != 0;
    a.nic_c = s.flags & SA_NIC_C != 0;
    a.nic_baro = s.flags & SA_NIC_BARO != 0;
    a.alert = s.flags & SA_ALERT != 0;
    a.spi = s.flags & SA_SPI != 0;

    // restored fields get an indirect source and a slightly-aged stamp
    // so the usual output paths can be reused
    let restore = |set: bool| Validity {
        source: if set { Source::Indirect } else { Source::Invalid },
        last_source: if set { Source::Indirect } else { Source::Invalid },
        updated: ts.saturating_sub(5000),
        stale: false,
        next_reduce_forward: 0,
    };
    a.callsign_valid = restore(s.flags & SA_CALLSIGN != 0);
    a.altitude_baro_valid = restore(s.flags & SA_ALTITUDE_BARO != 0);
    a.altitude_geom_valid = restore(s.flags & SA_ALTITUDE_GEOM != 0);
    a.geom_delta_valid = restore(s.flags & SA_GEOM_DELTA != 0);
    a.gs_valid = restore(s.flags & SA_GS != 0);
    a.ias_valid = restore(s.flags & SA_IAS != 0);
    a.tas_valid = restore(s.flags & SA_TAS != 0);
    a.mach_valid = restore(s.flags & SA_MACH != 0);
    a.track_valid = restore(s.flags & SA_TRACK != 0);
    a.track_rate_valid = restore(s.flags & SA_TRACK_RATE != 0);
    a.roll_valid = restore(s.flags & SA_ROLL != 0);
    a.mag_heading_valid = restore(s.flags & SA_MAG_HEADING != 0);
    a.true_heading_valid = restore(s.flags & SA_TRUE_HEADING != 0);
    a.baro_rate_valid = restore(s.flags & SA_BARO_RATE != 0);
    a.geom_rate_valid = restore(s.flags & SA_GEOM_RATE != 0);
    a.nic_a_valid = restore(s.flags & SA_NIC_A_VALID != 0);
    a.nic_c_valid = restore(s.flags & SA_NIC_C_VALID != 0);
    a.nic_baro_valid = restore(s.flags & SA_NIC_BARO_VALID != 0);
    a.nac_p_valid = restore(s.flags & SA_NAC_P != 0);
    a.nac_v_valid = restore(s.flags & SA_NAC_V != 0);
    a.sil_valid = restore(s.flags & SA_SIL != 0);
    a.gva_valid = restore(s.flags & SA_GVA != 0);
    a.sda_valid = restore(s.flags & SA_SDA != 0);
    a.squawk_valid = restore(s.flags & SA_SQUAWK != 0);
    a.emergency_valid = restore(s.flags & SA_EMERGENCY != 0);
    a.airground_valid = restore(s.flags & SA_AIRGROUND != 0);
    a.nav_qnh_valid = restore(s.flags & SA_NAV_QNH != 0);
    a.nav_altitude_mcp_valid = restore(s.flags & SA_NAV_ALT_MCP != 0);
    a.nav_altitude_fms_valid = restore(s.flags & SA_NAV_ALT_FMS != 0);
    a.nav_altitude_src_valid = restore(s.flags & SA_NAV_ALT_SRC != 0);
    a.nav_heading_valid = restore(s.flags & SA_NAV_HEADING != 0);
    a.nav_modes_valid = restore(s.flags & SA_NAV_MODES != 0);
    a.position_valid = restore(s.flags & SA_POSITION != 0);
    a.alert_valid = restore(s.flags & SA_ALERT_VALID != 0);
    a.spi_valid = restore(s.flags & SA_SPI_VALID != 0);
}

/// Timeout after which the position reliability counters reset.
pub const POS_RELIABLE_TIMEOUT: u64 = 2 * MINUTES;

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(now: u64) -> Message {
        Message::new(now)
    }

    #[test]
    fn test_accept_higher_source_wins() {
        let mut v = Validity::default();
        let mut m = msg(1000);
        assert!(accept_data(&mut v, Source::Mlat, &mut m, ReduceRate::Often, 1000));
        assert_eq!(v.source, Source::Mlat);

        let mut m2 = msg(1500);
        assert!(accept_data(&mut v, Source::Adsb, &mut m2, ReduceRate::Often, 1000));
        assert_eq!(v.source, Source::Adsb);
        assert_eq!(v.updated, 1500);
    }

    #[test]
    fn test_accept_lower_source_blocked_while_fresh() {
        let mut v = Validity::default();
        let mut m = msg(1000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000));

        let mut m2 = msg(2000);
        assert!(!accept_data(&mut v, Source::Sbs, &mut m2, ReduceRate::Often, 1000));
        assert_eq!(v.source, Source::Adsb);

        // after the stale interval the lower source may take over,
        // except for the MLAT 30 s guard
        let mut m3 = msg(1000 + TRACK_STALE + 1000);
        assert!(accept_data(&mut v, Source::ModeS, &mut m3, ReduceRate::Often, 1000));
        assert_eq!(v.source, Source::ModeS);
    }

    #[test]
    fn test_accept_mlat_guard() {
        let mut v = Validity::default();
        let mut m = msg(100_000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000));

        // 70 s later the value is stale, but MLAT still sits under the
        // 30 s guard only within 30 s; at 70 s it may take over
        let mut m2 = msg(170_000);
        assert!(accept_data(&mut v, Source::Mlat, &mut m2, ReduceRate::Often, 1000));

        // back to ADS-B, then MLAT right away: blocked even though
        // the source fields were reset by the takeover
        let mut m3 = msg(171_000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m3, ReduceRate::Often, 1000));
        let mut m4 = msg(172_000);
        assert!(!accept_data(&mut v, Source::Mlat, &mut m4, ReduceRate::Often, 1000));
    }

    #[test]
    fn test_accept_prio_records_as_adsb() {
        let mut v = Validity::default();
        let mut m = msg(1000);
        assert!(accept_data(&mut v, Source::Prio, &mut m, ReduceRate::Often, 1000));
        assert_eq!(v.source, Source::Adsb);

        // plain ADS-B later cannot be distinguished, which is the point
        let mut m2 = msg(2000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m2, ReduceRate::Often, 1000));
    }

    #[test]
    fn test_accept_stamps_reduce_forward() {
        let mut v = Validity::default();
        let mut m = msg(10_000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000));
        assert!(m.reduce_forward);
        assert_eq!(v.next_reduce_forward, 11_000);

        // next update within the window does not forward
        let mut m2 = msg(10_500);
        assert!(accept_data(&mut v, Source::Adsb, &mut m2, ReduceRate::Often, 1000));
        assert!(!m2.reduce_forward);
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let mut v = Validity::default();
        let mut m = msg(5000);
        assert!(accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000));
        let mut m2 = msg(4000);
        assert!(!accept_data(&mut v, Source::Adsb, &mut m2, ReduceRate::Often, 1000));
    }

    #[test]
    fn test_last_source_monotone() {
        let mut v = Validity::default();
        let mut m = msg(1000);
        accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000);
        let before = v.last_source;

        // a worse source taking over after staleness does not demote
        // last_source below what accept_data assigns
        let mut m2 = msg(1000 + TRACK_STALE + 40_000);
        accept_data(&mut v, Source::ModeS, &mut m2, ReduceRate::Often, 1000);
        assert!(v.last_source <= before || v.last_source == Source::ModeS);
    }

    #[test]
    fn test_validity_expiry() {
        let mut v = Validity::default();
        let mut m = msg(1000);
        accept_data(&mut v, Source::Adsb, &mut m, ReduceRate::Often, 1000);

        v.update(1000 + TRACK_STALE + 1, TRACK_EXPIRE);
        assert!(v.stale);
        assert!(v.valid());

        v.update(1000 + TRACK_EXPIRE + 1, TRACK_EXPIRE);
        assert!(!v.valid());
    }

    #[test]
    fn test_combine_validity() {
        let a = Validity {
            source: Source::Adsb,
            last_source: Source::Adsb,
            updated: 1000,
            stale: false,
            next_reduce_forward: 0,
        };
        let b = Validity {
            source: Source::ModeS,
            last_source: Source::ModeS,
            updated: 2000,
            stale: false,
            next_reduce_forward: 0,
        };
        let c = combine_validity(&a, &b, 2500);
        assert_eq!(c.source, Source::ModeS);
        assert_eq!(c.updated, 2000);

        let invalid = Validity::default();
        assert_eq!(combine_validity(&a, &invalid, 2500).source, Source::Adsb);
    }

    #[test]
    fn test_signal_ring() {
        let mut a = Aircraft::new(0x4b1803, 1000);
        for _ in 0..4 {
            a.record_signal(0.25);
        }
        assert!(a.rssi() > -20.0);

        // ten silent messages clear the ring
        for _ in 0..10 {
            a.record_signal(0.0);
        }
        assert_eq!(a.signal_level, [0.0; SIGNAL_RING]);
        assert_eq!(a.rssi(), -50.0);
    }

    #[test]
    fn test_state_all_roundtrip() {
        let now = 1_700_000_000_000;
        let mut a = Aircraft::new(0x4b1803, now);
        a.callsign = "SWR123X ".into();
        a.callsign_valid.source = Source::Adsb;
        a.callsign_valid.updated = now;
        a.altitude_baro = 36_000;
        a.altitude_baro_valid.source = Source::Adsb;
        a.altitude_baro_valid.updated = now;
        a.altitude_geom = 36_500;
        a.gs = 447.5;
        a.gs_valid.source = Source::Adsb;
        a.gs_valid.updated = now;
        a.track = 123.45;
        a.track_valid.source = Source::Adsb;
        a.track_valid.updated = now;
        a.baro_rate = -1600;
        a.squawk = 0x1000;
        a.mach = 0.82;
        a.wind_speed = 45.0;
        a.wind_direction = 270.0;
        a.wind_updated = now;
        a.wind_altitude = 36_000;
        a.airground = AirGround::Airborne;
        a.adsb_version = 2;
        a.nic_baro = true;
        a.position_valid.source = Source::Adsb;
        a.position_valid.updated = now;

        let s = to_state_all(&a, now);
        let mut b = Aircraft::new(0x4b1803, now);
        from_state_all(&s, &mut b, now);

        assert_eq!(b.callsign, "SWR123X ");
        assert_eq!(b.altitude_baro, 36_000);
        // altitude_geom quantized to 25 ft
        assert!((b.altitude_geom - 36_500).abs() <= 12);
        // gs quantized to 0.1 kt
        assert!((b.gs - 447.5).abs() < 0.05);
        // track quantized to 1/90 deg
        assert!((b.track - 123.45).abs() < 0.012);
        assert_eq!(b.baro_rate, -1600);
        assert_eq!(b.squawk, 0x1000);
        assert!((b.mach - 0.82).abs() < 0.0005);
        assert!((b.wind_speed - 45.0).abs() < 0.5);
        assert_eq!(b.adsb_version, 2);
        assert!(b.nic_baro);
        assert_eq!(b.airground, AirGround::Airborne);
        assert!(b.callsign_valid.valid());
        assert!(b.position_valid.valid());
        assert_eq!(b.position_valid.source, Source::Indirect);
        assert!(!b.ias_valid.valid());
    }

    #[test]
    fn test_state_all_is_pod_sized() {
        // the on-disk record must stay tightly packed
        assert_eq!(std::mem::size_of::<StateAll>() % 8, 0);
        assert!(std::mem::size_of::<StateAll>() <= 96);
    }

    #[test]
    fn test_pos_reliable_threshold() {
        let mut a = Aircraft::new(0x4b1803, 0);
        a.position_valid.source = Source::Adsb;
        assert!(!a.pos_reliable(1));
        a.pos_reliable_odd = 1;
        a.pos_reliable_even = 1;
        assert!(a.pos_reliable(1));
        assert!(!a.pos_reliable(3));
        // threshold below one still needs one
        a.pos_reliable_odd = 0;
        assert!(!a.pos_reliable(0));
    }
}
