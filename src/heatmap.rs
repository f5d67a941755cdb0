// Heatmap sampling: periodic fixed-size records of every aircraft with a
// fresh reliable position, appended to hourly files in heatmap_dir.

use std::io;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::app::App;
use crate::clock::SECONDS;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct HeatEntry {
    /// milliseconds
    pub timestamp: u64,
    pub addr: u32,
    /// 1e-6 degrees
    pub lat: i32,
    pub lon: i32,
    /// feet, i32::MIN when unknown
    pub alt: i32,
    /// 0.1 kt, -1 when unknown
    pub gs: i16,
    pub _pad: [u8; 6],
}

/// Collect one interval's worth of samples.
pub fn sample(app: &App, now: u64) -> Vec<HeatEntry> {
    let mut out = Vec::new();
    app.store.for_each(|_, slot| {
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        if !a.pos_reliable(app.config.json_reliable) {
            return;
        }
        if now > a.seen_pos + 30 * SECONDS {
            return;
        }
        out.push(HeatEntry {
            timestamp: now,
            addr: a.addr,
            lat: (a.lat * 1e6) as i32,
            lon: (a.lon * 1e6) as i32,
            alt: if a.altitude_baro_valid.valid() { a.altitude_baro } else { i32::MIN },
            gs: if a.gs_valid.valid() { (a.gs * 10.0).round() as i16 } else { -1 },
            _pad: [0; 6],
        });
    });
    out
}

/// Append samples to the hour's file under heatmap_dir.
pub fn append(dir: &Path, now: u64, entries: &[HeatEntry]) -> io::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    let hour = now / (3600 * 1000);
    let path = dir.join(format!("heatmap_{}.bin", hour));
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    io::Write::write_all(&mut file, bytemuck::cast_slice(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::Aircraft;
    use crate::app::App;
    use crate::modes::message::Source;

    #[test]
    fn test_entry_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<HeatEntry>() % 8, 0);
    }

    #[test]
    fn test_sample_filters_unreliable() {
        let app = App::for_tests();
        let now = 1_700_000_000_000;

        let mut a = Aircraft::new(0x123456, now);
        a.lat = 48.0;
        a.lon = 8.0;
        a.seen_pos = now;
        a.position_valid.source = Source::Adsb;
        a.position_valid.updated = now;
        // not reliable yet
        app.store.insert(a.addr, a.clone());
        assert!(sample(&app, now).is_empty());

        a.pos_reliable_odd = 1;
        a.pos_reliable_even = 1;
        app.store.remove(a.addr);
        app.store.insert(a.addr, a);
        let entries = sample(&app, now);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].addr, 0x123456);
        assert_eq!(entries[0].lat, 48_000_000);
        assert_eq!(entries[0].gs, -1);
    }

    #[test]
    fn test_append_roundtrip() {
        let dir = std::env::temp_dir().join(format!("adsbhub-heat-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let now = 1_700_000_000_000;
        let entries = vec![HeatEntry {
            timestamp: now,
            addr: 0x4b1803,
            lat: 47_990_000,
            lon: 7_850_000,
            alt: 36_000,
            gs: 4470,
            _pad: [0; 6],
        }];
        append(&dir, now, &entries).unwrap();

        let hour = now / (3600 * 1000);
        let bytes = std::fs::read(dir.join(format!("heatmap_{}.bin", hour))).unwrap();
        let parsed: Vec<HeatEntry> = bytes
            .chunks(std::mem::size_of::<HeatEntry>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(parsed, entries);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
