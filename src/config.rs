use clap::Parser;

/// ADS-B hub configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Bind address for all listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub net_bind_address: String,

    /// Comma separated TCP ports for Beast binary input
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_bi_ports: String,

    /// Comma separated TCP ports for Beast binary output
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_bo_ports: String,

    /// Comma separated TCP ports for reduced-rate Beast output
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_beast_reduce_ports: String,

    /// Position update interval for the reduced-rate Beast output (ms)
    #[arg(long, default_value_t = 1000)]
    pub net_beast_reduce_interval: u64,

    /// Comma separated TCP ports for raw AVR input
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_ri_ports: String,

    /// Comma separated TCP ports for raw AVR output
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_ro_ports: String,

    /// Comma separated TCP ports for SBS Basestation output
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_sbs_ports: String,

    /// Comma separated TCP ports for SBS Basestation input
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_sbs_in_ports: String,

    /// SBS input ports carrying MLAT results
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_sbs_in_mlat_ports: String,

    /// SBS input ports carrying JAERO satellite ADS-C
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_sbs_in_jaero_ports: String,

    /// SBS input ports carrying priority input
    #[arg(long, value_name = "PORTS", default_value = "")]
    pub net_sbs_in_prio_ports: String,

    /// Outbound connector: host,port,protocol[,uuid]
    /// Protocols: beast_in, beast_out, beast_reduce_out, raw_in, raw_out,
    /// sbs_in, sbs_in_mlat, sbs_in_jaero, sbs_in_prio, sbs_out
    #[arg(long, value_name = "SPEC")]
    pub net_connector: Vec<String>,

    /// Delay between outbound connection attempts (seconds)
    #[arg(long, default_value_t = 5)]
    pub net_connector_delay: u64,

    /// TCP heartbeat interval (seconds), 0 disables
    #[arg(long, default_value_t = 60)]
    pub net_heartbeat: u64,

    /// Minimum output buffer fill before a flush (bytes)
    #[arg(long, default_value_t = 15 * 1024)]
    pub net_flush_size: usize,

    /// Maximum interval between output flushes (ms)
    #[arg(long, default_value_t = 200)]
    pub net_flush_interval: u64,

    /// Forward received mlat results to beast output ports
    #[arg(long, default_value_t = false)]
    pub forward_mlat: bool,

    /// Send a receiver id record on beast output when it changes
    #[arg(long, default_value_t = false)]
    pub net_receiver_id: bool,

    /// Ingest server mode: no receiver-id parsing from upstream, forward all CPRs
    #[arg(long, default_value_t = false)]
    pub net_ingest: bool,

    /// Enable decoding of SSR Modes A & C
    #[arg(long, default_value_t = false)]
    pub mode_ac: bool,

    /// Receiver latitude
    #[arg(long)]
    pub lat: Option<f64>,

    /// Receiver longitude
    #[arg(long)]
    pub lon: Option<f64>,

    /// Absolute maximum range in nautical miles, 0 disables the range gate
    #[arg(long, default_value_t = 300.0)]
    pub max_range: f64,

    /// Directory for JSON snapshots, disabled when unset
    #[arg(long, value_name = "DIR")]
    pub json_dir: Option<String>,

    /// Interval between aircraft.json rewrites (ms)
    #[arg(long, default_value_t = 1000)]
    pub json_interval: u64,

    /// Accuracy of receiver location in receiver.json: 0=none, 1=approx, 2=exact
    #[arg(long, default_value_t = 1)]
    pub json_location_accuracy: u8,

    /// Positions from global CPR needed before a position is trusted
    /// (-1 disables the speed check entirely)
    #[arg(long, default_value_t = 1)]
    pub json_reliable: i32,

    /// Cap for the position reliability counters
    #[arg(long, default_value_t = 4)]
    pub filter_persistence: i32,

    /// Enable globe tile snapshot output
    #[arg(long, default_value_t = false)]
    pub json_globe_index: bool,

    /// Write binary per-tile snapshots instead of / in addition to JSON
    /// (0 = off, 1 = globe tiles, 2 = also aircraft.json)
    #[arg(long, default_value_t = 0)]
    pub json_bin_craft: u8,

    /// Max time ignoring new positions for the trace (seconds)
    #[arg(long, default_value_t = 15)]
    pub json_trace_interval: u64,

    /// How long traces are kept in memory (hours)
    #[arg(long, default_value_t = 24)]
    pub keep_traces: u64,

    /// Directory for permanent history (traces per day, internal state)
    #[arg(long, value_name = "DIR")]
    pub globe_history_dir: Option<String>,

    /// Directory for aircraft state persistence across restarts
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<String>,

    /// Directory for heatmap output, disabled when unset
    #[arg(long, value_name = "DIR")]
    pub heatmap_dir: Option<String>,

    /// Heatmap sample interval (seconds), 0 disables
    #[arg(long, default_value_t = 30)]
    pub heatmap: u64,

    /// Interval between stats.json rewrites (seconds)
    #[arg(long, default_value_t = 30)]
    pub stats_every: u64,

    /// Also collect a receiver range histogram
    #[arg(long, default_value_t = false)]
    pub stats_range: bool,

    /// Path for a Prometheus text exposition file
    #[arg(long, value_name = "FILE")]
    pub prom_file: Option<String>,

    /// File containing this receiver's UUID, sent to connectors marked uuid
    #[arg(long, value_name = "FILE", default_value = "/usr/local/share/adsb-hub/uuid")]
    pub uuid_file: String,

    /// Expire JAERO-sourced tracks after this many minutes
    #[arg(long, default_value_t = 33)]
    pub jaero_timeout: u64,

    /// Log CPR decoding details
    #[arg(long, default_value_t = false)]
    pub debug_cpr: bool,

    /// Log speed check failures
    #[arg(long, default_value_t = false)]
    pub debug_speed_check: bool,

    /// Log discarded garbage input
    #[arg(long, default_value_t = false)]
    pub debug_garbage: bool,

    /// Log network connects/disconnects in detail
    #[arg(long, default_value_t = false)]
    pub debug_net: bool,

    /// Only trace position handling for this hex address
    #[arg(long, value_name = "HEX")]
    pub cpr_focus: Option<String>,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Defaults suitable for tests: everything off, no directories.
    pub fn for_tests() -> Self {
        Config::parse_from(["adsb-hub"])
    }

    /// Max range in meters, 0.0 when the gate is disabled.
    pub fn max_range_m(&self) -> f64 {
        self.max_range * 1852.0
    }

    pub fn cpr_focus_addr(&self) -> Option<u32> {
        self.cpr_focus
            .as_deref()
            .and_then(|s| u32::from_str_radix(s.trim_start_matches('~'), 16).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::for_tests();
        assert_eq!(c.json_reliable, 1);
        assert_eq!(c.filter_persistence, 4);
        assert_eq!(c.net_beast_reduce_interval, 1000);
        assert!((c.max_range_m() - 300.0 * 1852.0).abs() < 1.0);
        assert!(c.json_dir.is_none());
    }

    #[test]
    fn test_connector_and_focus_parse() {
        let c = Config::parse_from([
            "adsb-hub",
            "--net-connector",
            "feed.example.net,30004,beast_out,uuid",
            "--cpr-focus",
            "4b1803",
        ]);
        assert_eq!(c.net_connector.len(), 1);
        assert_eq!(c.cpr_focus_addr(), Some(0x4b1803));
    }
}
