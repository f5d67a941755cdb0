// Outbound connectors: for each configured (host, port, protocol) a task
// resolves, connects with a deadline, runs the connection, and backs off
// before the next attempt. DNS answers are walked ~100 ms apart.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::app::App;
use crate::net::{beast, client, ServiceKind};

/// What to do right after an outbound connection is established. The
/// aggregator-specific behavior of the original is expressed as an
/// explicit per-connector hook instead of hostname matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorHook {
    None,
    /// Send `0x1A 0xE4 <uuid>` read from the configured uuid file.
    SendUuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub host: String,
    pub port: u16,
    pub service: ServiceKind,
    pub hook: ConnectorHook,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorParseError(pub String);

impl std::fmt::Display for ConnectorParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad connector spec: {}", self.0)
    }
}

impl std::error::Error for ConnectorParseError {}

impl Connector {
    /// Parse `host,port,protocol[,uuid]`.
    pub fn parse(spec: &str) -> Result<Connector, ConnectorParseError> {
        let parts: Vec<&str> = spec.split(',').map(|s| s.trim()).collect();
        if parts.len() < 3 {
            return Err(ConnectorParseError(spec.into()));
        }
        let host = parts[0].to_string();
        let port: u16 = parts[1].parse().map_err(|_| ConnectorParseError(spec.into()))?;
        let service = match parts[2] {
            "beast_in" => ServiceKind::BeastIn,
            "beast_out" => ServiceKind::BeastOut,
            "beast_reduce_out" => ServiceKind::BeastReduceOut,
            "raw_in" => ServiceKind::RawIn,
            "raw_out" => ServiceKind::RawOut,
            "sbs_in" => ServiceKind::SbsIn,
            "sbs_in_mlat" => ServiceKind::SbsInMlat,
            "sbs_in_jaero" => ServiceKind::SbsInJaero,
            "sbs_in_prio" => ServiceKind::SbsInPrio,
            "sbs_out" => ServiceKind::SbsOut,
            _ => return Err(ConnectorParseError(spec.into())),
        };
        let hook = match parts.get(3) {
            Some(&"uuid") => ConnectorHook::SendUuid,
            Some(other) => return Err(ConnectorParseError(format!("{} ({})", spec, other))),
            None => ConnectorHook::None,
        };
        if host.is_empty() {
            return Err(ConnectorParseError(spec.into()));
        }
        Ok(Connector { host, port, service, hook })
    }
}

async fn run_hook(app: &App, con: &Connector, stream: &mut TcpStream) -> io::Result<()> {
    match con.hook {
        ConnectorHook::None => Ok(()),
        ConnectorHook::SendUuid => {
            let uuid = match std::fs::read_to_string(&app.config.uuid_file) {
                Ok(s) => s.trim().to_string(),
                Err(e) => {
                    warn!(file = %app.config.uuid_file, error = %e,
                        "uuid file unreadable, not sending an id");
                    return Ok(());
                }
            };
            if uuid.len() < 16 || uuid.len() > 128 {
                warn!(file = %app.config.uuid_file, "not a usable uuid, not sending an id");
                return Ok(());
            }
            let mut out = vec![beast::ESCAPE, beast::TYPE_UUID];
            out.extend_from_slice(uuid.as_bytes());
            stream.write_all(&out).await
        }
    }
}

/// Maintain one outbound connection forever (until shutdown).
pub async fn run_connector(app: Arc<App>, con: Connector) {
    let delay = Duration::from_secs(app.config.net_connector_delay.max(1));
    let connect_deadline = delay / 2;

    loop {
        if app.exiting() {
            return;
        }

        // resolve asynchronously; a failure just backs off
        let addrs = match lookup_host((con.host.as_str(), con.port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                warn!(host = %con.host, port = con.port, error = %e, "name resolution failed");
                sleep(delay).await;
                continue;
            }
        };

        let mut connected = None;
        for (i, addr) in addrs.iter().enumerate() {
            if i > 0 {
                // try the next answer shortly after the previous one
                sleep(Duration::from_millis(100)).await;
            }
            match timeout(connect_deadline.max(Duration::from_secs(1)), TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => {
                    connected = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    warn!(service = con.service.descr(), addr = %addr, error = %e,
                        "connection failed");
                }
                Err(_) => {
                    warn!(service = con.service.descr(), addr = %addr, "connection timed out");
                }
            }
        }

        if let Some(mut stream) = connected {
            let _ = stream.set_nodelay(true);
            info!(service = con.service.descr(), host = %con.host, port = con.port,
                "connection established");

            if let Err(e) = run_hook(&app, &con, &mut stream).await {
                warn!(host = %con.host, error = %e, "connector hook failed");
            } else {
                let res = if con.service.is_input() {
                    client::run_input_client(
                        Arc::clone(&app),
                        con.service,
                        stream,
                        con.host.clone(),
                        con.port,
                        true,
                    )
                    .await
                } else {
                    client::run_output_client(
                        Arc::clone(&app),
                        con.service,
                        stream,
                        con.host.clone(),
                        con.port,
                    )
                    .await
                };
                match res {
                    Ok(()) => info!(service = con.service.descr(), host = %con.host,
                        port = con.port, "disconnected, will reconnect"),
                    Err(e) => warn!(service = con.service.descr(), host = %con.host,
                        port = con.port, error = %e, "connection error, will reconnect"),
                }
            }
        }

        sleep(delay).await;
    }
}

/// Spawn every configured connector.
pub fn start_all(app: &Arc<App>) -> Result<usize, ConnectorParseError> {
    let mut count = 0;
    for spec in app.config.net_connector.clone() {
        let con = Connector::parse(&spec)?;
        let app = Arc::clone(app);
        tokio::spawn(run_connector(app, con));
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let c = Connector::parse("feed.example.net,30004,beast_out").unwrap();
        assert_eq!(c.host, "feed.example.net");
        assert_eq!(c.port, 30004);
        assert_eq!(c.service, ServiceKind::BeastOut);
        assert_eq!(c.hook, ConnectorHook::None);
    }

    #[test]
    fn test_parse_uuid_hook() {
        let c = Connector::parse("feed.example.net,30004,beast_reduce_out,uuid").unwrap();
        assert_eq!(c.hook, ConnectorHook::SendUuid);
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        assert!(Connector::parse("").is_err());
        assert!(Connector::parse("host,port").is_err());
        assert!(Connector::parse("host,abc,beast_out").is_err());
        assert!(Connector::parse("host,30004,warp_drive").is_err());
        assert!(Connector::parse("host,30004,beast_out,nonsense").is_err());
        assert!(Connector::parse(",30004,beast_out").is_err());
    }

    #[tokio::test]
    async fn test_connector_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut cfg = crate::config::Config::for_tests();
        cfg.net_connector_delay = 1;
        let app = Arc::new(App::new(cfg));

        let con = Connector {
            host: addr.ip().to_string(),
            port: addr.port(),
            service: ServiceKind::BeastIn,
            hook: ConnectorHook::None,
        };
        tokio::spawn(run_connector(Arc::clone(&app), con));

        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.is_ok(), "connector should reach the listener");
        app.request_exit();
    }
}
