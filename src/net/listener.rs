// Listening sockets: one accept loop per service port, spawning a task
// per connection. A bind failure at startup is fatal.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::app::App;
use crate::net::{client, ServiceKind};

/// Parse a comma separated port list.
pub fn parse_ports(ports: &str) -> Vec<u16> {
    ports
        .split([',', ' '])
        .filter(|p| !p.is_empty() && *p != "0")
        .filter_map(|p| p.parse().ok())
        .collect()
}

/// Bind every configured port of a service and spawn its accept loops.
/// Returns an error (startup is aborted) when any bind fails.
pub async fn start_service(app: &Arc<App>, service: ServiceKind, ports: &str) -> io::Result<()> {
    for port in parse_ports(ports) {
        let addr = format!("{}:{}", app.config.net_bind_address, port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!(service = service.descr(), addr = %addr, error = %e, "listen failed");
            e
        })?;
        info!(service = service.descr(), addr = %addr, "listening");

        let app = Arc::clone(app);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let app = Arc::clone(&app);
                        tokio::spawn(async move {
                            let host = peer.ip().to_string();
                            let port = peer.port();
                            let res = if service.is_input() {
                                client::run_input_client(
                                    app,
                                    service,
                                    stream,
                                    host.clone(),
                                    port,
                                    false,
                                )
                                .await
                            } else {
                                client::run_output_client(app, service, stream, host.clone(), port)
                                    .await
                            };
                            if let Err(e) = res {
                                info!(service = service.descr(), host = %host, port, error = %e,
                                    "connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(service = service.descr(), error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }
    Ok(())
}

/// Bring up every service with configured ports.
pub async fn start_all(app: &Arc<App>) -> io::Result<()> {
    let cfg = app.config.clone();
    start_service(app, ServiceKind::BeastIn, &cfg.net_bi_ports).await?;
    start_service(app, ServiceKind::BeastOut, &cfg.net_bo_ports).await?;
    start_service(app, ServiceKind::BeastReduceOut, &cfg.net_beast_reduce_ports).await?;
    start_service(app, ServiceKind::RawIn, &cfg.net_ri_ports).await?;
    start_service(app, ServiceKind::RawOut, &cfg.net_ro_ports).await?;
    start_service(app, ServiceKind::SbsIn, &cfg.net_sbs_in_ports).await?;
    start_service(app, ServiceKind::SbsInMlat, &cfg.net_sbs_in_mlat_ports).await?;
    start_service(app, ServiceKind::SbsInJaero, &cfg.net_sbs_in_jaero_ports).await?;
    start_service(app, ServiceKind::SbsInPrio, &cfg.net_sbs_in_prio_ports).await?;
    start_service(app, ServiceKind::SbsOut, &cfg.net_sbs_ports).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports(""), Vec::<u16>::new());
        assert_eq!(parse_ports("0"), Vec::<u16>::new());
        assert_eq!(parse_ports("30005"), vec![30005]);
        assert_eq!(parse_ports("30004,30005"), vec![30004, 30005]);
        assert_eq!(parse_ports("30004, 30005"), vec![30004, 30005]);
    }

    #[tokio::test]
    async fn test_reader_task_accepts_beast_frames() {
        let mut cfg = crate::config::Config::for_tests();
        cfg.net_bind_address = "127.0.0.1".into();
        let app = Arc::new(App::new(cfg));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app2 = Arc::clone(&app);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let _ = client::run_input_client(
                app2,
                ServiceKind::BeastIn,
                stream,
                peer.ip().to_string(),
                peer.port(),
                false,
            )
            .await;
        });

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        // valid DF17 identification frame via Beast framing
        let frame = [
            0x8du8, 0x48, 0x40, 0xd6, 0x20, 0x2c, 0xc3, 0x71, 0xc3, 0x2c, 0xe0, 0x57, 0x60, 0x98,
        ];
        let mut mm = crate::modes::message::Message::new(0);
        mm.set_raw(&frame);
        let encoded = crate::net::beast::encode(&mm, None);
        conn.write_all(&encoded).await.unwrap();
        conn.flush().await.unwrap();

        // give the reader task a moment
        for _ in 0..50 {
            if app.store.len() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(app.store.len(), 1);
        assert!(app.store.get(0x4840d6).is_some());
    }
}
