use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::punch::PunchedPair;
use crate::socket::bind_udp;

// Forwarding stops once the remote has been silent this long.
const IDLE_GRACE: Duration = Duration::from_secs(600);
const MAX_DATAGRAM: usize = 65535;

/// Adapts a dynamically punched socket to a service that bound its own UDP
/// listener at process start. Traffic from the punched socket is relayed to
/// `127.0.0.1:service_port` from a second ephemeral socket; the service's
/// replies come back on that socket and are sent to the punched remote.
pub(crate) struct ServiceProxy {
    punched: UdpSocket,
    remote: SocketAddr,
    relay: UdpSocket,
    initial: BytesMut,
}

impl ServiceProxy {
    pub(crate) async fn new(pair: PunchedPair, service_port: u16) -> io::Result<ServiceProxy> {
        let (punched, remote, initial) = pair.into_parts();
        let relay = bind_udp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        relay
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, service_port)))
            .await?;
        Ok(Self {
            punched,
            remote,
            relay,
            initial,
        })
    }

    /// Forward until the punched socket errors or the remote goes silent.
    pub(crate) async fn run(self) {
        // The datagram that confirmed the punch is delivered before the first
        // read, so the service sees the stream from its very first packet.
        if !self.initial.is_empty() {
            if let Err(e) = self.relay.send(&self.initial).await {
                log::warn!("proxy initial forward {e:?}");
            }
        }
        let mut inbound = vec![0u8; MAX_DATAGRAM];
        let mut outbound = vec![0u8; MAX_DATAGRAM];
        let mut last_remote_rx = Instant::now();
        loop {
            let idle = tokio::time::sleep_until(last_remote_rx + IDLE_GRACE);
            tokio::select! {
                () = idle => {
                    log::debug!("remote {} went silent, proxy done", self.remote);
                    return;
                }
                rs = self.punched.recv(&mut inbound) => match rs {
                    Ok(len) => {
                        last_remote_rx = Instant::now();
                        if let Err(e) = self.relay.send(&inbound[..len]).await {
                            log::debug!("proxy forward to service {e:?}");
                        }
                    }
                    Err(e) => {
                        log::warn!("proxy recv {},{e:?}", self.remote);
                        return;
                    }
                },
                rs = self.relay.recv(&mut outbound) => match rs {
                    Ok(len) => {
                        if let Err(e) = self.punched.send(&outbound[..len]).await {
                            log::debug!("proxy forward to {},{e:?}", self.remote);
                        }
                    }
                    // The service may not be reading yet; only the punched
                    // socket decides the proxy's fate.
                    Err(e) => log::debug!("proxy relay recv {e:?}"),
                },
            }
        }
    }
}
