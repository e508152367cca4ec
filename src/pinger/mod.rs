//! The punching engines.
//!
//! A [`Pinger`] drives hole punching from one side of a session. The two
//! asymmetric entry points compose the same pair prober and differ only in
//! what happens to the winning socket: [`Pinger::ping_consumer`] staples it to
//! a locally registered service through the proxy, [`Pinger::ping_provider`]
//! returns it to the caller. [`Pinger::ping_peer`] is the symmetric variant
//! for transports that want several punched paths at once.
//!
//! In every operation the first port list is the caller's own (the probes
//! bind it) and the second is the peer's (the probes target it). Both sides
//! must start at roughly the same time with complementary lists.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use dashmap::DashMap;
use serde_json::json;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::event::{
    EventPublisher, TOPIC_TRAVERSAL_FAILED, TOPIC_TRAVERSAL_STARTED, TOPIC_TRAVERSAL_SUCCEEDED,
};
use crate::proxy::ServiceProxy;
use crate::punch::{punch_pairs, PunchedPair};

pub use config::PingConfig;
pub mod config;

pub struct Pinger {
    config: PingConfig,
    service_bindings: DashMap<String, u16>,
    shutdown: ShutdownManager<()>,
    publisher: Arc<dyn EventPublisher>,
}

impl Pinger {
    pub fn new(config: PingConfig, publisher: Arc<dyn EventPublisher>) -> Pinger {
        Self {
            config,
            service_bindings: DashMap::new(),
            shutdown: ShutdownManager::new(),
            publisher,
        }
    }

    /// Associate `service_name` with the loopback port its UDP listener is
    /// bound on. Rebinding an existing name replaces the port.
    pub fn bind_service_port(&self, service_name: &str, port: u16) {
        self.service_bindings
            .insert(service_name.to_string(), port);
    }

    /// Punch toward a consumer and staple the winning socket to the service
    /// registered under `service_name`. The proxy keeps forwarding until the
    /// socket errors, the consumer goes silent or the pinger stops.
    ///
    /// `provider_ports` are bound locally, `consumer_ports` are the targets.
    pub async fn ping_consumer(
        &self,
        remote_ip: Ipv4Addr,
        provider_ports: &[u16],
        consumer_ports: &[u16],
        service_name: &str,
    ) -> Result<()> {
        let service_port = self
            .service_bindings
            .get(service_name)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::UnknownService(service_name.to_string()))?;
        self.publisher.publish(
            TOPIC_TRAVERSAL_STARTED,
            json!({
                "role": "consumer",
                "remote_ip": remote_ip.to_string(),
                "service": service_name,
            }),
        );
        let rs = punch_pairs(
            &self.shutdown,
            self.config,
            remote_ip,
            provider_ports,
            consumer_ports,
            1,
        )
        .await;
        let pair = match rs {
            Ok(pairs) => match pairs.into_iter().next() {
                Some(pair) => pair,
                None => return Err(Error::NatPunchAttemptTimedOut),
            },
            Err(e) => {
                self.publish_failed("consumer", remote_ip, &e);
                return Err(match e {
                    Error::NotEnoughConnections(_) | Error::Shutdown => {
                        Error::NatPunchAttemptTimedOut
                    }
                    other => other,
                });
            }
        };
        let remote = pair.remote();
        let proxy = ServiceProxy::new(pair, service_port).await?;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if shutdown.wrap_cancel(proxy.run()).await.is_err() {
                log::debug!("service proxy cancelled by shutdown");
            }
        });
        self.publisher.publish(
            TOPIC_TRAVERSAL_SUCCEEDED,
            json!({
                "role": "consumer",
                "remote": remote.to_string(),
                "service": service_name,
                "service_port": service_port,
            }),
        );
        Ok(())
    }

    /// Punch toward a provider and hand the winning socket back to the
    /// caller together with the confirmed remote endpoint.
    ///
    /// `consumer_ports` are bound locally, `provider_ports` are the targets.
    /// `proxy_port` is forwarded to the event sink only; zero means the
    /// session has no proxy association.
    pub async fn ping_provider(
        &self,
        remote_ip: Ipv4Addr,
        consumer_ports: &[u16],
        provider_ports: &[u16],
        proxy_port: u16,
    ) -> Result<(UdpSocket, SocketAddr)> {
        self.publisher.publish(
            TOPIC_TRAVERSAL_STARTED,
            json!({
                "role": "provider",
                "remote_ip": remote_ip.to_string(),
                "proxy_port": proxy_port,
            }),
        );
        let rs = punch_pairs(
            &self.shutdown,
            self.config,
            remote_ip,
            consumer_ports,
            provider_ports,
            1,
        )
        .await;
        match rs {
            Ok(pairs) => {
                let Some(pair) = pairs.into_iter().next() else {
                    return Err(Error::NatPunchAttemptTimedOut);
                };
                let remote = pair.remote();
                self.publisher.publish(
                    TOPIC_TRAVERSAL_SUCCEEDED,
                    json!({
                        "role": "provider",
                        "remote": remote.to_string(),
                        "proxy_port": proxy_port,
                    }),
                );
                Ok((pair.into_socket(), remote))
            }
            Err(e) => {
                self.publish_failed("provider", remote_ip, &e);
                Err(match e {
                    Error::NotEnoughConnections(_) => Error::NatPunchAttemptTimedOut,
                    other => other,
                })
            }
        }
    }

    /// Symmetric punch: both peers call this with complementary port lists
    /// and receive up to `required` independent punched pairs, ordered by
    /// completion. `interval_count` stretches the probe cadence.
    ///
    /// With fewer winners than `required` the partial set is carried inside
    /// [`Error::NotEnoughConnections`] so callers may proceed degraded.
    pub async fn ping_peer(
        &self,
        remote_ip: Ipv4Addr,
        local_ports: &[u16],
        remote_ports: &[u16],
        interval_count: u32,
        required: usize,
    ) -> Result<Vec<PunchedPair>> {
        self.publisher.publish(
            TOPIC_TRAVERSAL_STARTED,
            json!({
                "role": "peer",
                "remote_ip": remote_ip.to_string(),
                "required": required,
            }),
        );
        let config = self.config.with_interval_count(interval_count);
        let rs = punch_pairs(
            &self.shutdown,
            config,
            remote_ip,
            local_ports,
            remote_ports,
            required,
        )
        .await;
        match &rs {
            Ok(pairs) => self.publisher.publish(
                TOPIC_TRAVERSAL_SUCCEEDED,
                json!({
                    "role": "peer",
                    "remote_ip": remote_ip.to_string(),
                    "pairs": pairs.len(),
                }),
            ),
            Err(e) => self.publish_failed("peer", remote_ip, e),
        }
        rs
    }

    /// Cancel every outstanding probe and proxy and make blocked engine
    /// calls return promptly. Idempotent; new punches are rejected
    /// afterwards.
    pub fn stop(&self) {
        if self.shutdown.trigger_shutdown(()).is_ok() {
            log::debug!("nat pinger stopped");
        }
    }

    fn publish_failed(&self, role: &str, remote_ip: Ipv4Addr, e: &Error) {
        self.publisher.publish(
            TOPIC_TRAVERSAL_FAILED,
            json!({
                "role": role,
                "remote_ip": remote_ip.to_string(),
                "error": e.to_string(),
            }),
        );
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        _ = self.shutdown.trigger_shutdown(());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::testing::RecordingPublisher;
    use crate::event::NoopPublisher;
    use crate::port::PortPool;
    use crate::socket::bind_udp;

    fn new_pinger(interval: Duration, timeout: Duration) -> Arc<Pinger> {
        Arc::new(Pinger::new(
            PingConfig::new(interval, timeout),
            Arc::new(NoopPublisher),
        ))
    }

    #[test]
    fn multiple_stop() {
        let pinger = Pinger::new(
            PingConfig::new(Duration::from_millis(1), Duration::from_millis(10)),
            Arc::new(NoopPublisher),
        );
        pinger.stop();
        pinger.stop();
        pinger.stop();
    }

    #[tokio::test]
    async fn provider_consumer_ping_flow() {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider_proxy_port = 51199;
        let provider_port = 51200;
        let consumer_port = 51201;
        let interval = Duration::from_millis(10);
        let pinger = new_pinger(interval, Duration::from_millis(1000));

        // The provider's UDP service the proxy should hand traffic to. In the
        // real world this is a started VPN listener (WireGuard or OpenVPN).
        let service = bind_udp(SocketAddr::from((Ipv4Addr::LOCALHOST, provider_proxy_port)))
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((len, _)) = service.recv_from(&mut buf).await {
                if tx.send(String::from_utf8_lossy(&buf[..len]).into_owned()).is_err() {
                    break;
                }
            }
        });

        // Start pinging the consumer.
        let provider_side = pinger.clone();
        tokio::spawn(async move {
            provider_side.bind_service_port("wg1", provider_proxy_port);
            let _ = provider_side
                .ping_consumer(
                    Ipv4Addr::LOCALHOST,
                    &[provider_port],
                    &[consumer_port],
                    "wg1",
                )
                .await;
        });

        // Simulate real network delay before the consumer joins.
        tokio::time::sleep(5 * interval).await;

        let (socket, remote) = pinger
            .ping_provider(
                Ipv4Addr::LOCALHOST,
                &[consumer_port],
                &[provider_port],
                consumer_port + 1,
            )
            .await
            .unwrap();
        assert_eq!(remote.port(), provider_port);
        // Release the consumer port so a fresh client can take over the
        // punched path.
        drop(socket);

        let client = bind_udp(SocketAddr::from((Ipv4Addr::LOCALHOST, consumer_port))).unwrap();
        client
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, provider_port)))
            .await
            .unwrap();

        // Keep sending until the message makes it through the proxy; the
        // service may first see leftover punch datagrams.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "service never received the test message"
            );
            client.send(b"Test message").await.unwrap();
            match tokio::time::timeout(Duration::from_millis(10), rx.recv()).await {
                Ok(Some(msg)) if msg == "Test message" => break,
                _ => {}
            }
        }
        pinger.stop();
    }

    #[tokio::test]
    async fn ping_peer_n_connections() {
        let interval = Duration::from_millis(10);
        let timeout = Duration::from_millis(1000);
        let provider = new_pinger(interval, timeout);
        let consumer = new_pinger(interval, timeout);

        let pool = PortPool::new();
        let ports = pool.acquire_multiple(10).unwrap();
        let p_ports: Vec<u16> = ports[..5].iter().map(|p| p.num()).collect();
        let c_ports: Vec<u16> = ports[5..].iter().map(|p| p.num()).collect();

        let consumer_side = consumer.clone();
        let (cp, pp) = (c_ports.clone(), p_ports.clone());
        tokio::spawn(async move {
            let _ = consumer_side
                .ping_peer(Ipv4Addr::LOCALHOST, &cp, &pp, 2, 3)
                .await;
        });
        let pairs = provider
            .ping_peer(Ipv4Addr::LOCALHOST, &p_ports, &c_ports, 2, 3)
            .await
            .unwrap();

        assert_eq!(pairs.len(), 3);
        let mut locals: Vec<u16> = pairs
            .iter()
            .map(|pair| pair.local_addr().unwrap().port())
            .collect();
        locals.sort_unstable();
        locals.dedup();
        assert_eq!(locals.len(), 3);
        for local in locals {
            assert!(p_ports.contains(&local));
        }
    }

    #[tokio::test]
    async fn ping_peer_not_enough_connections() {
        let interval = Duration::from_millis(10);
        let timeout = Duration::from_millis(1000);
        let provider = new_pinger(interval, timeout);
        let consumer = new_pinger(interval, timeout);

        let pool = PortPool::new();
        let ports = pool.acquire_multiple(10).unwrap();
        let p_ports: Vec<u16> = ports[..5].iter().map(|p| p.num()).collect();
        let c_ports: Vec<u16> = ports[5..].iter().map(|p| p.num()).collect();

        let consumer_side = consumer.clone();
        let (cp, pp) = (c_ports.clone(), p_ports.clone());
        tokio::spawn(async move {
            let _ = consumer_side
                .ping_peer(Ipv4Addr::LOCALHOST, &cp, &pp, 2, 30)
                .await;
        });
        let rs = provider
            .ping_peer(Ipv4Addr::LOCALHOST, &p_ports, &c_ports, 2, 30)
            .await;

        match rs {
            Err(Error::NotEnoughConnections(pairs)) => assert_eq!(pairs.len(), 5),
            other => panic!("expected NotEnoughConnections, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_provider_timeout() {
        let pinger = new_pinger(Duration::from_millis(1), Duration::from_millis(5));
        let pool = PortPool::new();
        let ports = pool.acquire_multiple(2).unwrap();
        let (provider_port, consumer_port) = (ports[0].num(), ports[1].num());

        // Passive listener that never pings back.
        let _listener =
            bind_udp(SocketAddr::from((Ipv4Addr::LOCALHOST, provider_port))).unwrap();

        let rs = pinger
            .ping_provider(Ipv4Addr::LOCALHOST, &[consumer_port], &[provider_port], 0)
            .await;
        match rs {
            Err(Error::NatPunchAttemptTimedOut) => {}
            other => panic!("expected NatPunchAttemptTimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let pinger = new_pinger(Duration::from_millis(1), Duration::from_millis(10));
        let rs = pinger
            .ping_consumer(Ipv4Addr::LOCALHOST, &[51203], &[51204], "wg9")
            .await;
        match rs {
            Err(Error::UnknownService(name)) => assert_eq!(name, "wg9"),
            other => panic!("expected UnknownService, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_cancels_blocked_engines() {
        let pinger = new_pinger(Duration::from_millis(10), Duration::from_secs(30));
        let pool = PortPool::new();
        let ports = pool.acquire_multiple(2).unwrap();
        let (local, remote) = (ports[0].num(), ports[1].num());

        let engine = pinger.clone();
        let handle = tokio::spawn(async move {
            engine
                .ping_provider(Ipv4Addr::LOCALHOST, &[local], &[remote], 0)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pinger.stop();
        let rs = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine did not observe shutdown")
            .unwrap();
        assert!(matches!(rs, Err(Error::Shutdown)));

        // Launches after stop are rejected outright.
        let rs = pinger
            .ping_peer(Ipv4Addr::LOCALHOST, &[local], &[remote], 1, 1)
            .await;
        assert!(matches!(rs, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn ping_peer_publishes_lifecycle_events() {
        let publisher = Arc::new(RecordingPublisher::default());
        let a = Arc::new(Pinger::new(
            PingConfig::new(Duration::from_millis(5), Duration::from_millis(500)),
            publisher.clone(),
        ));
        let b = new_pinger(Duration::from_millis(5), Duration::from_millis(500));

        let pool = PortPool::new();
        let ports = pool.acquire_multiple(2).unwrap();
        let (pa, pb) = (ports[0].num(), ports[1].num());

        let other = b.clone();
        tokio::spawn(async move {
            let _ = other.ping_peer(Ipv4Addr::LOCALHOST, &[pb], &[pa], 1, 1).await;
        });
        a.ping_peer(Ipv4Addr::LOCALHOST, &[pa], &[pb], 1, 1)
            .await
            .unwrap();

        let topics = publisher.topics();
        assert_eq!(
            topics,
            vec![
                TOPIC_TRAVERSAL_STARTED.to_string(),
                TOPIC_TRAVERSAL_SUCCEEDED.to_string()
            ]
        );
    }
}
