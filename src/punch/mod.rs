//! Parallel pair probing.
//!
//! Both sides of a punch advertise a list of candidate ports over signaling.
//! The prober launches one probe per candidate pair (`local_ports[i]` toward
//! `remote_ports[i]`), collects the first `required` winners in completion
//! order and cancels the rest, closing their sockets.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_shutdown::ShutdownManager;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::pinger::PingConfig;
use crate::punch::probe::{probe_pair, ProbeWin};

pub(crate) mod probe;

/// A confirmed punched path: an owned socket that has already seen traffic
/// from `remote` and is connected to it.
#[derive(Debug)]
pub struct PunchedPair {
    pub(crate) socket: UdpSocket,
    pub(crate) remote: SocketAddr,
    pub(crate) initial: BytesMut,
}

impl PunchedPair {
    /// The confirmed remote endpoint, as observed on the wire.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
    /// Take ownership of the punched socket, discarding the buffered first
    /// datagram.
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }
    pub(crate) fn into_parts(self) -> (UdpSocket, SocketAddr, BytesMut) {
        (self.socket, self.remote, self.initial)
    }
}

/// Probe all candidate pairs in parallel and return the first `required`
/// winners, ordered by completion time (input index breaks ties) and
/// deduplicated by local port.
///
/// Losing probes are aborted as soon as enough winners arrived. If every
/// probe terminates first, the partial set travels inside
/// [`Error::NotEnoughConnections`].
pub(crate) async fn punch_pairs(
    shutdown: &ShutdownManager<()>,
    config: PingConfig,
    remote_ip: Ipv4Addr,
    local_ports: &[u16],
    remote_ports: &[u16],
    required: usize,
) -> Result<Vec<PunchedPair>> {
    config.check()?;
    if required == 0 {
        return Err(Error::InvalidArgument("required cannot be 0".into()));
    }
    if shutdown.is_shutdown_triggered() {
        return Err(Error::Shutdown);
    }
    let mut set = JoinSet::new();
    for (index, (&local, &remote)) in local_ports.iter().zip(remote_ports.iter()).enumerate() {
        let remote = SocketAddr::from((remote_ip, remote));
        set.spawn(probe_pair(index, local, remote, config));
    }
    let collect = async move {
        let mut winners: Vec<ProbeWin> = Vec::with_capacity(required);
        let mut seen = HashSet::new();
        while winners.len() < required {
            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(win)) => {
                    if seen.insert(win.local_port) {
                        winners.push(win);
                    }
                }
                Ok(Err(e)) => log::debug!("probe lost: {e:?}"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => log::warn!("probe task {e:?}"),
            }
        }
        set.abort_all();
        winners.sort_by_key(|w| (w.at, w.index));
        winners.into_iter().map(|w| w.pair).collect::<Vec<_>>()
    };
    // Dropping the collect future on shutdown aborts every in-flight probe,
    // which closes the sockets they own.
    let Ok(pairs) = shutdown.wrap_cancel(collect).await else {
        return Err(Error::Shutdown);
    };
    if pairs.len() < required {
        return Err(Error::NotEnoughConnections(pairs));
    }
    Ok(pairs)
}
