use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::pinger::PingConfig;
use crate::punch::PunchedPair;
use crate::socket::bind_udp;

const RECV_BUF_SIZE: usize = 1500;

pub(crate) struct ProbeWin {
    pub(crate) index: usize,
    pub(crate) local_port: u16,
    pub(crate) at: Instant,
    pub(crate) pair: PunchedPair,
}

/// Drive one candidate pair: send from `local_port` toward `remote` at the
/// configured cadence until the peer's traffic arrives or the deadline
/// passes.
///
/// Any non-empty datagram whose source IP matches `remote` counts as the
/// punch confirmation; the source port may differ because NATs remap. The
/// socket is then connected to the observed sender so later traffic is
/// filtered to the confirmed endpoint.
pub(crate) async fn probe_pair(
    index: usize,
    local_port: u16,
    remote: SocketAddr,
    config: PingConfig,
) -> Result<ProbeWin> {
    let bind_addr: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, local_port).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, local_port).into()
    };
    let socket = bind_udp(bind_addr)?;
    let payload = format!("continuously pinging to {remote}");
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(config.interval);
    let mut buf = [0u8; RECV_BUF_SIZE];
    let (len, src) = loop {
        tokio::select! {
            () = &mut deadline => return Err(Error::NatPunchAttemptTimedOut),
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(payload.as_bytes(), remote).await {
                    log::debug!("probe send {remote},{e:?}");
                    return Err(Error::Io(e));
                }
            }
            rs = socket.recv_from(&mut buf) => {
                let (len, src) = rs?;
                if len == 0 || src.ip() != remote.ip() {
                    log::debug!("probe {local_port} ignoring datagram from {src}");
                    continue;
                }
                break (len, src);
            }
        }
    };
    // Answer once more so the peer's probe completes even if it only joined
    // after our last tick.
    let _ = socket.send_to(payload.as_bytes(), src).await;
    socket.connect(src).await?;
    let pair = PunchedPair {
        socket,
        remote: src,
        initial: BytesMut::from(&buf[..len]),
    };
    Ok(ProbeWin {
        index,
        local_port,
        at: Instant::now(),
        pair,
    })
}
