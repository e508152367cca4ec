//! Ephemeral UDP port allocation.
//!
//! Candidate ports for punching have to be picked before any socket is bound,
//! because the port numbers travel to the peer over the signaling channel
//! first. The pool reserves numbers process-wide so that two engines preparing
//! port lists at the same time can never advertise the same port.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::error::{Error, Result};

// Reservations are process-wide: independent pool instances draw from the
// same accounting.
static RESERVED: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

const POOL_START: u16 = 30000;
const POOL_END: u16 = 60000;

pub struct PortPool {
    // Scan order, shuffled once at construction.
    ports: Vec<u16>,
}

impl PortPool {
    /// Pool over the default ephemeral range.
    pub fn new() -> PortPool {
        Self::with_range(POOL_START, POOL_END)
    }

    /// Pool over `start..end`.
    pub fn with_range(start: u16, end: u16) -> PortPool {
        let mut ports: Vec<u16> = (start..end).collect();
        ports.shuffle(&mut rand::rng());
        Self { ports }
    }

    /// Reserve one free port.
    pub fn acquire(&self) -> Result<PortHandle> {
        for &port in &self.ports {
            if !RESERVED.lock().insert(port) {
                continue;
            }
            if !port_is_free(port) {
                RESERVED.lock().remove(&port);
                continue;
            }
            return Ok(PortHandle { port });
        }
        Err(Error::PortExhausted)
    }

    /// Reserve `n` distinct ports, in acquisition order.
    ///
    /// On failure every port reserved so far is released again.
    pub fn acquire_multiple(&self, n: usize) -> Result<Vec<PortHandle>> {
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            handles.push(self.acquire()?);
        }
        Ok(handles)
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved port number. The reservation is released on drop.
#[derive(Debug)]
pub struct PortHandle {
    port: u16,
}

impl PortHandle {
    pub fn num(&self) -> u16 {
        self.port
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        RESERVED.lock().remove(&self.port);
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
}
