//! Loopback port reservation.
//!
//! Ports are obtained from the OS by binding `127.0.0.1:0` and released
//! immediately so the plugin can bind them. The ledger remembers every port
//! handed to a live plugin and refuses to hand it out again until the lease
//! is dropped.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::PluginError;

/// Reservation attempts before giving up.
pub const DEFAULT_PORT_ATTEMPTS: u32 = 16;

const PORTS_TARGET: &str = "spindle_plugins::supervisor::ports";

/// Set of ports currently leased to live plugins.
#[derive(Debug, Clone)]
pub struct PortLedger {
    held: Arc<Mutex<HashSet<u16>>>,
    attempts: u32,
}

impl Default for PortLedger {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_ATTEMPTS)
    }
}

impl PortLedger {
    /// Creates an empty ledger that tries `attempts` times per reservation.
    #[must_use]
    pub fn new(attempts: u32) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            attempts: attempts.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves an OS-assigned loopback port not held by any live lease.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PortsExhausted`] when every attempt failed or
    /// produced a port that is already leased.
    pub fn reserve(&self) -> Result<PortLease, PluginError> {
        self.reserve_with(ephemeral_port)
    }

    pub(crate) fn reserve_with<F>(&self, mut next: F) -> Result<PortLease, PluginError>
    where
        F: FnMut() -> io::Result<u16>,
    {
        let mut held = self.lock();
        for attempt in 1..=self.attempts {
            match next() {
                Ok(port) if held.insert(port) => {
                    return Ok(PortLease {
                        port,
                        held: Arc::clone(&self.held),
                    });
                }
                Ok(port) => {
                    debug!(target: PORTS_TARGET, port, attempt, "port already leased");
                }
                Err(error) => {
                    debug!(target: PORTS_TARGET, attempt, %error, "port reservation failed");
                }
            }
        }
        Err(PluginError::PortsExhausted {
            attempts: self.attempts,
        })
    }

    /// Returns `true` when `port` is leased.
    #[must_use]
    pub fn is_held(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of leased ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no port is leased.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn ephemeral_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// A port held for one plugin. Dropping the lease returns the port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    held: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    /// The leased port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}
