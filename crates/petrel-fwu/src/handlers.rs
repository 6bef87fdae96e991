//! Host-side callbacks of the firmware update process.

use chrono::{DateTime, Utc};

use petrel_domain::Iid;

use crate::transport::SecurityConfig;
use crate::types::HostError;

/// Per-component host integration: package storage, verification, and the
/// actual installation. One implementation per firmware instance.
///
/// The stream callbacks are allowed to block; the library invokes them
/// without holding any internal borrow, so a callback may call back into the
/// public API.
pub trait FwHandlers {
    /// Opens the package store for an incoming transfer.
    fn stream_open(&mut self, iid: Iid) -> Result<(), HostError>;

    fn stream_write(&mut self, iid: Iid, data: &[u8]) -> Result<(), HostError>;

    /// Finalizes and verifies a completely received package.
    fn stream_finish(&mut self, iid: Iid) -> Result<(), HostError>;

    /// Discards any partially stored package.
    fn reset(&mut self, iid: Iid);

    /// Name of the downloaded package, once one is stored.
    fn get_pkg_name(&self, _iid: Iid) -> Option<String> {
        None
    }

    /// Version of the downloaded package, once one is stored.
    fn get_pkg_version(&self, _iid: Iid) -> Option<String> {
        None
    }

    /// Version of the currently running firmware.
    fn get_current_version(&self, _iid: Iid) -> Option<String> {
        None
    }

    /// Installs the downloaded package. `supplemental_iids` lists the peer
    /// instances named in the Update execute arguments, sorted and without
    /// duplicates.
    fn perform_upgrade(&mut self, iid: Iid, supplemental_iids: &[Iid]) -> Result<(), HostError>;

    /// Security material for an encrypted download URI. When `None`, the
    /// library falls back to matching the URI against the Security object.
    fn get_security_config(&self, _iid: Iid, _uri: &str) -> Option<SecurityConfig> {
        None
    }
}

/// Source of wall-clock time, injectable for tests.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The default [`Clock`], backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
