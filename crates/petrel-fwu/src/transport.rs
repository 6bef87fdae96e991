//! The transport-facing side of firmware download.
//!
//! The actual CoAP/HTTP machinery lives with the host; this module defines
//! the handle-based contract the firmware object drives it through, plus the
//! URI classification used to pick a security mode.

use petrel_domain::Iid;

/// Security category of a download transport, derived from the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    NoSec,
    Encrypted,
    Undefined,
}

/// Classifies a download URI by its scheme. Unknown schemes (or URIs with no
/// scheme at all) are `Undefined`, which makes the firmware object reject
/// the URI as an unsupported protocol.
pub fn transport_security_from_uri(uri: &str) -> TransportSecurity {
    let Some((scheme, _)) = uri.split_once("://") else {
        return TransportSecurity::Undefined;
    };
    match scheme.to_ascii_lowercase().as_str() {
        "coap" | "coap+tcp" | "http" => TransportSecurity::NoSec,
        "coaps" | "coaps+tcp" | "https" => TransportSecurity::Encrypted,
        _ => TransportSecurity::Undefined,
    }
}

/// The host part of a URI, without userinfo or port.
pub(crate) fn uri_host(uri: &str) -> Option<&str> {
    let (_, rest) = uri.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = authority.rsplit_once(':').map_or(authority, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            authority
        }
    });
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Security material resolved for an encrypted download: points the
/// transport at the Security object instance to take credentials from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityConfig {
    pub security_iid: Option<Iid>,
}

/// Identifies one transfer within the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadHandle(pub u64);

/// Everything the downloader needs to start a transfer. Data and completion
/// flow back through [`FwUpdate::on_download_block`](crate::FwUpdate::on_download_block)
/// and [`FwUpdate::on_download_finished`](crate::FwUpdate::on_download_finished).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub iid: Iid,
    pub url: String,
    pub security: Option<SecurityConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStartError {
    InvalidUri,
    OutOfMemory,
    UnsupportedProtocol,
    ConnectionLost,
}

/// How a download ended, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Finished,
    /// The server answered 4.04 / 404.
    NotFound,
    OutOfMemory,
    /// The transfer can no longer be resumed (e.g. the ETag changed).
    Expired,
    Aborted,
    Failed,
}

/// The pull-download transport implemented by the host.
pub trait Downloader {
    fn start(&mut self, request: &DownloadRequest) -> Result<DownloadHandle, DownloadStartError>;

    fn abort(&mut self, handle: DownloadHandle);

    /// Pauses the transfer without losing progress; `reconnect` resumes it.
    fn suspend(&mut self, handle: DownloadHandle);

    fn reconnect(&mut self, handle: DownloadHandle) -> Result<(), DownloadStartError>;
}
