//! Advanced Firmware Update: a multi-component firmware object whose
//! instances move through a download / verify / install state machine,
//! coordinated through a single process-wide download slot, a FIFO of
//! pending downloads, and deferred upgrade jobs.

pub mod handlers;
pub mod transport;
pub mod types;
pub mod update;

pub use handlers::{Clock, FwHandlers, SystemClock};
pub use transport::{
    transport_security_from_uri, DownloadHandle, DownloadRequest, DownloadStartError,
    DownloadStatus, Downloader, SecurityConfig, TransportSecurity,
};
pub use types::{
    state_change_allowed, HostError, InitialState, Severity, State, UpdateResult,
    OID_ADVANCED_FIRMWARE_UPDATE,
};
pub use update::FwUpdate;
