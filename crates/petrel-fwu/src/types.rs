use chrono::{DateTime, Utc};

use petrel_domain::{Oid, Rid};

/// The Advanced Firmware Update object.
pub const OID_ADVANCED_FIRMWARE_UPDATE: Oid = Oid(33629);

pub const RID_PACKAGE: Rid = Rid(0);
pub const RID_PACKAGE_URI: Rid = Rid(1);
pub const RID_UPDATE: Rid = Rid(2);
pub const RID_STATE: Rid = Rid(3);
pub const RID_UPDATE_RESULT: Rid = Rid(5);
pub const RID_PKG_NAME: Rid = Rid(6);
pub const RID_PKG_VERSION: Rid = Rid(7);
pub const RID_UPDATE_PROTOCOL_SUPPORT: Rid = Rid(8);
pub const RID_UPDATE_DELIVERY_METHOD: Rid = Rid(9);
pub const RID_CANCEL: Rid = Rid(10);
pub const RID_SEVERITY: Rid = Rid(11);
pub const RID_LAST_STATE_CHANGE_TIME: Rid = Rid(12);
pub const RID_MAX_DEFER_PERIOD: Rid = Rid(13);
pub const RID_COMPONENT_NAME: Rid = Rid(14);
pub const RID_CURRENT_VERSION: Rid = Rid(15);
pub const RID_LINKED_INSTANCES: Rid = Rid(16);
pub const RID_CONFLICTING_INSTANCES: Rid = Rid(17);

/// The server-visible State resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle = 0,
    Downloading = 1,
    Downloaded = 2,
    Updating = 3,
}

/// The server-visible Update Result resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Initial = 0,
    Success = 1,
    NotEnoughSpace = 2,
    OutOfMemory = 3,
    ConnectionLost = 4,
    IntegrityFailure = 5,
    UnsupportedPackageType = 6,
    InvalidUri = 7,
    Failed = 8,
    UnsupportedProtocol = 9,
    UpdateCancelled = 10,
    Deferred = 11,
    ConflictingState = 12,
    DependencyError = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical = 0,
    Mandatory = 1,
    Optional = 2,
}

impl Severity {
    pub fn from_i64(raw: i64) -> Option<Severity> {
        match raw {
            0 => Some(Severity::Critical),
            1 => Some(Severity::Mandatory),
            2 => Some(Severity::Optional),
            _ => None,
        }
    }
}

/// The allowed `(state, result)` transition table. Anything not listed here
/// is rejected without touching the instance.
pub fn state_change_allowed(current: State, new_state: State, new_result: UpdateResult) -> bool {
    use State::*;
    use UpdateResult::*;
    match current {
        Idle => match (new_state, new_result) {
            (Downloading, Initial) => true,
            (Downloaded, Initial | Deferred) => true,
            _ => false,
        },
        Downloading => match (new_state, new_result) {
            (Idle, result) => result != Success && result != Deferred,
            (Downloaded, Initial | Deferred) => true,
            _ => false,
        },
        Downloaded => match (new_state, new_result) {
            (Idle, Initial | UpdateCancelled) => true,
            (Downloaded, Deferred) => true,
            (Updating, Initial) => true,
            _ => false,
        },
        Updating => match (new_state, new_result) {
            (Idle, result) => {
                result != UpdateCancelled && result != Deferred && result != ConflictingState
            }
            (Downloaded, Failed | Deferred | DependencyError) => true,
            _ => false,
        },
    }
}

/// An error reported by a host callback: either one of the result codes the
/// host is allowed to force, or an unspecified failure mapped to a per-site
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    Specific(UpdateResult),
    Generic,
}

impl HostError {
    /// The subset of results a host callback may force through its return
    /// value; anything else falls back to `default`.
    pub(crate) fn into_result(self, default: UpdateResult) -> UpdateResult {
        use UpdateResult::*;
        match self {
            HostError::Specific(result)
                if matches!(
                    result,
                    NotEnoughSpace
                        | OutOfMemory
                        | IntegrityFailure
                        | UnsupportedPackageType
                        | Deferred
                        | ConflictingState
                        | DependencyError
                ) =>
            {
                result
            }
            _ => default,
        }
    }
}

/// State carried over from before a reboot, passed to
/// [`FwUpdate::instance_add`](crate::FwUpdate::instance_add).
#[derive(Debug, Clone, Default)]
pub struct InitialState {
    pub state: Option<State>,
    pub result: Option<UpdateResult>,
    pub package_uri: Option<String>,
    pub severity: Option<Severity>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub update_deadline: Option<DateTime<Utc>>,
}
