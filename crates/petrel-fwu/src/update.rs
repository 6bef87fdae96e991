use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use petrel_domain::{
    DmError, Iid, Keyed, KeyedVec, Oid, Rid, Riid, Value, ID_INVALID, OID_SECURITY,
    RID_SECURITY_SERVER_URI,
};
use petrel_notify::NotifyQueue;
use petrel_registry::{
    parse_execute_args, ObjectHandler, Registry, ResourceDef, ResourceKind,
};

use crate::handlers::{Clock, FwHandlers};
use crate::transport::{
    transport_security_from_uri, uri_host, DownloadHandle, DownloadRequest, DownloadStartError,
    DownloadStatus, Downloader, SecurityConfig, TransportSecurity,
};
use crate::types::{
    state_change_allowed, HostError, InitialState, Severity, State, UpdateResult,
    OID_ADVANCED_FIRMWARE_UPDATE, RID_CANCEL, RID_COMPONENT_NAME, RID_CONFLICTING_INSTANCES,
    RID_CURRENT_VERSION, RID_LAST_STATE_CHANGE_TIME, RID_LINKED_INSTANCES, RID_MAX_DEFER_PERIOD,
    RID_PACKAGE, RID_PACKAGE_URI, RID_PKG_NAME, RID_PKG_VERSION, RID_SEVERITY, RID_STATE,
    RID_UPDATE, RID_UPDATE_DELIVERY_METHOD, RID_UPDATE_PROTOCOL_SUPPORT, RID_UPDATE_RESULT,
};

/// Update Protocol Support enumeration values: CoAP, CoAPS, HTTP, HTTPS,
/// CoAP over TCP, CoAP over TLS.
const SUPPORTED_PROTOCOLS: &[i64] = &[0, 1, 2, 3, 4, 5];

/// Deferred work executed by [`FwUpdate::run_scheduled_jobs`].
///
/// An Update execute queues `ScheduleUpgrade`; that job re-queues
/// `PerformUpgrade` for the *next* drain, so state-change notifications
/// reach observers before the host upgrade callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    ScheduleUpgrade(Iid),
    PerformUpgrade(Iid),
}

struct FwInstance {
    iid: Iid,
    component_name: Option<String>,
    handlers: Box<dyn FwHandlers>,
    /// Progress of the host callbacks, tracked separately from the
    /// server-visible state.
    user_state: State,
    state: State,
    result: UpdateResult,
    package_uri: Option<String>,
    retry_download_on_expired: bool,
    severity: Severity,
    last_state_change_time: Option<DateTime<Utc>>,
    max_defer_period: Option<i64>,
    update_deadline: Option<DateTime<Utc>>,
    linked_instances: Vec<Iid>,
    conflicting_instances: Vec<Iid>,
}

impl Keyed for FwInstance {
    type Key = Iid;

    fn key(&self) -> Iid {
        self.iid
    }
}

/// The Advanced Firmware Update object (OID 33629).
pub struct FwUpdate {
    instances: KeyedVec<FwInstance>,
    current_download: Option<(Iid, DownloadHandle)>,
    download_queue: VecDeque<DownloadRequest>,
    downloads_suspended: bool,
    supplemental_iids: Vec<Iid>,
    jobs: VecDeque<Job>,
    queue: Rc<RefCell<NotifyQueue>>,
    clock: Rc<dyn Clock>,
    downloader: Box<dyn Downloader>,
}

// ── Per-instance helpers ─────────────────────────────────────────────────────

fn set_result(queue: &RefCell<NotifyQueue>, inst: &mut FwInstance, new_result: UpdateResult) {
    if inst.result != new_result {
        debug!(
            iid = inst.iid.0,
            from = ?inst.result,
            to = ?new_result,
            "firmware result change"
        );
        inst.result = new_result;
        queue.borrow_mut().mark_resource_changed(
            OID_ADVANCED_FIRMWARE_UPDATE,
            inst.iid,
            RID_UPDATE_RESULT,
        );
    }
}

fn set_state(
    queue: &RefCell<NotifyQueue>,
    clock: &dyn Clock,
    inst: &mut FwInstance,
    new_state: State,
) {
    if inst.state != new_state {
        inst.last_state_change_time = Some(clock.now());
        debug!(
            iid = inst.iid.0,
            from = ?inst.state,
            to = ?new_state,
            "firmware state change"
        );
        inst.state = new_state;
        queue
            .borrow_mut()
            .mark_resource_changed(OID_ADVANCED_FIRMWARE_UPDATE, inst.iid, RID_STATE);
    }
}

fn apply_state_and_result(
    queue: &RefCell<NotifyQueue>,
    clock: &dyn Clock,
    inst: &mut FwInstance,
    new_state: State,
    new_result: UpdateResult,
) {
    set_result(queue, inst, new_result);
    set_state(queue, clock, inst, new_state);
}

fn handle_err_result(
    queue: &RefCell<NotifyQueue>,
    clock: &dyn Clock,
    inst: &mut FwInstance,
    new_state: State,
    err: HostError,
    default: UpdateResult,
) {
    let result = err.into_result(default);
    apply_state_and_result(queue, clock, inst, new_state, result);
}

fn ensure_stream_open(inst: &mut FwInstance) -> Result<(), HostError> {
    if inst.user_state == State::Downloading {
        return Ok(());
    }
    let iid = inst.iid;
    inst.handlers.stream_open(iid)?;
    inst.user_state = State::Downloading;
    Ok(())
}

fn finish_user_stream(inst: &mut FwInstance) -> Result<(), HostError> {
    let iid = inst.iid;
    let result = inst.handlers.stream_finish(iid);
    inst.user_state = match result {
        Ok(()) => State::Downloaded,
        Err(_) => State::Idle,
    };
    result
}

fn reset_user_state(inst: &mut FwInstance) {
    let iid = inst.iid;
    inst.handlers.reset(iid);
    inst.user_state = State::Idle;
}

fn reset_instance(queue: &RefCell<NotifyQueue>, clock: &dyn Clock, inst: &mut FwInstance) {
    reset_user_state(inst);
    apply_state_and_result(queue, clock, inst, State::Idle, UpdateResult::Initial);
    info!(iid = inst.iid.0, "firmware instance state reset");
}

fn set_update_deadline(clock: &dyn Clock, inst: &mut FwInstance) {
    inst.update_deadline = match inst.max_defer_period {
        Some(period) if period > 0 => Some(clock.now() + Duration::seconds(period)),
        _ => None,
    };
}

fn pkg_name(inst: &FwInstance) -> Option<String> {
    if inst.user_state != State::Downloaded {
        return None;
    }
    inst.handlers.get_pkg_name(inst.iid)
}

fn pkg_version(inst: &FwInstance) -> Option<String> {
    if inst.user_state != State::Downloaded {
        return None;
    }
    inst.handlers.get_pkg_version(inst.iid)
}

/// Validates a Linked/Conflicting Instances value: strictly ascending,
/// no self-references, every entry an existing instance.
fn validate_target_iid_list(
    instances: &KeyedVec<FwInstance>,
    own_iid: Iid,
    targets: &[Iid],
) -> Result<(), DmError> {
    for pair in targets.windows(2) {
        if pair[0] == pair[1] {
            return Err(DmError::BadRequest("duplicate target instance".to_string()));
        }
        if pair[0] > pair[1] {
            return Err(DmError::BadRequest(
                "target instance list not sorted".to_string(),
            ));
        }
    }
    for &target in targets {
        if target == own_iid {
            return Err(DmError::BadRequest(
                "instance list cannot reference its own instance".to_string(),
            ));
        }
        if !instances.contains(target) {
            return Err(DmError::BadRequest(format!(
                "target instance {} does not exist",
                target
            )));
        }
    }
    Ok(())
}

impl FwUpdate {
    pub fn new(
        queue: Rc<RefCell<NotifyQueue>>,
        clock: Rc<dyn Clock>,
        downloader: Box<dyn Downloader>,
    ) -> FwUpdate {
        FwUpdate {
            instances: KeyedVec::new(),
            current_download: None,
            download_queue: VecDeque::new(),
            downloads_suspended: false,
            supplemental_iids: Vec::new(),
            jobs: VecDeque::new(),
            queue,
            clock,
            downloader,
        }
    }

    fn instance(&self, iid: Iid) -> Result<&FwInstance, DmError> {
        self.instances.find(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })
    }

    fn instance_mut(&mut self, iid: Iid) -> Result<&mut FwInstance, DmError> {
        self.instances.find_mut(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })
    }

    fn is_any_download_in_progress(&self) -> bool {
        self.current_download.is_some() || !self.download_queue.is_empty()
    }

    // ── Instance setup ───────────────────────────────────────────────────────

    /// Installs one firmware component. `component_name` is mandatory as
    /// soon as the object hosts (or may host) more than one instance.
    pub fn instance_add(
        &mut self,
        registry: &Registry,
        iid: Iid,
        component_name: Option<&str>,
        handlers: Box<dyn FwHandlers>,
        initial: &InitialState,
    ) -> Result<(), DmError> {
        if iid.0 == ID_INVALID {
            return Err(DmError::BadRequest(format!("{} is not a valid IID", iid)));
        }
        if self.instances.contains(iid) {
            return Err(DmError::BadRequest(format!(
                "firmware instance {} is already initialized",
                iid
            )));
        }
        if (!self.instances.is_empty() || iid.0 != 0) && component_name.is_none() {
            return Err(DmError::BadRequest(
                "a component name is mandatory when multiple instances are present".to_string(),
            ));
        }

        let state = initial.state.unwrap_or(State::Idle);
        let result = initial.result.unwrap_or(UpdateResult::Initial);
        let result_valid = match state {
            State::Idle => matches!(
                result,
                UpdateResult::Initial
                    | UpdateResult::Success
                    | UpdateResult::IntegrityFailure
                    | UpdateResult::Failed
                    | UpdateResult::DependencyError
            ),
            _ => result == UpdateResult::Initial,
        };
        if !result_valid {
            return Err(DmError::BadRequest(format!(
                "initial result {:?} is not valid for state {:?}",
                result, state
            )));
        }

        let mut inst = FwInstance {
            iid,
            component_name: component_name.map(str::to_string),
            handlers,
            user_state: State::Idle,
            state: State::Idle,
            result: UpdateResult::Initial,
            package_uri: initial.package_uri.clone(),
            retry_download_on_expired: false,
            severity: initial.severity.unwrap_or(Severity::Mandatory),
            last_state_change_time: initial.last_state_change_time,
            max_defer_period: None,
            update_deadline: initial.update_deadline,
            linked_instances: Vec::new(),
            conflicting_instances: Vec::new(),
        };

        let mut resume_download = false;
        match state {
            State::Idle => {
                inst.result = result;
            }
            State::Downloading => {
                // a download cannot survive a restart; discard whatever was
                // partially stored and start over from the same URI
                reset_user_state(&mut inst);
                resume_download = inst.package_uri.is_some();
            }
            State::Downloaded => {
                inst.user_state = State::Downloaded;
                inst.state = State::Downloaded;
            }
            State::Updating => {
                inst.user_state = State::Updating;
                inst.state = State::Updating;
            }
        }

        self.instances
            .insert(inst)
            .map_err(|_| DmError::Internal("duplicate firmware instance".to_string()))?;
        if resume_download {
            if self.schedule_download(registry, iid).is_err() {
                warn!(iid = iid.0, "could not retry firmware download");
            }
        }
        Ok(())
    }

    // ── State machine access ─────────────────────────────────────────────────

    /// Applies a host-driven `(state, result)` change, enforcing the
    /// transition table. A rejected change leaves the instance untouched.
    pub fn set_state_and_result(
        &mut self,
        iid: Iid,
        new_state: State,
        new_result: UpdateResult,
    ) -> Result<(), DmError> {
        let FwUpdate {
            instances,
            queue,
            clock,
            ..
        } = self;
        let inst = instances.find_mut(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })?;
        if !state_change_allowed(inst.state, new_state, new_result) {
            warn!(
                iid = iid.0,
                from = ?(inst.state, inst.result),
                to = ?(new_state, new_result),
                "firmware state and result change is not allowed"
            );
            return Err(DmError::MethodNotAllowed(
                "state change not allowed".to_string(),
            ));
        }
        if new_state == State::Idle {
            reset_user_state(inst);
        }
        apply_state_and_result(queue, clock.as_ref(), inst, new_state, new_result);
        Ok(())
    }

    pub fn state(&self, iid: Iid) -> Result<State, DmError> {
        Ok(self.instance(iid)?.state)
    }

    pub fn result(&self, iid: Iid) -> Result<UpdateResult, DmError> {
        Ok(self.instance(iid)?.result)
    }

    pub fn severity(&self, iid: Iid) -> Result<Severity, DmError> {
        Ok(self.instance(iid)?.severity)
    }

    pub fn update_deadline(&self, iid: Iid) -> Result<Option<DateTime<Utc>>, DmError> {
        Ok(self.instance(iid)?.update_deadline)
    }

    pub fn last_state_change_time(&self, iid: Iid) -> Result<Option<DateTime<Utc>>, DmError> {
        Ok(self.instance(iid)?.last_state_change_time)
    }

    pub fn linked_instances(&self, iid: Iid) -> Result<&[Iid], DmError> {
        Ok(&self.instance(iid)?.linked_instances)
    }

    pub fn conflicting_instances(&self, iid: Iid) -> Result<&[Iid], DmError> {
        Ok(&self.instance(iid)?.conflicting_instances)
    }

    pub fn set_linked_instances(&mut self, iid: Iid, targets: &[Iid]) -> Result<(), DmError> {
        validate_target_iid_list(&self.instances, iid, targets)?;
        let FwUpdate {
            instances, queue, ..
        } = self;
        let inst = instances.find_mut(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })?;
        inst.linked_instances = targets.to_vec();
        queue.borrow_mut().mark_resource_changed(
            OID_ADVANCED_FIRMWARE_UPDATE,
            iid,
            RID_LINKED_INSTANCES,
        );
        Ok(())
    }

    pub fn set_conflicting_instances(&mut self, iid: Iid, targets: &[Iid]) -> Result<(), DmError> {
        validate_target_iid_list(&self.instances, iid, targets)?;
        let FwUpdate {
            instances, queue, ..
        } = self;
        let inst = instances.find_mut(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })?;
        inst.conflicting_instances = targets.to_vec();
        queue.borrow_mut().mark_resource_changed(
            OID_ADVANCED_FIRMWARE_UPDATE,
            iid,
            RID_CONFLICTING_INSTANCES,
        );
        Ok(())
    }

    // ── Download lifecycle ───────────────────────────────────────────────────

    fn security_from_registry(&self, registry: &Registry, uri: &str) -> Option<SecurityConfig> {
        let host = uri_host(uri)?;
        let iids = registry.list_instances(OID_SECURITY).ok()?;
        let security = registry.find(OID_SECURITY)?;
        for iid in iids {
            let server_uri = security
                .borrow()
                .resource_read(iid, RID_SECURITY_SERVER_URI, None)
                .ok()?;
            if let Value::String(server_uri) = server_uri {
                if uri_host(&server_uri) == Some(host) {
                    return Some(SecurityConfig {
                        security_iid: Some(iid),
                    });
                }
            }
        }
        None
    }

    fn schedule_download_now(
        &mut self,
        registry: &Registry,
        mut request: DownloadRequest,
    ) -> Result<(), DmError> {
        let iid = request.iid;
        if transport_security_from_uri(&request.url) == TransportSecurity::Encrypted {
            let from_handler = self
                .instance(iid)?
                .handlers
                .get_security_config(iid, &request.url);
            let config = from_handler.or_else(|| self.security_from_registry(registry, &request.url));
            match config {
                Some(config) => request.security = Some(config),
                None => {
                    let FwUpdate {
                        instances,
                        queue,
                        clock,
                        ..
                    } = self;
                    if let Some(inst) = instances.find_mut(iid) {
                        handle_err_result(
                            queue,
                            clock.as_ref(),
                            inst,
                            State::Idle,
                            HostError::Generic,
                            UpdateResult::UnsupportedProtocol,
                        );
                    }
                    return Err(DmError::BadRequest(format!(
                        "no security configuration for {}",
                        request.url
                    )));
                }
            }
        }

        match self.downloader.start(&request) {
            Ok(handle) => {
                self.current_download = Some((iid, handle));
                if self.downloads_suspended {
                    self.downloader.suspend(handle);
                }
                let FwUpdate {
                    instances,
                    queue,
                    clock,
                    ..
                } = self;
                if let Some(inst) = instances.find_mut(iid) {
                    inst.retry_download_on_expired = false;
                    apply_state_and_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Downloading,
                        UpdateResult::Initial,
                    );
                    info!(iid = iid.0, url = %request.url, "download started");
                }
                Ok(())
            }
            Err(err) => {
                let result = match err {
                    DownloadStartError::InvalidUri => UpdateResult::InvalidUri,
                    DownloadStartError::OutOfMemory => UpdateResult::OutOfMemory,
                    DownloadStartError::UnsupportedProtocol => UpdateResult::UnsupportedProtocol,
                    DownloadStartError::ConnectionLost => UpdateResult::ConnectionLost,
                };
                let FwUpdate {
                    instances, queue, ..
                } = self;
                if let Some(inst) = instances.find_mut(iid) {
                    reset_user_state(inst);
                    set_result(queue, inst, result);
                }
                Err(DmError::Internal(format!(
                    "could not start download: {:?}",
                    err
                )))
            }
        }
    }

    /// Starts the pull download for `iid`'s package URI, or queues it when a
    /// transfer is already running system-wide.
    fn schedule_download(&mut self, registry: &Registry, iid: Iid) -> Result<(), DmError> {
        let url = self
            .instance(iid)?
            .package_uri
            .clone()
            .ok_or_else(|| DmError::Internal("no package URI to download".to_string()))?;
        let request = DownloadRequest {
            iid,
            url,
            security: None,
        };
        if self.is_any_download_in_progress() {
            debug_assert!(self.download_queue.iter().all(|queued| queued.iid != iid));
            self.download_queue.push_back(request);
            let FwUpdate {
                instances,
                queue,
                clock,
                ..
            } = self;
            if let Some(inst) = instances.find_mut(iid) {
                apply_state_and_result(
                    queue,
                    clock.as_ref(),
                    inst,
                    State::Downloading,
                    UpdateResult::Initial,
                );
                info!(
                    iid = iid.0,
                    "a download is in progress; new download added to queue"
                );
            }
            return Ok(());
        }
        self.schedule_download_now(registry, request)
    }

    fn start_next_download_if_waiting(&mut self, registry: &Registry) {
        if self.current_download.is_some() {
            return;
        }
        if let Some(request) = self.download_queue.pop_front() {
            let iid = request.iid;
            if self.schedule_download_now(registry, request).is_err() {
                warn!(iid = iid.0, "scheduling next waiting download failed");
                // the failed instance is already in a terminal state; give
                // the remaining queue a chance
                self.start_next_download_if_waiting(registry);
            }
        }
    }

    fn cancel_download_if_in_progress(&mut self, registry: &Registry, iid: Iid) {
        let downloading = self
            .instances
            .find(iid)
            .map_or(false, |inst| inst.state == State::Downloading);
        if !downloading {
            return;
        }
        if let Some((current_iid, handle)) = self.current_download {
            if current_iid == iid {
                self.downloader.abort(handle);
                self.current_download = None;
                debug!(iid = iid.0, "aborted ongoing download");
                self.start_next_download_if_waiting(registry);
                return;
            }
        }
        let before = self.download_queue.len();
        self.download_queue.retain(|request| request.iid != iid);
        if self.download_queue.len() != before {
            debug!(iid = iid.0, "removed instance from download queue");
        }
    }

    /// Feeds one block of a pull download into the host package store.
    /// Called by the transport for the currently downloading instance.
    pub fn on_download_block(&mut self, iid: Iid, data: &[u8]) -> Result<(), DmError> {
        let FwUpdate {
            instances,
            queue,
            clock,
            ..
        } = self;
        let inst = instances.find_mut(iid).ok_or_else(|| {
            DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
        })?;
        let mut result = ensure_stream_open(inst);
        if result.is_ok() && !data.is_empty() {
            let iid = inst.iid;
            result = inst.handlers.stream_write(iid, data);
        }
        if let Err(err) = result {
            warn!(iid = iid.0, "could not write firmware");
            handle_err_result(
                queue,
                clock.as_ref(),
                inst,
                State::Idle,
                err,
                UpdateResult::NotEnoughSpace,
            );
            return Err(DmError::Internal("could not write firmware".to_string()));
        }
        Ok(())
    }

    /// Completes the current pull download. On a terminal outcome, the next
    /// queued download is started.
    pub fn on_download_finished(
        &mut self,
        registry: &Registry,
        iid: Iid,
        status: DownloadStatus,
    ) -> Result<(), DmError> {
        self.current_download = None;

        let state = self.instance(iid)?.state;
        if state != State::Downloading {
            // something already failed while the blocks were streaming in
            let inst = self.instance_mut(iid)?;
            reset_user_state(inst);
            self.start_next_download_if_waiting(registry);
            return Ok(());
        }

        match status {
            DownloadStatus::Finished => {
                let FwUpdate {
                    instances,
                    queue,
                    clock,
                    ..
                } = self;
                let inst = instances.find_mut(iid).ok_or_else(|| {
                    DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
                })?;
                let mut result = ensure_stream_open(inst);
                if result.is_ok() {
                    result = finish_user_stream(inst);
                }
                match result {
                    Ok(()) => apply_state_and_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Downloaded,
                        UpdateResult::Initial,
                    ),
                    Err(err) => handle_err_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Idle,
                        err,
                        UpdateResult::NotEnoughSpace,
                    ),
                }
                self.start_next_download_if_waiting(registry);
            }
            _ => {
                let mapped = match status {
                    DownloadStatus::NotFound => UpdateResult::InvalidUri,
                    DownloadStatus::OutOfMemory => UpdateResult::OutOfMemory,
                    _ => UpdateResult::ConnectionLost,
                };
                let retry = status == DownloadStatus::Expired
                    && self.instance(iid)?.retry_download_on_expired;
                {
                    let inst = self.instance_mut(iid)?;
                    reset_user_state(inst);
                }
                if retry {
                    info!(iid = iid.0, "download expired, retrying from the beginning");
                    if self.schedule_download(registry, iid).is_err() {
                        warn!(iid = iid.0, "could not retry firmware download");
                        let FwUpdate {
                            instances,
                            queue,
                            clock,
                            ..
                        } = self;
                        if let Some(inst) = instances.find_mut(iid) {
                            set_state(queue, clock.as_ref(), inst, State::Idle);
                        }
                    }
                } else {
                    warn!(iid = iid.0, ?status, "download aborted");
                    let FwUpdate {
                        instances,
                        queue,
                        clock,
                        ..
                    } = self;
                    if let Some(inst) = instances.find_mut(iid) {
                        apply_state_and_result(
                            queue,
                            clock.as_ref(),
                            inst,
                            State::Idle,
                            mapped,
                        );
                    }
                    self.start_next_download_if_waiting(registry);
                }
            }
        }
        Ok(())
    }

    /// Pauses pull downloads process-wide; newly started ones stay suspended
    /// until `pull_reconnect`.
    pub fn pull_suspend(&mut self) {
        if let Some((_, handle)) = self.current_download {
            self.downloader.suspend(handle);
        }
        self.downloads_suspended = true;
    }

    pub fn pull_reconnect(&mut self) -> Result<(), DmError> {
        self.downloads_suspended = false;
        if let Some((_, handle)) = self.current_download {
            self.downloader
                .reconnect(handle)
                .map_err(|err| DmError::Internal(format!("could not reconnect: {:?}", err)))?;
        }
        Ok(())
    }

    // ── Package writes ───────────────────────────────────────────────────────

    fn write_package(&mut self, registry: &Registry, iid: Iid, data: &[u8]) -> Result<(), DmError> {
        let any_in_progress = self.is_any_download_in_progress();
        let state = self.instance(iid)?.state;
        if state == State::Updating {
            warn!(iid = iid.0, "cannot set Package resource while updating");
            return Err(DmError::MethodNotAllowed(
                "cannot write the package while updating".to_string(),
            ));
        }

        let is_reset_request = data == [0u8];
        if state == State::Idle && !any_in_progress {
            let FwUpdate {
                instances,
                queue,
                clock,
                ..
            } = self;
            let inst = instances.find_mut(iid).ok_or_else(|| {
                DmError::NotFound(format!("{}/{}", OID_ADVANCED_FIRMWARE_UPDATE, iid))
            })?;
            if ensure_stream_open(inst).is_err() {
                return Err(DmError::Internal(
                    "could not open the package stream".to_string(),
                ));
            }
            if !data.is_empty() {
                let iid = inst.iid;
                if let Err(err) = inst.handlers.stream_write(iid, data) {
                    handle_err_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Idle,
                        err,
                        UpdateResult::NotEnoughSpace,
                    );
                    return Err(DmError::Internal("could not write firmware".to_string()));
                }
            }
            info!(iid = iid.0, written = data.len(), "package write finished");
            if is_reset_request {
                reset_instance(queue, clock.as_ref(), inst);
            } else {
                // a failed finish is not propagated: the write itself
                // succeeded and the result resource carries the mapping
                match finish_user_stream(inst) {
                    Ok(()) => apply_state_and_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Downloaded,
                        UpdateResult::Initial,
                    ),
                    Err(err) => handle_err_result(
                        queue,
                        clock.as_ref(),
                        inst,
                        State::Idle,
                        err,
                        UpdateResult::NotEnoughSpace,
                    ),
                }
            }
            return Ok(());
        }

        if is_reset_request {
            self.cancel_download_if_in_progress(registry, iid);
            let FwUpdate {
                instances,
                queue,
                clock,
                ..
            } = self;
            if let Some(inst) = instances.find_mut(iid) {
                reset_instance(queue, clock.as_ref(), inst);
            }
            Ok(())
        } else if any_in_progress {
            warn!("a download is already in progress or queued; rejecting push");
            Err(DmError::MethodNotAllowed(
                "a download is already in progress".to_string(),
            ))
        } else {
            Err(DmError::BadRequest(
                "expected a single null byte".to_string(),
            ))
        }
    }

    fn write_package_uri(
        &mut self,
        registry: &Registry,
        iid: Iid,
        uri: &str,
    ) -> Result<(), DmError> {
        let state = self.instance(iid)?.state;
        if uri.is_empty() {
            if state == State::Updating {
                warn!(iid = iid.0, "cannot set Package URI resource while updating");
                return Err(DmError::MethodNotAllowed(
                    "cannot reset the package URI while updating".to_string(),
                ));
            }
            self.cancel_download_if_in_progress(registry, iid);
            let FwUpdate {
                instances,
                queue,
                clock,
                ..
            } = self;
            if let Some(inst) = instances.find_mut(iid) {
                inst.package_uri = None;
                reset_instance(queue, clock.as_ref(), inst);
            }
            return Ok(());
        }

        if state != State::Idle {
            return Err(DmError::BadRequest(
                "package URI writes require the Idle state".to_string(),
            ));
        }
        if transport_security_from_uri(uri) == TransportSecurity::Undefined {
            warn!(%uri, "unsupported download protocol");
            let FwUpdate {
                instances, queue, ..
            } = self;
            if let Some(inst) = instances.find_mut(iid) {
                set_result(queue, inst, UpdateResult::UnsupportedProtocol);
            }
            return Err(DmError::BadRequest(format!(
                "unsupported download protocol in {}",
                uri
            )));
        }

        self.instance_mut(iid)?.package_uri = Some(uri.to_string());
        if let Err(err) = self.schedule_download(registry, iid) {
            // the write itself succeeded; the result resource reports the
            // download failure
            warn!(iid = iid.0, %err, "scheduling the download failed");
        }
        Ok(())
    }

    // ── Update execute ───────────────────────────────────────────────────────

    /// Parses `0='</oid/iid>,...'` Update arguments into the sorted,
    /// duplicate-free supplemental instance list.
    fn parse_update_args(&self, main_iid: Iid, args: &str) -> Result<Vec<Iid>, DmError> {
        let parsed = parse_execute_args(args)?;
        let Some(first) = parsed.first() else {
            return Ok(Vec::new());
        };
        if parsed.len() != 1 || first.id != 0 {
            return Err(DmError::BadRequest(format!(
                "invalid firmware update argument list: {}",
                args
            )));
        }
        let Some(value) = first.value.as_deref() else {
            return Ok(Vec::new());
        };
        if value.is_empty() {
            return Ok(Vec::new());
        }

        let mut supplemental = Vec::new();
        for token in value.split(',') {
            let inner = token
                .strip_prefix("</")
                .and_then(|rest| rest.strip_suffix('>'))
                .ok_or_else(|| {
                    DmError::BadRequest(format!("invalid firmware update argument: {}", token))
                })?;
            let (oid, iid) = inner.split_once('/').ok_or_else(|| {
                DmError::BadRequest(format!("invalid firmware update argument: {}", token))
            })?;
            let oid: u16 = oid.parse().map_err(|_| {
                DmError::BadRequest(format!("invalid firmware update argument: {}", token))
            })?;
            let iid: u16 = iid.parse().map_err(|_| {
                DmError::BadRequest(format!("invalid firmware update argument: {}", token))
            })?;
            if Oid(oid) != OID_ADVANCED_FIRMWARE_UPDATE || iid == ID_INVALID || Iid(iid) == main_iid
            {
                return Err(DmError::BadRequest(format!(
                    "invalid supplemental instance reference: {}",
                    token
                )));
            }
            let peer = self.instances.find(Iid(iid)).ok_or_else(|| {
                DmError::BadRequest(format!(
                    "supplemental instance {} does not exist",
                    iid
                ))
            })?;
            if peer.state != State::Downloaded {
                warn!(
                    iid,
                    state = ?peer.state,
                    "supplemental instance has no downloaded firmware"
                );
                return Err(DmError::MethodNotAllowed(format!(
                    "supplemental instance {} is not in the Downloaded state",
                    iid
                )));
            }
            supplemental.push(Iid(iid));
        }

        supplemental.sort_unstable();
        if supplemental.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(DmError::BadRequest(
                "duplicate instances in firmware update arguments".to_string(),
            ));
        }
        Ok(supplemental)
    }

    fn execute_update(&mut self, iid: Iid, args: &str) -> Result<(), DmError> {
        if self.instance(iid)?.state != State::Downloaded {
            warn!(iid = iid.0, "update requested but firmware not yet downloaded");
            return Err(DmError::MethodNotAllowed(
                "firmware is not in the Downloaded state".to_string(),
            ));
        }
        self.supplemental_iids = self.parse_update_args(iid, args)?;

        let FwUpdate {
            instances,
            queue,
            clock,
            jobs,
            ..
        } = self;
        if let Some(inst) = instances.find_mut(iid) {
            apply_state_and_result(
                queue,
                clock.as_ref(),
                inst,
                State::Updating,
                UpdateResult::Initial,
            );
        }
        // queued after the state change so the notification batch precedes
        // the host upgrade callback
        jobs.push_back(Job::ScheduleUpgrade(iid));
        Ok(())
    }

    fn execute_cancel(&mut self, registry: &Registry, iid: Iid) -> Result<(), DmError> {
        let state = self.instance(iid)?.state;
        if state != State::Downloading && state != State::Downloaded {
            warn!(iid = iid.0, ?state, "cancel requested in a non-cancellable state");
            return Err(DmError::MethodNotAllowed(
                "nothing to cancel in this state".to_string(),
            ));
        }
        self.cancel_download_if_in_progress(registry, iid);
        let FwUpdate {
            instances,
            queue,
            clock,
            ..
        } = self;
        if let Some(inst) = instances.find_mut(iid) {
            reset_user_state(inst);
            apply_state_and_result(
                queue,
                clock.as_ref(),
                inst,
                State::Idle,
                UpdateResult::UpdateCancelled,
            );
        }
        Ok(())
    }

    // ── Deferred jobs ────────────────────────────────────────────────────────

    /// Runs the jobs queued up to this point. Jobs queued while running
    /// (notably `PerformUpgrade`) wait for the next call, which keeps the
    /// host upgrade strictly after the notification flush for the
    /// `UPDATING` transition.
    pub fn run_scheduled_jobs(&mut self) {
        let batch: Vec<Job> = self.jobs.drain(..).collect();
        for job in batch {
            match job {
                Job::ScheduleUpgrade(iid) => {
                    let still_updating = self
                        .instances
                        .find(iid)
                        .map_or(false, |inst| {
                            inst.state == State::Updating && inst.user_state != State::Updating
                        });
                    if still_updating {
                        self.jobs.push_back(Job::PerformUpgrade(iid));
                    }
                }
                Job::PerformUpgrade(iid) => self.perform_upgrade(iid),
            }
        }
    }

    /// Whether any deferred job is still pending.
    pub fn has_pending_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    fn perform_upgrade(&mut self, iid: Iid) {
        let supplemental = std::mem::take(&mut self.supplemental_iids);
        let FwUpdate {
            instances,
            queue,
            clock,
            ..
        } = self;
        let Some(inst) = instances.find_mut(iid) else {
            return;
        };
        set_update_deadline(clock.as_ref(), inst);
        let result = {
            let iid = inst.iid;
            inst.handlers.perform_upgrade(iid, &supplemental)
        };
        match result {
            Ok(()) => {
                // unless the host already moved the instance on (deferral or
                // a dependency error), the upgrade is now in progress
                if inst.user_state == State::Downloaded
                    && inst.result != UpdateResult::Deferred
                    && inst.result != UpdateResult::DependencyError
                {
                    inst.user_state = State::Updating;
                }
            }
            Err(err) => {
                warn!(iid = iid.0, "perform_upgrade failed");
                handle_err_result(
                    queue,
                    clock.as_ref(),
                    inst,
                    State::Downloaded,
                    err,
                    UpdateResult::Failed,
                );
            }
        }
    }
}

// ── Object handler ───────────────────────────────────────────────────────────

impl ObjectHandler for FwUpdate {
    fn oid(&self) -> Oid {
        OID_ADVANCED_FIRMWARE_UPDATE
    }

    fn list_instances(&self) -> Result<Vec<Iid>, DmError> {
        Ok(self.instances.keys().collect())
    }

    fn list_resources(&self, iid: Iid) -> Result<Vec<ResourceDef>, DmError> {
        let inst = self.instance(iid)?;
        let present_if = |rid, kind, present: bool| {
            if present {
                ResourceDef::present(rid, kind)
            } else {
                ResourceDef::absent(rid, kind)
            }
        };
        let mut defs = vec![
            ResourceDef::present(RID_PACKAGE, ResourceKind::W),
            ResourceDef::present(RID_PACKAGE_URI, ResourceKind::Rw),
            ResourceDef::present(RID_UPDATE, ResourceKind::E),
            ResourceDef::present(RID_STATE, ResourceKind::R),
            ResourceDef::present(RID_UPDATE_RESULT, ResourceKind::R),
            present_if(RID_PKG_NAME, ResourceKind::R, pkg_name(inst).is_some()),
            present_if(RID_PKG_VERSION, ResourceKind::R, pkg_version(inst).is_some()),
            ResourceDef::present(RID_UPDATE_PROTOCOL_SUPPORT, ResourceKind::Rm),
            ResourceDef::present(RID_UPDATE_DELIVERY_METHOD, ResourceKind::R),
            ResourceDef::present(RID_CANCEL, ResourceKind::E),
            ResourceDef::present(RID_SEVERITY, ResourceKind::Rw),
            ResourceDef::present(RID_LAST_STATE_CHANGE_TIME, ResourceKind::R),
            ResourceDef::present(RID_MAX_DEFER_PERIOD, ResourceKind::Rw),
            present_if(
                RID_COMPONENT_NAME,
                ResourceKind::R,
                inst.component_name.is_some(),
            ),
            present_if(
                RID_CURRENT_VERSION,
                ResourceKind::R,
                inst.handlers.get_current_version(iid).is_some(),
            ),
        ];
        if self.instances.len() > 1 {
            defs.push(ResourceDef::present(RID_LINKED_INSTANCES, ResourceKind::Rm));
            defs.push(ResourceDef::present(
                RID_CONFLICTING_INSTANCES,
                ResourceKind::Rm,
            ));
        }
        Ok(defs)
    }

    fn list_resource_instances(&self, iid: Iid, rid: Rid) -> Result<Vec<Riid>, DmError> {
        let inst = self.instance(iid)?;
        match rid {
            RID_UPDATE_PROTOCOL_SUPPORT => Ok((0..SUPPORTED_PROTOCOLS.len() as u16)
                .map(Riid)
                .collect()),
            RID_LINKED_INSTANCES => {
                Ok(inst.linked_instances.iter().map(|iid| Riid(iid.0)).collect())
            }
            RID_CONFLICTING_INSTANCES => Ok(inst
                .conflicting_instances
                .iter()
                .map(|iid| Riid(iid.0))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn resource_read(&self, iid: Iid, rid: Rid, riid: Option<Riid>) -> Result<Value, DmError> {
        let inst = self.instance(iid)?;
        match rid {
            RID_PACKAGE_URI => Ok(Value::String(
                inst.package_uri.clone().unwrap_or_default(),
            )),
            RID_STATE => Ok(Value::Int(inst.state as i64)),
            RID_UPDATE_RESULT => Ok(Value::Int(inst.result as i64)),
            RID_PKG_NAME => pkg_name(inst).map(Value::String).ok_or_else(|| {
                DmError::NotFound("no package name available".to_string())
            }),
            RID_PKG_VERSION => pkg_version(inst).map(Value::String).ok_or_else(|| {
                DmError::NotFound("no package version available".to_string())
            }),
            RID_UPDATE_PROTOCOL_SUPPORT => {
                let riid = riid.ok_or_else(|| {
                    DmError::BadRequest("protocol support has multiple instances".to_string())
                })?;
                SUPPORTED_PROTOCOLS
                    .get(usize::from(riid.0))
                    .map(|&protocol| Value::Int(protocol))
                    .ok_or_else(|| DmError::NotFound(format!("no protocol entry {}", riid)))
            }
            RID_UPDATE_DELIVERY_METHOD => Ok(Value::Int(2)), // pull and push
            RID_SEVERITY => Ok(Value::Int(inst.severity as i64)),
            RID_LAST_STATE_CHANGE_TIME => Ok(Value::Int(
                inst.last_state_change_time
                    .map(|time| time.timestamp())
                    .unwrap_or(0),
            )),
            RID_MAX_DEFER_PERIOD => Ok(Value::Int(inst.max_defer_period.unwrap_or(0))),
            RID_COMPONENT_NAME => inst
                .component_name
                .clone()
                .map(Value::String)
                .ok_or_else(|| DmError::NotFound("no component name".to_string())),
            RID_CURRENT_VERSION => inst
                .handlers
                .get_current_version(iid)
                .map(Value::String)
                .ok_or_else(|| DmError::NotFound("no current version available".to_string())),
            RID_LINKED_INSTANCES | RID_CONFLICTING_INSTANCES => {
                let riid = riid.ok_or_else(|| {
                    DmError::BadRequest("instance links have multiple instances".to_string())
                })?;
                let list = if rid == RID_LINKED_INSTANCES {
                    &inst.linked_instances
                } else {
                    &inst.conflicting_instances
                };
                if list.contains(&Iid(riid.0)) {
                    Ok(Value::Objlnk(OID_ADVANCED_FIRMWARE_UPDATE, Iid(riid.0)))
                } else {
                    Err(DmError::NotFound(format!("no instance link {}", riid)))
                }
            }
            _ => Err(DmError::MethodNotAllowed(format!(
                "{}/{}/{} is not readable",
                OID_ADVANCED_FIRMWARE_UPDATE, iid, rid
            ))),
        }
    }

    fn resource_write(
        &mut self,
        registry: &Registry,
        iid: Iid,
        rid: Rid,
        _riid: Option<Riid>,
        value: &Value,
    ) -> Result<(), DmError> {
        match rid {
            RID_PACKAGE => {
                let data = value
                    .as_bytes()
                    .ok_or_else(|| DmError::BadRequest("expected an opaque value".to_string()))?;
                self.write_package(registry, iid, data)
            }
            RID_PACKAGE_URI => {
                let uri = value
                    .as_str()
                    .ok_or_else(|| DmError::BadRequest("expected a string value".to_string()))?
                    .to_string();
                self.write_package_uri(registry, iid, &uri)
            }
            RID_SEVERITY => {
                let raw = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                let severity = Severity::from_i64(raw)
                    .ok_or_else(|| DmError::BadRequest(format!("invalid severity {}", raw)))?;
                self.instance_mut(iid)?.severity = severity;
                Ok(())
            }
            RID_MAX_DEFER_PERIOD => {
                let raw = value
                    .as_i64()
                    .ok_or_else(|| DmError::BadRequest("expected an integer".to_string()))?;
                if raw < 0 {
                    return Err(DmError::BadRequest(format!(
                        "invalid maximum defer period {}",
                        raw
                    )));
                }
                self.instance_mut(iid)?.max_defer_period = Some(raw);
                Ok(())
            }
            // the Bootstrap Server may attempt writes to other resources
            _ => Err(DmError::MethodNotAllowed(format!(
                "{}/{}/{} is not writable",
                OID_ADVANCED_FIRMWARE_UPDATE, iid, rid
            ))),
        }
    }

    fn resource_execute(
        &mut self,
        registry: &Registry,
        iid: Iid,
        rid: Rid,
        args: &str,
    ) -> Result<(), DmError> {
        self.instance(iid)?;
        match rid {
            RID_UPDATE => self.execute_update(iid, args),
            RID_CANCEL => self.execute_cancel(registry, iid),
            _ => Err(DmError::MethodNotAllowed(format!(
                "{}/{}/{} is not executable",
                OID_ADVANCED_FIRMWARE_UPDATE, iid, rid
            ))),
        }
    }
}
