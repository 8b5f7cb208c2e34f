//! Turning a [`PendingState`] into kernel commits
//!
//! On atomic KMS the output states of a transaction become one commit, or one commit per
//! output if [`DrmBackendConfig::combine_commits`](super::DrmBackendConfig::combine_commits)
//! is off. On legacy KMS every output is programmed on its own through `SetCrtc` and `PageFlip`,
//! and a failing output does not keep the others from being updated.
//!
//! Whenever the backend's view of the hardware is invalid (at startup, after a session switch,
//! after a CRTC was released) the first commit also resets everything no enabled output uses.

use std::time::Duration;

use drm::control::{property, AtomicCommitFlags};
use tracing::{debug, instrument, trace, warn};

use super::{
    backend::{BackendEvent, DrmBackend},
    head::HdcpProtection,
    kms::{AtomicRequest, KmsDevice, ObjectHandle},
    properties::{ConnectorProperty, CrtcProperty, PlaneProperty, PropertyName, PropertyTable},
    render::{PresentationFlags, RenderPath},
    state::{DpmsLevel, OutputState, PendingState},
    Error, OutputId,
};
use crate::utils::{Clock, Monotonic, Realtime};

/// When a commit counts as done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    /// A completion event finishes the commit later
    Async,
    /// The commit is done once the call returns
    Sync,
}

/// Outputs whose state did not reach the kernel
#[derive(Debug, Default)]
pub(crate) struct ApplyReport {
    pub(crate) failed: Vec<OutputId>,
    pub(crate) error: Option<Error>,
}

impl ApplyReport {
    fn fail(&mut self, outputs: impl IntoIterator<Item = OutputId>, err: Error) {
        self.failed.extend(outputs);
        // losing the display outranks any other failure
        if self.error.as_ref().map_or(true, |e| !e.is_permission_denied()) {
            self.error = Some(err);
        }
    }

    pub(crate) fn into_result(self) -> Result<(), Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Batch {
    request: AtomicRequest,
    modeset: bool,
    reset: bool,
    states: Vec<OutputState>,
}

fn prop_handle<P: PropertyName>(
    table: &PropertyTable<P>,
    object: impl Into<ObjectHandle>,
    prop: P,
) -> Result<property::Handle, Error> {
    table.handle(prop).ok_or_else(|| Error::UnknownProperty {
        handle: object.into().raw(),
        name: prop.name(),
    })
}

fn object_id(handle: impl Into<ObjectHandle>) -> u64 {
    u64::from(u32::from(handle.into().raw()))
}

impl<D: KmsDevice, R: RenderPath> DrmBackend<D, R> {
    /// Applies a transaction
    ///
    /// Outputs that fail are listed in the report, their queued state is dropped.
    #[instrument(level = "trace", parent = &self.span, skip(self, pending))]
    pub(crate) fn apply(&mut self, pending: PendingState, mode: ApplyMode) -> ApplyReport {
        if pending.is_empty() {
            return ApplyReport::default();
        }
        if !self.session_active {
            let mut report = ApplyReport::default();
            let states = pending.into_outputs();
            report.fail(states.iter().map(|s| s.output), Error::DeviceInactive);
            for state in &states {
                self.discard_state(state);
            }
            return report;
        }

        if self.caps.atomic {
            self.apply_atomic(pending, mode)
        } else {
            self.apply_legacy(pending)
        }
    }

    /// Applies a transaction outside of the repaint cycle, no completion event is awaited
    pub(crate) fn apply_sync(&mut self, pending: PendingState) -> Result<(), Error> {
        self.apply(pending, ApplyMode::Sync).into_result()
    }

    fn apply_atomic(&mut self, pending: PendingState, mode: ApplyMode) -> ApplyReport {
        let mut report = ApplyReport::default();
        let states = pending.into_outputs();

        let mut prelude = AtomicRequest::new();
        let reset = self.state_invalid;
        if reset {
            if let Err(err) = self.add_reset_prelude(&mut prelude) {
                warn!("Unable to reset unused resources: {}", err);
                report.fail(states.iter().map(|s| s.output), err);
                for state in &states {
                    self.discard_state(state);
                }
                return report;
            }
        }

        let mut batches: Vec<Batch> = Vec::new();
        for state in states {
            self.assert_idle(state.output);
            let mut request = AtomicRequest::new();
            let dpms_changed = match self.add_output_state(&mut request, &state) {
                Ok(changed) => changed,
                Err(err) => {
                    warn!(output = ?state.output, "Unable to build atomic request: {}", err);
                    report.fail([state.output], err);
                    self.discard_state(&state);
                    continue;
                }
            };

            if self.config.combine_commits && !batches.is_empty() {
                if let Some(batch) = batches.last_mut() {
                    batch.request.merge(request);
                    batch.modeset |= dpms_changed;
                    batch.states.push(state);
                }
                continue;
            }

            let first = batches.is_empty();
            let mut batch_request = if first {
                std::mem::take(&mut prelude)
            } else {
                AtomicRequest::new()
            };
            batch_request.merge(request);
            batches.push(Batch {
                request: batch_request,
                // every output may need a full mode-set while the hardware state is unknown
                modeset: dpms_changed || reset,
                reset: first && reset,
                states: vec![state],
            });
        }

        for batch in batches {
            let mut flags = AtomicCommitFlags::empty();
            if batch.modeset {
                flags |= AtomicCommitFlags::ALLOW_MODESET;
            }
            if mode == ApplyMode::Async {
                flags |= AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
            }

            trace!(?flags, changes = batch.request.entries().len(), "Submitting atomic commit");
            match self.device.atomic_commit(flags, &batch.request) {
                Ok(()) => {
                    if batch.reset {
                        self.state_invalid = false;
                    }
                    for state in batch.states {
                        let id = state.output;
                        self.assign_state(state, mode);
                        if mode == ApplyMode::Async {
                            self.arm_watchdog(id);
                        }
                    }
                }
                Err(err) => {
                    warn!("Atomic commit failed: {}", err);
                    report.fail(batch.states.iter().map(|s| s.output), err);
                    for state in &batch.states {
                        self.discard_state(state);
                    }
                }
            }
        }

        report
    }

    /// Disables every head, CRTC and plane no enabled output uses
    ///
    /// Planes of enabled outputs are disabled as well, their output state overrides that.
    fn add_reset_prelude(&self, request: &mut AtomicRequest) -> Result<(), Error> {
        for head in self.heads.iter().filter(|head| !self.drives_head(head.output())) {
            let connector = head.connector();
            request.add(connector, prop_handle(head.props(), connector, ConnectorProperty::CrtcId)?, 0);
        }

        for crtc in self.crtcs.unused() {
            let props = self.crtc_props.get(crtc).ok_or(Error::UnknownProperty {
                handle: (*crtc).into(),
                name: CrtcProperty::Active.name(),
            })?;
            request.add(*crtc, prop_handle(props, *crtc, CrtcProperty::Active)?, 0);
            request.add(*crtc, prop_handle(props, *crtc, CrtcProperty::ModeId)?, 0);
        }

        for plane in self.planes.iter() {
            let Some(handle) = plane.handle() else {
                continue;
            };
            request.add(handle, prop_handle(plane.props(), handle, PlaneProperty::CrtcId)?, 0);
            request.add(handle, prop_handle(plane.props(), handle, PlaneProperty::FbId)?, 0);
        }
        Ok(())
    }

    /// Adds the properties of one output state, returns whether the power level changes
    fn add_output_state(&mut self, request: &mut AtomicRequest, state: &OutputState) -> Result<bool, Error> {
        let output = self
            .outputs
            .get(&state.output)
            .ok_or(Error::UnknownOutput(state.output))?;
        let crtc = output
            .crtc
            .clone()
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        let dpms_changed = state.dpms != output.state_cur.dpms;
        let heads = output.heads.clone();

        let (mode_blob, active, routed_to) = if state.dpms == DpmsLevel::On {
            (self.ensure_mode_blob(state.output)?, 1, object_id(crtc.handle))
        } else {
            (0, 0, 0)
        };
        request.add(crtc.handle, prop_handle(&crtc.props, crtc.handle, CrtcProperty::ModeId)?, mode_blob);
        request.add(crtc.handle, prop_handle(&crtc.props, crtc.handle, CrtcProperty::Active)?, active);

        for connector in heads {
            let head = self.head(connector).ok_or(Error::UnknownConnector(connector))?;
            request.add(
                connector,
                prop_handle(head.props(), connector, ConnectorProperty::CrtcId)?,
                routed_to,
            );
            add_protection(request, head, state.protection);
        }

        for ps in &state.planes {
            let Some(plane) = self.planes.get(ps.plane) else {
                continue;
            };
            let Some(handle) = plane.handle() else {
                continue;
            };
            let props = plane.props();
            let (fb, crtc_id) = match ps.fb {
                Some(fb) => (object_id_fb(fb.handle), object_id(crtc.handle)),
                None => (0, 0),
            };
            request.add(handle, prop_handle(props, handle, PlaneProperty::FbId)?, fb);
            request.add(handle, prop_handle(props, handle, PlaneProperty::CrtcId)?, crtc_id);
            request.add(handle, prop_handle(props, handle, PlaneProperty::SrcX)?, ps.src.x as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::SrcY)?, ps.src.y as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::SrcW)?, ps.src.w as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::SrcH)?, ps.src.h as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::CrtcX)?, ps.dst.x as i64 as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::CrtcY)?, ps.dst.y as i64 as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::CrtcW)?, ps.dst.w as u64);
            request.add(handle, prop_handle(props, handle, PlaneProperty::CrtcH)?, ps.dst.h as u64);

            if let Some(damage) = props.handle(PlaneProperty::FbDamageClips) {
                request.add(handle, damage, ps.damage_blob.unwrap_or(0));
            }
            // synthesized or immutable orderings cannot be changed
            if let (Some(zpos), Some((min, max)), Some(prop)) =
                (ps.zpos, plane.zpos_range(), props.handle(PlaneProperty::Zpos))
            {
                if min != max {
                    request.add(handle, prop, zpos);
                }
            }
        }

        Ok(dpms_changed)
    }

    /// Blob of the output's current mode, uploading it if needed
    fn ensure_mode_blob(&mut self, id: OutputId) -> Result<u64, Error> {
        let output = self.outputs.get_mut(&id).ok_or(Error::UnknownOutput(id))?;
        let mode = output.mode.ok_or_else(|| Error::NoMode(output.name.clone()))?;
        if let Some((blob_mode, blob)) = output.mode_blob {
            if blob_mode == mode {
                return Ok(blob);
            }
        }

        let blob = self.device.create_mode_blob(&mode)?;
        trace!(output = %output.name, blob, "Uploaded mode blob");
        if let Some((_, old)) = output.mode_blob.replace((mode, blob)) {
            if let Err(err) = self.device.destroy_blob(old) {
                debug!(blob = old, "Failed to destroy mode blob: {}", err);
            }
        }
        Ok(blob)
    }

    fn apply_legacy(&mut self, pending: PendingState) -> ApplyReport {
        let mut report = ApplyReport::default();

        if self.state_invalid {
            // disabling a crtc also disables the connectors routed to it
            for crtc in self.crtcs.unused().to_vec() {
                if let Err(err) = self.device.set_crtc(crtc, None, &[], None) {
                    debug!(?crtc, "Unable to disable unused crtc: {}", err);
                }
            }
        }

        for state in pending.into_outputs() {
            let id = state.output;
            if let Err(err) = self.apply_output_legacy(state) {
                warn!(output = ?id, "Couldn't apply state: {}", err);
                if let Some(output) = self.outputs.get_mut(&id) {
                    let stale = std::mem::replace(&mut output.state_cur, OutputState::new(id));
                    self.discard_state(&stale);
                }
                self.reinit_render_path(id);
                report.fail([id], err);
            }
        }

        // a failed output needs a full mode-set next time
        if report.failed.is_empty() {
            self.state_invalid = false;
        }
        report
    }

    /// Legacy page-flips always complete asynchronously, whatever the caller asked for
    fn apply_output_legacy(&mut self, state: OutputState) -> Result<(), Error> {
        let id = state.output;
        self.assert_idle(id);
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        let crtc = output
            .crtc
            .as_ref()
            .map(|crtc| crtc.handle)
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        let heads = output.heads.clone();
        let dpms_changed = state.dpms != output.state_cur.dpms;

        if state.dpms != DpmsLevel::On {
            if output.cursor_plane.is_some() {
                if let Err(err) = self.device.disable_cursor(crtc) {
                    debug!(?crtc, "Failed to disable cursor: {}", err);
                }
            }
            if let Err(err) = self.device.set_crtc(crtc, None, &[], None) {
                warn!(?crtc, "Failed to disable crtc: {}", err);
            }
            self.assign_state(state, ApplyMode::Sync);
            let now = self.now();
            self.update_complete(id, PresentationFlags::HW_COMPLETION, now);
            return Ok(());
        }

        let scanout = output
            .scanout_plane
            .ok_or_else(|| Error::NoPrimaryPlane(output.name.clone(), crtc))?;
        let fb = state
            .plane(scanout)
            .and_then(|ps| ps.fb)
            .ok_or_else(|| Error::MissingFramebuffer(output.name.clone()))?;
        let current_fb = self.planes.get(scanout).and_then(|plane| plane.state().fb);
        let needs_modeset = self.state_invalid || current_fb.map_or(true, |cur| cur.needs_modeset_for(&fb));

        if needs_modeset {
            let mode = output.mode.ok_or_else(|| Error::NoMode(output.name.clone()))?;
            debug!(output = %output.name, ?crtc, "Setting mode");
            self.device.set_crtc(crtc, Some(fb.handle), &heads, Some(mode))?;
        }
        self.device.page_flip(crtc, fb.handle)?;

        if dpms_changed {
            for connector in &heads {
                let Some(head) = self.head(*connector) else {
                    continue;
                };
                let props = head.props();
                let (Some(prop), Some(value)) = (
                    props.handle(ConnectorProperty::Dpms),
                    props.enum_value(ConnectorProperty::Dpms, ConnectorProperty::DPMS_ON),
                ) else {
                    continue;
                };
                if let Err(err) = self.device.set_connector_property(*connector, prop, value) {
                    warn!(head = head.name(), "Failed to set DPMS property: {}", err);
                }
            }
        }

        if let Some(output) = self.outputs.get_mut(&id) {
            output.page_flip_pending = true;
        }
        self.arm_watchdog(id);
        self.assign_state(state, ApplyMode::Async);
        Ok(())
    }

    /// An output never has two commits in flight
    fn assert_idle(&self, id: OutputId) {
        if let Some(output) = self.outputs.get(&id) {
            assert!(
                !output.commit_in_flight(),
                "output {} submitted a commit while another one is in flight",
                output.name
            );
        }
    }

    /// Makes a successfully committed state the current state of its output
    fn assign_state(&mut self, mut state: OutputState, mode: ApplyMode) {
        let atomic = self.caps.atomic;
        let id = state.output;
        if mode == ApplyMode::Sync {
            state.mark_complete();
        }
        for ps in &state.planes {
            if let Some(plane) = self.planes.get_mut(ps.plane) {
                plane.state = ps.clone();
            }
        }

        let Some(output) = self.outputs.get_mut(&id) else {
            self.discard_state(&state);
            return;
        };
        debug_assert!(output.state_last.is_none(), "commit while another one is in flight");

        let disables_protection = atomic && state.protection == HdcpProtection::Disabled;
        let old = std::mem::replace(&mut output.state_cur, state);
        let heads = output.heads.clone();
        match mode {
            ApplyMode::Async => {
                output.state_last = Some(old);
                if atomic {
                    output.atomic_complete_pending = true;
                }
            }
            ApplyMode::Sync => self.discard_state(&old),
        }

        if disables_protection {
            for connector in heads {
                let Some(head) = self.heads.iter_mut().find(|h| h.connector() == connector) else {
                    continue;
                };
                if head.protection() != HdcpProtection::Disabled {
                    head.set_protection(HdcpProtection::Disabled);
                    self.events.push(BackendEvent::ContentProtectionChanged {
                        connector,
                        protection: HdcpProtection::Disabled,
                    });
                }
            }
        }
    }

    /// Releases the kernel objects owned by a state that will never be committed again
    pub(crate) fn discard_state(&self, state: &OutputState) {
        for blob in state.damage_blobs() {
            if let Err(err) = self.device.destroy_blob(blob) {
                debug!(blob, "Failed to destroy damage blob: {}", err);
            }
        }
    }

    pub(crate) fn arm_watchdog(&mut self, id: OutputId) {
        let Some(timeout) = self.config.pageflip_timeout else {
            return;
        };
        if let Some(output) = self.outputs.get(&id) {
            self.watchdog.arm(id, &output.name, timeout);
        }
    }

    /// Current time on the clock the kernel stamps events with
    pub(crate) fn now(&self) -> Duration {
        if self.caps.monotonic_timestamps {
            Clock::<Monotonic>::new().now().into()
        } else {
            Clock::<Realtime>::new().now().into()
        }
    }
}

fn object_id_fb(handle: drm::control::framebuffer::Handle) -> u64 {
    u64::from(u32::from(handle))
}

fn add_protection(request: &mut AtomicRequest, head: &super::head::Head, protection: HdcpProtection) {
    let props = head.props();
    let Some(prop) = props.handle(ConnectorProperty::ContentProtection) else {
        return;
    };
    let (protection_index, type_index) = protection.as_request();
    let Some(value) = props.enum_value(ConnectorProperty::ContentProtection, protection_index) else {
        debug!(head = head.name(), "Content protection property lacks the requested value");
        return;
    };
    request.add(head.connector(), prop, value);

    if let (Some(prop), Some(value)) = (
        props.handle(ConnectorProperty::HdcpContentType),
        props.enum_value(ConnectorProperty::HdcpContentType, type_index),
    ) {
        request.add(head.connector(), prop, value);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use drm::control::AtomicCommitFlags;

    use crate::backend::drm::{
        config::DrmBackendConfig,
        head::HdcpProtection,
        kms::{AtomicRequest, DamageRect},
        test_utils::{
            backend, backend_with_config, handle, prop, test_config, test_mode, DummyConnector, DummyKms,
            DummyPlane, KmsCall, TestBackend, CONN_CRTC_ID, CONN_HDCP_TYPE, CONN_PROTECTION, CRTC_ACTIVE,
            PLANE_DAMAGE_CLIPS, PLANE_FB_ID,
        },
        BackendEvent, OutputId, PresentationFlags, RepaintStatus,
    };

    fn enable(backend: &mut TestBackend, index: u32) -> OutputId {
        let connector = backend.device().connector_handle(index);
        let id = backend.create_output_for_head(connector).unwrap();
        backend.enable_output(id).unwrap();
        id
    }

    fn two_heads() -> DummyKms {
        DummyKms::builder()
            .crtcs(2)
            .plane(DummyPlane::primary(0b01))
            .plane(DummyPlane::primary(0b10))
            .connector(DummyConnector::hdmi())
            .connector(DummyConnector::edp())
            .build()
    }

    fn atomic_commits(backend: &TestBackend) -> Vec<(AtomicCommitFlags, AtomicRequest)> {
        backend
            .device()
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                KmsCall::AtomicCommit { flags, request } => Some((flags, request)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_commit_resets_unused_resources() {
        let (mut backend, watchdog) = backend(DummyKms::simple().build());
        let id = enable(&mut backend, 0);
        backend.repaint_output(id, &[]).unwrap();
        backend.repaint_flush().unwrap();

        let commits = atomic_commits(&backend);
        assert_eq!(commits.len(), 1);
        let (flags, request) = &commits[0];
        assert_eq!(
            *flags,
            AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT
        );

        let device = backend.device();
        let (unused, used) = (device.crtc_handle(0), device.crtc_handle(1));
        assert_eq!(request.value(unused, prop(CRTC_ACTIVE)), Some(0));
        assert_eq!(request.value(used, prop(CRTC_ACTIVE)), Some(1));
        assert_eq!(
            request.value(device.connector_handle(0), prop(CONN_CRTC_ID)),
            Some(u64::from(u32::from(used)))
        );
        // the overlay is switched off, the primary shows the first frame
        assert_eq!(request.value(device.plane_handle(4), prop(PLANE_FB_ID)), Some(0));
        assert_eq!(request.value(device.plane_handle(1), prop(PLANE_FB_ID)), Some(501));

        assert!(!backend.is_state_invalid());
        assert_eq!(backend.output(id).unwrap().repaint_status(), RepaintStatus::AwaitingCompletion);
        assert!(backend.output(id).unwrap().is_atomic_complete_pending());
        assert!(watchdog.is_armed(id));
    }

    #[test]
    fn outputs_share_one_commit() {
        let (mut backend, _) = backend(two_heads());
        let first = enable(&mut backend, 0);
        let second = enable(&mut backend, 1);
        backend.repaint_begin().unwrap();
        backend.repaint_output(first, &[]).unwrap();
        backend.repaint_output(second, &[]).unwrap();
        backend.repaint_flush().unwrap();

        assert_eq!(atomic_commits(&backend).len(), 1);
        for id in [first, second] {
            assert_eq!(backend.output(id).unwrap().repaint_status(), RepaintStatus::AwaitingCompletion);
        }
    }

    #[test]
    fn separate_commits_may_all_modeset() {
        let config = DrmBackendConfig {
            combine_commits: false,
            ..test_config()
        };
        let (mut backend, _) = backend_with_config(two_heads(), config);
        let first = enable(&mut backend, 0);
        let second = enable(&mut backend, 1);
        backend.repaint_begin().unwrap();
        backend.repaint_output(first, &[]).unwrap();
        backend.repaint_output(second, &[]).unwrap();
        backend.repaint_flush().unwrap();

        let commits = atomic_commits(&backend);
        assert_eq!(commits.len(), 2);
        assert!(commits
            .iter()
            .all(|(flags, _)| flags.contains(AtomicCommitFlags::ALLOW_MODESET)));
        assert!(!backend.is_state_invalid());
    }

    #[test]
    fn rejected_commit_drops_the_frame() {
        let (mut backend, watchdog) = backend(DummyKms::simple().build());
        let id = enable(&mut backend, 0);
        backend.take_events();
        backend.device().fail_next_commit(libc::EINVAL);

        backend.repaint_output(id, &[DamageRect::new(0, 0, 32, 32)]).unwrap();
        backend.repaint_flush().unwrap();

        assert_eq!(
            backend.take_events(),
            vec![BackendEvent::FrameFinished {
                output: id,
                time: None,
                sequence: 0,
                flags: PresentationFlags::INVALID,
            }]
        );
        let blob = backend
            .device()
            .calls()
            .into_iter()
            .find_map(|call| match call {
                KmsCall::DamageBlob(blob, _) => Some(blob),
                _ => None,
            })
            .unwrap();
        assert!(!backend.device().blob_exists(blob));
        assert!(backend.is_state_invalid());
        assert_eq!(backend.output(id).unwrap().repaint_status(), RepaintStatus::Idle);
        assert!(!watchdog.is_armed(id));
        assert!(backend.session_active);
    }

    #[test]
    fn losing_master_pauses_the_backend() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        let id = enable(&mut backend, 0);
        backend.device().fail_next_commit(libc::EACCES);

        backend.repaint_output(id, &[]).unwrap();
        let err = backend.repaint_flush().unwrap_err();
        assert!(err.is_permission_denied());
        assert!(!backend.is_session_active());
    }

    #[test]
    fn damage_reaches_the_kernel() {
        let (mut backend, _) = backend(DummyKms::simple().build());
        let id = enable(&mut backend, 0);
        let damage = [DamageRect::new(0, 0, 64, 64), DamageRect::new(100, 100, 8, 8)];
        backend.repaint_output(id, &damage).unwrap();
        backend.repaint_flush().unwrap();

        let blob = backend
            .device()
            .calls()
            .into_iter()
            .find_map(|call| match call {
                KmsCall::DamageBlob(blob, rects) if rects == damage => Some(blob),
                _ => None,
            })
            .unwrap();
        let commits = atomic_commits(&backend);
        let plane = backend.device().plane_handle(1);
        assert_eq!(commits[0].1.value(plane, prop(PLANE_DAMAGE_CLIPS)), Some(blob));
    }

    #[test]
    fn protection_is_dropped_unless_requested() {
        let device = DummyKms::builder()
            .crtcs(1)
            .plane(DummyPlane::primary(0b1))
            .connector(DummyConnector::hdmi().content_protection(2, Some(1)))
            .build();
        let (mut backend, _) = backend(device);
        let connector = backend.device().connector_handle(0);
        assert_eq!(backend.head(connector).unwrap().protection(), HdcpProtection::Type1);

        let id = enable(&mut backend, 0);
        backend.take_events();
        backend.repaint_output(id, &[]).unwrap();
        backend.repaint_flush().unwrap();

        let commits = atomic_commits(&backend);
        assert_eq!(commits[0].1.value(connector, prop(CONN_PROTECTION)), Some(0));
        assert_eq!(backend.head(connector).unwrap().protection(), HdcpProtection::Disabled);
        assert_eq!(
            backend.take_events(),
            vec![BackendEvent::ContentProtectionChanged {
                connector,
                protection: HdcpProtection::Disabled,
            }]
        );
    }

    #[test]
    fn desired_protection_is_requested() {
        let device = DummyKms::builder()
            .crtcs(1)
            .plane(DummyPlane::primary(0b1))
            .connector(DummyConnector::hdmi().content_protection(0, Some(0)))
            .build();
        let (mut backend, _) = backend(device);
        let connector = backend.device().connector_handle(0);
        let id = enable(&mut backend, 0);
        backend.set_desired_protection(id, HdcpProtection::Type1).unwrap();
        backend.take_events();
        backend.repaint_output(id, &[]).unwrap();
        backend.repaint_flush().unwrap();

        let commits = atomic_commits(&backend);
        assert_eq!(commits[0].1.value(connector, prop(CONN_PROTECTION)), Some(1));
        assert_eq!(commits[0].1.value(connector, prop(CONN_HDCP_TYPE)), Some(1));
        assert!(backend.take_events().is_empty());
    }

    #[test]
    fn legacy_sets_the_mode_once() {
        let (mut backend, _) = backend(DummyKms::simple().legacy().build());
        let id = enable(&mut backend, 0);
        let device_crtc = |pipe| backend.device().crtc_handle(pipe);
        let (unused, crtc) = (device_crtc(0), device_crtc(1));
        let connector = backend.device().connector_handle(0);

        backend.repaint_output(id, &[]).unwrap();
        backend.repaint_flush().unwrap();
        assert_eq!(
            backend.device().take_calls().into_iter().filter(KmsCall::is_commit).collect::<Vec<_>>(),
            vec![
                KmsCall::SetCrtc {
                    crtc: unused,
                    fb: None,
                    connectors: Vec::new(),
                    mode: None,
                },
                KmsCall::SetCrtc {
                    crtc,
                    fb: Some(handle(501)),
                    connectors: vec![connector],
                    mode: Some(test_mode(1920, 1080)),
                },
                KmsCall::PageFlip { crtc, fb: handle(501) },
            ]
        );
        assert!(backend.output(id).unwrap().is_page_flip_pending());
        assert!(!backend.is_state_invalid());

        backend.device().complete_flip(1, 1, Duration::from_millis(16));
        backend.dispatch_kms_events().unwrap();
        backend.repaint_output(id, &[DamageRect::new(0, 0, 10, 10)]).unwrap();
        backend.repaint_flush().unwrap();
        assert_eq!(
            backend.device().take_calls().into_iter().filter(KmsCall::is_commit).collect::<Vec<_>>(),
            vec![KmsCall::PageFlip { crtc, fb: handle(502) }]
        );
    }

    #[test]
    fn legacy_failures_stay_per_output() {
        let (mut backend, _) = backend(
            DummyKms::builder()
                .legacy()
                .crtcs(2)
                .connector(DummyConnector::hdmi())
                .connector(DummyConnector::edp())
                .build(),
        );
        let first = enable(&mut backend, 0);
        let second = enable(&mut backend, 1);
        backend.take_events();
        backend.device().fail_next_commit(libc::EINVAL);

        backend.repaint_begin().unwrap();
        backend.repaint_output(first, &[]).unwrap();
        backend.repaint_output(second, &[]).unwrap();
        backend.repaint_flush().unwrap();

        assert_eq!(
            backend.take_events(),
            vec![BackendEvent::FrameFinished {
                output: first,
                time: None,
                sequence: 0,
                flags: PresentationFlags::INVALID,
            }]
        );
        assert!(!backend.output(first).unwrap().is_page_flip_pending());
        assert!(backend.output(second).unwrap().is_page_flip_pending());
        assert!(backend.is_state_invalid());
    }
}
