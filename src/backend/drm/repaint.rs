//! The repaint cycle and the completion of commits
//!
//! A repaint cycle starts with [`DrmBackend::repaint_begin`], collects the state of every
//! output that needs a new frame with [`DrmBackend::repaint_output`] and ends with
//! [`DrmBackend::repaint_flush`] (or [`DrmBackend::repaint_cancel`]). The kernel reports
//! completion through the device fd, [`DrmBackend::dispatch_kms_events`] turns that into
//! [`BackendEvent::FrameFinished`](super::BackendEvent::FrameFinished).

use std::{mem, time::Duration};

use tracing::{debug, trace, warn};

use super::{
    backend::DrmBackend,
    commit::ApplyMode,
    kms::{DamageRect, KmsDevice, VblankReply},
    output::{PendingIntent, RepaintStatus},
    plane::{PlaneId, PlaneType},
    properties::PlaneProperty,
    render::{Framebuffer, FramebufferOrigin, PresentationFlags, RenderPath},
    state::{DestRect, DpmsLevel, DuplicateMode, OutputState, PendingState, SourceRect},
    Error, OutputId,
};

impl<D: KmsDevice, R: RenderPath> DrmBackend<D, R> {
    /// Opens the transaction of a repaint cycle
    ///
    /// A transaction left over from an earlier cycle is dropped.
    pub fn repaint_begin(&mut self) -> Result<(), Error> {
        if !self.session_active {
            return Err(Error::DeviceInactive);
        }
        if let Some(stale) = self.repaint_data.replace(PendingState::new()) {
            for state in stale.outputs() {
                self.discard_state(state);
            }
        }
        trace!(parent: &self.span, "Repaint cycle started");
        Ok(())
    }

    /// Drops the transaction of the current repaint cycle without touching the hardware
    pub fn repaint_cancel(&mut self) {
        if let Some(pending) = self.repaint_data.take() {
            for state in pending.outputs() {
                self.discard_state(state);
            }
            trace!(parent: &self.span, "Repaint cycle cancelled");
        }
    }

    fn output_state_for_repaint(&mut self, id: OutputId) -> Result<OutputState, Error> {
        if self.repaint_data.is_none() {
            self.repaint_begin()?;
        }
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        let queued = self.repaint_data.as_mut().and_then(|pending| pending.take(id));
        Ok(queued.unwrap_or_else(|| output.state_cur.duplicate(DuplicateMode::ClearPlanes)))
    }

    fn repaintable(&self, id: OutputId) -> Result<(PlaneId, (u16, u16)), Error> {
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        if !output.enabled || matches!(output.intent, PendingIntent::Disable | PendingIntent::Destroy) {
            return Err(Error::OutputDisabled(output.name.clone()));
        }
        if output.commit_in_flight() {
            return Err(Error::CommitInFlight(output.name.clone()));
        }
        let crtc = output
            .crtc()
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        let scanout = output
            .scanout_plane
            .ok_or_else(|| Error::NoPrimaryPlane(output.name.clone(), crtc))?;
        let mode = output.mode.ok_or_else(|| Error::NoMode(output.name.clone()))?;
        Ok((scanout, mode.size()))
    }

    /// Queues the next frame of an output
    ///
    /// Unless a client buffer was put on the primary plane with
    /// [`DrmBackend::assign_client_scanout`], the render path produces the frame. If nothing
    /// changed and the frame on screen came from the render path, it is shown again.
    #[profiling::function]
    pub fn repaint_output(&mut self, id: OutputId, damage: &[DamageRect]) -> Result<(), Error> {
        let (scanout, mode_size) = self.repaintable(id)?;
        let mut state = self.output_state_for_repaint(id)?;
        if let Some(output) = self.outputs.get(&id) {
            state.dpms = DpmsLevel::On;
            state.protection = output.desired_protection;
        }

        if let Err(err) = self.render_scanout(id, &mut state, scanout, mode_size, damage) {
            self.discard_state(&state);
            return Err(err);
        }

        if let Some(pending) = self.repaint_data.as_mut() {
            pending.insert(state);
        }
        Ok(())
    }

    fn render_scanout(
        &mut self,
        id: OutputId,
        state: &mut OutputState,
        scanout: PlaneId,
        mode_size: (u16, u16),
        damage: &[DamageRect],
    ) -> Result<(), Error> {
        let fb = match state.plane(scanout).and_then(|ps| ps.fb) {
            Some(fb) => fb,
            None => {
                let full_size = (u32::from(mode_size.0), u32::from(mode_size.1));
                let unchanged = damage
                    .is_empty()
                    .then(|| self.planes.get(scanout).and_then(|plane| plane.state().fb))
                    .flatten()
                    .filter(|fb| fb.origin == FramebufferOrigin::Renderer && fb.size == full_size);
                match unchanged {
                    Some(fb) => {
                        trace!(?id, "No damage, reusing the framebuffer on screen");
                        fb
                    }
                    None => self
                        .renderer
                        .render(id, damage)
                        .map_err(|err| Error::Render(Box::new(err)))?,
                }
            }
        };

        let ps = state.plane_mut(scanout);
        ps.set_fullscreen(id, fb, mode_size);
        if let Some(old) = ps.damage_blob.take() {
            if let Err(err) = self.device.destroy_blob(old) {
                debug!(blob = old, "Failed to destroy damage blob: {}", err);
            }
        }

        let has_damage_clips = self
            .planes
            .get(scanout)
            .map_or(false, |plane| plane.props().has(PlaneProperty::FbDamageClips));
        if has_damage_clips && !damage.is_empty() {
            let blob = self.device.create_damage_blob(damage)?;
            state.plane_mut(scanout).damage_blob = Some(blob);
        }
        Ok(())
    }

    /// Scans out a client buffer directly on the primary plane in this repaint cycle
    ///
    /// Fails if the plane cannot scan out the buffer's format and modifier, the compositor
    /// then has to composite the buffer instead.
    pub fn assign_client_scanout(&mut self, id: OutputId, fb: Framebuffer) -> Result<(), Error> {
        let (scanout, mode_size) = self.repaintable(id)?;
        let supported = self
            .planes
            .get(scanout)
            .map_or(false, |plane| plane.supports(fb.format, fb.modifier));
        if !supported {
            return Err(Error::UnsupportedFormat(format!("{:?} ({:?})", fb.format, fb.modifier)));
        }

        let mut state = self.output_state_for_repaint(id)?;
        state.plane_mut(scanout).set_fullscreen(id, fb, mode_size);
        trace!(?id, fb = ?fb.handle, "Promoted client buffer to scanout");
        if let Some(pending) = self.repaint_data.as_mut() {
            pending.insert(state);
        }
        Ok(())
    }

    /// Shows a client buffer on an overlay or cursor plane in this repaint cycle
    ///
    /// Cursor planes are only usable by the output that reserved them, overlays by any output
    /// they are free for. The plane has to support the buffer's format and modifier. `zpos`
    /// has to lie in the plane's range and above the primary plane; without it the plane takes
    /// the lowest position of its range. Only atomic KMS drives these planes.
    pub fn assign_plane(
        &mut self,
        id: OutputId,
        plane: PlaneId,
        fb: Framebuffer,
        src: SourceRect,
        dst: DestRect,
        zpos: Option<u64>,
    ) -> Result<(), Error> {
        let (scanout, _) = self.repaintable(id)?;
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        let unavailable = || Error::PlaneUnavailable {
            plane,
            output: output.name.clone(),
        };
        let pipe = output
            .pipe()
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        let candidate = self.planes.get(plane).ok_or_else(unavailable)?;

        let usable = self.caps.atomic
            && !candidate.is_pseudo()
            && match candidate.kind() {
                PlaneType::Cursor => output.cursor_plane == Some(plane),
                PlaneType::Overlay => !self.overlays_disabled && candidate.is_available(id, pipe),
                PlaneType::Primary => false,
            };
        let taken_this_cycle = self.repaint_data.as_ref().map_or(false, |pending| {
            pending
                .outputs()
                .iter()
                .filter(|state| state.output != id)
                .any(|state| state.plane(plane).map_or(false, |ps| ps.output.is_some()))
        });
        if !usable || taken_this_cycle {
            return Err(unavailable());
        }
        if !candidate.supports(fb.format, fb.modifier) {
            return Err(Error::UnsupportedFormat(format!("{:?} ({:?})", fb.format, fb.modifier)));
        }

        let zpos = match (candidate.zpos_range(), zpos) {
            (Some((min, max)), Some(zpos)) if (min..=max).contains(&zpos) => Some(zpos),
            (_, Some(zpos)) => return Err(Error::ZposOutOfRange { plane, zpos }),
            (range, None) => range.map(|(min, _)| min),
        };
        let floor = self.planes.get(scanout).and_then(|primary| primary.zpos_range());
        if let (Some(zpos), Some((_, primary_max))) = (zpos, floor) {
            if zpos <= primary_max {
                return Err(Error::ZposOutOfRange { plane, zpos });
            }
        }

        let mut state = self.output_state_for_repaint(id)?;
        let ps = state.plane_mut(plane);
        ps.output = Some(id);
        ps.fb = Some(fb);
        ps.src = src;
        ps.dst = dst;
        ps.zpos = zpos;
        trace!(?id, ?plane, fb = ?fb.handle, ?zpos, "Assigned buffer to plane");
        if let Some(pending) = self.repaint_data.as_mut() {
            pending.insert(state);
        }
        Ok(())
    }

    /// Commits the transaction of the current repaint cycle
    ///
    /// Outputs whose state was rejected get a frame marked invalid so the compositor keeps
    /// repainting. Only losing the display is reported as an error.
    #[profiling::function]
    pub fn repaint_flush(&mut self) -> Result<(), Error> {
        let Some(pending) = self.repaint_data.take() else {
            return Ok(());
        };
        let ids: Vec<OutputId> = pending.outputs().iter().map(|state| state.output).collect();
        let report = self.apply(pending, ApplyMode::Async);

        for id in ids {
            if report.failed.contains(&id) {
                self.finish_frame(id, None, PresentationFlags::INVALID);
            } else if let Some(output) = self.outputs.get_mut(&id) {
                if output.commit_in_flight() {
                    output.repaint_status = RepaintStatus::AwaitingCompletion;
                }
            }
        }

        match report.error {
            Some(err) if err.is_permission_denied() => {
                warn!(parent: &self.span, "Lost access to the display: {}", err);
                self.session_active = false;
                Err(err)
            }
            Some(err) => {
                debug!(parent: &self.span, failed = ?report.failed, "Repaint partially failed: {}", err);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Starts the repaint loop of an idle output
    ///
    /// The compositor needs a vblank timestamp to schedule the first frame. If the last vblank
    /// is recent enough it is reported right away, otherwise the current state is committed
    /// again and its completion provides the timestamp.
    pub fn start_repaint_loop(&mut self, id: OutputId) -> Result<(), Error> {
        if !self.session_active {
            return Err(Error::DeviceInactive);
        }
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        if matches!(output.intent, PendingIntent::Disable | PendingIntent::Destroy) {
            return Ok(());
        }
        if output.commit_in_flight() {
            debug!(?id, "Commit in flight, its completion restarts the repaint loop");
            return Ok(());
        }
        let pipe = output
            .pipe()
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        let on_screen = output
            .scanout_plane
            .and_then(|plane| self.planes.get(plane))
            .map_or(false, |plane| plane.state().fb.is_some());
        if !on_screen || self.state_invalid {
            self.finish_frame(id, None, PresentationFlags::INVALID);
            return Ok(());
        }

        let refresh = output.refresh_interval();
        match self.device.wait_vblank(pipe) {
            Ok(VblankReply {
                sequence,
                time: Some(vblank),
            }) => {
                let age = self.now().saturating_sub(vblank);
                if refresh.map_or(false, |refresh| age < refresh) {
                    if let Some(output) = self.outputs.get_mut(&id) {
                        output.update_msc(sequence);
                    }
                    self.finish_frame(id, Some(vblank), PresentationFlags::INVALID);
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(err) => debug!(?id, "Vblank query failed: {}", err),
        }

        let Some(output) = self.outputs.get(&id) else {
            return Ok(());
        };
        let mut pending = PendingState::new();
        pending.insert(output.state_cur.duplicate(DuplicateMode::PreservePlanes));
        let report = self.apply(pending, ApplyMode::Async);
        match report.error {
            None => {
                if let Some(output) = self.outputs.get_mut(&id) {
                    output.repaint_status = RepaintStatus::AwaitingCompletion;
                }
                Ok(())
            }
            Some(err) if err.is_permission_denied() => {
                self.session_active = false;
                Err(err)
            }
            Some(err) => {
                warn!(?id, "Applying repaint-start state failed: {}", err);
                self.finish_frame(id, None, PresentationFlags::INVALID);
                Ok(())
            }
        }
    }

    /// Changes the power level of an output
    ///
    /// Turning an output on goes through a repaint cycle. Turning it off while a commit is
    /// in flight is deferred until that commit completes.
    pub fn set_dpms(&mut self, id: OutputId, level: DpmsLevel) -> Result<(), Error> {
        let output = self.outputs.get_mut(&id).ok_or(Error::UnknownOutput(id))?;
        if !output.enabled {
            return Ok(());
        }
        if level == DpmsLevel::On && output.intent == PendingIntent::DpmsOff {
            debug!(output = %output.name, "Cancelling deferred power-off");
            output.intent = PendingIntent::None;
            return Ok(());
        }
        if output.state_cur.dpms == level {
            return Ok(());
        }

        let in_flight = output.commit_in_flight();
        if self.repaint_data.is_some() && !in_flight {
            // the repaint state already turns the output on
            if level == DpmsLevel::On {
                return Ok(());
            }
            let disable = output.state_cur.disable();
            if let Some(stale) = self.repaint_data.as_mut().and_then(|pending| pending.take(id)) {
                self.discard_state(&stale);
            }
            if let Some(pending) = self.repaint_data.as_mut() {
                pending.insert(disable);
            }
            return Ok(());
        }

        if level == DpmsLevel::On {
            self.push_repaint(id);
            return Ok(());
        }
        if in_flight {
            debug!(output = %output.name, "Commit in flight, deferring power-off");
            output.intent.escalate(PendingIntent::DpmsOff);
            return Ok(());
        }

        let mut pending = PendingState::new();
        pending.insert(output.state_cur.disable());
        self.apply_sync(pending)
    }

    /// Reacts to the completion of an output's commit
    pub(crate) fn update_complete(&mut self, id: OutputId, flags: PresentationFlags, time: Duration) {
        self.watchdog.disarm(id);
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        output.state_cur.mark_complete();
        let planes: Vec<PlaneId> = output.state_cur.planes.iter().map(|ps| ps.plane).collect();
        let last = output.state_last.take();
        let intent = mem::take(&mut output.intent);

        for plane in planes {
            if let Some(plane) = self.planes.get_mut(plane) {
                plane.state.complete = true;
            }
        }
        if let Some(last) = last {
            self.discard_state(&last);
        }

        match intent {
            PendingIntent::Destroy => {
                debug!(parent: &self.span, ?id, "Running deferred destruction");
                self.remove_output(id);
                return;
            }
            PendingIntent::Disable => {
                debug!(parent: &self.span, ?id, "Running deferred disable");
                self.shutdown_output(id);
                return;
            }
            PendingIntent::DpmsOff => {
                debug!(parent: &self.span, ?id, "Running deferred power-off");
                if let Some(output) = self.outputs.get(&id) {
                    let mut pending = PendingState::new();
                    pending.insert(output.state_cur.disable());
                    if let Err(err) = self.apply_sync(pending) {
                        warn!(?id, "Failed to turn output off: {}", err);
                    }
                }
            }
            PendingIntent::None => {}
        }

        let Some(output) = self.outputs.get(&id) else {
            return;
        };
        // a power-off outside of a repaint cycle must not finish a frame nobody asked for
        if output.state_cur.dpms == DpmsLevel::Off && output.repaint_status != RepaintStatus::AwaitingCompletion {
            return;
        }

        let zero_copy = output
            .scanout_plane
            .and_then(|plane| output.state_cur.plane(plane))
            .and_then(|ps| ps.fb)
            .map_or(false, |fb| fb.origin == FramebufferOrigin::Client);
        let recorder = output.recorder_attached;
        let flags = if zero_copy {
            flags | PresentationFlags::ZERO_COPY
        } else {
            flags
        };
        self.finish_frame(id, Some(time), flags);

        if recorder {
            self.push_repaint(id);
        }
    }

    /// Handles the completion events the kernel queued on the device
    ///
    /// Call this whenever the device fd becomes readable, see
    /// [`DrmNotifier`](super::DrmNotifier).
    #[profiling::function]
    pub fn dispatch_kms_events(&mut self) -> Result<(), Error> {
        let atomic = self.caps.atomic;
        for event in self.device.receive_events()? {
            let Some(output) = self
                .outputs
                .values_mut()
                .find(|output| output.enabled && output.crtc() == Some(event.crtc))
            else {
                debug!(parent: &self.span, crtc = ?event.crtc, "Completion for a crtc without output, ignoring");
                continue;
            };
            let id = output.id;
            output.update_msc(event.sequence);

            let pending = if atomic {
                mem::replace(&mut output.atomic_complete_pending, false)
            } else {
                mem::replace(&mut output.page_flip_pending, false)
            };
            if !pending {
                warn!(parent: &self.span, ?id, "Unexpected completion event");
            }

            self.update_complete(
                id,
                PresentationFlags::VSYNC | PresentationFlags::HW_COMPLETION | PresentationFlags::HW_CLOCK,
                event.time,
            );
        }
        Ok(())
    }
}
