//! The backend object owning every resource of one DRM device
//!
//! [`DrmBackend`] ties the pieces of this module together. It discovers planes and heads when
//! created, hands CRTCs and planes to outputs as they are enabled and takes them back when they
//! are disabled. Repaints and their completion live in `repaint.rs`, kernel commits in
//! `commit.rs` and reactions to hotplug events in `hotplug.rs`.

use std::{collections::HashMap, fmt, mem, time::Duration};

use drm::control::{connector, crtc, Mode, ModeTypeFlags};
use drm_fourcc::{DrmFourcc, DrmModifier};
use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{
    config::DrmBackendConfig,
    crtc::{pick_crtc, CrtcPool, CrtcRequest, HeadRouting},
    head::{HdcpProtection, Head, MAX_CLONED_CONNECTORS},
    kms::{KmsCapabilities, KmsDevice, ResourceTable},
    output::{DisableOutcome, DrmOutput, OutputCrtc, PendingIntent, RepaintStatus},
    plane::{PlaneId, PlaneManager, PlaneType},
    properties::{ConnectorProperty, CrtcProperty, PropertyTable},
    render::{PresentationFlags, RenderPath},
    state::{DpmsLevel, OutputState, PendingState},
    watchdog::{NoWatchdog, PageflipWatchdog},
    Error, OutputId,
};
use crate::backend::backlight::Backlight;

/// Notifications for the compositor, drained with [`DrmBackend::take_events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A frame reached the display, or was dropped if `flags` contains
    /// [`PresentationFlags::INVALID`]
    FrameFinished {
        /// The output
        output: OutputId,
        /// Presentation time, `None` if nothing better than a guess is known
        time: Option<Duration>,
        /// Media stream counter of the frame
        sequence: u64,
        /// How the frame was presented
        flags: PresentationFlags,
    },
    /// The output has to be repainted, e.g. after a mode-set or a session switch
    RepaintNeeded {
        /// The output
        output: OutputId,
    },
    /// Heads appeared, disappeared or changed their connection state
    HeadsChanged,
    /// The content protection in effect on a head changed
    ContentProtectionChanged {
        /// Connector of the head
        connector: connector::Handle,
        /// Protection now in effect
        protection: HdcpProtection,
    },
}

/// Display pipeline of one DRM device
pub struct DrmBackend<D: KmsDevice, R: RenderPath> {
    pub(crate) device: D,
    pub(crate) renderer: R,
    pub(crate) config: DrmBackendConfig,
    pub(crate) caps: KmsCapabilities,
    pub(crate) resources: ResourceTable,
    pub(crate) planes: PlaneManager,
    pub(crate) crtcs: CrtcPool,
    pub(crate) crtc_props: HashMap<crtc::Handle, PropertyTable<CrtcProperty>>,
    pub(crate) heads: Vec<Head>,
    pub(crate) outputs: IndexMap<OutputId, DrmOutput>,
    next_output_id: u32,
    pub(crate) state_invalid: bool,
    pub(crate) session_active: bool,
    pub(crate) repaint_data: Option<PendingState>,
    pub(crate) watchdog: Box<dyn PageflipWatchdog>,
    pub(crate) cursors_disabled: bool,
    pub(crate) overlays_disabled: bool,
    pub(crate) sysnum: Option<u32>,
    pub(crate) events: Vec<BackendEvent>,
    pub(crate) span: tracing::Span,
}

impl<D: KmsDevice, R: RenderPath> fmt::Debug for DrmBackend<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmBackend")
            .field("caps", &self.caps)
            .field("resources", &self.resources)
            .field("planes", &self.planes)
            .field("crtcs", &self.crtcs)
            .field("heads", &self.heads)
            .field("outputs", &self.outputs)
            .field("state_invalid", &self.state_invalid)
            .field("session_active", &self.session_active)
            .field("sysnum", &self.sysnum)
            .finish_non_exhaustive()
    }
}

/// Kernel number of a `/dev/dri/cardN` node
pub(crate) fn card_sysnum(path: &std::path::Path) -> Option<u32> {
    path.file_name()?.to_str()?.strip_prefix("card")?.parse().ok()
}

impl<D: KmsDevice, R: RenderPath> DrmBackend<D, R> {
    /// Takes over a device
    ///
    /// Discovers planes, CRTCs and heads. No output exists afterwards, create them with
    /// [`DrmBackend::create_output_for_head`] or [`DrmBackend::create_output`].
    pub fn new(device: D, renderer: R, config: DrmBackendConfig) -> Result<Self, Error> {
        let path = device.device_path();
        let span = info_span!("drm_backend", device = ?path);
        let _guard = span.enter();

        let mut caps = device.capabilities();
        if config.force_legacy {
            caps.atomic = false;
        }
        info!(
            atomic = caps.atomic,
            universal_planes = caps.universal_planes,
            "Using {} mode-setting",
            if caps.atomic { "atomic" } else { "legacy" }
        );

        let resources = device.resources()?;
        if !resources.is_kms_capable() {
            return Err(Error::NotKmsCapable(path));
        }

        let mut planes = PlaneManager::new(caps.universal_planes);
        planes.discover(&device, &resources)?;

        let mut crtc_props = HashMap::new();
        for crtc in &resources.crtcs {
            crtc_props.insert(*crtc, PropertyTable::fetch(&device, *crtc)?);
        }

        let mut heads = Vec::new();
        for connector in &resources.connectors {
            match Head::create(&device, *connector) {
                Ok(head) => heads.push(head),
                Err(err) => warn!(?connector, "Failed to read connector: {}", err),
            }
        }

        drop(_guard);
        Ok(DrmBackend {
            sysnum: path.as_deref().and_then(card_sysnum),
            crtcs: CrtcPool::new(&resources.crtcs),
            cursors_disabled: config.disable_cursor_planes,
            overlays_disabled: config.disable_overlay_planes,
            device,
            renderer,
            config,
            caps,
            resources,
            planes,
            crtc_props,
            heads,
            outputs: IndexMap::new(),
            next_output_id: 1,
            state_invalid: true,
            session_active: true,
            repaint_data: None,
            watchdog: Box::new(NoWatchdog),
            events: Vec::new(),
            span,
        })
    }

    /// Installs the pageflip watchdog
    pub fn set_watchdog(&mut self, watchdog: impl PageflipWatchdog + 'static) {
        self.watchdog = Box::new(watchdog);
    }

    /// Drains the queued notifications
    pub fn take_events(&mut self) -> Vec<BackendEvent> {
        mem::take(&mut self.events)
    }

    /// The kernel interface
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The render path
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// The render path
    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Configuration the backend was created with
    pub fn config(&self) -> &DrmBackendConfig {
        &self.config
    }

    /// Negotiated kernel capabilities
    pub fn capabilities(&self) -> KmsCapabilities {
        self.caps
    }

    /// The resource table as of the last refresh
    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    /// All planes
    pub fn planes(&self) -> &PlaneManager {
        &self.planes
    }

    /// CRTCs not driven by any output
    pub fn crtc_pool(&self) -> &CrtcPool {
        &self.crtcs
    }

    /// All heads of the device
    pub fn heads(&self) -> &[Head] {
        &self.heads
    }

    /// Looks up a head
    pub fn head(&self, connector: connector::Handle) -> Option<&Head> {
        self.heads.iter().find(|head| head.connector() == connector)
    }

    pub(crate) fn head_mut(&mut self, connector: connector::Handle) -> Option<&mut Head> {
        self.heads.iter_mut().find(|head| head.connector() == connector)
    }

    /// All outputs in creation order
    pub fn outputs(&self) -> impl Iterator<Item = &DrmOutput> {
        self.outputs.values()
    }

    /// Looks up an output
    pub fn output(&self, id: OutputId) -> Option<&DrmOutput> {
        self.outputs.get(&id)
    }

    pub(crate) fn output_mut(&mut self, id: OutputId) -> Result<&mut DrmOutput, Error> {
        self.outputs.get_mut(&id).ok_or(Error::UnknownOutput(id))
    }

    /// The next commit resets every resource no enabled output uses
    pub fn is_state_invalid(&self) -> bool {
        self.state_invalid
    }

    /// Whether this process currently owns the display
    pub fn is_session_active(&self) -> bool {
        self.session_active
    }

    pub(crate) fn drives_head(&self, output: Option<OutputId>) -> bool {
        output
            .and_then(|id| self.outputs.get(&id))
            .map_or(false, |output| output.enabled)
    }

    pub(crate) fn push_repaint(&mut self, output: OutputId) {
        self.events.push(BackendEvent::RepaintNeeded { output });
    }

    /// Creates an output without heads
    pub fn create_output(&mut self, name: impl Into<String>) -> OutputId {
        let id = OutputId(self.next_output_id);
        self.next_output_id += 1;
        let name = name.into();
        debug!(parent: &self.span, ?id, output = %name, "Created output");
        self.outputs.insert(id, DrmOutput::new(id, name, self.config.format));
        id
    }

    /// Creates an output named after a head and attaches the head to it
    pub fn create_output_for_head(&mut self, connector: connector::Handle) -> Result<OutputId, Error> {
        let head = self.head(connector).ok_or(Error::UnknownConnector(connector))?;
        if let Some(output) = head.output() {
            return Err(Error::HeadAlreadyAttached { connector, output });
        }
        let name = head.name().to_string();
        let id = self.create_output(name);
        self.attach_head(id, connector)?;
        Ok(id)
    }

    /// Adds a head to an output as a clone
    pub fn attach_head(&mut self, id: OutputId, connector: connector::Handle) -> Result<(), Error> {
        if !self.outputs.contains_key(&id) {
            return Err(Error::UnknownOutput(id));
        }
        let head = self.head(connector).ok_or(Error::UnknownConnector(connector))?;
        match head.output() {
            Some(output) if output == id => return Ok(()),
            Some(output) => return Err(Error::HeadAlreadyAttached { connector, output }),
            None => {}
        }

        let output = self.output_mut(id)?;
        if output.heads.len() >= MAX_CLONED_CONNECTORS {
            return Err(Error::TooManyHeads {
                output: output.name.clone(),
                limit: MAX_CLONED_CONNECTORS,
            });
        }
        output.heads.push(connector);
        let enabled = output.enabled;
        if let Some(head) = self.head_mut(connector) {
            head.output = Some(id);
        }
        debug!(parent: &self.span, ?id, ?connector, "Attached head");

        if enabled {
            self.state_invalid = true;
            self.push_repaint(id);
        }
        Ok(())
    }

    /// Removes a head from whatever output it is attached to
    pub fn detach_head(&mut self, connector: connector::Handle) -> Result<(), Error> {
        let head = self.head_mut(connector).ok_or(Error::UnknownConnector(connector))?;
        let Some(id) = head.output.take() else {
            return Ok(());
        };

        let Some(output) = self.outputs.get_mut(&id) else {
            return Ok(());
        };
        output.heads.retain(|c| *c != connector);
        let enabled = output.enabled;
        debug!(parent: &self.span, ?id, ?connector, "Detached head");

        if enabled {
            self.state_invalid = true;
            self.push_repaint(id);
        }
        Ok(())
    }

    /// Selects the mode of an output
    ///
    /// Every head of the output has to support the mode. On an enabled output the change takes
    /// effect with the next repaint, which will need a full mode-set.
    pub fn switch_mode(&mut self, id: OutputId, mode: Mode) -> Result<(), Error> {
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        let suitable = !output.heads.is_empty()
            && output
                .heads
                .iter()
                .all(|c| self.head(*c).map_or(false, |head| head.modes().contains(&mode)));
        if !suitable {
            return Err(Error::ModeNotSuitable(mode));
        }
        if output.mode == Some(mode) {
            return Ok(());
        }

        let output = self.output_mut(id)?;
        output.mode = Some(mode);
        let (enabled, format) = (output.enabled, output.format);
        info!(parent: &self.span, ?id, ?mode, "Switching mode");

        if enabled {
            self.state_invalid = true;
            self.renderer.fini_output(id);
            self.renderer
                .init_output(id, mode.size(), format)
                .map_err(|err| Error::Render(Box::new(err)))?;
            self.push_repaint(id);
        }
        Ok(())
    }

    /// Sets the pixel format of an output's primary plane, used from the next enable on
    pub fn set_format(&mut self, id: OutputId, format: DrmFourcc) -> Result<(), Error> {
        self.output_mut(id)?.format = format;
        Ok(())
    }

    /// Sets the content protection the output asks for with each commit
    pub fn set_desired_protection(&mut self, id: OutputId, protection: HdcpProtection) -> Result<(), Error> {
        self.output_mut(id)?.desired_protection = protection;
        Ok(())
    }

    /// Marks an output as being captured by a hardware recorder, which repaints continuously
    pub fn set_recorder_attached(&mut self, id: OutputId, attached: bool) -> Result<(), Error> {
        self.output_mut(id)?.recorder_attached = attached;
        Ok(())
    }

    fn choose_mode(&self, output: &DrmOutput) -> Result<Mode, Error> {
        if let Some(mode) = output.mode {
            return Ok(mode);
        }
        let head = output
            .heads
            .first()
            .and_then(|c| self.head(*c))
            .ok_or_else(|| Error::NoHeads(output.name.clone()))?;
        let modes = head.modes();

        if let Some(inherited) = head.inherited_mode().filter(|mode| modes.contains(mode)) {
            return Ok(inherited);
        }
        modes
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| modes.first())
            .copied()
            .ok_or_else(|| Error::NoMode(output.name.clone()))
    }

    /// Reserves hardware for an output and prepares its render path
    ///
    /// The first repaint afterwards performs a full mode-set.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn enable_output(&mut self, id: OutputId) -> Result<(), Error> {
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        if output.enabled {
            return Ok(());
        }
        if output.heads.is_empty() {
            return Err(Error::NoHeads(output.name.clone()));
        }
        let name = output.name.clone();
        let format = output.format;
        let connectors = output.heads.clone();
        let mode = self.choose_mode(output)?;

        self.resources = self.device.resources()?;
        let routing: Vec<HeadRouting> = connectors
            .iter()
            .filter_map(|c| self.head(*c))
            .map(Head::routing)
            .collect();
        let in_use: Vec<crtc::Handle> = self
            .outputs
            .values()
            .filter(|o| o.enabled && o.id != id)
            .filter_map(DrmOutput::crtc)
            .collect();
        let reserved_for_disabled: Vec<crtc::Handle> = self
            .heads
            .iter()
            .filter(|head| !connectors.contains(&head.connector()) && !self.drives_head(head.output()))
            .filter_map(Head::inherited_crtc)
            .collect();
        let pipe = pick_crtc(
            &self.resources.crtcs,
            &CrtcRequest {
                heads: &routing,
                in_use: &in_use,
                reserved_for_disabled: &reserved_for_disabled,
            },
        )
        .ok_or_else(|| Error::NoCrtcAvailable(name.clone()))?;
        let crtc = self.resources.crtcs[pipe];

        let gamma_size = self.device.crtc(crtc)?.gamma_length;
        let props = match self.crtc_props.get(&crtc) {
            Some(props) => props.clone(),
            None => {
                let props = PropertyTable::fetch(&self.device, crtc)?;
                self.crtc_props.insert(crtc, props.clone());
                props
            }
        };

        let scanout = if self.planes.has_universal_planes() {
            self.planes
                .find_available(id, pipe, crtc, PlaneType::Primary)
                .ok_or_else(|| Error::NoPrimaryPlane(name.clone(), crtc))?
        } else {
            self.planes.synthesize(id, pipe, PlaneType::Primary, format)
        };
        if !self
            .planes
            .get(scanout)
            .map_or(false, |plane| plane.supports(format, DrmModifier::Invalid))
        {
            self.planes.release(scanout);
            return Err(Error::UnsupportedFormat(format!("{:?}", format)));
        }

        let cursor = if self.cursors_disabled {
            None
        } else if self.planes.has_universal_planes() {
            let cursor = self.planes.find_available(id, pipe, crtc, PlaneType::Cursor);
            if cursor.is_none() {
                debug!(output = %name, "No cursor plane available, cursors will be composited");
            }
            cursor
        } else {
            Some(self.planes.synthesize(id, pipe, PlaneType::Cursor, DrmFourcc::Argb8888))
        };

        self.crtcs.reserve(crtc);
        if let Err(err) = self.renderer.init_output(id, mode.size(), format) {
            self.planes.release(scanout);
            if let Some(cursor) = cursor {
                self.planes.release(cursor);
            }
            self.crtcs.release(crtc);
            return Err(Error::Render(Box::new(err)));
        }

        let backlight_level = connectors
            .iter()
            .filter_map(|c| self.head(*c))
            .find_map(Head::backlight)
            .and_then(|backlight| normalized_brightness(backlight));

        let output = self.output_mut(id)?;
        output.enabled = true;
        output.crtc = Some(OutputCrtc {
            handle: crtc,
            pipe,
            gamma_size,
            props,
        });
        output.scanout_plane = Some(scanout);
        output.cursor_plane = cursor;
        output.mode = Some(mode);
        output.state_cur = OutputState::new(id);
        output.repaint_status = RepaintStatus::Idle;
        output.intent = PendingIntent::None;
        output.backlight_level = backlight_level;

        self.state_invalid = true;
        info!(output = %name, ?crtc, pipe, ?mode, "Enabled output");
        self.push_repaint(id);
        Ok(())
    }

    /// Turns an output off and releases its hardware
    ///
    /// If a commit is still in flight the output is disabled once it completes.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn disable_output(&mut self, id: OutputId) -> Result<DisableOutcome, Error> {
        let output = self.output_mut(id)?;
        if !output.enabled {
            return Ok(DisableOutcome::Done);
        }
        if output.commit_in_flight() {
            debug!(output = %output.name, "Commit in flight, deferring disable");
            output.intent.escalate(PendingIntent::Disable);
            return Ok(DisableOutcome::Deferred);
        }
        self.shutdown_output(id);
        Ok(DisableOutcome::Done)
    }

    /// Disables an output and forgets about it
    ///
    /// Its heads become free to be attached elsewhere.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn destroy_output(&mut self, id: OutputId) -> Result<DisableOutcome, Error> {
        let output = self.output_mut(id)?;
        if output.enabled && output.commit_in_flight() {
            debug!(output = %output.name, "Commit in flight, deferring destruction");
            output.intent.escalate(PendingIntent::Destroy);
            return Ok(DisableOutcome::Deferred);
        }
        self.remove_output(id);
        Ok(DisableOutcome::Done)
    }

    pub(crate) fn remove_output(&mut self, id: OutputId) {
        self.shutdown_output(id);
        if let Some(output) = self.outputs.shift_remove(&id) {
            for connector in &output.heads {
                if let Some(head) = self.head_mut(*connector) {
                    head.output = None;
                }
            }
            debug!(parent: &self.span, ?id, "Destroyed output");
        }
    }

    /// Turns the display off if it is on, then releases the output's hardware
    pub(crate) fn shutdown_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get(&id) else {
            return;
        };
        if !output.enabled {
            return;
        }

        if !self.state_invalid && self.session_active && output.state_cur.dpms == DpmsLevel::On {
            let mut pending = PendingState::new();
            pending.insert(output.state_cur.disable());
            if let Err(err) = self.apply_sync(pending) {
                warn!(parent: &self.span, ?id, "Failed to turn output off: {}", err);
            }
        }
        self.deinit_output(id);
    }

    fn deinit_output(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if !output.enabled {
            return;
        }

        output.enabled = false;
        let crtc = output.crtc.take();
        let scanout = output.scanout_plane.take();
        let cursor = output.cursor_plane.take();
        let mode_blob = output.mode_blob.take();
        let stale_cur = mem::replace(&mut output.state_cur, OutputState::new(id));
        let stale_last = output.state_last.take();
        output.page_flip_pending = false;
        output.atomic_complete_pending = false;
        output.repaint_status = RepaintStatus::Idle;
        output.backlight_level = None;
        let name = output.name.clone();

        self.renderer.fini_output(id);
        if let (Some(crtc), Some(_)) = (&crtc, cursor) {
            if !self.planes.has_universal_planes() && self.session_active {
                if let Err(err) = self.device.disable_cursor(crtc.handle) {
                    debug!(crtc = ?crtc.handle, "Failed to disable cursor: {}", err);
                }
            }
        }
        for plane in scanout.into_iter().chain(cursor) {
            self.planes.release(plane);
        }
        if let Some(crtc) = &crtc {
            self.crtcs.release(crtc.handle);
        }
        self.state_invalid = true;

        if let Some((_, blob)) = mode_blob {
            if let Err(err) = self.device.destroy_blob(blob) {
                debug!(blob, "Failed to destroy mode blob: {}", err);
            }
        }
        self.discard_state(&stale_cur);
        if let Some(state) = stale_last {
            self.discard_state(&state);
        }
        if let Some(state) = self.repaint_data.as_mut().and_then(|pending| pending.take(id)) {
            self.discard_state(&state);
        }
        self.watchdog.disarm(id);
        info!(parent: &self.span, output = %name, "Disabled output");
    }

    /// Restarts the render path of an output after its state was lost
    pub(crate) fn reinit_render_path(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get(&id) else {
            return;
        };
        let (Some(mode), format) = (output.mode, output.format) else {
            return;
        };
        self.renderer.fini_output(id);
        if let Err(err) = self.renderer.init_output(id, mode.size(), format) {
            warn!(parent: &self.span, ?id, "Failed to re-initialize render path: {}", err);
        }
    }

    /// Uploads a gamma ramp for an enabled output
    pub fn set_gamma(&mut self, id: OutputId, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), Error> {
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        let crtc = output
            .crtc
            .as_ref()
            .ok_or_else(|| Error::OutputDisabled(output.name.clone()))?;
        for ramp in [red, green, blue] {
            if ramp.len() != crtc.gamma_size as usize {
                return Err(Error::GammaSizeMismatch {
                    expected: crtc.gamma_size,
                    got: ramp.len(),
                });
            }
        }
        self.device.set_gamma(crtc.handle, red, green, blue)
    }

    /// Sets the backlight of an output, `level` ranges from 0 to 255
    ///
    /// The backlight of the first head that has one is used. Outputs without a backlight
    /// ignore the request.
    pub fn set_backlight(&mut self, id: OutputId, level: u32) -> Result<(), Error> {
        let output = self.outputs.get(&id).ok_or(Error::UnknownOutput(id))?;
        if !output.enabled {
            return Err(Error::OutputDisabled(output.name.clone()));
        }
        let level = level.min(255);
        let connectors = output.heads.clone();

        for connector in connectors {
            let Some(backlight) = self.head_mut(connector).and_then(Head::backlight_mut) else {
                continue;
            };
            let max = backlight.max_brightness().map_err(Error::Backlight)?;
            let value = (u64::from(level) * u64::from(max) / 255) as u32;
            backlight.set_brightness(value).map_err(Error::Backlight)?;
            trace!(?id, level, value, "Set backlight");
            self.output_mut(id)?.backlight_level = Some(level);
            return Ok(());
        }
        debug!(?id, "Output has no backlight");
        Ok(())
    }

    /// Gives a head a backlight, or takes it away
    pub fn set_head_backlight(
        &mut self,
        connector: connector::Handle,
        backlight: Option<Box<dyn Backlight>>,
    ) -> Result<(), Error> {
        self.head_mut(connector)
            .ok_or(Error::UnknownConnector(connector))?
            .set_backlight(backlight);
        Ok(())
    }

    /// Raw EDID of the monitor on a head, for an external parser
    pub fn head_edid(&self, connector: connector::Handle) -> Result<Option<Vec<u8>>, Error> {
        if self.head(connector).is_none() {
            return Err(Error::UnknownConnector(connector));
        }
        let props = PropertyTable::<ConnectorProperty>::fetch(&self.device, connector)?;
        match props.value(ConnectorProperty::Edid).filter(|blob| *blob != 0) {
            Some(blob) => self.device.property_blob(blob).map(Some),
            None => Ok(None),
        }
    }

    /// Stops using cursor planes for outputs enabled from now on
    pub fn set_cursor_planes_disabled(&mut self, disabled: bool) {
        self.cursors_disabled = disabled;
    }

    /// Stops offering overlay planes, ignored on legacy KMS
    pub fn set_overlay_planes_disabled(&mut self, disabled: bool) {
        if !self.caps.atomic {
            debug!(parent: &self.span, "Overlay planes are not used on legacy KMS, ignoring toggle");
            return;
        }
        self.overlays_disabled = disabled;
    }

    /// Overlay planes an enabled output could currently use
    pub fn overlay_planes_for(&self, id: OutputId) -> Vec<PlaneId> {
        if self.overlays_disabled && self.caps.atomic {
            return Vec::new();
        }
        let Some(pipe) = self.outputs.get(&id).and_then(DrmOutput::pipe) else {
            return Vec::new();
        };
        self.planes
            .iter()
            .filter(|plane| plane.kind() == PlaneType::Overlay && plane.is_available(id, pipe))
            .map(|plane| plane.id())
            .collect()
    }

    /// The session lost the display
    ///
    /// Cursors and overlays are hidden since whoever takes over will not touch them.
    pub fn session_paused(&mut self) {
        let _guard = self.span.enter();
        info!("Session paused");
        self.session_active = false;

        for output in self.outputs.values().filter(|o| o.enabled) {
            let (Some(crtc), Some(_)) = (output.crtc(), output.cursor_plane) else {
                continue;
            };
            if let Err(err) = self.device.disable_cursor(crtc) {
                debug!(?crtc, "Failed to disable cursor: {}", err);
            }
        }

        let Some(crtc) = self.outputs.values().find(|o| o.enabled).and_then(DrmOutput::crtc) else {
            return;
        };
        for plane in self.planes.iter().filter(|p| p.kind() == PlaneType::Overlay) {
            let Some(handle) = plane.handle() else {
                continue;
            };
            if let Err(err) = self.device.disable_plane(handle, crtc) {
                debug!(plane = ?handle, "Failed to disable overlay plane: {}", err);
            }
        }
    }

    /// The session got the display back, every enabled output needs a full repaint
    pub fn session_activated(&mut self) {
        info!(parent: &self.span, "Session activated");
        self.session_active = true;
        self.state_invalid = true;
        let enabled: Vec<OutputId> = self.outputs.values().filter(|o| o.enabled).map(|o| o.id).collect();
        for id in enabled {
            self.push_repaint(id);
        }
    }

    /// Frame finished notification, returning the output to idle
    pub(crate) fn finish_frame(&mut self, id: OutputId, time: Option<Duration>, flags: PresentationFlags) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        output.repaint_status = RepaintStatus::Idle;
        let sequence = output.msc;
        trace!(parent: &self.span, ?id, ?time, ?flags, "Frame finished");
        self.events.push(BackendEvent::FrameFinished {
            output: id,
            time,
            sequence,
            flags,
        });
    }
}

fn normalized_brightness(backlight: &dyn Backlight) -> Option<u32> {
    match (backlight.brightness(), backlight.max_brightness()) {
        (Ok(value), Ok(max)) if max > 0 => Some((u64::from(value) * 255 / u64::from(max)) as u32),
        _ => None,
    }
}

impl<D: KmsDevice, R: RenderPath> Drop for DrmBackend<D, R> {
    fn drop(&mut self) {
        let span = self.span.clone();
        let _guard = span.enter();
        if let Some(pending) = self.repaint_data.take() {
            for state in pending.outputs() {
                self.discard_state(state);
            }
        }
        let enabled: Vec<OutputId> = self.outputs.values().filter(|o| o.enabled).map(|o| o.id).collect();
        for id in enabled {
            self.deinit_output(id);
        }
        debug!("Dropped backend");
    }
}
