//! Outputs, the compositor-facing unit of display
//!
//! A [`DrmOutput`] groups up to [`MAX_CLONED_CONNECTORS`](super::head::MAX_CLONED_CONNECTORS)
//! heads showing the same contents. While enabled it owns one CRTC, a primary plane and
//! optionally a cursor plane. Its lifecycle is driven by [`DrmBackend`](super::DrmBackend);
//! this module holds the per-output bookkeeping.

use std::{fmt, time::Duration};

use drm::control::{connector, crtc, Mode, ModeFlags};
use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;

use super::{
    head::{HdcpProtection, MAX_CLONED_CONNECTORS},
    plane::PlaneId,
    properties::{CrtcProperty, PropertyTable},
    state::OutputState,
};

/// Identifier of an output, stable for the output's lifetime
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub(crate) u32);

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputId({})", self.0)
    }
}

/// Work that has to wait until the commit in flight for an output completes
///
/// Only the strongest request is remembered: destroying implies disabling, which implies
/// turning the display off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PendingIntent {
    /// Nothing is deferred
    #[default]
    None,
    /// Turn the display off
    DpmsOff,
    /// Disable the output
    Disable,
    /// Destroy the output
    Destroy,
}

impl PendingIntent {
    /// Records a request, keeping the stronger of the two
    pub fn escalate(&mut self, intent: PendingIntent) {
        if intent > *self {
            *self = intent;
        }
    }
}

/// Where an output is in its repaint cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepaintStatus {
    /// No frame is on its way to the display
    #[default]
    Idle,
    /// A frame was submitted and its completion will finish the frame
    AwaitingCompletion,
}

/// Result of a request to disable an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// The output is disabled
    Done,
    /// A commit is in flight, the output is disabled once it completes
    Deferred,
}

/// The CRTC held by an enabled output
#[derive(Debug, Clone)]
pub struct OutputCrtc {
    /// Kernel handle
    pub handle: crtc::Handle,
    /// Index in the resource table
    pub pipe: usize,
    /// Size of the gamma table
    pub gamma_size: u32,
    /// Kernel properties
    pub props: PropertyTable<CrtcProperty>,
}

/// State of one output
#[derive(Debug)]
pub struct DrmOutput {
    pub(crate) id: OutputId,
    pub(crate) name: String,
    pub(crate) heads: SmallVec<[connector::Handle; MAX_CLONED_CONNECTORS]>,
    pub(crate) enabled: bool,
    pub(crate) crtc: Option<OutputCrtc>,
    pub(crate) scanout_plane: Option<PlaneId>,
    pub(crate) cursor_plane: Option<PlaneId>,
    pub(crate) mode: Option<Mode>,
    pub(crate) mode_blob: Option<(Mode, u64)>,
    pub(crate) format: DrmFourcc,
    pub(crate) desired_protection: HdcpProtection,
    pub(crate) state_cur: OutputState,
    pub(crate) state_last: Option<OutputState>,
    pub(crate) page_flip_pending: bool,
    pub(crate) atomic_complete_pending: bool,
    pub(crate) intent: PendingIntent,
    pub(crate) repaint_status: RepaintStatus,
    pub(crate) msc: u64,
    pub(crate) backlight_level: Option<u32>,
    pub(crate) recorder_attached: bool,
}

impl DrmOutput {
    pub(crate) fn new(id: OutputId, name: String, format: DrmFourcc) -> Self {
        DrmOutput {
            id,
            name,
            heads: SmallVec::new(),
            enabled: false,
            crtc: None,
            scanout_plane: None,
            cursor_plane: None,
            mode: None,
            mode_blob: None,
            format,
            desired_protection: HdcpProtection::Disabled,
            state_cur: OutputState::new(id),
            state_last: None,
            page_flip_pending: false,
            atomic_complete_pending: false,
            intent: PendingIntent::None,
            repaint_status: RepaintStatus::Idle,
            msc: 0,
            backlight_level: None,
            recorder_attached: false,
        }
    }

    /// Identifier of the output
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Name of the output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connectors of the heads driven by this output
    pub fn heads(&self) -> &[connector::Handle] {
        &self.heads
    }

    /// Whether the output holds hardware and takes part in repaints
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// CRTC driving the output
    pub fn crtc(&self) -> Option<crtc::Handle> {
        self.crtc.as_ref().map(|crtc| crtc.handle)
    }

    /// Pipe index of the CRTC driving the output
    pub fn pipe(&self) -> Option<usize> {
        self.crtc.as_ref().map(|crtc| crtc.pipe)
    }

    /// Primary plane reserved for the output
    pub fn scanout_plane(&self) -> Option<PlaneId> {
        self.scanout_plane
    }

    /// Cursor plane reserved for the output
    pub fn cursor_plane(&self) -> Option<PlaneId> {
        self.cursor_plane
    }

    /// Mode the output runs (or will run) at
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Pixel format of the primary plane
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Content protection requested by the compositor
    pub fn desired_protection(&self) -> HdcpProtection {
        self.desired_protection
    }

    /// State that is on screen, or will be once the commit in flight completes
    pub fn current_state(&self) -> &OutputState {
        &self.state_cur
    }

    /// Previous state, kept while a commit is in flight
    pub fn last_state(&self) -> Option<&OutputState> {
        self.state_last.as_ref()
    }

    /// A legacy page-flip has not completed yet
    pub fn is_page_flip_pending(&self) -> bool {
        self.page_flip_pending
    }

    /// A non-blocking atomic commit has not completed yet
    pub fn is_atomic_complete_pending(&self) -> bool {
        self.atomic_complete_pending
    }

    /// Work deferred until the commit in flight completes
    pub fn pending_intent(&self) -> PendingIntent {
        self.intent
    }

    /// Position in the repaint cycle
    pub fn repaint_status(&self) -> RepaintStatus {
        self.repaint_status
    }

    /// 64-bit media stream counter
    pub fn msc(&self) -> u64 {
        self.msc
    }

    /// Backlight level in the range 0..=255, if the output has a backlight
    pub fn backlight_level(&self) -> Option<u32> {
        self.backlight_level
    }

    /// A commit was submitted and has not completed yet
    pub fn commit_in_flight(&self) -> bool {
        self.state_last.is_some() || self.page_flip_pending || self.atomic_complete_pending
    }

    /// Extends a 32-bit kernel frame counter to the 64-bit media stream counter
    ///
    /// A sequence smaller than the low half of the counter means the kernel counter wrapped.
    pub(crate) fn update_msc(&mut self, sequence: u32) {
        let mut high = self.msc >> 32;
        if u64::from(sequence) < (self.msc & 0xffff_ffff) {
            high += 1;
        }
        self.msc = (high << 32) + u64::from(sequence);
    }

    /// Duration of one refresh cycle of the current mode
    pub fn refresh_interval(&self) -> Option<Duration> {
        let millihz = refresh_millihz(&self.mode?);
        if millihz == 0 {
            return None;
        }
        Some(Duration::from_nanos(1_000_000_000_000 / millihz as u64))
    }
}

/// Refresh rate of a mode in millihertz
pub fn refresh_millihz(mode: &Mode) -> u32 {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return mode.vrefresh() * 1000;
    }

    let mut refresh = (clock * 1_000_000 / htotal + vtotal / 2) / vtotal;
    let flags = mode.flags();
    if flags.contains(ModeFlags::INTERLACE) {
        refresh *= 2;
    }
    if flags.contains(ModeFlags::DBLSCAN) {
        refresh /= 2;
    }
    refresh as u32
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use drm_fourcc::DrmFourcc;

    use super::{refresh_millihz, DrmOutput, OutputId, PendingIntent};
    use crate::backend::drm::test_utils::test_mode;

    fn output() -> DrmOutput {
        DrmOutput::new(OutputId(1), "HDMI-A-1".into(), DrmFourcc::Xrgb8888)
    }

    #[test]
    fn intents_only_escalate() {
        let mut intent = PendingIntent::None;
        intent.escalate(PendingIntent::Disable);
        intent.escalate(PendingIntent::DpmsOff);
        assert_eq!(intent, PendingIntent::Disable);
        intent.escalate(PendingIntent::Destroy);
        assert_eq!(intent, PendingIntent::Destroy);
    }

    #[test]
    fn msc_extends_across_wraparound() {
        let mut output = output();
        output.update_msc(10);
        assert_eq!(output.msc(), 10);
        output.update_msc(u32::MAX);
        assert_eq!(output.msc(), u32::MAX as u64);
        output.update_msc(3);
        assert_eq!(output.msc(), (1 << 32) + 3);
        output.update_msc(4);
        assert_eq!(output.msc(), (1 << 32) + 4);
    }

    #[test]
    fn computes_refresh_rate() {
        let mode = test_mode(1920, 1080);
        assert_eq!(refresh_millihz(&mode), 60_000);

        let mut output = output();
        assert_eq!(output.refresh_interval(), None);
        output.mode = Some(mode);
        assert_eq!(output.refresh_interval(), Some(Duration::from_nanos(16_666_666)));
    }

    #[test]
    fn in_flight_tracks_both_apis() {
        let mut output = output();
        assert!(!output.commit_in_flight());
        output.page_flip_pending = true;
        assert!(output.commit_in_flight());
        output.page_flip_pending = false;
        output.atomic_complete_pending = true;
        assert!(output.commit_in_flight());
    }
}
