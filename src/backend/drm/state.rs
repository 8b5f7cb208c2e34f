//! Generations of output state and the transaction that batches them
//!
//! An [`OutputState`] describes what one output should look like after a commit: its power
//! level, the content protection it asks for and the configuration of every plane it touches.
//! During a repaint cycle the per-output states are collected in a [`PendingState`], which is
//! then applied to the kernel as a whole (see [`DrmBackend::repaint_flush`](super::DrmBackend::repaint_flush))
//! or cancelled without touching the hardware.

use smallvec::SmallVec;

use super::{head::HdcpProtection, plane::PlaneId, render::Framebuffer, OutputId};

/// Display power level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DpmsLevel {
    /// Display is on
    #[default]
    On,
    /// Display is in standby
    Standby,
    /// Display is suspended
    Suspend,
    /// Display is off
    Off,
}

/// Source rectangle of a plane in 16.16 fixed point buffer coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceRect {
    /// x
    pub x: u32,
    /// y
    pub y: u32,
    /// width
    pub w: u32,
    /// height
    pub h: u32,
}

/// Destination rectangle of a plane in CRTC coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestRect {
    /// x
    pub x: i32,
    /// y
    pub y: i32,
    /// width
    pub w: u32,
    /// height
    pub h: u32,
}

/// Configuration of one plane in an output state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneState {
    /// The plane
    pub plane: PlaneId,
    /// Output the plane is shown on once this state takes effect, `None` to disable it
    pub output: Option<OutputId>,
    /// Framebuffer to scan out
    pub fb: Option<Framebuffer>,
    /// Source rectangle
    pub src: SourceRect,
    /// Destination rectangle
    pub dst: DestRect,
    /// Stacking order
    pub zpos: Option<u64>,
    /// `FB_DAMAGE_CLIPS` blob for this frame
    pub damage_blob: Option<u64>,
    /// The state has reached the hardware
    pub complete: bool,
}

impl PlaneState {
    /// A disabled plane whose state is settled
    pub fn empty(plane: PlaneId) -> Self {
        PlaneState {
            plane,
            output: None,
            fb: None,
            src: SourceRect::default(),
            dst: DestRect::default(),
            zpos: None,
            damage_blob: None,
            complete: true,
        }
    }

    /// A new state disabling the plane, part of a commit that has not happened yet
    pub fn disabled(plane: PlaneId) -> Self {
        PlaneState {
            complete: false,
            ..PlaneState::empty(plane)
        }
    }

    /// Copy of this state for the next generation
    ///
    /// Damage only applies to the frame it was submitted with and is not carried over.
    pub fn duplicate(&self) -> Self {
        PlaneState {
            damage_blob: None,
            complete: false,
            ..self.clone()
        }
    }

    /// Fills the state with a framebuffer covering the whole output
    pub fn set_fullscreen(&mut self, output: OutputId, fb: Framebuffer, mode_size: (u16, u16)) {
        self.output = Some(output);
        self.src = SourceRect {
            x: 0,
            y: 0,
            w: fb.size.0 << 16,
            h: fb.size.1 << 16,
        };
        self.dst = DestRect {
            x: 0,
            y: 0,
            w: mode_size.0 as u32,
            h: mode_size.1 as u32,
        };
        self.fb = Some(fb);
    }
}

/// How planes are carried into a duplicated output state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateMode {
    /// Every plane the output showed is disabled in the new state
    ClearPlanes,
    /// Planes keep their configuration
    PreservePlanes,
}

/// Desired configuration of one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputState {
    /// The output
    pub output: OutputId,
    /// Power level
    pub dpms: DpmsLevel,
    /// Content protection to request
    pub protection: HdcpProtection,
    /// Planes touched by this state
    pub planes: SmallVec<[PlaneState; 4]>,
}

impl OutputState {
    /// A state without any planes
    pub fn new(output: OutputId) -> Self {
        OutputState {
            output,
            dpms: DpmsLevel::On,
            protection: HdcpProtection::Disabled,
            planes: SmallVec::new(),
        }
    }

    /// Starts the next generation from this state
    ///
    /// Planes that are already disabled are dropped so other outputs may pick them up.
    pub fn duplicate(&self, mode: DuplicateMode) -> Self {
        let planes = self
            .planes
            .iter()
            .filter(|ps| ps.output.is_some())
            .map(|ps| match mode {
                DuplicateMode::ClearPlanes => PlaneState::disabled(ps.plane),
                DuplicateMode::PreservePlanes => ps.duplicate(),
            })
            .collect();
        OutputState {
            output: self.output,
            dpms: self.dpms,
            protection: self.protection,
            planes,
        }
    }

    /// A state turning the output off
    pub fn disable(&self) -> Self {
        OutputState {
            dpms: DpmsLevel::Off,
            protection: HdcpProtection::Disabled,
            ..self.duplicate(DuplicateMode::ClearPlanes)
        }
    }

    /// State of a plane, if this state touches it
    pub fn plane(&self, plane: PlaneId) -> Option<&PlaneState> {
        self.planes.iter().find(|ps| ps.plane == plane)
    }

    /// State of a plane, adding a disabled one if this state does not touch it yet
    pub fn plane_mut(&mut self, plane: PlaneId) -> &mut PlaneState {
        let index = match self.planes.iter().position(|ps| ps.plane == plane) {
            Some(index) => index,
            None => {
                self.planes.push(PlaneState::disabled(plane));
                self.planes.len() - 1
            }
        };
        &mut self.planes[index]
    }

    /// Marks every plane of this state as having reached the hardware
    pub fn mark_complete(&mut self) {
        for ps in self.planes.iter_mut() {
            ps.complete = true;
        }
    }

    /// Damage blobs owned by the planes of this state
    pub fn damage_blobs(&self) -> impl Iterator<Item = u64> + '_ {
        self.planes.iter().filter_map(|ps| ps.damage_blob)
    }
}

/// The transaction of one repaint cycle
#[derive(Debug, Default)]
pub struct PendingState {
    outputs: Vec<OutputState>,
}

impl PendingState {
    /// Opens an empty transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the state of an output, replacing an earlier one for the same output
    pub fn insert(&mut self, state: OutputState) {
        self.outputs.retain(|s| s.output != state.output);
        self.outputs.push(state);
    }

    /// Takes the state of an output out of the transaction
    pub fn take(&mut self, output: OutputId) -> Option<OutputState> {
        let index = self.outputs.iter().position(|s| s.output == output)?;
        Some(self.outputs.remove(index))
    }

    /// State of an output
    pub fn get(&self, output: OutputId) -> Option<&OutputState> {
        self.outputs.iter().find(|s| s.output == output)
    }

    /// Returns true if no output has queued a state
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Queued output states in insertion order
    pub fn outputs(&self) -> &[OutputState] {
        &self.outputs
    }

    pub(crate) fn into_outputs(self) -> Vec<OutputState> {
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::{DpmsLevel, DuplicateMode, OutputState, PendingState, PlaneState};
    use crate::backend::drm::{head::HdcpProtection, plane::PlaneId, OutputId};

    fn shown(plane: usize, output: OutputId) -> PlaneState {
        PlaneState {
            output: Some(output),
            damage_blob: Some(9),
            ..PlaneState::empty(PlaneId(plane))
        }
    }

    fn state_with_planes() -> OutputState {
        let output = OutputId(1);
        let mut state = OutputState::new(output);
        state.protection = HdcpProtection::Type1;
        state.planes.push(shown(0, output));
        state.planes.push(PlaneState::empty(PlaneId(1)));
        state.planes.push(shown(2, output));
        state
    }

    #[test]
    fn duplicate_clear_disables_shown_planes() {
        let state = state_with_planes().duplicate(DuplicateMode::ClearPlanes);
        let planes: Vec<_> = state.planes.iter().map(|ps| ps.plane).collect();
        assert_eq!(planes, vec![PlaneId(0), PlaneId(2)]);
        assert!(state.planes.iter().all(|ps| ps.output.is_none() && !ps.complete));
        assert_eq!(state.protection, HdcpProtection::Type1);
    }

    #[test]
    fn duplicate_preserve_drops_damage() {
        let state = state_with_planes().duplicate(DuplicateMode::PreservePlanes);
        assert_eq!(state.planes.len(), 2);
        assert!(state
            .planes
            .iter()
            .all(|ps| ps.output == Some(OutputId(1)) && ps.damage_blob.is_none()));
    }

    #[test]
    fn disable_state_turns_everything_off() {
        let state = state_with_planes().disable();
        assert_eq!(state.dpms, DpmsLevel::Off);
        assert_eq!(state.protection, HdcpProtection::Disabled);
        assert!(state.planes.iter().all(|ps| ps.fb.is_none() && ps.output.is_none()));
    }

    #[test]
    fn plane_mut_adds_missing_planes_once() {
        let mut state = OutputState::new(OutputId(3));
        state.plane_mut(PlaneId(5)).zpos = Some(1);
        state.plane_mut(PlaneId(5)).zpos = Some(2);
        assert_eq!(state.planes.len(), 1);
        assert_eq!(state.plane(PlaneId(5)).unwrap().zpos, Some(2));
    }

    #[test]
    fn pending_state_keeps_one_state_per_output() {
        let mut pending = PendingState::new();
        pending.insert(OutputState::new(OutputId(1)));
        pending.insert(OutputState::new(OutputId(2)));
        let mut replacement = OutputState::new(OutputId(1));
        replacement.dpms = DpmsLevel::Off;
        pending.insert(replacement);

        assert_eq!(pending.outputs().len(), 2);
        assert_eq!(pending.get(OutputId(1)).unwrap().dpms, DpmsLevel::Off);
        assert!(pending.take(OutputId(2)).is_some());
        assert!(pending.take(OutputId(2)).is_none());
    }
}
