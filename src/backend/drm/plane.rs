//! Hardware planes and their ownership
//!
//! The [`PlaneManager`] owns every plane known to the backend. Outputs only ever refer to planes
//! by [`PlaneId`] and acquire them through [`PlaneManager::find_available`], which enforces that a
//! plane is claimed by at most one output at a time.
//!
//! Without universal-plane support the kernel does not expose primary and cursor planes, so
//! outputs get pseudo-planes fabricated by [`PlaneManager::synthesize`] instead. Those belong to
//! one output for their whole lifetime and are destroyed on release.

use drm::control::{crtc, plane};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, trace, warn};

use super::{
    kms::{KmsDevice, ResourceTable},
    properties::{PlaneProperty, PropertyTable},
    state::PlaneState,
    Error, OutputId,
};

/// Index of a plane inside the [`PlaneManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneId(pub(crate) usize);

/// Role of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Scanout plane, every enabled output needs one
    Primary,
    /// Additional plane composited by the hardware
    Overlay,
    /// Cursor plane
    Cursor,
}

/// A format supported by a plane together with the modifiers it accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneFormat {
    /// Fourcc code
    pub code: u32,
    /// Explicit modifiers, empty if the kernel did not report any
    pub modifiers: Vec<u64>,
}

/// A hardware plane, or a pseudo-plane standing in for one
#[derive(Debug)]
pub struct Plane {
    id: PlaneId,
    handle: Option<plane::Handle>,
    kind: PlaneType,
    possible_crtcs: u32,
    advertised_crtcs: u32,
    inherited_crtc: Option<crtc::Handle>,
    formats: Vec<PlaneFormat>,
    zpos: Option<(u64, u64)>,
    props: PropertyTable<PlaneProperty>,
    claimed_by: Option<OutputId>,
    pub(crate) state: PlaneState,
}

impl Plane {
    /// Id inside the plane manager
    pub fn id(&self) -> PlaneId {
        self.id
    }

    /// Kernel handle, `None` for pseudo-planes
    pub fn handle(&self) -> Option<plane::Handle> {
        self.handle
    }

    /// Role of the plane
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Bitmask of pipes this plane can be used with
    ///
    /// While the plane is claimed this is narrowed to the claiming output's pipe.
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// Bitmask of pipes the kernel advertised for this plane
    pub fn advertised_crtcs(&self) -> u32 {
        self.advertised_crtcs
    }

    /// CRTC the plane was routed to when the backend started
    pub fn inherited_crtc(&self) -> Option<crtc::Handle> {
        self.inherited_crtc
    }

    /// Supported formats
    pub fn formats(&self) -> &[PlaneFormat] {
        &self.formats
    }

    /// Immutable zpos bounds, `None` if the plane has no z-order information
    pub fn zpos_range(&self) -> Option<(u64, u64)> {
        self.zpos
    }

    /// Kernel properties
    pub fn props(&self) -> &PropertyTable<PlaneProperty> {
        &self.props
    }

    /// Output holding this plane as its primary or cursor plane
    pub fn claimed_by(&self) -> Option<OutputId> {
        self.claimed_by
    }

    /// Last committed state
    pub fn state(&self) -> &PlaneState {
        &self.state
    }

    /// Returns true for planes fabricated without universal-plane support
    pub fn is_pseudo(&self) -> bool {
        self.handle.is_none()
    }

    /// Checks if a buffer of the given format and modifier can be scanned out by this plane
    ///
    /// An invalid modifier stands for an implicit layout and matches on the format alone.
    pub fn supports(&self, format: DrmFourcc, modifier: DrmModifier) -> bool {
        let code = format as u32;
        self.formats.iter().filter(|f| f.code == code).any(|f| {
            modifier == DrmModifier::Invalid || f.modifiers.contains(&u64::from(modifier))
        })
    }

    /// A plane can be handed to `output` on `pipe` if no commit is touching it, nobody else
    /// has it in their current state and its mask allows the pipe.
    pub fn is_available(&self, output: OutputId, pipe: usize) -> bool {
        self.is_free_for(output) && self.possible_crtcs & (1 << pipe) != 0
    }

    fn is_free_for(&self, output: OutputId) -> bool {
        self.state.complete
            && self.state.output.map_or(true, |owner| owner == output)
            && self.claimed_by.map_or(true, |owner| owner == output)
    }
}

/// Owner of all planes of a device
#[derive(Debug, Default)]
pub struct PlaneManager {
    planes: Vec<Option<Plane>>,
    universal: bool,
}

impl PlaneManager {
    /// Creates an empty manager
    pub fn new(universal_planes: bool) -> Self {
        PlaneManager {
            planes: Vec::new(),
            universal: universal_planes,
        }
    }

    /// Whether planes come from the kernel or are synthesized per output
    pub fn has_universal_planes(&self) -> bool {
        self.universal
    }

    /// Enumerates the kernel's planes
    ///
    /// Without universal-plane support nothing is discovered, see [`PlaneManager::synthesize`].
    pub fn discover<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        resources: &ResourceTable,
    ) -> Result<(), Error> {
        if !self.universal {
            debug!("Universal planes unavailable, planes will be synthesized per output");
            return Ok(());
        }

        for handle in device.plane_handles()? {
            let info = device.plane(handle)?;
            let props = PropertyTable::<PlaneProperty>::fetch(device, handle)?;

            let kind = match props.enum_index(PlaneProperty::Type) {
                Some(PlaneProperty::TYPE_PRIMARY) => PlaneType::Primary,
                Some(PlaneProperty::TYPE_OVERLAY) => PlaneType::Overlay,
                Some(PlaneProperty::TYPE_CURSOR) => PlaneType::Cursor,
                _ => {
                    warn!(?handle, "Plane has no known type, ignoring");
                    continue;
                }
            };

            let formats = match props.value(PlaneProperty::InFormats).filter(|blob| *blob != 0) {
                Some(blob) => match device.property_blob(blob).map(|data| parse_in_formats(&data)) {
                    Ok(Some(formats)) => formats,
                    _ => {
                        warn!(?handle, "Unable to read IN_FORMATS, falling back to plain formats");
                        plain_formats(&info.formats)
                    }
                },
                None => plain_formats(&info.formats),
            };

            // The kernel only knows crtcs that exist, masks beyond the table are noise.
            let possible_crtcs = info.possible_crtcs & mask_for(resources.crtcs.len());

            let id = PlaneId(self.planes.len());
            trace!(?handle, ?kind, possible_crtcs, "Discovered plane");
            self.planes.push(Some(Plane {
                id,
                handle: Some(handle),
                kind,
                possible_crtcs,
                advertised_crtcs: possible_crtcs,
                inherited_crtc: info.crtc,
                formats,
                zpos: props.range(PlaneProperty::Zpos),
                props,
                claimed_by: None,
                state: PlaneState::empty(id),
            }));
        }

        info!(count = self.iter().count(), "Discovered planes");
        self.fake_zpos();
        Ok(())
    }

    /// Fabricates a pseudo-plane for `output`, usable only on `pipe`
    ///
    /// Slots of destroyed pseudo-planes are reused.
    pub fn synthesize(&mut self, output: OutputId, pipe: usize, kind: PlaneType, format: DrmFourcc) -> PlaneId {
        let index = match self.planes.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.planes.push(None);
                self.planes.len() - 1
            }
        };
        let id = PlaneId(index);
        debug!(?output, ?kind, ?format, ?id, "Synthesizing pseudo-plane");
        self.planes[index] = Some(Plane {
            id,
            handle: None,
            kind,
            possible_crtcs: 1 << pipe,
            advertised_crtcs: 1 << pipe,
            inherited_crtc: None,
            formats: vec![PlaneFormat {
                code: format as u32,
                modifiers: Vec::new(),
            }],
            zpos: None,
            props: PropertyTable::empty(),
            claimed_by: Some(output),
            state: PlaneState::empty(id),
        });
        id
    }

    /// Finds and claims a plane of the given type for `output`
    ///
    /// The first plane in discovery order whose mask includes `pipe` and that is not claimed by
    /// another output wins. Only if *no* plane of that type is usable on `pipe` at all (a mask the
    /// kernel may have reported wrongly), a plane already routed to `crtc` is tried, then any
    /// free plane of the type. Planes claimed by other outputs are never returned.
    pub fn find_available(
        &mut self,
        output: OutputId,
        pipe: usize,
        crtc: crtc::Handle,
        kind: PlaneType,
    ) -> Option<PlaneId> {
        let of_kind = || self.iter().filter(move |p| p.kind == kind && !p.is_pseudo());

        let chosen = if of_kind().any(|p| p.possible_crtcs & (1 << pipe) != 0) {
            of_kind().find(|p| p.is_available(output, pipe)).map(Plane::id)
        } else {
            of_kind()
                .find(|p| p.is_free_for(output) && p.inherited_crtc == Some(crtc))
                .or_else(|| of_kind().find(|p| p.is_free_for(output)))
                .map(|p| {
                    warn!(plane = ?p.handle, pipe, "No plane advertises this pipe, trusting a fallback plane");
                    p.id()
                })
        };

        let id = chosen?;
        let plane = self.get_mut(id)?;
        plane.possible_crtcs = 1 << pipe;
        plane.claimed_by = Some(output);
        debug!(?output, plane = ?plane.handle, ?kind, "Claimed plane");
        Some(id)
    }

    /// Returns a plane to the shared pool, or destroys it if it is a pseudo-plane
    ///
    /// A shared plane gets its advertised pipe mask back.
    pub fn release(&mut self, id: PlaneId) {
        let Some(slot) = self.planes.get_mut(id.0) else {
            return;
        };
        match slot {
            Some(plane) if plane.is_pseudo() => {
                trace!(?id, "Destroying pseudo-plane");
                *slot = None;
            }
            Some(plane) => {
                trace!(plane = ?plane.handle, "Releasing plane");
                plane.claimed_by = None;
                plane.possible_crtcs = plane.advertised_crtcs;
                plane.state = PlaneState::empty(id);
            }
            None => {}
        }
    }

    /// Looks up a plane
    pub fn get(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: PlaneId) -> Option<&mut Plane> {
        self.planes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// All live planes in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Plane> {
        self.planes.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Plane> {
        self.planes.iter_mut().flatten()
    }

    /// Gives every plane a fixed stacking order if the kernel exposes none
    ///
    /// Primaries go to the bottom, overlays above them and cursors on top.
    fn fake_zpos(&mut self) {
        if self.iter().any(|p| p.zpos.is_some()) {
            return;
        }

        let primaries = self.iter().filter(|p| p.kind == PlaneType::Primary).count() as u64;
        let overlays = self.iter().filter(|p| p.kind == PlaneType::Overlay).count() as u64;
        for plane in self.iter_mut() {
            let zpos = match plane.kind {
                PlaneType::Primary => 0,
                PlaneType::Overlay => primaries,
                PlaneType::Cursor => primaries + overlays,
            };
            plane.zpos = Some((zpos, zpos));
        }
        debug!("No zpos property exposed, using synthesized plane ordering");
    }
}

fn mask_for(count: usize) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1 << count) - 1
    }
}

fn plain_formats(codes: &[u32]) -> Vec<PlaneFormat> {
    codes
        .iter()
        .map(|code| PlaneFormat {
            code: *code,
            modifiers: Vec::new(),
        })
        .collect()
}

const IN_FORMATS_HEADER: usize = 24;
const MODIFIER_ENTRY: usize = 24;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

/// Parses a `drm_format_modifier_blob` as exposed through `IN_FORMATS`
///
/// Returns `None` for truncated or unknown blobs.
pub fn parse_in_formats(data: &[u8]) -> Option<Vec<PlaneFormat>> {
    if data.len() < IN_FORMATS_HEADER {
        return None;
    }
    let version = read_u32(data, 0)?;
    if version != 1 {
        return None;
    }
    let count_formats = read_u32(data, 8)? as usize;
    let formats_offset = read_u32(data, 12)? as usize;
    let count_modifiers = read_u32(data, 16)? as usize;
    let modifiers_offset = read_u32(data, 20)? as usize;

    let mut formats = (0..count_formats)
        .map(|i| {
            read_u32(data, formats_offset + i * 4).map(|code| PlaneFormat {
                code,
                modifiers: Vec::new(),
            })
        })
        .collect::<Option<Vec<_>>>()?;

    for i in 0..count_modifiers {
        let entry = modifiers_offset + i * MODIFIER_ENTRY;
        let mask = read_u64(data, entry)?;
        let offset = read_u32(data, entry + 8)? as usize;
        let modifier = read_u64(data, entry + 16)?;

        for bit in 0..64 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            if let Some(format) = formats.get_mut(offset + bit) {
                format.modifiers.push(modifier);
            }
        }
    }

    Some(formats)
}
