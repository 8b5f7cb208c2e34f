//! CRTC selection and bookkeeping of unused CRTCs

use drm::control::crtc;
use tracing::{debug, trace};

/// What the allocator needs to know about a head attached to the output being enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadRouting {
    /// Union of the possible-CRTC masks of the head's encoders
    pub possible_crtcs: u32,
    /// CRTC driving the head when the backend started
    pub inherited_crtc: Option<crtc::Handle>,
}

/// Input of [`pick_crtc`]
#[derive(Debug, Clone, Copy)]
pub struct CrtcRequest<'a> {
    /// Heads attached to the output
    pub heads: &'a [HeadRouting],
    /// CRTCs reserved by other live outputs
    pub in_use: &'a [crtc::Handle],
    /// Inherited CRTCs of heads that are not attached to an enabled output
    pub reserved_for_disabled: &'a [crtc::Handle],
}

/// Picks the index of a CRTC able to drive every head of the request
///
/// Existing kernel routing is preserved whenever possible. Otherwise the last free CRTC that
/// no currently disabled head was routed to is chosen, then the last free one. If the heads'
/// masks rule out every CRTC (kernels misreport clone masks), an inherited CRTC is reused if free,
/// and as a last resort any free CRTC is returned regardless of the masks.
pub fn pick_crtc(crtcs: &[crtc::Handle], request: &CrtcRequest<'_>) -> Option<usize> {
    let possible_crtcs = request
        .heads
        .iter()
        .fold(u32::MAX, |mask, head| mask & head.possible_crtcs);
    let inherited = || request.heads.iter().filter_map(|head| head.inherited_crtc);
    let is_free = |crtc: &crtc::Handle| !request.in_use.contains(crtc);

    let mut best = None;
    let mut fallback = None;
    for (index, crtc) in crtcs.iter().enumerate() {
        if index >= 32 || possible_crtcs & (1 << index) == 0 || !is_free(crtc) {
            continue;
        }

        if inherited().any(|inherited| inherited == *crtc) {
            trace!(?crtc, "Preserving inherited crtc routing");
            return Some(index);
        }

        if !request.reserved_for_disabled.contains(crtc) {
            best = Some(index);
        }
        fallback = Some(index);
    }

    if let Some(index) = best.or(fallback) {
        return Some(index);
    }

    debug!(possible_crtcs, "No crtc matches the heads' masks, ignoring them");
    inherited()
        .filter(is_free)
        .find_map(|inherited| crtcs.iter().position(|crtc| *crtc == inherited))
        .or_else(|| crtcs.iter().position(is_free))
}

/// The pool of CRTCs not driven by any output
///
/// Every CRTC of the resource table is either in this pool or reserved by exactly one
/// enabled output.
#[derive(Debug, Clone, Default)]
pub struct CrtcPool {
    unused: Vec<crtc::Handle>,
}

impl CrtcPool {
    /// Starts with every CRTC unused
    pub fn new(crtcs: &[crtc::Handle]) -> Self {
        CrtcPool {
            unused: crtcs.to_vec(),
        }
    }

    /// CRTCs not driven by any output
    pub fn unused(&self) -> &[crtc::Handle] {
        &self.unused
    }

    /// Returns true if no output drives the CRTC
    pub fn is_unused(&self, crtc: crtc::Handle) -> bool {
        self.unused.contains(&crtc)
    }

    /// Takes a CRTC out of the pool
    pub fn reserve(&mut self, crtc: crtc::Handle) {
        self.unused.retain(|c| *c != crtc);
    }

    /// Puts a CRTC back into the pool
    pub fn release(&mut self, crtc: crtc::Handle) {
        if !self.unused.contains(&crtc) {
            self.unused.push(crtc);
        }
    }

    /// Recomputes the pool after the resource table changed
    pub fn reconcile(&mut self, crtcs: &[crtc::Handle], in_use: &[crtc::Handle]) {
        self.unused = crtcs.iter().copied().filter(|c| !in_use.contains(c)).collect();
    }
}
