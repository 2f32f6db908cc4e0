use crate::cache::{CacheEntry, CacheKey};
use crate::request::Request;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreresolutionPhase {
    #[default]
    Uninitialized,
    Resolving,
    Resolved,
}

/// Progress of resolving the ISOLATED subrequests of a node.
#[derive(Default)]
pub(crate) struct Preresolution {
    pub(crate) phase: PreresolutionPhase,
    /// Inner requests of the ISOLATED nodes, in tree order.
    pub(crate) collected: Vec<Request>,
    pub(crate) states: Vec<ResolutionState>,
    /// The node with every ISOLATED subrequest replaced by its resolved form.
    pub(crate) substituted: Option<Request>,
}

/// A cache entry together with the key it was taken under.
pub(crate) struct Keyed {
    pub(crate) entry: CacheEntry,
    pub(crate) key: CacheKey,
}

/// A background FUNCTION: its arguments, then the entry holding its result.
#[derive(Default)]
pub(crate) struct BackgroundState {
    pub(crate) args: Payload,
    pub(crate) entry: Option<Keyed>,
}

/// A remote-shaped node: one hop of the chain
/// calculation -> object -> immutable -> data.
#[derive(Default)]
pub(crate) struct ChainState {
    /// META only: the request producing the calculation definition.
    pub(crate) generator: Option<ResolutionState>,
    pub(crate) entry: Option<Keyed>,
    /// The request this hop leads to, once its entry is ready.
    pub(crate) next: Option<(Request, ResolutionState)>,
    /// Whether a calculation canceled after submission was already replaced.
    pub(crate) resubmitted: bool,
}

#[derive(Default)]
pub(crate) enum Payload {
    /// Nothing visited yet, or nothing to track (trivial nodes).
    #[default]
    Empty,
    /// Few non-trivial children: states for those only, keyed by child
    /// index. Trivial children are evaluated inline.
    Sparse(Vec<(usize, ResolutionState)>),
    /// One state per child.
    Children(Vec<ResolutionState>),
    Background(Box<BackgroundState>),
    Chain(Box<ChainState>),
}

/// Mutable scratch data for resolving one request.
///
/// Owned by whoever drives the resolution and never shared. A state is tied
/// to the request it was first used with; pairing it with a different
/// request is a caller error.
#[derive(Default)]
pub struct ResolutionState {
    pub(crate) preresolution: Preresolution,
    pub(crate) payload: Payload,
}

impl ResolutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preresolution_phase(&self) -> PreresolutionPhase {
        self.preresolution.phase
    }
}

impl Payload {
    /// State of child `index`, if one is tracked.
    pub(crate) fn child(&self, index: usize) -> Option<&ResolutionState> {
        match self {
            Payload::Sparse(states) => states
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, state)| state),
            Payload::Children(states) => states.get(index),
            _ => None,
        }
    }
}
