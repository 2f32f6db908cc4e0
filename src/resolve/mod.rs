//! The resolution engine.
//!
//! Every operation walks a request tree alongside the caller-owned
//! [`ResolutionState`] tree that mirrors it. `update` advances the work,
//! the remaining operations only observe:
//!
//! - trivial nodes need no state and are evaluated inline,
//! - composite nodes (arrays, structures, wrappers and foreground functions)
//!   recurse into their children,
//! - background functions resolve their arguments, then take the memory
//!   cache entry keyed by their objectified form and launch a local job if
//!   nobody has,
//! - remote-shaped nodes follow the chain calculation -> object ->
//!   immutable -> data, one cache entry per hop.
//!
//! Nothing here blocks: work that can't be done right away is handed to a
//! job, and the caller asks again later.

mod objectify;
mod preresolve;
mod state;
mod trivial;

pub use crate::resolve::state::{PreresolutionPhase, ResolutionState};

use crate::cache::{CacheKey, EntryStatus};
use crate::config::ResolutionPolicy;
use crate::error::{JobError, RemoteError, ResolveError};
use crate::jobs::{
    self, BackgroundJob, ImmutableFetchJob, LocalCalculationJob, ObjectResolutionJob,
    RemoteSubmissionJob,
};
use crate::request::{FunctionRequest, Request, RequestKind};
use crate::resolve::state::{BackgroundState, ChainState, Keyed, Payload};
use crate::system::{ExecutionSystem, RequestContext};
use crate::value::Value;

/// What the caller needs out of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// The final value.
    Result,
    /// A reference-only form of the request, good for sharing or
    /// resubmission. Remote-shaped nodes only need their identity for this.
    ObjectifiedForm,
}

/// The outcome of a finished resolution.
#[derive(Debug, Clone)]
pub enum Resolved {
    Result(Value),
    ObjectifiedForm(Request),
}

/// Drives requests toward resolution against one execution system and
/// context.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    system: &'a ExecutionSystem,
    context: &'a RequestContext,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(system: &'a ExecutionSystem, context: &'a RequestContext) -> Self {
        Self { system, context }
    }

    fn policy(&self) -> &ResolutionPolicy {
        &self.system.config().policy
    }

    /// Advances `request` toward completion for `interest`.
    ///
    /// With `foreground_only` set, cached values are picked up but no job is
    /// ever launched.
    pub fn update(
        &self,
        state: &mut ResolutionState,
        request: &Request,
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if request.has_isolated() {
            if !self.update_preresolution(&mut state.preresolution, request, foreground_only)? {
                return Ok(());
            }
            let substituted = state
                .preresolution
                .substituted
                .clone()
                .ok_or_else(|| ResolveError::internal("preresolved node has no substitution"))?;
            return self.update_node(&mut state.payload, &substituted, interest, foreground_only);
        }

        self.update_node(&mut state.payload, request, interest, foreground_only)
    }

    /// Whether `update` has done everything `interest` needs.
    pub fn is_resolved(&self, state: &ResolutionState, request: &Request, interest: Interest) -> bool {
        match effective(state, request) {
            Ok(request) => self.node_resolved(&state.payload, request, interest),
            Err(_) => false,
        }
    }

    /// Whether the ISOLATED subrequests of `request` have been substituted.
    pub fn is_preresolved(&self, state: &ResolutionState, request: &Request) -> bool {
        !request.has_isolated() || state.preresolution.phase == PreresolutionPhase::Resolved
    }

    pub fn is_objectification_complete(&self, state: &ResolutionState, request: &Request) -> bool {
        self.is_resolved(state, request, Interest::ObjectifiedForm)
    }

    /// Assembles the value of a resolved request. Has no side effects.
    pub fn get_result(&self, state: &ResolutionState, request: &Request) -> Result<Value, ResolveError> {
        let request = effective(state, request)?;
        let value = self.node_result(&state.payload, request)?;
        Ok(request.descriptor().check(value)?)
    }

    /// The outcome `interest` asks for. Only valid once resolved.
    pub fn finish(
        &self,
        state: &ResolutionState,
        request: &Request,
        interest: Interest,
    ) -> Result<Resolved, ResolveError> {
        match interest {
            Interest::Result => self.get_result(state, request).map(Resolved::Result),
            Interest::ObjectifiedForm => self
                .get_objectified_form(state, request)
                .map(Resolved::ObjectifiedForm),
        }
    }

    // ******************************
    // *          update            *
    // ******************************

    fn update_node(
        &self,
        payload: &mut Payload,
        request: &Request,
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if request.is_trivial() {
            return Ok(());
        }

        match request.kind() {
            RequestKind::Function(f) if !f.runs_in_foreground() => {
                self.update_background(payload, request, f, interest, foreground_only)
            }
            RequestKind::Function(_)
            | RequestKind::Array(_)
            | RequestKind::Structure(_)
            | RequestKind::Property(_)
            | RequestKind::Union(_)
            | RequestKind::Some(_)
            | RequestKind::Required(_) => {
                self.update_children(payload, &request.children(), interest, foreground_only)
            }
            RequestKind::RemoteCalculation(_)
            | RequestKind::Meta(_)
            | RequestKind::Object(_)
            | RequestKind::Immutable(_) => {
                self.update_chain(payload, request, interest, foreground_only)
            }
            RequestKind::Isolated(_) => Err(ResolveError::internal(
                "ISOLATED request reached outside preresolution",
            )),
            RequestKind::Immediate(_) => Ok(()),
        }
    }

    fn update_children(
        &self,
        payload: &mut Payload,
        children: &[&Request],
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if matches!(payload, Payload::Empty) {
            let pending: Vec<usize> = children
                .iter()
                .enumerate()
                .filter(|(_, child)| !child.is_trivial())
                .map(|(i, _)| i)
                .collect();

            *payload = if pending.len() <= self.policy().passthrough_limit {
                Payload::Sparse(pending.into_iter().map(|i| (i, ResolutionState::new())).collect())
            } else {
                Payload::Children(children.iter().map(|_| ResolutionState::new()).collect())
            };
        }

        match payload {
            Payload::Sparse(states) => {
                for (i, state) in states.iter_mut() {
                    let child = children
                        .get(*i)
                        .ok_or_else(|| ResolveError::internal("child index out of range"))?;
                    self.update(state, child, interest, foreground_only)?;
                }
                Ok(())
            }
            Payload::Children(states) if states.len() == children.len() => {
                for (state, child) in states.iter_mut().zip(children) {
                    self.update(state, child, interest, foreground_only)?;
                }
                Ok(())
            }
            _ => Err(ResolveError::internal("resolution state doesn't match request")),
        }
    }

    fn update_background(
        &self,
        payload: &mut Payload,
        request: &Request,
        function: &FunctionRequest,
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if matches!(payload, Payload::Empty) {
            *payload = Payload::Background(Box::default());
        }
        let Payload::Background(background) = payload else {
            return Err(ResolveError::internal("resolution state doesn't match request"));
        };

        let args: Vec<&Request> = function.args.iter().collect();
        self.update_children(&mut background.args, &args, interest, foreground_only)?;

        if interest == Interest::ObjectifiedForm
            || !self.children_resolved(&background.args, &args, Interest::Result)
        {
            return Ok(());
        }

        if background.entry.is_none() {
            let objectified = self.objectify_children(&background.args, request)?;
            background.entry = Some(self.keyed(&objectified)?);
        }

        let BackgroundState { args: arg_states, entry } = &**background;
        let Some(keyed) = entry.as_ref() else {
            return Ok(());
        };

        self.drive(keyed, true, foreground_only, || {
            let values = self.children_results(arg_states, &args)?;
            Ok(Box::new(LocalCalculationJob::new(function.function.clone(), values)))
        })
        .map_err(|e| match e {
            ResolveError::Job(source) => ResolveError::Function {
                id: function.function.id().to_string(),
                source,
            },
            other => other,
        })
    }

    fn update_chain(
        &self,
        payload: &mut Payload,
        request: &Request,
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if matches!(payload, Payload::Empty) {
            *payload = Payload::Chain(Box::default());
        }
        let Payload::Chain(chain) = payload else {
            return Err(ResolveError::internal("resolution state doesn't match request"));
        };
        let chain = &mut **chain;
        let ctx = self.context.context_id();
        let remote = self.system.remote();

        match request.kind() {
            RequestKind::RemoteCalculation(calculation) => {
                let submission = request.clone();
                self.update_submission(chain, &submission, calculation, request, interest, foreground_only)
            }
            RequestKind::Meta(generator) => {
                let generator_state = chain.generator.get_or_insert_with(ResolutionState::new);
                self.update(generator_state, generator, Interest::Result, foreground_only)?;
                if !self.is_resolved(generator_state, generator, Interest::Result) {
                    return Ok(());
                }

                let calculation = self.get_result(generator_state, generator)?;
                let submission = request.replace_contents(RequestKind::RemoteCalculation(calculation.clone()));
                self.update_submission(chain, &submission, &calculation, request, interest, foreground_only)
            }
            RequestKind::Object(object_id) => {
                if interest == Interest::ObjectifiedForm {
                    return Ok(());
                }
                if chain.entry.is_none() {
                    chain.entry = Some(self.keyed(request)?);
                }
                if let Some(keyed) = &chain.entry {
                    // immutable ids can change when objects are recomputed, so
                    // this hop is kept in memory only
                    self.drive(keyed, false, foreground_only, || {
                        Ok(Box::new(ObjectResolutionJob::new(
                            remote.clone(),
                            self.system.config().remote.clone(),
                            ctx,
                            object_id,
                        )))
                    })?;
                }

                let Some(immutable_id) = ready_id(chain)? else {
                    return Ok(());
                };
                let (next, next_state) = chain.next.get_or_insert_with(|| {
                    (
                        request.replace_contents(RequestKind::Immutable(immutable_id.as_str().into())),
                        ResolutionState::new(),
                    )
                });
                self.update(next_state, next, Interest::Result, foreground_only)
            }
            RequestKind::Immutable(immutable_id) => {
                if interest == Interest::ObjectifiedForm {
                    return Ok(());
                }
                if chain.entry.is_none() {
                    chain.entry = Some(self.keyed(request)?);
                }
                match &chain.entry {
                    Some(keyed) => self.drive(keyed, true, foreground_only, || {
                        Ok(Box::new(ImmutableFetchJob::new(remote.clone(), ctx, immutable_id)))
                    }),
                    None => Ok(()),
                }
            }
            _ => Err(ResolveError::internal(format!(
                "{:?} request is not remote",
                request.tag()
            ))),
        }
    }

    /// First hop of REMOTE_CALCULATION and META: post the calculation, then
    /// follow the object it produces.
    fn update_submission(
        &self,
        chain: &mut ChainState,
        submission: &Request,
        calculation: &Value,
        request: &Request,
        interest: Interest,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if chain.entry.is_none() {
            chain.entry = Some(self.keyed(submission)?);
        }
        if let Some(keyed) = &chain.entry {
            self.drive(keyed, true, foreground_only, || {
                Ok(Box::new(RemoteSubmissionJob::new(
                    self.system.remote().clone(),
                    self.system.config().remote.clone(),
                    self.context.context_id(),
                    calculation.clone(),
                )))
            })?;
        }

        if interest == Interest::ObjectifiedForm {
            return Ok(());
        }
        let Some(calculation_id) = ready_id(chain)? else {
            return Ok(());
        };
        if chain
            .next
            .as_ref()
            .is_some_and(|(next, _)| next.as_object() != Some(calculation_id.as_str()))
        {
            // the calculation was replaced since this state last looked
            chain.next = None;
        }
        let (next, next_state) = chain.next.get_or_insert_with(|| {
            (
                request.replace_contents(RequestKind::Object(calculation_id.as_str().into())),
                ResolutionState::new(),
            )
        });

        match self.update(next_state, next, Interest::Result, foreground_only) {
            Err(ResolveError::Job(err)) if canceled(&err, &calculation_id) => {
                self.resubmit(chain, calculation, &calculation_id, err, foreground_only)
            }
            other => other,
        }
    }

    /// Replaces a submitted calculation that was canceled later on: its
    /// definition is posted again, once per state, and the new id takes over
    /// the submission entry in memory and on disk.
    fn resubmit(
        &self,
        chain: &mut ChainState,
        calculation: &Value,
        calculation_id: &str,
        err: JobError,
        foreground_only: bool,
    ) -> Result<(), ResolveError> {
        if chain.resubmitted {
            return Err(ResolveError::Job(err));
        }
        if foreground_only {
            return Ok(());
        }
        let Some(keyed) = &chain.entry else {
            return Err(ResolveError::Job(err));
        };

        let job = RemoteSubmissionJob::new(
            self.system.remote().clone(),
            self.system.config().remote.clone(),
            self.context.context_id(),
            calculation.clone(),
        )
        .replacing(calculation_id);
        let stale = Value::String(calculation_id.to_string());
        // losing the race means another state already replaced it
        jobs::relaunch(
            self.system,
            &keyed.entry,
            &stale,
            Some(keyed.key.disk.clone()),
            Box::new(job),
        );

        chain.resubmitted = true;
        chain.next = None;
        Ok(())
    }

    /// Cache key and memory entry for a request in objectified form.
    fn keyed(&self, request: &Request) -> Result<Keyed, ResolveError> {
        let key = CacheKey::new(self.context.context_id(), request)?;
        let entry = self.system.memory_cache().entry(key.memory);
        Ok(Keyed { entry, key })
    }

    /// Makes sure something is producing the entry's value.
    fn drive<F>(&self, keyed: &Keyed, on_disk: bool, foreground_only: bool, job: F) -> Result<(), ResolveError>
    where
        F: FnOnce() -> Result<Box<dyn BackgroundJob>, ResolveError>,
    {
        match keyed.entry.status() {
            EntryStatus::Ready | EntryStatus::Computing { .. } => Ok(()),
            EntryStatus::Failed => match keyed.entry.error() {
                Some(err) => Err(ResolveError::Job(err)),
                None => Ok(()),
            },
            EntryStatus::Uninitialized | EntryStatus::Nowhere => {
                if !foreground_only {
                    let disk_key = on_disk.then(|| keyed.key.disk.clone());
                    jobs::launch(self.system, &keyed.entry, disk_key, job()?);
                }
                Ok(())
            }
        }
    }

    // ******************************
    // *        is_resolved         *
    // ******************************

    fn node_resolved(&self, payload: &Payload, request: &Request, interest: Interest) -> bool {
        if request.is_trivial() {
            return true;
        }

        match request.kind() {
            RequestKind::Function(f) if !f.runs_in_foreground() => {
                let Payload::Background(background) = payload else {
                    return false;
                };
                let args: Vec<&Request> = f.args.iter().collect();
                match interest {
                    Interest::ObjectifiedForm => {
                        self.children_resolved(&background.args, &args, Interest::ObjectifiedForm)
                    }
                    Interest::Result => background
                        .entry
                        .as_ref()
                        .is_some_and(|keyed| keyed.entry.is_ready()),
                }
            }
            RequestKind::Function(_)
            | RequestKind::Array(_)
            | RequestKind::Structure(_)
            | RequestKind::Property(_)
            | RequestKind::Union(_)
            | RequestKind::Some(_)
            | RequestKind::Required(_) => {
                self.children_resolved(payload, &request.children(), interest)
            }
            RequestKind::Object(_) | RequestKind::Immutable(_)
                if interest == Interest::ObjectifiedForm =>
            {
                true
            }
            RequestKind::RemoteCalculation(_)
            | RequestKind::Meta(_)
            | RequestKind::Object(_)
            | RequestKind::Immutable(_) => {
                let Payload::Chain(chain) = payload else {
                    return false;
                };
                let entry_ready = chain
                    .entry
                    .as_ref()
                    .is_some_and(|keyed| keyed.entry.is_ready());

                match (request.kind(), interest) {
                    (RequestKind::Immutable(_), _) => entry_ready,
                    (_, Interest::ObjectifiedForm) => entry_ready,
                    (_, Interest::Result) => {
                        entry_ready
                            && chain.next.as_ref().is_some_and(|(next, next_state)| {
                                self.is_resolved(next_state, next, Interest::Result)
                            })
                    }
                }
            }
            RequestKind::Immediate(_) | RequestKind::Isolated(_) => false,
        }
    }

    fn children_resolved(&self, payload: &Payload, children: &[&Request], interest: Interest) -> bool {
        children.iter().enumerate().all(|(i, child)| {
            child.is_trivial()
                || payload
                    .child(i)
                    .is_some_and(|state| self.is_resolved(state, child, interest))
        })
    }

    // ******************************
    // *         get_result         *
    // ******************************

    fn node_result(&self, payload: &Payload, request: &Request) -> Result<Value, ResolveError> {
        if request.is_trivial() {
            return trivial::evaluate(request);
        }

        match request.kind() {
            RequestKind::Function(f) if !f.runs_in_foreground() => {
                let Payload::Background(background) = payload else {
                    return Err(not_resolved(request));
                };
                let keyed = background.entry.as_ref().ok_or_else(|| not_resolved(request))?;
                match keyed.entry.value() {
                    Some(value) => Ok(value),
                    None => match keyed.entry.error() {
                        Some(source) => Err(ResolveError::Function {
                            id: f.function.id().to_string(),
                            source,
                        }),
                        None => Err(not_resolved(request)),
                    },
                }
            }
            RequestKind::Function(_)
            | RequestKind::Array(_)
            | RequestKind::Structure(_)
            | RequestKind::Property(_)
            | RequestKind::Union(_)
            | RequestKind::Some(_)
            | RequestKind::Required(_) => {
                let values = self.children_results(payload, &request.children())?;
                trivial::combine(request, values)
            }
            RequestKind::RemoteCalculation(_) | RequestKind::Meta(_) | RequestKind::Object(_) => {
                let Payload::Chain(chain) = payload else {
                    return Err(not_resolved(request));
                };
                let (next, next_state) = chain.next.as_ref().ok_or_else(|| not_resolved(request))?;
                self.get_result(next_state, next)
            }
            RequestKind::Immutable(_) => {
                let Payload::Chain(chain) = payload else {
                    return Err(not_resolved(request));
                };
                let keyed = chain.entry.as_ref().ok_or_else(|| not_resolved(request))?;
                match keyed.entry.value() {
                    Some(Value::Blob(data)) => request.descriptor().immutable_to_value(&data),
                    Some(other) => Err(ResolveError::internal(format!(
                        "immutable data cached as {}",
                        other.type_name()
                    ))),
                    None => match keyed.entry.error() {
                        Some(err) => Err(ResolveError::Job(err)),
                        None => Err(not_resolved(request)),
                    },
                }
            }
            RequestKind::Isolated(_) => Err(ResolveError::internal(
                "ISOLATED request reached outside preresolution",
            )),
            RequestKind::Immediate(_) => trivial::evaluate(request),
        }
    }

    fn children_results(&self, payload: &Payload, children: &[&Request]) -> Result<Vec<Value>, ResolveError> {
        children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                if child.is_trivial() {
                    trivial::evaluate(child)
                } else {
                    let state = payload.child(i).ok_or_else(|| not_resolved(child))?;
                    self.get_result(state, child)
                }
            })
            .collect()
    }
}

/// The request the payload actually tracks: the substituted tree when the
/// node had ISOLATED subrequests.
fn effective<'s>(state: &'s ResolutionState, request: &'s Request) -> Result<&'s Request, ResolveError> {
    if !request.has_isolated() {
        return Ok(request);
    }
    match (&state.preresolution.phase, &state.preresolution.substituted) {
        (PreresolutionPhase::Resolved, Some(substituted)) => Ok(substituted),
        _ => Err(ResolveError::internal("request is not preresolved")),
    }
}

/// The id held by a ready chain entry, if it is ready.
fn ready_id(chain: &ChainState) -> Result<Option<String>, ResolveError> {
    let Some(keyed) = &chain.entry else {
        return Ok(None);
    };
    match keyed.entry.value() {
        Some(Value::String(id)) => Ok(Some(id)),
        Some(other) => Err(ResolveError::internal(format!(
            "remote id cached as {}",
            other.type_name()
        ))),
        None => Ok(None),
    }
}

/// Whether `err` reports the cancellation of `calculation_id` itself rather
/// than of one of its dependencies.
fn canceled(err: &JobError, calculation_id: &str) -> bool {
    matches!(err.remote(), Some(RemoteError::CalculationCanceled(id)) if id == calculation_id)
}

fn not_resolved(request: &Request) -> ResolveError {
    ResolveError::internal(format!("{:?} request read before it was resolved", request.tag()))
}
