//! Fire-and-forget resolution for consumer threads.
//!
//! A [`BackgroundRequestPtr`] first tries to resolve its request right away
//! with foreground work only. When that isn't enough it files the request
//! with its [`BackgroundRequestSystem`], which hands it to a worker on the
//! RESOLUTION queue. Workers report back over a channel; the consumer pulls
//! those reports into a local batch once per tick with
//! [`gather_updates`](BackgroundRequestSystem::gather_updates) and lets each
//! handle pick up its own.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, Sender, channel};

use tracing::Level;

use crate::error::{JobError, ResolveError};
use crate::executor::{JobController, QueueType};
use crate::jobs::panic_message;
use crate::request::Request;
use crate::resolve::{Interest, ResolutionState, Resolved};
use crate::system::{ExecutionSystem, RequestContext};
use crate::value::{FromValue, Value};

/// Completion report of one background resolution.
#[derive(Debug)]
pub struct RequestUpdate {
    pub requester_id: u64,
    /// Distinguishes successive requests issued under the same requester id.
    pub ticket: u64,
    pub outcome: Result<Resolved, ResolveError>,
}

struct PendingRequest {
    requester_id: u64,
    ticket: u64,
    context: RequestContext,
    request: Request,
    interest: Interest,
    state: ResolutionState,
    controller: JobController,
}

/// Consumer-side hub for background requests.
///
/// Owned by one consumer thread. Workers only ever see the sending half of
/// the update channel.
pub struct BackgroundRequestSystem {
    system: ExecutionSystem,
    pending: Vec<PendingRequest>,
    sender: Sender<RequestUpdate>,
    receiver: Receiver<RequestUpdate>,
    updates: Vec<RequestUpdate>,
    next_requester_id: u64,
    next_ticket: u64,
}

impl BackgroundRequestSystem {
    pub fn new(system: ExecutionSystem) -> Self {
        let (sender, receiver) = channel();
        Self {
            system,
            pending: Vec::new(),
            sender,
            receiver,
            updates: Vec::new(),
            next_requester_id: 1,
            next_ticket: 1,
        }
    }

    pub fn system(&self) -> &ExecutionSystem {
        &self.system
    }

    /// A requester id not handed out before by this system.
    pub fn new_requester_id(&mut self) -> u64 {
        let id = self.next_requester_id;
        self.next_requester_id += 1;
        id
    }

    /// Number of requests filed but not yet issued.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Schedules every filed request on the RESOLUTION queue. Requests whose
    /// handle went away in the meantime are dropped.
    pub fn issue_new_requests(&mut self) {
        for pending in self.pending.drain(..) {
            if pending.controller.is_canceled() {
                tracing::trace!("dropping canceled request {}", pending.requester_id);
                continue;
            }

            ResolutionJob {
                system: self.system.clone(),
                sender: self.sender.clone(),
                pending,
            }
            .submit();
        }
    }

    /// Moves everything workers have reported so far into the local batch.
    pub fn gather_updates(&mut self) {
        self.updates.extend(self.receiver.try_iter());
    }

    /// Ends the current tick. Updates no handle picked up are discarded.
    pub fn clear_updates(&mut self) {
        self.updates.clear();
    }

    fn take_update(&mut self, requester_id: u64, ticket: u64) -> Option<RequestUpdate> {
        let index = self
            .updates
            .iter()
            .position(|update| update.requester_id == requester_id && update.ticket == ticket)?;
        Some(self.updates.swap_remove(index))
    }

    fn file(&mut self, mut pending: PendingRequest) -> u64 {
        pending.ticket = self.next_ticket;
        self.next_ticket += 1;
        let ticket = pending.ticket;
        self.pending.push(pending);
        ticket
    }
}

/// One background resolution: a request tree driven on the RESOLUTION
/// queue until it resolves, fails, or its handle cancels it.
struct ResolutionJob {
    system: ExecutionSystem,
    sender: Sender<RequestUpdate>,
    pending: PendingRequest,
}

impl ResolutionJob {
    fn submit(self) {
        let system = self.system.clone();
        system.submit(QueueType::Resolution, Box::new(move || self.run()));
    }

    fn run(mut self) {
        let span = tracing::span!(Level::INFO, "resolve", requester = self.pending.requester_id);
        let _enter = span.enter();

        if self.pending.controller.is_canceled() {
            tracing::debug!("canceled");
            return;
        }

        let since = self.system.memory_cache().generation();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.step())) {
            Ok(outcome) => outcome,
            Err(panic) => Some(Err(ResolveError::Job(JobError::new(anyhow::anyhow!(
                "Resolution panicked: {}",
                panic_message(&*panic)
            ))))),
        };

        match outcome {
            Some(outcome) => {
                if let Err(e) = &outcome {
                    tracing::warn!("failed: {e}");
                }
                let update = RequestUpdate {
                    requester_id: self.pending.requester_id,
                    ticket: self.pending.ticket,
                    outcome,
                };
                if self.sender.send(update).is_err() {
                    tracing::trace!("request system is gone, dropping update");
                }
            }
            None => {
                // nothing to do until some cache entry changes
                let timeout = self.system.config().poll_interval();
                self.system.memory_cache().wait_for_change(since, timeout);
                self.submit();
            }
        }
    }

    /// Drives the tree once. Returns the outcome once there is one.
    fn step(&mut self) -> Option<Result<Resolved, ResolveError>> {
        let pending = &mut self.pending;
        let resolver = self.system.resolver(&pending.context);

        if let Err(e) = resolver.update(&mut pending.state, &pending.request, pending.interest, false) {
            return Some(Err(e));
        }
        resolver
            .is_resolved(&pending.state, &pending.request, pending.interest)
            .then(|| resolver.finish(&pending.state, &pending.request, pending.interest))
    }
}

/// Consumer-side handle to a request resolved in the background.
///
/// Dropping the handle, or resetting it to another request, cancels the
/// background resolution still running for the old one.
#[derive(Default)]
pub struct BackgroundRequestPtr {
    requester_id: u64,
    ticket: u64,
    controller: Option<JobController>,
    outcome: Option<Result<Resolved, ResolveError>>,
}

impl BackgroundRequestPtr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts resolving `request` for `interest`.
    ///
    /// When foreground work alone resolves the request, the handle is
    /// resolved on return. Otherwise the request is filed with `system` and
    /// picked up by the next [`issue_new_requests`](BackgroundRequestSystem::issue_new_requests).
    ///
    /// Resetting cancels the resolution driving the previous request and
    /// discards its late updates. Cache entry jobs it already launched keep
    /// running: their entries are shared with every other resolution of the
    /// same data, and their results stay cached. Use
    /// [`ExecutionSystem::reset_cached_data`] to stop one of those.
    pub fn reset(
        &mut self,
        system: &mut BackgroundRequestSystem,
        requester_id: u64,
        context: &RequestContext,
        request: Request,
        interest: Interest,
    ) {
        self.cancel();
        self.requester_id = requester_id;
        self.ticket = 0;
        self.outcome = None;

        let mut state = ResolutionState::new();
        let resolver = system.system().resolver(context);
        match resolver.update(&mut state, &request, interest, true) {
            Err(e) => {
                self.outcome = Some(Err(e));
                return;
            }
            Ok(()) if resolver.is_resolved(&state, &request, interest) => {
                self.outcome = Some(resolver.finish(&state, &request, interest));
                return;
            }
            Ok(()) => {}
        }

        let controller = JobController::new();
        self.ticket = system.file(PendingRequest {
            requester_id,
            ticket: 0,
            context: context.clone(),
            request,
            interest,
            state,
            controller: controller.clone(),
        });
        self.controller = Some(controller);
    }

    /// Picks up this handle's completion from the current update batch.
    /// Returns true only on the call that delivered it.
    pub fn update(&mut self, system: &mut BackgroundRequestSystem) -> bool {
        if self.outcome.is_some() || self.controller.is_none() {
            return false;
        }
        match system.take_update(self.requester_id, self.ticket) {
            Some(update) => {
                self.outcome = Some(update.outcome);
                self.controller = None;
                true
            }
            None => false,
        }
    }

    pub fn requester_id(&self) -> u64 {
        self.requester_id
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&Result<Resolved, ResolveError>> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Some(Ok(Resolved::Result(value))) => Some(value),
            _ => None,
        }
    }

    /// The result converted to a concrete type. `Ok(None)` until resolved.
    pub fn get<T: FromValue>(&self) -> Result<Option<T>, ResolveError> {
        match &self.outcome {
            None => Ok(None),
            Some(Err(e)) => Err(e.clone()),
            Some(Ok(Resolved::Result(value))) => Ok(Some(T::from_value(value.clone())?)),
            Some(Ok(Resolved::ObjectifiedForm(_))) => Err(ResolveError::internal(
                "handle was resolved for its objectified form",
            )),
        }
    }

    pub fn objectified_form(&self) -> Option<&Request> {
        match &self.outcome {
            Some(Ok(Resolved::ObjectifiedForm(form))) => Some(form),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ResolveError> {
        match &self.outcome {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    fn cancel(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.cancel();
        }
    }
}

impl Drop for BackgroundRequestPtr {
    fn drop(&mut self) {
        self.cancel();
    }
}
