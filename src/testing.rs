//! Fixtures shared by the unit tests: sample functions, a scripted remote
//! service and a harness pumping a manual scheduler.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::codec;
use crate::config::SystemConfig;
use crate::error::{RemoteError, ResolveError};
use crate::executor::{ManualScheduler, QueueType};
use crate::remote::{CalculationStatus, ObjectLookup, RemoteService};
use crate::request::{FnFunction, Function, Request};
use crate::resolve::{Interest, ResolutionState, Resolved, Resolver};
use crate::system::{ExecutionSystem, RequestContext};
use crate::value::Value;

fn integer(value: &Value) -> anyhow::Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        other => anyhow::bail!("expected an integer, got {}", other.type_name()),
    }
}

/// Foreground sum of integer arguments.
pub(crate) fn add() -> Arc<dyn Function> {
    FnFunction::new("add", |args, _| {
        let mut sum = 0;
        for arg in args {
            sum += integer(arg)?;
        }
        Ok(Value::Integer(sum))
    })
    .foreground()
    .into_arc()
}

/// Background doubling of one integer.
pub(crate) fn slow_double() -> Arc<dyn Function> {
    FnFunction::new("slow_double", |args, ctx| {
        ctx.check_in()?;
        let x = integer(args.first().unwrap_or(&Value::Nil))?;
        ctx.report_progress(1.0);
        Ok(Value::Integer(x * 2))
    })
    .into_arc()
}

/// Background function that always fails.
pub(crate) fn failing() -> Arc<dyn Function> {
    FnFunction::new("failing", |_, _| anyhow::bail!("boom")).into_arc()
}

/// Scripted [`RemoteService`].
///
/// Responses for an id are consumed front to back; the last one repeats.
/// Posted calculations get the ids `calc-1`, `calc-2`, ... in order.
#[derive(Default)]
pub(crate) struct MockRemote {
    objects: Mutex<BTreeMap<String, VecDeque<ObjectLookup>>>,
    statuses: Mutex<BTreeMap<String, VecDeque<CalculationStatus>>>,
    immutables: Mutex<BTreeMap<String, Vec<u8>>>,
    definitions: Mutex<BTreeMap<String, Value>>,
    posted: Mutex<Vec<Value>>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
}

fn next<T: Clone>(map: &Mutex<BTreeMap<String, VecDeque<T>>>, id: &str) -> Option<T> {
    let mut map = map.lock().unwrap();
    let queue = map.get_mut(id)?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn not_found(endpoint: String) -> RemoteError {
    RemoteError::Http {
        endpoint,
        status: 404,
        message: "not found".into(),
    }
}

impl MockRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_object(self, id: &str, lookups: Vec<ObjectLookup>) -> Self {
        self.objects.lock().unwrap().insert(id.into(), lookups.into());
        self
    }

    pub(crate) fn with_status(self, id: &str, statuses: Vec<CalculationStatus>) -> Self {
        self.statuses.lock().unwrap().insert(id.into(), statuses.into());
        self
    }

    pub(crate) fn with_immutable(self, id: &str, data: Vec<u8>) -> Self {
        self.immutables.lock().unwrap().insert(id.into(), data);
        self
    }

    /// Stores `value` the way immutable data is serialized.
    pub(crate) fn with_immutable_value(self, id: &str, value: &Value) -> Self {
        let data = codec::encode(value).unwrap();
        self.with_immutable(id, data)
    }

    pub(crate) fn with_definition(self, id: &str, definition: Value) -> Self {
        self.definitions.lock().unwrap().insert(id.into(), definition);
        self
    }

    /// How many times the named trait method was called.
    pub(crate) fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn posted(&self) -> Vec<Value> {
        self.posted.lock().unwrap().clone()
    }

    fn count(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }
}

impl RemoteService for MockRemote {
    fn resolve_object(&self, _: &str, object_id: &str) -> Result<ObjectLookup, RemoteError> {
        self.count("resolve_object");
        next(&self.objects, object_id).ok_or_else(|| not_found(format!("/iss/{object_id}/immutable")))
    }

    fn fetch_immutable(&self, _: &str, immutable_id: &str) -> Result<Vec<u8>, RemoteError> {
        self.count("fetch_immutable");
        self.immutables
            .lock()
            .unwrap()
            .get(immutable_id)
            .cloned()
            .ok_or_else(|| not_found(format!("/iss/immutable/{immutable_id}")))
    }

    fn post_calculation(&self, _: &str, calculation: &Value) -> Result<String, RemoteError> {
        self.count("post_calculation");
        let mut posted = self.posted.lock().unwrap();
        posted.push(calculation.clone());
        Ok(format!("calc-{}", posted.len()))
    }

    fn calculation_status(&self, _: &str, calculation_id: &str) -> Result<CalculationStatus, RemoteError> {
        self.count("calculation_status");
        next(&self.statuses, calculation_id)
            .ok_or_else(|| not_found(format!("/calc/{calculation_id}/status")))
    }

    fn calculation_definition(&self, _: &str, calculation_id: &str) -> Result<Value, RemoteError> {
        self.count("calculation_definition");
        self.definitions
            .lock()
            .unwrap()
            .get(calculation_id)
            .cloned()
            .ok_or_else(|| not_found(format!("/calc/{calculation_id}")))
    }

    fn wait_for_calculation(&self, _: &str, calculation_id: &str) -> Result<CalculationStatus, RemoteError> {
        self.count("wait_for_calculation");
        next(&self.statuses, calculation_id)
            .ok_or_else(|| not_found(format!("/calc/{calculation_id}/status")))
    }
}

/// A system on a [`ManualScheduler`] with a [`MockRemote`], tuned so that
/// nothing in a test ever sleeps for long.
pub(crate) struct Harness {
    pub(crate) system: ExecutionSystem,
    pub(crate) scheduler: Arc<ManualScheduler>,
    pub(crate) context: RequestContext,
    pub(crate) remote: Arc<MockRemote>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_remote(MockRemote::new())
    }

    pub(crate) fn with_remote(remote: MockRemote) -> Self {
        Self::with(remote, SystemConfig::default())
    }

    pub(crate) fn with(remote: MockRemote, mut config: SystemConfig) -> Self {
        config.poll_interval_ms = 1;
        config.remote.retry_delay_ms = 0;

        let scheduler = Arc::new(ManualScheduler::new());
        let remote = Arc::new(remote);
        let system = ExecutionSystem::builder()
            .config(config)
            .scheduler(scheduler.clone())
            .remote(remote.clone())
            .build()
            .unwrap();

        Self {
            system,
            scheduler,
            context: RequestContext::new("test"),
            remote,
        }
    }

    pub(crate) fn resolver(&self) -> Resolver<'_> {
        self.system.resolver(&self.context)
    }

    pub(crate) fn submitted(&self, queue: QueueType) -> usize {
        self.scheduler.submitted(queue)
    }

    pub(crate) fn resolve(&self, request: &Request, interest: Interest) -> Result<Resolved, ResolveError> {
        let mut state = ResolutionState::new();
        self.resolve_with(&mut state, request, interest)
    }

    /// Alternates updates with draining the scheduler until `request` is
    /// resolved.
    pub(crate) fn resolve_with(
        &self,
        state: &mut ResolutionState,
        request: &Request,
        interest: Interest,
    ) -> Result<Resolved, ResolveError> {
        let resolver = self.resolver();
        for _ in 0..100 {
            resolver.update(state, request, interest, false)?;
            if resolver.is_resolved(state, request, interest) {
                return resolver.finish(state, request, interest);
            }
            self.scheduler.run_until_idle(100);
        }
        panic!("{request:?} did not resolve");
    }
}
