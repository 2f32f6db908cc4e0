//! Resolution of ISOLATED subrequests ahead of their parent.
//!
//! A node with ISOLATED descendants first collects them, resolves each one
//! on its own, and then swaps every ISOLATED node for its resolved form.
//! Only the substituted tree is ever resolved further, so two parents that
//! embed the same isolated subgraph share one computation of it and end up
//! with the same cache keys.

use crate::error::ResolveError;
use crate::request::{Request, RequestKind};
use crate::resolve::state::Preresolution;
use crate::resolve::{Interest, PreresolutionPhase, ResolutionState, Resolver};

impl Resolver<'_> {
    /// Advances preresolution of `request`. Returns whether it is complete.
    pub(super) fn update_preresolution(
        &self,
        pre: &mut Preresolution,
        request: &Request,
        foreground_only: bool,
    ) -> Result<bool, ResolveError> {
        match pre.phase {
            PreresolutionPhase::Resolved => return Ok(true),
            PreresolutionPhase::Uninitialized => {
                collect_isolated(request, &mut pre.collected);
                pre.states = pre.collected.iter().map(|_| ResolutionState::new()).collect();
                pre.phase = PreresolutionPhase::Resolving;
            }
            PreresolutionPhase::Resolving => {}
        }

        let mut done = true;
        for (subrequest, state) in pre.collected.iter().zip(pre.states.iter_mut()) {
            let interest = interest_for(subrequest);
            self.update(state, subrequest, interest, foreground_only)?;
            done &= self.is_resolved(state, subrequest, interest);
        }
        if !done {
            return Ok(false);
        }

        let replacements = pre
            .collected
            .iter()
            .zip(pre.states.iter())
            .map(|(subrequest, state)| match interest_for(subrequest) {
                Interest::ObjectifiedForm => self.get_objectified_form(state, subrequest),
                Interest::Result => Ok(Request::value(
                    self.get_result(state, subrequest)?,
                    subrequest.descriptor().clone(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut replacements = replacements.into_iter();
        let substituted = substitute(request, &mut replacements)?;
        if replacements.next().is_some() {
            return Err(ResolveError::internal("unused preresolution substitutions"));
        }

        tracing::trace!("preresolved {} isolated subrequests", pre.collected.len());
        pre.substituted = Some(substituted);
        pre.collected.clear();
        pre.states.clear();
        pre.phase = PreresolutionPhase::Resolved;
        Ok(true)
    }
}

/// Remote-shaped subrequests are shared by reference, everything else by
/// value.
fn interest_for(request: &Request) -> Interest {
    if request.tag().is_remote_shaped() {
        Interest::ObjectifiedForm
    } else {
        Interest::Result
    }
}

/// Inner requests of the outermost ISOLATED nodes, in pre-order.
fn collect_isolated(request: &Request, out: &mut Vec<Request>) {
    if !request.has_isolated() {
        return;
    }
    match request.kind() {
        RequestKind::Isolated(inner) => out.push(inner.clone()),
        _ => {
            for child in request.children() {
                collect_isolated(child, out);
            }
        }
    }
}

/// `request` with its outermost ISOLATED nodes replaced, in pre-order, by
/// the items of `replacements`.
fn substitute(
    request: &Request,
    replacements: &mut impl Iterator<Item = Request>,
) -> Result<Request, ResolveError> {
    if !request.has_isolated() {
        return Ok(request.clone());
    }
    if let RequestKind::Isolated(_) = request.kind() {
        return replacements
            .next()
            .ok_or_else(|| ResolveError::internal("missing preresolution substitution"));
    }

    let children = request
        .children()
        .into_iter()
        .map(|child| substitute(child, replacements))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(request.replace_contents(request.kind().with_children(children)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueueType;
    use crate::request::{typed, untyped};
    use crate::resolve::Resolved;
    use crate::testing::{Harness, MockRemote, add, slow_double};
    use crate::value::Value;

    fn isolated_double(x: i64) -> Request {
        Request::isolated(Request::function(
            slow_double(),
            vec![Request::immediate(x)],
            typed::<i64>(),
        ))
    }

    #[test]
    fn test_collects_outermost_in_order() {
        let nested = Request::isolated(Request::array(vec![isolated_double(1)], untyped()));
        let tree = Request::array(vec![isolated_double(2), Request::immediate(0i64), nested], untyped());

        let mut out = Vec::new();
        collect_isolated(&tree, &mut out);

        assert_eq!(out.len(), 2);
        assert!(out[0].as_function().is_some());
        assert!(out[1].as_array().is_some());
    }

    #[test]
    fn test_substitutes_in_tree_order() {
        let tree = Request::array(
            vec![isolated_double(1), Request::immediate(0i64), isolated_double(2)],
            untyped(),
        );
        let mut replacements = vec![Request::immediate(10i64), Request::immediate(20i64)].into_iter();

        let out = substitute(&tree, &mut replacements).unwrap();
        let items = out.as_array().unwrap();
        assert_eq!(items[0].as_immediate(), Some(&Value::Integer(10)));
        assert_eq!(items[2].as_immediate(), Some(&Value::Integer(20)));
        assert!(!out.has_isolated());
    }

    #[test]
    fn test_substitution_count_mismatch_is_internal() {
        let tree = Request::array(vec![isolated_double(1)], untyped());
        let mut replacements = std::iter::empty();
        assert!(substitute(&tree, &mut replacements).unwrap_err().is_internal());
    }

    #[test]
    fn test_parents_share_isolated_work() {
        let harness = Harness::new();
        let first = Request::function(
            add(),
            vec![isolated_double(21), Request::immediate(1i64)],
            typed::<i64>(),
        );
        let second = Request::array(vec![isolated_double(21)], untyped());

        let Resolved::Result(a) = harness.resolve(&first, Interest::Result).unwrap() else {
            panic!("expected a result");
        };
        let Resolved::Result(b) = harness.resolve(&second, Interest::Result).unwrap() else {
            panic!("expected a result");
        };

        assert_eq!(a, Value::Integer(43));
        assert_eq!(b, Value::Array(vec![Value::Integer(42)]));
        assert_eq!(harness.submitted(QueueType::Calculation), 1);
    }

    #[test]
    fn test_update_waits_for_preresolution() {
        let harness = Harness::new();
        let request = Request::array(vec![isolated_double(3)], untyped());
        let resolver = harness.resolver();
        let mut state = ResolutionState::new();

        resolver.update(&mut state, &request, Interest::Result, false).unwrap();
        assert!(!resolver.is_preresolved(&state, &request));
        assert_eq!(state.preresolution_phase(), PreresolutionPhase::Resolving);
        assert!(!resolver.is_resolved(&state, &request, Interest::Result));

        harness.scheduler.run_until_idle(10);
        resolver.update(&mut state, &request, Interest::Result, false).unwrap();
        assert!(resolver.is_preresolved(&state, &request));
        assert_eq!(
            resolver.get_result(&state, &request).unwrap(),
            Value::Array(vec![Value::Integer(6)])
        );
    }

    #[test]
    fn test_remote_isolated_is_shared_by_reference() {
        let remote = MockRemote::new()
            .with_status("calc-1", vec![crate::remote::CalculationStatus::Completed]);
        let harness = Harness::with_remote(remote);
        let calculation = Request::remote_calculation(Value::String("mesh".into()), untyped());
        let parent = Request::array(vec![Request::isolated(calculation)], untyped());

        let Resolved::ObjectifiedForm(form) =
            harness.resolve(&parent, Interest::ObjectifiedForm).unwrap()
        else {
            panic!("expected an objectified form");
        };

        assert_eq!(form.as_array().unwrap()[0].as_object(), Some("calc-1"));
        assert_eq!(harness.remote.calls("resolve_object"), 0);
    }
}
