use crate::error::ResolveError;
use crate::request::{Request, RequestKind};
use crate::resolve::state::Payload;
use crate::resolve::{ResolutionState, Resolver, effective, not_resolved, ready_id, trivial};

impl Resolver<'_> {
    /// A reference-only version of a request whose objectification is
    /// complete.
    ///
    /// Trivial parts collapse to IMMEDIATE values, submitted calculations
    /// become OBJECT references to their calculation id, OBJECT and
    /// IMMUTABLE stay as they are, and everything else keeps its shape with
    /// objectified children.
    pub fn get_objectified_form(
        &self,
        state: &ResolutionState,
        request: &Request,
    ) -> Result<Request, ResolveError> {
        let request = effective(state, request)?;
        self.node_objectified(&state.payload, request)
    }

    fn node_objectified(&self, payload: &Payload, request: &Request) -> Result<Request, ResolveError> {
        if request.is_trivial() {
            return immediate(request);
        }

        match request.kind() {
            RequestKind::Function(f) if !f.runs_in_foreground() => match payload {
                Payload::Background(background) => self.objectify_children(&background.args, request),
                _ => Err(not_resolved(request)),
            },
            RequestKind::Function(_)
            | RequestKind::Array(_)
            | RequestKind::Structure(_)
            | RequestKind::Property(_)
            | RequestKind::Union(_)
            | RequestKind::Some(_)
            | RequestKind::Required(_) => self.objectify_children(payload, request),
            RequestKind::RemoteCalculation(_) | RequestKind::Meta(_) => {
                let Payload::Chain(chain) = payload else {
                    return Err(not_resolved(request));
                };
                match ready_id(chain)? {
                    Some(calculation_id) => Ok(request
                        .replace_contents(RequestKind::Object(calculation_id.as_str().into()))),
                    None => Err(not_resolved(request)),
                }
            }
            RequestKind::Object(_) | RequestKind::Immutable(_) => Ok(request.clone()),
            RequestKind::Isolated(_) => Err(ResolveError::internal(
                "ISOLATED request reached outside preresolution",
            )),
            RequestKind::Immediate(_) => immediate(request),
        }
    }

    /// `request` rebuilt with every child in objectified form.
    pub(super) fn objectify_children(
        &self,
        payload: &Payload,
        request: &Request,
    ) -> Result<Request, ResolveError> {
        let children = request
            .children()
            .into_iter()
            .enumerate()
            .map(|(i, child)| {
                if child.is_trivial() {
                    immediate(child)
                } else {
                    let state = payload.child(i).ok_or_else(|| not_resolved(child))?;
                    self.get_objectified_form(state, child)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(request.replace_contents(request.kind().with_children(children)?))
    }
}

fn immediate(request: &Request) -> Result<Request, ResolveError> {
    Ok(Request::value(
        trivial::evaluate(request)?,
        request.descriptor().clone(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::request::{Request, RequestKind, typed, untyped};
    use crate::resolve::{Interest, ResolutionState, Resolved};
    use crate::testing::{Harness, MockRemote, add, slow_double};
    use crate::value::Value;

    #[test]
    fn test_trivial_collapses_to_immediate() {
        let harness = Harness::new();
        let sum = Request::function(
            add(),
            vec![Request::immediate(1i64), Request::immediate(2i64)],
            typed::<i64>(),
        );

        let Resolved::ObjectifiedForm(form) = harness.resolve(&sum, Interest::ObjectifiedForm).unwrap()
        else {
            panic!("expected an objectified form");
        };
        assert_eq!(form.as_immediate(), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_background_function_keeps_shape_without_running() {
        let harness = Harness::new();
        let inner = Request::function(
            add(),
            vec![Request::immediate(1i64), Request::immediate(2i64)],
            typed::<i64>(),
        );
        let slow = Request::function(slow_double(), vec![inner], typed::<i64>());

        let Resolved::ObjectifiedForm(form) = harness.resolve(&slow, Interest::ObjectifiedForm).unwrap()
        else {
            panic!("expected an objectified form");
        };
        let function = form.as_function().unwrap();
        assert_eq!(function.function.id(), "slow_double");
        assert_eq!(function.args[0].as_immediate(), Some(&Value::Integer(3)));
        assert_eq!(harness.submitted(crate::executor::QueueType::Calculation), 0);
    }

    #[test]
    fn test_remote_calculation_becomes_object() {
        let remote = MockRemote::new()
            .with_status("calc-1", vec![crate::remote::CalculationStatus::Queued]);
        let harness = Harness::with_remote(remote);
        let calc = Request::remote_calculation(Value::String("sum".into()), untyped());
        let array = Request::array(vec![calc, Request::immediate(1i64)], untyped());

        let mut state = ResolutionState::new();
        let Resolved::ObjectifiedForm(form) = harness
            .resolve_with(&mut state, &array, Interest::ObjectifiedForm)
            .unwrap()
        else {
            panic!("expected an objectified form");
        };

        let items = form.as_array().unwrap();
        assert_eq!(items[0].as_object(), Some("calc-1"));
        assert_eq!(items[1].as_immediate(), Some(&Value::Integer(1)));
        assert!(matches!(form.kind(), RequestKind::Array(_)));
        assert_eq!(harness.remote.calls("resolve_object"), 0);
    }
}
