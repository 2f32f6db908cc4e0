//! Stateless evaluation of trivial requests and the value-combining rules
//! shared by every composite kind.

use crate::error::ResolveError;
use crate::request::{CallContext, Request, RequestKind};
use crate::value::Value;

/// Computes the value of a trivial request on the calling thread.
pub(crate) fn evaluate(request: &Request) -> Result<Value, ResolveError> {
    let value = match request.kind() {
        RequestKind::Immediate(value) => value.clone(),
        _ if request.is_trivial() => {
            let values = request
                .children()
                .into_iter()
                .map(evaluate)
                .collect::<Result<Vec<_>, _>>()?;
            combine(request, values)?
        }
        _ => {
            return Err(ResolveError::internal(format!(
                "{:?} request is not trivial",
                request.tag()
            )));
        }
    };

    Ok(request.descriptor().check(value)?)
}

/// Builds the value of a composite node out of its children's values, given
/// in tree order.
pub(crate) fn combine(request: &Request, values: Vec<Value>) -> Result<Value, ResolveError> {
    match request.kind() {
        RequestKind::Function(f) => f
            .function
            .call(&values, &CallContext::foreground())
            .map_err(|e| ResolveError::Function {
                id: f.function.id().to_string(),
                source: e.into(),
            }),
        RequestKind::Array(_) => Ok(Value::Array(values)),
        RequestKind::Structure(s) => {
            let fields = s.fields.keys().cloned().zip(values).collect();
            Ok(s.constructor.construct(fields)?)
        }
        RequestKind::Property(p) => Ok(p.extractor.extract(single(values)?, &p.field)?),
        RequestKind::Union(u) => Ok(Value::union(u.member.clone(), single(values)?)),
        RequestKind::Some(_) => Ok(Value::some(single(values)?)),
        RequestKind::Required(_) => single(values)?
            .into_optional()?
            .ok_or(ResolveError::EmptyOptional),
        _ => Err(ResolveError::internal(format!(
            "{:?} request is not composite",
            request.tag()
        ))),
    }
}

fn single(values: Vec<Value>) -> Result<Value, ResolveError> {
    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(ResolveError::internal("expected exactly one child value")),
    }
}
