use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::TypeError;
use crate::executor::CheckIn;
use crate::value::Value;

/// What a function sees of the job it runs in.
///
/// Functions evaluated on the consumer thread get a context whose check-in
/// always succeeds and whose progress reports go nowhere.
pub struct CallContext<'a> {
    check_in: Option<&'a CheckIn>,
    progress: Option<&'a (dyn Fn(f32) + Sync)>,
}

impl<'a> CallContext<'a> {
    pub fn foreground() -> Self {
        Self {
            check_in: None,
            progress: None,
        }
    }

    pub(crate) fn background(check_in: &'a CheckIn, progress: &'a (dyn Fn(f32) + Sync)) -> Self {
        Self {
            check_in: Some(check_in),
            progress: Some(progress),
        }
    }

    /// Fails once the job running this function has been canceled.
    pub fn check_in(&self) -> anyhow::Result<()> {
        match self.check_in {
            Some(check_in) => Ok(check_in.check_in()?),
            None => Ok(()),
        }
    }

    /// Reports progress in `[0, 1]`.
    pub fn report_progress(&self, progress: f32) {
        if let Some(report) = self.progress {
            report(progress.clamp(0.0, 1.0));
        }
    }
}

/// A registered function a FUNCTION request applies to its arguments.
///
/// Functions must be pure: the engine memoizes their results by the
/// (objectified) request that produced them, in memory and on disk.
pub trait Function: Send + Sync {
    /// Stable identifier. Part of every cache key involving this function.
    fn id(&self) -> &str;

    /// Cheap enough to run on the consumer thread.
    fn is_foreground_cheap(&self) -> bool {
        false
    }

    fn call(&self, args: &[Value], ctx: &CallContext<'_>) -> anyhow::Result<Value>;
}

type FnPtr = Arc<dyn Fn(&[Value], &CallContext<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// [`Function`] backed by a closure.
pub struct FnFunction {
    id: ArcStr,
    foreground: bool,
    func: FnPtr,
}

impl FnFunction {
    /// A background function.
    pub fn new<F>(id: &str, func: F) -> Self
    where
        F: Fn(&[Value], &CallContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            foreground: false,
            func: Arc::new(func),
        }
    }

    /// Marks the function as cheap enough for the consumer thread.
    pub fn foreground(mut self) -> Self {
        self.foreground = true;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Function> {
        Arc::new(self)
    }
}

impl Function for FnFunction {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_foreground_cheap(&self) -> bool {
        self.foreground
    }

    fn call(&self, args: &[Value], ctx: &CallContext<'_>) -> anyhow::Result<Value> {
        (self.func)(args, ctx)
    }
}

impl std::fmt::Debug for FnFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnFunction({})", self.id)
    }
}

/// Builds a structure value out of resolved fields.
pub trait StructureConstructor: Send + Sync {
    fn id(&self) -> &str;

    fn construct(&self, fields: BTreeMap<String, Value>) -> Result<Value, TypeError>;
}

/// Constructs a plain record: a map from field names to values.
pub struct RecordConstructor;

impl StructureConstructor for RecordConstructor {
    fn id(&self) -> &str {
        "record"
    }

    fn construct(&self, fields: BTreeMap<String, Value>) -> Result<Value, TypeError> {
        Ok(Value::Map(fields))
    }
}

/// Pulls one field out of a resolved record.
pub trait PropertyExtractor: Send + Sync {
    fn id(&self) -> &str;

    fn extract(&self, record: Value, field: &str) -> Result<Value, TypeError>;
}

/// Reads a field of a map value.
pub struct FieldExtractor;

impl PropertyExtractor for FieldExtractor {
    fn id(&self) -> &str {
        "field"
    }

    fn extract(&self, record: Value, field: &str) -> Result<Value, TypeError> {
        record.take_field(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobController;

    #[test]
    fn test_foreground_context_never_cancels() {
        let ctx = CallContext::foreground();
        assert!(ctx.check_in().is_ok());
        ctx.report_progress(0.5);
    }

    #[test]
    fn test_background_context_reports() {
        let controller = JobController::new();
        let check_in = controller.check_in();
        let seen = std::sync::Mutex::new(Vec::new());
        let report = |p: f32| seen.lock().unwrap().push(p);

        let ctx = CallContext::background(&check_in, &report);
        ctx.report_progress(2.0);
        assert!(ctx.check_in().is_ok());

        controller.cancel();
        assert!(ctx.check_in().is_err());
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_fn_function() {
        let f = FnFunction::new("add", |args, _| {
            let sum = args
                .iter()
                .map(|a| match a {
                    Value::Integer(i) => *i,
                    _ => 0,
                })
                .sum();
            Ok(Value::Integer(sum))
        })
        .foreground();

        assert_eq!(f.id(), "add");
        assert!(f.is_foreground_cheap());
        let out = f
            .call(&[Value::Integer(2), Value::Integer(3)], &CallContext::foreground())
            .unwrap();
        assert_eq!(out, Value::Integer(5));
    }
}
