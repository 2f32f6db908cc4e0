//! The request model: immutable, pre-hashed trees describing deferred
//! computations.
//!
//! A [`Request`] is a cheap handle (`Arc`) to a node. Nodes are built bottom-up
//! and never change, so a node's structural hash, triviality and whether any
//! descendant is ISOLATED are computed once at construction.

mod descriptor;
mod function;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

pub use crate::request::descriptor::{Descriptor, ResultDescriptor, Typed, Untyped, typed, untyped};
pub use crate::request::function::{
    CallContext, FieldExtractor, FnFunction, Function, PropertyExtractor, RecordConstructor,
    StructureConstructor,
};

use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::error::ResolveError;
use crate::value::{FromValue, IntoValue, Value};

/// Kind tag of a request node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTag {
    Immediate,
    Function,
    Array,
    Structure,
    Property,
    Union,
    Some,
    Required,
    Isolated,
    RemoteCalculation,
    Meta,
    Object,
    Immutable,
}

impl RequestTag {
    /// Kinds whose identity is a remote reference. Sharing one only needs
    /// that reference, never the data behind it.
    pub fn is_remote_shaped(self) -> bool {
        matches!(
            self,
            RequestTag::RemoteCalculation
                | RequestTag::Meta
                | RequestTag::Object
                | RequestTag::Immutable
        )
    }
}

#[derive(Clone)]
pub struct FunctionRequest {
    pub function: Arc<dyn Function>,
    pub args: Vec<Request>,
    pub force_foreground: bool,
}

impl FunctionRequest {
    /// Whether the function itself is evaluated on the consumer thread.
    pub fn runs_in_foreground(&self) -> bool {
        self.force_foreground || self.function.is_foreground_cheap()
    }
}

#[derive(Clone)]
pub struct StructureRequest {
    pub fields: BTreeMap<String, Request>,
    pub constructor: Arc<dyn StructureConstructor>,
}

#[derive(Clone)]
pub struct PropertyRequest {
    pub record: Request,
    pub field: String,
    pub extractor: Arc<dyn PropertyExtractor>,
}

#[derive(Clone)]
pub struct UnionRequest {
    pub member: String,
    pub value: Request,
}

/// Contents of a request node, one variant per kind.
#[derive(Clone)]
pub enum RequestKind {
    /// A value known up front.
    Immediate(Value),
    /// A registered function applied to argument requests.
    Function(FunctionRequest),
    /// An ordered list of item requests.
    Array(Vec<Request>),
    /// Named field requests assembled by a constructor.
    Structure(StructureRequest),
    /// One field of a record request.
    Property(PropertyRequest),
    /// A request wrapped as the active member of a union.
    Union(UnionRequest),
    /// A request wrapped as a present optional.
    Some(Request),
    /// Unwraps an optional request, failing when it is absent.
    Required(Request),
    /// A subgraph resolved to a shareable reference before being inlined.
    Isolated(Request),
    /// A calculation definition to submit to the remote compute service.
    RemoteCalculation(Value),
    /// A request whose value is a calculation definition to submit.
    Meta(Request),
    /// A remote object, named by object id.
    Object(ArcStr),
    /// Remote immutable data, named by immutable id.
    Immutable(ArcStr),
}

impl RequestKind {
    pub fn tag(&self) -> RequestTag {
        match self {
            RequestKind::Immediate(_) => RequestTag::Immediate,
            RequestKind::Function(_) => RequestTag::Function,
            RequestKind::Array(_) => RequestTag::Array,
            RequestKind::Structure(_) => RequestTag::Structure,
            RequestKind::Property(_) => RequestTag::Property,
            RequestKind::Union(_) => RequestTag::Union,
            RequestKind::Some(_) => RequestTag::Some,
            RequestKind::Required(_) => RequestTag::Required,
            RequestKind::Isolated(_) => RequestTag::Isolated,
            RequestKind::RemoteCalculation(_) => RequestTag::RemoteCalculation,
            RequestKind::Meta(_) => RequestTag::Meta,
            RequestKind::Object(_) => RequestTag::Object,
            RequestKind::Immutable(_) => RequestTag::Immutable,
        }
    }

    /// Direct child requests, in tree order.
    pub fn children(&self) -> Vec<&Request> {
        match self {
            RequestKind::Function(f) => f.args.iter().collect(),
            RequestKind::Array(items) => items.iter().collect(),
            RequestKind::Structure(s) => s.fields.values().collect(),
            RequestKind::Property(p) => vec![&p.record],
            RequestKind::Union(u) => vec![&u.value],
            RequestKind::Some(inner)
            | RequestKind::Required(inner)
            | RequestKind::Isolated(inner)
            | RequestKind::Meta(inner) => vec![inner],
            RequestKind::Immediate(_)
            | RequestKind::RemoteCalculation(_)
            | RequestKind::Object(_)
            | RequestKind::Immutable(_) => vec![],
        }
    }

    /// The same kind with its children replaced, in tree order.
    pub fn with_children(&self, children: Vec<Request>) -> Result<RequestKind, ResolveError> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(ResolveError::internal(format!(
                "{:?} node has {expected} children, got {}",
                self.tag(),
                children.len()
            )));
        }

        let mut children = children.into_iter();
        let mut next = || {
            children
                .next()
                .ok_or_else(|| ResolveError::internal("ran out of children"))
        };

        Ok(match self {
            RequestKind::Function(f) => RequestKind::Function(FunctionRequest {
                function: f.function.clone(),
                args: (0..expected).map(|_| next()).collect::<Result<_, _>>()?,
                force_foreground: f.force_foreground,
            }),
            RequestKind::Array(_) => {
                RequestKind::Array((0..expected).map(|_| next()).collect::<Result<_, _>>()?)
            }
            RequestKind::Structure(s) => RequestKind::Structure(StructureRequest {
                fields: s
                    .fields
                    .keys()
                    .map(|name| next().map(|child| (name.clone(), child)))
                    .collect::<Result<_, ResolveError>>()?,
                constructor: s.constructor.clone(),
            }),
            RequestKind::Property(p) => RequestKind::Property(PropertyRequest {
                record: next()?,
                field: p.field.clone(),
                extractor: p.extractor.clone(),
            }),
            RequestKind::Union(u) => RequestKind::Union(UnionRequest {
                member: u.member.clone(),
                value: next()?,
            }),
            RequestKind::Some(_) => RequestKind::Some(next()?),
            RequestKind::Required(_) => RequestKind::Required(next()?),
            RequestKind::Isolated(_) => RequestKind::Isolated(next()?),
            RequestKind::Meta(_) => RequestKind::Meta(next()?),
            leaf @ (RequestKind::Immediate(_)
            | RequestKind::RemoteCalculation(_)
            | RequestKind::Object(_)
            | RequestKind::Immutable(_)) => leaf.clone(),
        })
    }
}

struct Node {
    kind: RequestKind,
    descriptor: Descriptor,
    hash: Hash32,
    trivial: bool,
    has_isolated: bool,
}

/// An immutable, structurally hashed request tree.
#[derive(Clone)]
pub struct Request(Arc<Node>);

impl Request {
    pub fn new(kind: RequestKind, descriptor: Descriptor) -> Self {
        let hash = structural_hash(&kind, &descriptor);
        let trivial = compute_trivial(&kind);
        let has_isolated = matches!(kind, RequestKind::Isolated(_))
            || kind.children().iter().any(|child| child.has_isolated());

        Request(Arc::new(Node {
            kind,
            descriptor,
            hash,
            trivial,
            has_isolated,
        }))
    }

    // ******************************
    // *        Constructors        *
    // ******************************

    /// An immediate of a concrete Rust type.
    pub fn immediate<T>(value: T) -> Self
    where
        T: IntoValue + FromValue + 'static,
    {
        Self::new(RequestKind::Immediate(value.into_value()), typed::<T>())
    }

    /// An immediate generic value with an explicit descriptor.
    pub fn value(value: Value, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Immediate(value), descriptor)
    }

    pub fn function(function: Arc<dyn Function>, args: Vec<Request>, descriptor: Descriptor) -> Self {
        Self::new(
            RequestKind::Function(FunctionRequest {
                function,
                args,
                force_foreground: false,
            }),
            descriptor,
        )
    }

    /// A function application evaluated on the consumer thread regardless of
    /// the function's own cost.
    pub fn function_in_foreground(
        function: Arc<dyn Function>,
        args: Vec<Request>,
        descriptor: Descriptor,
    ) -> Self {
        Self::new(
            RequestKind::Function(FunctionRequest {
                function,
                args,
                force_foreground: true,
            }),
            descriptor,
        )
    }

    pub fn array(items: Vec<Request>, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Array(items), descriptor)
    }

    /// A structure assembled as a plain record.
    pub fn structure(fields: BTreeMap<String, Request>, descriptor: Descriptor) -> Self {
        Self::structure_with(fields, Arc::new(RecordConstructor), descriptor)
    }

    pub fn structure_with(
        fields: BTreeMap<String, Request>,
        constructor: Arc<dyn StructureConstructor>,
        descriptor: Descriptor,
    ) -> Self {
        Self::new(
            RequestKind::Structure(StructureRequest {
                fields,
                constructor,
            }),
            descriptor,
        )
    }

    /// A field of a record, read as a map entry.
    pub fn property(record: Request, field: impl Into<String>, descriptor: Descriptor) -> Self {
        Self::property_with(record, field, Arc::new(FieldExtractor), descriptor)
    }

    pub fn property_with(
        record: Request,
        field: impl Into<String>,
        extractor: Arc<dyn PropertyExtractor>,
        descriptor: Descriptor,
    ) -> Self {
        Self::new(
            RequestKind::Property(PropertyRequest {
                record,
                field: field.into(),
                extractor,
            }),
            descriptor,
        )
    }

    pub fn union(member: impl Into<String>, value: Request, descriptor: Descriptor) -> Self {
        Self::new(
            RequestKind::Union(UnionRequest {
                member: member.into(),
                value,
            }),
            descriptor,
        )
    }

    pub fn some(inner: Request, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Some(inner), descriptor)
    }

    pub fn required(inner: Request, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Required(inner), descriptor)
    }

    /// Marks `inner` for preresolution. The result type is the inner one.
    pub fn isolated(inner: Request) -> Self {
        let descriptor = inner.descriptor().clone();
        Self::new(RequestKind::Isolated(inner), descriptor)
    }

    pub fn remote_calculation(calculation: Value, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::RemoteCalculation(calculation), descriptor)
    }

    pub fn meta(generator: Request, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Meta(generator), descriptor)
    }

    pub fn object(id: &str, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Object(id.into()), descriptor)
    }

    pub fn immutable(id: &str, descriptor: Descriptor) -> Self {
        Self::new(RequestKind::Immutable(id.into()), descriptor)
    }

    /// A new request with different contents and the same result descriptor.
    pub fn replace_contents(&self, kind: RequestKind) -> Request {
        Request::new(kind, self.0.descriptor.clone())
    }

    // ******************************
    // *         Accessors          *
    // ******************************

    pub fn kind(&self) -> &RequestKind {
        &self.0.kind
    }

    pub fn tag(&self) -> RequestTag {
        self.0.kind.tag()
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.0.descriptor
    }

    /// Structural hash: equal for structurally equal trees.
    pub fn digest(&self) -> Hash32 {
        self.0.hash
    }

    /// Whether the value can be produced on the consumer thread with no
    /// background work at all.
    pub fn is_trivial(&self) -> bool {
        self.0.trivial
    }

    /// Whether this node or any descendant is ISOLATED.
    pub fn has_isolated(&self) -> bool {
        self.0.has_isolated
    }

    pub fn children(&self) -> Vec<&Request> {
        self.0.kind.children()
    }

    pub fn as_immediate(&self) -> Option<&Value> {
        match self.kind() {
            RequestKind::Immediate(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRequest> {
        match self.kind() {
            RequestKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Request]> {
        match self.kind() {
            RequestKind::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructureRequest> {
        match self.kind() {
            RequestKind::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyRequest> {
        match self.kind() {
            RequestKind::Property(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_union(&self) -> Option<&UnionRequest> {
        match self.kind() {
            RequestKind::Union(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_some(&self) -> Option<&Request> {
        match self.kind() {
            RequestKind::Some(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_required(&self) -> Option<&Request> {
        match self.kind() {
            RequestKind::Required(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_isolated(&self) -> Option<&Request> {
        match self.kind() {
            RequestKind::Isolated(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_remote_calculation(&self) -> Option<&Value> {
        match self.kind() {
            RequestKind::RemoteCalculation(calculation) => Some(calculation),
            _ => None,
        }
    }

    pub fn as_meta(&self) -> Option<&Request> {
        match self.kind() {
            RequestKind::Meta(generator) => Some(generator),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&str> {
        match self.kind() {
            RequestKind::Object(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_immutable(&self) -> Option<&str> {
        match self.kind() {
            RequestKind::Immutable(id) => Some(id),
            _ => None,
        }
    }
}

fn compute_trivial(kind: &RequestKind) -> bool {
    match kind {
        RequestKind::Immediate(_) => true,
        RequestKind::Function(f) => f.runs_in_foreground() && f.args.iter().all(Request::is_trivial),
        RequestKind::Array(items) => items.iter().all(Request::is_trivial),
        RequestKind::Structure(s) => s.fields.values().all(Request::is_trivial),
        RequestKind::Property(p) => p.record.is_trivial(),
        RequestKind::Union(u) => u.value.is_trivial(),
        RequestKind::Some(inner) | RequestKind::Required(inner) => inner.is_trivial(),
        RequestKind::Isolated(_)
        | RequestKind::RemoteCalculation(_)
        | RequestKind::Meta(_)
        | RequestKind::Object(_)
        | RequestKind::Immutable(_) => false,
    }
}

fn structural_hash(kind: &RequestKind, descriptor: &Descriptor) -> Hash32 {
    let mut hasher = Blake3Hasher::default();
    descriptor.type_name().hash(&mut hasher);
    kind.tag().hash(&mut hasher);

    match kind {
        RequestKind::Immediate(value) | RequestKind::RemoteCalculation(value) => {
            value.hash(&mut hasher)
        }
        RequestKind::Function(f) => {
            f.function.id().hash(&mut hasher);
            f.force_foreground.hash(&mut hasher);
            f.args.hash(&mut hasher);
        }
        RequestKind::Array(items) => items.hash(&mut hasher),
        RequestKind::Structure(s) => {
            s.constructor.id().hash(&mut hasher);
            s.fields.hash(&mut hasher);
        }
        RequestKind::Property(p) => {
            p.extractor.id().hash(&mut hasher);
            p.field.hash(&mut hasher);
            p.record.hash(&mut hasher);
        }
        RequestKind::Union(u) => {
            u.member.hash(&mut hasher);
            u.value.hash(&mut hasher);
        }
        RequestKind::Some(inner)
        | RequestKind::Required(inner)
        | RequestKind::Isolated(inner)
        | RequestKind::Meta(inner) => inner.hash(&mut hasher),
        RequestKind::Object(id) | RequestKind::Immutable(id) => id.hash(&mut hasher),
    }

    hasher.into()
}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.hash == other.0.hash
    }
}

impl Eq for Request {}

// The serialized form is the canonical identity used for cache keys, so it
// names functions, constructors and extractors by id and omits their code.
#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Value(&'a Value),
    Function {
        function: &'a str,
        force_foreground: bool,
        args: &'a [Request],
    },
    Items(&'a [Request]),
    Structure {
        constructor: &'a str,
        fields: &'a BTreeMap<String, Request>,
    },
    Property {
        extractor: &'a str,
        field: &'a str,
        record: &'a Request,
    },
    Union {
        member: &'a str,
        value: &'a Request,
    },
    Inner(&'a Request),
    Id(&'a str),
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match self.kind() {
            RequestKind::Immediate(value) | RequestKind::RemoteCalculation(value) => {
                Payload::Value(value)
            }
            RequestKind::Function(f) => Payload::Function {
                function: f.function.id(),
                force_foreground: f.force_foreground,
                args: &f.args,
            },
            RequestKind::Array(items) => Payload::Items(items),
            RequestKind::Structure(s) => Payload::Structure {
                constructor: s.constructor.id(),
                fields: &s.fields,
            },
            RequestKind::Property(p) => Payload::Property {
                extractor: p.extractor.id(),
                field: &p.field,
                record: &p.record,
            },
            RequestKind::Union(u) => Payload::Union {
                member: &u.member,
                value: &u.value,
            },
            RequestKind::Some(inner)
            | RequestKind::Required(inner)
            | RequestKind::Isolated(inner)
            | RequestKind::Meta(inner) => Payload::Inner(inner),
            RequestKind::Object(id) | RequestKind::Immutable(id) => Payload::Id(id),
        };

        let mut state = serializer.serialize_struct("Request", 3)?;
        state.serialize_field("type", self.descriptor().type_name())?;
        state.serialize_field("kind", &self.tag())?;
        state.serialize_field("payload", &payload)?;
        state.end()
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            RequestKind::Immediate(value) => write!(f, "Immediate({value})"),
            RequestKind::Function(func) => f
                .debug_tuple("Function")
                .field(&func.function.id())
                .field(&func.args)
                .finish(),
            RequestKind::Array(items) => f.debug_tuple("Array").field(items).finish(),
            RequestKind::Structure(s) => f.debug_tuple("Structure").field(&s.fields).finish(),
            RequestKind::Property(p) => f
                .debug_tuple("Property")
                .field(&p.record)
                .field(&p.field)
                .finish(),
            RequestKind::Union(u) => f
                .debug_tuple("Union")
                .field(&u.member)
                .field(&u.value)
                .finish(),
            RequestKind::Some(inner) => f.debug_tuple("Some").field(inner).finish(),
            RequestKind::Required(inner) => f.debug_tuple("Required").field(inner).finish(),
            RequestKind::Isolated(inner) => f.debug_tuple("Isolated").field(inner).finish(),
            RequestKind::RemoteCalculation(calc) => write!(f, "RemoteCalculation({calc})"),
            RequestKind::Meta(generator) => f.debug_tuple("Meta").field(generator).finish(),
            RequestKind::Object(id) => write!(f, "Object({id})"),
            RequestKind::Immutable(id) => write!(f, "Immutable({id})"),
        }
    }
}
