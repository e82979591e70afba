//! Fallback method lookup by name and signature.
//!
//! Rust has no runtime reflection, so owning types describe themselves up front: a [`TypeInfo`]
//! lists a type's fallback-capable methods, its parent type and the interfaces it implements.
//! Resolution searches the owning type of the call-site, then each ancestor, then the default
//! methods of every interface along that chain, and accepts the first method whose name and
//! parameter types match the call-site exactly.
//!
//! Default methods are invoked against the target as `&dyn Any` instead of a concrete type,
//! since they are written once for every implementor.

use crate::call_site::{CallSite, ParamType};
use crate::config::FallbackConfig;
use crate::context::{Arguments, ExecutionContext, Invocation};
use crate::error::{ConfigError, FallbackInvocationError, Failure, InvocationTargetError};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

type Invoker = Arc<dyn Fn(&Invocation) -> Result<Box<dyn Any + Send>, Failure> + Send + Sync>;

/// Recovery path of a call-site producing `R`.
pub type FallbackFn<R> = Arc<dyn Fn(&ExecutionContext) -> Result<R, Failure> + Send + Sync>;

/// Where a method body comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodOrigin {
    /// Declared on the type itself.
    Declared,
    /// Default body provided by an interface.
    Default,
}

/// A method that can serve as a fallback.
#[derive(Clone)]
pub struct MethodRef {
    name: String,
    params: Vec<ParamType>,
    returns: ParamType,
    origin: MethodOrigin,
    invoker: Invoker,
}

impl MethodRef {
    /// A method declared on `Target`. `f` receives the call's receiver and arguments.
    pub fn new<Target, R, F>(name: impl Into<String>, params: Vec<ParamType>, f: F) -> Self
    where
        Target: Any + Send + Sync,
        R: Any + Send,
        F: Fn(&Target, &Arguments) -> Result<R, Failure> + Send + Sync + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let invoker: Invoker = Arc::new(move |invocation: &Invocation| {
            let target = invocation.target().downcast_ref::<Target>().ok_or_else(|| {
                Failure::new(FallbackInvocationError {
                    method: method.clone(),
                    reason: format!("target is not a {}", std::any::type_name::<Target>()),
                })
            })?;
            match f(target, invocation.arguments()) {
                Ok(value) => Ok(Box::new(value) as Box<dyn Any + Send>),
                Err(cause) => Err(Failure::new(InvocationTargetError { method: method.clone(), cause })),
            }
        });
        Self { name, params, returns: ParamType::of::<R>(), origin: MethodOrigin::Declared, invoker }
    }

    /// A default method of an interface, callable on any implementor.
    pub fn default_method<R, F>(name: impl Into<String>, params: Vec<ParamType>, f: F) -> Self
    where
        R: Any + Send,
        F: Fn(&(dyn Any + Send + Sync), &Arguments) -> Result<R, Failure> + Send + Sync + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let invoker: Invoker = Arc::new(move |invocation: &Invocation| {
            match f(invocation.target(), invocation.arguments()) {
                Ok(value) => Ok(Box::new(value) as Box<dyn Any + Send>),
                Err(cause) => Err(Failure::new(InvocationTargetError { method: method.clone(), cause })),
            }
        });
        Self { name, params, returns: ParamType::of::<R>(), origin: MethodOrigin::Default, invoker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> MethodOrigin {
        self.origin
    }

    fn matches(&self, name: &str, params: &[ParamType]) -> bool {
        self.name == name && self.params == params
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRef")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Description of a type or interface for fallback lookup.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    name: String,
    parent: Option<String>,
    interfaces: Vec<String>,
    methods: Vec<MethodRef>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), parent: None, interfaces: Vec::new(), methods: Vec::new() }
    }

    /// Set the parent type.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Add an implemented interface (or, on an interface, an extended one).
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn method(mut self, method: MethodRef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A pluggable recovery object producing `R` for a failed call.
pub trait FallbackHandler<R>: Send + Sync {
    fn handle(&self, ctx: &ExecutionContext) -> Result<R, Failure>;
}

impl<R, F> FallbackHandler<R> for F
where
    F: Fn(&ExecutionContext) -> Result<R, Failure> + Send + Sync,
{
    fn handle(&self, ctx: &ExecutionContext) -> Result<R, Failure> {
        self(ctx)
    }
}

struct ErasedHandler {
    handler: Arc<dyn Any + Send + Sync>,
    produces: ParamType,
}

#[derive(Default)]
struct Registry {
    types: HashMap<String, Arc<TypeInfo>>,
    handlers: HashMap<String, ErasedHandler>,
}

/// Type descriptions and named fallback handlers. Clones share the same registry.
#[derive(Clone, Default)]
pub struct FallbackRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<_> = inner.types.keys().collect();
        types.sort();
        let mut handlers: Vec<_> = inner.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("FallbackRegistry").field("types", &types).field("handlers", &handlers).finish()
    }
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a type or interface. Replaces an earlier description with the same name.
    pub fn register_type(&self, info: TypeInfo) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.types.insert(info.name.clone(), Arc::new(info));
    }

    /// Register a handler under `name`, producing the call-site's result shape `R`.
    pub fn register_handler<R, H>(&self, name: impl Into<String>, handler: H)
    where
        R: Send + 'static,
        H: FallbackHandler<R> + 'static,
    {
        let handler: Arc<dyn FallbackHandler<R>> = Arc::new(handler);
        let erased = ErasedHandler { handler: Arc::new(handler), produces: ParamType::of::<R>() };
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.handlers.insert(name.into(), erased);
    }

    fn type_info(&self, name: &str) -> Option<Arc<TypeInfo>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).types.get(name).cloned()
    }

    /// Find a method by name and exact parameter types on `owner`, its ancestors, or the default
    /// methods of the interfaces they implement.
    pub fn find_method(&self, owner: &str, name: &str, params: &[ParamType]) -> Option<MethodRef> {
        let mut interfaces = Vec::new();
        let mut current = self.type_info(owner);
        let mut seen = HashSet::new();
        while let Some(info) = current {
            if !seen.insert(info.name.clone()) {
                break;
            }
            if let Some(found) = info
                .methods
                .iter()
                .find(|m| m.origin == MethodOrigin::Declared && m.matches(name, params))
            {
                return Some(found.clone());
            }
            interfaces.extend(info.interfaces.iter().cloned());
            current = info.parent.as_deref().and_then(|p| self.type_info(p));
        }

        let mut visited = HashSet::new();
        while let Some(interface) = interfaces.pop() {
            if !visited.insert(interface.clone()) {
                continue;
            }
            let Some(info) = self.type_info(&interface) else { continue };
            if let Some(found) = info.methods.iter().find(|m| m.matches(name, params)) {
                return Some(found.clone());
            }
            interfaces.extend(info.interfaces.iter().cloned());
        }
        None
    }

    fn handler<R: Send + 'static>(
        &self,
        name: &str,
        site: &CallSite,
    ) -> Result<Arc<dyn FallbackHandler<R>>, ConfigError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let erased = inner
            .handlers
            .get(name)
            .ok_or_else(|| ConfigError::FallbackHandlerNotFound { call_site: site.to_string() })?;
        erased.handler.downcast_ref::<Arc<dyn FallbackHandler<R>>>().cloned().ok_or_else(|| {
            ConfigError::FallbackReturnType {
                fallback: name.to_string(),
                call_site: site.to_string(),
                expected: std::any::type_name::<R>(),
                found: erased.produces.name(),
            }
        })
    }
}

/// Build the recovery path of `site` producing `R`.
pub(crate) fn resolve<R: Any + Send>(
    registry: &FallbackRegistry,
    site: &CallSite,
    config: &FallbackConfig,
) -> Result<FallbackFn<R>, ConfigError> {
    if let Some(method_name) = config.method.as_deref() {
        let method = registry.find_method(site.owner(), method_name, site.params()).ok_or_else(|| {
            ConfigError::FallbackMethodNotFound { method: method_name.to_string(), call_site: site.to_string() }
        })?;
        if method.returns != ParamType::of::<R>() {
            return Err(ConfigError::FallbackReturnType {
                fallback: method.name.clone(),
                call_site: site.to_string(),
                expected: std::any::type_name::<R>(),
                found: method.returns.name(),
            });
        }
        return Ok(Arc::new(move |ctx: &ExecutionContext| invoke_method::<R>(&method, ctx)));
    }

    let name = config
        .handler
        .as_deref()
        .ok_or_else(|| ConfigError::FallbackHandlerNotFound { call_site: site.to_string() })?;
    let handler = registry.handler::<R>(name, site)?;
    Ok(Arc::new(move |ctx: &ExecutionContext| handler.handle(ctx)))
}

fn invoke_method<R: Any>(method: &MethodRef, ctx: &ExecutionContext) -> Result<R, Failure> {
    let invocation = ctx.invocation().ok_or_else(|| {
        Failure::new(FallbackInvocationError {
            method: method.name.clone(),
            reason: "the call carried no invocation target".into(),
        })
    })?;
    match (method.invoker)(invocation) {
        Ok(value) => value.downcast::<R>().map(|boxed| *boxed).map_err(|_| {
            Failure::new(FallbackInvocationError {
                method: method.name.clone(),
                reason: format!("result is not a {}", std::any::type_name::<R>()),
            })
        }),
        Err(failure) => match failure.downcast_ref::<InvocationTargetError>() {
            Some(wrapped) => Err(wrapped.cause.clone()),
            None => Err(failure),
        },
    }
}
