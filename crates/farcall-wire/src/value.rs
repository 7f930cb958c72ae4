//! The local value model.
//!
//! A [`Value`] is anything the codec can encode or the dispatcher can walk:
//! plain JSON data, mutable [`Object`] records, async [`Function`]s and
//! constructible [`Class`]es, in-flight [`Promise`]s, transferable [`Port`]s,
//! [`Remote`] handles, and opaque [`Custom`] values for transfer handlers.
//!
//! Reference variants (everything but plain data and remote handles) have
//! identity: clones share state, and the proxy marker and transfer tags are
//! attached to that identity.

use crate::channel::Port;
use crate::remote::Remote;
use async_trait::async_trait;
use farcall_types::error::{Fault, RpcError};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

type Json = serde_json::Value;

/// A value that can cross a channel or live in an exposed object graph.
#[derive(Clone)]
pub enum Value {
    /// Plain, immutable JSON data.
    Data(Json),
    /// A mutable record with identity.
    Object(Object),
    /// An async callable.
    Function(Function),
    /// A constructible class.
    Class(Class),
    /// An in-flight asynchronous value.
    Promise(Promise),
    /// One end of a message channel.
    Port(Port),
    /// A handle to an object on the other side of a channel.
    Remote(Remote),
    /// An opaque value for transfer handlers.
    Custom(Custom),
}

/// Identity of a reference value, held weakly.
pub(crate) struct Identity {
    pub(crate) key: usize,
    pub(crate) owner: Weak<dyn Any + Send + Sync>,
}

fn identity_of<T: Send + Sync + 'static>(arc: &Arc<T>) -> Identity {
    let owner: Weak<T> = Arc::downgrade(arc);
    Identity {
        key: Arc::as_ptr(arc) as *const () as usize,
        owner,
    }
}

impl Value {
    /// JSON `null`.
    pub fn null() -> Self {
        Self::Data(Json::Null)
    }

    /// Short name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Data(Json::Null) => "null",
            Self::Data(Json::Bool(_)) => "boolean",
            Self::Data(Json::Number(_)) => "number",
            Self::Data(Json::String(_)) => "string",
            Self::Data(Json::Array(_)) => "array",
            Self::Data(Json::Object(_)) | Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Class(_) => "class",
            Self::Promise(_) => "promise",
            Self::Port(_) => "port",
            Self::Remote(_) => "remote handle",
            Self::Custom(_) => "custom value",
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Function(f) => format!("function '{}'", f.name()),
            Self::Class(c) => format!("class '{}'", c.name()),
            Self::Custom(c) => format!("custom value of type {}", c.type_name()),
            other => other.type_name().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Data(Json::Null))
    }

    pub fn as_data(&self) -> Option<&Json> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_data()?.as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_data()?.as_f64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_data()?.as_bool()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data()?.as_str()
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<&Port> {
        match self {
            Self::Port(port) => Some(port),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Remote> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&Custom> {
        match self {
            Self::Custom(custom) => Some(custom),
            _ => None,
        }
    }

    /// Take the remote handle out of this value.
    pub fn into_remote(self) -> Option<Remote> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    /// Whether the value carries the proxy marker.
    pub fn is_proxied(&self) -> bool {
        match self {
            Self::Object(obj) => obj.inner.proxied.load(Ordering::Acquire),
            Self::Function(f) => f.inner.proxied.load(Ordering::Acquire),
            Self::Class(c) => c.inner.proxied.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Attach the proxy marker. Returns `false` for values that cannot
    /// carry it.
    pub(crate) fn mark_proxied(&self) -> bool {
        let flag = match self {
            Self::Object(obj) => &obj.inner.proxied,
            Self::Function(f) => &f.inner.proxied,
            Self::Class(c) => &c.inner.proxied,
            _ => return false,
        };
        flag.store(true, Ordering::Release);
        true
    }

    pub(crate) fn identity(&self) -> Option<Identity> {
        match self {
            Self::Object(obj) => Some(identity_of(&obj.inner)),
            Self::Function(f) => Some(identity_of(&f.inner)),
            Self::Class(c) => Some(identity_of(&c.inner)),
            Self::Port(port) => Some(Identity {
                key: port.addr(),
                owner: port.downgrade(),
            }),
            Self::Custom(custom) => Some(Identity {
                key: Arc::as_ptr(&custom.inner) as *const () as usize,
                owner: Arc::downgrade(&custom.inner),
            }),
            Self::Data(_) | Self::Promise(_) | Self::Remote(_) => None,
        }
    }

    /// JSON form for RAW encoding. Objects are snapshotted; values with no
    /// JSON form fail with a `DataCloneError`.
    pub fn to_json(&self) -> Result<Json, RpcError> {
        self.to_json_inner(&mut Vec::new())
    }

    fn to_json_inner(&self, seen: &mut Vec<usize>) -> Result<Json, RpcError> {
        match self {
            Self::Data(data) => Ok(data.clone()),
            Self::Object(obj) => obj.to_json_inner(seen),
            other => Err(RpcError::DataClone(format!(
                "{} could not be cloned",
                other.describe()
            ))),
        }
    }

    /// Read member `key`.
    ///
    /// Missing members read as `null`. Reading anything through `null` is a
    /// `TypeError`. Reading through a remote handle extends its path.
    pub fn member(&self, key: &str) -> Result<Value, Fault> {
        match self {
            Self::Data(data) => data_member(data, key),
            Self::Object(obj) => Ok(obj.get(key).unwrap_or_default()),
            Self::Function(f) if key == "name" => Ok(f.name().into()),
            Self::Class(c) if key == "name" => Ok(c.name().into()),
            Self::Remote(remote) => Ok(Self::Remote(remote.get(key))),
            _ => Ok(Self::null()),
        }
    }

    /// Assign `value` to member `key`.
    pub async fn assign(&self, key: &str, value: Value) -> Result<(), Fault> {
        match self {
            Self::Object(obj) => {
                obj.set(key, value);
                Ok(())
            }
            Self::Remote(remote) => Ok(remote.set(key, value).await?),
            Self::Data(Json::Null) => Err(Fault::type_error(format!(
                "Cannot set properties of null (setting '{key}')"
            ))),
            other => Err(Fault::type_error(format!(
                "Cannot assign to '{key}' on immutable {}",
                other.type_name()
            ))),
        }
    }

    /// Call this value as a function with the given receiver.
    pub async fn invoke(&self, this: Value, args: Vec<Value>) -> Result<Value, Fault> {
        match self {
            Self::Function(f) => f.call(this, args).await,
            Self::Remote(remote) => Ok(remote.call(args).await?),
            other => Err(Fault::type_error(format!(
                "{} is not a function",
                other.describe()
            ))),
        }
    }

    /// Construct an instance of this value.
    pub async fn instantiate(&self, args: Vec<Value>) -> Result<Value, Fault> {
        match self {
            Self::Class(c) => c.construct(args).await,
            Self::Remote(remote) => Ok(Self::Remote(remote.construct(args).await?)),
            other => Err(Fault::type_error(format!(
                "{} is not a constructor",
                other.describe()
            ))),
        }
    }

    /// Wait for promises to settle, following chains of promises.
    pub async fn settle(self) -> Result<Value, Fault> {
        let mut value = self;
        loop {
            match value {
                Self::Promise(promise) => value = promise.settle().await?,
                other => return Ok(other),
            }
        }
    }
}

fn data_member(data: &Json, key: &str) -> Result<Value, Fault> {
    let found = match data {
        Json::Null => {
            return Err(Fault::type_error(format!(
                "Cannot read properties of null (reading '{key}')"
            )))
        }
        Json::Object(map) => map.get(key).cloned(),
        Json::Array(items) if key == "length" => Some(Json::from(items.len())),
        Json::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        Json::String(s) if key == "length" => Some(Json::from(s.chars().count())),
        _ => None,
    };
    Ok(Value::Data(found.unwrap_or(Json::Null)))
}

impl Default for Value {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.same_object(b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Self::Class(a), Self::Class(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Self::Port(a), Self::Port(b)) => a.same_port(b),
            (Self::Remote(a), Self::Remote(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => {
                Arc::as_ptr(&a.inner) as *const () == Arc::as_ptr(&b.inner) as *const ()
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(data) => write!(f, "Data({data})"),
            Self::Object(obj) => f.debug_tuple("Object").field(&obj.keys()).finish(),
            Self::Function(func) => write!(f, "Function({})", func.name()),
            Self::Class(class) => write!(f, "Class({})", class.name()),
            Self::Promise(_) => f.write_str("Promise"),
            Self::Port(port) => std::fmt::Debug::fmt(port, f),
            Self::Remote(remote) => std::fmt::Debug::fmt(remote, f),
            Self::Custom(custom) => write!(f, "Custom({})", custom.type_name()),
        }
    }
}

impl From<Json> for Value {
    fn from(data: Json) -> Self {
        Self::Data(data)
    }
}

macro_rules! impl_from_data {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::Data(Json::from(v))
            }
        })*
    };
}

impl_from_data!(bool, i32, i64, u32, u64, usize, f64, &str, String);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::null()
    }
}

macro_rules! impl_from_variant {
    ($($ty:ident),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$ty(v)
            }
        })*
    };
}

impl_from_variant!(Object, Function, Class, Promise, Port, Remote, Custom);

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

type Finalizer = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ObjectInner {
    members: RwLock<BTreeMap<String, Value>>,
    proxied: AtomicBool,
    finalizer: RwLock<Option<Finalizer>>,
}

/// A mutable record of named members. Clones share the same record.
#[derive(Clone, Default)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record tree from a JSON object. Nested JSON objects become
    /// records too; everything else stays plain data.
    pub fn from_json(map: serde_json::Map<String, Json>) -> Self {
        let obj = Self::new();
        for (key, value) in map {
            let value = match value {
                Json::Object(nested) => Value::Object(Self::from_json(nested)),
                other => Value::Data(other),
            };
            obj.set(key, value);
        }
        obj
    }

    /// Builder-style `set`.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Install a hook run when a channel exposing this object is released.
    pub fn with_finalizer(self, finalizer: impl Fn() + Send + Sync + 'static) -> Self {
        {
            let mut slot = self.inner.finalizer.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(Box::new(finalizer));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let members = self.inner.members.read().unwrap_or_else(|e| e.into_inner());
        members.get(key).cloned()
    }

    /// Set a member, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let mut members = self.inner.members.write().unwrap_or_else(|e| e.into_inner());
        members.insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut members = self.inner.members.write().unwrap_or_else(|e| e.into_inner());
        members.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let members = self.inner.members.read().unwrap_or_else(|e| e.into_inner());
        members.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let members = self.inner.members.read().unwrap_or_else(|e| e.into_inner());
        members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the finalizer, if any. Returns whether one ran.
    pub fn finalize(&self) -> bool {
        let finalizer = self.inner.finalizer.read().unwrap_or_else(|e| e.into_inner());
        match finalizer.as_ref() {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    /// Whether both handles refer to the same record.
    pub fn same_object(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn to_json_inner(&self, seen: &mut Vec<usize>) -> Result<Json, RpcError> {
        let addr = Arc::as_ptr(&self.inner) as usize;
        if seen.contains(&addr) {
            return Err(RpcError::DataClone(
                "cyclic object could not be cloned".to_string(),
            ));
        }
        seen.push(addr);

        let members: Vec<(String, Value)> = {
            let members = self.inner.members.read().unwrap_or_else(|e| e.into_inner());
            members.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut map = serde_json::Map::with_capacity(members.len());
        for (key, value) in members {
            map.insert(key, value.to_json_inner(seen)?);
        }

        seen.pop();
        Ok(Json::Object(map))
    }
}

// ---------------------------------------------------------------------------
// Functions and classes
// ---------------------------------------------------------------------------

/// Native body of a [`Function`] or [`Class`].
#[async_trait]
pub trait NativeFunction: Send + Sync + 'static {
    /// Run the body with receiver `this`. Constructors receive `null`.
    async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Fault>;
}

struct Closure<F>(F);

#[async_trait]
impl<F, Fut> NativeFunction for Closure<F>
where
    F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Fault> {
        (self.0)(this, args).await
    }
}

struct FunctionInner {
    name: String,
    body: Box<dyn NativeFunction>,
    proxied: AtomicBool,
}

/// An async callable receiving its receiver (`this`) and arguments.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Wrap an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self::from_native(name, Closure(f))
    }

    /// Wrap a synchronous closure.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self::new(name, move |this, args| futures::future::ready(f(this, args)))
    }

    pub fn from_native(name: impl Into<String>, body: impl NativeFunction) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                name: name.into(),
                body: Box::new(body),
                proxied: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Fault> {
        self.inner.body.call(this, args).await
    }
}

struct ClassInner {
    name: String,
    body: Box<dyn NativeFunction>,
    proxied: AtomicBool,
}

/// A constructible class. Its body builds and returns the new instance.
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

impl Class {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self {
            inner: Arc::new(ClassInner {
                name: name.into(),
                body: Box::new(Closure(move |_this: Value, args: Vec<Value>| f(args))),
                proxied: AtomicBool::new(false),
            }),
        }
    }

    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self::new(name, move |args| futures::future::ready(f(args)))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn construct(&self, args: Vec<Value>) -> Result<Value, Fault> {
        self.inner.body.call(Value::null(), args).await
    }
}

// ---------------------------------------------------------------------------
// Promise / Custom
// ---------------------------------------------------------------------------

/// A shared, in-flight asynchronous value. Every clone observes the same
/// outcome.
#[derive(Clone)]
pub struct Promise {
    inner: Shared<BoxFuture<'static, Result<Value, Fault>>>,
}

impl Promise {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(async move { Ok(value) })
    }

    pub fn rejected(fault: Fault) -> Self {
        Self::new(async move { Err(fault) })
    }

    pub async fn settle(self) -> Result<Value, Fault> {
        self.inner.await
    }
}

/// An opaque value that only transfer handlers know how to encode.
#[derive(Clone)]
pub struct Custom {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Custom {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.as_ref().is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_ref().downcast_ref::<T>()
    }
}
