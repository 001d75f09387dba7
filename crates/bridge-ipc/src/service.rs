//! Service dispatch table.
//!
//! A service registers its operations once, when its host starts. Each entry
//! holds the operation name, its ordered parameter types, an async handler,
//! and whether the operation is terminal (ends the host's receive loop).
//!
//! ```rust,ignore
//! impl Service for Counter {
//!     fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
//!         let svc = self.clone();
//!         ops.operation("bump", move |(by,): (i32,)| {
//!             let svc = svc.clone();
//!             async move { svc.total.fetch_add(by, Ordering::SeqCst); }
//!         });
//!         ops.terminal("stop", |_: ()| async {});
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{IpcError, Result};
use crate::protocol::{coerce, Arg, Message, ParamType};

/// A value that can be received as an operation parameter.
pub trait Param: Sized + Send + 'static {
    const TYPE: ParamType;

    fn from_arg(arg: Arg) -> Option<Self>;
}

impl Param for String {
    const TYPE: ParamType = ParamType::Text;

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Param for bool {
    const TYPE: ParamType = ParamType::Bool;

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl Param for i32 {
    const TYPE: ParamType = ParamType::Int;

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Int(n) => Some(n),
            _ => None,
        }
    }
}

/// An ordered parameter list, implemented for tuples of [`Param`]s.
pub trait Params: Sized + Send + 'static {
    fn types() -> Vec<ParamType>;

    fn from_args(args: Vec<Arg>) -> Option<Self>;
}

impl Params for () {
    fn types() -> Vec<ParamType> {
        Vec::new()
    }

    fn from_args(_args: Vec<Arg>) -> Option<Self> {
        Some(())
    }
}

macro_rules! impl_params {
    ($($name:ident),+) => {
        impl<$($name: Param),+> Params for ($($name,)+) {
            fn types() -> Vec<ParamType> {
                vec![$($name::TYPE),+]
            }

            fn from_args(args: Vec<Arg>) -> Option<Self> {
                let mut args = args.into_iter();
                Some(($($name::from_arg(args.next()?)?,)+))
            }
        }
    };
}

impl_params!(A);
impl_params!(A, B);
impl_params!(A, B, C);
impl_params!(A, B, C, D);

type Handler = Arc<dyn Fn(Vec<Arg>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One registered operation.
#[derive(Clone)]
pub struct DispatchEntry {
    pub name: String,
    pub params: Vec<ParamType>,
    pub terminal: bool,
    handler: Handler,
}

impl std::fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    /// The operation ends the current session.
    pub terminal: bool,
}

/// Collects operations while a service registers itself.
#[derive(Default)]
pub struct DispatchTableBuilder {
    entries: HashMap<String, DispatchEntry>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a non-terminal operation.
    pub fn operation<P, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        P: Params,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(name, false, handler)
    }

    /// Register an operation whose dispatch ends the host's receive loop.
    pub fn terminal<P, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        P: Params,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(name, true, handler)
    }

    fn insert<P, F, Fut>(&mut self, name: &str, terminal: bool, handler: F) -> &mut Self
    where
        P: Params,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let op = name.to_string();
        let handler: Handler = Arc::new(move |args: Vec<Arg>| match P::from_args(args) {
            Some(params) => handler(params).map(Ok::<(), IpcError>).boxed(),
            None => {
                let err = IpcError::decode(format!("{}: arguments do not match parameters", op));
                futures::future::ready(Err(err)).boxed()
            }
        });
        self.entries.insert(
            name.to_string(),
            DispatchEntry {
                name: name.to_string(),
                params: P::types(),
                terminal,
                handler,
            },
        );
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            entries: self.entries,
        }
    }
}

/// Immutable operation-name → entry map for one host.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    entries: HashMap<String, DispatchEntry>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    /// Build the table for a service instance.
    pub fn for_service<S: Service>(service: Arc<S>) -> Self {
        let mut builder = DispatchTableBuilder::new();
        service.register(&mut builder);
        builder.build()
    }

    pub fn get(&self, operation: &str) -> Option<&DispatchEntry> {
        self.entries.get(operation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up, coerce, and invoke the operation a message names.
    ///
    /// Unknown names return `UnknownOperation`; arguments that don't fit the
    /// declared parameters return `Decode` without invoking the handler.
    pub async fn dispatch(&self, message: &Message) -> Result<Dispatched> {
        let entry = self
            .entries
            .get(&message.operation)
            .ok_or_else(|| IpcError::UnknownOperation {
                operation: message.operation.clone(),
            })?;
        let args = coerce(message, &entry.params)?;
        (entry.handler)(args).await?;
        Ok(Dispatched {
            terminal: entry.terminal,
        })
    }
}

/// A set of operations a host exposes.
///
/// Implementations keep their state behind interior mutability: the host
/// shares the instance between its dispatch loop and the consumer.
pub trait Service: Send + Sync + 'static {
    fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        total: AtomicI32,
        notes: Mutex<Vec<(String, bool)>>,
    }

    impl Service for Recorder {
        fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
            let svc = self.clone();
            ops.operation("bump", move |(by,): (i32,)| {
                let svc = svc.clone();
                async move {
                    svc.total.fetch_add(by, Ordering::SeqCst);
                }
            });
            let svc = self.clone();
            ops.operation("note", move |(text, flag): (String, bool)| {
                let svc = svc.clone();
                async move {
                    svc.notes.lock().unwrap().push((text, flag));
                }
            });
            ops.terminal("stop", |_: ()| async {});
        }
    }

    fn table() -> (Arc<Recorder>, DispatchTable) {
        let svc = Arc::new(Recorder::default());
        let table = DispatchTable::for_service(svc.clone());
        (svc, table)
    }

    #[test]
    fn test_table_records_parameter_lists() {
        let (_, table) = table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("bump").unwrap().params, vec![ParamType::Int]);
        assert_eq!(
            table.get("note").unwrap().params,
            vec![ParamType::Text, ParamType::Bool]
        );
        assert!(table.get("stop").unwrap().terminal);
        assert!(!table.get("bump").unwrap().terminal);
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_with_typed_args() {
        let (svc, table) = table();
        let outcome = table
            .dispatch(&Message::new("bump", vec!["5".into()]))
            .await
            .unwrap();
        assert!(!outcome.terminal);

        table
            .dispatch(&Message::new("note", vec!["hi".into(), "True".into()]))
            .await
            .unwrap();

        assert_eq!(svc.total.load(Ordering::SeqCst), 5);
        assert_eq!(*svc.notes.lock().unwrap(), vec![("hi".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_dispatch_reports_terminal() {
        let (_, table) = table();
        let outcome = table.dispatch(&Message::new("stop", vec![])).await.unwrap();
        assert!(outcome.terminal);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_operation() {
        let (_, table) = table();
        let err = table
            .dispatch(&Message::new("bogusOp", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::UnknownOperation { operation } if operation == "bogusOp"));
    }

    #[tokio::test]
    async fn test_dispatch_bad_argument_skips_handler() {
        let (svc, table) = table();
        let err = table
            .dispatch(&Message::new("bump", vec!["five".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Decode { .. }));
        assert_eq!(svc.total.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_params_from_args_checks_types() {
        assert_eq!(
            <(String, i32)>::from_args(vec!["a".into(), 3.into()]),
            Some(("a".to_string(), 3))
        );
        assert_eq!(<(bool,)>::from_args(vec![Arg::Int(1)]), None);
        assert_eq!(<(bool,)>::from_args(vec![]), None);
    }
}
