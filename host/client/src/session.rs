use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    future,
    pin::Pin,
    rc::Rc,
    task::{self, Poll},
    thread,
};

use derive_where::derive_where;
use futures::{
    StreamExt as _,
    channel::mpsc::{self, TryRecvError, UnboundedReceiver, UnboundedSender},
};
use seclink::{FunctionSpec, NativeSurface, Value};
use seclink_protocol::{ArgMap as WireArgs, InnerApi, Request, Response};
use seclink_worker::{Dispatcher, run_worker};
use tracing::{debug, info, warn};

use crate::{
    ApiError, ArgMap, ArgValue, CallArgs, Ledger, PendingOp, PromiseCrashed, PromiseFuture,
    SessionConfig, UpdateMap, UpdateTarget, apply_updates, promise, settled,
};

// === Link === //

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LinkState {
    Open,
    Destroyed,
    Crashed { was_panic: bool },
}

/// The caller's end of the channel pair to a worker.
#[derive(Debug)]
struct Link {
    requests: UnboundedSender<Request>,
    responses: RefCell<UnboundedReceiver<Response>>,
    ledger: RefCell<Ledger>,
    worker: RefCell<Option<thread::JoinHandle<()>>>,
    state: Cell<LinkState>,
    messages_sent: Cell<usize>,
}

impl Link {
    fn send(&self, req: Request) -> Result<(), Request> {
        self.requests
            .unbounded_send(req)
            .map_err(|err| err.into_inner())?;

        self.messages_sent.set(self.messages_sent.get() + 1);
        Ok(())
    }

    /// Fails unless a new operation may start right now.
    fn check_ready(&self) -> Result<(), ApiError> {
        self.drain_orphan();
        self.ledger.borrow().check_idle()?;

        match self.state.get() {
            LinkState::Open => Ok(()),
            LinkState::Destroyed => Err(ApiError::AlreadyDestroyed),
            LinkState::Crashed { was_panic } => Err(PromiseCrashed { was_panic }.into()),
        }
    }

    /// Settles an operation whose future was dropped if its response has already arrived.
    fn drain_orphan(&self) {
        let orphaned = self
            .ledger
            .borrow()
            .pending()
            .is_some_and(PendingOp::is_orphaned);

        if !orphaned {
            return;
        }

        // `try_recv` keeps whatever waker `wait_idle` registered.
        loop {
            let received = self.responses.borrow_mut().try_recv();

            match received {
                Ok(res) => self.settle(res),
                Err(TryRecvError::Closed) => {
                    self.lost();
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    /// Settles every response that has arrived.
    fn pump(&self, cx: &mut task::Context<'_>) {
        loop {
            let polled = self.responses.borrow_mut().poll_next_unpin(cx);

            match polled {
                Poll::Ready(Some(res)) => self.settle(res),
                Poll::Ready(None) => {
                    self.lost();
                    break;
                }
                Poll::Pending => break,
            }
        }
    }

    fn settle(&self, res: Response) {
        let Some(op) = self.ledger.borrow_mut().take() else {
            warn!(kind = ?res.kind(), "dropping response with no pending operation");
            return;
        };

        debug!(%op, "settling operation");

        match op {
            PendingOp::Init(resolver) => match res {
                Response::InitComplete { inner_api } => resolver.accept(inner_api),
                other => resolver.reject(unexpected(other)),
            },
            PendingOp::Call {
                resolver, updates, ..
            } => match res {
                Response::CallReturn { update_args, ret } => {
                    apply_updates(updates, update_args, true);
                    resolver.accept(ret);
                }
                Response::Error { error, update_args } => {
                    apply_updates(updates, update_args, false);
                    resolver.reject(ApiError::Remote(error));
                }
                other => resolver.reject(ApiError::UnexpectedResponse(other.kind())),
            },
            PendingOp::Destroy(resolver) => {
                self.state.set(LinkState::Destroyed);
                self.shutdown();

                match res {
                    Response::DestroyComplete => resolver.accept(()),
                    other => resolver.reject(unexpected(other)),
                }
            }
        }
    }

    /// Handles the worker hanging up. The pending operation, if any, rejects with
    /// [`ApiError::WorkerCrashed`].
    fn lost(&self) {
        let was_panic = self.shutdown();

        if self.state.get() == LinkState::Open {
            warn!(was_panic, "worker went away");
            self.state.set(LinkState::Crashed { was_panic });
        }

        let op = self.ledger.borrow_mut().take();

        match op {
            Some(PendingOp::Init(resolver)) => resolver.reject(PromiseCrashed { was_panic }.into()),
            Some(PendingOp::Call { resolver, .. }) => {
                resolver.reject(PromiseCrashed { was_panic }.into())
            }
            Some(PendingOp::Destroy(resolver)) => {
                resolver.reject(PromiseCrashed { was_panic }.into())
            }
            None => {}
        }
    }

    /// Closes the request channel and joins the worker thread. Returns whether it panicked.
    fn shutdown(&self) -> bool {
        self.requests.close_channel();

        let Some(handle) = self.worker.borrow_mut().take() else {
            return false;
        };

        handle.join().is_err()
    }

    fn poll_op<T>(
        &self,
        result: &mut PromiseFuture<T, ApiError>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<T, ApiError>> {
        self.pump(cx);
        Pin::new(result).poll(cx)
    }
}

fn unexpected(res: Response) -> ApiError {
    match res {
        Response::Error { error, .. } => ApiError::Remote(error),
        other => ApiError::UnexpectedResponse(other.kind()),
    }
}

// === Pending === //

/// An outstanding operation. Dropping it does not cancel the operation: the session stays busy
/// until the response arrives and is drained.
#[derive_where(Debug)]
pub struct Pending<T: 'static> {
    link: Rc<Link>,
    result: PromiseFuture<T, ApiError>,
}

pub type PendingCall = Pending<Value>;

pub type PendingDestroy = Pending<()>;

impl<T: 'static> Future for Pending<T> {
    type Output = Result<T, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        me.link.poll_op(&mut me.result, cx)
    }
}

// === Session === //

/// A handle to one isolated native surface.
///
/// Only one operation may be outstanding per session. Starting another while one is pending
/// fails immediately with [`ApiError::OperationInProgress`]; requests are never queued.
#[derive(Debug)]
pub struct Session {
    link: Rc<Link>,
    procedures: BTreeMap<String, Procedure>,
}

impl Session {
    /// Starts a worker for `surface` and waits for it to announce its routines.
    pub async fn initialize(config: SessionConfig, surface: NativeSurface) -> Result<Self, ApiError> {
        if !config.spawner.supports_transfer() {
            return Err(ApiError::UnsupportedEnvironment(
                "the worker cannot receive buffers without copying them".to_string(),
            ));
        }

        let (req_tx, req_rx) = mpsc::unbounded();
        let (res_tx, res_rx) = mpsc::unbounded();

        let worker_config = config.worker.clone();
        let handle = config
            .spawner
            .spawn(
                &config.worker_name,
                config.worker_stack_size,
                Box::new(move || {
                    run_worker(Dispatcher::new(surface, worker_config), req_rx, res_tx);
                }),
            )
            .map_err(|err| {
                ApiError::UnsupportedEnvironment(format!("failed to start the worker: {err}"))
            })?;

        let link = Rc::new(Link {
            requests: req_tx,
            responses: RefCell::new(res_rx),
            ledger: RefCell::default(),
            worker: RefCell::new(Some(handle)),
            state: Cell::new(LinkState::Open),
            messages_sent: Cell::new(0),
        });

        let (resolver, mut result) = promise();
        link.ledger.borrow_mut().begin(PendingOp::Init(resolver))?;

        if link.send(Request::Init).is_err() {
            link.lost();
        }

        let api = match future::poll_fn(|cx| link.poll_op(&mut result, cx)).await {
            Ok(api) => api,
            Err(err) => {
                warn!("failed to initialize session: {err}");
                link.shutdown();
                return Err(err);
            }
        };

        info!(routines = api.len(), "session initialized");

        let procedures = api
            .into_iter()
            .map(|(name, spec)| {
                let procedure = Procedure {
                    name: name.clone(),
                    spec,
                    link: link.clone(),
                };

                (name, procedure)
            })
            .collect();

        Ok(Self { link, procedures })
    }

    pub fn procedure(&self, name: &str) -> Result<&Procedure, ApiError> {
        self.procedures
            .get(name)
            .ok_or_else(|| ApiError::UnknownProcedure(name.to_string()))
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> + '_ {
        self.procedures.values()
    }

    /// The routines announced by the worker.
    pub fn api(&self) -> InnerApi {
        self.procedures
            .iter()
            .map(|(name, procedure)| (name.clone(), procedure.spec.clone()))
            .collect()
    }

    pub fn call(&self, name: &str, args: &CallArgs) -> Result<PendingCall, ApiError> {
        self.procedure(name)?.call(args)
    }

    /// Whether an operation is outstanding, including one whose future was dropped.
    pub fn is_busy(&self) -> bool {
        self.link.drain_orphan();
        self.link.ledger.borrow().is_pending()
    }

    pub fn is_destroyed(&self) -> bool {
        self.link.state.get() == LinkState::Destroyed
    }

    /// The number of requests handed to the worker so far, including `init`.
    pub fn messages_sent(&self) -> usize {
        self.link.messages_sent.get()
    }

    /// Waits until no operation is outstanding. Useful after dropping a pending future.
    pub async fn wait_idle(&self) {
        future::poll_fn(|cx| {
            self.link.pump(cx);

            if self.link.ledger.borrow().is_pending() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await
    }

    /// Tears the worker down. Destroying an already destroyed session resolves immediately.
    pub fn destroy(&self) -> Result<PendingDestroy, ApiError> {
        let link = &self.link;

        if link.state.get() == LinkState::Destroyed {
            link.drain_orphan();
            link.ledger.borrow().check_idle()?;

            return Ok(Pending {
                link: link.clone(),
                result: settled(Ok(())),
            });
        }

        link.check_ready()?;

        let (resolver, result) = promise();
        link.ledger.borrow_mut().begin(PendingOp::Destroy(resolver))?;

        debug!("requesting teardown");

        if link.send(Request::Destroy).is_err() {
            link.lost();
        }

        Ok(Pending {
            link: link.clone(),
            result,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.link.state.get() == LinkState::Open {
            debug!("session dropped without being destroyed");

            // The worker tears its dispatcher down once the request channel closes.
            self.link.state.set(LinkState::Destroyed);
            self.link.requests.close_channel();
        }
    }
}

// === Procedure === //

/// A callable native routine as announced by the worker.
#[derive_where(Debug)]
#[derive(Clone)]
pub struct Procedure {
    name: String,
    spec: FunctionSpec,
    #[derive_where(skip)]
    link: Rc<Link>,
}

impl Procedure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    /// Calls the routine with arguments keyed by their declared names.
    pub fn call(&self, args: &CallArgs) -> Result<PendingCall, ApiError> {
        self.dispatch(args, None)
    }

    /// Calls the routine with arguments located through `map`.
    pub fn call_mapped(&self, args: &CallArgs, map: &ArgMap) -> Result<PendingCall, ApiError> {
        self.dispatch(args, Some(map))
    }

    fn dispatch(&self, args: &CallArgs, map: Option<&ArgMap>) -> Result<PendingCall, ApiError> {
        let link = &self.link;
        let procedure = &self.name;

        link.check_ready()?;

        let expected = self.spec.caller_args().count();

        match map {
            Some(ArgMap::Positional(keys)) if keys.len() < expected => {
                return Err(ApiError::IncompleteArgMap {
                    procedure: procedure.clone(),
                    expected,
                    got: keys.len(),
                });
            }
            _ => {}
        }

        // Check every argument before detaching anything.
        let mut resolved = Vec::with_capacity(expected);

        for (index, arg) in self.spec.caller_args().enumerate() {
            let key = match map {
                Some(map) => map.key(index, &arg.name),
                None => Some(arg.name.as_str()),
            };

            let Some(value) = key.and_then(|key| args.get(key)) else {
                return Err(ApiError::MissingArgument {
                    procedure: procedure.clone(),
                    name: arg.name.clone(),
                });
            };

            let Some(shape) = value.shape() else {
                return Err(ApiError::DetachedBuffer {
                    procedure: procedure.clone(),
                    name: arg.name.clone(),
                });
            };

            if !arg.kind.accepts(shape) {
                return Err(ApiError::ArgumentTypeMismatch {
                    procedure: procedure.clone(),
                    name: arg.name.clone(),
                    expected: arg.kind.expectation(),
                    found: shape.to_string(),
                });
            }

            resolved.push((arg.name.as_str(), value));
        }

        // Move buffers out of the caller's handles.
        let mut wire = WireArgs::new();
        let mut updates = UpdateMap::default();

        for (name, value) in resolved {
            let value = match value {
                ArgValue::Null => Value::Null,
                ArgValue::Number(n) => Value::Number(*n),
                ArgValue::Str(s) => Value::Str(s.clone()),
                ArgValue::Cell(cell) => {
                    updates.insert(name.to_string(), UpdateTarget::Cell(cell.clone()));
                    Value::Cell(cell.get())
                }
                ArgValue::Buffer(buffer) => {
                    let Some(storage) = buffer.detach() else {
                        // The same buffer was passed for two arguments.
                        apply_updates(updates, wire, false);

                        return Err(ApiError::DetachedBuffer {
                            procedure: procedure.clone(),
                            name: name.to_string(),
                        });
                    };

                    updates.insert(name.to_string(), UpdateTarget::Buffer(buffer.clone()));
                    Value::Buffer(storage)
                }
            };

            wire.insert(name.to_string(), value);
        }

        let (resolver, result) = promise();
        link.ledger.borrow_mut().begin(PendingOp::Call {
            procedure: procedure.clone(),
            resolver,
            updates,
        })?;

        debug!(procedure, "dispatching call");

        let req = Request::Call {
            procedure: procedure.clone(),
            args: wire,
        };

        if let Err(req) = link.send(req) {
            // Hand the buffers back before reporting the crash.
            let op = link.ledger.borrow_mut().take();

            if let (Some(PendingOp::Call { updates, .. }), Request::Call { args, .. }) = (op, req) {
                apply_updates(updates, args, false);
            }

            link.lost();
        }

        Ok(Pending {
            link: link.clone(),
            result,
        })
    }
}
