use std::mem;

use rustc_hash::FxHashMap;
use seclink::{
    ArgKind, ContextHooks, FunctionSpec, MarshalError, NativeSurface, ScratchArena, ScratchConfig,
    SpecError, Value, Wrapper,
};
use seclink_protocol::{ArgMap, ErrorPayload, ErrorType, InnerApi, Request, Response, codec};
use thiserror::Error;
use tracing::{debug, info, warn};

// === Config === //

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub scratch: ScratchConfig,
}

// === Errors === //

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("the native surface has not been initialized")]
    NotInitialized,

    #[error("the native surface is already initialized")]
    AlreadyInitialized,

    #[error("the native surface has already been destroyed")]
    AlreadyDestroyed,

    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl From<DispatchError> for ErrorPayload {
    fn from(err: DispatchError) -> Self {
        ErrorPayload::new(ErrorType::Dispatch, err)
    }
}

fn marshal_payload(err: &MarshalError) -> ErrorPayload {
    let error_type = if err.is_native() {
        ErrorType::Native
    } else {
        ErrorType::Wrapper
    };

    ErrorPayload::new(error_type, err)
}

fn spec_payload(err: &SpecError) -> ErrorPayload {
    ErrorPayload::new(ErrorType::Wrapper, err)
}

// === Dispatcher === //

/// Serves requests against a native surface.
///
/// The dispatcher moves from uninitialized to ready on `init` and from ready to destroyed on
/// `destroy`. Only a ready dispatcher accepts calls. Requests that are not valid in the current
/// state are answered with a `dispatch` error and leave the state untouched.
#[derive(Debug)]
pub struct Dispatcher {
    state: State,
    arena: ScratchArena,
}

#[derive(Debug)]
enum State {
    Uninitialized(NativeSurface),

    /// The wrappers are built but acquiring the native context failed. `init` may be retried.
    Prepared(Prepared),

    Ready(Ready),
    Destroyed,
}

#[derive(Debug)]
struct Prepared {
    wrappers: FxHashMap<String, Wrapper>,
    context: Option<ContextWrappers>,
}

#[derive(Debug)]
struct ContextWrappers {
    create: Wrapper,
    create_args: Vec<Value>,
    destroy: Wrapper,
}

#[derive(Debug)]
struct Ready {
    wrappers: FxHashMap<String, Wrapper>,
    context: Option<LiveContext>,
    api: InnerApi,
}

#[derive(Debug)]
struct LiveContext {
    handle: Value,
    destroy: Wrapper,
}

impl Dispatcher {
    pub fn new(surface: NativeSurface, config: WorkerConfig) -> Self {
        Self {
            state: State::Uninitialized(surface),
            arena: ScratchArena::new(config.scratch),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, State::Destroyed)
    }

    pub fn arena(&self) -> &ScratchArena {
        &self.arena
    }

    /// The announced API, once initialized.
    pub fn api(&self) -> Option<&InnerApi> {
        match &self.state {
            State::Ready(ready) => Some(&ready.api),
            _ => None,
        }
    }

    pub fn handle(&mut self, req: Request) -> Response {
        debug!(operation = req.operation(), "handling request");

        match req {
            Request::Init => match self.init() {
                Ok(inner_api) => Response::InitComplete { inner_api },
                Err(err) => Response::error(err),
            },
            Request::Call { procedure, args } => self.call(&procedure, args),
            Request::Destroy => match self.destroy() {
                Ok(()) => Response::DestroyComplete,
                Err(err) => Response::error(err),
            },
        }
    }

    /// Handles a request still in its framed form. Frames that do not decode to a request are
    /// answered with a `dispatch` error.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Response {
        match codec::decode_frame::<Request>(frame) {
            Ok(req) => self.handle(req),
            Err(err) => {
                warn!("rejecting malformed request: {err:#}");
                Response::error(DispatchError::MalformedRequest(format!("{err:#}")).into())
            }
        }
    }

    pub fn init(&mut self) -> Result<InnerApi, ErrorPayload> {
        let prepared = match mem::replace(&mut self.state, State::Destroyed) {
            State::Ready(ready) => {
                self.state = State::Ready(ready);
                return Err(DispatchError::AlreadyInitialized.into());
            }
            State::Destroyed => return Err(DispatchError::AlreadyDestroyed.into()),
            State::Uninitialized(surface) => {
                if let Err(err) = validate_surface(&surface) {
                    self.state = State::Uninitialized(surface);
                    return Err(err);
                }

                prepare(surface)
            }
            State::Prepared(prepared) => prepared,
        };

        let Prepared {
            wrappers,
            mut context,
        } = prepared;

        // Acquire the native context.
        let created = context.as_mut().map(|context| {
            let mut args = context.create_args.clone();
            args.resize(context.create.spec().args.len(), Value::Null);

            context.create.call(&mut self.arena, &mut args)
        });

        let handle = match created {
            Some(Ok(handle)) => Some(handle),
            Some(Err(err)) => {
                warn!("failed to create native context: {err}");

                self.state = State::Prepared(Prepared { wrappers, context });

                return Err(ErrorPayload::new(
                    ErrorType::InnerApi,
                    format_args!("failed to create native context: {err}"),
                ));
            }
            None => None,
        };

        let api = wrappers
            .iter()
            .map(|(name, wrapper)| (name.clone(), wrapper.spec().clone()))
            .collect::<InnerApi>();

        info!(routines = api.len(), "native surface initialized");

        self.state = State::Ready(Ready {
            wrappers,
            context: context.zip(handle).map(|(context, handle)| LiveContext {
                handle,
                destroy: context.destroy,
            }),
            api: api.clone(),
        });

        Ok(api)
    }

    /// Runs a procedure with named arguments. Buffer and cell arguments are returned in
    /// `update_args` whether or not the call succeeds.
    pub fn call(&mut self, procedure: &str, mut args: ArgMap) -> Response {
        let Self { state, arena } = self;

        let ready = match state {
            State::Ready(ready) => ready,
            State::Destroyed => {
                return reject(DispatchError::AlreadyDestroyed.into(), args);
            }
            State::Uninitialized(_) | State::Prepared(_) => {
                return reject(DispatchError::NotInitialized.into(), args);
            }
        };

        let Some(wrapper) = ready.wrappers.get_mut(procedure) else {
            return reject(
                DispatchError::UnknownProcedure(procedure.to_string()).into(),
                args,
            );
        };

        if let Some(missing) = wrapper
            .spec()
            .caller_args()
            .find(|arg| !args.contains_key(&arg.name))
        {
            let err = ErrorPayload::new(
                ErrorType::Wrapper,
                format_args!(
                    "missing argument `{}` in call to `{procedure}`",
                    missing.name
                ),
            );

            return reject(err, args);
        }

        // Lay the arguments out positionally.
        let handle = ready
            .context
            .as_ref()
            .map_or(Value::Null, |ctx| ctx.handle.clone());

        let mut positional = wrapper
            .spec()
            .args
            .iter()
            .map(|arg| match arg.kind {
                ArgKind::Context => handle.clone(),
                _ => args.remove(&arg.name).unwrap_or(Value::Null),
            })
            .collect::<Vec<_>>();

        debug!(procedure, "calling native routine");

        let res = wrapper.call(arena, &mut positional);

        // Hand every container back, including any the routine did not declare.
        let mut update_args = updatable(args);

        for (arg, value) in wrapper.spec().args.iter().zip(positional) {
            if arg.kind.is_caller_supplied() && value.is_updatable() {
                update_args.insert(arg.name.clone(), value);
            }
        }

        match res {
            Ok(ret) => Response::CallReturn { update_args, ret },
            Err(err) => Response::Error {
                error: marshal_payload(&err),
                update_args,
            },
        }
    }

    /// Releases the native context. Destroying twice is a no-op.
    pub fn destroy(&mut self) -> Result<(), ErrorPayload> {
        let ready = match mem::replace(&mut self.state, State::Destroyed) {
            State::Ready(ready) => ready,
            State::Destroyed => return Ok(()),
            other => {
                self.state = other;
                return Err(DispatchError::NotInitialized.into());
            }
        };

        info!("destroying native surface");

        let Some(LiveContext {
            handle,
            destroy: mut wrapper,
        }) = ready.context
        else {
            return Ok(());
        };

        let mut args = wrapper
            .spec()
            .args
            .iter()
            .map(|arg| match arg.kind {
                ArgKind::Context => handle.clone(),
                _ => Value::Null,
            })
            .collect::<Vec<_>>();

        wrapper.call(&mut self.arena, &mut args).map_err(|err| {
            warn!("failed to destroy native context: {err}");

            ErrorPayload::new(
                ErrorType::InnerApi,
                format_args!("failed to destroy native context: {err}"),
            )
        })?;

        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.is_ready() {
            debug!("dispatcher dropped while ready; releasing the native context");

            if let Err(err) = self.destroy() {
                warn!("{err}");
            }
        }
    }
}

// === Helpers === //

fn reject(error: ErrorPayload, args: ArgMap) -> Response {
    Response::Error {
        error,
        update_args: updatable(args),
    }
}

fn updatable(args: ArgMap) -> ArgMap {
    args.into_iter()
        .filter(|(_, value)| value.is_updatable())
        .collect()
}

fn validate_surface(surface: &NativeSurface) -> Result<(), ErrorPayload> {
    for routine in surface.routines() {
        FunctionSpec::parse(&routine.name, &routine.args, &routine.ret)
            .map_err(|err| spec_payload(&err))?;
    }

    if let Some(ContextHooks {
        create, destroy, ..
    }) = surface.context_hooks()
    {
        for name in [create, destroy] {
            if surface.get(name).is_none() {
                return Err(ErrorPayload::new(
                    ErrorType::InnerApi,
                    format_args!("context routine `{name}` is not registered"),
                ));
            }
        }
    }

    Ok(())
}

fn prepare(surface: NativeSurface) -> Prepared {
    let (routines, hooks) = surface.into_parts();

    let mut wrappers = FxHashMap::default();
    let mut internals = FxHashMap::default();

    for routine in routines {
        // Specs were checked by `validate_surface`.
        let Ok(wrapper) = Wrapper::new(routine) else {
            continue;
        };

        let name = wrapper.name().to_string();
        let is_internal = hooks
            .as_ref()
            .is_some_and(|hooks| hooks.create == name || hooks.destroy == name);

        if is_internal {
            internals.insert(name, wrapper);
        } else {
            wrappers.insert(name, wrapper);
        }
    }

    let context = hooks.and_then(|hooks| {
        Some(ContextWrappers {
            create: internals.remove(&hooks.create)?,
            create_args: hooks.create_args,
            destroy: internals.remove(&hooks.destroy)?,
        })
    });

    Prepared { wrappers, context }
}
