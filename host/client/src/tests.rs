#![cfg(test)]

use std::{cell::Cell, io, rc::Rc, thread, time::Duration};

use futures::{executor::LocalPool, task::LocalSpawnExt as _};
use seclink::{ArgKind, Buffer, NativeSurface, NativeValue, Number, Value};
use seclink_protocol::ErrorType;

use super::*;

fn session() -> Session {
    smol::block_on(Session::initialize(SessionConfig::default(), demo_surface())).unwrap()
}

fn copy_args(input: &SharedBuffer, output: &SharedBuffer, len: &OutCell) -> CallArgs {
    CallArgs::new()
        .with("input", input)
        .with("output", output)
        .with("len", len)
}

#[test]
fn copy_scenario() {
    let session = session();

    let input = SharedBuffer::new(vec![0u8; 32]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let len = OutCell::with(0);

    let ret = smol::block_on(
        session
            .call("demo_copy", &copy_args(&input, &output, &len))
            .unwrap(),
    )
    .unwrap();

    assert_eq!(ret, Value::int(1));
    assert_eq!(output.snapshot(), Some(vec![0u8; 32].into()));
    assert_eq!(input.snapshot(), Some(vec![0u8; 32].into()));
    assert_eq!(len.get(), Some(Number::Int(32)));

    smol::block_on(session.destroy().unwrap()).unwrap();
}

#[test]
fn outputs_reach_every_alias() {
    let session = session();

    let input = SharedBuffer::new((0..32).collect::<Vec<u8>>());
    let output = SharedBuffer::new(vec![0u8; 32]);
    let output_alias = output.clone();
    let len = OutCell::new();
    let len_alias = len.clone();
    assert_eq!(len.get(), Some(Number::Int(0)));

    let pending = session
        .call("demo_copy", &copy_args(&input, &output, &len))
        .unwrap();

    // The worker holds the storage until the call settles.
    assert!(output_alias.is_detached());
    assert!(input.is_detached());
    assert!(session.is_busy());

    smol::block_on(pending).unwrap();

    assert!(output.ptr_eq(&output_alias));
    assert_eq!(
        output_alias.get().as_deref(),
        Some(&Buffer::from((0..32).collect::<Vec<u8>>()))
    );
    assert_eq!(len_alias.get(), Some(Number::Int(32)));
    assert!(!session.is_busy());
}

#[test]
fn one_operation_at_a_time() {
    let session = session();

    let input = SharedBuffer::new(vec![3u8; 32]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let len = OutCell::with(0);

    let first = session
        .call("demo_copy", &copy_args(&input, &output, &len))
        .unwrap();
    let sent = session.messages_sent();

    let other = CallArgs::new()
        .with("input", SharedBuffer::new(vec![0u8; 32]))
        .with("output", SharedBuffer::new(vec![0u8; 32]))
        .with("len", 0);

    assert!(matches!(
        session.call("demo_copy", &other),
        Err(ApiError::OperationInProgress(_))
    ));
    assert!(matches!(
        session.destroy(),
        Err(ApiError::OperationInProgress(_))
    ));
    assert_eq!(session.messages_sent(), sent);

    // The first call is unaffected.
    smol::block_on(first).unwrap();
    assert_eq!(output.snapshot(), Some(vec![3u8; 32].into()));
    assert_eq!(len.get(), Some(Number::Int(32)));

    smol::block_on(session.call("demo_copy", &other).unwrap()).unwrap();
}

#[test]
fn mismatched_arguments_send_nothing() {
    let session = session();
    let sent = session.messages_sent();

    let wide = SharedBuffer::new(vec![0u16; 16]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let len = OutCell::with(0);

    let err = session
        .call("demo_copy", &copy_args(&wide, &output, &len))
        .unwrap_err();

    assert!(matches!(err, ApiError::ArgumentTypeMismatch { ref name, .. } if name == "input"));
    assert_eq!(err.error_type(), ErrorType::Api);
    assert!(!wide.is_detached());
    assert!(!output.is_detached());

    let err = session
        .call("demo_copy", &CallArgs::new().with("input", &output))
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingArgument { ref name, .. } if name == "output"));

    // A bare number is fine for an output slot but a string is not.
    let err = session
        .call(
            "demo_copy",
            &copy_args(&SharedBuffer::new(vec![0u8; 32]), &output, &len)
                .with("len", "thirty-two"),
        )
        .unwrap_err();
    assert!(matches!(err, ApiError::ArgumentTypeMismatch { ref name, .. } if name == "len"));

    // Null cells only fit pointer outputs.
    let err = session
        .call(
            "demo_copy",
            &copy_args(&SharedBuffer::new(vec![0u8; 32]), &output, &OutCell::empty()),
        )
        .unwrap_err();
    assert!(matches!(err, ApiError::ArgumentTypeMismatch { ref name, .. } if name == "len"));

    assert_eq!(session.messages_sent(), sent);
    assert!(!session.is_busy());
}

#[test]
fn one_buffer_cannot_back_two_arguments() {
    let session = session();
    let sent = session.messages_sent();

    let shared = SharedBuffer::new(vec![1u8; 32]);
    let err = session
        .call("demo_copy", &copy_args(&shared, &shared, &OutCell::with(0)))
        .unwrap_err();

    assert!(matches!(err, ApiError::DetachedBuffer { .. }));
    assert_eq!(shared.snapshot(), Some(vec![1u8; 32].into()));
    assert_eq!(session.messages_sent(), sent);
}

#[test]
fn native_faults_hand_buffers_back() {
    let session = session();

    let values = SharedBuffer::new(vec![1i32, 2, 3]);
    let total = OutCell::with(-1);

    let args = CallArgs::new()
        .with("values", &values)
        .with("count", 10)
        .with("total", &total);

    let err = smol::block_on(session.call("demo_sum", &args).unwrap()).unwrap_err();

    assert_eq!(err.error_type(), ErrorType::Native);
    assert!(err.to_string().contains("shorter than `count`"), "{err}");
    assert_eq!(values.snapshot(), Some(vec![1i32, 2, 3].into()));
    assert_eq!(total.get(), Some(Number::Int(-1)));

    let args = CallArgs::new()
        .with("values", &values)
        .with("count", 3)
        .with("total", &total);

    smol::block_on(session.call("demo_sum", &args).unwrap()).unwrap();
    assert_eq!(total.get(), Some(Number::Int(6)));
}

#[test]
fn strings_pass_through() {
    let session = session();

    let data = SharedBuffer::new(vec![0u8; 5]);
    let args = CallArgs::new()
        .with("data", &data)
        .with("len", 5)
        .with("key", "ab");

    smol::block_on(session.call("demo_xor", &args).unwrap()).unwrap();
    assert_eq!(data.snapshot(), Some(b"ababa".to_vec().into()));
}

#[test]
fn argument_maps() {
    let session = session();
    let copy = session.procedure("demo_copy").unwrap();

    let src = SharedBuffer::new(vec![9u8; 32]);
    let dst = SharedBuffer::new(vec![0u8; 32]);
    let written = OutCell::with(0);

    let args = CallArgs::new()
        .with("src", &src)
        .with("dst", &dst)
        .with("len", &written);

    // Unmapped names are looked up as-is.
    let renamed = ArgMap::renamed([("input", "src"), ("output", "dst")]);
    smol::block_on(copy.call_mapped(&args, &renamed).unwrap()).unwrap();
    assert_eq!(dst.snapshot(), Some(vec![9u8; 32].into()));
    assert_eq!(written.get(), Some(Number::Int(32)));

    let positional = ArgMap::positional(["dst", "src", "len"]);
    smol::block_on(copy.call_mapped(&args, &positional).unwrap()).unwrap();
    assert_eq!(src.snapshot(), Some(vec![9u8; 32].into()));

    let short = ArgMap::positional(["src", "dst"]);
    let err = copy.call_mapped(&args, &short).unwrap_err();
    assert!(matches!(
        err,
        ApiError::IncompleteArgMap {
            expected: 3,
            got: 2,
            ..
        }
    ));
}

#[test]
fn announced_api_hides_context_routines() {
    let session = session();

    let names = session.procedures().map(Procedure::name).collect::<Vec<_>>();
    assert_eq!(names, ["demo_copy", "demo_sum", "demo_xor"]);

    let copy = session.procedure("demo_copy").unwrap();
    assert_eq!(copy.spec().args[0].kind, ArgKind::Context);
    assert_eq!(session.api().len(), 3);

    assert!(matches!(
        session.call("demo_context_destroy", &CallArgs::new()),
        Err(ApiError::UnknownProcedure(_))
    ));
}

#[test]
fn destroy_is_idempotent() {
    let session = session();
    let copy = session.procedure("demo_copy").unwrap().clone();

    smol::block_on(session.destroy().unwrap()).unwrap();
    assert!(session.is_destroyed());

    smol::block_on(session.destroy().unwrap()).unwrap();

    let input = SharedBuffer::new(vec![0u8; 32]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let err = copy
        .call(&copy_args(&input, &output, &OutCell::with(0)))
        .unwrap_err();

    assert!(matches!(err, ApiError::AlreadyDestroyed));
    assert!(!input.is_detached());
}

#[test]
fn dropped_calls_still_settle() {
    let session = session();

    let input = SharedBuffer::new(vec![5u8; 32]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let len = OutCell::with(0);

    drop(
        session
            .call("demo_copy", &copy_args(&input, &output, &len))
            .unwrap(),
    );

    smol::block_on(session.wait_idle());

    assert_eq!(output.snapshot(), Some(vec![5u8; 32].into()));
    assert_eq!(len.get(), Some(Number::Int(32)));

    smol::block_on(
        session
            .call("demo_copy", &copy_args(&input, &output, &len))
            .unwrap(),
    )
    .unwrap();
}

#[test]
fn busy_checks_do_not_strand_idle_waiters() {
    let surface = NativeSurface::builder().routine("slow", &[], "v", |_, _| {
        thread::sleep(Duration::from_millis(200));
        Ok(NativeValue::Void)
    });

    let session =
        Rc::new(smol::block_on(Session::initialize(SessionConfig::default(), surface)).unwrap());

    drop(session.call("slow", &CallArgs::new()).unwrap());

    let mut pool = LocalPool::new();
    let idle = Rc::new(Cell::new(false));

    pool.spawner()
        .spawn_local({
            let session = session.clone();
            let idle = idle.clone();

            async move {
                session.wait_idle().await;
                idle.set(true);
            }
        })
        .unwrap();

    pool.run_until_stalled();
    assert!(!idle.get());

    // Draining the orphaned call here must not steal the waiter's wakeup.
    assert!(session.is_busy());

    thread::sleep(Duration::from_millis(800));
    pool.run_until_stalled();

    assert!(idle.get());
    assert!(!session.is_busy());
}

#[test]
fn bad_surfaces_fail_initialization() {
    let surface = NativeSurface::builder().routine("bad", &[("x", "q32")], "v", |_, _| {
        Ok(NativeValue::Void)
    });

    let err = smol::block_on(Session::initialize(SessionConfig::default(), surface)).unwrap_err();
    assert_eq!(err.error_type(), ErrorType::Wrapper);
    assert!(err.remote().is_some());
}

#[derive(Debug)]
struct NoTransfer;

impl Spawner for NoTransfer {
    fn supports_transfer(&self) -> bool {
        false
    }

    fn spawn(
        &self,
        _name: &str,
        _stack_size: Option<usize>,
        _main: WorkerMain,
    ) -> io::Result<thread::JoinHandle<()>> {
        panic!("should not be spawned");
    }
}

#[derive(Debug)]
struct NoThreads;

impl Spawner for NoThreads {
    fn spawn(
        &self,
        _name: &str,
        _stack_size: Option<usize>,
        _main: WorkerMain,
    ) -> io::Result<thread::JoinHandle<()>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no threads here"))
    }
}

/// Starts a thread that exits without serving anything.
#[derive(Debug)]
struct Stillborn;

impl Spawner for Stillborn {
    fn spawn(
        &self,
        _name: &str,
        _stack_size: Option<usize>,
        main: WorkerMain,
    ) -> io::Result<thread::JoinHandle<()>> {
        Ok(thread::spawn(move || drop(main)))
    }
}

#[test]
fn unsupported_environments_are_reported() {
    for config in [
        SessionConfig::default().spawner(NoTransfer),
        SessionConfig::default().spawner(NoThreads),
    ] {
        let err = smol::block_on(Session::initialize(config, demo_surface())).unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedEnvironment(_)), "{err}");
        assert_eq!(err.error_type(), ErrorType::Api);
    }
}

#[test]
fn vanished_workers_reject_the_pending_operation() {
    let config = SessionConfig::default().spawner(Stillborn);

    let err = smol::block_on(Session::initialize(config, demo_surface())).unwrap_err();
    assert!(matches!(err, ApiError::WorkerCrashed(_)), "{err}");
}

#[test]
fn scratch_limits_travel_with_the_config() {
    let config = SessionConfig::default()
        .worker_name("tiny worker")
        .max_region_bytes(16);

    let session = smol::block_on(Session::initialize(config, demo_surface())).unwrap();

    let input = SharedBuffer::new(vec![0u8; 32]);
    let output = SharedBuffer::new(vec![0u8; 32]);
    let err = smol::block_on(
        session
            .call("demo_copy", &copy_args(&input, &output, &OutCell::with(0)))
            .unwrap(),
    )
    .unwrap_err();

    assert_eq!(err.error_type(), ErrorType::Wrapper);
    assert!(!output.is_detached());
}
