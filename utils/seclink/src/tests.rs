#![cfg(test)]

use super::*;

fn wrapper(
    name: &str,
    args: &[(&str, &str)],
    ret: &str,
    func: impl 'static
    + Send
    + FnMut(&mut CallMemory<'_>, &[NativeArg<'_>]) -> Result<NativeValue, NativeFault>,
) -> Wrapper {
    let surface = NativeSurface::builder().routine(name, args, ret, func);
    let (mut routines, _) = surface.into_parts();
    Wrapper::new(routines.remove(0)).unwrap()
}

fn copy_routine() -> Wrapper {
    wrapper(
        "copy",
        &[("ctx", "ip"), ("input", "i[8]"), ("output", "o[8]"), ("len", "o32")],
        "32",
        |mem, args| {
            let input = args[1].as_ptr().unwrap();
            let output = args[2].as_ptr().unwrap();
            let len = args[3].as_ptr().unwrap();

            mem.copy_within(input, output, 32)?;
            mem.write::<u32>(len, 32)?;

            Ok(NativeValue::Int(1))
        },
    )
}

#[test]
fn copy_scenario() {
    let mut arena = ScratchArena::default();
    let mut copy = copy_routine();

    let input = (0..32).collect::<Vec<u8>>();
    let mut args = vec![
        Value::Null,
        Value::Buffer(input.clone().into()),
        Value::Buffer(vec![0u8; 32].into()),
        Value::cell(0),
    ];

    let ret = copy.call(&mut arena, &mut args).unwrap();

    assert_eq!(ret, Value::int(1));
    assert_eq!(args[2], Value::Buffer(input.into()));
    assert_eq!(args[3], Value::cell(32));
    assert_eq!(arena.allocations(), 1);
    assert_eq!(arena.releases(), 1);
    assert_eq!(arena.live_regions(), 0);
}

#[test]
fn outputs_are_written_in_place() {
    let mut arena = ScratchArena::default();
    let mut copy = copy_routine();

    let mut args = vec![
        Value::Null,
        Value::Buffer(vec![7u8; 32].into()),
        Value::Buffer(vec![0u8; 32].into()),
        Value::int(0),
    ];

    let before = args[2].as_buffer().unwrap().storage_addr();
    copy.call(&mut arena, &mut args).unwrap();

    assert_eq!(args[2].as_buffer().unwrap().storage_addr(), before);
    assert_eq!(args[2].as_buffer().unwrap().as_bytes(), &[7u8; 32]);

    // Bare-number outputs are discarded.
    assert_eq!(args[3], Value::int(0));
}

#[test]
fn wrong_element_width_is_rejected_before_allocating() {
    let mut arena = ScratchArena::default();
    let mut copy = copy_routine();

    let mut args = vec![
        Value::Null,
        Value::Buffer(vec![0u16; 16].into()),
        Value::Buffer(vec![0u8; 32].into()),
        Value::cell(0),
    ];

    let err = copy.call(&mut arena, &mut args).unwrap_err();

    match &err {
        MarshalError::TypeMismatch { index, name, .. } => {
            assert_eq!(*index, 1);
            assert_eq!(name, "input");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(err.to_string().contains("argument 2"), "{err}");
    assert_eq!(arena.allocations(), 0);
}

#[test]
fn signedness_does_not_matter_for_buffers() {
    let mut arena = ScratchArena::default();
    let mut copy = copy_routine();

    let mut args = vec![
        Value::Null,
        Value::Buffer(vec![-1i8; 32].into()),
        Value::Buffer(vec![0u8; 32].into()),
        Value::cell(0),
    ];

    copy.call(&mut arena, &mut args).unwrap();
    assert_eq!(args[2].as_buffer().unwrap().as_bytes(), &[0xffu8; 32]);
}

#[test]
fn missing_arguments_are_an_arity_error() {
    let mut arena = ScratchArena::default();
    let mut copy = copy_routine();

    let err = copy
        .call(&mut arena, &mut [Value::Null, Value::Buffer(vec![0u8; 32].into())])
        .unwrap_err();

    assert!(matches!(
        err,
        MarshalError::Arity {
            expected: 4,
            got: 2,
            ..
        }
    ));
    assert_eq!(arena.allocations(), 0);
}

#[test]
fn fixed_argument_shapes() {
    let mut arena = ScratchArena::default();
    let mut routine = wrapper(
        "shapes",
        &[("n", "i32"), ("p", "ip"), ("out", "o16"), ("ptr_out", "op")],
        "v",
        |_, _| Ok(NativeValue::Void),
    );

    let mut call = |args: Vec<Value>| {
        let mut args = args;
        routine.call(&mut arena, &mut args).map(|_| args)
    };

    // Null is only accepted where a pointer is expected.
    assert!(call(vec![Value::int(1), Value::Null, Value::int(0), Value::Null]).is_ok());
    assert!(call(vec![Value::Null, Value::Null, Value::int(0), Value::Null]).is_err());
    assert!(call(vec![Value::int(1), Value::Null, Value::Null, Value::Null]).is_err());
    assert!(call(vec![Value::int(1), Value::Null, Value::Cell(None), Value::Null]).is_err());

    let args = call(vec![
        Value::int(1),
        Value::int(4),
        Value::cell(-3),
        Value::Cell(None),
    ])
    .unwrap();

    assert_eq!(args[2], Value::cell(-3));
    assert_eq!(args[3], Value::cell(0));

    assert!(call(vec![Value::Str("x".into()), Value::Null, Value::int(0), Value::Null]).is_err());
}

#[test]
fn untouched_cells_keep_their_representation() {
    let mut arena = ScratchArena::default();
    let mut routine = wrapper(
        "noop",
        &[("a", "o32"), ("b", "od"), ("c", "of"), ("d", "o8")],
        "v",
        |_, _| Ok(NativeValue::Void),
    );

    let mut args = vec![
        Value::cell(123456),
        Value::cell(1.5f64),
        Value::cell(-0.25f32),
        Value::cell(-7i8),
    ];

    routine.call(&mut arena, &mut args).unwrap();

    assert_eq!(args[0], Value::Cell(Some(Number::Int(123456))));
    assert_eq!(args[1], Value::Cell(Some(Number::Float(1.5))));
    assert_eq!(args[2], Value::Cell(Some(Number::Float(-0.25))));
    assert_eq!(args[3], Value::Cell(Some(Number::Int(-7))));
}

#[test]
fn native_sees_marshaled_scalars() {
    let mut arena = ScratchArena::default();
    let mut routine = wrapper(
        "scalars",
        &[("a", "i8"), ("b", "id"), ("c", "ip"), ("label", "is"), ("out", "o64")],
        "64",
        |mem, args| {
            assert_eq!(args[0], NativeArg::Int(44));
            assert_eq!(args[1], NativeArg::Float(2.5));
            assert_eq!(args[2], NativeArg::Ptr(0));
            assert_eq!(args[3], NativeArg::Str("label"));

            let out = args[4].as_ptr().unwrap();
            let seeded = mem.read::<i64>(out)?;
            mem.write::<i64>(out, seeded * 2)?;

            Ok(NativeValue::Int(seeded))
        },
    );

    let mut args = vec![
        Value::int(300),
        Value::float(2.5),
        Value::Null,
        Value::Str("label".to_string()),
        Value::cell(21),
    ];

    let ret = routine.call(&mut arena, &mut args).unwrap();
    assert_eq!(ret, Value::int(21));
    assert_eq!(args[4], Value::cell(42));
}

#[test]
fn native_faults_still_release_the_region() {
    let mut arena = ScratchArena::default();
    let mut routine = wrapper(
        "fails",
        &[("out", "o[8]"), ("n", "o32")],
        "32",
        |mem, args| {
            mem.write::<u8>(args[0].as_ptr().unwrap(), 9)?;
            Err(NativeFault::new("secret key is invalid"))
        },
    );

    let mut args = vec![Value::Buffer(vec![1u8; 4].into()), Value::cell(5)];
    let err = routine.call(&mut arena, &mut args).unwrap_err();

    assert!(err.is_native());
    assert!(err.to_string().contains("secret key is invalid"), "{err}");

    // Nothing is copied back on failure.
    assert_eq!(args[0], Value::Buffer(vec![1u8; 4].into()));
    assert_eq!(args[1], Value::cell(5));

    assert_eq!(arena.allocations(), 1);
    assert_eq!(arena.releases(), 1);
}

#[test]
fn native_panics_are_captured() {
    let mut arena = ScratchArena::default();
    let mut routine = wrapper("panics", &[("buf", "i[32]")], "v", |_, _| {
        panic!("native blew up");
    });

    let err = routine
        .call(&mut arena, &mut [Value::Buffer(vec![0u32; 2].into())])
        .unwrap_err();

    assert!(err.is_native());
    assert!(err.to_string().contains("native blew up"), "{err}");
    assert_eq!(arena.allocations(), arena.releases());

    // The wrapper stays usable.
    assert!(
        routine
            .call(&mut arena, &mut [Value::Buffer(vec![0u32; 2].into())])
            .is_err()
    );
    assert_eq!(arena.allocations(), 2);
    assert_eq!(arena.releases(), 2);
}

#[test]
fn return_values_are_checked() {
    let mut arena = ScratchArena::default();

    let mut strict_void = wrapper("v", &[], "v", |_, _| Ok(NativeValue::Int(0)));
    let err = strict_void.call(&mut arena, &mut []).unwrap_err();
    assert!(matches!(err, MarshalError::ReturnTypeMismatch { .. }));

    let mut float = wrapper("f", &[], "d", |_, _| Ok(NativeValue::Int(1)));
    assert!(float.call(&mut arena, &mut []).is_err());

    let mut string = wrapper("s", &[], "s", |_, _| Ok(NativeValue::Str("ok".into())));
    assert_eq!(
        string.call(&mut arena, &mut []).unwrap(),
        Value::Str("ok".into())
    );

    let mut ptr = wrapper("p", &[], "p", |_, _| Ok(NativeValue::Ptr(0x40)));
    assert_eq!(ptr.call(&mut arena, &mut []).unwrap(), Value::int(0x40));

    assert_eq!(arena.allocations(), 4);
    assert_eq!(arena.releases(), 4);
}

#[test]
fn oversized_regions_fail_before_the_native_runs() {
    let mut arena = ScratchArena::new(ScratchConfig {
        max_region_bytes: 16,
    });

    let mut routine = wrapper("big", &[("buf", "i[8]")], "v", |_, _| {
        panic!("must not be called");
    });

    let err = routine
        .call(&mut arena, &mut [Value::Buffer(vec![0u8; 17].into())])
        .unwrap_err();

    assert!(matches!(err, MarshalError::Scratch { .. }));
    assert!(!err.is_native());
    assert_eq!(arena.allocations(), 0);
}

#[test]
fn randomized_calls_balance_the_arena() {
    let mut arena = ScratchArena::default();
    let mut rng = fastrand::Rng::with_seed(7);

    let mut routine = wrapper(
        "maybe",
        &[("mode", "i8"), ("buf", "o[16]"), ("n", "o64")],
        "32",
        |mem, args| match args[0].as_int() {
            Some(0) => Ok(NativeValue::Int(0)),
            Some(1) => Err(NativeFault::new("refused")),
            Some(2) => panic!("crashed"),
            _ => {
                mem.write::<u64>(args[2].as_ptr().unwrap(), 1)?;
                Ok(NativeValue::Str("wrong".into()))
            }
        },
    );

    for _ in 0..200 {
        let len = rng.usize(0..8);
        let mut args = vec![
            Value::int(rng.i64(0..4)),
            Value::Buffer(vec![0u16; len].into()),
            Value::cell(0),
        ];

        let _ = routine.call(&mut arena, &mut args);
        assert_eq!(arena.allocations(), arena.releases());
    }

    assert_eq!(arena.live_regions(), 0);
}
