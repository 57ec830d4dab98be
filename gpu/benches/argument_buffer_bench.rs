//! Benchmarks for argument serialisation and host dispatch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lattice_gpu::host::register_kernel;
use lattice_gpu::{
    Arg, ArgumentLayout, BackendPreference, BufferFlags, Context, ContextOptions, HostArgs,
    ProgramBinary, QueueKind, ScalarType, Signature, SlotKind, WorkItem,
};

fn saxpy(item: &WorkItem, args: &HostArgs<'_>) {
    let (Some(a), Some(x), Some(y)) = (args.scalar::<f32>(0), args.buffer(1), args.buffer(2))
    else {
        return;
    };
    let i = item.global_linear() as usize;
    y.store(i, a * x.load::<f32>(i) + y.load::<f32>(i));
}

fn mixed_signature(slots: usize) -> Signature {
    let kinds: Vec<SlotKind> = (0..slots)
        .map(|i| match i % 4 {
            0 => SlotKind::scalar(ScalarType::U8),
            1 => SlotKind::Buffer,
            2 => SlotKind::scalars(ScalarType::F32, 3),
            _ => SlotKind::Sampler,
        })
        .collect();
    Signature::from_kinds(&kinds)
}

fn bench_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("argument_layout");
    for slots in [4, 16, 64] {
        let signature = mixed_signature(slots);
        group.bench_with_input(BenchmarkId::from_parameter(slots), &signature, |b, sig| {
            b.iter(|| black_box(ArgumentLayout::for_signature(black_box(sig))))
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    lattice_gpu::logging::init_test();
    register_kernel(
        "bench_saxpy",
        &[
            SlotKind::scalar(ScalarType::F32),
            SlotKind::Buffer,
            SlotKind::Buffer,
        ],
        saxpy,
    )
    .expect("kernel registration");

    let context = Context::create(BackendPreference::named("host"), &ContextOptions::default())
        .expect("host context");
    let device = context.default_device();
    let queue = context
        .create_queue(device, QueueKind::Compute)
        .expect("queue");
    let function = context
        .create_function(
            device,
            &ProgramBinary::host_module(&["bench_saxpy"]),
            "bench_saxpy",
            &Signature::from_kinds(&[
                SlotKind::scalar(ScalarType::F32),
                SlotKind::Buffer,
                SlotKind::Buffer,
            ]),
        )
        .expect("function");

    let mut group = c.benchmark_group("host_saxpy");
    for n in [1u32 << 10, 1 << 16] {
        let x = context
            .create_buffer(device, n as u64 * 4, BufferFlags::READ, None)
            .expect("x");
        let y = context
            .create_buffer(device, n as u64 * 4, BufferFlags::READ_WRITE, None)
            .expect("y");
        let arguments = context
            .create_argument_buffer(&function, None)
            .expect("arguments");
        arguments
            .set_arguments(&queue, &[Arg::from(2.0f32), Arg::from(&x), Arg::from(&y)])
            .expect("set_arguments");

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                queue
                    .enqueue_function(&function, &arguments, n, 64, &[], &[])
                    .expect("enqueue");
                queue.finish().expect("finish");
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_layout, bench_dispatch);
criterion_main!(benches);
