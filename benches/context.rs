use cocontext::{Context, Yielder};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn ping_pong(y: &Yielder) -> i32 {
    loop {
        y.suspend();
    }
}

fn returns_slot(y: &Yielder) -> i32 {
    unsafe { y.param_ptr::<i32>().read() }
}

fn context_switch(c: &mut Criterion) {
    let mut ctx = Context::new(ping_pong).unwrap();

    // One iteration is a switch in and a switch back out.
    c.bench_function("context_switch", |b| b.iter(|| black_box(ctx.transfer())));
}

fn context_create(c: &mut Criterion) {
    c.bench_function("context_create_destroy", |b| {
        b.iter(|| {
            let ctx = Context::new(returns_slot).unwrap();
            ctx.destroy().unwrap();
        })
    });
}

fn context_run(c: &mut Criterion) {
    c.bench_function("context_create_run_destroy", |b| {
        b.iter(|| {
            let mut ctx = Context::new(returns_slot).unwrap();
            unsafe { ctx.param_ptr::<i32>().write(black_box(5)) };
            let ret = ctx.transfer();
            ctx.destroy().unwrap();
            ret
        })
    });
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = context_switch, context_create, context_run
);
criterion_main!(time);
