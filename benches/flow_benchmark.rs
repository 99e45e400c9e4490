use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relayflow::{Flow, SeedArgs};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// One root fanning out to `width` nodes that each write one output
fn create_fan_out(width: usize) -> Flow {
    let mut flow = Flow::new("fan-out");
    flow.node("root", &[], |ctx| async move {
        ctx.output("seed", &1u64)?;
        Ok(())
    })
    .unwrap();

    for i in 0..width {
        let key = format!("leaf{}", i);
        let output = key.clone();
        flow.node(key, &["root"], move |ctx| {
            let output = output.clone();
            async move {
                let seed: u64 = ctx.input("seed")?;
                ctx.output(output, &(seed + 1))?;
                Ok(())
            }
        })
        .unwrap();
    }
    flow
}

/// A linear chain: every round runs exactly one node
fn create_linear_chain(count: usize) -> Flow {
    let mut flow = Flow::new("chain");
    for i in 0..count {
        let key = format!("node{}", i);
        let deps = if i == 0 {
            vec![]
        } else {
            vec![format!("node{}", i - 1)]
        };
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        flow.node(key, &deps, |_| async { Ok(()) }).unwrap();
    }
    flow
}

fn bench_fan_out_round(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out_round");

    for width in [10, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                rt.block_on(async {
                    let cancel = CancellationToken::new();
                    let mut flow = create_fan_out(width);
                    flow.seed(SeedArgs::new(), &cancel).await.unwrap();
                    black_box(flow.advance(&cancel).await.unwrap());
                })
            });
        });
    }

    group.finish();
}

fn bench_linear_chain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("linear_chain");

    for count in [10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let cancel = CancellationToken::new();
                    let mut flow = create_linear_chain(count);
                    flow.seed(SeedArgs::new(), &cancel).await.unwrap();
                    while !flow.is_done().unwrap() {
                        flow.advance(&cancel).await.unwrap();
                    }
                    black_box(flow.status().unwrap());
                })
            });
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("codec");

    for width in [10, 100, 500] {
        let mut flow = create_fan_out(width);
        rt.block_on(async {
            let cancel = CancellationToken::new();
            flow.seed(SeedArgs::new(), &cancel).await.unwrap();
            flow.advance(&cancel).await.unwrap();
        });
        let payload = flow.encode().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", width), &flow, |b, flow| {
            b.iter(|| black_box(flow.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", width), &payload, |b, payload| {
            b.iter(|| {
                let mut restored = create_fan_out(width);
                restored.decode(black_box(payload)).unwrap();
                black_box(restored)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out_round, bench_linear_chain, bench_codec);
criterion_main!(benches);
