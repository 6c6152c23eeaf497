//! Criterion benchmarks comparing the fused and dense-loop MoE dispatchers.
//!
//! Both run the same expert weights on CPU; the dense loop evaluates every
//! expert on every token, so its cost grows with `n_experts` regardless of
//! `top_k`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use deepseek_moe_core::distributed::DeviceContext;
use deepseek_moe_core::layers::ExpertFfn;
use deepseek_moe_core::moe::{dense_gate_weights, topk_softmax, MoEDispatcher, RouterGate};
use deepseek_moe_core::testing::{random_var_builder, tiny_config};
use deepseek_moe_core::DeepseekV2Config;

fn bench_config(num_experts: usize) -> DeepseekV2Config {
    let mut cfg = tiny_config();
    cfg.hidden_size = 128;
    cfg.moe_intermediate_size = 64;
    cfg.n_routed_experts = Some(num_experts);
    cfg.num_experts_per_tok = Some(2);
    cfg
}

fn build(cfg: &DeepseekV2Config, vb: &VarBuilder, fused: bool) -> MoEDispatcher {
    let ctx = DeviceContext::single_device();
    let n = cfg.n_routed_experts.unwrap_or(0);
    let gate = RouterGate::load(cfg.hidden_size, n, vb.pp("gate"), &ctx).expect("gate");
    let experts: Vec<ExpertFfn> = (0..n)
        .map(|i| {
            ExpertFfn::load(
                cfg.hidden_size,
                cfg.moe_intermediate_size,
                &cfg.hidden_act,
                false,
                None,
                vb.pp("experts").pp(i),
                &ctx,
            )
            .expect("expert")
        })
        .collect();
    if fused {
        MoEDispatcher::fused(gate, &experts, cfg.top_k(), false).expect("fused")
    } else {
        MoEDispatcher::dense_loop(gate, experts, cfg.top_k(), None).expect("dense loop")
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_dispatch");
    let ctx = DeviceContext::single_device();

    for &num_experts in &[4, 16] {
        let cfg = bench_config(num_experts);
        let vb = random_var_builder(&cfg, 0, &Device::Cpu).pp("model.layers.1.mlp");
        let fused = build(&cfg, &vb, true);
        let dense = build(&cfg, &vb, false);

        for &num_tokens in &[1, 64] {
            let x = Tensor::randn(0f32, 1.0, (num_tokens, cfg.hidden_size), &Device::Cpu)
                .expect("input");
            let label = format!("e{num_experts}_t{num_tokens}");
            group.bench_with_input(BenchmarkId::new("fused", &label), &x, |b, x| {
                b.iter(|| fused.forward(black_box(x), &ctx).expect("fused forward"));
            });
            group.bench_with_input(BenchmarkId::new("dense_loop", &label), &x, |b, x| {
                b.iter(|| dense.forward(black_box(x), &ctx).expect("dense forward"));
            });
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Gate weights
// ---------------------------------------------------------------------------

fn bench_gating(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_gating");
    for &num_tokens in &[16, 256] {
        let logits = Tensor::randn(0f32, 1.0, (num_tokens, 64), &Device::Cpu).expect("logits");
        group.bench_with_input(BenchmarkId::new("topk_softmax", num_tokens), &logits, |b, l| {
            b.iter(|| topk_softmax(black_box(l), 6, true).expect("topk"));
        });
        group.bench_with_input(
            BenchmarkId::new("dense_gate_weights", num_tokens),
            &logits,
            |b, l| {
                b.iter(|| dense_gate_weights(black_box(l), 6, Some(1.0)).expect("dense gate"));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_gating);
criterion_main!(benches);
