//! Reference scenarios for planning and merging at ViT-B/16 scale.

use candle_core::{Device, Tensor};
use tome_core::testing::random_model;
use tome_core::{
    apply_patch, bipartite_soft_matching, plan, MatchOptions, MergeContext, MergeFlags,
    MergeSchedule, MergeSetting, PatchOptions, SourceTrace, TomeError, VisionTransformerConfig,
};

/// ViT-B/16 token layout (196 patches + class token) at a width that keeps
/// the test fast.
fn narrow_vit_b16() -> VisionTransformerConfig {
    VisionTransformerConfig {
        hidden_size: 32,
        intermediate_size: 64,
        num_attention_heads: 2,
        ..VisionTransformerConfig::vit_base(16, 224)
    }
}

// ─── Scenario A ──────────────────────────────────────────────────────────────

#[test]
fn scenario_a_front_loaded_budget() {
    let schedule = plan(12, 980, 197, -0.5, 1).unwrap();
    assert_eq!(schedule.counts(), &[98, 49, 24, 12, 6, 3, 2, 1, 0, 0, 0, 0]);
    assert!(schedule.total() <= 980);
    assert!(schedule.counts().windows(2).all(|w| w[1] <= w[0]));

    let cfg = narrow_vit_b16();
    let options = PatchOptions {
        trace_source: true,
        ..Default::default()
    };
    let mut model = apply_patch(random_model(&cfg).unwrap(), options);
    model.set_merge(MergeSetting::target(980));

    let pixels = Tensor::randn(0f32, 1.0, (1, 3, 224, 224), &Device::Cpu).unwrap();
    let out = model.forward_traced(&pixels).unwrap();
    assert_eq!(out.trace.schedule, schedule);
    assert_eq!(out.hidden.dim(1).unwrap(), 197 - schedule.total());

    let trace = SourceTrace::from_tensor(out.trace.source.as_ref().unwrap()).unwrap();
    assert_eq!(trace.groups(0).unwrap()[0], vec![0]);
    assert!(trace.is_partition());
}

#[test]
fn scenario_a_budget_over_capacity_is_rejected() {
    assert!(matches!(
        plan(12, 1200, 197, -0.5, 1),
        Err(TomeError::BudgetExceedsCapacity {
            requested: 1200,
            capacity: 1176
        })
    ));
}

// ─── Scenario B ──────────────────────────────────────────────────────────────

#[test]
fn scenario_b_zero_budget_matches_unpatched() {
    let cfg = VisionTransformerConfig {
        num_hidden_layers: 2,
        ..narrow_vit_b16()
    };
    let plain = random_model(&cfg).unwrap();
    let pixels = Tensor::randn(0f32, 1.0, (1, 3, 224, 224), &Device::Cpu).unwrap();
    let expected = plain.forward(&pixels).unwrap();

    let mut model = apply_patch(plain, PatchOptions::default());
    model.set_merge(MergeSetting::target(0));
    assert_eq!(model.schedule().unwrap(), MergeSchedule::zeros(2));

    let got = model.forward(&pixels).unwrap();
    let diff: f32 = (got - expected)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-5, "diff {diff}");
}

// ─── Scenario C ──────────────────────────────────────────────────────────────

#[test]
fn scenario_c_oversized_request_is_clamped() {
    let options = MatchOptions {
        class_token: true,
        ..Default::default()
    };
    let two = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
    let plan = bipartite_soft_matching(&two, 5, &options).unwrap();
    assert_eq!(plan.r(), 0);
    assert_eq!(plan.output_len(), 2);

    // Drive blocks with an unclamped schedule so the runtime clamp is hit.
    let cfg = tome_core::testing::tiny_config();
    let model = apply_patch(random_model(&cfg).unwrap(), PatchOptions::default());
    let flags = MergeFlags {
        matching: cfg.match_options(),
        prop_attn: true,
        trace_source: true,
    };
    let mut ctx = MergeContext::new(MergeSchedule::new(vec![5; 4]), flags);
    let tokens = Tensor::randn(0f32, 1.0, (2, 3, cfg.hidden_size), &Device::Cpu).unwrap();
    let hidden = model.model().encode_tokens(&tokens, &mut ctx).unwrap();
    let trace = ctx.finish().unwrap();

    assert_eq!(trace.tokens_per_block, vec![3, 2, 2, 2]);
    assert_eq!(hidden.dims(), &[2, 2, cfg.hidden_size]);
}

// ─── Scenario D ──────────────────────────────────────────────────────────────

#[test]
fn scenario_d_source_sets_partition_the_input() {
    let cfg = tome_core::testing::tiny_config();
    let options = PatchOptions {
        trace_source: true,
        ..Default::default()
    };
    let mut model = apply_patch(random_model(&cfg).unwrap(), options);
    model.set_merge(MergeSetting::Decay { r: 3, inflect: 0.0 });

    let pixels = Tensor::randn(0f32, 1.0, (3, 3, 32, 32), &Device::Cpu).unwrap();
    let out = model.forward_traced(&pixels).unwrap();
    let trace = SourceTrace::from_tensor(out.trace.source.as_ref().unwrap()).unwrap();
    assert!(trace.is_partition());
    assert_eq!(trace.num_original(), cfg.seq_len());

    let size: Vec<Vec<f32>> = out
        .trace
        .size
        .as_ref()
        .unwrap()
        .squeeze(2)
        .unwrap()
        .to_vec2()
        .unwrap();
    for (b, row) in size.iter().enumerate() {
        let counts: Vec<f32> = trace.group_sizes(b).unwrap().iter().map(|&n| n as f32).collect();
        assert_eq!(&counts, row);
        assert!(trace.assignment(b).unwrap().iter().all(Option::is_some));
    }

    let grid = trace.patch_grid(0, cfg.protected_tokens()).unwrap();
    assert_eq!(grid.len(), 4);
    assert!(grid.iter().flatten().all(|&t| t >= 1 && t < trace.num_tokens()));
}
