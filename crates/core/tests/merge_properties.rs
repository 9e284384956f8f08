//! End-to-end properties of a patched forward pass.
//!
//! All tests run on CPU with tiny randomly initialised models.

use candle_core::{DType, Device, Tensor};
use tome_core::testing::{
    max_abs_diff, random_model, random_model_with_dtype, tiny_config, tiny_distilled_config,
};
use tome_core::{
    apply_patch, derive_uniform_ratio, expand_ratio, MergeSetting, PatchOptions, SourceTrace,
    TomeVisionTransformer, VisionTransformerConfig,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn patched(cfg: &VisionTransformerConfig, merge: MergeSetting, trace: bool) -> TomeVisionTransformer {
    let options = PatchOptions {
        trace_source: trace,
        ..Default::default()
    };
    let mut model = apply_patch(random_model(cfg).unwrap(), options);
    model.set_merge(merge);
    model
}

fn pixels(cfg: &VisionTransformerConfig, batch: usize) -> Tensor {
    Tensor::randn(
        0f32,
        1.0,
        (batch, cfg.num_channels, cfg.image_size, cfg.image_size),
        &Device::Cpu,
    )
    .unwrap()
}

fn sizes(size: &Tensor) -> Vec<Vec<f32>> {
    size.squeeze(2).unwrap().to_vec2().unwrap()
}

// ─── Size conservation ───────────────────────────────────────────────────────

#[test]
fn size_sums_to_original_length() {
    let cfg = tiny_config();
    let model = patched(&cfg, MergeSetting::Decay { r: 3, inflect: -0.5 }, false);
    let out = model.forward_traced(&pixels(&cfg, 3)).unwrap();

    let size = out.trace.size.unwrap();
    for row in sizes(&size) {
        let total: f32 = row.iter().sum();
        assert_eq!(total, cfg.seq_len() as f32);
        assert!(row.iter().all(|&s| s >= 1.0));
    }
}

// ─── Schedule consumption ────────────────────────────────────────────────────

#[test]
fn every_block_consumes_one_entry_and_reruns_agree() {
    let cfg = tiny_config();
    let model = patched(&cfg, MergeSetting::target(20), false);
    let x = pixels(&cfg, 1);

    let first = model.forward_traced(&x).unwrap();
    let second = model.forward_traced(&x).unwrap();
    assert_eq!(first.trace.schedule.len(), cfg.num_hidden_layers);
    assert_eq!(first.trace.tokens_per_block.len(), cfg.num_hidden_layers);
    assert_eq!(first.trace.schedule, second.trace.schedule);
    assert_eq!(first.trace.tokens_per_block, second.trace.tokens_per_block);
    assert!(max_abs_diff(&first.hidden, &second.hidden).unwrap() < 1e-5);
}

#[test]
fn changing_the_config_between_calls_takes_effect() {
    let cfg = tiny_config();
    let mut model = patched(&cfg, MergeSetting::Constant { r: 1 }, false);
    let x = pixels(&cfg, 1);
    assert_eq!(model.forward(&x).unwrap().dim(1).unwrap(), 17 - 4);

    model.set_merge(MergeSetting::Constant { r: 3 });
    assert_eq!(model.forward(&x).unwrap().dim(1).unwrap(), 17 - 12);
}

// ─── Protected tokens ────────────────────────────────────────────────────────

#[test]
fn class_and_distillation_tokens_stay_put() {
    let cfg = tiny_distilled_config();
    let model = patched(&cfg, MergeSetting::Constant { r: 4 }, true);
    let out = model.forward_traced(&pixels(&cfg, 2)).unwrap();

    let trace = SourceTrace::from_tensor(out.trace.source.as_ref().unwrap()).unwrap();
    let size = sizes(out.trace.size.as_ref().unwrap());
    for b in 0..2 {
        assert_eq!(trace.groups(b).unwrap()[0], vec![0]);
        assert_eq!(trace.groups(b).unwrap()[1], vec![1]);
        assert_eq!(size[b][0], 1.0);
        assert_eq!(size[b][1], 1.0);
    }
}

// ─── Monotonicity ────────────────────────────────────────────────────────────

#[test]
fn sequence_only_shrinks_by_the_schedule() {
    let cfg = tiny_config();
    let model = patched(&cfg, MergeSetting::PerLayer { counts: vec![4, 0, 2, 1] }, false);
    let out = model.forward_traced(&pixels(&cfg, 1)).unwrap();

    let seen = &out.trace.tokens_per_block;
    assert_eq!(seen, &vec![17, 13, 13, 11]);
    assert!(seen.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(
        out.hidden.dim(1).unwrap(),
        out.trace.schedule.final_len(cfg.seq_len())
    );
}

// ─── Zero merge ──────────────────────────────────────────────────────────────

#[test]
fn zero_schedule_leaves_everything_unchanged() {
    let cfg = tiny_config();
    let plain = random_model(&cfg).unwrap();
    let x = pixels(&cfg, 2);
    let expected = plain.forward(&x).unwrap();

    let options = PatchOptions {
        trace_source: true,
        prop_attn: true,
    };
    let model = apply_patch(plain, options);
    let out = model.forward_traced(&x).unwrap();

    assert!(out.trace.schedule.counts().iter().all(|&r| r == 0));
    assert!(max_abs_diff(&out.hidden, &expected).unwrap() < 1e-5);
    assert!(sizes(out.trace.size.as_ref().unwrap())
        .iter()
        .flatten()
        .all(|&s| s == 1.0));
    let trace = SourceTrace::from_tensor(out.trace.source.as_ref().unwrap()).unwrap();
    for b in 0..2 {
        let expected: Vec<Vec<usize>> = (0..cfg.seq_len()).map(|i| vec![i]).collect();
        assert_eq!(trace.groups(b), Some(expected.as_slice()));
    }
}

#[test]
fn unpatch_restores_plain_output() {
    let cfg = tiny_config();
    let plain = random_model(&cfg).unwrap();
    let x = pixels(&cfg, 1);
    let expected = plain.forward(&x).unwrap();

    let mut model = apply_patch(plain, PatchOptions::default());
    model.set_merge(MergeSetting::Constant { r: 2 });
    assert_ne!(model.forward(&x).unwrap().dims(), expected.dims());

    let restored = model.unpatch();
    let got = restored.forward(&x).unwrap();
    assert!(max_abs_diff(&got, &expected).unwrap() < 1e-6);
}

// ─── Reduced precision ───────────────────────────────────────────────────────

#[test]
fn half_precision_batch_merges_cleanly() {
    let cfg = tiny_config();
    let options = PatchOptions {
        trace_source: true,
        ..Default::default()
    };
    let mut model = apply_patch(random_model_with_dtype(&cfg, DType::F16).unwrap(), options);
    model.set_merge(MergeSetting::Constant { r: 2 });

    let x = pixels(&cfg, 2).to_dtype(DType::F16).unwrap();
    let out = model.forward_traced(&x).unwrap();
    let final_len = cfg.seq_len() - 2 * cfg.num_hidden_layers;
    assert_eq!(out.hidden.dims(), &[2, final_len, cfg.hidden_size]);
    assert_eq!(out.hidden.dtype(), DType::F16);

    let hidden: Vec<f32> = out
        .hidden
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert!(hidden.iter().all(|v| v.is_finite()));

    for row in sizes(&out.trace.size.unwrap()) {
        let total: f32 = row.iter().sum();
        assert_eq!(total, cfg.seq_len() as f32);
    }
    let trace = SourceTrace::from_tensor(out.trace.source.as_ref().unwrap()).unwrap();
    assert_eq!(trace.batch_size(), 2);
    assert!(trace.is_partition());
}

// ─── Ratio round trip ────────────────────────────────────────────────────────

#[test]
fn derived_ratio_reproduces_the_budget() {
    for &(layers, seq_len, total, inflect) in &[
        (12, 197, 980, -0.5),
        (12, 197, 96, 0.0),
        (24, 577, 2000, -1.0),
        (6, 65, 77, 0.75),
    ] {
        let ratio = derive_uniform_ratio(layers, total, seq_len, inflect).unwrap();
        let sum: usize = expand_ratio(layers, ratio, seq_len, inflect)
            .unwrap()
            .iter()
            .sum();
        assert!(sum <= total, "{layers}/{seq_len}/{total}: {sum}");
        assert!(total - sum <= layers, "{layers}/{seq_len}/{total}: {sum}");
    }
}

// ─── Embedded tokens ─────────────────────────────────────────────────────────

#[test]
fn embedded_tokens_run_through_the_stack() {
    let cfg = tiny_config();
    let model = patched(&cfg, MergeSetting::Constant { r: 2 }, false);
    let tokens = Tensor::randn(0f32, 1.0, (1, cfg.seq_len(), cfg.hidden_size), &Device::Cpu)
        .unwrap();
    let out = model.forward_tokens(&tokens).unwrap();
    assert_eq!(out.hidden.dims(), &[1, 9, cfg.hidden_size]);
    assert_eq!(out.hidden.dtype(), DType::F32);
    assert_eq!(out.trace.size.unwrap().dtype(), DType::F32);
}
