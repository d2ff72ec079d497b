use super::{CacheLayout, KeyValueCache, StaticKvCache};
use crate::core::AttentionError;
use candle_core::{DType, Device, Tensor};
use static_assertions::{assert_impl_all, assert_not_impl_any};

fn allclose(a: &Tensor, b: &Tensor, tol: f32) {
    let diff = a
        .to_dtype(DType::F32)
        .unwrap()
        .sub(&b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let max = diff.into_iter().fold(0.0_f32, |acc, v| acc.max(v));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

fn layout() -> CacheLayout {
    CacheLayout {
        batch: 2,
        num_kv_heads: 3,
        max_seq_len: 8,
        head_dim: 4,
    }
}

fn build_cache(device: &Device) -> StaticKvCache {
    StaticKvCache::new(layout(), DType::F32, device).unwrap()
}

fn random_chunk(device: &Device, seq_len: usize) -> (Tensor, Tensor) {
    let shape = (2, 3, seq_len, 4);
    let keys = Tensor::rand(0.0f32, 1.0, shape, device).unwrap();
    let values = Tensor::rand(0.0f32, 1.0, shape, device).unwrap();
    (keys, values)
}

#[test]
fn prefill_then_decode_transition() {
    let device = Device::Cpu;
    let mut cache = build_cache(&device);

    let (prefill_keys, prefill_values) = random_chunk(&device, 5);
    cache
        .write(&prefill_keys, &prefill_values, &[0, 1, 2, 3, 4])
        .expect("prefill succeeds");
    assert_eq!(cache.cursor(), Some(4));

    let (keys, values) = cache.view().unwrap();
    allclose(&keys, &prefill_keys, 0.0);
    allclose(&values, &prefill_values, 0.0);

    let mut expected_keys = prefill_keys;
    let mut expected_values = prefill_values;
    for step in 5..8 {
        let (step_keys, step_values) = random_chunk(&device, 1);
        cache.write(&step_keys, &step_values, &[step]).unwrap();
        expected_keys = Tensor::cat(&[&expected_keys, &step_keys], 2).unwrap();
        expected_values = Tensor::cat(&[&expected_values, &step_values], 2).unwrap();
    }

    let (keys, values) = cache.view().unwrap();
    assert_eq!(keys.dims(), &[2, 3, 8, 4]);
    allclose(&keys, &expected_keys, 0.0);
    allclose(&values, &expected_values, 0.0);

    let stats = cache.stats();
    assert_eq!(stats.tokens_written, 8);
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.misses, 0);
}

#[test]
fn overwrite_keeps_cursor_at_highest_position() {
    let device = Device::Cpu;
    let mut cache = build_cache(&device);
    let (keys, values) = random_chunk(&device, 4);
    cache.write(&keys, &values, &[0, 1, 2, 3]).unwrap();

    let (new_keys, new_values) = random_chunk(&device, 2);
    cache.write(&new_keys, &new_values, &[1, 2]).unwrap();
    assert_eq!(cache.cursor(), Some(3));
    assert_eq!(cache.valid_len(), 4);

    let (cached_keys, cached_values) = cache.view().unwrap();
    allclose(&cached_keys.narrow(2, 1, 2).unwrap(), &new_keys, 0.0);
    allclose(&cached_values.narrow(2, 1, 2).unwrap(), &new_values, 0.0);
    allclose(
        &cached_keys.narrow(2, 3, 1).unwrap(),
        &keys.narrow(2, 3, 1).unwrap(),
        0.0,
    );
}

#[test]
fn sparse_writes_leave_zero_gaps() {
    let device = Device::Cpu;
    let mut cache = build_cache(&device);
    let (keys, values) = random_chunk(&device, 2);
    cache.write(&keys, &values, &[2, 5]).unwrap();
    assert_eq!(cache.valid_len(), 6);

    let (cached_keys, _) = cache.view().unwrap();
    let gap = cached_keys
        .narrow(2, 3, 2)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();
    assert_eq!(gap, 0.0);
    allclose(
        &cached_keys.narrow(2, 5, 1).unwrap(),
        &keys.narrow(2, 1, 1).unwrap(),
        0.0,
    );
}

#[test]
fn reset_zeroes_buffers_and_cursor() {
    let device = Device::Cpu;
    let mut cache = build_cache(&device);
    let (keys, values) = random_chunk(&device, 3);
    cache.write(&keys, &values, &[0, 1, 2]).unwrap();

    cache.reset().unwrap();
    assert_eq!(cache.cursor(), None);
    assert_eq!(cache.valid_len(), 0);
    assert!(matches!(cache.view(), Err(AttentionError::State { .. })));
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().resets, 1);

    let (one_key, one_value) = random_chunk(&device, 1);
    cache.write(&one_key, &one_value, &[2]).unwrap();
    let (cached_keys, _) = cache.view().unwrap();
    let stale = cached_keys
        .narrow(2, 0, 2)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();
    assert_eq!(stale, 0.0);
}

#[test]
fn invalid_writes_are_rejected() {
    let device = Device::Cpu;
    let mut cache = build_cache(&device);
    let (keys, values) = random_chunk(&device, 2);

    assert!(matches!(
        cache.write(&keys, &values, &[7, 8]),
        Err(AttentionError::State { .. })
    ));
    assert!(matches!(
        cache.write(&keys, &values, &[0]),
        Err(AttentionError::Shape { .. })
    ));

    let wrong_heads = Tensor::zeros((2, 2, 2, 4), DType::F32, &device).unwrap();
    assert!(matches!(
        cache.write(&wrong_heads, &wrong_heads, &[0, 1]),
        Err(AttentionError::Shape { .. })
    ));

    let half = keys.to_dtype(DType::F16).unwrap();
    assert!(matches!(
        cache.write(&half, &half, &[0, 1]),
        Err(AttentionError::UnsupportedDType { .. })
    ));
    assert_eq!(cache.cursor(), None);
}

#[test]
fn zero_sized_layout_is_a_config_error() {
    let mut bad = layout();
    bad.max_seq_len = 0;
    assert!(matches!(
        StaticKvCache::new(bad, DType::F32, &Device::Cpu),
        Err(AttentionError::Config { .. })
    ));
}

#[test]
fn concurrency_traits_documented() {
    assert_impl_all!(StaticKvCache: Send);
    assert_not_impl_any!(StaticKvCache: Sync);
}
