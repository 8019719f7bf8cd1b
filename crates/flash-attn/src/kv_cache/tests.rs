use super::*;
use crate::rotary::{RotaryLayout, RotaryTable};
use candle_core::{DType, Device, Tensor};
use static_assertions::assert_impl_all;

assert_impl_all!(KvCache: Send, Sync);
assert_impl_all!(CachePlan: Send, Sync);

fn direct_cache(slots: usize, slot_len: usize) -> KvCache {
    let layout = CacheLayout {
        slots,
        slot_len,
        heads: 2,
        head_dim: 3,
    };
    KvCache::zeros(layout, DType::F32, &Device::Cpu).unwrap()
}

/// `[batch, seqlen_new, 2, 3]` rows whose first lane encodes `(b, t, h)`.
fn tagged_tokens(batch: usize, seqlen_new: usize) -> Vec<f32> {
    let mut data = Vec::new();
    for b in 0..batch {
        for t in 0..seqlen_new {
            for h in 0..2 {
                data.extend_from_slice(&[(100 * b + 10 * t + h) as f32, 1.0, 2.0]);
            }
        }
    }
    data
}

#[test]
fn direct_append_writes_after_leftpad_and_existing_tokens() {
    let mut cache = direct_cache(2, 8);
    let plan = CachePlan::new(
        cache.layout(),
        vec![2, 0],
        2,
        None,
        Some(vec![1, 3]),
        None,
    )
    .unwrap();
    let tokens = tagged_tokens(2, 2);
    plan.append(&mut cache, &tokens, &tokens, None).unwrap();

    // batch 0 writes storage rows 3 and 4, batch 1 rows 3 and 4 as well.
    assert_eq!(cache.key_row(0, 3, 1)[0], 1.0);
    assert_eq!(cache.key_row(0, 4, 0)[0], 10.0);
    assert_eq!(cache.value_row(1, 3, 1)[0], 101.0);
    assert_eq!(cache.key_row(0, 2, 0), &[0.0, 0.0, 0.0]);

    let (keys, values) = plan.gather(&cache, 0, 4);
    assert_eq!(plan.total_len(0), 4);
    assert_eq!(keys.len(), 4 * 2 * 4);
    // Logical position 2 is the first new token; padded lane stays zero.
    assert_eq!(&keys[(2 * 2) * 4..(2 * 2) * 4 + 4], &[0.0, 1.0, 2.0, 0.0]);
    assert_eq!(values[(3 * 2 + 1) * 4], 11.0);
}

#[test]
fn paged_addressing_follows_block_table() {
    let layout = CacheLayout {
        slots: 4,
        slot_len: PAGE_ALIGNMENT,
        heads: 2,
        head_dim: 3,
    };
    let mut cache = KvCache::zeros(layout, DType::F32, &Device::Cpu).unwrap();
    let table = BlockTable::from_rows(vec![vec![2, 0], vec![3, 1]]).unwrap();
    let plan = CachePlan::new(&layout, vec![255, 10], 2, None, None, Some(table)).unwrap();
    let tokens = tagged_tokens(2, 2);
    plan.append(&mut cache, &tokens, &tokens, None).unwrap();

    // Sequence 0 positions 255 and 256 straddle pages 2 and 0.
    assert_eq!(cache.key_row(2, 255, 0)[0], 0.0);
    assert_eq!(cache.key_row(2, 255, 0)[1], 1.0);
    assert_eq!(cache.key_row(0, 0, 1)[0], 11.0);
    // Sequence 1 stays on page 3.
    assert_eq!(cache.key_row(3, 11, 0)[0], 110.0);
    assert!(plan.is_paged());
}

#[test]
fn page_size_must_be_aligned() {
    let layout = CacheLayout {
        slots: 4,
        slot_len: 128,
        heads: 1,
        head_dim: 4,
    };
    let table = BlockTable::from_rows(vec![vec![0]]).unwrap();
    let err = CachePlan::new(&layout, vec![0], 1, None, None, Some(table)).unwrap_err();
    assert!(matches!(err, AttentionError::AlignmentViolation { .. }));
}

#[test]
fn capacity_violations_are_reported() {
    let cache = direct_cache(2, 4);
    let overflow = CachePlan::new(cache.layout(), vec![3, 0], 2, None, None, None);
    assert!(matches!(
        overflow,
        Err(AttentionError::CapacityViolation { .. })
    ));

    let bad_slot = CachePlan::new(cache.layout(), vec![0], 1, Some(vec![2]), None, None);
    assert!(matches!(
        bad_slot,
        Err(AttentionError::CapacityViolation { .. })
    ));

    let layout = CacheLayout {
        slots: 2,
        slot_len: PAGE_ALIGNMENT,
        heads: 1,
        head_dim: 4,
    };
    let short = BlockTable::from_rows(vec![vec![0]]).unwrap();
    let err = CachePlan::new(&layout, vec![PAGE_ALIGNMENT], 1, None, None, Some(short));
    assert!(matches!(err, Err(AttentionError::CapacityViolation { .. })));

    let dangling = BlockTable::from_rows(vec![vec![5, 0]]).unwrap();
    let err = CachePlan::new(&layout, vec![0], 1, None, None, Some(dangling));
    assert!(matches!(err, Err(AttentionError::CapacityViolation { .. })));
}

#[test]
fn duplicate_batch_indices_leave_other_slots_untouched() {
    let mut cache = direct_cache(3, 4);
    let plan = CachePlan::new(cache.layout(), vec![0, 0], 1, Some(vec![1, 1]), None, None).unwrap();
    let tokens = tagged_tokens(2, 1);
    plan.append(&mut cache, &tokens, &tokens, None).unwrap();

    assert_eq!(cache.key_row(1, 0, 0)[0], 100.0);
    for slot in [0, 2] {
        for pos in 0..4 {
            assert_eq!(cache.key_row(slot, pos, 0), &[0.0, 0.0, 0.0]);
        }
    }
}

#[test]
fn new_keys_are_rotated_at_their_absolute_positions() {
    let layout = CacheLayout {
        slots: 1,
        slot_len: 8,
        heads: 1,
        head_dim: 4,
    };
    let mut cache = KvCache::zeros(layout, DType::F32, &Device::Cpu).unwrap();
    let table = RotaryTable::build(8, 4, 10_000.0).unwrap();
    let plan = CachePlan::new(&layout, vec![3], 2, None, None, None).unwrap();
    let k_new = vec![1.0, 0.5, -0.5, 2.0, 0.25, 1.0, 1.5, -1.0];
    let v_new = k_new.clone();
    plan.append(
        &mut cache,
        &k_new,
        &v_new,
        Some((&table, RotaryLayout::HalfSplit)),
    )
    .unwrap();

    for (t, chunk) in k_new.chunks(4).enumerate() {
        let mut expected = chunk.to_vec();
        table.rotate(&mut expected, 3 + t, RotaryLayout::HalfSplit);
        assert_eq!(cache.key_row(0, 3 + t, 0), expected.as_slice());
        // Values are never rotated.
        assert_eq!(cache.value_row(0, 3 + t, 0), chunk);
    }
}

#[test]
fn half_precision_writes_match_the_tensor_snapshot() -> anyhow::Result<()> {
    let layout = CacheLayout {
        slots: 1,
        slot_len: 8,
        heads: 1,
        head_dim: 4,
    };
    let table = RotaryTable::build(8, 4, 10_000.0)?;
    let k_new = vec![0.1, 0.7, -0.3, 1.3, 0.9, -1.1, 0.45, 0.2];
    let v_new = vec![0.33, -0.66, 1.01, 0.07, -0.2, 0.5, 0.123, 0.9];
    for dtype in [DType::F16, DType::BF16] {
        let mut cache = KvCache::zeros(layout, dtype, &Device::Cpu)?;
        let plan = CachePlan::new(&layout, vec![2], 2, None, None, None)?;
        plan.append(&mut cache, &k_new, &v_new, Some((&table, RotaryLayout::Interleaved)))?;

        let rebuilt = KvCache::from_tensors(&cache.keys()?, &cache.values()?)?;
        for pos in 0..8 {
            assert_eq!(cache.key_row(0, pos, 0), rebuilt.key_row(0, pos, 0));
            assert_eq!(cache.value_row(0, pos, 0), rebuilt.value_row(0, pos, 0));
        }
        // Unrounded inputs would not survive the trip.
        assert_ne!(cache.value_row(0, 2, 0), &v_new[..4]);
    }
    Ok(())
}

#[test]
fn cache_round_trips_through_tensors() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let keys = Tensor::rand(0.0f32, 1.0, (2, 4, 2, 3), &device)?;
    let values = Tensor::rand(0.0f32, 1.0, (2, 4, 2, 3), &device)?;
    let cache = KvCache::from_tensors(&keys.to_dtype(DType::F16)?, &values.to_dtype(DType::F16)?)?;
    assert_eq!(cache.dtype(), DType::F16);
    assert_eq!(cache.layout().dims(), (2, 4, 2, 3));
    let diff = cache
        .keys()?
        .to_dtype(DType::F32)?
        .sub(&keys)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(diff < 1e-3);

    let mismatched = Tensor::zeros((2, 4, 2, 4), DType::F32, &device)?;
    assert!(matches!(
        KvCache::from_tensors(&keys, &mismatched),
        Err(AttentionError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn cache_seqlens_resolve_to_one_entry_per_sequence() {
    assert_eq!(CacheSeqlens::from(3).resolve(2).unwrap(), vec![3, 3]);
    assert_eq!(
        CacheSeqlens::from(vec![1, 4]).resolve(2).unwrap(),
        vec![1, 4]
    );
    assert!(matches!(
        CacheSeqlens::from(vec![1]).resolve(2),
        Err(AttentionError::ShapeMismatch { .. })
    ));
}
