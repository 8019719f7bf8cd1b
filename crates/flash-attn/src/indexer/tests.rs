use super::*;
use candle_core::{Device, Tensor};

#[test]
fn tiles_cover_the_range_without_overlap() {
    let tiles: Vec<_> = TileIter::new(10, 4).collect();
    assert_eq!(tiles, vec![0..4, 4..8, 8..10]);
    assert_eq!(TileIter::new(0, 4).count(), 0);
    assert_eq!(TileIter::new(3, 8).collect::<Vec<_>>(), vec![0..3]);
}

#[test]
fn ragged_spans_follow_offsets() -> Result<()> {
    let layout = SeqLayout::ragged(vec![0, 4, 11, 13], vec![0, 5, 5, 9], 7, 5)?;
    assert_eq!(layout.batch(), 3);
    assert_eq!(layout.total_q(), 13);
    assert_eq!(layout.total_k(), 9);

    let spans = layout.spans();
    assert_eq!(
        spans[1],
        SequenceSpan {
            q_start: 4,
            q_len: 7,
            k_start: 5,
            k_len: 0,
        }
    );
    assert_eq!(spans[2].q_len, 2);
    assert_eq!(spans[2].k_len, 4);
    Ok(())
}

#[test]
fn padded_spans_honour_valid_lengths() -> Result<()> {
    let layout = SeqLayout::padded_with_lengths(2, 7, 7, Some(vec![4, 7]), Some(vec![3, 7]))?;
    let spans = layout.spans();
    assert_eq!(spans[0].q_len, 4);
    assert_eq!(spans[0].k_len, 3);
    assert_eq!(spans[1].q_start, 7);
    assert_eq!(spans[1].k_start, 7);
    Ok(())
}

#[test]
fn max_seqlen_is_an_upper_bound_not_a_truncation() {
    let err = SeqLayout::ragged(vec![0, 4, 11], vec![0, 4, 11], 6, 7).unwrap_err();
    assert!(matches!(err, AttentionError::CapacityViolation { .. }));
}

#[test]
fn malformed_offsets_are_rejected() {
    for bad in [vec![0], vec![1, 3], vec![0, 5, 3]] {
        let err = validate_cu_seqlens(&bad, 16, "cu").unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }), "{bad:?}");
    }
    let err = SeqLayout::ragged(vec![0, 2], vec![0, 2, 4], 4, 4).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
}

#[test]
fn valid_lengths_must_fit_padding() {
    let err = SeqLayout::padded_with_lengths(1, 4, 4, Some(vec![5]), None).unwrap_err();
    assert!(matches!(err, AttentionError::CapacityViolation { .. }));
    let err = SeqLayout::padded_with_lengths(2, 4, 4, None, Some(vec![1])).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
}

#[test]
fn index_tensors_of_several_dtypes() -> Result<()> {
    let device = Device::Cpu;
    let u32s = Tensor::new(&[0u32, 4, 11], &device)?;
    assert_eq!(index_vec(&u32s, "cu")?, vec![0, 4, 11]);

    let i64s = Tensor::new(&[[1i64, 2], [3, 4]], &device)?;
    assert_eq!(index_vec(&i64s, "table")?, vec![1, 2, 3, 4]);

    let negative = Tensor::new(&[-1i64], &device)?;
    assert!(matches!(
        index_vec(&negative, "table"),
        Err(AttentionError::ShapeMismatch { .. })
    ));

    let floats = Tensor::new(&[1.0f32], &device)?;
    assert!(matches!(
        index_vec(&floats, "cu"),
        Err(AttentionError::DtypeMismatch { .. })
    ));
    Ok(())
}
