use fusejit::{Buffer, DType, Layout};

#[test]
fn row_major_buffers_round_trip() -> anyhow::Result<()> {
    let buffer = Buffer::from_slice(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    assert_eq!(buffer.dtype(), DType::F32);
    assert_eq!(buffer.dims(), &[2, 3]);
    assert_eq!(buffer.strides(), &[12, 4]);
    assert!(buffer.is_row_major());
    assert!(!buffer.is_column_major());
    assert_eq!(buffer.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    Ok(())
}

#[test]
fn column_major_buffers_read_in_logical_order() -> anyhow::Result<()> {
    let values = [1i32, 2, 3, 4, 5, 6];
    let buffer = Buffer::from_slice_with_layout(&[2, 3], &values, Layout::ColumnMajor)?;
    assert_eq!(buffer.strides(), &[4, 8]);
    assert!(buffer.is_column_major());
    assert_eq!(buffer.to_vec::<i32>()?, values.to_vec());
    Ok(())
}

#[test]
fn scalars_and_vectors_carry_both_layout_flags_when_trivial() -> anyhow::Result<()> {
    let scalar = Buffer::scalar(2.5f64)?;
    assert_eq!(scalar.rank(), 0);
    assert_eq!(scalar.len(), 1);
    assert!(scalar.is_row_major() && scalar.is_column_major());
    assert_eq!(scalar.to_vec::<f64>()?, vec![2.5]);
    Ok(())
}

#[test]
fn mismatched_lengths_and_types_are_rejected() -> anyhow::Result<()> {
    assert!(Buffer::from_slice(&[4], &[1u8, 2, 3]).is_err());
    let buffer = Buffer::zeros(DType::I64, &[3])?;
    assert!(buffer.to_vec::<f32>().is_err());
    assert_eq!(buffer.to_vec::<i64>()?, vec![0, 0, 0]);
    Ok(())
}

#[test]
fn raw_ownership_round_trip_keeps_data() -> anyhow::Result<()> {
    let buffer = Buffer::from_slice(&[3], &[7u8, 8, 9])?;
    let data = buffer.data_ptr();
    let raw = buffer.into_raw();
    let header = unsafe { &*raw };
    assert_eq!(header.rank, 1);
    assert_eq!(header.dtype, DType::U8.tag());
    assert_eq!(unsafe { *header.dims }, 3);
    let buffer = unsafe { Buffer::from_raw(raw) };
    assert_eq!(buffer.data_ptr(), data);
    assert_eq!(buffer.to_vec::<u8>()?, vec![7, 8, 9]);
    Ok(())
}

#[test]
fn clones_are_deep() -> anyhow::Result<()> {
    let buffer = Buffer::from_slice(&[2], &[1.0f32, 2.0])?;
    let copy = buffer.clone();
    assert_ne!(copy.data_ptr(), buffer.data_ptr());
    assert_eq!(copy.to_vec::<f32>()?, buffer.to_vec::<f32>()?);
    Ok(())
}
