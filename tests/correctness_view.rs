use approx::assert_relative_eq;
use num_complex::{Complex32, Complex64};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use strided_host::{
    CastingSafety, Element, ErrorKind, HostObject, HostRuntime, HostView, HostViewMut, MemoryHost,
    MemoryOrder, Scalar,
};

fn all_indices<const N: usize>(dims: [usize; N]) -> Vec<[usize; N]> {
    let mut out = Vec::new();
    if dims.contains(&0) {
        return out;
    }
    let mut idx = [0usize; N];
    'outer: loop {
        out.push(idx);
        for k in (0..N).rev() {
            idx[k] += 1;
            if idx[k] < dims[k] {
                continue 'outer;
            }
            idx[k] = 0;
        }
        break;
    }
    out
}

/// Byte strides for `dims` with a random axis order, padding and signs.
fn random_byte_strides(rng: &mut StdRng, dims: &[usize], item: usize) -> Vec<isize> {
    let mut order: Vec<usize> = (0..dims.len()).collect();
    order.shuffle(rng);
    let mut strides = vec![0isize; dims.len()];
    let mut acc = item as isize;
    for &axis in &order {
        let sign = if rng.gen_bool(0.3) { -1 } else { 1 };
        strides[axis] = sign * acc;
        acc *= (dims[axis] + rng.gen_range(0..2)) as isize;
    }
    strides
}

fn check_zero_copy<T: Element + PartialEq, const N: usize>(dims: [usize; N]) {
    let host = MemoryHost::new();
    let id = host
        .array(T::ELEMENT_TYPE, &dims)
        .build_with(|idx| Scalar::Int(idx.iter().fold(0, |acc, &i| acc * 7 + i as i128 + 1)));
    let object = HostObject::Array(id);
    {
        let view = HostView::<_, T, N>::new(&host, &object, CastingSafety::No).unwrap();
        assert!(!view.is_copy(), "{} rank {N}", T::ELEMENT_TYPE);
        assert_eq!(host.ref_count(id), 2);
        assert_eq!(view.as_ptr() as *mut u8, host.data_ptr(id));
        assert_eq!(view.shape(), &dims);
        for idx in all_indices(dims) {
            assert_eq!(view.get(idx), host.get_as::<T>(id, &idx));
        }
    }
    assert_eq!(host.ref_count(id), 1);
    assert_eq!(host.copy_count(), 0);
}

fn check_zero_copy_all_ranks<T: Element + PartialEq>() {
    check_zero_copy::<T, 1>([5]);
    check_zero_copy::<T, 2>([3, 4]);
    check_zero_copy::<T, 3>([2, 3, 2]);
}

#[test]
fn test_zero_copy_for_every_element_type() {
    check_zero_copy_all_ranks::<i8>();
    check_zero_copy_all_ranks::<u8>();
    check_zero_copy_all_ranks::<i16>();
    check_zero_copy_all_ranks::<u16>();
    check_zero_copy_all_ranks::<i32>();
    check_zero_copy_all_ranks::<u32>();
    check_zero_copy_all_ranks::<i64>();
    check_zero_copy_all_ranks::<u64>();
    check_zero_copy_all_ranks::<isize>();
    check_zero_copy_all_ranks::<usize>();
    check_zero_copy_all_ranks::<f32>();
    check_zero_copy_all_ranks::<f64>();
    check_zero_copy_all_ranks::<Complex32>();
    check_zero_copy_all_ranks::<Complex64>();
}

#[test]
fn test_row_major_axes_match_host_addressing() {
    let host = MemoryHost::new();
    let (rows, cols) = (4, 7);
    let id = host.from_fn::<f64>(&[rows, cols], MemoryOrder::RowMajor, |idx| {
        (idx[0] * 100 + idx[1]) as f64
    });
    let object = HostObject::Array(id);
    let view = HostView::<_, f64, 2>::new(&host, &object, CastingSafety::No).unwrap();
    assert_eq!(view.nrows(), rows);
    assert_eq!(view.ncols(), cols);
    assert_eq!(view.strides(), &[cols as isize, 1]);

    let base = host.data_ptr(id);
    for i in 0..rows {
        for j in 0..cols {
            let expected = unsafe { base.add((i * cols + j) * 8) } as *const f64;
            assert_eq!(unsafe { view.ptr_at([i, j]) }, expected);
            assert_eq!(view.get([i, j]), (i * 100 + j) as f64);
        }
    }
}

#[test]
fn test_random_strided_layouts_borrow() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let dims = [rng.gen_range(1..5), rng.gen_range(1..5), rng.gen_range(1..5)];
        let strides = random_byte_strides(&mut rng, &dims, 8);
        let host = MemoryHost::new();
        let id = host
            .array(f64::ELEMENT_TYPE, &dims)
            .byte_strides(&strides)
            .build_with(|idx| Scalar::Float((idx[0] * 16 + idx[1] * 4 + idx[2]) as f64));
        let object = HostObject::Array(id);
        let view = HostView::<_, f64, 3>::new(&host, &object, CastingSafety::Equiv).unwrap();
        assert!(!view.is_copy(), "dims {dims:?} strides {strides:?}");
        for k in 0..3 {
            assert_eq!(view.stride(k) * 8, strides[k]);
        }
        let base = host.data_ptr(id);
        for idx in all_indices(dims) {
            let offset: isize = idx.iter().zip(&strides).map(|(&i, &s)| i as isize * s).sum();
            let expected = unsafe { base.offset(offset) } as *const f64;
            assert_eq!(unsafe { view.ptr_at(idx) }, expected);
            assert_eq!(view.get(idx), (idx[0] * 16 + idx[1] * 4 + idx[2]) as f64);
        }
    }
}

#[test]
fn test_random_strided_layouts_copy_with_widening() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..30 {
        let dims = [rng.gen_range(1..6), rng.gen_range(1..6)];
        let strides = random_byte_strides(&mut rng, &dims, 4);
        let host = MemoryHost::new();
        let values: Vec<f32> = (0..dims[0] * dims[1]).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let id = host
            .array(f32::ELEMENT_TYPE, &dims)
            .byte_strides(&strides)
            .build_with(|idx| Scalar::Float(values[idx[0] * dims[1] + idx[1]] as f64));
        let object = HostObject::Array(id);
        let view = HostView::<_, f64, 2>::new(&host, &object, CastingSafety::Safe).unwrap();
        assert!(view.is_copy());
        for [i, j] in all_indices(dims) {
            assert_relative_eq!(view.get([i, j]), values[i * dims[1] + j] as f64, epsilon = 1e-7);
        }
        drop(view);
        assert_eq!(host.live_arrays(), 1);
    }
}

#[test]
fn test_padded_writable_view_writes_in_place() {
    let host = MemoryHost::new();
    let id = host
        .array(f64::ELEMENT_TYPE, &[3, 2])
        .byte_strides(&[32, 8])
        .build();
    let object = HostObject::Array(id);
    {
        let mut view = HostViewMut::<_, f64, 2>::new(&host, &object, CastingSafety::No).unwrap();
        assert!(!view.is_copy());
        for i in 0..3 {
            for j in 0..2 {
                view.set([i, j], (i * 2 + j) as f64);
            }
        }
    }
    assert_eq!(host.get(id, &[2, 1]), Scalar::Float(5.0));
    assert_eq!(host.copy_count(), 0);
}

#[test]
fn test_writable_copy_round_trips_through_narrower_source() {
    let host = MemoryHost::new();
    let id = host.from_fn::<i32>(&[4], MemoryOrder::RowMajor, |idx| idx[0] as i32);
    let object = HostObject::Array(id);

    let err = HostViewMut::<_, i64, 1>::new(&host, &object, CastingSafety::Safe).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    {
        let mut view = HostViewMut::<_, i64, 1>::new(&host, &object, CastingSafety::SameKind).unwrap();
        assert!(view.is_copy());
        for i in 0..4 {
            view.set([i], view.get([i]) * 10);
        }
        // The original stays untouched until the view is released.
        assert_eq!(host.get(id, &[3]), Scalar::Int(3));
    }
    assert_eq!(host.get(id, &[3]), Scalar::Int(30));
    assert_eq!(host.ref_count(id), 1);
    assert_eq!(host.live_arrays(), 1);
}

#[test]
fn test_empty_array_binds() {
    let host = MemoryHost::new();
    let id = host.from_fn::<u16>(&[0, 3], MemoryOrder::RowMajor, |_| 0);
    let object = HostObject::Array(id);
    let view = HostView::<_, u16, 2>::new(&host, &object, CastingSafety::No).unwrap();
    assert!(view.is_empty());
    assert_eq!(view.len(), 0);
    assert_eq!(view.ndim(), 2);
}
