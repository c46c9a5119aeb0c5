//! Reference kernels
//!
//! Every kernel works on dequantized `f32` values in row-major (NHWC) order.
//! The interpreter dequantizes inputs and requantizes outputs around them.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct KernelError(pub String);

pub type KernelResult<T> = Result<T, KernelError>;

fn fail<T>(message: impl Into<String>) -> KernelResult<T> {
    Err(KernelError(message.into()))
}

/// Fused activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    ReluN1To1,
    Relu6,
}

impl Activation {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Activation::Identity),
            1 => Some(Activation::Relu),
            2 => Some(Activation::ReluN1To1),
            3 => Some(Activation::Relu6),
            _ => None,
        }
    }
}

pub fn apply_activation(values: &mut [f32], activation: Activation) {
    let (low, high) = match activation {
        Activation::Identity => return,
        Activation::Relu => (0.0, f32::INFINITY),
        Activation::ReluN1To1 => (-1.0, 1.0),
        Activation::Relu6 => (0.0, 6.0),
    };
    for value in values {
        *value = value.clamp(low, high);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Padding::Same),
            1 => Some(Padding::Valid),
            _ => None,
        }
    }
}

/// Spatial parameters shared by convolutions and pooling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowParams {
    pub padding: Padding,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Average,
    Max,
}

pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Odometer increment over `shape`
fn advance(index: &mut [usize], shape: &[usize]) {
    for axis in (0..shape.len()).rev() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return;
        }
        index[axis] = 0;
    }
}

fn dims4(shape: &[usize], what: &str) -> KernelResult<[usize; 4]> {
    match shape {
        &[a, b, c, d] => Ok([a, b, c, d]),
        _ => fail(format!("{what} must be 4-D, got {shape:?}")),
    }
}

fn check_len(data: &[f32], shape: &[usize], what: &str) -> KernelResult<()> {
    if data.len() != num_elements(shape) {
        return fail(format!(
            "{what} holds {} values, shape {shape:?} needs {}",
            data.len(),
            num_elements(shape)
        ));
    }
    Ok(())
}

/// Resolve a possibly negative axis against `rank`
pub fn normalize_axis(axis: i32, rank: usize) -> KernelResult<usize> {
    let resolved = if axis < 0 {
        axis as i64 + rank as i64
    } else {
        axis as i64
    };
    if resolved < 0 || resolved >= rank as i64 {
        return fail(format!("axis {axis} out of range for rank {rank}"));
    }
    Ok(resolved as usize)
}

/// Leading padding along one spatial dimension
pub fn padding_offset(
    padding: Padding,
    in_size: usize,
    filter_size: usize,
    stride: usize,
    dilation: usize,
    out_size: usize,
) -> usize {
    match padding {
        Padding::Valid => 0,
        Padding::Same => {
            let effective = filter_size.saturating_sub(1) * dilation + 1;
            let needed = (out_size.saturating_sub(1) * stride + effective).saturating_sub(in_size);
            needed / 2
        }
    }
}

fn broadcast_strides(shape: &[usize], out_shape: &[usize]) -> KernelResult<Vec<usize>> {
    if shape.len() > out_shape.len() {
        return fail(format!("cannot broadcast {shape:?} to {out_shape:?}"));
    }
    let lead = out_shape.len() - shape.len();
    let natural = row_major_strides(shape);
    let mut strides = vec![0; out_shape.len()];
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == out_shape[lead + axis] {
            strides[lead + axis] = natural[axis];
        } else if dim != 1 {
            return fail(format!("cannot broadcast {shape:?} to {out_shape:?}"));
        }
    }
    Ok(strides)
}

/// Element-wise binary op with numpy-style broadcasting
pub fn broadcast_binary(
    a: &[f32],
    a_shape: &[usize],
    b: &[f32],
    b_shape: &[usize],
    out_shape: &[usize],
    op: impl Fn(f32, f32) -> f32,
) -> KernelResult<Vec<f32>> {
    check_len(a, a_shape, "lhs")?;
    check_len(b, b_shape, "rhs")?;
    let a_strides = broadcast_strides(a_shape, out_shape)?;
    let b_strides = broadcast_strides(b_shape, out_shape)?;

    let total = num_elements(out_shape);
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0; out_shape.len()];
    for _ in 0..total {
        let ai: usize = index.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let bi: usize = index.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        out.push(op(a[ai], b[bi]));
        advance(&mut index, out_shape);
    }
    Ok(out)
}

/// Input coordinate for an output position, or `None` when it falls in padding
fn source_coord(out: usize, tap: usize, stride: usize, dilation: usize, pad: usize, size: usize) -> Option<usize> {
    let coord = (out * stride + tap * dilation).checked_sub(pad)?;
    (coord < size).then_some(coord)
}

/// 2-D convolution; filter is `[out_c, kh, kw, in_c]`
pub fn conv2d(
    input: &[f32],
    in_shape: &[usize],
    filter: &[f32],
    filter_shape: &[usize],
    bias: Option<&[f32]>,
    out_shape: &[usize],
    params: &WindowParams,
) -> KernelResult<Vec<f32>> {
    let [batches, in_h, in_w, in_c] = dims4(in_shape, "input")?;
    let [out_c, k_h, k_w, f_c] = dims4(filter_shape, "filter")?;
    let [o_n, out_h, out_w, o_c] = dims4(out_shape, "output")?;
    check_len(input, in_shape, "input")?;
    check_len(filter, filter_shape, "filter")?;
    if f_c != in_c || o_c != out_c || o_n != batches {
        return fail(format!(
            "incompatible shapes: input {in_shape:?}, filter {filter_shape:?}, output {out_shape:?}"
        ));
    }
    if bias.is_some_and(|b| b.len() != out_c) {
        return fail("bias length must equal output channels");
    }

    let pad_h = padding_offset(params.padding, in_h, k_h, params.stride_h, params.dilation_h, out_h);
    let pad_w = padding_offset(params.padding, in_w, k_w, params.stride_w, params.dilation_w, out_w);

    let mut out = vec![0.0; num_elements(out_shape)];
    for n in 0..batches {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for oc in 0..out_c {
                    let mut acc = bias.map_or(0.0, |b| b[oc]);
                    for ky in 0..k_h {
                        let Some(iy) = source_coord(oy, ky, params.stride_h, params.dilation_h, pad_h, in_h) else {
                            continue;
                        };
                        for kx in 0..k_w {
                            let Some(ix) = source_coord(ox, kx, params.stride_w, params.dilation_w, pad_w, in_w) else {
                                continue;
                            };
                            let in_base = ((n * in_h + iy) * in_w + ix) * in_c;
                            let f_base = ((oc * k_h + ky) * k_w + kx) * in_c;
                            for c in 0..in_c {
                                acc += input[in_base + c] * filter[f_base + c];
                            }
                        }
                    }
                    out[((n * out_h + oy) * out_w + ox) * out_c + oc] = acc;
                }
            }
        }
    }

    apply_activation(&mut out, params.activation);
    Ok(out)
}

/// Depthwise convolution; filter is `[1, kh, kw, in_c * depth_multiplier]`
#[allow(clippy::too_many_arguments)]
pub fn depthwise_conv2d(
    input: &[f32],
    in_shape: &[usize],
    filter: &[f32],
    filter_shape: &[usize],
    bias: Option<&[f32]>,
    out_shape: &[usize],
    depth_multiplier: usize,
    params: &WindowParams,
) -> KernelResult<Vec<f32>> {
    let [batches, in_h, in_w, in_c] = dims4(in_shape, "input")?;
    let [_, k_h, k_w, f_c] = dims4(filter_shape, "filter")?;
    let [o_n, out_h, out_w, out_c] = dims4(out_shape, "output")?;
    check_len(input, in_shape, "input")?;
    check_len(filter, filter_shape, "filter")?;
    if out_c != in_c * depth_multiplier || f_c != out_c || o_n != batches {
        return fail(format!(
            "incompatible shapes: input {in_shape:?}, filter {filter_shape:?}, output {out_shape:?}, multiplier {depth_multiplier}"
        ));
    }
    if bias.is_some_and(|b| b.len() != out_c) {
        return fail("bias length must equal output channels");
    }

    let pad_h = padding_offset(params.padding, in_h, k_h, params.stride_h, params.dilation_h, out_h);
    let pad_w = padding_offset(params.padding, in_w, k_w, params.stride_w, params.dilation_w, out_w);

    let mut out = vec![0.0; num_elements(out_shape)];
    for n in 0..batches {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for c in 0..in_c {
                    for m in 0..depth_multiplier {
                        let oc = c * depth_multiplier + m;
                        let mut acc = bias.map_or(0.0, |b| b[oc]);
                        for ky in 0..k_h {
                            let Some(iy) = source_coord(oy, ky, params.stride_h, params.dilation_h, pad_h, in_h) else {
                                continue;
                            };
                            for kx in 0..k_w {
                                let Some(ix) = source_coord(ox, kx, params.stride_w, params.dilation_w, pad_w, in_w) else {
                                    continue;
                                };
                                acc += input[((n * in_h + iy) * in_w + ix) * in_c + c]
                                    * filter[(ky * k_w + kx) * out_c + oc];
                            }
                        }
                        out[((n * out_h + oy) * out_w + ox) * out_c + oc] = acc;
                    }
                }
            }
        }
    }

    apply_activation(&mut out, params.activation);
    Ok(out)
}

/// Dense layer; filter is `[units, depth]`, input is flattened to `[batches, depth]`
pub fn fully_connected(
    input: &[f32],
    filter: &[f32],
    filter_shape: &[usize],
    bias: Option<&[f32]>,
    activation: Activation,
) -> KernelResult<Vec<f32>> {
    let &[units, depth] = filter_shape else {
        return fail(format!("filter must be 2-D, got {filter_shape:?}"));
    };
    check_len(filter, filter_shape, "filter")?;
    if depth == 0 || input.len() % depth != 0 {
        return fail(format!(
            "input of {} values does not divide into rows of {depth}",
            input.len()
        ));
    }
    if bias.is_some_and(|b| b.len() != units) {
        return fail("bias length must equal units");
    }

    let batches = input.len() / depth;
    let mut out = Vec::with_capacity(batches * units);
    for row in input.chunks_exact(depth) {
        for unit in 0..units {
            let weights = &filter[unit * depth..(unit + 1) * depth];
            let dot: f32 = row.iter().zip(weights).map(|(x, w)| x * w).sum();
            out.push(dot + bias.map_or(0.0, |b| b[unit]));
        }
    }

    apply_activation(&mut out, activation);
    Ok(out)
}

/// Average or max pooling over `[N, H, W, C]`
pub fn pool2d(
    input: &[f32],
    in_shape: &[usize],
    out_shape: &[usize],
    filter_h: usize,
    filter_w: usize,
    params: &WindowParams,
    kind: PoolKind,
) -> KernelResult<Vec<f32>> {
    let [batches, in_h, in_w, channels] = dims4(in_shape, "input")?;
    let [o_n, out_h, out_w, o_c] = dims4(out_shape, "output")?;
    check_len(input, in_shape, "input")?;
    if o_n != batches || o_c != channels {
        return fail(format!("incompatible shapes: input {in_shape:?}, output {out_shape:?}"));
    }

    let pad_h = padding_offset(params.padding, in_h, filter_h, params.stride_h, 1, out_h);
    let pad_w = padding_offset(params.padding, in_w, filter_w, params.stride_w, 1, out_w);

    let mut out = vec![0.0; num_elements(out_shape)];
    for n in 0..batches {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for c in 0..channels {
                    let mut sum = 0.0;
                    let mut max = f32::NEG_INFINITY;
                    let mut count = 0usize;
                    for ky in 0..filter_h {
                        let Some(iy) = source_coord(oy, ky, params.stride_h, 1, pad_h, in_h) else {
                            continue;
                        };
                        for kx in 0..filter_w {
                            let Some(ix) = source_coord(ox, kx, params.stride_w, 1, pad_w, in_w) else {
                                continue;
                            };
                            let value = input[((n * in_h + iy) * in_w + ix) * channels + c];
                            sum += value;
                            max = max.max(value);
                            count += 1;
                        }
                    }
                    let result = match (kind, count) {
                        (_, 0) => 0.0,
                        (PoolKind::Average, _) => sum / count as f32,
                        (PoolKind::Max, _) => max,
                    };
                    out[((n * out_h + oy) * out_w + ox) * channels + c] = result;
                }
            }
        }
    }

    apply_activation(&mut out, params.activation);
    Ok(out)
}

/// Mean over `axes`; the result keeps the order of the remaining dimensions
pub fn mean(input: &[f32], in_shape: &[usize], axes: &[i32]) -> KernelResult<Vec<f32>> {
    check_len(input, in_shape, "input")?;
    let rank = in_shape.len();
    let mut reduced = vec![false; rank];
    for &axis in axes {
        reduced[normalize_axis(axis, rank)?] = true;
    }

    let kept_shape: Vec<usize> = in_shape
        .iter()
        .zip(&reduced)
        .map(|(&dim, &r)| if r { 1 } else { dim })
        .collect();
    let kept_strides = row_major_strides(&kept_shape);
    let count: usize = in_shape
        .iter()
        .zip(&reduced)
        .filter(|(_, &r)| r)
        .map(|(&dim, _)| dim)
        .product();
    if count == 0 {
        return fail("mean over an empty dimension");
    }

    let mut out = vec![0.0; num_elements(&kept_shape)];
    let mut index = vec![0; rank];
    for &value in input {
        let target: usize = index
            .iter()
            .zip(&reduced)
            .zip(&kept_strides)
            .map(|((&i, &r), &s)| if r { 0 } else { i * s })
            .sum();
        out[target] += value;
        advance(&mut index, in_shape);
    }
    for value in &mut out {
        *value /= count as f32;
    }
    Ok(out)
}

/// Copy the elements selected by per-axis index lists
fn gather(input: &[f32], shape: &[usize], lists: &[Vec<usize>]) -> Vec<f32> {
    let strides = row_major_strides(shape);
    let out_shape: Vec<usize> = lists.iter().map(Vec::len).collect();
    let total = num_elements(&out_shape);

    let mut out = Vec::with_capacity(total);
    let mut index = vec![0; shape.len()];
    for _ in 0..total {
        let source: usize = index
            .iter()
            .enumerate()
            .map(|(axis, &i)| lists[axis][i] * strides[axis])
            .sum();
        out.push(input[source]);
        advance(&mut index, &out_shape);
    }
    out
}

/// Whether `axis` is set in a 32-bit slice mask; higher axes are never masked
fn mask_bit(mask: i32, axis: usize) -> bool {
    u32::try_from(axis)
        .ok()
        .and_then(|shift| 1i32.checked_shl(shift))
        .map_or(false, |bit| mask & bit != 0)
}

/// Strided slice with begin/end masks; axes past `begin.len()` are taken whole
pub fn strided_slice(
    input: &[f32],
    in_shape: &[usize],
    begin: &[i32],
    end: &[i32],
    strides: &[i32],
    begin_mask: i32,
    end_mask: i32,
) -> KernelResult<Vec<f32>> {
    check_len(input, in_shape, "input")?;
    let rank = in_shape.len();
    if begin.len() != end.len() || begin.len() != strides.len() || begin.len() > rank {
        return fail("begin, end and strides must have equal length no greater than the rank");
    }

    let mut lists = Vec::with_capacity(rank);
    for (axis, &size) in in_shape.iter().enumerate() {
        if axis >= begin.len() {
            lists.push((0..size).collect());
            continue;
        }

        let dim = size as i64;
        let stride = strides[axis] as i64;
        if stride == 0 {
            return fail(format!("stride on axis {axis} is zero"));
        }
        let whole_begin = mask_bit(begin_mask, axis);
        let whole_end = mask_bit(end_mask, axis);
        let wrap = |v: i32| {
            let v = v as i64;
            if v < 0 {
                v + dim
            } else {
                v
            }
        };

        let (start, stop) = if stride > 0 {
            (
                if whole_begin { 0 } else { wrap(begin[axis]).clamp(0, dim) },
                if whole_end { dim } else { wrap(end[axis]).clamp(0, dim) },
            )
        } else {
            (
                if whole_begin { dim - 1 } else { wrap(begin[axis]).clamp(-1, dim - 1) },
                if whole_end { -1 } else { wrap(end[axis]).clamp(-1, dim - 1) },
            )
        };

        let mut indices = Vec::new();
        let mut i = start;
        while (stride > 0 && i < stop) || (stride < 0 && i > stop) {
            indices.push(i as usize);
            i += stride;
        }
        lists.push(indices);
    }

    Ok(gather(input, in_shape, &lists))
}

/// Concatenate along `axis`; all other dimensions must agree
pub fn concatenate(parts: &[(&[f32], &[usize])], axis: usize) -> KernelResult<Vec<f32>> {
    let Some(&(_, first)) = parts.first() else {
        return fail("concatenation needs at least one input");
    };
    if axis >= first.len() {
        return fail(format!("axis {axis} out of range for rank {}", first.len()));
    }
    for &(data, shape) in parts {
        check_len(data, shape, "input")?;
        let compatible = shape.len() == first.len()
            && shape
                .iter()
                .zip(first)
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b);
        if !compatible {
            return fail(format!("cannot concatenate {shape:?} with {first:?} on axis {axis}"));
        }
    }

    let outer = num_elements(&first[..axis]);
    let mut out = Vec::with_capacity(parts.iter().map(|(d, _)| d.len()).sum());
    for o in 0..outer {
        for &(data, shape) in parts {
            let inner = num_elements(&shape[axis..]);
            out.extend_from_slice(&data[o * inner..(o + 1) * inner]);
        }
    }
    Ok(out)
}

/// Stack equally shaped tensors along a new `axis`
pub fn pack(parts: &[&[f32]], shape: &[usize], axis: usize) -> KernelResult<Vec<f32>> {
    if axis > shape.len() {
        return fail(format!("axis {axis} out of range for rank {}", shape.len() + 1));
    }
    for data in parts {
        check_len(data, shape, "input")?;
    }

    let outer = num_elements(&shape[..axis]);
    let inner = num_elements(&shape[axis..]);
    let mut out = Vec::with_capacity(parts.len() * outer * inner);
    for o in 0..outer {
        for data in parts {
            out.extend_from_slice(&data[o * inner..(o + 1) * inner]);
        }
    }
    Ok(out)
}

/// Split along `axis` into pieces of the given sizes
pub fn split(
    input: &[f32],
    in_shape: &[usize],
    axis: usize,
    sizes: &[usize],
) -> KernelResult<Vec<Vec<f32>>> {
    check_len(input, in_shape, "input")?;
    if axis >= in_shape.len() {
        return fail(format!("axis {axis} out of range for rank {}", in_shape.len()));
    }
    if sizes.iter().sum::<usize>() != in_shape[axis] {
        return fail(format!(
            "split sizes {sizes:?} do not add up to dimension {}",
            in_shape[axis]
        ));
    }

    let outer = num_elements(&in_shape[..axis]);
    let unit = num_elements(&in_shape[axis + 1..]);
    let mut outputs: Vec<Vec<f32>> = sizes.iter().map(|s| Vec::with_capacity(outer * s * unit)).collect();
    for o in 0..outer {
        let mut offset = o * in_shape[axis] * unit;
        for (piece, &size) in outputs.iter_mut().zip(sizes) {
            let len = size * unit;
            piece.extend_from_slice(&input[offset..offset + len]);
            offset += len;
        }
    }
    Ok(outputs)
}

/// Constant padding; `paddings[axis] = (before, after)`
pub fn pad(
    input: &[f32],
    in_shape: &[usize],
    paddings: &[(usize, usize)],
    value: f32,
) -> KernelResult<Vec<f32>> {
    check_len(input, in_shape, "input")?;
    if paddings.len() != in_shape.len() {
        return fail("one padding pair per dimension is required");
    }

    let out_shape: Vec<usize> = in_shape
        .iter()
        .zip(paddings)
        .map(|(&dim, &(before, after))| dim + before + after)
        .collect();
    let out_strides = row_major_strides(&out_shape);

    let mut out = vec![value; num_elements(&out_shape)];
    let mut index = vec![0; in_shape.len()];
    for &element in input {
        let target: usize = index
            .iter()
            .zip(paddings)
            .zip(&out_strides)
            .map(|((&i, &(before, _)), &s)| (i + before) * s)
            .sum();
        out[target] = element;
        advance(&mut index, in_shape);
    }
    Ok(out)
}

pub fn logistic(values: &mut [f32]) {
    for value in values {
        *value = 1.0 / (1.0 + (-*value).exp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn valid(stride: usize) -> WindowParams {
        WindowParams {
            padding: Padding::Valid,
            stride_h: stride,
            stride_w: stride,
            dilation_h: 1,
            dilation_w: 1,
            activation: Activation::Identity,
        }
    }

    #[test]
    fn test_broadcast_add() {
        let out = broadcast_binary(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            &[2, 3],
            &[10.0, 20.0, 30.0],
            &[3],
            &[2, 3],
            |a, b| a + b,
        )
        .unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        assert!(broadcast_binary(&[1.0, 2.0], &[2], &[1.0, 2.0, 3.0], &[3], &[3], |a, b| a * b).is_err());
    }

    #[test]
    fn test_conv2d_valid() {
        // 3x3 single-channel input, 2x2 all-ones filter, two output channels
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let filter = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let out = conv2d(
            &input,
            &[1, 3, 3, 1],
            &filter,
            &[2, 2, 2, 1],
            Some(&[0.5, 0.0][..]),
            &[1, 2, 2, 2],
            &valid(1),
        )
        .unwrap();
        assert_eq!(out, vec![12.5, 5.0, 16.5, 6.0, 24.5, 8.0, 28.5, 9.0]);
    }

    #[test]
    fn test_conv2d_same_padding_and_relu() {
        let params = WindowParams {
            padding: Padding::Same,
            activation: Activation::Relu,
            ..valid(1)
        };
        let out = conv2d(
            &[1.0, -2.0, 3.0],
            &[1, 1, 3, 1],
            &[-1.0, -1.0, -1.0],
            &[1, 1, 3, 1],
            None,
            &[1, 1, 3, 1],
            &params,
        )
        .unwrap();
        // Sums over (pad,1,-2), (1,-2,3), (-2,3,pad) negated, then clamped at 0
        assert_eq!(out, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_depthwise_conv2d() {
        // Two channels, multiplier 1, 1x2 kernel
        let input = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        let filter = [1.0, 0.5, 1.0, 0.5];
        let out = depthwise_conv2d(
            &input,
            &[1, 1, 3, 2],
            &filter,
            &[1, 1, 2, 2],
            None,
            &[1, 1, 2, 2],
            1,
            &valid(1),
        )
        .unwrap();
        assert_eq!(out, vec![3.0, 15.0, 5.0, 25.0]);
    }

    #[test]
    fn test_fully_connected() {
        let out = fully_connected(
            &[1.0, 2.0, 3.0],
            &[1.0, 0.0, -1.0, 0.5, 0.5, 0.5],
            &[2, 3],
            Some(&[0.0, 1.0][..]),
            Activation::Identity,
        )
        .unwrap();
        assert_eq!(out, vec![-2.0, 4.0]);

        assert!(fully_connected(&[1.0; 4], &[1.0; 6], &[2, 3], None, Activation::Identity).is_err());
    }

    #[test]
    fn test_pooling() {
        let input: Vec<f32> = (1..=8).map(|v| v as f32).collect();
        let avg = pool2d(&input, &[1, 2, 4, 1], &[1, 1, 2, 1], 2, 2, &valid(2), PoolKind::Average).unwrap();
        assert_eq!(avg, vec![3.5, 5.5]);

        let max = pool2d(&input, &[1, 2, 4, 1], &[1, 1, 2, 1], 2, 2, &valid(2), PoolKind::Max).unwrap();
        assert_eq!(max, vec![6.0, 8.0]);
    }

    #[test]
    fn test_mean_over_axes() {
        let input: Vec<f32> = (1..=6).map(|v| v as f32).collect();
        let rows = mean(&input, &[2, 3], &[1]).unwrap();
        assert_eq!(rows, vec![2.0, 5.0]);

        let cols = mean(&input, &[2, 3], &[-2]).unwrap();
        assert_eq!(cols, vec![2.5, 3.5, 4.5]);

        let all = mean(&input, &[2, 3], &[0, 1]).unwrap();
        assert_relative_eq!(all[0], 3.5);
    }

    #[test]
    fn test_strided_slice() {
        let input: Vec<f32> = (0..12).map(|v| v as f32).collect();
        // Drop the first of three time steps: [1, 3, 4] -> [1, 2, 4]
        let tail = strided_slice(&input, &[1, 3, 4], &[0, 1, 0], &[1, 3, 4], &[1, 1, 1], 0, 0).unwrap();
        assert_eq!(tail, (4..12).map(|v| v as f32).collect::<Vec<_>>());

        let reversed = strided_slice(&input[..4], &[4], &[0], &[0], &[-1], 1, 1).unwrap();
        assert_eq!(reversed, vec![3.0, 2.0, 1.0, 0.0]);

        let every_other = strided_slice(&input[..4], &[4], &[-4], &[4], &[2], 0, 0).unwrap();
        assert_eq!(every_other, vec![0.0, 2.0]);
    }

    #[test]
    fn test_strided_slice_masks_beyond_32_axes() {
        // Axis 32 has no mask bit, so its begin/end apply as given.
        let shape = [1usize; 33];
        let begin = [0i32; 33];
        let end = [1i32; 33];
        let strides = [1i32; 33];
        let out = strided_slice(&[7.5], &shape, &begin, &end, &strides, -1, -1).unwrap();
        assert_eq!(out, vec![7.5]);

        let empty = [0i32; 33];
        let out = strided_slice(&[7.5], &shape, &begin, &empty, &strides, -1, -1).unwrap();
        assert!(out.is_empty());
        assert!(!mask_bit(-1, 32));
        assert!(mask_bit(i32::MIN, 31));
    }

    #[test]
    fn test_concatenate_and_split_are_inverse() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0];
        let parts: [(&[f32], &[usize]); 2] = [(&a, &[2, 2]), (&b, &[2, 1])];
        let joined = concatenate(&parts, 1).unwrap();
        assert_eq!(joined, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);

        let pieces = split(&joined, &[2, 3], 1, &[2, 1]).unwrap();
        assert_eq!(pieces, vec![a.to_vec(), b.to_vec()]);

        let mismatched: [(&[f32], &[usize]); 2] = [(&a, &[2, 2]), (&b, &[1, 2])];
        assert!(concatenate(&mismatched, 1).is_err());
    }

    #[test]
    fn test_pack() {
        let parts: [&[f32]; 2] = [&[1.0, 2.0], &[3.0, 4.0]];
        let out = pack(&parts, &[2], 1).unwrap();
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);

        let out = pack(&parts, &[2], 0).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_pad() {
        let out = pad(&[1.0, 2.0], &[1, 2], &[(0, 0), (1, 2)], 0.0).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_activations() {
        let mut values = [-3.0, -0.5, 0.5, 7.0];
        apply_activation(&mut values, Activation::Relu6);
        assert_eq!(values, [0.0, 0.0, 0.5, 6.0]);

        let mut values = [-3.0, 0.5, 7.0];
        apply_activation(&mut values, Activation::ReluN1To1);
        assert_eq!(values, [-1.0, 0.5, 1.0]);

        let mut values = [0.0];
        logistic(&mut values);
        assert_relative_eq!(values[0], 0.5);
    }
}
