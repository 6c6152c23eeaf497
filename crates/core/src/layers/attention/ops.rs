//! Reference attention kernels on flat token batches.
//!
//! Tensors are `[tokens, heads, head_dim]`. Scores and softmax run in f32
//! and the output is cast back to the query dtype.

use candle_core::{DType, Device, Tensor};

use crate::error::{ModelError, Result};

/// Additive causal mask `[seq_len, seq_len + seqlen_offset]`: query `i` sees
/// keys `0..=i + seqlen_offset`.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, total_len), device)?.to_dtype(dtype)?)
}

/// `softmax(q k^T * scale + mask) v` for `q [heads, q_len, d]`.
fn attend(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>, scale: f64) -> Result<Tensor> {
    let out_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;

    let scores = (q.matmul(&k.transpose(1, 2)?.contiguous()?)? * scale)?;
    let scores = match mask {
        Some(m) => scores.broadcast_add(m)?,
        None => scores,
    };
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(probs.matmul(&v)?.to_dtype(out_dtype)?)
}

/// Causal self-attention over a packed batch of sequences.
///
/// `q [n, H, d]`, `k [n, H, d]`, `v [n, H, dv]`; sequence `i` is tokens
/// `cu_seqlens[i]..cu_seqlens[i+1]` and only attends within itself.
/// Returns `[n, H, dv]`.
pub fn varlen_causal_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens: &[usize],
    scale: f64,
) -> Result<Tensor> {
    let (n, heads, _) = q.dims3()?;
    let total = cu_seqlens.last().copied().unwrap_or(0);
    if total != n {
        return Err(ModelError::shape("varlen cu_seqlens", &[n], &[total]));
    }

    let mut outputs = Vec::with_capacity(cu_seqlens.len().saturating_sub(1));
    for w in cu_seqlens.windows(2) {
        let (start, len) = (w[0], w[1] - w[0]);
        if len == 0 {
            continue;
        }
        // [len, H, d] -> [H, len, d]
        let qs = q.narrow(0, start, len)?.transpose(0, 1)?.contiguous()?;
        let ks = k.narrow(0, start, len)?.transpose(0, 1)?.contiguous()?;
        let vs = v.narrow(0, start, len)?.transpose(0, 1)?.contiguous()?;
        let mask = causal_mask(len, 0, DType::F32, q.device())?;
        let out = attend(&qs, &ks, &vs, Some(&mask), scale)?;
        outputs.push(out.transpose(0, 1)?);
    }
    if outputs.is_empty() {
        return Ok(Tensor::zeros((0, heads, v.dim(2)?), q.dtype(), q.device())?);
    }
    Ok(Tensor::cat(&outputs, 0)?.contiguous()?)
}

/// One query token against `len` cached keys.
///
/// `q [H, d]`, `k [len, H, d]`, `v [len, H, dv]`; returns `[H, dv]`.
pub fn single_query_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let q = q.unsqueeze(1)?; // [H, 1, d]
    let k = k.transpose(0, 1)?.contiguous()?;
    let v = v.transpose(0, 1)?.contiguous()?;
    Ok(attend(&q, &k, &v, None, scale)?.squeeze(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn causal_mask_layout() {
        let mask = causal_mask(2, 1, DType::F32, &Device::Cpu).unwrap();
        let m = mask.to_vec2::<f32>().unwrap();
        assert_eq!(m[0][..2], [0.0, 0.0]);
        assert_eq!(m[0][2], f32::NEG_INFINITY);
        assert!(m[1].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_key_returns_its_value() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 4), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 4), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (1, 2, 3), &device).unwrap();
        let out = single_query_attention(&q, &k, &v, 0.5).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
        assert!(max_diff(&out, &v.squeeze(0).unwrap()) < 1e-6);
    }

    #[test]
    fn last_prefill_token_matches_single_query() {
        let device = Device::Cpu;
        let (n, h, d) = (5, 2, 4);
        let q = Tensor::randn(0f32, 1.0, (n, h, d), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (n, h, d), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (n, h, d), &device).unwrap();

        let prefill = varlen_causal_attention(&q, &k, &v, &[0, n], 0.5).unwrap();
        let last = single_query_attention(&q.get(n - 1).unwrap(), &k, &v, 0.5).unwrap();
        assert!(max_diff(&prefill.get(n - 1).unwrap(), &last) < 1e-5);

        // First token only sees itself.
        assert!(max_diff(&prefill.get(0).unwrap(), &v.get(0).unwrap()) < 1e-6);
    }

    #[test]
    fn sequences_do_not_attend_across_boundaries() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (5, 1, 4), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (5, 1, 4), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (5, 1, 4), &device).unwrap();

        let packed = varlen_causal_attention(&q, &k, &v, &[0, 2, 5], 1.0).unwrap();
        let second = varlen_causal_attention(
            &q.narrow(0, 2, 3).unwrap(),
            &k.narrow(0, 2, 3).unwrap(),
            &v.narrow(0, 2, 3).unwrap(),
            &[0, 3],
            1.0,
        )
        .unwrap();
        assert!(max_diff(&packed.narrow(0, 2, 3).unwrap(), &second) < 1e-6);
    }

    #[test]
    fn cu_seqlens_must_cover_batch() {
        let device = Device::Cpu;
        let t = Tensor::zeros((3, 1, 2), DType::F32, &device).unwrap();
        let err = varlen_causal_attention(&t, &t, &t, &[0, 2], 1.0).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }
}
