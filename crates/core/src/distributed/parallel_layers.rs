//! Parallel linear layers for tensor parallelism.
//!
//! # Column Parallel Linear
//! Splits the output dimension: each shard computes a slice of the output.
//! Used for: query / kv_b projections, merged gate+up in MLPs.
//!
//! # Row Parallel Linear
//! Splits the input dimension: each shard holds a slice of the weight and
//! produces a partial sum. Used for: output projection, down projection.
//!
//! # Weight Loading
//!
//! Checkpoints contain FULL (unsharded) tensors. Each layer loads the full
//! weight and keeps only its rank's slice:
//! - ColumnParallel: narrows the output dimension (dim 0 of weight)
//! - RowParallel: narrows the input dimension (dim 1 of weight)

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::context::DeviceContext;
use super::error::{DistributedError, Result};

/// How a linear operator's weight is split across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    /// Full weight on every shard.
    Replicated,
    /// Output dimension split; no communication.
    Column,
    /// Input dimension split; `reduce` sums partial outputs across shards.
    Row { reduce: bool },
}

/// Sharding attached to a linear operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub kind: ShardKind,
    pub rank: usize,
    pub world_size: usize,
}

impl ShardSpec {
    pub fn new(kind: ShardKind, ctx: &DeviceContext) -> Self {
        Self {
            kind,
            rank: ctx.rank(),
            world_size: ctx.world_size(),
        }
    }
}

/// Slice `[rank * size/ws, (rank+1) * size/ws)` of `dim`.
pub fn shard_along(tensor: &Tensor, dim: usize, what: &str, ctx: &DeviceContext) -> Result<Tensor> {
    let (start, end) = ctx.shard_range(what, tensor.dim(dim)?)?;
    if ctx.is_single() {
        return Ok(tensor.clone());
    }
    Ok(tensor.narrow(dim, start, end - start)?.contiguous()?)
}

/// `[..., in] x [out, in]^T`, flattening leading dims for the matmul.
fn matmul_last_dim(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let input_dims = input.dims();
    let in_features = *input_dims.last().ok_or_else(|| DistributedError::ShapeMismatch {
        expected: vec![weight.dim(1).unwrap_or(0)],
        actual: vec![],
    })?;
    let batch_size: usize = input_dims.iter().rev().skip(1).product();
    let flat_input = input.reshape((batch_size, in_features))?;
    let output = flat_input.matmul(&weight.t()?)?;

    let mut out_shape: Vec<usize> = input_dims[..input_dims.len() - 1].to_vec();
    out_shape.push(output.dim(1)?);
    Ok(output.reshape(out_shape.as_slice())?)
}

/// Column-parallel linear layer.
///
/// `output_chunk = input @ weight_chunk^T + bias_chunk`. Followed either by an
/// element-wise op on the chunk or by a row-parallel layer.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    /// Weight: [out_features/ws, in_features]
    weight: Tensor,
    /// Optional bias: [out_features/ws]
    bias: Option<Tensor>,
    spec: ShardSpec,
}

impl ColumnParallelLinear {
    /// Load the full `[out, in]` weight under `vb` and keep this rank's rows.
    pub fn load(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let full_weight = vb.get((out_features, in_features), "weight")?;
        let weight = shard_along(&full_weight, 0, "out_features", ctx)?;
        let bias = if bias {
            let full_bias = vb.get(out_features, "bias")?;
            Some(shard_along(&full_bias, 0, "out_features", ctx)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            spec: ShardSpec::new(ShardKind::Column, ctx),
        })
    }

    /// Load several weights sharing the input dimension and concatenate each
    /// rank's slices, e.g. `gate_proj` + `up_proj` into one operator whose
    /// local output is `[gate_chunk | up_chunk]`.
    pub fn load_multi(
        in_features: usize,
        parts: &[(&str, usize)],
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let mut shards = Vec::with_capacity(parts.len());
        for (prefix, out_features) in parts {
            let full = vb.pp(*prefix).get((*out_features, in_features), "weight")?;
            shards.push(shard_along(&full, 0, prefix, ctx)?);
        }
        let weight = Tensor::cat(&shards, 0)?;
        Ok(Self {
            weight,
            bias: None,
            spec: ShardSpec::new(ShardKind::Column, ctx),
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let output = matmul_last_dim(input, &self.weight)?;
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(bias)?),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn spec(&self) -> ShardSpec {
        self.spec
    }
}

/// Row-parallel linear layer.
///
/// `output_partial = input_chunk @ weight_chunk^T`; the partials are summed
/// with all_reduce when `reduce` is set. The bias is added once, after the
/// reduction (or by rank 0 only when the caller reduces later).
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    /// Weight: [out_features, in_features/ws]
    weight: Tensor,
    bias: Option<Tensor>,
    spec: ShardSpec,
    reduce: bool,
}

impl RowParallelLinear {
    /// Load the full `[out, in]` weight under `vb` and keep this rank's columns.
    pub fn load(
        in_features: usize,
        out_features: usize,
        bias: bool,
        reduce: bool,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let full_weight = vb.get((out_features, in_features), "weight")?;
        let weight = shard_along(&full_weight, 1, "in_features", ctx)?;
        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            spec: ShardSpec::new(ShardKind::Row { reduce }, ctx),
            reduce,
        })
    }

    pub fn forward(&self, input: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        let mut output = matmul_last_dim(input, &self.weight)?;
        if self.reduce {
            output = ctx.all_reduce_sum(&output)?;
        }
        match &self.bias {
            Some(bias) if self.reduce || self.spec.rank == 0 => Ok(output.broadcast_add(bias)?),
            _ => Ok(output),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn spec(&self) -> ShardSpec {
        self.spec
    }
}
