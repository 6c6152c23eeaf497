//! Sharded linear operators.
//!
//! Every projection in the model is a [`ShardedLinear`]: replicated,
//! column-sharded, row-sharded, or a quantized kernel carrying one of those
//! shardings. Factories load the full checkpoint tensor and keep this rank's
//! slice; `apply` performs the matmul and, for reducing row operators, the
//! all-reduce.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::distributed::{
    shard_along, ColumnParallelLinear, DeviceContext, RowParallelLinear, ShardKind, ShardSpec,
};
use crate::error::{ModelError, Result};
use crate::quantization::{create_quantized_linear, QuantizeMode, QuantizedLinear};

#[derive(Debug)]
pub enum ShardedLinear {
    /// Full weight on every shard.
    Replicated(Linear, ShardSpec),
    /// Output dimension split.
    ColumnSharded(ColumnParallelLinear),
    /// Input dimension split; reduces when built with `reduce = true`.
    RowSharded(RowParallelLinear),
    /// Quantized kernel over this shard's slice. `bias` is the column slice
    /// for column operators and the full bias for row operators.
    Quantized {
        inner: Box<dyn QuantizedLinear>,
        bias: Option<Tensor>,
        spec: ShardSpec,
    },
}

fn load_bias(out_features: usize, bias: bool, vb: &VarBuilder) -> Result<Option<Tensor>> {
    if bias {
        Ok(Some(vb.get(out_features, "bias")?))
    } else {
        Ok(None)
    }
}

impl ShardedLinear {
    /// Unsharded `[out, in]` operator, quantized when `quantize` is set.
    pub fn replicated(
        in_features: usize,
        out_features: usize,
        bias: bool,
        quantize: Option<QuantizeMode>,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let weight = vb.get((out_features, in_features), "weight")?;
        let bias = load_bias(out_features, bias, &vb)?;
        let layer = match quantize {
            None => Self::Replicated(
                Linear::new(weight, bias),
                ShardSpec::new(ShardKind::Replicated, ctx),
            ),
            Some(mode) => Self::Quantized {
                inner: create_quantized_linear(mode, &weight)?,
                bias,
                spec: ShardSpec::new(ShardKind::Replicated, ctx),
            },
        };
        tracing::debug!(prefix = %vb.prefix(), spec = ?layer.shard_spec(), "linear");
        Ok(layer)
    }

    /// Operator whose output dimension is split across shards.
    pub fn column(
        in_features: usize,
        out_features: usize,
        bias: bool,
        quantize: Option<QuantizeMode>,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let layer = match quantize {
            None => Self::ColumnSharded(ColumnParallelLinear::load(
                in_features,
                out_features,
                bias,
                vb.clone(),
                ctx,
            )?),
            Some(mode) => {
                let full = vb.get((out_features, in_features), "weight")?;
                let weight = shard_along(&full, 0, "out_features", ctx)?;
                let bias = match load_bias(out_features, bias, &vb)? {
                    Some(b) => Some(shard_along(&b, 0, "out_features", ctx)?),
                    None => None,
                };
                Self::Quantized {
                    inner: create_quantized_linear(mode, &weight)?,
                    bias,
                    spec: ShardSpec::new(ShardKind::Column, ctx),
                }
            }
        };
        tracing::debug!(prefix = %vb.prefix(), spec = ?layer.shard_spec(), "linear");
        Ok(layer)
    }

    /// Column operator concatenating several checkpoint weights, each sharded
    /// separately, e.g. `gate_proj` + `up_proj`.
    pub fn column_multi(
        in_features: usize,
        parts: &[(&str, usize)],
        quantize: Option<QuantizeMode>,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let layer = match quantize {
            None => Self::ColumnSharded(ColumnParallelLinear::load_multi(
                in_features,
                parts,
                vb.clone(),
                ctx,
            )?),
            Some(mode) => {
                let mut shards = Vec::with_capacity(parts.len());
                for (prefix, out_features) in parts {
                    let full = vb.pp(*prefix).get((*out_features, in_features), "weight")?;
                    shards.push(shard_along(&full, 0, prefix, ctx)?);
                }
                let weight = Tensor::cat(&shards, 0)?;
                Self::Quantized {
                    inner: create_quantized_linear(mode, &weight)?,
                    bias: None,
                    spec: ShardSpec::new(ShardKind::Column, ctx),
                }
            }
        };
        tracing::debug!(prefix = %vb.prefix(), parts = parts.len(), "merged linear");
        Ok(layer)
    }

    /// Operator whose input dimension is split across shards. With
    /// `reduce = false` the caller owns the all-reduce of the partial sums.
    pub fn row(
        in_features: usize,
        out_features: usize,
        bias: bool,
        reduce: bool,
        quantize: Option<QuantizeMode>,
        vb: VarBuilder,
        ctx: &DeviceContext,
    ) -> Result<Self> {
        let layer = match quantize {
            None => Self::RowSharded(RowParallelLinear::load(
                in_features,
                out_features,
                bias,
                reduce,
                vb.clone(),
                ctx,
            )?),
            Some(mode) => {
                let full = vb.get((out_features, in_features), "weight")?;
                let weight = shard_along(&full, 1, "in_features", ctx)?;
                Self::Quantized {
                    inner: create_quantized_linear(mode, &weight)?,
                    bias: load_bias(out_features, bias, &vb)?,
                    spec: ShardSpec::new(ShardKind::Row { reduce }, ctx),
                }
            }
        };
        tracing::debug!(prefix = %vb.prefix(), spec = ?layer.shard_spec(), "linear");
        Ok(layer)
    }

    /// `x [..., in_local] -> [..., out_local]`, all-reducing row operators
    /// that own their reduction.
    pub fn apply(&self, x: &Tensor, ctx: &DeviceContext) -> Result<Tensor> {
        match self {
            Self::Replicated(linear, _) => Ok(linear.forward(x)?),
            Self::ColumnSharded(linear) => Ok(linear.forward(x)?),
            Self::RowSharded(linear) => Ok(linear.forward(x, ctx)?),
            Self::Quantized { inner, bias, spec } => {
                let mut y = inner.forward(x)?;
                let add_bias = match spec.kind {
                    ShardKind::Row { reduce: true } => {
                        y = ctx.all_reduce_sum(&y)?;
                        true
                    }
                    ShardKind::Row { reduce: false } => spec.rank == 0,
                    ShardKind::Column | ShardKind::Replicated => true,
                };
                match bias {
                    Some(b) if add_bias => Ok(y.broadcast_add(b)?),
                    _ => Ok(y),
                }
            }
        }
    }

    pub fn shard_spec(&self) -> ShardSpec {
        match self {
            Self::Replicated(_, spec) => *spec,
            Self::ColumnSharded(l) => l.spec(),
            Self::RowSharded(l) => l.spec(),
            Self::Quantized { spec, .. } => *spec,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }

    /// This shard's full-precision weight, `None` for quantized operators.
    pub fn dense_weight(&self) -> Option<&Tensor> {
        match self {
            Self::Replicated(l, _) => Some(l.weight()),
            Self::ColumnSharded(l) => Some(l.weight()),
            Self::RowSharded(l) => Some(l.weight()),
            Self::Quantized { .. } => None,
        }
    }

    /// Stacked `[E, out, in]` weight of same-shaped unquantized operators.
    pub fn stack_weights(layers: &[&ShardedLinear]) -> Result<Tensor> {
        let weights = layers
            .iter()
            .map(|l| {
                l.dense_weight()
                    .ok_or_else(|| ModelError::config("cannot stack quantized expert weights"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&weights, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ThreadCommunicator;
    use candle_core::{DType, Device};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn weights(out: usize, inp: usize, bias: bool) -> VarBuilder<'static> {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        let w: Vec<f32> = (0..out * inp).map(|i| (i as f32 * 0.37).sin()).collect();
        map.insert(
            "weight".to_string(),
            Tensor::from_vec(w, (out, inp), &device).unwrap(),
        );
        if bias {
            let b: Vec<f32> = (0..out).map(|i| i as f32 * 0.1).collect();
            map.insert("bias".to_string(), Tensor::from_vec(b, out, &device).unwrap());
        }
        VarBuilder::from_tensors(map, DType::F32, &device)
    }

    fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < tol, "max diff {diff}");
    }

    #[test]
    fn single_device_kinds() {
        let ctx = DeviceContext::single_device();
        let col = ShardedLinear::column(6, 4, false, None, weights(4, 6, false), &ctx).unwrap();
        let row = ShardedLinear::row(6, 4, true, true, None, weights(4, 6, true), &ctx).unwrap();
        let rep = ShardedLinear::replicated(6, 4, false, None, weights(4, 6, false), &ctx).unwrap();
        assert_eq!(col.shard_spec().kind, ShardKind::Column);
        assert_eq!(row.shard_spec().kind, ShardKind::Row { reduce: true });
        assert_eq!(rep.shard_spec().kind, ShardKind::Replicated);

        let x = Tensor::randn(0f32, 1.0, (3, 6), &Device::Cpu).unwrap();
        assert_close(&col.apply(&x, &ctx).unwrap(), &rep.apply(&x, &ctx).unwrap(), 1e-6);
    }

    #[test]
    fn indivisible_shard_is_rejected() {
        let comm = ThreadCommunicator::group(4).unwrap().into_iter().next().unwrap();
        let ctx = DeviceContext::new(Arc::new(comm));
        let err = ShardedLinear::column(6, 6, false, None, weights(6, 6, false), &ctx).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)), "{err}");
    }

    #[test]
    fn row_sharded_matches_replicated_across_two_threads() {
        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
        let single = DeviceContext::single_device();
        let full = ShardedLinear::replicated(8, 4, true, None, weights(4, 8, true), &single)
            .unwrap()
            .apply(&x, &single)
            .unwrap();

        let comms = ThreadCommunicator::group(2).unwrap();
        let outputs: Vec<Tensor> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let x = x.clone();
                    s.spawn(move || {
                        let ctx = DeviceContext::new(Arc::new(comm));
                        let rank = ctx.rank();
                        let layer =
                            ShardedLinear::row(8, 4, true, true, None, weights(4, 8, true), &ctx)
                                .unwrap();
                        let x_local = x.narrow(1, rank * 4, 4).unwrap();
                        layer.apply(&x_local, &ctx).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for out in &outputs {
            assert_close(out, &full, 1e-5);
        }
    }

    #[test]
    fn quantized_column_is_close_to_dense() {
        let ctx = DeviceContext::single_device();
        let dense = ShardedLinear::column(16, 8, true, None, weights(8, 16, true), &ctx).unwrap();
        let quant = ShardedLinear::column(
            16,
            8,
            true,
            Some(QuantizeMode::Eetq),
            weights(8, 16, true),
            &ctx,
        )
        .unwrap();
        assert!(quant.is_quantized());
        assert!(quant.dense_weight().is_none());

        let x = Tensor::randn(0f32, 1.0, (3, 16), &Device::Cpu).unwrap();
        assert_close(&dense.apply(&x, &ctx).unwrap(), &quant.apply(&x, &ctx).unwrap(), 0.1);
    }

    #[test]
    fn unsupported_quantization_fails_at_construction() {
        let ctx = DeviceContext::single_device();
        let err = ShardedLinear::row(
            8,
            4,
            false,
            true,
            Some(QuantizeMode::Fp8),
            weights(4, 8, false),
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn stack_weights_of_experts() {
        let ctx = DeviceContext::single_device();
        let a = ShardedLinear::column(6, 4, false, None, weights(4, 6, false), &ctx).unwrap();
        let b = ShardedLinear::column(6, 4, false, None, weights(4, 6, false), &ctx).unwrap();
        let stacked = ShardedLinear::stack_weights(&[&a, &b]).unwrap();
        assert_eq!(stacked.dims(), &[2, 4, 6]);
    }
}
