//! Mixture of Experts routing and dispatch.
//!
//! - [`router`]: gate logits, top-k softmax and dense gate weights
//! - [`fused`]: grouped expert execution over stacked weights
//! - [`dispatcher`]: [`MoEDispatcher`], choosing fused or dense-loop dispatch

pub mod dispatcher;
pub mod fused;
pub mod router;

pub use dispatcher::{DenseLoopExperts, FusedExperts, MoEDispatcher};
pub use fused::fused_moe;
pub use router::{dense_gate_weights, topk_softmax, RouterGate};
