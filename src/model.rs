#![allow(clippy::needless_range_loop)]
use rayon::prelude::*;

use crate::config::Mamba2Config;
use crate::error::{check_len, Result};

/// Dense projection without bias, weights stored row-major as `[out_dim, in_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearNoBias {
    w: Vec<f32>,
    in_dim: usize,
    out_dim: usize,
}

impl LinearNoBias {
    pub fn new(w: Vec<f32>, in_dim: usize, out_dim: usize) -> Result<Self> {
        check_len("linear weight", in_dim * out_dim, w.len())?;
        Ok(Self { w, in_dim, out_dim })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn weight(&self) -> &[f32] {
        &self.w
    }

    // https://github.com/srush/llama2.rs/blob/2ca8f3dc0d4aa945a29700271883af72d9043ef1/src/model.rs#L22
    /// Applies the projection to each row of `x`, `[rows, in_dim] -> [rows, out_dim]`.
    pub fn forward(&self, xout: &mut [f32], x: &[f32]) {
        debug_assert_eq!(x.len() / self.in_dim, xout.len() / self.out_dim);
        for (xout, x) in xout.chunks_exact_mut(self.out_dim).zip(x.chunks_exact(self.in_dim)) {
            xout.par_iter_mut().enumerate().for_each(|(i, v)| {
                let w = &self.w[i * self.in_dim..(i + 1) * self.in_dim];
                *v = w.iter().zip(x.iter()).fold(0.0, |acc, (&_w, &_x)| acc + _w * _x);
            });
        }
    }

    /// Same as [LinearNoBias::forward] but checks the input width first.
    pub fn forward_checked(&self, x: &[f32]) -> Result<Vec<f32>> {
        if x.len() % self.in_dim != 0 {
            return Err(crate::Error::shape("linear input length", self.in_dim, x.len()));
        }
        let rows = x.len() / self.in_dim;
        let mut xout = vec![0f32; rows * self.out_dim];
        self.forward(&mut xout, x);
        Ok(xout)
    }
}

/// RMS normalization of the scan output, modulated by `silu(z)`.
///
/// With `norm_before_gate` the output is `rms_norm(y) * w * silu(z)`, otherwise the gate is
/// applied first and the product is normalized, `rms_norm(y * silu(z)) * w`.
#[derive(Debug, Clone, PartialEq)]
pub struct GatedRmsNorm {
    w: Vec<f32>,
    eps: f32,
    norm_before_gate: bool,
}

impl GatedRmsNorm {
    pub fn new(w: Vec<f32>, eps: f32, norm_before_gate: bool) -> Self {
        Self { w, eps, norm_before_gate }
    }

    pub fn weight(&self) -> &[f32] {
        &self.w
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn norm_before_gate(&self) -> bool {
        self.norm_before_gate
    }

    /// Same weight with another epsilon and gate order.
    pub fn with_options(self, eps: f32, norm_before_gate: bool) -> Self {
        Self { eps, norm_before_gate, ..self }
    }

    fn rms_scale(&self, xs: &[f32]) -> f32 {
        // calculate sum of squares
        let mut ss = xs.iter().fold(0.0, |acc, x| acc + x * x);
        // take mean
        ss /= xs.len() as f32;
        ss += self.eps;
        1.0 / ss.sqrt()
    }

    /// Normalizes a single row. `o`, `y` and `z` all have the weight's width.
    pub fn forward_one(&self, o: &mut [f32], y: &[f32], z: &[f32]) {
        if self.norm_before_gate {
            let ss = self.rms_scale(y);
            for j in 0..self.w.len() {
                o[j] = self.w[j] * ss * y[j] * silu(z[j]);
            }
        } else {
            for j in 0..self.w.len() {
                o[j] = y[j] * silu(z[j]);
            }
            let ss = self.rms_scale(o);
            for (o_j, w_j) in o.iter_mut().zip(self.w.iter()) {
                *o_j *= ss * w_j;
            }
        }
    }
}

/// The slices of one projected row, in the order the input projection lays them out.
#[derive(Debug, Clone, Copy)]
pub struct ProjectedInput<'a> {
    pub mlp_gate: &'a [f32],
    pub mlp_value: &'a [f32],
    pub z: &'a [f32],
    pub xbc: &'a [f32],
    pub dt: &'a [f32],
}

impl<'a> ProjectedInput<'a> {
    /// Splits a `d_in_proj` wide row into `[z0, x0, z, xBC, dt]`.
    pub fn split(cfg: &Mamba2Config, row: &'a [f32]) -> Result<Self> {
        check_len("projected row", cfg.d_in_proj(), row.len())?;
        let (mlp_gate, rest) = row.split_at(cfg.d_mlp);
        let (mlp_value, rest) = rest.split_at(cfg.d_mlp);
        let (z, rest) = rest.split_at(cfg.d_inner());
        let (xbc, dt) = rest.split_at(cfg.conv_dim());
        Ok(Self { mlp_gate, mlp_value, z, xbc, dt })
    }
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x * (1.0 / (1.0 + (-x).exp()))
}

pub(crate) fn silu_in_place(s: &mut [f32]) {
    for s in s.iter_mut() {
        *s = silu(*s);
    }
}

/// `ln(1 + exp(x))`, linear above 20 where the exponential would only add rounding noise.
#[inline]
pub fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

pub(crate) fn dot(v1: &[f32], v2: &[f32]) -> f32 {
    v1.iter().zip(v2.iter()).map(|(&v1, &v2)| v1 * v2).sum::<f32>()
}
