//! Selective scan, the state-space recurrence at the heart of the layer.
//!
//! Per head `h` with a `headdim x d_state` state matrix `S`:
//!
//! ```text
//!   dt    = softplus(dt_raw + dt_bias[h])
//!   S     = S * exp(dt * A[h]) + dt * outer(x[h], B)
//!   y[h]  = S . C + D[h] * x[h]
//! ```
//!
//! [Sequential] applies this one timestep after the other and is the only option when
//! inputs arrive one at a time. [Chunked] splits the sequence into chunks, computes every
//! position of a chunk independently from the closed form of the recurrence, and only
//! carries the state sequentially from one chunk boundary to the next. Both agree up to
//! floating point rounding for every chunk size.
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{check_len, Error, Result};
use crate::model::{dot, softplus};

/// Per-head parameters of the recurrence, `a` is the (negative) decay rate `-exp(A_log)`.
#[derive(Debug, Clone, Copy)]
pub struct ScanParams<'a> {
    pub a: &'a [f32],
    pub d: &'a [f32],
    pub dt_bias: &'a [f32],
    pub nheads: usize,
    pub headdim: usize,
    pub d_state: usize,
}

impl ScanParams<'_> {
    pub fn inner(&self) -> usize {
        self.nheads * self.headdim
    }

    pub fn state_len(&self) -> usize {
        self.nheads * self.headdim * self.d_state
    }

    /// Effective timestep and decay factor of head `h` for a raw timestep logit.
    #[inline]
    pub fn discretize(&self, h: usize, dt_raw: f32) -> (f32, f32) {
        let dt = softplus(dt_raw + self.dt_bias[h]);
        (dt, (dt * self.a[h]).exp())
    }
}

/// One sequence worth of scan inputs, all row-major over time.
#[derive(Debug, Clone, Copy)]
pub struct ScanInput<'a> {
    /// `[seq_len, nheads * headdim]`
    pub x: &'a [f32],
    /// `[seq_len, nheads]`, before bias and softplus.
    pub dt: &'a [f32],
    /// `[seq_len, d_state]`
    pub b: &'a [f32],
    /// `[seq_len, d_state]`
    pub c: &'a [f32],
}

impl ScanInput<'_> {
    fn seq_len(&self, p: &ScanParams) -> Result<usize> {
        let inner = p.inner();
        if self.x.len() % inner != 0 {
            return Err(Error::shape("scan x length", inner, self.x.len()));
        }
        let seq_len = self.x.len() / inner;
        check_len("scan dt length", seq_len * p.nheads, self.dt.len())?;
        check_len("scan B length", seq_len * p.d_state, self.b.len())?;
        check_len("scan C length", seq_len * p.d_state, self.c.len())?;
        Ok(seq_len)
    }
}

/// A way of evaluating the recurrence over a whole sequence.
///
/// `state` holds the initial state on entry and the final state on return, so consecutive
/// calls continue each other. `y` receives `[seq_len, nheads * headdim]`.
pub trait SelectiveScan {
    fn scan(&self, p: &ScanParams, input: &ScanInput, state: &mut [f32], y: &mut [f32])
        -> Result<()>;
}

fn check_params(p: &ScanParams) -> Result<()> {
    check_len("A", p.nheads, p.a.len())?;
    check_len("D", p.nheads, p.d.len())?;
    check_len("dt_bias", p.nheads, p.dt_bias.len())
}

fn check_shapes(p: &ScanParams, input: &ScanInput, state: &[f32], y: &[f32]) -> Result<usize> {
    check_params(p)?;
    let seq_len = input.seq_len(p)?;
    check_len("ssm state", p.state_len(), state.len())?;
    check_len("scan output", seq_len * p.inner(), y.len())?;
    Ok(seq_len)
}

/// Advances `state` by a single timestep and writes that step's output in `y`.
///
/// `x` and `y` are `nheads * headdim` wide, `dt` is `nheads` wide, `b` and `c` are `d_state`
/// wide.
pub fn step_update(
    p: &ScanParams,
    x: &[f32],
    dt: &[f32],
    b: &[f32],
    c: &[f32],
    state: &mut [f32],
    y: &mut [f32],
) {
    let (hd, n) = (p.headdim, p.d_state);
    for h in 0..p.nheads {
        let (dt_h, decay) = p.discretize(h, dt[h]);
        for i in h * hd..(h + 1) * hd {
            let s = &mut state[i * n..(i + 1) * n];
            let dt_x = dt_h * x[i];
            for (s, b) in s.iter_mut().zip(b.iter()) {
                *s = *s * decay + dt_x * b;
            }
            y[i] = dot(s, c) + p.d[h] * x[i];
        }
    }
}

/// Reference strategy, one timestep at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl SelectiveScan for Sequential {
    fn scan(
        &self,
        p: &ScanParams,
        input: &ScanInput,
        state: &mut [f32],
        y: &mut [f32],
    ) -> Result<()> {
        let seq_len = check_shapes(p, input, state, y)?;
        let (inner, n, nh) = (p.inner(), p.d_state, p.nheads);
        for t in 0..seq_len {
            step_update(
                p,
                &input.x[t * inner..(t + 1) * inner],
                &input.dt[t * nh..(t + 1) * nh],
                &input.b[t * n..(t + 1) * n],
                &input.c[t * n..(t + 1) * n],
                state,
                &mut y[t * inner..(t + 1) * inner],
            );
        }
        Ok(())
    }
}

/// Chunked-parallel strategy.
///
/// Within a chunk, with `cum[t]` the running sum of `dt * A` from the chunk start:
///
/// ```text
///   y[t]   = exp(cum[t]) * S0 . C[t]
///          + sum_{s <= t} exp(cum[t] - cum[s]) * dt[s] * (C[t] . B[s]) * x[s]
///          + D * x[t]
///   S_end  = exp(cum[last]) * S0 + sum_s exp(cum[last] - cum[s]) * dt[s] * outer(x[s], B[s])
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Chunked {
    chunk_size: usize,
}

impl Chunked {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".to_string()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Per-chunk quantities shared by every position of the chunk.
struct ChunkTerms {
    len: usize,
    // [len, nheads]
    dt: Vec<f32>,
    // Running sums of dt * A. f64 so that cum[t] - cum[s] stays accurate late in long chunks.
    cum: Vec<f64>,
    // [len, len], C[t] . B[s] for s <= t
    cb: Vec<f32>,
}

impl ChunkTerms {
    fn new(p: &ScanParams, input: &ScanInput, start: usize, end: usize) -> Self {
        let (len, nh, n) = (end - start, p.nheads, p.d_state);
        let mut dt = vec![0f32; len * nh];
        let mut cum = vec![0f64; len * nh];
        for t in 0..len {
            for h in 0..nh {
                let (dt_h, _) = p.discretize(h, input.dt[(start + t) * nh + h]);
                let prev = if t == 0 { 0.0 } else { cum[(t - 1) * nh + h] };
                dt[t * nh + h] = dt_h;
                cum[t * nh + h] = prev + (dt_h * p.a[h]) as f64;
            }
        }
        let mut cb = vec![0f32; len * len];
        cb.par_chunks_mut(len).enumerate().for_each(|(t, row)| {
            let c_t = &input.c[(start + t) * n..(start + t + 1) * n];
            for (s, v) in row.iter_mut().enumerate().take(t + 1) {
                *v = dot(c_t, &input.b[(start + s) * n..(start + s + 1) * n]);
            }
        });
        Self { len, dt, cum, cb }
    }
}

impl SelectiveScan for Chunked {
    fn scan(
        &self,
        p: &ScanParams,
        input: &ScanInput,
        state: &mut [f32],
        y: &mut [f32],
    ) -> Result<()> {
        let seq_len = check_shapes(p, input, state, y)?;
        let (inner, hd, n, nh) = (p.inner(), p.headdim, p.d_state, p.nheads);

        let mut start = 0;
        while start < seq_len {
            let end = usize::min(start + self.chunk_size, seq_len);
            let terms = ChunkTerms::new(p, input, start, end);

            // Every position of the chunk only depends on the state at the chunk start.
            let s0: &[f32] = state;
            y[start * inner..end * inner].par_chunks_mut(inner).enumerate().for_each(
                |(t, y_t)| {
                    let c_t = &input.c[(start + t) * n..(start + t + 1) * n];
                    for h in 0..nh {
                        let cum_t = terms.cum[t * nh + h];
                        let carry = cum_t.exp() as f32;
                        for i in h * hd..(h + 1) * hd {
                            let mut acc = carry * dot(&s0[i * n..(i + 1) * n], c_t);
                            for s in 0..=t {
                                let w = (cum_t - terms.cum[s * nh + h]).exp() as f32
                                    * terms.dt[s * nh + h]
                                    * terms.cb[t * terms.len + s];
                                acc += w * input.x[(start + s) * inner + i];
                            }
                            y_t[i] = acc + p.d[h] * input.x[(start + t) * inner + i];
                        }
                    }
                },
            );

            // Fold the chunk into the carried state before moving on.
            let last = terms.len - 1;
            state.par_chunks_mut(hd * n).enumerate().for_each(|(h, s_h)| {
                let cum_last = terms.cum[last * nh + h];
                let chunk_decay = cum_last.exp() as f32;
                for v in s_h.iter_mut() {
                    *v *= chunk_decay;
                }
                for s in 0..terms.len {
                    let w = (cum_last - terms.cum[s * nh + h]).exp() as f32 * terms.dt[s * nh + h];
                    let b_s = &input.b[(start + s) * n..(start + s + 1) * n];
                    for pi in 0..hd {
                        let wx = w * input.x[(start + s) * inner + h * hd + pi];
                        let row = &mut s_h[pi * n..(pi + 1) * n];
                        for (r, b) in row.iter_mut().zip(b_s.iter()) {
                            *r += wx * b;
                        }
                    }
                }
            });
            start = end;
        }
        Ok(())
    }
}

/// Scan strategy selectable from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Sequential,
    Chunked,
}

impl ScanKind {
    pub fn scan(
        self,
        chunk_size: usize,
        p: &ScanParams,
        input: &ScanInput,
        state: &mut [f32],
        y: &mut [f32],
    ) -> Result<()> {
        match self {
            Self::Sequential => Sequential.scan(p, input, state, y),
            Self::Chunked => Chunked::new(chunk_size)?.scan(p, input, state, y),
        }
    }
}

impl std::str::FromStr for ScanKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "chunked" => Ok(Self::Chunked),
            _ => Err(Error::InvalidConfig(format!("unknown scan strategy {s:?}"))),
        }
    }
}
