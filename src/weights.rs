//! Parameters of one layer, their initialization and the flat checkpoint format.
//!
//! A checkpoint is a plain little-endian f32 dump of the tensors below, in this order and
//! without any header:
//!
//! | tensor         | shape                  |
//! |----------------|------------------------|
//! | `in_proj`      | `[d_in_proj, d_model]` |
//! | `conv1d_weight`| `[conv_dim, d_conv]`   |
//! | `conv1d_bias`  | `[conv_dim]`           |
//! | `dt_bias`      | `[nheads]`             |
//! | `a_log`        | `[nheads]`             |
//! | `d`            | `[nheads]`             |
//! | `norm_weight`  | `[d_inner]`            |
//! | `out_proj`     | `[d_model, d_inner]`   |
use std::io::Write;

use rand::Rng;

use crate::config::Mamba2Config;
use crate::conv::CausalDepthwiseConv;
use crate::error::{check_len, Error, Result};
use crate::model::{GatedRmsNorm, LinearNoBias};

#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub(crate) in_proj: LinearNoBias,
    pub(crate) conv1d: CausalDepthwiseConv,
    pub(crate) dt_bias: Vec<f32>,
    pub(crate) a_log: Vec<f32>,
    pub(crate) d: Vec<f32>,
    pub(crate) norm: GatedRmsNorm,
    pub(crate) out_proj: LinearNoBias,
    // -exp(a_log), always negative.
    pub(crate) a: Vec<f32>,
}

/// Number of f32 values in a checkpoint for `cfg`.
pub fn flat_len(cfg: &Mamba2Config) -> usize {
    cfg.d_in_proj() * cfg.d_model
        + cfg.conv_dim() * cfg.d_conv
        + cfg.conv_dim()
        + 3 * cfg.nheads()
        + cfg.d_inner()
        + cfg.d_model * cfg.d_inner()
}

/// Inverse of softplus, `dt + ln(1 - exp(-dt))` written with `expm1` to stay exact near 0.
pub fn inv_softplus(dt: f32) -> f32 {
    dt + (-(-dt).exp_m1()).ln()
}

fn uniform<R: Rng>(rng: &mut R, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    if hi > lo {
        (0..len).map(|_| rng.gen_range(lo..hi)).collect()
    } else {
        vec![lo; len]
    }
}

impl LayerWeights {
    /// Random initialization following the usual Mamba2 recipe.
    ///
    /// Projections and the convolution use the `1/sqrt(fan_in)` uniform bound, `dt` is drawn
    /// log-uniformly in `[dt_min, dt_max]`, floored at `dt_init_floor` and stored through its
    /// inverse softplus, `A` is uniform in `a_init_range` and stored as its log.
    pub fn init<R: Rng>(cfg: &Mamba2Config, rng: &mut R) -> Result<Self> {
        cfg.validate()?;
        let (d_model, d_inner, conv_dim, nheads) =
            (cfg.d_model, cfg.d_inner(), cfg.conv_dim(), cfg.nheads());

        let bound = 1.0 / (d_model as f32).sqrt();
        let in_proj = uniform(rng, cfg.d_in_proj() * d_model, -bound, bound);

        let bound = 1.0 / (cfg.d_conv as f32).sqrt();
        let conv1d_weight = uniform(rng, conv_dim * cfg.d_conv, -bound, bound);
        let conv1d_bias = uniform(rng, conv_dim, -bound, bound);

        let (log_min, log_max) = (cfg.dt_min.ln(), cfg.dt_max.ln());
        let dt_bias: Vec<f32> = uniform(rng, nheads, 0.0, 1.0)
            .into_iter()
            .map(|u| {
                let dt = (u * (log_max - log_min) + log_min).exp().max(cfg.dt_init_floor);
                inv_softplus(dt)
            })
            .collect();

        let (a_lo, a_hi) = cfg.a_init_range;
        let a_log: Vec<f32> = uniform(rng, nheads, a_lo, a_hi).into_iter().map(f32::ln).collect();

        let bound = 1.0 / (d_inner as f32).sqrt();
        let out_proj = uniform(rng, d_model * d_inner, -bound, bound);

        Self::from_parts(
            cfg,
            in_proj,
            conv1d_weight,
            conv1d_bias,
            dt_bias,
            a_log,
            vec![1.0; nheads],
            vec![1.0; d_inner],
            out_proj,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        cfg: &Mamba2Config,
        in_proj: Vec<f32>,
        conv1d_weight: Vec<f32>,
        conv1d_bias: Vec<f32>,
        dt_bias: Vec<f32>,
        a_log: Vec<f32>,
        d: Vec<f32>,
        norm_weight: Vec<f32>,
        out_proj: Vec<f32>,
    ) -> Result<Self> {
        let nheads = cfg.nheads();
        check_len("dt_bias", nheads, dt_bias.len())?;
        check_len("a_log", nheads, a_log.len())?;
        check_len("D", nheads, d.len())?;
        check_len("norm weight", cfg.d_inner(), norm_weight.len())?;
        let in_proj = LinearNoBias::new(in_proj, cfg.d_model, cfg.d_in_proj())?;
        let conv1d =
            CausalDepthwiseConv::new(conv1d_weight, conv1d_bias, cfg.conv_dim(), cfg.d_conv)?;
        let out_proj = LinearNoBias::new(out_proj, cfg.d_inner(), cfg.d_model)?;
        let norm = GatedRmsNorm::new(norm_weight, cfg.norm_eps, cfg.norm_before_gate);
        let a = a_log.iter().map(|v| -v.exp()).collect();
        Ok(Self { in_proj, conv1d, dt_bias, a_log, d, norm, out_proj, a })
    }

    /// Splits a flat checkpoint into tensors, see the module docs for the layout.
    pub fn from_flat(cfg: &Mamba2Config, values: &[f32]) -> Result<Self> {
        cfg.validate()?;
        check_len("flat weights", flat_len(cfg), values.len())?;
        let mut rest = values;
        let mut take = |n: usize| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head.to_vec()
        };
        let (d_inner, conv_dim, nheads) = (cfg.d_inner(), cfg.conv_dim(), cfg.nheads());
        Self::from_parts(
            cfg,
            take(cfg.d_in_proj() * cfg.d_model),
            take(conv_dim * cfg.d_conv),
            take(conv_dim),
            take(nheads),
            take(nheads),
            take(nheads),
            take(d_inner),
            take(cfg.d_model * d_inner),
        )
    }

    pub fn to_flat(&self) -> Vec<f32> {
        let parts: [&[f32]; 8] = [
            self.in_proj.weight(),
            self.conv1d.weight(),
            self.conv1d.bias(),
            &self.dt_bias,
            &self.a_log,
            &self.d,
            self.norm.weight(),
            self.out_proj.weight(),
        ];
        parts.concat()
    }

    /// Loads a checkpoint written by [LayerWeights::save].
    pub fn from_file<P: AsRef<std::path::Path>>(cfg: &Mamba2Config, p: P) -> Result<Self> {
        let file = std::fs::File::open(p)?;
        // The mapping only lives while the values are copied out.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        if mmap.len() % 4 != 0 {
            return Err(Error::shape("weights file bytes", flat_len(cfg) * 4, mmap.len()));
        }
        let values: Vec<f32> = mmap
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::from_flat(cfg, &values)
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, p: P) -> Result<()> {
        let file = std::fs::File::create(p)?;
        let mut w = std::io::BufWriter::new(file);
        for v in self.to_flat() {
            w.write_all(&v.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Per-head decay rates `-exp(A_log)`.
    pub fn a(&self) -> &[f32] {
        &self.a
    }

    pub fn dt_bias(&self) -> &[f32] {
        &self.dt_bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::softplus;
    use rand::{rngs::StdRng, SeedableRng};

    fn small_config() -> Mamba2Config {
        Mamba2Config { d_model: 4, d_state: 4, headdim: 4, ..Default::default() }
    }

    #[test]
    fn inv_softplus_round_trips() {
        for &dt in &[1e-4f32, 1e-3, 0.01, 0.1, 1.0] {
            let back = softplus(inv_softplus(dt));
            assert!((back - dt).abs() <= 1e-3 * dt, "dt {dt} came back as {back}");
        }
    }

    #[test]
    fn init_respects_ranges() {
        let cfg = small_config();
        let w = LayerWeights::init(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(w.to_flat().len(), flat_len(&cfg));
        for &a in w.a() {
            assert!(a < 0.0 && (-1.1001..=-0.9999).contains(&a), "A = {a}");
        }
        for &b in w.dt_bias() {
            let dt = softplus(b);
            assert!((cfg.dt_init_floor * 0.999..=cfg.dt_max * 1.001).contains(&dt), "dt = {dt}");
        }
        assert_eq!(w.d, vec![1.0; cfg.nheads()]);
    }

    #[test]
    fn dt_floor_is_applied() {
        let cfg = Mamba2Config { dt_min: 1e-6, dt_max: 1e-6, ..small_config() };
        let w = LayerWeights::init(&cfg, &mut StdRng::seed_from_u64(1)).unwrap();
        for &b in w.dt_bias() {
            assert!((softplus(b) - cfg.dt_init_floor).abs() < 1e-6);
        }
    }

    #[test]
    fn save_then_load() {
        let cfg = small_config();
        let w = LayerWeights::init(&cfg, &mut StdRng::seed_from_u64(2)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.bin");
        w.save(&path).unwrap();
        let loaded = LayerWeights::from_file(&cfg, &path).unwrap();
        assert_eq!(loaded, w);
    }

    #[test]
    fn from_flat_rejects_wrong_size() {
        let cfg = small_config();
        let values = vec![0f32; flat_len(&cfg) - 1];
        assert!(matches!(
            LayerWeights::from_flat(&cfg, &values),
            Err(Error::ShapeMismatch { what: "flat weights", .. })
        ));
    }
}
