use rayon::prelude::*;

use crate::config::Mamba2Config;
use crate::error::{check_len, Error, Result};
use crate::model::ProjectedInput;
use crate::scan::{step_update, ScanInput, ScanParams};
use crate::session::{InferenceSession, RecurrentState};
use crate::weights::LayerWeights;

/// A batch of sequences of `width` wide feature vectors.
///
/// Each sequence is stored flattened, row-major over time. Sequences of a batch may have
/// different lengths, they are always processed independently.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    width: usize,
    sequences: Vec<Vec<f32>>,
}

impl SequenceBatch {
    pub fn new(width: usize, sequences: Vec<Vec<f32>>) -> Result<Self> {
        if width == 0 {
            return Err(Error::InvalidConfig("sequence width must be positive".to_string()));
        }
        for s in sequences.iter() {
            if s.len() % width != 0 {
                return Err(Error::shape("flattened sequence length", width, s.len()));
            }
        }
        Ok(Self { width, sequences })
    }

    /// Builds a batch from nested `[batch][time][width]` vectors.
    pub fn from_vectors(width: usize, batch: &[Vec<Vec<f32>>]) -> Result<Self> {
        let mut sequences = Vec::with_capacity(batch.len());
        for seq in batch.iter() {
            let mut flat = Vec::with_capacity(seq.len() * width);
            for v in seq.iter() {
                check_len("feature vector width", width, v.len())?;
                flat.extend_from_slice(v);
            }
            sequences.push(flat);
        }
        Self::new(width, sequences)
    }

    pub fn filled(batch_size: usize, seq_len: usize, width: usize, value: f32) -> Result<Self> {
        Self::new(width, vec![vec![value; seq_len * width]; batch_size])
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn batch_size(&self) -> usize {
        self.sequences.len()
    }

    pub fn seq_len(&self, i: usize) -> usize {
        self.sequences[i].len() / self.width
    }

    pub fn sequence(&self, i: usize) -> &[f32] {
        &self.sequences[i]
    }

    pub fn sequences(&self) -> &[Vec<f32>] {
        &self.sequences
    }

    /// Feature vector of sequence `i` at timestep `t`.
    pub fn row(&self, i: usize, t: usize) -> &[f32] {
        &self.sequences[i][t * self.width..(t + 1) * self.width]
    }

    /// `(batch, seq_len, width)` when every sequence has the same length.
    pub fn shape(&self) -> Option<(usize, usize, usize)> {
        let seq_len = self.sequences.first().map_or(0, |s| s.len() / self.width);
        if self.sequences.iter().all(|s| s.len() == seq_len * self.width) {
            Some((self.batch_size(), seq_len, self.width))
        } else {
            None
        }
    }

    /// Timesteps `start..end` of every sequence.
    pub fn narrow(&self, start: usize, end: usize) -> Result<Self> {
        let mut sequences = Vec::with_capacity(self.sequences.len());
        for (i, s) in self.sequences.iter().enumerate() {
            let len = self.seq_len(i);
            if start > end || end > len {
                return Err(Error::shape("narrowed sequence length", end, len));
            }
            sequences.push(s[start * self.width..end * self.width].to_vec());
        }
        Ok(Self { width: self.width, sequences })
    }

    pub fn into_sequences(self) -> Vec<Vec<f32>> {
        self.sequences
    }
}

/// One Mamba2 mixer layer: input projection, causal convolution, selective scan, gated
/// normalization and output projection.
#[derive(Debug, Clone)]
pub struct Mamba2Layer {
    layer_idx: usize,
    cfg: Mamba2Config,
    weights: LayerWeights,
}

impl Mamba2Layer {
    /// Builds a layer from existing weights. The normalization epsilon and gate order are
    /// taken from `cfg`, whatever config the weights were created with.
    pub fn new(layer_idx: usize, cfg: Mamba2Config, mut weights: LayerWeights) -> Result<Self> {
        cfg.validate()?;
        check_len("in_proj input", cfg.d_model, weights.in_proj.in_dim())?;
        check_len("in_proj output", cfg.d_in_proj(), weights.in_proj.out_dim())?;
        check_len("out_proj input", cfg.d_inner(), weights.out_proj.in_dim())?;
        check_len("out_proj output", cfg.d_model, weights.out_proj.out_dim())?;
        check_len("conv1d channels", cfg.conv_dim(), weights.conv1d.channels())?;
        check_len("conv1d kernel", cfg.d_conv, weights.conv1d.kernel())?;
        check_len("norm weight", cfg.d_inner(), weights.norm.weight().len())?;
        check_len("A_log", cfg.nheads(), weights.a.len())?;
        weights.norm = weights.norm.with_options(cfg.norm_eps, cfg.norm_before_gate);
        Ok(Self { layer_idx, cfg, weights })
    }

    pub fn init<R: rand::Rng>(layer_idx: usize, cfg: Mamba2Config, rng: &mut R) -> Result<Self> {
        let weights = LayerWeights::init(&cfg, rng)?;
        Self::new(layer_idx, cfg, weights)
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn config(&self) -> &Mamba2Config {
        &self.cfg
    }

    pub fn weights(&self) -> &LayerWeights {
        &self.weights
    }

    pub fn scan_params(&self) -> ScanParams<'_> {
        ScanParams {
            a: &self.weights.a,
            d: &self.weights.d,
            dt_bias: &self.weights.dt_bias,
            nheads: self.cfg.nheads(),
            headdim: self.cfg.headdim,
            d_state: self.cfg.d_state,
        }
    }

    /// Opens a streaming session on this layer, see [InferenceSession].
    pub fn begin(&self, batch_size: usize) -> InferenceSession<'_> {
        InferenceSession::begin(self, batch_size)
    }

    /// Bulk forward pass over every sequence of the batch, starting from a zero state.
    pub fn forward(&self, batch: &SequenceBatch) -> Result<SequenceBatch> {
        check_len("input width", self.cfg.d_model, batch.width())?;
        tracing::debug!(layer = self.layer_idx, batch = batch.batch_size(), "bulk forward");
        let outputs = batch
            .sequences()
            .par_iter()
            .map(|xs| {
                let mut state = RecurrentState::zeros(&self.cfg);
                self.forward_sequence(xs, &mut state)
            })
            .collect::<Result<Vec<_>>>()?;
        SequenceBatch::new(self.cfg.d_model, outputs)
    }

    /// Bulk forward of one sequence `[seq_len, d_model]` from a fresh state.
    ///
    /// On return `state` holds the convolution window and ssm state reached at the end of
    /// the sequence.
    pub(crate) fn forward_sequence(
        &self,
        xs: &[f32],
        state: &mut RecurrentState,
    ) -> Result<Vec<f32>> {
        let cfg = &self.cfg;
        if xs.len() % cfg.d_model != 0 {
            return Err(Error::shape("flattened input length", cfg.d_model, xs.len()));
        }
        let seq_len = xs.len() / cfg.d_model;
        let (d_inner, conv_dim, nheads, n) =
            (cfg.d_inner(), cfg.conv_dim(), cfg.nheads(), cfg.d_state);

        let zxbcdt = self.weights.in_proj.forward_checked(xs)?;
        let mut z = Vec::with_capacity(seq_len * d_inner);
        let mut xbc = Vec::with_capacity(seq_len * conv_dim);
        let mut dt = Vec::with_capacity(seq_len * nheads);
        for row in zxbcdt.chunks_exact(cfg.d_in_proj()) {
            let p = ProjectedInput::split(cfg, row)?;
            z.extend_from_slice(p.z);
            xbc.extend_from_slice(p.xbc);
            dt.extend_from_slice(p.dt);
        }

        let (xbc, window) = self.weights.conv1d.forward(&xbc)?;
        let mut x = Vec::with_capacity(seq_len * d_inner);
        let mut b = Vec::with_capacity(seq_len * n);
        let mut c = Vec::with_capacity(seq_len * n);
        for row in xbc.chunks_exact(conv_dim) {
            let (x_t, bc) = row.split_at(d_inner);
            x.extend_from_slice(x_t);
            b.extend_from_slice(&bc[..n]);
            c.extend_from_slice(&bc[n..]);
        }

        let mut y = vec![0f32; seq_len * d_inner];
        let input = ScanInput { x: &x, dt: &dt, b: &b, c: &c };
        cfg.scan.scan(cfg.chunk_size, &self.scan_params(), &input, state.ssm_mut(), &mut y)?;
        state.conv_mut().copy_from_slice(&window);

        Ok(self.gate_and_project(&y, &z))
    }

    /// Streaming forward of a single `d_model` wide row against `state`.
    pub(crate) fn step_one(&self, x: &[f32], state: &mut RecurrentState) -> Result<Vec<f32>> {
        let cfg = &self.cfg;
        check_len("input width", cfg.d_model, x.len())?;
        let (d_inner, n) = (cfg.d_inner(), cfg.d_state);

        let zxbcdt = self.weights.in_proj.forward_checked(x)?;
        let p = ProjectedInput::split(cfg, &zxbcdt)?;
        let xbc = self.weights.conv1d.step(state.conv_mut(), p.xbc)?;
        let (x_t, bc) = xbc.split_at(d_inner);

        let mut y = vec![0f32; d_inner];
        step_update(&self.scan_params(), x_t, p.dt, &bc[..n], &bc[n..], state.ssm_mut(), &mut y);
        Ok(self.gate_and_project(&y, p.z))
    }

    fn gate_and_project(&self, y: &[f32], z: &[f32]) -> Vec<f32> {
        let d_inner = self.cfg.d_inner();
        let mut normed = vec![0f32; y.len()];
        for ((o, y), z) in
            normed.chunks_exact_mut(d_inner).zip(y.chunks_exact(d_inner)).zip(z.chunks_exact(d_inner))
        {
            self.weights.norm.forward_one(o, y, z);
        }
        let rows = y.len() / d_inner;
        let mut out = vec![0f32; rows * self.cfg.d_model];
        self.weights.out_proj.forward(&mut out, &normed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn layer() -> Mamba2Layer {
        let cfg = Mamba2Config { d_model: 4, d_state: 4, headdim: 4, chunk_size: 2, ..Default::default() };
        Mamba2Layer::init(0, cfg, &mut StdRng::seed_from_u64(0)).unwrap()
    }

    #[test]
    fn forward_shape() {
        let layer = layer();
        let batch = SequenceBatch::filled(2, 6, 4, 1.0).unwrap();
        let out = layer.forward(&batch).unwrap();
        assert_eq!(out.shape(), Some((2, 6, 4)));
        assert!(out.sequence(0).iter().all(|v| v.is_finite()));
        assert_eq!(out.sequence(0), out.sequence(1));
    }

    #[test]
    fn forward_is_causal() {
        let layer = layer();
        let mut rng = StdRng::seed_from_u64(5);
        let xs: Vec<f32> = (0..8 * 4).map(|_| rand::Rng::gen_range(&mut rng, -1.0..1.0)).collect();
        let mut ys = xs.clone();
        for v in ys[5 * 4..].iter_mut() {
            *v += 1.0;
        }
        let a = layer.forward(&SequenceBatch::new(4, vec![xs]).unwrap()).unwrap();
        let b = layer.forward(&SequenceBatch::new(4, vec![ys]).unwrap()).unwrap();
        assert_eq!(&a.sequence(0)[..5 * 4], &b.sequence(0)[..5 * 4]);
        assert_ne!(&a.sequence(0)[5 * 4..], &b.sequence(0)[5 * 4..]);
    }

    #[test]
    fn ragged_batch() {
        let layer = layer();
        let batch = SequenceBatch::new(4, vec![vec![0.5; 12], vec![0.5; 20], vec![]]).unwrap();
        let out = layer.forward(&batch).unwrap();
        assert_eq!(out.shape(), None);
        assert_eq!(out.seq_len(0), 3);
        assert_eq!(out.seq_len(1), 5);
        assert_eq!(out.seq_len(2), 0);
        assert_eq!(out.sequence(0), &out.sequence(1)[..12]);
    }

    #[test]
    fn rejects_wrong_width() {
        let layer = layer();
        let batch = SequenceBatch::filled(1, 3, 5, 1.0).unwrap();
        assert!(matches!(layer.forward(&batch), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn rejects_mismatched_weights() {
        let layer = layer();
        let cfg = Mamba2Config { d_state: 8, ..layer.config().clone() };
        let err = Mamba2Layer::new(1, cfg, layer.weights().clone());
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn new_applies_norm_options_from_config() {
        let a = layer();
        let cfg = Mamba2Config { norm_before_gate: false, norm_eps: 10.0, ..a.config().clone() };
        let b = Mamba2Layer::new(1, cfg, a.weights().clone()).unwrap();
        assert_eq!(b.weights().norm.eps(), 10.0);
        assert!(!b.weights().norm.norm_before_gate());

        let mut rng = StdRng::seed_from_u64(6);
        let xs: Vec<f32> = (0..5 * 4).map(|_| rand::Rng::gen_range(&mut rng, -1.0..1.0)).collect();
        let batch = SequenceBatch::new(4, vec![xs]).unwrap();
        assert_ne!(a.forward(&batch).unwrap(), b.forward(&batch).unwrap());
    }

    #[test]
    fn batch_helpers() {
        let batch = SequenceBatch::from_vectors(2, &[vec![vec![1.0, 2.0], vec![3.0, 4.0]]]).unwrap();
        assert_eq!(batch.row(0, 1), &[3.0, 4.0]);
        assert_eq!(batch.narrow(1, 2).unwrap().sequence(0), &[3.0, 4.0]);
        assert!(batch.narrow(1, 3).is_err());
        assert!(SequenceBatch::from_vectors(2, &[vec![vec![1.0]]]).is_err());
        assert!(SequenceBatch::new(2, vec![vec![1.0; 3]]).is_err());
    }
}
