//! Causal depthwise convolution in front of the scan.
//!
//! Each channel is convolved with its own kernel of width `K` and only sees the current and
//! the `K - 1` previous positions. Both the bulk and the streaming forms go through
//! [CausalDepthwiseConv::apply_window] on `K` contiguous rows, so a step computed from a
//! cached window is the exact same arithmetic as the bulk output at that position.
use rayon::prelude::*;

use crate::error::{check_len, Error, Result};
use crate::model::{silu, silu_in_place};

#[derive(Debug, Clone, PartialEq)]
pub struct CausalDepthwiseConv {
    // [channels, kernel]
    w: Vec<f32>,
    bias: Vec<f32>,
    channels: usize,
    kernel: usize,
}

impl CausalDepthwiseConv {
    pub fn new(w: Vec<f32>, bias: Vec<f32>, channels: usize, kernel: usize) -> Result<Self> {
        if kernel == 0 {
            return Err(Error::InvalidConfig("conv kernel width must be positive".to_string()));
        }
        check_len("conv1d weight", channels * kernel, w.len())?;
        check_len("conv1d bias", channels, bias.len())?;
        Ok(Self { w, bias, channels, kernel })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn weight(&self) -> &[f32] {
        &self.w
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Length of the cached window, `(K - 1) * channels`.
    pub fn window_len(&self) -> usize {
        (self.kernel - 1) * self.channels
    }

    /// Pre-activation output for the last row of `window`, which holds `K` rows oldest first.
    fn apply_window(&self, out: &mut [f32], window: &[f32]) {
        let (k, ch) = (self.kernel, self.channels);
        out.copy_from_slice(&self.bias);
        for j in 0..k {
            let row = &window[j * ch..(j + 1) * ch];
            for (c, (o, x)) in out.iter_mut().zip(row.iter()).enumerate() {
                *o += self.w[c * k + j] * x
            }
        }
    }

    /// Convolves a whole sequence `[seq_len, channels]`, left-padded with `K - 1` zero rows.
    ///
    /// Returns the activated output together with the last `K - 1` rows of the padded input,
    /// which is the window a streaming continuation starts from.
    pub fn forward(&self, xs: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let ch = self.channels;
        if xs.len() % ch != 0 {
            return Err(Error::shape("conv input length", ch, xs.len()));
        }
        let seq_len = xs.len() / ch;
        let pad = self.window_len();
        let mut padded = vec![0f32; pad + xs.len()];
        padded[pad..].copy_from_slice(xs);

        let mut out = vec![0f32; xs.len()];
        out.par_chunks_mut(ch).enumerate().for_each(|(t, out)| {
            self.apply_window(out, &padded[t * ch..(t + self.kernel) * ch]);
            silu_in_place(out);
        });
        let window = padded[seq_len * ch..].to_vec();
        Ok((out, window))
    }

    /// Consumes one new row against the cached `window` and shifts it in.
    pub fn step(&self, window: &mut [f32], x: &[f32]) -> Result<Vec<f32>> {
        check_len("conv window", self.window_len(), window.len())?;
        check_len("conv step input", self.channels, x.len())?;
        let mut full = Vec::with_capacity(window.len() + x.len());
        full.extend_from_slice(window);
        full.extend_from_slice(x);

        let mut out = vec![0f32; self.channels];
        self.apply_window(&mut out, &full);
        for o in out.iter_mut() {
            *o = silu(*o);
        }
        // Drop the oldest row.
        window.copy_from_slice(&full[self.channels..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(w: Vec<f32>, channels: usize, kernel: usize) -> CausalDepthwiseConv {
        CausalDepthwiseConv::new(w, vec![0.0; channels], channels, kernel).unwrap()
    }

    #[test]
    fn forward_is_causal() {
        // Only the current position contributes with kernel [0, 0, 0, 1].
        let c = conv(vec![0.0, 0.0, 0.0, 1.0], 1, 4);
        let mut xs = vec![0f32; 8];
        xs[0] = 1.0;
        let (out, window) = c.forward(&xs).unwrap();
        assert!((out[0] - silu(1.0)).abs() < 1e-6);
        for &v in &out[1..] {
            assert!(v.abs() < 1e-6, "expected 0 after the impulse, got {v}");
        }
        assert_eq!(window, vec![0.0; 3]);
    }

    #[test]
    fn forward_sees_past_rows() {
        // Kernel [1, 0, 0, 0] reads the row three steps back.
        let c = conv(vec![1.0, 0.0, 0.0, 0.0], 1, 4);
        let (out, window) = c.forward(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 0.0);
        assert!((out[3] - silu(1.0)).abs() < 1e-6);
        assert!((out[4] - silu(2.0)).abs() < 1e-6);
        assert_eq!(window, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn short_context_window_keeps_padding() {
        let c = conv(vec![1.0; 8], 2, 4);
        let (_, window) = c.forward(&[1.0, 2.0]).unwrap();
        assert_eq!(window, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn step_shifts_window() {
        // Window [1] plus new row 2 with kernel [3, 5]: 3 * 1 + 5 * 2 = 13.
        let c = conv(vec![3.0, 5.0], 1, 2);
        let mut window = vec![1.0];
        let out = c.step(&mut window, &[2.0]).unwrap();
        assert!((out[0] - silu(13.0)).abs() < 1e-5);
        assert_eq!(window, vec![2.0]);
    }

    #[test]
    fn step_matches_forward() {
        let (channels, kernel) = (3, 4);
        let w: Vec<f32> = (0..channels * kernel).map(|i| (i as f32 * 0.37).sin()).collect();
        let bias = vec![0.1, -0.2, 0.3];
        let c = CausalDepthwiseConv::new(w, bias, channels, kernel).unwrap();
        let xs: Vec<f32> = (0..7 * channels).map(|i| (i as f32 * 0.11).cos()).collect();
        let (bulk, bulk_window) = c.forward(&xs).unwrap();

        let mut window = vec![0f32; c.window_len()];
        for (t, x) in xs.chunks(channels).enumerate() {
            let out = c.step(&mut window, x).unwrap();
            assert_eq!(out.as_slice(), &bulk[t * channels..(t + 1) * channels]);
        }
        assert_eq!(window, bulk_window);
    }

    #[test]
    fn kernel_one_has_empty_window() {
        let c = conv(vec![2.0, 2.0], 2, 1);
        let (out, window) = c.forward(&[1.0, 1.0]).unwrap();
        assert!(window.is_empty());
        let mut empty = vec![];
        let step = c.step(&mut empty, &[1.0, 1.0]).unwrap();
        assert_eq!(out, step);
    }

    #[test]
    fn rejects_bad_shapes() {
        let c = conv(vec![1.0; 8], 2, 4);
        assert!(c.forward(&[1.0; 3]).is_err());
        let mut window = vec![0.0; 5];
        assert!(c.step(&mut window, &[1.0, 1.0]).is_err());
        let mut window = vec![0.0; 6];
        assert!(c.step(&mut window, &[1.0]).is_err());
    }

    #[test]
    fn rejects_zero_kernel() {
        let err = CausalDepthwiseConv::new(vec![], vec![0.0; 2], 2, 0);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }
}
