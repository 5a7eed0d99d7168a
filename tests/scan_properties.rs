use mamba2::scan::{step_update, Chunked, ScanInput, ScanParams, SelectiveScan, Sequential};
use rand::{rngs::StdRng, Rng, SeedableRng};

struct Case {
    nheads: usize,
    headdim: usize,
    d_state: usize,
    a: Vec<f32>,
    d: Vec<f32>,
    dt_bias: Vec<f32>,
    x: Vec<f32>,
    dt: Vec<f32>,
    b: Vec<f32>,
    c: Vec<f32>,
}

impl Case {
    fn random(rng: &mut StdRng, seq_len: usize) -> Self {
        let nheads = rng.gen_range(1..4);
        let headdim = rng.gen_range(1..5);
        let d_state = rng.gen_range(1..6);
        let mut v = |len: usize, lo: f32, hi: f32| -> Vec<f32> {
            (0..len).map(|_| rng.gen_range(lo..hi)).collect()
        };
        Self {
            nheads,
            headdim,
            d_state,
            // Same A_log range as the initializer uses, and some faster decays.
            a: v(nheads, -0.5, 1.5).into_iter().map(|a_log| -a_log.exp()).collect(),
            d: v(nheads, -1.0, 1.0),
            dt_bias: v(nheads, -4.0, 0.0),
            x: v(seq_len * nheads * headdim, -2.0, 2.0),
            dt: v(seq_len * nheads, -3.0, 3.0),
            b: v(seq_len * d_state, -1.0, 1.0),
            c: v(seq_len * d_state, -1.0, 1.0),
        }
    }

    fn params(&self) -> ScanParams<'_> {
        ScanParams {
            a: &self.a,
            d: &self.d,
            dt_bias: &self.dt_bias,
            nheads: self.nheads,
            headdim: self.headdim,
            d_state: self.d_state,
        }
    }

    fn run(&self, strategy: &dyn SelectiveScan) -> (Vec<f32>, Vec<f32>) {
        let input = ScanInput { x: &self.x, dt: &self.dt, b: &self.b, c: &self.c };
        let mut state = vec![0f32; self.nheads * self.headdim * self.d_state];
        let mut y = vec![0f32; self.x.len()];
        strategy.scan(&self.params(), &input, &mut state, &mut y).unwrap();
        (y, state)
    }
}

fn assert_close(a: &[f32], b: &[f32], what: &str) {
    assert_eq!(a.len(), b.len());
    for (i, (a, b)) in a.iter().zip(b.iter()).enumerate() {
        let tol = 1e-4 * a.abs().max(b.abs()).max(1.0);
        assert!((a - b).abs() <= tol, "{what}[{i}]: {a} vs {b}");
    }
}

#[test]
fn every_chunk_size_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(2024);
    for _ in 0..20 {
        let seq_len = rng.gen_range(1..25);
        let case = Case::random(&mut rng, seq_len);
        let (y_seq, s_seq) = case.run(&Sequential);
        for chunk_size in 1..=seq_len {
            let (y, s) = case.run(&Chunked::new(chunk_size).unwrap());
            assert_close(&y, &y_seq, &format!("y, len {seq_len} chunk {chunk_size}"));
            assert_close(&s, &s_seq, &format!("state, len {seq_len} chunk {chunk_size}"));
        }
    }
}

#[test]
fn decay_stays_in_unit_interval() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..10 {
        let case = Case::random(&mut rng, 50);
        let p = case.params();
        for dt in case.dt.chunks(case.nheads) {
            for (h, &raw) in dt.iter().enumerate() {
                let (dt_h, decay) = p.discretize(h, raw);
                assert!(dt_h > 0.0);
                assert!(decay > 0.0 && decay <= 1.0, "decay {decay}");
            }
        }
    }
}

#[test]
fn state_is_bounded_under_unit_inputs() {
    // dt = softplus(0) = ln 2 and A = -1, so the decay is 1/2 and the state converges to
    // dt / (1 - 1/2) for unit x and B.
    let (nheads, headdim, d_state) = (2, 3, 4);
    let a = vec![-1.0; nheads];
    let p = ScanParams {
        a: &a,
        d: &[0.0, 0.0],
        dt_bias: &[0.0, 0.0],
        nheads,
        headdim,
        d_state,
    };
    let limit = 2.0 * std::f32::consts::LN_2;
    let x = vec![1.0; nheads * headdim];
    let dt = vec![0.0; nheads];
    let ones = vec![1.0; d_state];
    let mut state = vec![0f32; nheads * headdim * d_state];
    let mut y = vec![0f32; nheads * headdim];
    for _ in 0..5000 {
        step_update(&p, &x, &dt, &ones, &ones, &mut state, &mut y);
        for &s in state.iter() {
            assert!(s.is_finite() && s <= limit * (1.0 + 1e-5), "state {s} above {limit}");
        }
    }
    for &s in state.iter() {
        assert!((s - limit).abs() < 1e-5, "state {s} did not converge to {limit}");
    }
    for &v in y.iter() {
        assert!((v - limit * d_state as f32).abs() < 1e-4);
    }
}
