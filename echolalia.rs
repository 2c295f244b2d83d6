// echolalia.rs
// A conversation that feeds on itself: ask the oracle, learn the answer, answer back.
// Every round trains a throwaway classifier from nothing; only the context memory remembers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

// BLAS FFI - activated with --features blas
#[cfg(feature = "blas")]
mod blas_ffi {
    // CblasRowMajor = 101, CblasNoTrans = 111, CblasTrans = 112
    extern "C" {
        pub fn cblas_sgemv(order: i32, trans: i32, m: i32, n: i32,
                           alpha: f32, a: *const f32, lda: i32,
                           x: *const f32, incx: i32,
                           beta: f32, y: *mut f32, incy: i32);
        pub fn cblas_sgemm(order: i32, trans_a: i32, trans_b: i32, m: i32, n: i32, k: i32,
                           alpha: f32, a: *const f32, lda: i32,
                           b: *const f32, ldb: i32,
                           beta: f32, c: *mut f32, ldc: i32);
    }
    pub unsafe fn sgemv(nout: usize, nin: usize, a: &[f32], x: &[f32], y: &mut [f32]) {
        unsafe {
            cblas_sgemv(101, 111, nout as i32, nin as i32,
                        1.0, a.as_ptr(), nin as i32,
                        x.as_ptr(), 1, 0.0, y.as_mut_ptr(), 1);
        }
    }
    // c[rows x cols] = b[rows x k] · a[cols x k]^T
    pub unsafe fn sgemm_nt(rows: usize, cols: usize, k: usize, b: &[f32], a: &[f32], c: &mut [f32]) {
        unsafe {
            cblas_sgemm(101, 111, 112, rows as i32, cols as i32, k as i32,
                        1.0, b.as_ptr(), k as i32,
                        a.as_ptr(), k as i32,
                        0.0, c.as_mut_ptr(), cols as i32);
        }
    }
}

const TERMINATORS: [u8; 3] = [b'.', b'!', b'?'];
const BANNER_ANSWER: &str = "----------------------------------------";
const BANNER_SAMPLED: &str = "****************************************";
const BANNER_REPLY: &str = "++++++++++++++++++++++++++++++++++++++++";

// ============================================================
// 0) CONFIG
// ============================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    endpoint: String, model: String, opening_query: String,
    seed: u64, memory_capacity: usize,
    beta1: f32, beta2: f32, learning_rate: f32, eps_adam: f32, grad_clip: f32,
    train_steps: usize, rollouts: usize,
    min_gen_len: usize, max_gen_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: "http://localhost:11434/api/generate".into(),
            model: "llama3.2".into(),
            opening_query: "Why is time symmetric at quantum scales by asymmetric at large scales?".into(),
            seed: 1, memory_capacity: 128 * 1024,
            beta1: 0.8, beta2: 0.89, learning_rate: 1.0e-3, eps_adam: 1e-8, grad_clip: 1.0,
            train_steps: 256, rollouts: 128,
            min_gen_len: 128, max_gen_len: 1024,
        }
    }
}

impl Config {
    fn load(path: &Path) -> Result<Self, LoopError> {
        let json = fs::read_to_string(path)
            .map_err(|source| LoopError::ConfigRead { path: path.to_path_buf(), source })?;
        serde_json::from_str(&json)
            .map_err(|source| LoopError::ConfigParse { path: path.to_path_buf(), source })
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Ask an oracle, learn its answer, feed the echo back")]
struct Cli {
    /// JSON config file; fields left out keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate endpoint, e.g. http://127.0.0.1:11434/api/generate
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Question asked in the first round
    #[arg(long)]
    query: Option<String>,

    /// Stop after this many rounds instead of running until killed
    #[arg(long)]
    rounds: Option<u64>,
}

impl Cli {
    fn resolve_config(&self) -> Result<Config, LoopError> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(endpoint) = &self.endpoint { cfg.endpoint = endpoint.clone(); }
        if let Some(model) = &self.model { cfg.model = model.clone(); }
        if let Some(query) = &self.query { cfg.opening_query = query.clone(); }
        Ok(cfg)
    }
}

// ============================================================
// 1) ERRORS + TRACING
// ============================================================

#[derive(Debug, thiserror::Error)]
enum LoopError {
    #[error("oracle request failed: {0}")]
    Oracle(#[source] Box<ureq::Error>),
    #[error("failed to read oracle stream: {0}")]
    Stream(#[from] std::io::Error),
    #[error("malformed oracle record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to read config {}: {source}", .path.display())]
    ConfigRead { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config {}: {source}", .path.display())]
    ConfigParse { path: PathBuf, source: serde_json::Error },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

// ============================================================
// 2) CONTEXT MIXER
// ============================================================

/// Stateful encoder from a byte history to a fixed-width context vector.
///
/// `mix` must be a pure function of the history so far; `Clone` is the copy
/// operation and must produce a fully independent mixer.
trait ContextMixer: Clone {
    fn add(&mut self, symbol: u8);
    fn mix(&self) -> Vec<f32>;
    fn width(&self) -> usize;
}

const HISTOGRAM_WINDOWS: [usize; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

#[derive(Clone)]
struct Histogram {
    counts: [u16; 256],
    window: Vec<u8>,
    cursor: usize,
    filled: usize,
}

impl Histogram {
    fn new(size: usize) -> Self {
        Histogram { counts: [0; 256], window: vec![0; size.max(1)], cursor: 0, filled: 0 }
    }

    fn add(&mut self, symbol: u8) {
        let cursor = (self.cursor + 1) % self.window.len();
        // slots are only evicted once every one of them holds a real symbol
        if self.filled == self.window.len() {
            self.counts[self.window[cursor] as usize] -= 1;
        } else {
            self.filled += 1;
        }
        self.window[cursor] = symbol;
        self.counts[symbol as usize] += 1;
        self.cursor = cursor;
    }
}

/// Eight sliding-window byte histograms, each normalized to a distribution.
#[derive(Clone)]
struct WindowMixer {
    histograms: Vec<Histogram>,
}

impl WindowMixer {
    fn new() -> Self {
        WindowMixer { histograms: HISTOGRAM_WINDOWS.iter().map(|&w| Histogram::new(w)).collect() }
    }
}

impl ContextMixer for WindowMixer {
    fn add(&mut self, symbol: u8) {
        for h in self.histograms.iter_mut() { h.add(symbol); }
    }

    fn mix(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.width());
        for h in &self.histograms {
            let sum: f32 = h.counts.iter().map(|&c| c as f32).sum();
            if sum == 0.0 {
                out.extend(std::iter::repeat(0.0).take(256));
                continue;
            }
            out.extend(h.counts.iter().map(|&c| c as f32 / sum));
        }
        out
    }

    fn width(&self) -> usize { self.histograms.len() * 256 }
}

// ============================================================
// 3) CONTEXT MEMORY - ring of (vector, symbol)
// ============================================================

#[derive(Clone, Default)]
struct MemoryEntry {
    vector: Vec<f32>,
    norm: f32,
    symbol: u8,
}

struct ContextMemory {
    entries: Vec<MemoryEntry>,
    cursor: usize,
}

impl ContextMemory {
    fn new(capacity: usize) -> Self {
        ContextMemory { entries: vec![MemoryEntry::default(); capacity.max(1)], cursor: 0 }
    }

    fn capacity(&self) -> usize { self.entries.len() }

    fn record(&mut self, vector: Vec<f32>, symbol: u8) {
        self.cursor = (self.cursor + 1) % self.entries.len();
        let norm = vector.iter().map(|&v| v * v).sum::<f32>().sqrt();
        self.entries[self.cursor] = MemoryEntry { vector, norm, symbol };
    }

    /// Valid entries only; symbol zero marks a slot that was never written.
    fn scan(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter().filter(|e| e.symbol != 0)
    }

    fn len(&self) -> usize { self.scan().count() }

    fn nearest(&self, query: &[f32]) -> Option<u8> {
        let query_norm = query.iter().map(|&v| v * v).sum::<f32>().sqrt();
        let mut best = 0.0f32;
        let mut symbol = None;
        for entry in self.scan() {
            let cs = cosine_similarity(&entry.vector, entry.norm, query, query_norm);
            if cs > best {
                best = cs;
                symbol = Some(entry.symbol);
            }
        }
        symbol
    }
}

fn cosine_similarity(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if a.len() != b.len() || a.is_empty() { return 0.0; }
    let denom = norm_a * norm_b;
    if denom < 1e-12 { return 0.0; }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / denom
}

// ============================================================
// 4) ROUND ALPHABET
// ============================================================

#[derive(Clone, Debug, Default)]
struct Alphabet {
    symbols: Vec<u8>,
    index: HashMap<u8, usize>,
}

impl Alphabet {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut alphabet = Alphabet::default();
        for &b in bytes {
            if !alphabet.index.contains_key(&b) {
                alphabet.index.insert(b, alphabet.symbols.len());
                alphabet.symbols.push(b);
            }
        }
        alphabet
    }

    fn len(&self) -> usize { self.symbols.len() }
    fn index_of(&self, symbol: u8) -> Option<usize> { self.index.get(&symbol).copied() }
    fn symbol(&self, i: usize) -> Option<u8> { self.symbols.get(i).copied() }
}

// ============================================================
// 5) AUTOGRAD TAPE - index-based computation graph
// ============================================================
//
// Tensors are row-major: `width` values per row, `height` rows. A column of
// the training batch is one row here.

type NodeId = usize;
type ParamId = usize;

#[derive(Clone, Copy)]
enum Op {
    Leaf,
    Param(ParamId),
    Add(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Sigmoid(NodeId),
    Quadratic(NodeId, NodeId),
    Avg(NodeId),
}

struct TapeNode<'a> {
    data: Cow<'a, [f32]>,
    grad: Vec<f32>,
    width: usize,
    height: usize,
    op: Op,
}

struct Tape<'a> {
    nodes: Vec<TapeNode<'a>>,
}

impl<'a> Tape<'a> {
    fn new() -> Self { Tape { nodes: Vec::with_capacity(16) } }

    fn push(&mut self, data: Cow<'a, [f32]>, width: usize, height: usize, op: Op) -> NodeId {
        // constants never receive gradient
        let grad = match op { Op::Leaf => Vec::new(), _ => vec![0.0; data.len()] };
        let id = self.nodes.len();
        self.nodes.push(TapeNode { data, grad, width, height, op });
        id
    }

    fn constant(&mut self, data: &'a [f32], width: usize, height: usize) -> NodeId {
        self.push(Cow::Borrowed(data), width, height, Op::Leaf)
    }

    fn param(&mut self, id: ParamId, p: &'a MatrixParam) -> NodeId {
        self.push(Cow::Borrowed(&p.data), p.width, p.height, Op::Param(id))
    }

    fn data(&self, id: NodeId) -> &[f32] { &self.nodes[id].data }

    /// Elementwise sum; `b` is broadcast row by row when it is shorter than `a`.
    fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let (an, bn) = (&self.nodes[a], &self.nodes[b]);
        let lb = bn.data.len();
        let d: Vec<f32> = if lb == 0 { an.data.to_vec() } else {
            an.data.iter().enumerate().map(|(i, &x)| x + bn.data[i % lb]).collect()
        };
        let (width, height) = (an.width, an.height);
        self.push(Cow::Owned(d), width, height, Op::Add(a, b))
    }

    /// out[r][c] = a.row(c) · b.row(r); a is (k x m), b is (k x n), out is (m x n).
    fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let (an, bn) = (&self.nodes[a], &self.nodes[b]);
        let k = an.width;
        let m = an.height;
        let n = bn.height;
        let mut d = vec![0.0f32; m * n];
        #[cfg(feature = "blas")]
        {
            if k > 0 && m * n * k >= 256 {
                unsafe { blas_ffi::sgemm_nt(n, m, k, &bn.data, &an.data, &mut d); }
                return self.push(Cow::Owned(d), m, n, Op::Mul(a, b));
            }
        }
        for r in 0..n {
            let brow = &bn.data[r * k..(r + 1) * k];
            for c in 0..m {
                let arow = &an.data[c * k..(c + 1) * k];
                d[r * m + c] = arow.iter().zip(brow).map(|(x, y)| x * y).sum();
            }
        }
        self.push(Cow::Owned(d), m, n, Op::Mul(a, b))
    }

    fn sigmoid(&mut self, a: NodeId) -> NodeId {
        let an = &self.nodes[a];
        let d: Vec<f32> = an.data.iter().map(|&x| sigmoid(x)).collect();
        let (width, height) = (an.width, an.height);
        self.push(Cow::Owned(d), width, height, Op::Sigmoid(a))
    }

    /// Per row: ½ Σ (a − b)².
    fn quadratic(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let (an, bn) = (&self.nodes[a], &self.nodes[b]);
        let w = an.width;
        let mut d = vec![0.0f32; an.height];
        for (r, out) in d.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for j in r * w..(r + 1) * w {
                let p = an.data[j] - bn.data[j];
                sum += p * p;
            }
            *out = 0.5 * sum;
        }
        let height = an.height;
        self.push(Cow::Owned(d), 1, height, Op::Quadratic(a, b))
    }

    /// Mean of every element; an empty input yields NaN.
    fn avg(&mut self, a: NodeId) -> NodeId {
        let an = &self.nodes[a];
        let sum: f32 = an.data.iter().sum();
        let mean = sum / an.data.len() as f32;
        self.push(Cow::Owned(vec![mean]), 1, 1, Op::Avg(a))
    }

    // ---- BACKWARD ----
    /// Populates every gradient reachable from `root` and returns the scalar loss.
    fn backward(&mut self, root: NodeId) -> f32 {
        self.nodes[root].grad[0] = 1.0;
        for i in (0..=root).rev() {
            let (lower, upper) = self.nodes.split_at_mut(i);
            let node = &upper[0];
            let grad = &node.grad;
            if grad.iter().all(|&g| g == 0.0) { continue; }
            match node.op {
                Op::Leaf | Op::Param(_) => {},
                Op::Add(a, b) => {
                    if !lower[a].grad.is_empty() {
                        for (d, &g) in lower[a].grad.iter_mut().zip(grad) { *d += g; }
                    }
                    let bg = &mut lower[b].grad;
                    let lb = bg.len();
                    if lb > 0 {
                        for (j, &g) in grad.iter().enumerate() { bg[j % lb] += g; }
                    }
                },
                Op::Mul(a, b) => {
                    let k = lower[a].width;
                    let m = lower[a].height;
                    let n = lower[b].height;
                    if k == 0 { continue; }
                    if !lower[a].grad.is_empty() {
                        let mut da = vec![0.0f32; m * k];
                        let bd = &lower[b].data;
                        for r in 0..n {
                            let brow = &bd[r * k..(r + 1) * k];
                            for c in 0..m {
                                let g = grad[r * m + c];
                                if g == 0.0 { continue; }
                                for (d, &x) in da[c * k..(c + 1) * k].iter_mut().zip(brow) { *d += g * x; }
                            }
                        }
                        for (d, v) in lower[a].grad.iter_mut().zip(da) { *d += v; }
                    }
                    if !lower[b].grad.is_empty() {
                        let mut db = vec![0.0f32; n * k];
                        let ad = &lower[a].data;
                        for r in 0..n {
                            for c in 0..m {
                                let g = grad[r * m + c];
                                if g == 0.0 { continue; }
                                let arow = &ad[c * k..(c + 1) * k];
                                for (d, &x) in db[r * k..(r + 1) * k].iter_mut().zip(arow) { *d += g * x; }
                            }
                        }
                        for (d, v) in lower[b].grad.iter_mut().zip(db) { *d += v; }
                    }
                },
                Op::Sigmoid(a) => {
                    let out = &node.data;
                    if !lower[a].grad.is_empty() {
                        for j in 0..grad.len() {
                            lower[a].grad[j] += out[j] * (1.0 - out[j]) * grad[j];
                        }
                    }
                },
                Op::Quadratic(a, b) => {
                    let w = lower[a].width;
                    for r in 0..grad.len() {
                        for j in r * w..(r + 1) * w {
                            let p = (lower[a].data[j] - lower[b].data[j]) * grad[r];
                            if !lower[a].grad.is_empty() { lower[a].grad[j] += p; }
                            if !lower[b].grad.is_empty() { lower[b].grad[j] -= p; }
                        }
                    }
                },
                Op::Avg(a) => {
                    let n = lower[a].data.len() as f32;
                    if !lower[a].grad.is_empty() {
                        for d in lower[a].grad.iter_mut() { *d += grad[0] / n; }
                    }
                },
            }
        }
        self.data(root)[0]
    }

    fn into_param_grads(self) -> Vec<(ParamId, Vec<f32>)> {
        self.nodes.into_iter()
            .filter_map(|n| match n.op { Op::Param(id) => Some((id, n.grad)), _ => None })
            .collect()
    }
}

fn sigmoid(x: f32) -> f32 { 1.0 / (1.0 + (-x).exp()) }

// ============================================================
// 6) MATRIX PARAM
// ============================================================

#[derive(Clone, Debug)]
struct MatrixParam {
    name: String,
    data: Vec<f32>,
    grad: Vec<f32>,
    width: usize,
    height: usize,
}

impl MatrixParam {
    fn zeros(name: &str, width: usize, height: usize) -> Self {
        MatrixParam {
            name: name.into(),
            data: vec![0.0; width * height],
            grad: vec![0.0; width * height],
            width, height,
        }
    }

    /// He init: N(0, 1) · sqrt(2 / fan_in), fan_in being the row width.
    fn he(name: &str, width: usize, height: usize, rng: &mut StdRng) -> Self {
        let factor = (2.0 / width as f64).sqrt();
        let data: Vec<f32> = (0..width * height)
            .map(|_| (rng.sample::<f64, _>(StandardNormal) * factor) as f32)
            .collect();
        MatrixParam { name: name.into(), grad: vec![0.0; data.len()], data, width, height }
    }

    fn matvec_raw(&self, x: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.height];
        #[cfg(feature = "blas")]
        {
            if self.width > 0 && self.height * self.width >= 256 {
                unsafe { blas_ffi::sgemv(self.height, self.width, &self.data, x, &mut out); }
                return out;
            }
        }
        for i in 0..self.height {
            let row = &self.data[i * self.width..(i + 1) * self.width];
            out[i] = row.iter().zip(x).map(|(w, v)| w * v).sum();
        }
        out
    }

    fn zero_grad(&mut self) {
        for g in self.grad.iter_mut() { *g = 0.0; }
    }
}

// ============================================================
// 7) OPTIMIZER - Adam with global norm clipping
// ============================================================

struct AdamState {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl AdamState {
    fn new(n: usize) -> Self { AdamState { m: vec![0.0; n], v: vec![0.0; n] } }
}

/// β^(step+1) for both moments; a power that is not finite collapses to 0.
fn bias_powers(beta1: f32, beta2: f32, step: usize) -> (f32, f32) {
    let pow = |x: f32| {
        let y = (x as f64).powi(step as i32 + 1);
        if y.is_nan() || y.is_infinite() { 0.0 } else { y as f32 }
    };
    (pow(beta1), pow(beta2))
}

fn global_grad_norm(params: &[MatrixParam]) -> f32 {
    let mut norm = 0.0f32;
    for p in params {
        for &d in &p.grad { norm += d * d; }
    }
    norm.sqrt()
}

fn clip_scale(norm: f32, clip: f32) -> f32 {
    if norm > clip { clip / norm } else { 1.0 }
}

fn adam_step(params: &mut [MatrixParam], adam: &mut [AdamState], step: usize, cfg: &Config) {
    let scaling = clip_scale(global_grad_norm(params), cfg.grad_clip);
    let (b1p, b2p) = bias_powers(cfg.beta1, cfg.beta2, step);
    let (b1, b2) = (cfg.beta1, cfg.beta2);
    for (mat, state) in params.iter_mut().zip(adam.iter_mut()) {
        for l in 0..mat.data.len() {
            let g = mat.grad[l] * scaling;
            let m = b1 * state.m[l] + (1.0 - b1) * g;
            let v = b2 * state.v[l] + (1.0 - b2) * g * g;
            state.m[l] = m;
            state.v[l] = v;
            let mhat = m / (1.0 - b1p);
            let mut vhat = v / (1.0 - b2p);
            if vhat < 0.0 { vhat = 0.0; }
            mat.data[l] -= cfg.learning_rate * mhat / (vhat.sqrt() + cfg.eps_adam);
        }
    }
}

// ============================================================
// 8) ONLINE TRAINER
// ============================================================

/// Context columns paired with one-hot targets, one row per observed byte.
struct TrainingBatch {
    inputs: Vec<f32>,
    targets: Vec<f32>,
    input_width: usize,
    output_width: usize,
    len: usize,
}

/// Walks the answer through the mixer, recording each pre-symbol context in memory.
fn observe<M: ContextMixer>(
    answer: &[u8], alphabet: &Alphabet, mixer: &mut M, memory: &mut ContextMemory,
) -> TrainingBatch {
    let input_width = mixer.width();
    let output_width = alphabet.len();
    let mut batch = TrainingBatch {
        inputs: Vec::with_capacity(answer.len() * input_width),
        targets: Vec::with_capacity(answer.len() * output_width),
        input_width, output_width, len: 0,
    };
    for &symbol in answer {
        let vector = mixer.mix();
        batch.inputs.extend_from_slice(&vector);
        memory.record(vector, symbol);
        let mut target = vec![0.0f32; output_width];
        if let Some(i) = alphabet.index_of(symbol) { target[i] = 1.0; }
        batch.targets.extend(target);
        batch.len += 1;
        mixer.add(symbol);
    }
    batch
}

const W: ParamId = 0;
const B: ParamId = 1;
const W1: ParamId = 2;
const B1: ParamId = 3;

/// H = sigmoid(W·x + b), O = W1·H + b1.
struct Network {
    params: Vec<MatrixParam>,
    adam: Vec<AdamState>,
}

impl Network {
    fn new(input_width: usize, classes: usize, rng: &mut StdRng) -> Self {
        let params = vec![
            MatrixParam::he("w", input_width, classes, rng),
            MatrixParam::zeros("b", classes, 1),
            MatrixParam::he("w1", classes, classes, rng),
            MatrixParam::zeros("b1", classes, 1),
        ];
        let adam = params.iter().map(|p| AdamState::new(p.data.len())).collect();
        Network { params, adam }
    }

    fn classes(&self) -> usize { self.param("b1").map_or(0, |p| p.width) }

    fn param(&self, name: &str) -> Option<&MatrixParam> {
        self.params.iter().find(|p| p.name == name)
    }

    fn loss<'a>(&'a self, tape: &mut Tape<'a>, batch: &'a TrainingBatch) -> NodeId {
        let w = tape.param(W, &self.params[W]);
        let b = tape.param(B, &self.params[B]);
        let w1 = tape.param(W1, &self.params[W1]);
        let b1 = tape.param(B1, &self.params[B1]);
        let x = tape.constant(&batch.inputs, batch.input_width, batch.len);
        let y = tape.constant(&batch.targets, batch.output_width, batch.len);
        let l = tape.mul(w, x);
        let l = tape.add(l, b);
        let l = tape.sigmoid(l);
        let l1 = tape.mul(w1, l);
        let l1 = tape.add(l1, b1);
        let q = tape.quadratic(l1, y);
        tape.avg(q)
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mut h = self.params[W].matvec_raw(x);
        for (v, &b) in h.iter_mut().zip(&self.params[B].data) { *v = sigmoid(*v + b); }
        let mut o = self.params[W1].matvec_raw(&h);
        for (v, &b) in o.iter_mut().zip(&self.params[B1].data) { *v += b; }
        o
    }
}

/// Runs up to `train_steps` Adam steps; returns the (step, loss) trace.
fn train(net: &mut Network, batch: &TrainingBatch, cfg: &Config) -> Vec<(usize, f32)> {
    let mut trace = Vec::with_capacity(cfg.train_steps);
    for step in 0..cfg.train_steps {
        for p in net.params.iter_mut() { p.zero_grad(); }
        let (cost, grads) = {
            let mut tape = Tape::new();
            let loss = net.loss(&mut tape, batch);
            let cost = tape.backward(loss);
            (cost, tape.into_param_grads())
        };
        if !cost.is_finite() {
            warn!(step, loss = cost, "loss is not finite, stopping early");
            break;
        }
        for (id, g) in grads {
            for (d, v) in net.params[id].grad.iter_mut().zip(g) { *d += v; }
        }
        adam_step(&mut net.params, &mut net.adam, step, cfg);
        info!(step, loss = cost, "train");
        trace.push((step, cost));
    }
    trace
}

// ============================================================
// 9) SAMPLING DECODER
// ============================================================

fn is_terminator(symbol: u8) -> bool { TERMINATORS.contains(&symbol) }

fn should_stop(len: usize, symbol: u8, cfg: &Config) -> bool {
    (len >= cfg.min_gen_len && is_terminator(symbol)) || len >= cfg.max_gen_len
}

#[derive(Clone, Debug, PartialEq)]
struct Rollout {
    text: Vec<u8>,
    score: f32,
}

impl Rollout {
    fn text_lossy(&self) -> String { String::from_utf8_lossy(&self.text).into_owned() }
}

/// Walks the raw-sum-normalized output in alphabet order until the running
/// total exceeds `draw`. Returns the symbol and the weight it contributes.
/// A zero or non-finite sum picks the first symbol; a walk that never passes
/// the draw emits NUL.
fn select_symbol(output: &[f32], alphabet: &Alphabet, draw: f32) -> (u8, f32) {
    let sum: f32 = output.iter().sum();
    if sum == 0.0 || !sum.is_finite() { return (alphabet.symbol(0).unwrap_or(0), 0.0); }
    let mut total = 0.0f32;
    for (i, &v) in output.iter().enumerate() {
        total += v / sum;
        if draw < total {
            return (alphabet.symbol(i).unwrap_or(0), v / sum);
        }
    }
    (0, 0.0)
}

fn sample_rollouts<M: ContextMixer>(
    net: &Network, alphabet: &Alphabet, mixer: &M, rng: &mut StdRng, cfg: &Config,
) -> Vec<Rollout> {
    let mut rollouts = Vec::with_capacity(cfg.rollouts);
    for _ in 0..cfg.rollouts {
        let mut cp = mixer.clone();
        let mut rollout = Rollout { text: Vec::new(), score: 0.0 };
        loop {
            let output = net.forward(&cp.mix());
            let draw: f32 = rng.gen();
            let (symbol, weight) = select_symbol(&output, alphabet, draw);
            rollout.score += weight;
            rollout.text.push(symbol);
            cp.add(symbol);
            if should_stop(rollout.text.len(), symbol, cfg) { break; }
        }
        rollouts.push(rollout);
    }
    rollouts
}

/// Average per-byte score; the first of equally scored rollouts wins.
fn best_rollout(rollouts: Vec<Rollout>) -> Option<Rollout> {
    let mut best: Option<Rollout> = None;
    for mut r in rollouts {
        r.score /= r.text.len() as f32;
        if best.as_ref().map_or(true, |b| r.score > b.score) { best = Some(r); }
    }
    best
}

// ============================================================
// 10) RETRIEVAL DECODER
// ============================================================

/// Greedy nearest-neighbour walk on the canonical mixer; the mixer keeps every emitted byte.
fn retrieve<M: ContextMixer>(mixer: &mut M, memory: &ContextMemory, cfg: &Config) -> Vec<u8> {
    let mut reply = Vec::new();
    loop {
        let query = mixer.mix();
        let symbol = memory.nearest(&query).unwrap_or(0);
        reply.push(symbol);
        mixer.add(symbol);
        if should_stop(reply.len(), symbol, cfg) { break; }
    }
    reply
}

// ============================================================
// 11) RANK PROPAGATION
// ============================================================

// Not on the round path; kept as a standalone capability.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Clone, Debug)]
struct Matrix {
    cols: usize,
    rows: usize,
    data: Vec<f32>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl Matrix {
    fn new(cols: usize, rows: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(cols * rows, data.len());
        Matrix { cols, rows, data }
    }

    fn row(&self, i: usize) -> &[f32] { &self.data[i * self.cols..(i + 1) * self.cols] }

    fn transpose(&self) -> Matrix {
        let mut data = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols { data[c * self.rows + r] = self.data[r * self.cols + c]; }
        }
        Matrix { cols: self.rows, rows: self.cols, data }
    }
}

const RANK_DAMPING: f64 = 1.0;
const RANK_TOLERANCE: f64 = 1e-3;
const RANK_MAX_ITERS: usize = 10_000;

/// Stationary distribution of a walk over the columns of `a`, linked by cosine similarity.
#[cfg_attr(not(test), allow(dead_code))]
fn page_rank(a: &Matrix) -> Vec<f32> {
    let a = a.transpose();
    let n = a.rows;
    if n == 0 { return Vec::new(); }
    let norms: Vec<f32> = (0..n).map(|i| a.row(i).iter().map(|&v| v * v).sum::<f32>().sqrt()).collect();
    let mut edges = vec![0.0f64; n * n];
    let mut outbound = vec![0.0f64; n];
    for i in 0..n {
        for j in 0..n {
            let cs = cosine_similarity(a.row(i), norms[i], a.row(j), norms[j]) as f64;
            edges[i * n + j] += cs;
            outbound[i] += cs;
        }
    }
    for i in 0..n {
        if outbound[i] > 0.0 {
            for j in 0..n { edges[i * n + j] /= outbound[i]; }
        }
    }
    let mut rank = vec![1.0 / n as f64; n];
    for iter in 0..RANK_MAX_ITERS {
        let next = rank_step(&edges, &outbound, &rank);
        let delta: f64 = next.iter().zip(&rank).map(|(x, y)| (x - y).abs()).sum();
        rank = next;
        if delta <= RANK_TOLERANCE { break; }
        if iter + 1 == RANK_MAX_ITERS {
            warn!(iterations = RANK_MAX_ITERS, delta, "page rank did not converge");
        }
    }
    rank.into_iter().map(|r| r as f32).collect()
}

/// One power-iteration step. Nodes without outbound weight leak their rank
/// evenly, yet their raw edges still carry rank to their targets.
#[cfg_attr(not(test), allow(dead_code))]
fn rank_step(edges: &[f64], outbound: &[f64], rank: &[f64]) -> Vec<f64> {
    let n = rank.len();
    let inverse = 1.0 / n as f64;
    let leak: f64 = RANK_DAMPING * (0..n).filter(|&i| outbound[i] == 0.0).map(|i| rank[i]).sum::<f64>();
    let mut next = vec![0.0f64; n];
    for src in 0..n {
        for dst in 0..n { next[dst] += RANK_DAMPING * rank[src] * edges[src * n + dst]; }
        next[src] += (1.0 - RANK_DAMPING) * inverse + leak * inverse;
    }
    next
}

// ============================================================
// 12) ORACLE
// ============================================================

trait Oracle {
    fn ask(&mut self, prompt: &str) -> Result<String, LoopError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct GenerateChunk {
    response: String,
}

struct HttpOracle {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
}

impl HttpOracle {
    fn new(cfg: &Config) -> Self {
        HttpOracle { agent: ureq::AgentBuilder::new().build(), endpoint: cfg.endpoint.clone(), model: cfg.model.clone() }
    }
}

impl Oracle for HttpOracle {
    fn ask(&mut self, prompt: &str) -> Result<String, LoopError> {
        debug!(endpoint = %self.endpoint, model = %self.model, prompt_bytes = prompt.len(), "querying oracle");
        let response = self.agent.post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_json(GenerateRequest { model: &self.model, prompt })
            .map_err(|e| LoopError::Oracle(Box::new(e)))?;
        read_answer(BufReader::new(response.into_reader()))
    }
}

/// Concatenates the `response` fragments of a newline-delimited JSON stream.
fn read_answer<R: BufRead>(reader: R) -> Result<String, LoopError> {
    let mut answer = String::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() { continue; }
        let chunk: GenerateChunk = serde_json::from_str(&line)?;
        answer.push_str(&chunk.response);
    }
    Ok(answer)
}

// ============================================================
// 13) ROUND ORCHESTRATOR
// ============================================================

struct RoundReport {
    answer: String,
    alphabet: Alphabet,
    losses: Vec<(usize, f32)>,
    best: Option<Rollout>,
    reply: Vec<u8>,
}

impl RoundReport {
    fn next_prompt(&self) -> String { String::from_utf8_lossy(&self.reply).into_owned() }
}

/// Owns the canonical mixer and the memory; both outlive every round.
struct Conversation<M: ContextMixer> {
    cfg: Config,
    mixer: M,
    memory: ContextMemory,
    round: u64,
}

impl<M: ContextMixer> Conversation<M> {
    fn new(cfg: Config, mut mixer: M) -> Self {
        // history starts from a single NUL
        mixer.add(0);
        let memory = ContextMemory::new(cfg.memory_capacity);
        Conversation { cfg, mixer, memory, round: 0 }
    }

    fn round<O: Oracle>(&mut self, oracle: &mut O, prompt: &str) -> Result<RoundReport, LoopError> {
        self.round += 1;
        let answer = oracle.ask(prompt)?;
        let bytes = answer.as_bytes();
        let alphabet = Alphabet::from_bytes(bytes);
        info!(round = self.round, answer_bytes = bytes.len(), alphabet = alphabet.len(), "observed answer");

        let batch = observe(bytes, &alphabet, &mut self.mixer, &mut self.memory);
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        let mut net = Network::new(batch.input_width, alphabet.len(), &mut rng);
        let losses = train(&mut net, &batch, &self.cfg);
        info!(round = self.round, classes = net.classes(), steps = losses.len(),
              final_loss = ?losses.last().map(|l| l.1), "done training");

        let rollouts = sample_rollouts(&net, &alphabet, &self.mixer, &mut rng, &self.cfg);
        let best = best_rollout(rollouts);
        debug!(round = self.round, score = ?best.as_ref().map(|b| b.score), "best rollout");

        let reply = retrieve(&mut self.mixer, &self.memory, &self.cfg);
        debug!(round = self.round, reply_bytes = reply.len(), memory = self.memory.len(), "retrieved reply");

        Ok(RoundReport { answer, alphabet, losses, best, reply })
    }
}

// ============================================================
// 14) MAIN
// ============================================================

fn run(cli: Cli) -> Result<(), LoopError> {
    let cfg = cli.resolve_config()?;
    info!(endpoint = %cfg.endpoint, model = %cfg.model, memory = cfg.memory_capacity, "starting conversation");
    let mut oracle = HttpOracle::new(&cfg);
    let mut query = cfg.opening_query.clone();
    let mut conversation = Conversation::new(cfg, WindowMixer::new());
    debug!(capacity = conversation.memory.capacity(), width = conversation.mixer.width(), "memory allocated");
    loop {
        let report = conversation.round(&mut oracle, &query)?;
        debug!(alphabet = report.alphabet.len(), steps = report.losses.len(), "round complete");
        if !report.answer.is_empty() {
            println!("{}", report.answer);
            println!("{}", BANNER_ANSWER);
        }
        if let Some(best) = &report.best {
            println!("{}", best.text_lossy());
        }
        println!("{}", BANNER_SAMPLED);
        query = report.next_prompt();
        println!("{}", query);
        println!("{}", BANNER_REPLY);
        if cli.rounds.is_some_and(|limit| conversation.round >= limit) { break; }
    }
    Ok(())
}

fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()) {
        error!("{err}");
        std::process::exit(1);
    }
}

// ============================================================
// TESTS
// ============================================================
