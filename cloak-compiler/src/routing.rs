//! Routing: compiling index functions into bus wirings and MI-sized
//! secret permutations.
//!
//! A routed program is a flat list of [`Row`]s. A [`PublicShuffle`] is free
//! on the bus (it only renames which cell feeds which slot); a
//! [`SecretShuffles`] row is a batch of permutations that each fit inside
//! one multi-instruction of width `l = 2^le`. Permutations compile through
//! a Beneš network whose `2m-1` columns are grouped into MI-sized blocks;
//! arbitrary (duplicating) functions go through the three-stage
//! Beneš–Duplicates–Beneš construction of [`BdbFuncMi`].

use std::collections::{BTreeSet, HashMap};

/// `log2(n)` for exact powers of two.
///
/// # Panics
///
/// Panics when `n` is not a power of two.
pub(crate) fn log2_exact(n: usize) -> u32 {
    assert!(n.is_power_of_two(), "{n} is not a power of two");
    n.trailing_zeros()
}

fn rotr_index(word: usize, m: u32, i: u32) -> usize {
    let i = i % m;
    let mask = (1usize << m) - 1;
    ((word >> i) | (word << (m - i))) & mask
}

/// `result = c ∘ pi⁻¹`; `pi` must be a permutation.
fn composeinv(c: &[usize], pi: &[usize]) -> Vec<usize> {
    let mut out = vec![0; c.len()];
    for (i, &p) in pi.iter().enumerate() {
        out[p] = c[i];
    }
    out
}

/// A wiring between multi-instructions; slot `i` of the next stage reads
/// position `self[i]` of the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicShuffle(pub Vec<usize>);

impl PublicShuffle {
    /// The shuffle rotating `m`-bit position indices left by `s`.
    pub fn index_rotl(m: u32, s: u32) -> Self {
        Self((0..1usize << m).map(|i| rotr_index(i, m, s)).collect())
    }

    /// `(self ∘ other)[i] = self[other[i]]`.
    pub fn compose(&self, other: &Self) -> Self {
        Self(other.0.iter().map(|&i| self.0[i]).collect())
    }

    /// The inverse wiring.
    pub fn invert(&self) -> Self {
        let mut inv = vec![0; self.0.len()];
        for (i, &j) in self.0.iter().enumerate() {
            inv[j] = i;
        }
        Self(inv)
    }

    /// `true` iff the wiring maps every slot to itself.
    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &j)| i == j)
    }
}

/// One permutation (possibly with duplicated positions, for the duplicate
/// layers) small enough to run inside a single multi-instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretShuffle(pub Vec<usize>);

/// A batch of secret shuffles applied at the given offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretShuffles(pub Vec<(usize, SecretShuffle)>);

/// One row of a routed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    /// Free reindexing on the bus.
    Public(PublicShuffle),
    /// Permutations that must execute inside multi-instructions.
    Secret(SecretShuffles),
}

/// Drop rows that do nothing (identity public shuffles).
pub fn optimize(mut rows: Vec<Row>) -> Vec<Row> {
    loop {
        let before = rows.len();
        rows.retain(|row| !matches!(row, Row::Public(p) if p.is_identity()));
        if rows.len() == before {
            return rows;
        }
    }
}

/// Reference execution of a routed program over the identity state of
/// length `n`; the result is the function the program realizes.
pub fn run(rows: &[Row], n: usize) -> Vec<usize> {
    let mut state: Vec<usize> = (0..n).collect();
    for row in rows {
        match row {
            Row::Public(p) => {
                state = p.0.iter().map(|&i| state[i]).collect();
            }
            Row::Secret(groups) => {
                for (off, perm) in &groups.0 {
                    let window: Vec<usize> = perm.0.iter().map(|&i| state[off + i]).collect();
                    state[*off..off + window.len()].copy_from_slice(&window);
                }
            }
        }
    }
    state
}

/// Beneš network for a full permutation: `2m-1` columns of `n/2` control
/// bits each.
///
/// Control bits come from Bernstein's verified formulas; column `i` acts on
/// bit position `min(i, 2m-2-i)`.
#[derive(Debug, Clone)]
pub struct BenesPerm {
    n: usize,
    m: u32,
    /// Control-bit columns, outermost first.
    pub cols: Vec<Vec<bool>>,
}

impl BenesPerm {
    /// Compile `perm` (a permutation of `0..n`, `n` a power of two ≥ 2).
    pub fn new(perm: &[usize]) -> Self {
        let n = perm.len();
        let m = log2_exact(n);
        Self {
            n,
            m,
            cols: Self::control_bits(perm),
        }
    }

    fn control_bits(pi: &[usize]) -> Vec<Vec<bool>> {
        let n = pi.len();
        let m = log2_exact(n);
        if m == 1 {
            // A single swap position: [0, 1] passes, [1, 0] swaps.
            return vec![vec![pi[0] == 1]];
        }

        let p0: Vec<usize> = (0..n).map(|x| pi[x ^ 1]).collect();
        let q0: Vec<usize> = (0..n).map(|x| pi[x] ^ 1).collect();

        let piinv = composeinv(&(0..n).collect::<Vec<_>>(), pi);
        let p1 = composeinv(&p0, &q0);
        let q1 = composeinv(&q0, &p0);

        let mut c: Vec<usize> = (0..n).map(|x| x.min(p1[x])).collect();
        let mut p = composeinv(&p1, &q1);
        let mut q = composeinv(&q1, &p1);
        for _ in 1..m - 1 {
            let cp = composeinv(&c, &q);
            let np = composeinv(&p, &q);
            let nq = composeinv(&q, &p);
            p = np;
            q = nq;
            for x in 0..n {
                c[x] = c[x].min(cp[x]);
            }
        }

        let first: Vec<bool> = (0..n / 2).map(|j| c[2 * j] % 2 == 1).collect();
        let big_f: Vec<usize> = (0..n).map(|x| x ^ first[x / 2] as usize).collect();
        let fpi = composeinv(&big_f, &piinv);
        let last: Vec<bool> = (0..n / 2).map(|k| fpi[2 * k] % 2 == 1).collect();
        let big_l: Vec<usize> = (0..n).map(|y| y ^ last[y / 2] as usize).collect();
        let mid = composeinv(&fpi, &big_l);

        let sub0: Vec<usize> = (0..n / 2).map(|j| mid[2 * j] / 2).collect();
        let sub1: Vec<usize> = (0..n / 2).map(|j| mid[2 * j + 1] / 2).collect();
        let z0 = Self::control_bits(&sub0);
        let z1 = Self::control_bits(&sub1);

        let mut cols = Vec::with_capacity(2 * m as usize - 1);
        cols.push(first);
        for (s0, s1) in z0.into_iter().zip(z1) {
            let mut interleaved = Vec::with_capacity(s0.len() + s1.len());
            for (a, b) in s0.into_iter().zip(s1) {
                interleaved.push(a);
                interleaved.push(b);
            }
            cols.push(interleaved);
        }
        cols.push(last);
        cols
    }

    /// Swap pairs `(j, j ^ 2^ibit)` whose control bit is set, iterating `j`
    /// over the submasks of `(n-1) ^ 2^ibit` in descending order, consuming
    /// `col` from its end.
    fn apply_col<T>(state: &mut [T], m: u32, ibit: u32, col: &[bool]) {
        let bit = 1usize << ibit;
        let mask = ((1usize << m) - 1) ^ bit;
        let mut j = mask;
        let mut k = col.len();
        loop {
            k -= 1;
            if col[k] {
                state.swap(j, j ^ bit);
            }
            j = j.wrapping_sub(1) & mask;
            if j == mask {
                break;
            }
        }
        debug_assert_eq!(k, 0);
    }

    /// Run the network over the identity, reproducing the compiled
    /// permutation.
    pub fn apply(&self) -> Vec<usize> {
        let mut state: Vec<usize> = (0..self.n).collect();
        for (i, col) in self.cols.iter().enumerate() {
            let ibit = (i as u32).min(2 * self.m - 2 - i as u32);
            Self::apply_col(&mut state, self.m, ibit, col);
        }
        state
    }
}

/// Beneš network grouped into MI-sized blocks.
///
/// The middle `2·le - 1` columns act on bit positions inside one MI window
/// and compile as-is; prefix and suffix columns are grouped `le` at a time
/// and rotated into the low bit positions with public wirings, so each
/// group becomes a batch of width-`l` secret shuffles. Adjacent blocks fuse
/// their facing public wirings.
#[derive(Debug, Clone)]
pub struct BenesPermMi {
    n: usize,
    m: u32,
    l: usize,
    /// The routed program realizing the permutation.
    pub rows: Vec<Row>,
}

impl BenesPermMi {
    /// Compile `perm` for MI width `2^le`, `le ≥ 1`.
    pub fn new(perm: &[usize], le: u32) -> Self {
        assert!(le >= 1, "multi-instructions carry at least two slots");
        let n = perm.len();
        let m = log2_exact(n);
        let l = 1usize << le;

        if le >= m {
            // The whole permutation fits into a single multi-instruction.
            let rows = vec![Row::Secret(SecretShuffles(vec![(
                0,
                SecretShuffle(perm.to_vec()),
            )]))];
            return Self { n, m, l, rows };
        }

        let cols = BenesPerm::new(perm).cols;
        debug_assert_eq!(cols.len(), 2 * m as usize - 1);
        let icols: Vec<(u32, Vec<bool>)> = cols
            .into_iter()
            .enumerate()
            .map(|(i, col)| ((i as u32).min(2 * m - 2 - i as u32), col))
            .collect();

        let midl = (m - le) as usize;
        let midr = (m + le - 2) as usize;

        let mut this = Self {
            n,
            m,
            l,
            rows: Vec::new(),
        };

        for i in (0..midl).step_by(le as usize) {
            let hi = (i + le as usize).min(midl);
            let (lift, main, sink) = this.compile_cols(&icols[i..hi], (hi - i) as u32);
            this.add_block(lift, main, sink);
        }

        let (lift, main, sink) = this.compile_cols(&icols[midl..=midr], le);
        this.add_block(lift, main, sink);

        for i in (midr + 1..2 * m as usize - 1).step_by(le as usize) {
            let hi = (i + le as usize).min(2 * m as usize - 1);
            let (lift, main, sink) = this.compile_cols(&icols[i..hi], (hi - i) as u32);
            this.add_block(lift, main, sink);
        }

        this
    }

    /// Rotate the block's bit positions down to the low bits, evaluate its
    /// columns as one permutation, and slice that permutation into
    /// window-sized secret shuffles.
    fn compile_cols(
        &self,
        icols: &[(u32, Vec<bool>)],
        width: u32,
    ) -> (PublicShuffle, SecretShuffles, PublicShuffle) {
        let shift = icols
            .iter()
            .map(|(ibit, _)| *ibit)
            .min()
            .expect("blocks are never empty");
        let sink = PublicShuffle::index_rotl(self.m, shift);
        let lift = sink.invert();

        let mut mid: Vec<usize> = (0..self.n).collect();
        for (ibit, col) in icols {
            BenesPerm::apply_col(&mut mid, self.m, *ibit, col);
        }
        let composed: Vec<usize> = (0..self.n).map(|i| sink.0[mid[lift.0[i]]]).collect();

        let window = (1usize << width).max(self.l);
        let groups = (0..self.n)
            .step_by(window)
            .map(|off| {
                let group = composed[off..off + window].iter().map(|&v| v - off).collect();
                (off, SecretShuffle(group))
            })
            .collect();

        (lift, SecretShuffles(groups), sink)
    }

    fn add_block(&mut self, lift: PublicShuffle, main: SecretShuffles, sink: PublicShuffle) {
        match self.rows.last_mut() {
            Some(Row::Public(last)) => *last = lift.compose(last),
            _ => self.rows.push(Row::Public(lift)),
        }
        self.rows.push(Row::Secret(main));
        self.rows.push(Row::Public(sink));
    }

    /// The routed program, outermost row first.
    pub fn canonical(&self) -> Vec<Row> {
        self.rows.clone()
    }
}

/// Single-pass copy-forward layers realizing a duplicating pattern.
///
/// The compiled function must be "clean": position `i` either keeps its own
/// value or repeats position `i-1`'s. The sequence splits into windows of
/// `l` slots overlapping by one, so each window is one secret shuffle.
#[derive(Debug, Clone)]
pub struct ForwardDupMi {
    /// The routed program; every row is a single secret shuffle.
    pub rows: Vec<Row>,
}

impl ForwardDupMi {
    /// Compile the duplication pattern of `f` for MI width `2^le`.
    pub fn new(f: &[usize], le: u32) -> Self {
        let n = f.len();
        let m = log2_exact(n);
        let l = 1usize << le;

        if le >= m {
            return Self {
                rows: vec![Row::Secret(SecretShuffles(vec![(
                    0,
                    SecretShuffle(Self::clean(f)),
                )]))],
            };
        }

        let mut rows = vec![Row::Secret(SecretShuffles(vec![(
            0,
            SecretShuffle(Self::clean(&f[..l])),
        )]))];

        let step = l - 1;
        let mut off = step;
        while off < n - 1 {
            let hi = (off + step + 1).min(n);
            let sub = Self::clean(&f[off..hi]);
            debug_assert!(sub.len() > 1);
            rows.push(Row::Secret(SecretShuffles(vec![(off, SecretShuffle(sub))])));
            off += step;
        }

        Self { rows }
    }

    /// Turn runs of equal values into in-window index duplication.
    fn clean(f: &[usize]) -> Vec<usize> {
        let mut ff = vec![0];
        for i in 1..f.len() {
            if f[i] == f[i - 1] {
                ff.push(ff[i - 1]);
            } else {
                ff.push(i);
            }
        }
        ff
    }

    /// The routed program, first window first.
    pub fn canonical(&self) -> Vec<Row> {
        self.rows.clone()
    }
}

/// Beneš–Duplicates–Beneš: an arbitrary function `f : [n] → [n]` as an
/// input permutation, a copy-forward pass, and an output permutation.
///
/// The input permutation lists every distinct output value once, at the
/// start of a block sized by its multiplicity and padded from the unused
/// values; the duplicate pass fills each block with copies; the output
/// permutation distributes block slots to their final positions.
#[derive(Debug, Clone)]
pub struct BdbFuncMi {
    /// Routes each block leader to its block start.
    pub input_perm: BenesPermMi,
    /// Fills each block with copies of its leader.
    pub dups: ForwardDupMi,
    /// Routes block slots to the positions mapped to their value.
    pub output_perm: BenesPermMi,
}

impl BdbFuncMi {
    /// Compile `f` (values in `[0, n)`, `n` a power of two) for MI width
    /// `2^le`.
    pub fn new(f: &[usize], le: u32) -> Self {
        let n = f.len();

        let mut order = Vec::new();
        let mut positions: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, &a) in f.iter().enumerate() {
            let slot = positions.entry(a).or_default();
            if slot.is_empty() {
                order.push(a);
            }
            slot.push(i);
        }
        let mut missing: BTreeSet<usize> =
            (0..n).filter(|v| !positions.contains_key(v)).collect();

        let mut pi = Vec::with_capacity(n);
        let mut pif = Vec::with_capacity(n);
        let mut start: HashMap<usize, usize> = HashMap::new();
        for &a in &order {
            let count = positions[&a].len();
            start.insert(a, pi.len());
            pi.push(a);
            pif.extend(std::iter::repeat(a).take(count));
            for _ in 1..count {
                pi.push(missing.pop_first().expect("one filler per duplicate"));
            }
        }

        let mut pi2 = Vec::with_capacity(n);
        for a in f {
            let next = start.get_mut(a).expect("every value was indexed");
            pi2.push(*next);
            *next += 1;
        }

        Self {
            input_perm: BenesPermMi::new(&pi, le),
            dups: ForwardDupMi::new(&pif, le),
            output_perm: BenesPermMi::new(&pi2, le),
        }
    }

    /// The routed program: input permutation, duplicates, output
    /// permutation.
    pub fn canonical(&self) -> Vec<Row> {
        let mut rows = self.input_perm.canonical();
        rows.extend(self.dups.canonical());
        rows.extend(self.output_perm.canonical());
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_perm(rng: &mut StdRng, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        perm
    }

    #[test]
    fn benes_reproduces_permutations() {
        let mut rng = StdRng::seed_from_u64(11);
        for m in 1..=6u32 {
            let n = 1usize << m;
            for _ in 0..8 {
                let perm = random_perm(&mut rng, n);
                assert_eq!(BenesPerm::new(&perm).apply(), perm);
            }
        }
    }

    #[test]
    fn benes_mi_reproduces_permutations_for_every_width() {
        let mut rng = StdRng::seed_from_u64(13);
        for m in 1..=5u32 {
            let n = 1usize << m;
            for _ in 0..4 {
                let perm = random_perm(&mut rng, n);
                for le in 1..=m + 1 {
                    let compiled = BenesPermMi::new(&perm, le);
                    assert_eq!(run(&compiled.canonical(), n), perm, "m={m} le={le}");
                }
            }
        }
    }

    #[test]
    fn secret_windows_respect_the_mi_width() {
        let mut rng = StdRng::seed_from_u64(17);
        let perm = random_perm(&mut rng, 32);
        for le in 1..=5u32 {
            let compiled = BenesPermMi::new(&perm, le);
            for row in &compiled.rows {
                if let Row::Secret(groups) = row {
                    for (_, shuffle) in &groups.0 {
                        assert!(shuffle.0.len() >= 1usize << le);
                    }
                }
            }
        }
    }

    #[test]
    fn forward_dup_fills_runs() {
        let f = vec![0, 0, 2, 2, 2, 5, 6, 6];
        for le in 1..=4u32 {
            let compiled = ForwardDupMi::new(&f, le);
            assert_eq!(run(&compiled.canonical(), f.len()), f, "le={le}");
        }
    }

    #[test]
    fn bdb_func_reproduces_arbitrary_functions() {
        let mut rng = StdRng::seed_from_u64(19);
        for m in 1..=5u32 {
            let n = 1usize << m;
            for _ in 0..4 {
                let f: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                for le in 1..=m + 1 {
                    let compiled = optimize(BdbFuncMi::new(&f, le).canonical());
                    assert_eq!(run(&compiled, n), f, "m={m} le={le} f={f:?}");
                }
            }
        }
    }

    #[test]
    fn constant_function_compiles() {
        let f = vec![3; 8];
        for le in 1..=4u32 {
            let compiled = optimize(BdbFuncMi::new(&f, le).canonical());
            assert_eq!(run(&compiled, 8), f);
        }
    }

    #[test]
    fn two_fold_duplication_uses_a_duplicate_block() {
        let f = vec![0, 0, 1, 1];
        let compiled = BdbFuncMi::new(&f, 1);
        assert!(!compiled.dups.rows.is_empty());
        assert_eq!(run(&optimize(compiled.canonical()), 4), f);
    }

    #[test]
    fn optimize_drops_identity_wirings() {
        let rows = vec![
            Row::Public(PublicShuffle(vec![0, 1, 2, 3])),
            Row::Secret(SecretShuffles(vec![(0, SecretShuffle(vec![1, 0]))])),
            Row::Public(PublicShuffle(vec![1, 0, 2, 3])),
        ];
        let optimized = optimize(rows);
        assert_eq!(optimized.len(), 2);
    }
}
