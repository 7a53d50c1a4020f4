//! Property tests for the routing compilers: for every index function and
//! every MI width, running the compiled program over the identity must
//! reproduce the function.

use cloak_compiler::routing::{optimize, run, BdbFuncMi, BenesPermMi};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;

/// An arbitrary function `[n] -> [n]` with `n` a small power of two.
#[derive(Debug, Clone)]
struct IndexFunction(Vec<usize>);

impl Arbitrary for IndexFunction {
    fn arbitrary(g: &mut Gen) -> Self {
        let m = *g.choose(&[1u32, 2, 3, 4, 5, 6]).expect("nonempty");
        let n = 1usize << m;
        Self((0..n).map(|_| usize::arbitrary(g) % n).collect())
    }
}

/// An arbitrary permutation of `[n]` with `n` a small power of two.
#[derive(Debug, Clone)]
struct IndexPermutation(Vec<usize>);

impl Arbitrary for IndexPermutation {
    fn arbitrary(g: &mut Gen) -> Self {
        let m = *g.choose(&[1u32, 2, 3, 4, 5, 6]).expect("nonempty");
        let n = 1usize << m;
        let mut perm: Vec<usize> = (0..n).collect();
        // Fisher-Yates driven by the generator.
        for i in (1..n).rev() {
            perm.swap(i, usize::arbitrary(g) % (i + 1));
        }
        Self(perm)
    }
}

#[quickcheck]
fn benes_mi_realizes_every_permutation(perm: IndexPermutation) -> bool {
    let n = perm.0.len();
    let m = n.trailing_zeros();
    (1..=m + 1).all(|le| {
        let compiled = optimize(BenesPermMi::new(&perm.0, le).canonical());
        run(&compiled, n) == perm.0
    })
}

#[quickcheck]
fn bdb_mi_realizes_every_function(func: IndexFunction) -> bool {
    let n = func.0.len();
    let m = n.trailing_zeros();
    (1..=m + 1).all(|le| {
        let compiled = optimize(BdbFuncMi::new(&func.0, le).canonical());
        run(&compiled, n) == func.0
    })
}

#[quickcheck]
fn optimize_preserves_the_realized_function(func: IndexFunction) -> bool {
    let n = func.0.len();
    let rows = BdbFuncMi::new(&func.0, 1).canonical();
    run(&optimize(rows.clone()), n) == run(&rows, n)
}
