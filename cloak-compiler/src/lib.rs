//! Compiler lowering straight-line programs to encrypted multi-instruction
//! bytecode for a secure element.
//!
//! The element executes multi-instructions: bounded bundles of arithmetic
//! run atomically inside an encryption boundary, fed from an addressable
//! memory over a bus. The pipeline here takes a straight-line three-address
//! program and:
//!
//! 1. groups its instructions into capacity-respecting multi-instructions
//!    over a dataflow graph ([`cluster`]),
//! 2. optionally reshapes the graph into a rectangle of identically-shaped
//!    blocks wired through secret permutation networks, so neither the
//!    data flow nor the program shape leaks on the bus ([`universalize`]),
//! 3. allocates each block's registers ([`regalloc`], [`lowering`]),
//! 4. serializes the result, encrypting every block body under a session
//!    key sealed to the element ([`serialize`]).

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod cluster;
pub mod config;
pub mod dfg;
pub mod error;
pub mod frontend;
pub mod interp;
pub mod lowering;
pub mod rectangularize;
pub mod regalloc;
pub mod routing;
pub mod serialize;
pub mod universalize;

pub use config::Config;
pub use error::Error;

use std::io::Write;

use cloak_asm::HlirProgram;
use cloak_crypto::{Schwaemm128128, SessionKey, StaticKeySealer};
use rand::Rng;

/// Run the whole pipeline: clusterize, universalize (unless disabled),
/// lower, and serialize to `out` under `session`.
///
/// `rng` drives the universalizer's random padding choices; seed it for
/// reproducible builds.
pub fn compile<W: Write>(
    hlir: HlirProgram,
    config: &Config,
    session: &SessionKey,
    rng: &mut impl Rng,
    out: &mut W,
) -> Result<(), Error> {
    config.validate()?;

    let mut dfg = cluster::clusterize(hlir, config)?;
    if config.universal {
        universalize::universalize(&mut dfg, config, rng)?;
    }
    let llir = lowering::lower(&dfg, config)?;

    serialize::write_program(
        &llir,
        config,
        &serialize::ELEMENT_KEY,
        session,
        &Schwaemm128128,
        &StaticKeySealer::new(Schwaemm128128),
        out,
    )
}
