//! End-to-end scenarios: from source text through clusterization,
//! universalization, lowering, and serialization, back through the reader
//! and the reference interpreter.

use cloak_asm::{MemId, Opcode, RegId, RegOrImm, Sources, Word};
use cloak_compiler::serialize::doubles::{PlainAead, PlainSealer};
use cloak_compiler::{cluster, compile, frontend, interp, lowering, serialize, Config};
use cloak_crypto::{Schwaemm128128, SessionKey};
use rand::rngs::StdRng;
use rand::SeedableRng;

const XOR_ADD_SOURCE: &str = "\
# o = (a ^ b) + (c ^ d)
input m0 m1 m2 m3
output m6
xor m4, m0, m1
xor m5, m2, m3
add m6, m4, m5
";

fn session() -> SessionKey {
    SessionKey::new([7; 32])
}

#[test]
fn single_xor_preserves_its_shape() {
    let hlir = frontend::parse_program("input m0 m1\noutput m2\nxor m2, m0, m1\n")
        .expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(4, 2, 2, 2)
    };

    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    assert_eq!(dfg.node_count(), 1);
    let node = dfg.node(dfg.node_ids()[0]);
    assert_eq!(node.inputs, vec![MemId(0), MemId(1)]);
    assert_eq!(node.outputs, vec![MemId(2)]);

    let llir = lowering::lower(&dfg, &config).expect("lowers");
    assert_eq!(llir.instrs.len(), 1);
    assert_eq!(
        llir.instrs[0].seq.instrs,
        vec![cloak_asm::Lli::new(
            Opcode::XOR,
            RegId(2),
            Sources::Binary(RegOrImm::Reg(RegId(0)), RegOrImm::Reg(RegId(1))),
        )]
    );
}

#[test]
fn lowering_preserves_the_source_semantics() {
    let hlir = frontend::parse_program(XOR_ADD_SOURCE).expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(8, 4, 2, 4)
    };

    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");

    for inputs in [[1u64, 2, 3, 4], [0, 0, 0, 0], [0xffff_ffff, 1, 2, 3]] {
        let expected = ((inputs[0] ^ inputs[1]) + (inputs[2] ^ inputs[3])) & 0xffff_ffff;
        let got = interp::execute(&llir, config.r, config.l_out, config.word_size, &inputs)
            .expect("executes");
        assert_eq!(got, vec![expected]);
    }
}

#[test]
fn universal_pipeline_computes_the_same_function() {
    let hlir = frontend::parse_program(XOR_ADD_SOURCE).expect("parses");
    let config = Config::new(4, 2, 2, 4);
    let mut rng = StdRng::seed_from_u64(41);

    let mut bytes = Vec::new();
    compile(hlir, &config, &session(), &mut rng, &mut bytes).expect("compiles");

    let (header, prog) =
        serialize::read_program(&bytes, &Schwaemm128128, &session()).expect("parses");
    assert_eq!(header.l_in, 2);
    assert_eq!(header.l_out, 2);
    assert_eq!(header.r, 4);

    for llmi in &prog.instrs {
        assert!(llmi.inputs.len() <= header.l_in as usize);
        assert!(llmi.outputs.len() <= header.l_out as usize);
        assert!(llmi.seq.len() <= header.s as usize);
    }

    for inputs in [[9u64, 4, 100, 1], [1, 1, 1, 1], [0, 0xdead_beef, 5, 5]] {
        let expected = ((inputs[0] ^ inputs[1]) + (inputs[2] ^ inputs[3])) & 0xffff_ffff;
        let got = interp::execute(&prog, header.r, header.l_out, header.word_size, &inputs)
            .expect("executes");
        assert_eq!(got, vec![expected]);
    }
}

#[test]
fn universal_build_is_reproducible_for_a_fixed_seed() {
    let config = Config::new(4, 2, 2, 4);
    let build = || {
        let hlir = frontend::parse_program(XOR_ADD_SOURCE).expect("parses");
        let mut rng = StdRng::seed_from_u64(5);
        let mut bytes = Vec::new();
        compile(hlir, &config, &session(), &mut rng, &mut bytes).expect("compiles");
        bytes
    };
    assert_eq!(build(), build());
}

#[test]
fn narrowest_element_still_compiles() {
    // l_in == l_out == 1 leaves no room for universalization but the
    // plain pipeline must work.
    let hlir = frontend::parse_program("input m0\noutput m2\nmov m1, m0\nadd m2, m1, 1\n")
        .expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(2, 1, 1, 2)
    };

    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");

    let mut bytes = Vec::new();
    serialize::write_program(
        &llir,
        &config,
        &serialize::ELEMENT_KEY,
        &session(),
        &PlainAead,
        &PlainSealer,
        &mut bytes,
    )
    .expect("serializes");
    let (header, prog) = serialize::read_program(&bytes, &PlainAead, &session()).expect("parses");

    let got = interp::execute(&prog, header.r, header.l_out, header.word_size, &[41])
        .expect("executes");
    assert_eq!(got, vec![42]);
}

#[test]
fn serialized_stream_round_trips_byte_for_byte() {
    let hlir = frontend::parse_program(XOR_ADD_SOURCE).expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(8, 4, 2, 4)
    };
    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");

    let mut bytes = Vec::new();
    serialize::write_program(
        &llir,
        &config,
        &serialize::ELEMENT_KEY,
        &session(),
        &PlainAead,
        &PlainSealer,
        &mut bytes,
    )
    .expect("serializes");

    let (_, parsed) = serialize::read_program(&bytes, &PlainAead, &session()).expect("parses");
    let mut again = Vec::new();
    serialize::write_program(
        &parsed,
        &config,
        &serialize::ELEMENT_KEY,
        &session(),
        &PlainAead,
        &PlainSealer,
        &mut again,
    )
    .expect("serializes");
    assert_eq!(again, bytes);
}

#[test]
fn cmov_survives_the_whole_pipeline() {
    let hlir = frontend::parse_program(
        "input m0 m1 m2\noutput m4\nlt m3, m1, m2\ncmov m4, m3, m1, m2\n",
    )
    .expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(8, 3, 1, 4)
    };

    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");

    // min(m1, m2), with m0 unused.
    for (a, b, expected) in [(10u64, 20u64, 10u64), (20, 10, 10), (5, 5, 5)] {
        let got = interp::execute(&llir, config.r, config.l_out, config.word_size, &[0, a, b])
            .expect("executes");
        assert_eq!(got, vec![expected]);
    }
}

#[test]
fn invalid_shapes_are_rejected_up_front() {
    let hlir = frontend::parse_program("input m0 m1\noutput m2\nxor m2, m0, m1\n")
        .expect("parses");
    let config = Config::new(3, 2, 2, 4);
    let mut rng = StdRng::seed_from_u64(1);
    let mut bytes = Vec::new();

    let err = compile(hlir, &config, &session(), &mut rng, &mut bytes);
    assert!(matches!(err, Err(cloak_compiler::Error::Config(_))));
    assert!(bytes.is_empty(), "nothing is written on a config error");
}

#[test]
fn duplicate_sources_read_the_same_cell() {
    let hlir = frontend::parse_program("input m0\noutput m1\nadd m1, m0, m0\n")
        .expect("parses");
    let config = Config {
        universal: false,
        ..Config::new(2, 1, 1, 1)
    };

    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");
    // Both operands resolve to the single input register.
    assert_eq!(
        llir.instrs[0].seq.instrs[0].srcs,
        Sources::Binary(RegOrImm::Reg(RegId(0)), RegOrImm::Reg(RegId(0)))
    );

    let got = interp::execute(&llir, config.r, config.l_out, config.word_size, &[21])
        .expect("executes");
    assert_eq!(got, vec![42]);
}

#[test]
fn word_size_is_honored_end_to_end() {
    let hlir = frontend::parse_program("input m0 m1\noutput m2\nadd m2, m0, m1\n")
        .expect("parses");
    let config = Config {
        universal: false,
        word_size: 8,
        ..Config::new(4, 2, 2, 2)
    };
    let dfg = cluster::clusterize(hlir, &config).expect("clusterizes");
    let llir = lowering::lower(&dfg, &config).expect("lowers");

    let got: Vec<Word> = interp::execute(&llir, config.r, config.l_out, config.word_size, &[200, 100])
        .expect("executes");
    assert_eq!(got, vec![44]);
}
