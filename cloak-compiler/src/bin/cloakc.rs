//! Command-line front of the cloak compiler.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::filter::LevelFilter;

use cloak_compiler::{cluster, frontend, lowering, serialize, universalize, Config};
use cloak_crypto::{Schwaemm128128, SessionKey, StaticKeySealer};

#[derive(Debug, Parser)]
#[command(name = "cloakc", version, about = "Compile straight-line programs to encrypted multi-instruction bytecode")]
struct Args {
    /// Name of the output file.
    #[arg(short = 'o', long = "outfile")]
    outfile: PathBuf,

    /// Name of the input file.
    inputfile: PathBuf,

    /// Number of internal registers in the secure element.
    #[arg(short = 'r', value_name = "COUNT")]
    r: u32,

    /// Number of inputs of the secure element.
    #[arg(long, value_name = "COUNT")]
    lin: u32,

    /// Number of outputs of the secure element.
    #[arg(long, value_name = "COUNT")]
    lout: u32,

    /// Maximal number of instructions per multi-instruction.
    #[arg(short = 's', value_name = "COUNT")]
    s: u32,

    /// Word size in bits.
    #[arg(short = 'w', long = "word-size", default_value_t = 32)]
    word_size: u32,

    /// Version tag emitted in the bytecode header.
    #[arg(long = "version-tag", default_value_t = 0)]
    version_tag: u32,

    /// Print helpful statistics on the compilation.
    #[arg(long)]
    stats: bool,

    /// Minimal width of the program.
    #[arg(long, default_value_t = 0)]
    width: usize,

    /// Minimal depth of the program.
    #[arg(long, default_value_t = 0)]
    depth: usize,

    /// Faster compilation, but more multi-instructions.
    #[arg(long = "simple-clusterizer")]
    simple_clusterizer: bool,

    /// Faster compilation, but maybe worse generated code (default).
    #[arg(long, conflicts_with = "no_fast")]
    fast: bool,

    /// Slower compilation, but maybe better generated code.
    #[arg(long = "no-fast")]
    no_fast: bool,

    /// Enable universalization to protect the data flow (default).
    #[arg(long, conflicts_with = "no_universal")]
    universal: bool,

    /// Disable universalization.
    #[arg(long = "no-universal")]
    no_universal: bool,

    /// Verbosity level; at 5 and above, the major representations of the
    /// program are printed to stderr.
    #[arg(long, default_value_t = 0)]
    verbose: u8,

    /// Write Graphviz snapshots of the dataflow graph to `PREFIX_<stage>.gv`.
    #[arg(long = "dump-dfg", value_name = "PREFIX")]
    dump_dfg: Option<String>,

    /// Seed for the universalizer's randomness, for reproducible builds.
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            r: self.r,
            l_in: self.lin,
            l_out: self.lout,
            s: self.s,
            word_size: self.word_size,
            version: self.version_tag,
            width: self.width,
            depth: self.depth,
            simple_clusterizer: self.simple_clusterizer,
            fast: self.fast || !self.no_fast,
            universal: self.universal || !self.no_universal,
        }
    }

    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::WARN,
            1..=4 => LevelFilter::INFO,
            5..=9 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

fn dump_dfg(prefix: &Option<String>, stage: &str, dfg: &cloak_compiler::dfg::Dfg) -> anyhow::Result<()> {
    if let Some(prefix) = prefix {
        let path = format!("{prefix}_{stage}.gv");
        fs::write(&path, dfg.to_dot()).with_context(|| format!("writing {path}"))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    config.validate()?;

    let total_start = Instant::now();

    let source = fs::read_to_string(&args.inputfile)
        .with_context(|| format!("reading {}", args.inputfile.display()))?;
    let pass_start = Instant::now();
    let hlir = frontend::parse_program(&source)?;
    if args.stats {
        println!("Frontend: {:.2} sec", pass_start.elapsed().as_secs_f64());
        println!("  HLIR size: {} HLIs", hlir.instrs.len());
    }
    if args.verbose >= 5 {
        eprintln!("HLIR:\n{hlir}");
    }

    let pass_start = Instant::now();
    let mut dfg = cluster::clusterize(hlir, &config)?;
    if args.stats {
        println!("Clusterization: {:.2} sec", pass_start.elapsed().as_secs_f64());
        println!("  MLIR size: {} MLMIs", dfg.node_count());
    }
    dump_dfg(&args.dump_dfg, "clusterized", &dfg)?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if config.universal {
        let pass_start = Instant::now();
        universalize::universalize(&mut dfg, &config, &mut rng)?;
        if args.stats {
            println!("Universalization: {:.2} sec", pass_start.elapsed().as_secs_f64());
            println!("  MLIR size: {} MLMIs", dfg.node_count());
        }
        dump_dfg(&args.dump_dfg, "universalized", &dfg)?;
    }

    let pass_start = Instant::now();
    let llir = lowering::lower(&dfg, &config)?;
    if args.stats {
        println!("Lowering: {:.2} sec", pass_start.elapsed().as_secs_f64());
    }
    if args.verbose >= 5 {
        eprintln!("LLIR:\n{llir}");
    }

    let pass_start = Instant::now();
    let session = SessionKey::random(&mut rng);
    let file = fs::File::create(&args.outfile)
        .with_context(|| format!("creating {}", args.outfile.display()))?;
    let mut out = BufWriter::new(file);
    serialize::write_program(
        &llir,
        &config,
        &serialize::ELEMENT_KEY,
        &session,
        &Schwaemm128128,
        &StaticKeySealer::new(Schwaemm128128),
        &mut out,
    )?;
    out.flush().context("flushing the output file")?;
    if args.stats {
        println!("Serialization: {:.2} sec", pass_start.elapsed().as_secs_f64());
        println!("Total compilation time: {:.2} sec", total_start.elapsed().as_secs_f64());
    }

    Ok(())
}
