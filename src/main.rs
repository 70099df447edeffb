#[macro_use]
extern crate log;

use std::fs;

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use fec_transport_sim::injector::{annotate, relabel_as_dummy, FecInjector, InjectorConfig};
use fec_transport_sim::simulator::{Simulator, SimulatorConfig};
use fec_transport_sim::trace::{parse_trace, write_trace};
use fec_transport_sim::Strategy;

#[derive(Parser)]
struct Args {
    /// Path to the input trace (tab-separated, one packet per line).
    #[clap(short = 'i', long = "input")]
    input: String,

    /// Path to write the received trace to.
    #[clap(short = 'o', long = "output")]
    output: String,

    /// Per-packet loss probability in [0, 1).
    #[clap(long = "loss", default_value = "0.0")]
    loss_rate: f64,

    /// Round-trip time in seconds.
    #[clap(long = "rtt", default_value = "0.1")]
    rtt: f64,

    /// Per-direction ceiling on packets sent but not yet acknowledged.
    #[clap(long = "max-inflight", default_value = "20")]
    max_inflight: u64,

    /// Fraction of real packets relabeled as dummy slots before injection.
    #[clap(long = "external-fec-rate", default_value = "0.0")]
    external_fec_rate: f64,

    /// FEC injection strategy.
    #[clap(short = 'f', long = "strategy", default_value = "A")]
    strategy: String,

    /// Strategy C/D history window.
    #[clap(short = 'w', long = "window", default_value = "32")]
    window_size: u64,

    /// Strategy B block size.
    #[clap(short = 'b', long = "block-size", default_value = "10")]
    block_size: u64,

    /// RNG seed, shared by the injector and the simulator.
    #[clap(short = 's', long = "seed", default_value = "1")]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let strategy: Strategy = args.strategy.parse().context("parsing --strategy")?;

    let input = fs::read_to_string(&args.input)
        .with_context(|| format!("reading input trace {:?}", args.input))?;
    let mut scheduled = parse_trace(&input).context("parsing input trace")?;

    if args.external_fec_rate > 0.0 {
        let mut rng = SmallRng::seed_from_u64(args.seed);
        relabel_as_dummy(&mut scheduled, args.external_fec_rate, &mut rng);
    }

    info!(
        "Injecting strategy {:?} over {} scheduled packets",
        strategy,
        scheduled.len()
    );

    let mut injector = FecInjector::new(InjectorConfig {
        strategy,
        window_size: args.window_size,
        block_size: args.block_size,
        seed: args.seed,
    });
    let annotated = annotate(scheduled, &mut injector);

    let mut simulator = Simulator::new(
        annotated,
        SimulatorConfig {
            loss_rate: args.loss_rate,
            rtt: args.rtt,
            max_inflight: args.max_inflight,
            seed: args.seed,
            external_fec_rate: args.external_fec_rate,
            block_size: args.block_size,
        },
    )
    .context("constructing simulator")?;

    let (received, stats) = simulator.simulate();

    fs::write(&args.output, write_trace(&received))
        .with_context(|| format!("writing received trace {:?}", args.output))?;

    println!("{}", stats.to_line());

    Ok(())
}
