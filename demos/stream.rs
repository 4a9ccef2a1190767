//! STREAM add over striped arrays: `c[i] = a[i] + b[i]`
//!
//! Usage: `cargo run --release --example stream -- <log2_num_elements> <num_trials>`
//!
//! The machine shape comes from `DISTMEM_*` environment variables, for
//! example `DISTMEM_PARTITIONS=8 DISTMEM_DEFAULT_GRAIN=2`. Set `RUST_LOG` to
//! see allocation and migration events.

use clap::Parser;
use distmem::prelude::*;
use std::process;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// The three STREAM vectors, replicated so every partition reads its
/// handles locally
struct Stream {
    a: StripedArray<i64>,
    b: StripedArray<i64>,
    c: StripedArray<i64>,
}

impl Stream {
    fn new(machine: &std::sync::Arc<Machine>, n: usize) -> Self {
        Self {
            a: StripedArray::with_len(machine, n),
            b: StripedArray::with_len(machine, n),
            c: StripedArray::with_len(machine, n),
        }
    }

    fn init(&mut self, policy: ExecutionPolicy) {
        self.a.apply_local(policy, |_, x| *x = 1);
        self.b.apply_local(policy, |_, x| *x = 2);
        self.c.apply_local(policy, |_, x| *x = -1);
    }

    fn run(&mut self, policy: ExecutionPolicy) {
        let Stream { a, b, c } = self;
        c.apply_local(policy, |i, x| *x = a[i] + b[i]);
    }

    fn validate(&self) -> std::result::Result<(), (usize, i64)> {
        match self.c.iter().enumerate().find(|&(_, &v)| v != 3) {
            Some((i, &v)) => Err((i, v)),
            None => Ok(()),
        }
    }
}

impl ShallowCopy for Stream {
    unsafe fn shallow_copy(&self, tag: Shallow) -> Self {
        Self {
            a: self.a.shallow_copy(tag),
            b: self.b.shallow_copy(tag),
            c: self.c.shallow_copy(tag),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "stream", about = "STREAM add over striped arrays", long_about = None)]
struct Arguments {
    /// Base-2 logarithm of the number of elements per array
    #[arg(value_parser = clap::value_parser!(u32).range(1..40))]
    log2_num_elements: u32,

    /// Number of timed trials
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    num_trials: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    let config = MachineConfig::load()?;
    let machine = Machine::new(config)?;
    let policy = machine.default_policy();
    let n = 1usize << args.log2_num_elements;

    println!("=== STREAM add ===");
    println!(
        "elements: {}, partitions: {}, policy: {:?}\n",
        n,
        machine.partition_count(),
        policy
    );

    let mut bench = ShallowReplica::new(&machine, Stream::new(&machine, n));
    bench.init(policy);

    for trial in 0..args.num_trials {
        let start = Instant::now();
        bench.run(policy);
        let seconds = start.elapsed().as_secs_f64();

        let bytes = (n * std::mem::size_of::<i64>() * 3) as f64;
        let rate = if seconds == 0.0 { 0.0 } else { bytes / seconds };
        tracing::info!(trial, seconds, "trial finished");
        println!("trial {:3}: {:10.2} MB/s", trial, rate / 1_000_000.0);
    }

    if let Err((i, v)) = bench.validate() {
        eprintln!("VALIDATION ERROR: c[{}] == {} (supposed to be 3)", i, v);
        process::exit(1);
    }

    let stats = machine.stats();
    println!(
        "\nallocations: {}, migrations: {}, spawns: {}",
        stats.allocations(),
        stats.migrations(),
        stats.spawns()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_parse() {
        let args = Arguments::try_parse_from(["stream", "10", "3"]).unwrap();
        assert_eq!(args.log2_num_elements, 10);
        assert_eq!(args.num_trials, 3);
    }

    #[test]
    fn test_arguments_reject_out_of_range() {
        assert!(Arguments::try_parse_from(["stream", "0", "3"]).is_err());
        assert!(Arguments::try_parse_from(["stream", "40", "3"]).is_err());
        assert!(Arguments::try_parse_from(["stream", "10", "0"]).is_err());
        assert!(Arguments::try_parse_from(["stream", "10"]).is_err());
    }

    #[test]
    fn test_small_run_validates() {
        let machine = Machine::with_partitions(4).unwrap();
        let policy = ExecutionPolicy::parallel(1);
        let mut bench = ShallowReplica::new(&machine, Stream::new(&machine, 1 << 6));

        bench.init(policy);
        bench.run(policy);
        assert_eq!(bench.validate(), Ok(()));
    }
}
