// SPDX-License-Identifier: GPL-2.0
//
// Demo: resolve events, count a busy loop, print the scaled values.

use anyhow::Result;
use clap::Parser;

use perfcount::{parse_event, Count, Counter, Target};

#[derive(Parser, Debug)]
#[command(author, version, about = "Count perf events over a busy-loop workload")]
struct Args {
    /// Event to count, as a perf-style spec (e.g. cpu-cycles,
    /// cpu/event=0xd0,umask=0x82/). Can be given multiple times; all events
    /// are opened as one group.
    #[arg(short, long)]
    event: Vec<String>,

    /// Busy-loop iterations
    #[arg(short, long, default_value = "10000000")]
    iters: u64,
}

fn work(n: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..n {
        acc = acc.wrapping_add(std::hint::black_box(i));
    }
    acc
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut specs = args.event;
    if specs.is_empty() {
        specs = vec!["cpu-cycles".to_string(), "instructions".to_string()];
    }
    let events = specs
        .iter()
        .map(|spec| parse_event(spec))
        .collect::<Result<Vec<_>>>()?;

    let mut counter = Counter::open(Target::ThisThread, &events)?;
    counter.start();
    let acc = work(args.iters);
    counter.stop();

    let mut counts = vec![Count::default(); events.len()];
    counter.read_group(&mut counts)?;

    println!("{} iterations (checksum {:#x})", args.iters, acc);
    for (event, count) in events.iter().zip(&counts) {
        let (val, unit) = count.value();
        if count.time_running < count.time_enabled {
            println!(
                "{:>20.0} {} {} (multiplexed: running {}ns of {}ns)",
                val, unit, event, count.time_running, count.time_enabled
            );
        } else if unit.is_empty() {
            println!("{:>20.0}  {}", val, event);
        } else {
            println!("{:>20.6} {} {}", val, unit, event);
        }
    }
    counter.close();
    Ok(())
}
