//! Weave - runs the three-worker workload under each scheduling policy
//!
//! `weave [priority|fifo|round-robin]` runs one policy; with no argument all
//! three run in turn. `RUST_LOG=spindle=trace` shows every switch.

use std::cell::Cell;
use std::process::ExitCode;
use std::rc::Rc;

use spindle::{Loom, LoomConfig, LoomError, Policy, Priority};

const ROUNDS: usize = 10;
const PRIORITIES: [u8; 3] = [1, 10, 80];

fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_module("spindle", log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let policies = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<Policy>() {
            Ok(policy) => vec![policy],
            Err(err) => {
                eprintln!("weave: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Policy::ALL.to_vec(),
    };

    for policy in policies {
        if let Err(err) = weave(policy) {
            eprintln!("weave: {policy}: {err}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn weave(policy: Policy) -> Result<(), LoomError> {
    println!("== {policy} ==");

    let loom = Loom::new(LoomConfig::new(policy))?;
    let started = Rc::new(Cell::new(0));

    for priority in PRIORITIES {
        let started = Rc::clone(&started);
        let id = loom.spawn(move |loom| worker(loom, &started), Priority::new(priority)?)?;
        match loom.admission(id) {
            Some(admission) => println!("spawned {id}: entrance {admission}"),
            None => println!("spawned {id}: priority {priority}"),
        }
    }

    loom.drain()?;

    let stats = loom.stats();
    println!(
        "{} switches, {} stacks for {} threads",
        stats.context_switches, stats.stacks_allocated, stats.spawns
    );
    Ok(())
}

fn worker(loom: &Loom, started: &Cell<u32>) {
    started.set(started.get() + 1);
    let n = started.get();

    for i in 0..ROUNDS {
        println!("{n} {i}");
        // Round-robin workers give up the CPU only when their slice is spent.
        if loom.policy() == Policy::RoundRobin {
            loom.yield_if_expired();
        } else {
            loom.yield_now();
        }
    }
}
