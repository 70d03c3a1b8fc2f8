//! Behaviour that ends the process, checked from a parent process
//!
//! Each test re-runs this test binary filtered to itself with
//! `SPINDLE_CHILD` set; the child side does the fatal thing and the parent
//! inspects how the child went away.

use std::env;
use std::hint::black_box;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

use spindle::{Loom, LoomConfig, Policy, Priority};

const CHILD_ENV: &str = "SPINDLE_CHILD";

fn is_child(test: &str) -> bool {
    env::var(CHILD_ENV).is_ok_and(|v| v == test)
}

fn run_child(test: &str) -> Output {
    Command::new(env::current_exe().expect("test binary path"))
        .args(["--exact", test, "--nocapture", "--test-threads=1", "--quiet"])
        .env(CHILD_ENV, test)
        .output()
        .expect("spawn child test process")
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn test_exit_drains_then_ends_process() {
    const TEST: &str = "test_exit_drains_then_ends_process";

    if is_child(TEST) {
        let loom = Loom::with_policy(Policy::RoundRobin).expect("valid config");
        for n in 1..=3 {
            loom.spawn(
                move |loom| {
                    for i in 0..4 {
                        println!("worker {n} step {i}");
                        loom.yield_now();
                    }
                },
                Priority::MIN,
            )
            .expect("free slot");
        }
        println!("handing over");
        loom.exit(3);
    }

    let output = run_child(TEST);
    assert_eq!(output.status.code(), Some(3), "child: {output:?}");

    let lines = stdout_lines(&output);
    let ours: Vec<&str> = lines
        .iter()
        .filter_map(|l| {
            ["worker ", "handing over"]
                .iter()
                .find_map(|marker| l.find(marker))
                .map(|at| &l[at..])
        })
        .collect();

    let mut expected = vec!["handing over".to_owned()];
    for i in 0..4 {
        for n in 1..=3 {
            expected.push(format!("worker {n} step {i}"));
        }
    }
    assert_eq!(ours, expected);
}

#[test]
fn test_stack_overflow_hits_guard_page() {
    const TEST: &str = "test_stack_overflow_hits_guard_page";

    if is_child(TEST) {
        let config = LoomConfig::new(Policy::Fifo).stack_size(16 * 1024);
        let loom = Loom::new(config).expect("valid config");
        loom.spawn(
            |_| {
                let mut buf = [0u8; 4 * 1024];
                buf[0] = 1;
                black_box(&mut buf);
                println!("in bounds");
            },
            Priority::MIN,
        )
        .expect("free slot");
        loom.spawn(
            |_| {
                let mut buf = [0u8; 64 * 1024];
                buf[0] = 1;
                black_box(&mut buf);
                println!("overflow survived");
            },
            Priority::MIN,
        )
        .expect("free slot");
        loom.drain().expect("bootstrap");
        println!("drained");
        return;
    }

    let output = run_child(TEST);
    let lines = stdout_lines(&output);
    assert!(lines.iter().any(|l| l.contains("in bounds")), "child: {output:?}");
    assert!(!lines.iter().any(|l| l.contains("overflow survived") || l.contains("drained")));

    // Killed by the fault itself, not by a scheduler abort.
    let signal = output.status.signal();
    assert!(
        signal == Some(libc::SIGSEGV) || signal == Some(libc::SIGBUS),
        "child ended with {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}
