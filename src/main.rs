//! SHARDLINE - Partitioned Key-Value Store Node
//! Interactive single-node shell: ownership events are typed in by hand.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use shardline::config::Config;
use shardline::node::Node;
use shardline::resolver::CounterResolver;
use shardline::types::PartitionId;

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║            SHARDLINE Store Node           ║");
    println!("  ║    Partitioned Sequenced KV Store v0.1    ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    own <pid>                - Become owner of a partition");
    println!("    release <pid>            - Release a partition");
    println!("    put <pid> <key> <value>  - Store a value");
    println!("    incr <pid> <key> <n>     - Add n to a counter");
    println!("    get <pid> <key>          - Look up a value");
    println!("    parts                    - List owned partitions");
    println!("    info                     - Show node metrics");
    println!("    exit                     - Shutdown node");
    println!();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let node = match Node::builder(Config::new(data_dir))
        .resolver(Arc::new(CounterResolver))
        .build()
    {
        Ok(node) => Arc::new(node),
        Err(err) => {
            eprintln!("[ERROR] Failed to start node: {}", err);
            std::process::exit(1);
        }
    };
    let handler = node.handler().clone();

    // Ctrl-C runs the same ordered shutdown as `exit`.
    let on_signal = node.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        println!();
        println!("  Shutting down SHARDLINE...");
        let code = match on_signal.shutdown() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("[ERROR] Shutdown failed: {}", e);
                1
            }
        };
        std::process::exit(code);
    }) {
        log::warn!("cannot install Ctrl-C handler: {}", e);
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("shardline> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "own" => {
                let Some(pid) = partition_arg(&parts, 2, "own <pid>") else {
                    continue;
                };
                match node.become_owner(pid) {
                    Ok(()) if node.lifecycle().wait_online(pid, Duration::from_secs(10)) => {
                        println!("  OK (partition {} online)", pid)
                    }
                    Ok(()) => println!("  partition {} still {}", pid, node.lifecycle().state(pid)),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "release" => {
                let Some(pid) = partition_arg(&parts, 2, "release <pid>") else {
                    continue;
                };
                match node.release(pid) {
                    Ok(()) => println!("  OK (partition {} released)", pid),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "put" | "set" => {
                let Some(pid) = partition_arg(&parts, 4, "put <pid> <key> <value>") else {
                    continue;
                };
                let value = parts[3..].join(" ");
                if handler.store(parts[2].as_bytes(), pid, value.as_bytes(), false) {
                    println!("  OK");
                } else {
                    println!("  FAILED (see log)");
                }
            }
            "incr" => {
                let Some(pid) = partition_arg(&parts, 4, "incr <pid> <key> <n>") else {
                    continue;
                };
                let Ok(delta) = parts[3].parse::<i64>() else {
                    println!("  <n> must be an integer");
                    continue;
                };
                let delta = CounterResolver::encode(delta);
                if handler.store(parts[2].as_bytes(), pid, &delta, true) {
                    println!("  OK");
                } else {
                    println!("  FAILED (see log)");
                }
            }
            "get" => {
                let Some(pid) = partition_arg(&parts, 3, "get <pid> <key>") else {
                    continue;
                };
                match handler.lookup(parts[2].as_bytes(), pid) {
                    Ok(Some(value)) => println!("  {}", render(&value)),
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "parts" | "partitions" => {
                let owned = node.lifecycle().owned();
                if owned.is_empty() {
                    println!("  (none)");
                }
                for (pid, state) in owned {
                    match node.directory().get(pid) {
                        Ok(p) => println!(
                            "  {:>5}  {:<13} seq {:<8} applied {:<8} cached {}",
                            pid,
                            state,
                            p.sequence(),
                            p.applied_sequence(),
                            p.cache().len()
                        ),
                        Err(_) => println!("  {:>5}  {}", pid, state),
                    }
                }
            }
            "info" | "stats" => {
                println!("{}", node.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down SHARDLINE...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = node.shutdown() {
        eprintln!("[ERROR] Shutdown failed: {}", e);
        std::process::exit(1);
    }
}

fn partition_arg(parts: &[&str], arity: usize, usage: &str) -> Option<PartitionId> {
    if parts.len() < arity {
        println!("  Usage: {}", usage);
        return None;
    }
    match parts[1].parse() {
        Ok(pid) => Some(pid),
        Err(_) => {
            println!("  <pid> must be a non-negative integer");
            None
        }
    }
}

fn render(value: &[u8]) -> String {
    let printable = value
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ');
    if printable {
        return format!("\"{}\"", String::from_utf8_lossy(value));
    }
    match CounterResolver::decode(value) {
        Some(n) => n.to_string(),
        None => format!("<{} bytes>", value.len()),
    }
}
