use clap::Parser as ClapParser;
use std::{process, sync::Arc};

use heap::{GcSettings, GcStats, MiniMark, SimpleArenaCollection, parse_size};

mod workload;

use workload::{Simulation, Workload, build_types};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Workload to run
    #[arg(long, value_enum, default_value_t = Workload::Mixed)]
    workload: Workload,

    /// Number of iterations of the workload
    #[arg(long, default_value_t = 10, help = "How many times to repeat the workload")]
    iterations: usize,

    /// Nursery size override
    #[arg(long, value_parser = parse_size_arg, help = "Nursery size, e.g. 4MB")]
    nursery_size: Option<usize>,

    /// Growth factor override
    #[arg(long, help = "Heap growth factor before the next major collection")]
    major_threshold: Option<f64>,

    /// Soft heap limit
    #[arg(long, value_parser = parse_size_arg, help = "Limit for memory outside the nursery")]
    max_heap: Option<usize>,

    /// Card size of large arrays
    #[arg(long, help = "Array items per card marker bit, 0 disables card marking")]
    card_page_indices: Option<usize>,

    /// Use the list-of-blocks arena
    #[arg(long, help = "Allocate old objects with the system allocator")]
    simple_arena: bool,

    /// Read MINIMARK_* variables first
    #[arg(long, help = "Apply MINIMARK_NURSERY, MINIMARK_MAJOR_COLLECT, MINIMARK_MAX")]
    from_env: bool,

    /// Heap verification after every collection
    #[arg(long, help = "Check heap invariants after every collection")]
    debug_checks: bool,
}

fn parse_size_arg(text: &str) -> Result<usize, String> {
    parse_size(text).ok_or_else(|| format!("invalid size '{}'", text))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = if cli.from_env {
        GcSettings::from_env()
    } else {
        GcSettings::default()
    };
    if let Some(size) = cli.nursery_size {
        settings.nursery_size = size;
    }
    if let Some(factor) = cli.major_threshold {
        settings.major_collection_threshold = factor;
    }
    if let Some(limit) = cli.max_heap {
        settings.max_heap_size = limit;
    }
    if let Some(indices) = cli.card_page_indices {
        settings.card_page_indices = indices;
    }
    settings.debug_checks |= cli.debug_checks;

    let types = match build_types() {
        Ok(types) => types,
        Err(err) => {
            eprintln!("Error building the type table: {}", err);
            process::exit(1);
        }
    };
    let gc = if cli.simple_arena {
        let ac = SimpleArenaCollection::new(settings.small_request_threshold);
        MiniMark::with_arena(settings, Arc::clone(&types.table), Box::new(ac))
    } else {
        MiniMark::new(settings, Arc::clone(&types.table))
    };
    let gc = match gc {
        Ok(gc) => gc,
        Err(err) => {
            eprintln!("Error creating the collector: {}", err);
            process::exit(1);
        }
    };

    let mut sim = Simulation::new(gc, types);
    match sim.run(cli.workload, cli.iterations) {
        Ok(verified) => {
            println!("{:?}: {} objects verified", cli.workload, verified);
            print_stats(&sim.gc().stats());
        }
        Err(err) => {
            eprintln!("Error running {:?}: {}", cli.workload, err);
            print_stats(&sim.gc().stats());
            process::exit(1);
        }
    }
}

fn print_stats(stats: &GcStats) {
    println!("minor collections:   {}", stats.minor_collections);
    println!("major collections:   {}", stats.major_collections);
    println!("promoted bytes:      {}", stats.promoted_bytes);
    println!("finalizers run:      {}", stats.finalizers_run);
    println!("arena memory:        {}", stats.arena_memory);
    println!("large object memory: {}", stats.rawmalloced_memory);
    println!("next major at:       {}", stats.next_major_collection_threshold);
}
