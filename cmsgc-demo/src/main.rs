use std::env;
use std::hint::black_box;
use std::process::ExitCode;
use std::ptr::NonNull;

use cmsgc::{Heap, HeapConfig, Verbosity};
use log::LevelFilter;

struct Options {
    config: HeapConfig,
    objects: usize,
}

// Later flags override what an earlier `--config` file set.
const USAGE: &str = "Usage: cmsgc-demo [--config path] [--verbosity off|summary|trace] [--objects N]";

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        config: HeapConfig {
            initial_threshold: 1024,
            verbosity: Verbosity::Trace,
            ..HeapConfig::default()
        },
        objects: 0,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || args.next().ok_or_else(|| format!("{arg} needs a value"));

        match arg.as_str() {
            "--config" => {
                let path = value()?;
                let data = std::fs::read_to_string(&path).map_err(|err| format!("{path}: {err}"))?;
                options.config = serde_json::from_str(&data).map_err(|err| format!("{path}: {err}"))?;
            },
            "--verbosity" => {
                options.config.verbosity = value()?.parse().map_err(|err| format!("{err}"))?;
            },
            "--objects" => {
                let count = value()?;
                options.objects = count.parse().map_err(|_| format!("not a number: {count}"))?;
            },
            _ => return Err(format!("unknown argument {arg}")),
        }
    }

    Ok(options)
}

fn free1(object: NonNull<u8>) {
    println!("Free {:p}", object);
}

fn free_pair(_: NonNull<u8>) {}

/// Allocates a 128 byte object with a 16 byte object in its third slot. Both
/// get `finalizer`.
fn pair(heap: &Heap, finalizer: fn(NonNull<u8>)) -> NonNull<u8> {
    let outer = heap.allocate(128);
    let inner = heap.allocate(16);

    unsafe {
        outer.as_ptr().cast::<usize>().add(2).write(inner.as_ptr() as usize);
        heap.register_finalizer(outer, finalizer);
        heap.register_finalizer(inner, finalizer);
    }

    outer
}

#[inline(never)]
fn run(heap: &Heap, objects: usize) {
    let obj1 = black_box(pair(heap, free1));
    println!("Allocated {:p}", obj1);

    for _ in 0..objects {
        pair(heap, free_pair);
    }

    heap.collect();
    println!("Kept {:p}: {}", obj1, heap.is_live(obj1));
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        },
    };

    let level = match options.config.verbosity {
        Verbosity::Off => LevelFilter::Off,
        Verbosity::Summary => LevelFilter::Debug,
        Verbosity::Trace => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let anchor = 0usize;
    let heap = match Heap::new(&anchor, options.config) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        },
    };

    run(&heap, options.objects);

    // Whatever `run` left behind is unreachable now, unless a stale copy of
    // its address is still sitting in this frame.
    heap.collect();

    match serde_json::to_string_pretty(&heap.stats()) {
        Ok(stats) => println!("{stats}"),
        Err(err) => eprintln!("Error: {err}"),
    }

    heap.destroy();
    ExitCode::SUCCESS
}
