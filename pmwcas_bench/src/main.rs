//! PMwCAS throughput benchmark.
//!
//! N pinned threads each perform M successful K-word increments over a shared
//! set of persistent fields; the harness reports per-run throughput and
//! checks the field sum against the number of increments performed.

use clap::Parser;
use pmwcas::{MAX_THREADS, PMWCAS_CAPACITY, Pool, pload};
use rand::Rng;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "pmwcas_bench")]
#[command(about = "Multi-threaded PMwCAS increment benchmark")]
struct Args {
    /// Pool file (on a DAX filesystem for meaningful numbers)
    #[arg(short, long, default_value = "/tmp/pmwcas_bench.pool")]
    pool: PathBuf,

    /// Number of worker threads
    #[arg(short = 'n', long, default_value = "4")]
    threads: usize,

    /// Successful operations per thread per run
    #[arg(short, long, default_value = "100000")]
    iters: usize,

    /// Words per operation
    #[arg(short = 'k', long, default_value = "4")]
    words: usize,

    /// Number of shared fields
    #[arg(short, long, default_value = "64")]
    fields: usize,

    /// Number of measured runs
    #[arg(short, long, default_value = "3")]
    runs: usize,

    /// Pin worker threads to cores
    #[arg(long)]
    pin: bool,
}

fn run_once(args: &Args, pool: &Arc<Pool>, cores: &[core_affinity::CoreId]) -> f64 {
    let fields = args.fields;
    let words_base = pool.data_ptr() as usize;
    unsafe {
        let words = words_base as *mut u64;
        for i in 0..fields {
            words.add(i).write_volatile(0);
        }
        pmem::persist(pool.data_ptr(), fields * 8);
    }

    let barrier = Arc::new(Barrier::new(args.threads + 1));
    let handles: Vec<_> = (0..args.threads)
        .map(|t| {
            let pool = Arc::clone(pool);
            let barrier = Arc::clone(&barrier);
            let core = if args.pin {
                cores.get(t % cores.len()).copied()
            } else {
                None
            };
            let (iters, k, fields) = (args.iters, args.words, fields);
            thread::spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                let words = words_base as *mut u64;
                let desc = pool.get().expect("thread slot");
                let mut rng = rand::rng();
                let mut indices: Vec<usize> = (0..fields).collect();
                let mut retries = 0u64;
                barrier.wait();

                for _ in 0..iters {
                    indices.shuffle(&mut rng);
                    let mut chosen = indices[..k].to_vec();
                    chosen.sort_unstable();
                    loop {
                        for &i in &chosen {
                            let addr = unsafe { words.add(i) };
                            let val = unsafe { pload(addr, Ordering::SeqCst) };
                            unsafe {
                                desc.add(addr, val, val + 1, Ordering::SeqCst)
                                    .expect("add within capacity");
                            }
                        }
                        if desc.pmwcas() {
                            break;
                        }
                        retries += 1;
                    }
                }
                retries
            })
        })
        .collect();

    barrier.wait();
    let start = Instant::now();
    let retries: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let elapsed = start.elapsed();

    let words = words_base as *mut u64;
    let sum: u64 = (0..fields)
        .map(|i| unsafe { pload(words.add(i), Ordering::SeqCst) })
        .sum();
    let expected = (args.threads * args.iters * args.words) as u64;
    assert_eq!(sum, expected, "lost or duplicated increments");

    let ops = (args.threads * args.iters) as f64;
    let mops = ops / elapsed.as_secs_f64() / 1e6;
    println!(
        "  {:.3} s, {:.3} Mops/s, {} retries",
        elapsed.as_secs_f64(),
        mops,
        retries
    );
    mops
}

fn main() {
    let args = Args::parse();
    assert!(args.words <= PMWCAS_CAPACITY, "k exceeds PMWCAS_CAPACITY");
    assert!(args.words <= args.fields, "k exceeds the field count");
    assert!(args.threads <= MAX_THREADS, "threads exceed MAX_THREADS");

    let mut rng = rand::rng();
    let unique: u32 = rng.random();
    let path = args.pool.with_extension(format!("{unique:08x}"));

    let pool = Arc::new(Pool::open(&path, "pmwcas_bench").expect("pool open"));
    assert!(pool.data_len() >= args.fields * 8, "pool data area too small");

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    if args.pin && cores.is_empty() {
        eprintln!("core enumeration failed, running unpinned");
    }

    println!(
        "pmwcas_bench: {} threads x {} iters, k={}, {} fields",
        args.threads, args.iters, args.words, args.fields
    );
    let mut best = 0f64;
    for run in 0..args.runs {
        print!("run {run}:");
        let mops = run_once(&args, &pool, &cores);
        best = best.max(mops);
    }
    println!("best: {best:.3} Mops/s");

    drop(pool);
    let _ = std::fs::remove_file(&path);
}
