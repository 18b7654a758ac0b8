use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use uuid::Uuid;

use simbake::cli::{Args, Command};
use simbake::core::poller::ProgressPoller;
use simbake::{
    AttributeDescriptor, AttributeDomain, ComputeRequest, FrameCache, LocalEngineFactory,
    SessionRegistry, SetupDescriptor,
};

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    match args.command {
        Command::Bake {
            cache_dir,
            name,
            frames,
            elements,
            time_step,
            quota_mb,
            adaptive,
            timeout_sec,
        } => {
            let setup = SetupDescriptor::new(
                name,
                elements,
                vec![
                    AttributeDescriptor::new("density", AttributeDomain::Point, 1),
                    AttributeDescriptor::new("velocity", AttributeDomain::Point, 3),
                ],
            );
            let mut registry = SessionRegistry::new(Arc::new(LocalEngineFactory));
            let id = Uuid::new_v4();
            registry
                .create(id, &cache_dir, &setup, quota_mb * 1024 * 1024)
                .with_context(|| format!("creating cache at {}", cache_dir.display()))?;

            let mut request = ComputeRequest::forward(frames);
            request.time_step = time_step;
            request.adaptive_time_steps = adaptive;
            run_bake(&mut registry, id, &request, timeout_sec)
        }

        Command::Resume {
            cache_dir,
            frames,
            from,
            time_step,
            quota_mb,
            adaptive,
            timeout_sec,
        } => {
            let mut registry = SessionRegistry::new(Arc::new(LocalEngineFactory));
            let id = Uuid::new_v4();
            let session = registry
                .load(id, &cache_dir, quota_mb * 1024 * 1024)
                .with_context(|| format!("loading cache at {}", cache_dir.display()))?;

            let available = session.available_frames();
            let next_frame = from.unwrap_or(available);
            if next_frame > available {
                bail!("cannot resume from frame {next_frame}: only {available} frame(s) cached");
            }
            if next_frame < available {
                println!("Branching at frame {next_frame}: discarding frames {next_frame}..{available}");
            }

            let mut request = ComputeRequest::forward(frames);
            request.next_frame = next_frame;
            request.time_step = time_step;
            request.adaptive_time_steps = adaptive;
            run_bake(&mut registry, id, &request, timeout_sec)
        }

        Command::Info { cache_dir } => print_info(&cache_dir),

        Command::Unlock { cache_dir, yes } => {
            if !FrameCache::is_locked(&cache_dir) {
                println!("No lock marker at {}", cache_dir.display());
                return Ok(());
            }
            // Deliberately refuses without explicit confirmation: a lock may
            // belong to a bake that is still running in another process.
            if !yes {
                bail!(
                    "{} is locked; pass --yes to remove the marker if you are \
                     certain no other process is baking into this cache",
                    cache_dir.display()
                );
            }
            FrameCache::remove_lock(&cache_dir)?;
            println!("Lock removed from {}", cache_dir.display());
            Ok(())
        }
    }
}

/// Blocking bake driver: start the run, then poll at the UI cadence until
/// it finishes or the timeout passes.
fn run_bake(
    registry: &mut SessionRegistry,
    id: Uuid,
    request: &ComputeRequest,
    timeout_sec: u64,
) -> Result<()> {
    let session = registry
        .get_mut(id)
        .context("session vanished from registry")?;
    session.start_compute(request).context("starting compute")?;
    info!(
        "Computing frames {}..{}",
        request.next_frame, request.frame_count
    );

    let mut poller = ProgressPoller::new();
    let deadline = Instant::now() + Duration::from_secs(timeout_sec);
    loop {
        if let Some(outcome) = poller.tick_if_due(registry) {
            if outcome.needs_redraw(id) {
                let session = registry.get(id).context("session vanished")?;
                if let Some(tree) = session.last_progress() {
                    println!(
                        "{}: {:3.0}% ({} / {} frames)",
                        tree.name,
                        tree.fraction() * 100.0,
                        tree.completed(),
                        tree.total()
                    );
                }
            }
        }

        let session = registry.get(id).context("session vanished")?;
        if !session.computing() {
            break;
        }
        if Instant::now() >= deadline {
            registry.get_mut(id).context("session vanished")?.pause_compute();
            bail!("bake did not finish within {timeout_sec}s (pause requested)");
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    let session = registry.get_mut(id).context("session vanished")?;
    session.poll();
    if let Some(msg) = session.last_error() {
        bail!("bake stopped: {msg}");
    }
    let stats = session.stats();
    println!(
        "Done: {} frame(s), {:.2} MB on disk",
        session.available_frames(),
        stats.bytes_on_disk as f64 / 1024.0 / 1024.0
    );
    registry.remove_all();
    Ok(())
}

/// Read-only cache inspection; never touches the lock.
fn print_info(cache_dir: &Path) -> Result<()> {
    if !FrameCache::exists(cache_dir) {
        bail!("no cache at {} (setup descriptor missing)", cache_dir.display());
    }
    let cache = FrameCache::new(cache_dir, 0);
    let setup = cache.read_setup()?;

    println!("Cache:      {}", cache_dir.display());
    println!("Session:    {} (setup format v{})", setup.name, setup.format_version);
    println!("Elements:   {}", setup.elements);
    println!("Attributes:");
    for attr in &setup.attributes {
        println!("  {attr}");
    }
    println!("Frames:     {}", cache.available_frames());
    println!(
        "Disk usage: {:.2} MB",
        cache.bytes_on_disk() as f64 / 1024.0 / 1024.0
    );
    println!(
        "Locked:     {}",
        if FrameCache::is_locked(cache_dir) { "yes" } else { "no" }
    );
    Ok(())
}
