use std::error::Error;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use perfdb::{Database, Stats, Visualizer, VisualizerConfig};
use rustc_hash::FxHashMap;
use serde::Serialize;

#[derive(Parser, Debug)]
#[clap(about = "Collects a trace from a running perfstream server")]
struct Opt {
    /// Address of the server, e.g. 127.0.0.1:28077
    addr: String,
    /// Stop collecting after this many seconds
    #[clap(long = "seconds")]
    seconds: Option<u64>,
    /// Write the collected timeline to this file as JSON
    #[clap(long = "json")]
    json: Option<PathBuf>,
    /// Visualizer settings as JSON
    #[clap(long = "config")]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct ExportZone {
    name: Option<String>,
    start: u64,
    end: Option<u64>,
    depth: u32,
}

#[derive(Serialize)]
struct ExportMarker {
    name: Option<String>,
    timestamp: u64,
}

#[derive(Serialize)]
struct ExportThread {
    thread_id: u32,
    name: Option<String>,
    zones: Vec<ExportZone>,
    markers: Vec<ExportMarker>,
}

#[derive(Serialize)]
struct ExportStats {
    dropped_events: u64,
    protocol_errors: u64,
    invariant_violations: u64,
    frames_lost: u64,
    unresolved_references: u64,
    records_applied: u64,
}

#[derive(Serialize)]
struct Export {
    process_id: Option<u32>,
    cmd: Option<String>,
    threads: Vec<ExportThread>,
    stats: ExportStats,
}

fn to_string(name: &Option<Arc<str>>) -> Option<String> {
    name.as_deref().map(str::to_string)
}

fn export(db: &Database) -> Export {
    let metadata = db.metadata();
    let Stats {
        protocol_errors,
        invariant_violations,
        frames_lost,
        unresolved_references,
        records_applied,
    } = db.stats();

    let threads = db
        .threads()
        .into_iter()
        .map(|thread| ExportThread {
            thread_id: thread.thread_id,
            name: to_string(&thread.name),
            zones: db
                .zones(thread.thread_id, 0, u64::MAX)
                .into_iter()
                .map(|z| ExportZone {
                    name: to_string(&z.name),
                    start: z.zone.start,
                    end: z.zone.end,
                    depth: z.zone.depth,
                })
                .collect(),
            markers: db
                .markers(thread.thread_id, 0, u64::MAX)
                .into_iter()
                .map(|m| ExportMarker {
                    name: to_string(&m.name),
                    timestamp: m.marker.timestamp,
                })
                .collect(),
        })
        .collect();

    Export {
        process_id: metadata.as_ref().map(|m| m.process_id),
        cmd: metadata.map(|m| m.cmd),
        threads,
        stats: ExportStats {
            dropped_events: db.dropped_events(),
            protocol_errors,
            invariant_violations,
            frames_lost,
            unresolved_references,
            records_applied,
        },
    }
}

fn print_summary(db: &Database) {
    if let Some(metadata) = db.metadata() {
        println!("process {}: {}", metadata.process_id, metadata.cmd.trim_end());
    }

    for thread in db.threads() {
        println!(
            "thread {:>4} {:<20} {:>8} zones {:>4} open {:>8} markers {:>12?} busy",
            thread.thread_id,
            thread.name.as_deref().unwrap_or("<unnamed>"),
            thread.closed_zones,
            thread.open_zones,
            thread.markers,
            Duration::from_nanos(thread.busy_time),
        );

        // Per-name totals, longest first.
        let mut by_name: FxHashMap<Arc<str>, (usize, u64)> = FxHashMap::default();
        for zone in db.zones(thread.thread_id, 0, u64::MAX) {
            if let (Some(name), Some(duration)) = (zone.name, zone.zone.duration()) {
                let entry = by_name.entry(name).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += duration;
            }
        }

        let mut by_name: Vec<_> = by_name.into_iter().collect();
        by_name.sort_unstable_by(|a, b| b.1 .1.cmp(&a.1 .1).then_with(|| a.0.cmp(&b.0)));
        for (name, (count, total)) in by_name.iter().take(10) {
            println!(
                "    {:<32} {:>8}x {:>12?}",
                name,
                count,
                Duration::from_nanos(*total)
            );
        }
    }

    let stats = db.stats();
    println!(
        "dropped events: {}, protocol errors: {}, invariant violations: {}, \
         frames lost: {}, unresolved names: {}, records: {}",
        db.dropped_events(),
        stats.protocol_errors,
        stats.invariant_violations,
        stats.frames_lost,
        stats.unresolved_references,
        stats.records_applied,
    );
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();

    let opt = Opt::parse();

    let config = match &opt.config {
        Some(path) => VisualizerConfig::from_json(&fs::read_to_string(path)?)?,
        None => VisualizerConfig::default(),
    };

    let visualizer = Visualizer::new(config);
    let db = visualizer.connect(opt.addr.as_str())?;
    log::info!("collecting from {}", opt.addr);

    let deadline = opt.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                (deadline - now).min(Duration::from_secs(1))
            }
            None => Duration::from_secs(1),
        };

        if visualizer.wait_closed(wait) {
            break;
        }
    }

    visualizer.disconnect();
    print_summary(&db);

    if let Some(path) = &opt.json {
        let file = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(file, &export(&db))?;
        log::info!("wrote {}", path.display());
    }

    Ok(())
}
