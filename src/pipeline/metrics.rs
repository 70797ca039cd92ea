//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the process stage.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Chunks analyzed successfully
    pub chunks_succeeded: AtomicU64,

    /// Chunks that exhausted their retries
    pub chunks_failed: AtomicU64,

    /// Chunk attempts that were retried
    pub chunk_retries: AtomicU64,

    /// Chunks dropped by cancellation before they ran
    pub chunks_cancelled: AtomicU64,

    /// Chunks restored from a previous run's artifacts
    pub chunks_resumed: AtomicU64,

    /// Bytes read from the source volume
    pub bytes_read: AtomicU64,

    /// Outer-box voxels handed to the analyzer
    pub voxels_analyzed: AtomicU64,

    /// Objects reported by the analyzer (outer boxes, before attribution)
    pub objects_detected: AtomicU64,

    /// Objects kept by seam attribution
    pub objects_claimed: AtomicU64,

    /// Chunks currently running
    pub running_chunks: AtomicU64,

    /// Highest observed number of concurrently running chunks
    pub peak_running_chunks: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent reading chunk data (microseconds)
    pub read_us: AtomicU64,

    /// Time spent in the analyzer (microseconds)
    pub analyze_us: AtomicU64,

    /// Time spent persisting chunk results (microseconds)
    pub persist_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_chunk_succeeded(&self) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_retry(&self) {
        self.chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_cancelled(&self) {
        self.chunks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_resumed(&self) {
        self.chunks_resumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes read.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_voxels_analyzed(&self, voxels: u64) {
        self.voxels_analyzed.fetch_add(voxels, Ordering::Relaxed);
    }

    pub fn add_objects_detected(&self, count: u64) {
        self.objects_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_objects_claimed(&self, count: u64) {
        self.objects_claimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Mark a chunk as started, updating the peak gauge.
    pub fn chunk_started(&self) {
        let running = self.running_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running_chunks.fetch_max(running, Ordering::SeqCst);
    }

    /// Mark a running chunk as finished.
    pub fn chunk_finished(&self) {
        self.running_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record time spent reading chunk data.
    pub fn add_read_time(&self, duration: Duration) {
        self.read_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent analyzing.
    pub fn add_analyze_time(&self, duration: Duration) {
        self.analyze_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent persisting results.
    pub fn add_persist_time(&self, duration: Duration) {
        self.persist_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get read throughput in MB/s.
    pub fn read_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    /// Get finished chunks per minute.
    pub fn chunks_per_minute(&self) -> f64 {
        let chunks = self.chunks_succeeded.load(Ordering::Relaxed)
            + self.chunks_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 / elapsed * 60.0
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunk_retries: self.chunk_retries.load(Ordering::Relaxed),
            chunks_cancelled: self.chunks_cancelled.load(Ordering::Relaxed),
            chunks_resumed: self.chunks_resumed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            voxels_analyzed: self.voxels_analyzed.load(Ordering::Relaxed),
            objects_detected: self.objects_detected.load(Ordering::Relaxed),
            objects_claimed: self.objects_claimed.load(Ordering::Relaxed),
            running_chunks: self.running_chunks.load(Ordering::Relaxed),
            peak_running_chunks: self.peak_running_chunks.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mbps: self.read_throughput_mbps(),
            chunks_per_minute: self.chunks_per_minute(),
            read_secs: self.read_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            analyze_secs: self.analyze_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            persist_secs: self.persist_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub chunk_retries: u64,
    pub chunks_cancelled: u64,
    pub chunks_resumed: u64,
    pub bytes_read: u64,
    pub voxels_analyzed: u64,
    pub objects_detected: u64,
    pub objects_claimed: u64,
    pub running_chunks: u64,
    pub peak_running_chunks: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mbps: f64,
    pub chunks_per_minute: f64,
    /// Total time spent reading chunk data (seconds, summed across workers)
    pub read_secs: f64,
    /// Total time spent analyzing (seconds, summed across workers)
    pub analyze_secs: f64,
    /// Total time spent persisting results (seconds, summed across workers)
    pub persist_secs: f64,
}

impl MetricsSnapshot {
    /// Chunks that reached a terminal state, including resumed ones.
    pub fn chunks_finished(&self) -> u64 {
        self.chunks_succeeded + self.chunks_failed + self.chunks_resumed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_phase_time = self.read_secs + self.analyze_secs + self.persist_secs;
        let (read_pct, analyze_pct, persist_pct) = if total_phase_time > 0.0 {
            (
                self.read_secs / total_phase_time * 100.0,
                self.analyze_secs / total_phase_time * 100.0,
                self.persist_secs / total_phase_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Chunks: {} ok, {} failed, {} resumed, {} retried | Running: {} (peak {}) | \
             Read: {:.2} GB @ {:.1} MB/s | Objects: {} detected, {} claimed | \
             Rate: {:.1} chunks/min | Elapsed: {:.1}s | \
             Time: read {:.0}% | analyze {:.0}% | persist {:.0}%",
            self.chunks_succeeded,
            self.chunks_failed,
            self.chunks_resumed,
            self.chunk_retries,
            self.running_chunks,
            self.peak_running_chunks,
            self.bytes_read as f64 / (1024.0 * 1024.0 * 1024.0),
            self.read_throughput_mbps,
            self.objects_detected,
            self.objects_claimed,
            self.chunks_per_minute,
            self.elapsed.as_secs_f64(),
            read_pct,
            analyze_pct,
            persist_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chunks > 0 {
                        snapshot.chunks_finished() as f64 / self.total_chunks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Process Stage Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Chunks: {} of {}", snapshot.chunks_finished(), self.total_chunks);
        println!("  succeeded: {}", snapshot.chunks_succeeded);
        println!("  failed:    {}", snapshot.chunks_failed);
        println!("  resumed:   {}", snapshot.chunks_resumed);
        println!("  retries:   {}", snapshot.chunk_retries);
        println!("  cancelled: {}", snapshot.chunks_cancelled);
        println!("Peak concurrent chunks: {}", snapshot.peak_running_chunks);
        println!(
            "Data read: {:.2} GB ({:.1} MB/s)",
            snapshot.bytes_read as f64 / (1024.0 * 1024.0 * 1024.0),
            snapshot.read_throughput_mbps
        );
        println!(
            "Objects: {} detected, {} claimed after seam resolution",
            snapshot.objects_detected, snapshot.objects_claimed
        );

        let total_phase = snapshot.read_secs + snapshot.analyze_secs + snapshot.persist_secs;
        if total_phase > 0.0 {
            println!("\n--- Phase Time Breakdown ---");
            println!("Read:     {:>7.1}s ({:>5.1}%)", snapshot.read_secs, snapshot.read_secs / total_phase * 100.0);
            println!("Analyze:  {:>7.1}s ({:>5.1}%)", snapshot.analyze_secs, snapshot.analyze_secs / total_phase * 100.0);
            println!("Persist:  {:>7.1}s ({:>5.1}%)", snapshot.persist_secs, snapshot.persist_secs / total_phase * 100.0);
        }
        println!("=============================\n");
    }
}
