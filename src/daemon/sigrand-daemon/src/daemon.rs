//! Core daemon implementation
//! Owns the lifecycle (preconditions, serving, shutdown) and the serve loop

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sigrand_core::{select_entry, EntryStream, Separator};
use sigrand_system::{check_fifo, open_fifo_writer, LockFile};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::metrics::ServeStats;

/// Lifecycle states, in the only order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Uninitialized,
    CheckingPreconditions,
    Running,
    ShuttingDown,
}

/// Interrupt and terminate handlers, registered eagerly so that a signal
/// arriving during startup is queued instead of killing the process.
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .context("Failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Resolves once shutdown is requested or the sender side is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// Main daemon orchestrator
pub struct Daemon {
    config: DaemonConfig,
    separator: Separator,
    rng: StdRng,
    stats: Arc<ServeStats>,
    state: LifecycleState,
    lock: Option<LockFile>,
}

impl Daemon {
    /// Create a new daemon instance; touches nothing on disk
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let separator = config.selection.separator()?;
        let seed = config.selection.seed.unwrap_or_else(clock_seed);
        debug!("Seeding entry generator with {}", seed);

        Ok(Self {
            config,
            separator,
            rng: StdRng::seed_from_u64(seed),
            stats: Arc::new(ServeStats::new()),
            state: LifecycleState::Uninitialized,
            lock: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Shared handle to the serve counters
    pub fn stats(&self) -> Arc<ServeStats> {
        Arc::clone(&self.stats)
    }

    fn transition(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        debug!("Lifecycle {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Verify the pipe and source, then take the lock file.
    ///
    /// Fails fast without retrying; an existing lock file is left untouched.
    pub fn check_preconditions(&mut self) -> Result<()> {
        self.transition(LifecycleState::CheckingPreconditions);

        let fifo = self.config.paths.fifo_path();
        check_fifo(&fifo)?;

        let source = self.config.paths.source_path();
        EntryStream::open(&source, self.separator.clone())?;

        let lock = LockFile::acquire(self.config.paths.lock_path())?;
        self.lock = Some(lock);
        Ok(())
    }

    /// Run the daemon until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let mut signals = ShutdownSignals::install()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let signal_task = tokio::spawn(async move {
            let name = signals.recv().await;
            info!("Received {}, starting graceful shutdown", name);
            let _ = shutdown_tx.send(true);
        });

        let result = self.run_until(shutdown_rx).await;
        signal_task.abort();
        result
    }

    /// Run the daemon until `shutdown` turns true (or its sender is dropped).
    ///
    /// The lock file is released on every path out of this function.
    pub async fn run_until(mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("sigrand daemon starting...");
        self.check_preconditions()?;

        self.transition(LifecycleState::Running);
        info!("sigrand daemon started successfully");

        let result = self.serve(shutdown).await;

        self.transition(LifecycleState::ShuttingDown);
        if let Some(lock) = self.lock.take() {
            debug!(
                "Releasing lock file {} (pid {})",
                lock.path().display(),
                lock.pid()
            );
            lock.release();
        }

        let stats = self.stats.get_stats();
        info!(
            "Shutdown complete: served {} readers, {} bytes",
            stats.connections, stats.bytes_written
        );
        result
    }

    /// Serve readers one at a time until shutdown.
    ///
    /// Shutdown is observed while waiting for a reader, while writing and while
    /// pausing. A write cut short by shutdown is abandoned, never resumed.
    async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let fifo = self.config.paths.fifo_path();
        let source = self.config.paths.source_path();
        let poll_interval = self.config.server.poll_interval();
        let pause = self.config.server.pause();

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Opening {}", fifo.display());
            let sender = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                sender = open_fifo_writer(&fifo, poll_interval) => sender?,
            };

            self.serve_reader(sender, &source, &mut shutdown).await?;

            debug!("Starting over...");
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Leaving serve loop");
        Ok(())
    }

    /// Select a fresh entry, write it and close the pipe
    async fn serve_reader(
        &mut self,
        mut sender: pipe::Sender,
        source: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let started = Instant::now();
        let selection = select_entry(source, &self.separator, &mut self.rng)
            .with_context(|| format!("Failed to select entry from {}", source.display()))?;
        self.stats.record_selection(&selection, started.elapsed());
        debug!(
            "Scanned {} entries, candidate replaced {} times",
            selection.seen, selection.replacements
        );

        let Some(entry) = selection.entry else {
            warn!(
                "No entries available in {}; closing pipe without data",
                source.display()
            );
            self.stats.record_served(0);
            return Ok(());
        };

        info!("Writing entry ({} bytes)", entry.len());
        let written = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => None,
            result = sender.write_all(entry.as_bytes()) => Some(result),
        };

        // dropping the sender closes the pipe and signals EOF to the reader
        drop(sender);

        let Some(written) = written else {
            warn!("Shutdown requested, abandoning write to pipe");
            return Ok(());
        };

        match written {
            Ok(()) => self.stats.record_served(entry.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("Reader closed the pipe before the entry was written");
                self.stats.record_write_failure();
            }
            Err(e) => return Err(e).context("Failed to write entry to pipe"),
        }
        Ok(())
    }
}
