//! Periodic sampling of process and host statistics.

use error_stack::bail;
use error_stack::Report;
use sysinfo::Pid;
use sysinfo::System;
use tracing::debug;
use tracing::warn;

use crate::aggregator::Snapshot;
use crate::error::SampleError;

/// A group of statistics read together.
pub trait StatSource: Send {
    fn name(&self) -> &'static str;

    /// Writes fresh values into `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`SampleError`] if the statistics cannot be read. Whatever the
    /// source wrote before failing is discarded by the sampler.
    fn read(&mut self, snapshot: &mut Snapshot) -> Result<(), Report<SampleError>>;
}

/// Memory, CPU and disk usage of the agent process itself.
pub struct ProcessSource {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSource {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!("cannot resolve own pid, process statistics disabled: {err}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StatSource for ProcessSource {
    fn name(&self) -> &'static str {
        "process"
    }

    fn read(&mut self, snapshot: &mut Snapshot) -> Result<(), Report<SampleError>> {
        let Some(pid) = self.pid else {
            bail!(SampleError::Unavailable {
                source_name: self.name(),
                reason: "own pid unknown".to_string(),
            });
        };
        if !self.system.refresh_process(pid) {
            bail!(SampleError::Unavailable {
                source_name: self.name(),
                reason: format!("process {pid} not found"),
            });
        }
        let Some(process) = self.system.process(pid) else {
            bail!(SampleError::Unavailable {
                source_name: self.name(),
                reason: format!("process {pid} not found"),
            });
        };

        let disk = process.disk_usage();
        snapshot.alloc = process.memory();
        snapshot.sys = process.virtual_memory();
        snapshot.process_cpu_usage = process.cpu_usage();
        snapshot.run_time = process.run_time();
        snapshot.disk_read_bytes = disk.total_read_bytes;
        snapshot.disk_written_bytes = disk.total_written_bytes;
        Ok(())
    }
}

/// Host memory and CPU utilisation.
pub struct HostSource {
    system: System,
}

impl HostSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for HostSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StatSource for HostSource {
    fn name(&self) -> &'static str {
        "host"
    }

    fn read(&mut self, snapshot: &mut Snapshot) -> Result<(), Report<SampleError>> {
        self.system.refresh_memory();
        self.system.refresh_cpu();

        let total = self.system.total_memory();
        if total == 0 {
            bail!(SampleError::Unavailable {
                source_name: self.name(),
                reason: "memory statistics not supported".to_string(),
            });
        }

        snapshot.total_memory = total;
        snapshot.free_memory = self.system.free_memory();
        snapshot.used_memory = self.system.used_memory();
        snapshot.cpu_utilization = self.system.global_cpu_info().cpu_usage();
        snapshot.num_cpu = u32::try_from(self.system.cpus().len()).unwrap_or(u32::MAX);
        Ok(())
    }
}

/// Uniform random value in `[0, 1)`, refreshed on every pass.
#[derive(Debug, Default)]
pub struct RandomSource;

impl StatSource for RandomSource {
    fn name(&self) -> &'static str {
        "random"
    }

    fn read(&mut self, snapshot: &mut Snapshot) -> Result<(), Report<SampleError>> {
        snapshot.random_value = rand::random::<f64>();
        Ok(())
    }
}

/// Owns the current snapshot and the sources feeding it.
///
/// Only the poll task mutates a sampler; readers get copies from [`Sampler::poll`].
pub struct Sampler {
    sources: Vec<Box<dyn StatSource>>,
    snapshot: Snapshot,
}

impl Sampler {
    pub fn new(sources: Vec<Box<dyn StatSource>>) -> Self {
        Self {
            sources,
            snapshot: Snapshot::default(),
        }
    }

    /// Sampler reading the agent process, the host and a random value.
    pub fn with_default_sources() -> Self {
        Self::new(vec![
            Box::new(ProcessSource::new()),
            Box::new(HostSource::new()),
            Box::new(RandomSource),
        ])
    }

    /// Runs one sampling pass and returns a copy of the resulting snapshot.
    ///
    /// A failing source keeps its previous values; the pass itself always
    /// completes and bumps the poll count by one.
    pub fn poll(&mut self) -> Snapshot {
        for source in &mut self.sources {
            let mut scratch = self.snapshot.clone();
            match source.read(&mut scratch) {
                Ok(()) => self.snapshot = scratch,
                Err(err) => warn!(source = source.name(), "sampling failed: {err:?}"),
            }
        }
        self.snapshot.poll_count += 1;
        debug!(poll_count = self.snapshot.poll_count, "sampling pass complete");
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}
