//! Fork-join work across the chips of a mesh
//!
//! Per-chip work is collected into a [`DeviceTasks`] list with
//! [`DeviceTasks::push_work`], then [`DeviceWorkerPool::synchronize`] runs
//! every chip's queue on its own pool thread and joins. Tasks for one chip
//! run in the order they were pushed; chips run concurrently.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::device::Device;
use crate::error::{Result, TraceError};

/// One unit of per-chip work
pub type DeviceTask<'a> = Box<dyn FnOnce(&mut Device) -> Result<()> + Send + 'a>;

/// Per-chip task queues awaiting a join
pub struct DeviceTasks<'a> {
    queues: Vec<Vec<DeviceTask<'a>>>,
}

impl<'a> DeviceTasks<'a> {
    /// Empty queues for `num_devices` chips
    #[must_use]
    pub fn new(num_devices: usize) -> Self {
        Self {
            queues: (0..num_devices).map(|_| Vec::new()).collect(),
        }
    }

    /// Queue `task` for the chip at `device_index`
    ///
    /// # Panics
    ///
    /// Panics if `device_index` is out of range.
    pub fn push_work<F>(&mut self, device_index: usize, task: F)
    where
        F: FnOnce(&mut Device) -> Result<()> + Send + 'a,
    {
        self.queues[device_index].push(Box::new(task));
    }

    /// Total queued tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }

    /// True when nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }
}

impl std::fmt::Debug for DeviceTasks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_device: Vec<usize> = self.queues.iter().map(Vec::len).collect();
        f.debug_struct("DeviceTasks")
            .field("per_device", &per_device)
            .finish()
    }
}

/// Thread pool with one worker per chip
#[derive(Debug)]
pub struct DeviceWorkerPool {
    pool: ThreadPool,
    num_devices: usize,
}

impl DeviceWorkerPool {
    /// Pool for `num_devices` chips
    ///
    /// # Errors
    ///
    /// Returns `TraceError::WorkerPool` if the threads cannot be spawned.
    pub fn new(num_devices: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_devices.max(1))
            .thread_name(|i| format!("mesh-device-{i}"))
            .build()
            .map_err(|e| TraceError::WorkerPool {
                reason: e.to_string(),
            })?;
        tracing::debug!("Started {num_devices} device worker(s)");
        Ok(Self { pool, num_devices })
    }

    /// Chips served
    #[must_use]
    pub const fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Run every queued task and wait for all of them
    ///
    /// A chip stops at its first failing task. All chips finish before the
    /// call returns; the error of the lowest-indexed failing chip is
    /// reported.
    ///
    /// # Errors
    ///
    /// Returns the first task error, or `TraceError::WorkerPanicked` if a
    /// task panicked.
    ///
    /// # Panics
    ///
    /// Panics if `tasks` was built for a different number of chips.
    pub fn synchronize(&self, devices: &mut [Device], tasks: DeviceTasks<'_>) -> Result<()> {
        assert_eq!(
            tasks.queues.len(),
            devices.len(),
            "task list built for a different mesh"
        );
        let mut results: Vec<Result<()>> = (0..devices.len()).map(|_| Ok(())).collect();
        self.pool.scope(|s| {
            for (index, ((device, queue), slot)) in devices
                .iter_mut()
                .zip(tasks.queues)
                .zip(results.iter_mut())
                .enumerate()
            {
                if queue.is_empty() {
                    continue;
                }
                s.spawn(move |_| {
                    *slot = catch_unwind(AssertUnwindSafe(|| {
                        queue.into_iter().try_for_each(|task| task(&mut *device))
                    }))
                    .unwrap_or(Err(TraceError::WorkerPanicked { device: index }));
                });
            }
        });
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use meshtrace_hw::mesh::{MeshCoordinateRange, MeshShape};

    fn devices(n: u32) -> Vec<Device> {
        let config = MeshConfig {
            shape: MeshShape::new([1, n]),
            ..MeshConfig::default()
        };
        MeshCoordinateRange::from_shape(&config.shape)
            .iter()
            .enumerate()
            .map(|(i, c)| Device::new(i as u32, c, &config).unwrap())
            .collect()
    }

    #[test]
    fn test_tasks_run_in_push_order_per_device() {
        let pool = DeviceWorkerPool::new(3).unwrap();
        let mut devs = devices(3);
        let mut tasks = DeviceTasks::new(3);
        for i in 0..3 {
            for byte in [1u8, 2, 3] {
                tasks.push_work(i, move |dev| dev.write_trace_region(0, &[byte]));
            }
        }
        assert_eq!(tasks.len(), 9);
        pool.synchronize(&mut devs, tasks).unwrap();
        for dev in &devs {
            assert_eq!(dev.read_trace_region(0, 1), vec![3]);
        }
    }

    #[test]
    fn test_untouched_devices_stay_idle() {
        let pool = DeviceWorkerPool::new(2).unwrap();
        let mut devs = devices(2);
        let mut tasks = DeviceTasks::new(2);
        tasks.push_work(1, |dev| dev.write_trace_region(8, &[9]));
        pool.synchronize(&mut devs, tasks).unwrap();
        assert_eq!(devs[0].read_trace_region(8, 1), vec![0]);
        assert_eq!(devs[1].read_trace_region(8, 1), vec![9]);
    }

    #[test]
    fn test_first_error_is_reported_after_join() {
        let pool = DeviceWorkerPool::new(2).unwrap();
        let mut devs = devices(2);
        let mut tasks = DeviceTasks::new(2);
        tasks.push_work(0, |dev| dev.write_trace_region(u64::MAX, &[0]));
        tasks.push_work(1, |dev| dev.write_trace_region(4, &[7]));
        let err = pool.synchronize(&mut devs, tasks).unwrap_err();
        assert!(matches!(err, TraceError::WriteOutOfBounds { .. }));
        assert_eq!(devs[1].read_trace_region(4, 1), vec![7]);
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let pool = DeviceWorkerPool::new(2).unwrap();
        let mut devs = devices(2);
        let mut tasks = DeviceTasks::new(2);
        tasks.push_work(1, |_| panic!("boom"));
        let err = pool.synchronize(&mut devs, tasks).unwrap_err();
        assert!(matches!(err, TraceError::WorkerPanicked { device: 1 }));
    }
}
