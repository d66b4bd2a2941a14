//! Worker threads that run ports.
//!
//! Engine calls block, so requests run on plain OS threads rather than the
//! tokio runtime. A port is queued once no matter how many packets arrive
//! for it; the worker that picks it up drains its inbound queue. The pool
//! grows up to `max_workers` when nobody is idle and shrinks back to
//! `min_workers` after `idle_timeout`.

use crate::config::PoolConfig;
use crate::metrics::Metrics;
use crate::port::Port;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Runs the pending requests of one port.
pub type PortRunner = Arc<dyn Fn(&Arc<Port>) + Send + Sync>;

struct PoolState {
    queue: VecDeque<Arc<Port>>,
    live: usize,
    idle: usize,
    busy: usize,
    next_id: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    config: PoolConfig,
    runner: PortRunner,
    metrics: Option<Metrics>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Shared {
    fn publish(&self, state: &PoolState) {
        if let Some(metrics) = &self.metrics {
            metrics.workers_live.set(state.live as f64);
            metrics.workers_busy.set(state.busy as f64);
            metrics.queue_depth.set(state.queue.len() as f64);
        }
    }
}

/// Elastic pool of worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, runner: PortRunner, metrics: Option<Metrics>) -> Self {
        let shared = Arc::new(Shared {
            config,
            runner,
            metrics,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                live: 0,
                idle: 0,
                busy: 0,
                next_id: 0,
                shutdown: false,
                handles: Vec::new(),
            }),
            available: Condvar::new(),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.min_workers {
                spawn_worker(&shared, &mut state);
            }
            shared.publish(&state);
        }

        tracing::info!(
            "Worker pool started ({}..{} workers)",
            shared.config.min_workers,
            shared.config.max_workers
        );
        Self { shared }
    }

    /// Queues a port unless it is already queued or running.
    pub fn schedule(&self, port: &Arc<Port>) {
        if !port.try_schedule() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.shutdown {
            port.unschedule();
            return;
        }
        state.queue.push_back(port.clone());
        if state.queue.len() > state.idle && state.live < self.shared.config.max_workers {
            spawn_worker(&self.shared, &mut state);
        }
        self.shared.publish(&state);
        drop(state);
        self.shared.available.notify_one();
    }

    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.state.lock().busy
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops every worker once its current port is done. Queued ports are
    /// dropped.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            for port in state.queue.drain(..) {
                port.unschedule();
            }
            std::mem::take(&mut state.handles)
        };
        self.shared.available.notify_all();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
    state.next_id += 1;
    let name = format!("relwire-worker-{}", state.next_id);
    let worker = shared.clone();
    match std::thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(worker))
    {
        Ok(handle) => {
            state.live += 1;
            state.handles.retain(|h| !h.is_finished());
            state.handles.push(handle);
        }
        Err(e) => tracing::error!("Failed to spawn worker: {}", e),
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let idle_timeout = shared.config.idle_timeout();
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(port) = state.queue.pop_front() else {
            state.idle += 1;
            let timed_out = shared
                .available
                .wait_for(&mut state, idle_timeout)
                .timed_out();
            state.idle -= 1;
            if timed_out
                && state.queue.is_empty()
                && state.live > shared.config.min_workers
            {
                break;
            }
            continue;
        };

        state.busy += 1;
        shared.publish(&state);
        drop(state);

        run(&shared, &port);

        state = shared.state.lock();
        state.busy -= 1;
        shared.publish(&state);
    }
    state.live -= 1;
    shared.publish(&state);
    tracing::debug!(
        "{} exiting",
        std::thread::current().name().unwrap_or("worker")
    );
}

/// Runs a port until its queue is empty, keeping it on this thread while
/// more packets keep arriving.
fn run(shared: &Shared, port: &Arc<Port>) {
    loop {
        (shared.runner)(port);
        port.unschedule();
        // A packet pushed after the runner drained the queue found the port
        // still scheduled and did not queue it; pick it up here.
        if !port.has_inbound() || !port.try_schedule() {
            break;
        }
        if shared.state.lock().shutdown {
            port.unschedule();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Inbound;
    use relwire_protocol::Packet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn port() -> Arc<Port> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        Arc::new(Port::new("127.0.0.1:1".parse().unwrap(), tx, 8))
    }

    fn draining_runner(counter: Arc<AtomicUsize>) -> PortRunner {
        Arc::new(move |port: &Arc<Port>| {
            while port.pop_inbound().is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn config(min: usize, max: usize, idle_ms: u64) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            idle_timeout_ms: idle_ms,
        }
    }

    #[test]
    fn test_runs_queued_packets() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(config(1, 4, 1000), draining_runner(counter.clone()), None);
        let port = port();
        for _ in 0..3 {
            port.push_inbound(Inbound::Packet(Packet::Ping));
            pool.schedule(&port);
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 3);
        wait_until(|| !port.is_scheduled());
        pool.shutdown();
    }

    #[test]
    fn test_port_runs_on_one_worker_at_a_time() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let runner: PortRunner = {
            let (concurrent, peak, done) = (concurrent.clone(), peak.clone(), done.clone());
            Arc::new(move |port: &Arc<Port>| {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                while port.pop_inbound().is_some() {
                    std::thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::SeqCst);
                }
                concurrent.fetch_sub(1, Ordering::SeqCst);
            })
        };
        let pool = WorkerPool::new(config(4, 4, 1000), runner, None);
        let port = port();
        for _ in 0..20 {
            port.push_inbound(Inbound::Packet(Packet::Ping));
            pool.schedule(&port);
        }
        wait_until(|| done.load(Ordering::SeqCst) == 20);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn test_grows_and_shrinks() {
        let release = Arc::new(AtomicUsize::new(0));
        let runner: PortRunner = {
            let release = release.clone();
            Arc::new(move |port: &Arc<Port>| {
                while release.load(Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
                while port.pop_inbound().is_some() {}
            })
        };
        let pool = WorkerPool::new(config(1, 3, 50), runner, None);
        let ports: Vec<_> = (0..3).map(|_| port()).collect();
        for port in &ports {
            port.push_inbound(Inbound::Packet(Packet::Ping));
            pool.schedule(port);
        }
        wait_until(|| pool.busy_workers() == 3);
        assert_eq!(pool.live_workers(), 3);

        release.store(1, Ordering::SeqCst);
        wait_until(|| pool.live_workers() == 1);
        pool.shutdown();
    }

    #[test]
    fn test_schedule_after_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(config(1, 1, 1000), draining_runner(counter.clone()), None);
        pool.shutdown();
        let port = port();
        port.push_inbound(Inbound::Packet(Packet::Ping));
        pool.schedule(&port);
        assert!(!port.is_scheduled());
        assert_eq!(pool.queued(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_metrics_gauges() {
        let metrics = Metrics::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            config(2, 2, 1000),
            draining_runner(counter),
            Some(metrics.clone()),
        );
        assert!(metrics.render().contains("relwire_workers_live 2"));
        pool.shutdown();
        assert!(metrics.render().contains("relwire_workers_live 0"));
    }
}
