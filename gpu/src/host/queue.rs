//! Host queues: one worker thread per queue draining a FIFO channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;

use super::buffer_ops::{host_buffer, host_image};
use super::dispatch;
use crate::backend::{wait_weak_fence, Command, NativeQueue};
use crate::error::{Error, Result};

static NEXT_QUEUE: AtomicUsize = AtomicUsize::new(0);

struct Job {
    command: Command,
    /// Profiling window the job was submitted in
    epoch: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    pending: usize,
    error: Option<Error>,
    profiling: bool,
    epoch: u64,
    busy_us: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
}

pub struct HostQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    profiling_supported: bool,
}

impl HostQueue {
    pub(crate) fn new(pool: Arc<ThreadPool>, profiling_supported: bool) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!(
                "lattice-host-queue-{}",
                NEXT_QUEUE.fetch_add(1, Ordering::Relaxed)
            ))
            .spawn(move || run_worker(receiver, worker_shared, pool))
            .map_err(|e| Error::driver(format!("cannot start host queue worker: {}", e)))?;
        Ok(HostQueue {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            shared,
            profiling_supported,
        })
    }

    fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    fn take_error(&self) -> Result<()> {
        match self.shared.state.lock().error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl NativeQueue for HostQueue {
    fn submit(&self, command: Command) -> Result<()> {
        let epoch = {
            let mut state = self.shared.state.lock();
            state.pending += 1;
            state.profiling.then_some(state.epoch)
        };
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Job { command, epoch }).is_ok(),
            None => false,
        };
        if !sent {
            let mut state = self.shared.state.lock();
            state.pending -= 1;
            if state.pending == 0 {
                self.shared.idle.notify_all();
            }
            return Err(Error::driver("host queue worker has stopped"));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // the worker picks commands up as soon as they are sent
        self.take_error()
    }

    fn finish(&self) -> Result<()> {
        self.wait_idle();
        self.take_error()
    }

    fn start_profiling(&self) -> Result<()> {
        if !self.profiling_supported {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        state.profiling = true;
        state.epoch += 1;
        state.busy_us = 0;
        Ok(())
    }

    fn stop_profiling(&self) -> Result<u64> {
        if !self.profiling_supported {
            return Ok(0);
        }
        self.shared.state.lock().profiling = false;
        self.wait_idle();
        Ok(self.shared.state.lock().busy_us)
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("host queue worker panicked");
            }
        }
    }
}

fn run_worker(receiver: mpsc::Receiver<Job>, shared: Arc<Shared>, pool: Arc<ThreadPool>) {
    for job in receiver {
        let name = job.command.name();
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| execute(job.command, &pool)))
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::driver(format!("host {} panicked: {}", name, reason)))
            });
        let elapsed = started.elapsed().as_micros() as u64;
        log::trace!("host {} took {} us", name, elapsed);

        let mut state = shared.state.lock();
        if job.epoch == Some(state.epoch) {
            state.busy_us += elapsed;
        }
        if let Err(e) = result {
            log::error!("host queue: {}", e);
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        state.pending -= 1;
        if state.pending == 0 {
            shared.idle.notify_all();
        }
    }
}

fn execute(command: Command, pool: &ThreadPool) -> Result<()> {
    match command {
        Command::Dispatch(d) => dispatch::run(&d, pool),
        Command::WriteBuffer { dst, offset, data } => {
            host_buffer(&dst)?.memory().write(offset as usize, &data);
            Ok(())
        }
        Command::FillBuffer { dst, pattern } => {
            host_buffer(&dst)?.memory().fill(&pattern);
            Ok(())
        }
        Command::ReadBuffer {
            src,
            offset,
            len,
            reply,
        } => {
            let data = host_buffer(&src).map(|b| b.memory().to_vec(offset as usize, len));
            // the reader may have given up; nothing to report then
            let _ = reply.send(data);
            Ok(())
        }
        Command::CopyBuffer { src, dst, size } => {
            let data = host_buffer(&src)?.memory().to_vec(0, size as usize);
            host_buffer(&dst)?.memory().write(0, &data);
            Ok(())
        }
        Command::WriteImage { dst, region, data } => {
            host_image(&dst)?.write_region(&region, &data);
            Ok(())
        }
        Command::ReadImage { src, region, reply } => {
            let data = host_image(&src).map(|image| image.read_region(&region));
            let _ = reply.send(data);
            Ok(())
        }
        Command::CopyImage { src, dst, region } => {
            let data = host_image(&src)?.read_region(&region);
            host_image(&dst)?.write_region(&region, &data);
            Ok(())
        }
        Command::SignalFence(fence) => {
            match fence.upgrade() {
                Some(fence) => fence.signal(),
                None => log::debug!("signalled fence was already destroyed"),
            }
            Ok(())
        }
        Command::WaitFence(fence) => {
            if !wait_weak_fence(&fence) {
                log::warn!("fence destroyed before it was signalled; treating the wait as satisfied");
            }
            Ok(())
        }
    }
}
