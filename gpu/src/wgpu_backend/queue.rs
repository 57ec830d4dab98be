//! WebGPU queues.
//!
//! Each lattice queue owns a submission thread that encodes commands in
//! FIFO order onto the device's wgpu queue. Fence waits stall that thread
//! while it keeps polling the device, so `submit` itself never blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use wgpu;

use super::device_init::WgpuShared;
use super::dispatch::{encode, wgpu_buffer};
use crate::backend::{Command, NativeQueue, FENCE_POLL_INTERVAL};
use crate::error::{Error, Result};

static NEXT_QUEUE: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct QueueState {
    pending: usize,
    error: Option<Error>,
}

#[derive(Default)]
struct Progress {
    state: Mutex<QueueState>,
    idle: Condvar,
}

pub struct WgpuQueue {
    shared: Arc<WgpuShared>,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    progress: Arc<Progress>,
}

impl WgpuQueue {
    pub fn new(shared: Arc<WgpuShared>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let progress = Arc::new(Progress::default());
        let worker_shared = Arc::clone(&shared);
        let worker_progress = Arc::clone(&progress);
        let worker = std::thread::Builder::new()
            .name(format!(
                "lattice-webgpu-queue-{}",
                NEXT_QUEUE.fetch_add(1, Ordering::Relaxed)
            ))
            .spawn(move || run_worker(receiver, worker_shared, worker_progress))
            .map_err(|e| Error::driver(format!("cannot start webgpu queue worker: {}", e)))?;
        Ok(WgpuQueue {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            progress,
        })
    }

    fn wait_idle(&self) {
        let mut state = self.progress.state.lock();
        while state.pending > 0 {
            self.progress.idle.wait(&mut state);
        }
    }

    fn take_error(&self) -> Result<()> {
        if let Some(e) = self.progress.state.lock().error.take() {
            return Err(e);
        }
        self.shared.take_error()
    }
}

impl NativeQueue for WgpuQueue {
    fn submit(&self, command: Command) -> Result<()> {
        self.progress.state.lock().pending += 1;
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        };
        if !sent {
            let mut state = self.progress.state.lock();
            state.pending -= 1;
            if state.pending == 0 {
                self.progress.idle.notify_all();
            }
            return Err(Error::driver("webgpu queue worker has stopped"));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.shared.device.poll(wgpu::Maintain::Poll);
        self.take_error()
    }

    fn finish(&self) -> Result<()> {
        self.wait_idle();
        self.shared.device.poll(wgpu::Maintain::Wait);
        self.take_error()
    }

    fn start_profiling(&self) -> Result<()> {
        Ok(())
    }

    fn stop_profiling(&self) -> Result<u64> {
        Ok(0)
    }
}

impl Drop for WgpuQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("webgpu queue worker panicked");
            }
        }
    }
}

fn run_worker(
    receiver: mpsc::Receiver<Command>,
    shared: Arc<WgpuShared>,
    progress: Arc<Progress>,
) {
    for command in receiver {
        let name = command.name();
        let result = execute(&shared, command);

        let mut state = progress.state.lock();
        if let Err(e) = result {
            log::error!("webgpu {}: {}", name, e);
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        state.pending -= 1;
        if state.pending == 0 {
            progress.idle.notify_all();
        }
    }
}

fn execute(shared: &WgpuShared, command: Command) -> Result<()> {
    match command {
        Command::Dispatch(d) => encode(shared, &d),
        Command::WriteBuffer { dst, offset, data } => {
            wgpu_buffer(dst.as_ref())?.write(shared, offset, &data)
        }
        Command::FillBuffer { dst, pattern } => wgpu_buffer(dst.as_ref())?.fill(shared, &pattern),
        Command::ReadBuffer {
            src,
            offset,
            len,
            reply,
        } => {
            let data = wgpu_buffer(src.as_ref()).and_then(|b| b.read(shared, offset, len));
            let _ = reply.send(data);
            Ok(())
        }
        Command::CopyBuffer { src, dst, size } => {
            wgpu_buffer(src.as_ref())?.copy_to(shared, wgpu_buffer(dst.as_ref())?, size);
            Ok(())
        }
        Command::WriteImage { .. } | Command::CopyImage { .. } => Err(Error::unsupported(
            "images are not available on the WebGPU backend",
        )),
        Command::ReadImage { reply, .. } => {
            let _ = reply.send(Err(Error::unsupported(
                "images are not available on the WebGPU backend",
            )));
            Ok(())
        }
        Command::SignalFence(fence) => {
            shared.queue.on_submitted_work_done(move || {
                if let Some(fence) = fence.upgrade() {
                    fence.signal();
                }
            });
            Ok(())
        }
        Command::WaitFence(fence) => {
            loop {
                let Some(strong) = fence.upgrade() else {
                    log::warn!(
                        "fence destroyed before it was signalled; treating the wait as satisfied"
                    );
                    break;
                };
                if strong.is_signalled() {
                    break;
                }
                // drives on_submitted_work_done callbacks of other queues
                shared.device.poll(wgpu::Maintain::Poll);
                strong.wait(Some(FENCE_POLL_INTERVAL));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::BACKEND_ID;
    use crate::buffer::BufferFlags;
    use crate::config::{BackendPreference, ContextOptions};
    use crate::context::Context;
    use crate::queue::QueueKind;

    #[test]
    fn test_wait_before_signal_does_not_block_submitter() {
        let context =
            match Context::create(BackendPreference::named(BACKEND_ID), &ContextOptions::default()) {
                Ok(context) => context,
                Err(e) => {
                    eprintln!("skipping: no WebGPU adapter ({})", e);
                    return;
                }
            };
        let device = context.default_device();
        let waiter = context.create_queue(device, QueueKind::Compute).unwrap();
        let signaller = context.create_queue(device, QueueKind::Compute).unwrap();
        let fence = context.create_fence(device).unwrap();
        let buffer = context
            .create_buffer(device, 16, BufferFlags::READ_WRITE, None)
            .unwrap();

        // both calls return while the fence is still unsignalled
        fence.wait_on(&waiter).unwrap();
        buffer.write(&waiter, &[7u8; 16]).unwrap();
        waiter.flush().unwrap();
        assert!(!fence.is_signalled());

        fence.signal_on(&signaller).unwrap();
        signaller.finish().unwrap();
        fence.wait(Some(Duration::from_secs(10))).unwrap();
        waiter.finish().unwrap();

        let mut out = [0u8; 16];
        buffer.read(&waiter, &mut out).unwrap();
        assert_eq!(out, [7u8; 16]);
    }
}
