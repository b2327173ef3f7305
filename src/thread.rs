//! The worker pool: one transform worker per logical CPU, plus the I/O
//! submission and request-queue singletons.
//!
//! Workers pull from priority-ordered callback FIFOs (I/O completions
//! first, then entry re-examinations, then crypto) so in-flight chunks
//! drain and release their reservations before new transform work
//! starts. Each worker owns private transform state; work arrives
//! through the shared queues, never through shared mutable context.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Error};
use log::debug;

use crate::chunkdata;
use crate::device::DeviceInner;
use crate::request;
use crate::transform::{Compression, TfmState};

/// Callback classes, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callback {
    CompleteIo = 0,
    UpdateChunk = 1,
    Crypto = 2,
}

pub(crate) const NR_CALLBACKS: usize = 3;

pub(crate) struct WorkItem {
    pub dev: Arc<DeviceInner>,
    pub entry: usize,
}

struct CallbackQueues {
    list: [VecDeque<WorkItem>; NR_CALLBACKS],
    stop: bool,
}

struct IoQueue {
    list: VecDeque<WorkItem>,
    stop: bool,
}

struct DevQueue {
    list: VecDeque<Arc<DeviceInner>>,
    stop: bool,
}

/// Reference counts of compression types registered by live devices.
/// Workers lazily resync their private state when the generation
/// changes.
struct CompressUsers {
    users: [u32; 4],
    generation: u64,
}

struct PoolShared {
    queues: Mutex<CallbackQueues>,
    queues_cv: Condvar,
    io: Mutex<IoQueue>,
    io_cv: Condvar,
    reqs: Mutex<DevQueue>,
    reqs_cv: Condvar,
    compress: Mutex<CompressUsers>,
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Threads {
    workers: HashMap<usize, WorkerHandle>,
    io: Option<JoinHandle<()>>,
    request: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Threads>,
}

impl WorkerPool {
    /// Start one worker per logical CPU plus the two singletons.
    pub fn new() -> Result<Arc<Self>, Error> {
        let shared = Arc::new(PoolShared {
            queues: Mutex::new(CallbackQueues {
                list: Default::default(),
                stop: false,
            }),
            queues_cv: Condvar::new(),
            io: Mutex::new(IoQueue {
                list: VecDeque::new(),
                stop: false,
            }),
            io_cv: Condvar::new(),
            reqs: Mutex::new(DevQueue {
                list: VecDeque::new(),
                stop: false,
            }),
            reqs_cv: Condvar::new(),
            compress: Mutex::new(CompressUsers {
                users: [0; 4],
                generation: 0,
            }),
        });

        let pool = Arc::new(Self {
            shared,
            threads: Mutex::new(Threads::default()),
        });

        {
            let mut threads = pool.threads.lock().unwrap();
            for cpu in 0..num_cpus::get() {
                start_worker(&mut threads, &pool.shared, cpu)?;
            }

            let shared = pool.shared.clone();
            threads.io = Some(
                std::thread::Builder::new()
                    .name("nexus-io".to_string())
                    .spawn(move || io_main(shared))
                    .map_err(|err| anyhow::format_err!("unable to start I/O thread - {}", err))?,
            );

            let shared = pool.shared.clone();
            threads.request = Some(
                std::thread::Builder::new()
                    .name("nexus-req".to_string())
                    .spawn(move || request_main(shared))
                    .map_err(|err| {
                        anyhow::format_err!("unable to start request thread - {}", err)
                    })?,
            );
        }

        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.threads.lock().unwrap().workers.len()
    }

    /// Bring up a worker for a newly online CPU. A duplicate start
    /// request is ignored.
    pub fn cpu_online(&self, cpu: usize) -> Result<(), Error> {
        let mut threads = self.threads.lock().unwrap();
        if threads.workers.contains_key(&cpu) {
            return Ok(());
        }
        debug!("onlining CPU {}", cpu);
        start_worker(&mut threads, &self.shared, cpu)
    }

    /// Stop the worker for an offlined CPU, unless it is the last one:
    /// the pool refuses to lose all workers.
    pub fn cpu_offline(&self, cpu: usize) -> Result<(), Error> {
        let handle = {
            let mut threads = self.threads.lock().unwrap();
            if !threads.workers.contains_key(&cpu) {
                return Ok(());
            }
            if threads.workers.len() == 1 {
                bail!("refusing to stop CPU {}: it is running our last worker thread", cpu);
            }
            threads.workers.remove(&cpu)
        };
        if let Some(handle) = handle {
            debug!("offlining CPU {}", cpu);
            handle.stop.store(true, Ordering::SeqCst);
            self.shared.queues_cv.notify_all();
            let _ = handle.join.join();
        }
        Ok(())
    }

    /// Stop every thread and wait for them to exit. Queued work items
    /// are dropped.
    pub fn shutdown(&self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.stop = true;
            self.shared.queues_cv.notify_all();
        }
        {
            let mut io = self.shared.io.lock().unwrap();
            io.stop = true;
            self.shared.io_cv.notify_all();
        }
        {
            let mut reqs = self.shared.reqs.lock().unwrap();
            reqs.stop = true;
            self.shared.reqs_cv.notify_all();
        }

        let mut threads = self.threads.lock().unwrap();
        for (_, handle) in threads.workers.drain() {
            handle.stop.store(true, Ordering::SeqCst);
            let _ = handle.join.join();
        }
        if let Some(join) = threads.io.take() {
            let _ = join.join();
        }
        if let Some(join) = threads.request.take() {
            let _ = join.join();
        }
    }

    pub(crate) fn schedule(&self, cb: Callback, item: WorkItem) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.list[cb as usize].push_back(item);
        self.shared.queues_cv.notify_one();
    }

    pub(crate) fn schedule_io(&self, item: WorkItem) {
        let mut io = self.shared.io.lock().unwrap();
        io.list.push_back(item);
        self.shared.io_cv.notify_one();
    }

    pub(crate) fn schedule_request(&self, dev: Arc<DeviceInner>) {
        let mut reqs = self.shared.reqs.lock().unwrap();
        reqs.list.push_back(dev);
        self.shared.reqs_cv.notify_one();
    }

    /// Register the compression types a new device requires; the
    /// workers pick up the change before their next crypto callback.
    pub(crate) fn register_compress(&self, supported: u32) {
        let mut compress = self.shared.compress.lock().unwrap();
        for &alg in Compression::all() {
            if supported & alg.bit() != 0 {
                compress.users[alg as usize] += 1;
            }
        }
        compress.generation += 1;
    }

    pub(crate) fn unregister_compress(&self, supported: u32) {
        let mut compress = self.shared.compress.lock().unwrap();
        for &alg in Compression::all() {
            if supported & alg.bit() != 0 && compress.users[alg as usize] > 0 {
                compress.users[alg as usize] -= 1;
            }
        }
        compress.generation += 1;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_worker(
    threads: &mut Threads,
    shared: &Arc<PoolShared>,
    cpu: usize,
) -> Result<(), Error> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let worker_shared = shared.clone();
    let join = std::thread::Builder::new()
        .name(format!("nexus/{}", cpu))
        .spawn(move || worker_main(worker_shared, cpu, worker_stop))
        .map_err(|err| anyhow::format_err!("unable to start worker for CPU {} - {}", cpu, err))?;
    threads.workers.insert(cpu, WorkerHandle { stop, join });
    Ok(())
}

fn pin_to_cpu(cpu: usize) {
    let mut set = nix::sched::CpuSet::new();
    if set.set(cpu).is_err() {
        return;
    }
    if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
        debug!("unable to pin worker to cpu {} - {}", cpu, err);
    }
}

fn pop_callback(queues: &mut CallbackQueues) -> Option<(Callback, WorkItem)> {
    // lower-numbered classes drain first
    const ORDER: [Callback; NR_CALLBACKS] =
        [Callback::CompleteIo, Callback::UpdateChunk, Callback::Crypto];
    for &cb in ORDER.iter() {
        if let Some(item) = queues.list[cb as usize].pop_front() {
            return Some((cb, item));
        }
    }
    None
}

fn worker_main(shared: Arc<PoolShared>, cpu: usize, stop: Arc<AtomicBool>) {
    pin_to_cpu(cpu);
    // stay below interactive processes, like the original worker threads
    unsafe {
        libc::nice(5);
    }

    let mut ts = TfmState::new();
    let mut seen_generation = u64::MAX;

    loop {
        let (cb, item) = {
            let mut queues = shared.queues.lock().unwrap();
            loop {
                if queues.stop || stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(found) = pop_callback(&mut queues) {
                    break found;
                }
                queues = shared.queues_cv.wait(queues).unwrap();
            }
        };

        if cb == Callback::Crypto {
            sync_tfm_state(&shared, &mut ts, &mut seen_generation);
        }

        match cb {
            Callback::CompleteIo => chunkdata::complete_io(&item.dev, item.entry),
            Callback::UpdateChunk => chunkdata::run_chunk(&item.dev, item.entry),
            Callback::Crypto => chunkdata::chunk_tfm(&mut ts, &item.dev, item.entry),
        }

        item.dev.finish_work();
        std::thread::yield_now();
    }
}

fn sync_tfm_state(shared: &PoolShared, ts: &mut TfmState, seen: &mut u64) {
    let compress = shared.compress.lock().unwrap();
    if compress.generation == *seen {
        return;
    }
    for &alg in Compression::all() {
        if compress.users[alg as usize] > 0 {
            ts.compress_add(alg);
        } else {
            ts.compress_remove(alg);
        }
    }
    *seen = compress.generation;
}

/// The I/O submission singleton. Backing-store transfers may block on
/// the store's own queue depth, and that must not stall the transform
/// workers.
fn io_main(shared: Arc<PoolShared>) {
    loop {
        let item = {
            let mut io = shared.io.lock().unwrap();
            loop {
                if io.stop {
                    return;
                }
                if let Some(item) = io.list.pop_front() {
                    break item;
                }
                io = shared.io_cv.wait(io).unwrap();
            }
        };
        chunkdata::execute_io(&item.dev, item.entry);
        item.dev.finish_work();
    }
}

/// The request-queue singleton. Only one thread ever walks a device's
/// request list, so an allocation-failure retry keeps queue order.
fn request_main(shared: Arc<PoolShared>) {
    loop {
        let dev = {
            let mut reqs = shared.reqs.lock().unwrap();
            loop {
                if reqs.stop {
                    return;
                }
                if let Some(dev) = reqs.list.pop_front() {
                    break dev;
                }
                reqs = shared.reqs_cv.wait(reqs).unwrap();
            }
        };
        request::run_requests(&dev);
    }
}
