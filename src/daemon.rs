// Background tasks: the periodic write-back of dirty cache slots and
// read-ahead. Both are plain threads owned by whoever mounted the
// filesystem; nothing here is a process-wide singleton, and dropping the
// handles stops the work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::block::BlockDevice;
use crate::freemap::SectorAllocator;
use crate::fs::Filesystem;
use crate::param::FLUSH_INTERVAL_MS;

/// Handle to the periodic flush task. Stops (and joins) on drop.
pub struct FlushDaemon {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushDaemon {
    /// Start a task that writes dirty cache slots back every
    /// `FLUSH_INTERVAL_MS` milliseconds until stopped.
    pub fn spawn<D, A>(fs: &Arc<Filesystem<D, A>>) -> Self
    where
        D: BlockDevice + 'static,
        A: SectorAllocator + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let fs = Arc::clone(fs);
        let thread = thread::Builder::new()
            .name("blockfs-flush".into())
            .spawn(move || loop {
                // Sleep in short steps so stopping does not wait out the
                // whole interval.
                let mut slept = 0;
                while slept < FLUSH_INTERVAL_MS {
                    if flag.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(50));
                    slept += 50;
                }
                fs.flush(false);
            })
            .expect("spawn flush task");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.halt();
    }
}

impl<D, A> Filesystem<D, A>
where
    D: BlockDevice + 'static,
    A: SectorAllocator + 'static,
{
    /// Best-effort asynchronous prefetch of the sector after `sector`.
    /// Never blocks the caller and never fails visibly; the fetch runs on
    /// a one-shot task and the slot is left unpinned.
    pub fn read_ahead(self: &Arc<Self>, sector: u32) {
        let Some(next) = sector.checked_add(1) else {
            return;
        };
        let fs = Arc::clone(self);
        let _ = thread::Builder::new()
            .name("blockfs-read-ahead".into())
            .spawn(move || fs.prefetch(next));
    }
}

/// A mounted filesystem: the shared context plus its flush task. Explicit
/// `unmount` (or drop) stops the task and flushes everything with halt.
pub struct Mount<D: BlockDevice + 'static, A: SectorAllocator + 'static> {
    fs: Arc<Filesystem<D, A>>,
    daemon: Option<FlushDaemon>,
}

impl<D: BlockDevice + 'static, A: SectorAllocator + 'static> Mount<D, A> {
    pub fn new(device: D, allocator: A) -> Self {
        let fs = Arc::new(Filesystem::new(device, allocator));
        let daemon = FlushDaemon::spawn(&fs);
        Self {
            fs,
            daemon: Some(daemon),
        }
    }

    /// The shared context, for spawning work that outlives a borrow.
    pub fn fs(&self) -> &Arc<Filesystem<D, A>> {
        &self.fs
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
        self.fs.flush(true);
    }
}

impl<D: BlockDevice + 'static, A: SectorAllocator + 'static> core::ops::Deref for Mount<D, A> {
    type Target = Filesystem<D, A>;
    fn deref(&self) -> &Self::Target {
        &self.fs
    }
}

impl<D: BlockDevice + 'static, A: SectorAllocator + 'static> Drop for Mount<D, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}
