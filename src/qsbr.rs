use std::marker::PhantomData;
use std::time::Duration;

use crate::registry::{Node, Registry, Slot};
use crate::sync::{fence, Arc, AtomicU64, Cell, Ordering};

/// A quiescent-state epoch value.
///
/// 64-bit so that counter wraparound is impractical: at one barrier per
/// nanosecond the counter lasts for centuries.
///
/// 静止状态纪元值。
/// 64 位使计数器回绕不具有实际可能性：即使每纳秒一次屏障，
/// 计数器也能使用数个世纪。
pub type Epoch = u64;

/// Freshly registered, no checkpoint published yet. A thread in this state
/// is assumed to hold references, so it blocks grace periods.
/// 刚注册完成，尚未发布检查点。处于此状态的线程被假定持有引用，
/// 因此会阻塞宽限期。
const EPOCH_FRESH: Epoch = 0;

/// Extended quiescent state: the thread is offline and writers never wait
/// on it.
/// 扩展静止状态：线程已离线，写入者从不等待它。
const EPOCH_OFFLINE: Epoch = 1;

/// The owning thread has unregistered and the record awaits reuse.
/// 拥有线程已注销，该记录等待复用。
const EPOCH_PARKED: Epoch = Epoch::MAX;

/// First real epoch; everything below is reserved.
/// 第一个真实纪元；更小的值均被保留。
const EPOCH_INIT: Epoch = 2;

/// A registered thread's record: the epoch observed at its most recent
/// checkpoint, or one of the reserved values above.
///
/// Cache-line aligned to prevent false sharing between reader threads.
///
/// 已注册线程的记录：其最近一次检查点观察到的纪元，
/// 或上面保留值之一。
/// 缓存行对齐以防止读者线程之间的伪共享。
#[derive(Debug)]
pub(crate) struct QsbrSlot {
    local_epoch: AtomicU64,
}

impl Default for QsbrSlot {
    fn default() -> Self {
        QsbrSlot {
            local_epoch: AtomicU64::new(EPOCH_FRESH),
        }
    }
}

impl Slot for QsbrSlot {
    fn reset(&self) {
        self.local_epoch.store(EPOCH_FRESH, Ordering::Release);
    }

    fn park(&self) {
        self.local_epoch.store(EPOCH_PARKED, Ordering::Release);
    }
}

/// Shared state of one QSBR instance: the global epoch and the registry.
/// 单个 QSBR 实例的共享状态：全局纪元和注册表。
#[repr(align(64))]
#[derive(Debug)]
struct QsbrShared {
    global_epoch: AtomicU64,
    registry: Registry<QsbrSlot>,
}

/// Quiescent-state-based reclamation (QSBR).
///
/// Each registered thread periodically indicates that it is quiescent,
/// i.e. holds no references to objects which may be reclaimed, by calling
/// [`QsbrThread::checkpoint`], typically once per processed request, when
/// no shared state is referenced any longer. The longer the period, the
/// coarser the reclamation granularity.
///
/// Writers first make the objects they want to reclaim unreachable, then
/// issue a [`barrier`](Qsbr::barrier), which returns a generation number.
/// It is safe to reclaim those objects once [`QsbrThread::sync`] returns
/// true for that number. The interface is asynchronous: polling is the
/// caller's job ([`QsbrThread::wait`] is the ready-made polling loop).
///
/// `Qsbr` is a cheap `Clone` handle around shared state; create one at
/// startup and clone it into every thread that needs it.
///
/// # Example
/// ```
/// use smr_epoch::Qsbr;
///
/// let qsbr = Qsbr::new();
/// let thread = qsbr.register();
///
/// // Reader: references held between checkpoints stay valid.
/// thread.checkpoint();
///
/// // Writer: unlink the object, then wait out the grace period.
/// let target = thread.barrier();
/// assert!(thread.sync(target));
/// ```
///
/// 基于静止状态的回收（QSBR）。
/// 每个已注册线程周期性地通过调用 [`QsbrThread::checkpoint`] 表明自己
/// 处于静止状态，即不持有任何可能被回收对象的引用，通常在处理完一个
/// 请求、不再引用任何共享状态时调用。周期越长，回收粒度越粗。
/// 写入者先使待回收对象不可达，然后发出 [`barrier`](Qsbr::barrier)，
/// 它返回一个代号。当 [`QsbrThread::sync`] 对该代号返回 true 之后，
/// 回收这些对象就是安全的。该接口是异步的：轮询由调用者负责
///（[`QsbrThread::wait`] 是现成的轮询循环）。
/// `Qsbr` 是共享状态的廉价 `Clone` 句柄；在启动时创建一个，
/// 并克隆到每个需要它的线程。
#[derive(Clone, Debug)]
pub struct Qsbr {
    shared: Arc<QsbrShared>,
}

impl Qsbr {
    /// Create a new QSBR instance.
    /// 创建一个新的 QSBR 实例。
    pub fn new() -> Self {
        Qsbr {
            shared: Arc::new(QsbrShared {
                global_epoch: AtomicU64::new(EPOCH_INIT),
                registry: Registry::new(),
            }),
        }
    }

    /// Register the calling thread, returning its per-thread handle.
    ///
    /// The record of a previously unregistered thread is reused when one
    /// is available; otherwise a fresh record is pushed onto the registry
    /// with a single compare-and-swap at the head. Until its first
    /// checkpoint the new thread is assumed non-quiescent and blocks
    /// grace periods.
    ///
    /// 注册调用线程，返回其线程句柄。
    /// 如果有先前注销线程的记录可用则复用之；否则通过头部的单次
    /// compare-and-swap 将新记录推入注册表。在第一次检查点之前，
    /// 新线程被假定为非静止，会阻塞宽限期。
    pub fn register(&self) -> QsbrThread {
        QsbrThread {
            shared: Arc::clone(&self.shared),
            node: self.shared.registry.acquire(),
            _not_sync: PhantomData,
        }
    }

    /// Start a new generation: atomically increment the global epoch and
    /// return the new value. The read-modify-write orders the caller's
    /// prior removals before the new epoch becomes observable.
    ///
    /// 开启新的一代：原子地递增全局纪元并返回新值。
    /// 该读-改-写操作使调用者先前的移除先于新纪元变得可观察。
    pub fn barrier(&self) -> Epoch {
        self.shared.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The current global epoch.
    /// 当前全局纪元。
    pub fn global_epoch(&self) -> Epoch {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread registered with a [`Qsbr`] instance.
///
/// The handle owns the thread's registry record. It may be moved to
/// another thread but not shared between threads; all stores to the
/// record go through it. Dropping the handle unregisters the thread:
/// the record is parked and becomes available for reuse by the next
/// registration. A thread should be offline, or have published a final
/// checkpoint, before dropping its handle.
///
/// 注册到 [`Qsbr`] 实例的线程。
/// 该句柄拥有线程的注册表记录。它可以被移动到另一个线程，
/// 但不能在线程间共享；对记录的所有存储都经由它进行。
/// drop 该句柄即注销线程：记录被停驻，可供下一次注册复用。
/// 线程应当在 drop 其句柄之前先离线，或发布最后一次检查点。
#[derive(Debug)]
pub struct QsbrThread {
    shared: Arc<QsbrShared>,
    node: *const Node<QsbrSlot>,
    _not_sync: PhantomData<Cell<()>>,
}

// SAFETY: the record consists solely of atomics and is written only
// through this handle, which the borrow rules confine to one thread at a
// time. The raw node pointer stays valid for as long as the `Arc` keeps
// the shared state (and with it the registry) alive.
// SAFETY: 记录完全由原子量构成，且只通过这个句柄写入，
// 借用规则使句柄同一时刻只属于一个线程。
// 只要 `Arc` 使共享状态（连同注册表）保持存活，裸节点指针就有效。
unsafe impl Send for QsbrThread {}

impl QsbrThread {
    #[inline]
    fn slot(&self) -> &QsbrSlot {
        // SAFETY: nodes live until the registry is dropped, and the
        // registry outlives this handle's `Arc`.
        // SAFETY: 节点存活到注册表被 drop 为止，
        // 而注册表比本句柄的 `Arc` 活得更久。
        unsafe { &(*self.node).slot }
    }

    /// Indicate a quiescent state: at this instant the thread holds no
    /// references to protected objects.
    ///
    /// The release fence publishes all preceding accesses as finished
    /// before the local epoch is stored; the acquire fence keeps
    /// subsequent reads from migrating above it.
    ///
    /// 表明静止状态：此刻线程不持有任何受保护对象的引用。
    /// release 栅栏在存储本地纪元之前将所有先前访问发布为已完成；
    /// acquire 栅栏防止后续读取被重排到它之前。
    #[inline]
    pub fn checkpoint(&self) {
        fence(Ordering::Release);
        self.slot()
            .local_epoch
            .store(self.shared.global_epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        fence(Ordering::Acquire);
    }

    /// The epoch observed at this thread's most recent checkpoint.
    /// 本线程最近一次检查点观察到的纪元。
    #[inline]
    pub fn local_epoch(&self) -> Epoch {
        self.slot().local_epoch.load(Ordering::Relaxed)
    }

    /// Enter the extended quiescent state. Writers will not wait on this
    /// thread until it comes back [`online`](QsbrThread::online).
    ///
    /// 进入扩展静止状态。在该线程重新 [`online`](QsbrThread::online)
    /// 之前，写入者不会等待它。
    #[inline]
    pub fn offline(&self) {
        fence(Ordering::Release);
        self.slot().local_epoch.store(EPOCH_OFFLINE, Ordering::Relaxed);
    }

    /// Leave the extended quiescent state by re-observing the global
    /// epoch.
    ///
    /// 通过重新观察全局纪元离开扩展静止状态。
    #[inline]
    pub fn online(&self) {
        self.slot()
            .local_epoch
            .store(self.shared.global_epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        fence(Ordering::Acquire);
    }

    /// Same as [`Qsbr::barrier`], through the thread handle.
    /// 与 [`Qsbr::barrier`] 相同，经由线程句柄调用。
    #[inline]
    pub fn barrier(&self) -> Epoch {
        self.shared.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Has the grace period that started at `target` elapsed?
    ///
    /// The caller first observes the epoch itself (an implicit
    /// checkpoint, which also brings an offline thread back online), then
    /// scans the registry: true iff every registered thread is offline,
    /// parked, or has observed an epoch at least `target`.
    ///
    /// Returning false only means "not yet"; it is not an error.
    ///
    /// `target` 所开启的宽限期是否已经过去？
    /// 调用者先自己观察该纪元（一次隐式检查点，它也会使离线线程重新
    /// 上线），然后扫描注册表：当且仅当每个已注册线程都处于离线、
    /// 停驻状态，或已观察到不小于 `target` 的纪元时返回 true。
    /// 返回 false 只表示"尚未"；它不是错误。
    pub fn sync(&self, target: Epoch) -> bool {
        self.checkpoint();

        for slot in self.shared.registry.iter() {
            let epoch = slot.local_epoch.load(Ordering::Acquire);
            if epoch == EPOCH_OFFLINE || epoch == EPOCH_PARKED {
                continue;
            }
            if epoch < target {
                // Not ready to reclaim.
                // 尚不能回收。
                return false;
            }
        }
        true
    }

    /// Start a new generation and block until every registered thread has
    /// observed it, polling with the caller-supplied sleep interval.
    ///
    /// Termination depends on the readers: if every reader checkpoints
    /// (or goes offline) periodically this returns, but a reader that
    /// never becomes quiescent again makes it loop forever.
    ///
    /// 开启新的一代并阻塞直到每个已注册线程都观察到它，
    /// 以调用者提供的睡眠间隔轮询。
    /// 是否终止取决于读者：如果每个读者都周期性地设置检查点
    ///（或离线），此函数会返回；但一个再也不进入静止状态的读者
    /// 会使它永远循环。
    pub fn wait(&self, sleep: Duration) {
        let target = self.barrier();
        while !self.sync(target) {
            std::thread::sleep(sleep);
        }
    }
}

impl Drop for QsbrThread {
    fn drop(&mut self) {
        self.shared.registry.release(self.node);
    }
}
