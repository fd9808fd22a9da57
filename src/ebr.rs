use crate::registry::{Node, Registry, Slot};
use crate::sync::{fence, Arc, AtomicUsize, Cell, Ordering};

/// Number of epoch slots in the rotation.
/// 轮换中的纪元槽位数量。
pub const EBR_EPOCHS: usize = 3;

/// Low bit of the record word: set while the thread is inside a critical
/// section. The remaining bits hold the epoch the thread entered at.
/// 记录字的最低位：线程处于临界区内时置位。
/// 其余位保存线程进入时的纪元。
const ACTIVE: usize = 1;

/// Record word of a thread that is registered but not in a critical
/// section.
/// 已注册但不在临界区内的线程的记录字。
const STATE_INACTIVE: usize = 0;

/// Record word of a parked (unregistered) record.
/// 停驻（已注销）记录的记录字。
const STATE_PARKED: usize = usize::MAX;

/// A registered thread's record: `(epoch << 1) | active` in one word, so
/// the entry into a critical section is a single publication.
///
/// Cache-line aligned to prevent false sharing between reader threads.
/// The nesting counter is not here: it is touched only by the owning
/// thread and lives in [`EbrThread`].
///
/// 已注册线程的记录：单个字中的 `(epoch << 1) | active`，
/// 使进入临界区成为一次单独的发布。
/// 缓存行对齐以防止读者线程之间的伪共享。
/// 嵌套计数不在这里：它只被拥有线程访问，存放于 [`EbrThread`]。
#[derive(Debug)]
pub(crate) struct EbrSlot {
    state: AtomicUsize,
}

impl Default for EbrSlot {
    fn default() -> Self {
        EbrSlot {
            state: AtomicUsize::new(STATE_INACTIVE),
        }
    }
}

impl Slot for EbrSlot {
    fn reset(&self) {
        self.state.store(STATE_INACTIVE, Ordering::Release);
    }

    fn park(&self) {
        self.state.store(STATE_PARKED, Ordering::Release);
    }
}

/// Shared state of one EBR instance: the global epoch and the registry.
/// 单个 EBR 实例的共享状态：全局纪元和注册表。
#[repr(align(64))]
#[derive(Debug)]
struct EbrShared {
    global_epoch: AtomicUsize,
    registry: Registry<EbrSlot>,
}

/// Epoch-based reclamation (EBR).
///
/// Reader threads bracket their accesses to protected objects in critical
/// sections ([`EbrThread::enter`]); writers call [`sync`](Ebr::sync) to
/// rotate the global epoch through three slots. The epoch advances only
/// when every reader inside a critical section has been observed in the
/// current epoch, so the three slots form a pipeline of generations:
///
/// - [`staging_epoch`](Ebr::staging_epoch): the current epoch; new
///   retirements are tagged with it.
/// - [`pending_epoch`](Ebr::pending_epoch): becomes reclaimable after
///   the next successful advance.
/// - [`incumbent_epoch`](Ebr::incumbent_epoch): retirements tagged with
///   it have aged two full generations and are reclaimable now.
///
/// An object retired at staging epoch E can thus only be destroyed once
/// the epoch has advanced twice, by which time every reader that could
/// have observed it has exited.
///
/// `Ebr` is a cheap `Clone` handle around shared state.
///
/// # Example
/// ```
/// use smr_epoch::Ebr;
///
/// let ebr = Ebr::new();
/// let thread = ebr.register();
///
/// let guard = thread.enter();
/// // ... load and dereference protected pointers ...
/// drop(guard);
///
/// // With no reader in the way the epoch advances freely.
/// assert_eq!(ebr.sync(), Some(1));
/// ```
///
/// 基于纪元的回收（EBR）。
/// 读者线程将对受保护对象的访问括在临界区中（[`EbrThread::enter`]）；
/// 写入者调用 [`sync`](Ebr::sync) 使全局纪元在三个槽位间轮换。
/// 只有当临界区内的每个读者都被观察到处于当前纪元时纪元才会推进，
/// 因此三个槽位构成一条世代流水线：
/// - [`staging_epoch`](Ebr::staging_epoch)：当前纪元；
///   新的退休对象以它为标签。
/// - [`pending_epoch`](Ebr::pending_epoch)：下一次成功推进后
///   变得可回收。
/// - [`incumbent_epoch`](Ebr::incumbent_epoch)：以它为标签的退休
///   对象已经老化两整代，现在即可回收。
/// 因此在暂存纪元 E 退休的对象只有在纪元推进两次之后才会被销毁，
/// 到那时所有可能观察到它的读者都已退出。
/// `Ebr` 是共享状态的廉价 `Clone` 句柄。
#[derive(Clone, Debug)]
pub struct Ebr {
    shared: Arc<EbrShared>,
}

impl Ebr {
    /// Create a new EBR instance.
    /// 创建一个新的 EBR 实例。
    pub fn new() -> Self {
        Ebr {
            shared: Arc::new(EbrShared {
                global_epoch: AtomicUsize::new(0),
                registry: Registry::new(),
            }),
        }
    }

    /// Register the calling thread, returning its per-thread handle.
    ///
    /// As in QSBR registration, a parked record is reused when available;
    /// otherwise a fresh one is published with a compare-and-swap at the
    /// registry head. A newly registered thread is outside any critical
    /// section and never blocks the epoch.
    ///
    /// 注册调用线程，返回其线程句柄。
    /// 与 QSBR 注册一样，有停驻记录时复用之；否则通过注册表头部的
    /// compare-and-swap 发布新记录。新注册的线程不在任何临界区内，
    /// 从不阻塞纪元。
    pub fn register(&self) -> EbrThread {
        EbrThread {
            shared: Arc::clone(&self.shared),
            node: self.shared.registry.acquire(),
            nesting: Cell::new(0),
        }
    }

    /// Attempt to advance the global epoch.
    ///
    /// Scans every registered thread; if some active thread is still
    /// stamped with an older epoch, returns `None`. Otherwise advances
    /// the epoch modulo three and returns the new epoch. This is the only
    /// function that advances the epoch. When several writers race,
    /// exactly one wins per generation; the losers observe the updated
    /// epoch on their next call.
    ///
    /// 尝试推进全局纪元。
    /// 扫描每个已注册线程；如果某个活跃线程仍停留在较旧的纪元，
    /// 返回 `None`。否则将纪元模三推进并返回新纪元。
    /// 这是唯一推进纪元的函数。多个写入者竞争时，每一代恰好一个获胜；
    /// 失败者在下次调用时观察到已更新的纪元。
    pub fn sync(&self) -> Option<usize> {
        let epoch = self.shared.global_epoch.load(Ordering::SeqCst);

        for slot in self.shared.registry.iter() {
            // The load must be ordered after the readers' announcements;
            // it pairs with the fence in `enter`.
            // 该加载必须排在读者的公告之后；它与 `enter` 中的栅栏配对。
            let state = slot.state.load(Ordering::SeqCst);
            if state == STATE_PARKED {
                continue;
            }
            if state & ACTIVE == ACTIVE && state >> 1 != epoch {
                // Pinned in a different epoch; cannot advance yet.
                // 钉在不同的纪元；尚不能推进。
                return None;
            }
        }

        let next = (epoch + 1) % EBR_EPOCHS;
        match self
            .shared
            .global_epoch
            .compare_exchange(epoch, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Some(next),
            // Another writer advanced this generation first.
            // 另一个写入者先推进了这一代。
            Err(_) => None,
        }
    }

    /// The epoch new retirements should be tagged with (the current
    /// global epoch).
    ///
    /// 新的退休对象应当采用的标签纪元（当前全局纪元）。
    #[inline]
    pub fn staging_epoch(&self) -> usize {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    /// The epoch whose retirements become reclaimable after the next
    /// successful [`sync`](Ebr::sync).
    ///
    /// 其退休对象在下一次成功 [`sync`](Ebr::sync) 之后变得可回收的纪元。
    #[inline]
    pub fn pending_epoch(&self) -> usize {
        (self.staging_epoch() + 2) % EBR_EPOCHS
    }

    /// The epoch whose retirements are reclaimable now: anything tagged
    /// with it was retired two generations ago, and no reader from that
    /// generation remains.
    ///
    /// 其退休对象现在即可回收的纪元：以它为标签的对象在两代之前退休，
    /// 那一代的读者已不复存在。
    #[inline]
    pub fn incumbent_epoch(&self) -> usize {
        (self.staging_epoch() + 1) % EBR_EPOCHS
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread registered with an [`Ebr`] instance.
///
/// The handle owns the thread's registry record and the critical-section
/// nesting counter. It may be moved to another thread but not shared;
/// dropping it unregisters the thread (the record is parked for reuse).
/// It cannot be dropped while a guard is still alive (guards borrow it).
///
/// 注册到 [`Ebr`] 实例的线程。
/// 该句柄拥有线程的注册表记录和临界区嵌套计数。
/// 它可以被移动到另一个线程但不能共享；drop 它即注销线程
///（记录被停驻以供复用）。守卫借用它，因此守卫存活时无法 drop。
pub struct EbrThread {
    shared: Arc<EbrShared>,
    node: *const Node<EbrSlot>,
    nesting: Cell<usize>,
}

// SAFETY: the record word is written only through this handle, the
// nesting counter lives in the handle itself, and the borrow rules
// confine the handle to one thread at a time. The raw node pointer stays
// valid for as long as the `Arc` keeps the registry alive.
// SAFETY: 记录字只通过这个句柄写入，嵌套计数就在句柄自身中，
// 借用规则使句柄同一时刻只属于一个线程。
// 只要 `Arc` 使注册表保持存活，裸节点指针就有效。
unsafe impl Send for EbrThread {}

impl EbrThread {
    #[inline]
    fn slot(&self) -> &EbrSlot {
        // SAFETY: nodes live until the registry is dropped, and the
        // registry outlives this handle's `Arc`.
        // SAFETY: 节点存活到注册表被 drop 为止，
        // 而注册表比本句柄的 `Arc` 活得更久。
        unsafe { &(*self.node).slot }
    }

    /// Enter a critical section.
    ///
    /// While the returned guard is alive, any pointer loaded from
    /// protected storage remains safe to dereference. Entries nest: only
    /// the outermost enter publishes the `(epoch, active)` word, inner
    /// ones just bump the nesting counter. The critical section ends when
    /// the last guard is dropped.
    ///
    /// 进入临界区。
    /// 返回的守卫存活期间，从受保护存储加载的任何指针都可以安全解引用。
    /// 进入可以嵌套：只有最外层的 enter 发布 `(epoch, active)` 记录字，
    /// 内层只递增嵌套计数。最后一个守卫被 drop 时临界区结束。
    #[inline]
    pub fn enter(&self) -> EbrGuard<'_> {
        let nesting = self.nesting.get();
        if nesting == 0 {
            let epoch = self.shared.global_epoch.load(Ordering::Relaxed);
            self.slot().state.store((epoch << 1) | ACTIVE, Ordering::Relaxed);
            // The announcement must be fully visible before any load from
            // shared memory; pairs with the epoch scan in `sync`.
            // 公告必须在任何共享内存加载之前完全可见；
            // 与 `sync` 中的纪元扫描配对。
            fence(Ordering::SeqCst);
        }
        self.nesting.set(nesting + 1);

        EbrGuard { thread: self }
    }

    /// Whether the thread is currently inside a critical section.
    /// 线程当前是否处于临界区内。
    #[inline]
    pub fn is_entered(&self) -> bool {
        self.nesting.get() > 0
    }
}

impl Drop for EbrThread {
    fn drop(&mut self) {
        // Guards borrow the handle, so nesting is necessarily zero here.
        // 守卫借用句柄，因此此处嵌套计数必然为零。
        debug_assert_eq!(self.nesting.get(), 0);
        self.shared.registry.release(self.node);
    }
}

/// A guard keeping the current thread inside an EBR critical section.
///
/// Obtained from [`EbrThread::enter`]. It is `!Send` and `!Sync`: it
/// refers to the thread handle it came from, and its lifetime is bound to
/// it. Cloning a guard is a valid way to re-enter: it increments the
/// nesting counter. Dropping the last guard exits the critical section
/// and clears the record word with a release store.
///
/// 使当前线程保持在 EBR 临界区内的守卫。
/// 由 [`EbrThread::enter`] 获得。它是 `!Send` 和 `!Sync` 的：
/// 它引用其来源的线程句柄，生命周期与之绑定。
/// 克隆守卫是合法的重入方式：它递增嵌套计数。
/// drop 最后一个守卫即退出临界区，并以 release 存储清空记录字。
#[must_use]
pub struct EbrGuard<'a> {
    thread: &'a EbrThread,
}

impl<'a> Clone for EbrGuard<'a> {
    #[inline]
    fn clone(&self) -> Self {
        let nesting = self.thread.nesting.get();
        assert!(
            nesting > 0,
            "BUG: cloning an EbrGuard outside a critical section (nesting = 0)"
        );
        self.thread.nesting.set(nesting + 1);

        EbrGuard { thread: self.thread }
    }
}

impl<'a> Drop for EbrGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        let nesting = self.thread.nesting.get();
        assert!(
            nesting > 0,
            "BUG: dropping an EbrGuard outside a critical section (nesting = 0)"
        );
        if nesting == 1 {
            self.thread.slot().state.store(STATE_INACTIVE, Ordering::Release);
        }
        self.thread.nesting.set(nesting - 1);
    }
}
