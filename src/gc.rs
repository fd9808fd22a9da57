use std::collections::VecDeque;
use std::time::Duration;

use crate::ebr::Ebr;
use crate::qsbr::{Epoch, QsbrThread};

/// The per-instance destructor invoked on each reclaimed object.
/// 对每个被回收对象调用的实例级析构函数。
pub type Destructor = unsafe fn(*mut ());

/// The contract a deferred-reclamation queue requires of its backing SMR.
///
/// `staging_epoch` yields the tag to attach to a new retirement,
/// `is_safe` reports whether the grace period of a tag has elapsed, and
/// `advance` drives the backing forward for flush-style draining.
///
/// 延迟回收队列对其底层 SMR 的要求契约。
/// `staging_epoch` 给出新退休对象应附加的标签，
/// `is_safe` 报告某个标签的宽限期是否已过，
/// `advance` 为 flush 式排空推动底层机制前进。
pub trait Smr {
    /// The tag for objects retired at this moment.
    /// 此刻退休的对象应采用的标签。
    fn staging_epoch(&self) -> Epoch;

    /// Has the grace period of `tag` elapsed? False means "not yet",
    /// never an error.
    /// `tag` 的宽限期是否已过？false 表示"尚未"，而不是错误。
    fn is_safe(&self, tag: Epoch) -> bool;

    /// Drive the backing SMR one step and return the new staging tag.
    /// 推动底层 SMR 前进一步并返回新的暂存标签。
    fn advance(&self) -> Epoch;
}

impl Smr for Ebr {
    fn staging_epoch(&self) -> Epoch {
        Ebr::staging_epoch(self) as Epoch
    }

    /// Safe exactly when the tag's slot has rotated into the incumbent
    /// position, i.e. two successful advances after the retirement.
    ///
    /// 当且仅当该标签的槽位轮换到现任位置时安全，
    /// 即退休之后两次成功推进。
    fn is_safe(&self, tag: Epoch) -> bool {
        tag == self.incumbent_epoch() as Epoch
    }

    fn advance(&self) -> Epoch {
        let _ = self.sync();
        Ebr::staging_epoch(self) as Epoch
    }
}

impl Smr for QsbrThread {
    /// The tag of a retirement is the epoch of the barrier issued after
    /// it: a reader can only reach that epoch by checkpointing after the
    /// retirement became visible, at which point it holds no reference.
    ///
    /// 退休对象的标签是其后发出的屏障的纪元：
    /// 读者只有在退休变得可见之后设置检查点才能到达该纪元，
    /// 而那时它已不持有任何引用。
    fn staging_epoch(&self) -> Epoch {
        self.barrier()
    }

    fn is_safe(&self, tag: Epoch) -> bool {
        self.sync(tag)
    }

    fn advance(&self) -> Epoch {
        self.barrier()
    }
}

/// A deferred-reclamation queue over an SMR backing.
///
/// Writers retire objects into the queue with [`limbo`](Gc::limbo); each
/// entry is tagged with the staging epoch of the backing at that moment
/// and owned solely by the queue until it is handed to the destructor.
/// [`try_flush`](Gc::try_flush) destroys the FIFO prefix whose grace
/// periods have elapsed; [`flush`](Gc::flush) polls until the queue is
/// empty.
///
/// The queue is single-writer: all mutating operations take `&mut self`,
/// so sharing one `Gc` between writer threads requires external mutual
/// exclusion.
///
/// # Example
/// ```
/// use smr_epoch::{drop_boxed, Ebr, Gc};
///
/// let ebr = Ebr::new();
/// let mut gc = Gc::new(ebr.clone(), drop_boxed::<u64>);
///
/// let retired = Box::into_raw(Box::new(7u64));
/// unsafe { gc.limbo(retired as *mut ()) };
///
/// // Reclaimable once the retirement epoch has aged two generations.
/// ebr.sync().unwrap();
/// ebr.sync().unwrap();
/// assert!(gc.try_flush());
/// ```
///
/// 基于 SMR 底层机制的延迟回收队列。
/// 写入者通过 [`limbo`](Gc::limbo) 将对象退休到队列中；
/// 每个条目以当时底层机制的暂存纪元为标签，
/// 并在交给析构函数之前由队列独占拥有。
/// [`try_flush`](Gc::try_flush) 销毁宽限期已过的 FIFO 前缀；
/// [`flush`](Gc::flush) 轮询直到队列为空。
/// 该队列是单写入者的：所有修改操作都取 `&mut self`，
/// 因此在写入者线程间共享一个 `Gc` 需要外部互斥。
#[derive(Debug)]
pub struct Gc<S: Smr> {
    backing: S,
    dtor: Destructor,
    queue: VecDeque<(Epoch, *mut ())>,
}

impl<S: Smr> Gc<S> {
    /// Create a queue over `backing` with the given destructor.
    /// 基于 `backing` 和给定的析构函数创建队列。
    pub fn new(backing: S, dtor: Destructor) -> Self {
        Gc {
            backing,
            dtor,
            queue: VecDeque::new(),
        }
    }

    /// The backing SMR. A QSBR-backed writer checkpoints and issues
    /// barriers through this.
    ///
    /// 底层 SMR。QSBR 支撑的写入者通过它设置检查点和发出屏障。
    pub fn backing(&self) -> &S {
        &self.backing
    }

    /// Append an object to the limbo queue, tagged with the current
    /// staging epoch of the backing.
    ///
    /// # Safety
    ///
    /// `ptr` must already be unreachable from protected storage, must be
    /// valid to pass to this queue's destructor, and must not be touched
    /// by the caller afterwards.
    ///
    /// 将对象附加当前暂存纪元的标签后放入 limbo 队列。
    /// # Safety
    /// `ptr` 必须已经无法从受保护存储到达，必须可以有效地传给
    /// 本队列的析构函数，且调用者此后不得再访问它。
    pub unsafe fn limbo(&mut self, ptr: *mut ()) {
        let tag = self.backing.staging_epoch();
        self.queue.push_back((tag, ptr));
    }

    /// Are there unreclaimed entries? Informational.
    /// 是否存在未回收的条目？仅供参考。
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Attempt to drain the queue without blocking.
    ///
    /// Inspects the head entry; while the backing reports its tag as
    /// safe, pops it and invokes the destructor. Stops at the first entry
    /// whose grace period has not yet elapsed. Destructors run in FIFO
    /// order on the calling thread. Returns true iff the queue is empty
    /// on exit.
    ///
    /// 尝试在不阻塞的情况下排空队列。
    /// 检查队首条目；只要底层机制报告其标签安全，就弹出并调用
    /// 析构函数。在第一个宽限期尚未结束的条目处停止。
    /// 析构函数按 FIFO 顺序在调用线程上运行。
    /// 当且仅当退出时队列为空才返回 true。
    pub fn try_flush(&mut self) -> bool {
        loop {
            let (tag, ptr) = match self.queue.front() {
                Some(&entry) => entry,
                None => break,
            };
            if !self.backing.is_safe(tag) {
                break;
            }
            self.queue.pop_front();
            // SAFETY: the entry's grace period has elapsed, and the queue
            // held the only reference since `limbo`.
            // SAFETY: 该条目的宽限期已过，且自 `limbo` 起队列持有
            // 唯一引用。
            unsafe { (self.dtor)(ptr) };
        }
        self.queue.is_empty()
    }

    /// Drain the queue, blocking until it is empty.
    ///
    /// Drives the backing forward, then polls [`try_flush`](Gc::try_flush)
    /// with the caller-supplied sleep between rounds, advancing again on
    /// each round. As with [`QsbrThread::wait`], a reader that never
    /// leaves its critical section makes this loop forever.
    ///
    /// 排空队列，阻塞直到其为空。
    /// 先推动底层机制前进，然后以调用者提供的睡眠间隔轮询
    /// [`try_flush`](Gc::try_flush)，每一轮都再次推进。
    /// 与 [`QsbrThread::wait`] 一样，永不离开临界区的读者会使它
    /// 永远循环。
    pub fn flush(&mut self, sleep: Duration) {
        self.backing.advance();
        while !self.try_flush() {
            std::thread::sleep(sleep);
            self.backing.advance();
        }
    }
}

impl<S: Smr> Drop for Gc<S> {
    fn drop(&mut self) {
        // Entries still in limbo cannot be destroyed here: their grace
        // periods may not have elapsed.
        // 仍在 limbo 中的条目不能在此销毁：它们的宽限期可能尚未结束。
        assert!(
            !self.has_pending(),
            "BUG: dropping a Gc with entries still in limbo; flush it first"
        );
    }
}

/// Ready-made destructor for objects retired as `Box<T>`.
///
/// # Safety
///
/// Must only be installed in a [`Gc`] whose every retired pointer came
/// from `Box::<T>::into_raw`.
///
/// 用于以 `Box<T>` 形式退休的对象的现成析构函数。
/// # Safety
/// 只能安装到每个退休指针都来自 `Box::<T>::into_raw` 的 [`Gc`] 中。
pub unsafe fn drop_boxed<T>(ptr: *mut ()) {
    drop(unsafe { Box::from_raw(ptr as *mut T) });
}
