use std::marker::PhantomData;
use std::ptr;

use crossbeam_queue::SegQueue;

use crate::sync::{AtomicPtr, Ordering};

/// Per-thread state stored in a registry node.
///
/// Implementors encode three observable conditions in their atomic state:
/// live (scanned normally), offline-like values their own scans skip, and
/// a *parked* sentinel meaning the owning thread has unregistered.
///
/// 存储在注册表节点中的线程本地状态。
/// 实现者在其原子状态中编码三种可观察条件：
/// 存活（正常被扫描）、其扫描会跳过的类离线值、
/// 以及表示拥有线程已注销的"停驻"哨兵值。
pub(crate) trait Slot: Default {
    /// Return the slot to its freshly-registered state.
    ///
    /// Called by the claiming thread after it popped the slot off the
    /// free list, so it has exclusive ownership at that point.
    ///
    /// 将槽位恢复到刚注册完成的状态。
    /// 由从空闲列表中弹出该槽位的线程调用，此时它拥有独占所有权。
    fn reset(&self);

    /// Mark the slot parked so registry scans skip it.
    /// 将槽位标记为停驻，使注册表扫描跳过它。
    fn park(&self);
}

/// A registry node: one per-thread record plus the intrusive link.
///
/// The link is written exactly once before the node is published with a
/// release CAS on the registry head; after publication it is immutable.
///
/// 注册表节点：一个线程记录加上侵入式链接。
/// 链接在节点通过注册表头部的 release CAS 发布之前恰好写入一次；
/// 发布后不可变。
#[repr(align(64))]
#[derive(Debug)]
pub(crate) struct Node<S> {
    pub(crate) slot: S,
    next: *const Node<S>,
}

/// Wrapper moving a parked node pointer through the free list.
/// 通过空闲列表传递停驻节点指针的包装。
struct Parked<S>(*const Node<S>);

// SAFETY: a parked node's slot is only touched through its atomics, and
// popping the queue transfers exclusive claiming rights to one thread.
// SAFETY: 停驻节点的槽位只通过其原子量访问，
// 且弹出队列将独占认领权转移给单个线程。
unsafe impl<S: Send + Sync> Send for Parked<S> {}

/// An intrusive, singly-linked registry of per-thread records.
///
/// Insertion is lock-free: a single compare-and-swap at the head publishes
/// a fully initialized node. Nodes are never unlinked while the registry
/// is alive; an unregistered thread's node is parked and queued for reuse
/// by the next registration, and all nodes are freed when the registry is
/// dropped. Traversal therefore needs no synchronization beyond an acquire
/// load of the head.
///
/// 侵入式单链线程记录注册表。
/// 插入是无锁的：头部的单次 compare-and-swap 发布一个完全初始化的节点。
/// 注册表存活期间节点从不被摘除；已注销线程的节点被停驻并排入队列，
/// 供下一次注册复用，所有节点在注册表被 drop 时释放。
/// 因此遍历除了对头部的 acquire 加载外不需要其他同步。
#[derive(Debug)]
pub(crate) struct Registry<S> {
    head: AtomicPtr<Node<S>>,
    free: SegQueue<Parked<S>>,
}

impl<S: Slot> Registry<S> {
    pub(crate) fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
            free: SegQueue::new(),
        }
    }

    /// Obtain a record for the calling thread: revive a parked node if one
    /// is available, otherwise allocate and push a fresh one.
    ///
    /// 为调用线程获取一条记录：如果有停驻节点则复活它，
    /// 否则分配并推入一个新节点。
    pub(crate) fn acquire(&self) -> *const Node<S> {
        if let Some(Parked(node)) = self.free.pop() {
            // The pop handed us exclusive claiming rights.
            // 弹出操作将独占认领权交给了我们。
            unsafe { (*node).slot.reset() };
            return node;
        }

        let node = Box::into_raw(Box::new(Node {
            slot: S::default(),
            next: ptr::null(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // The node is still private here; plain writes to the link are
            // published by the release CAS below.
            // 此处节点仍是私有的；对链接的普通写入由下方的 release CAS 发布。
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return node,
                Err(observed) => head = observed,
            }
        }
    }

    /// Park the record of an unregistering thread and queue it for reuse.
    /// The caller must not touch the slot afterwards.
    ///
    /// 停驻注销线程的记录并将其排队以供复用。
    /// 调用者此后不得再访问该槽位。
    pub(crate) fn release(&self, node: *const Node<S>) {
        unsafe { (*node).slot.park() };
        self.free.push(Parked(node));
    }

    /// Iterate over every record ever inserted, parked ones included.
    /// 遍历所有插入过的记录，包括停驻的记录。
    pub(crate) fn iter(&self) -> Iter<'_, S> {
        Iter {
            node: self.head.load(Ordering::Acquire),
            _registry: PhantomData,
        }
    }

    /// Number of nodes in the registry (live and parked).
    /// 注册表中的节点数量（存活的和停驻的）。
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }
}

pub(crate) struct Iter<'a, S> {
    node: *const Node<S>,
    _registry: PhantomData<&'a Registry<S>>,
}

impl<'a, S> Iterator for Iter<'a, S> {
    type Item = &'a S;

    fn next(&mut self) -> Option<&'a S> {
        if self.node.is_null() {
            return None;
        }
        // SAFETY: nodes are only freed by Registry::drop, which requires
        // exclusive access, so they outlive this shared borrow.
        // SAFETY: 节点只由需要独占访问的 Registry::drop 释放，
        // 所以它们比这个共享借用活得更久。
        let node = unsafe { &*self.node };
        self.node = node.next;
        Some(&node.slot)
    }
}

impl<S> Drop for Registry<S> {
    fn drop(&mut self) {
        // All threads have unregistered by the time the owning instance is
        // dropped, so the list is ours to tear down.
        // 拥有它的实例被 drop 时所有线程都已注销，
        // 因此这个链表由我们来拆除。
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next as *mut Node<S>;
        }
    }
}
