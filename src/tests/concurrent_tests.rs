//! 并发测试模块
//! 以缩短的时长复刻压力场景：宽限期、离线读者、三槽轮换、
//! 并发退休与注册竞争

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crate::{drop_boxed, Ebr, Gc, Qsbr};

const MAGIC: u32 = 0x5a5a_5a5a;

/// 压力场景中的共享数据槽，按缓存行对齐
#[repr(align(64))]
struct DataSlot {
    ptr: AtomicPtr<u32>,
    visible: AtomicBool,
}

impl DataSlot {
    fn published() -> Self {
        DataSlot {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(MAGIC))),
            visible: AtomicBool::new(true),
        }
    }
}

/// 测试1: QSBR 宽限期压力测试
///
/// 一个写入者轮流撤下和重新发布四个数据槽；三个读者在检查点之间
/// 解引用可见槽位并断言魔数未被破坏。写入者在宽限期结束后先污染
/// 对象再释放，因此过早回收会让某个读者读到被污染的值。
#[test]
fn test_qsbr_grace_period_stress() {
    let qsbr = Qsbr::new();
    let slots: Arc<Vec<DataSlot>> = Arc::new((0..4).map(|_| DataSlot::published()).collect());
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let qsbr = qsbr.clone();
        let slots = Arc::clone(&slots);
        let stop = Arc::clone(&stop);

        readers.push(thread::spawn(move || {
            let handle = qsbr.register();
            let mut n = 0usize;
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & 3;
                if slots[n].visible.load(Ordering::Acquire) {
                    let p = slots[n].ptr.load(Ordering::Acquire);
                    if !p.is_null() {
                        // 错误的回收机制会让这里读到污染值
                        assert_eq!(unsafe { *p }, MAGIC);
                    }
                }
                handle.checkpoint();
            }
            // 确保等待中的写入者能够结束
            handle.checkpoint();
        }));
    }

    let writer = qsbr.register();
    let deadline = Instant::now() + Duration::from_millis(200);
    let mut n = 0usize;
    while Instant::now() < deadline {
        n = (n + 1) & 3;
        let slot = &slots[n];

        if slot.visible.load(Ordering::Relaxed) {
            // 对象可见：先将其撤下（"删除"语义）
            slot.visible.store(false, Ordering::Release);

            // 确保所有读者都已停止使用该对象
            let target = writer.barrier();
            while !writer.sync(target) {
                thread::sleep(Duration::from_micros(10));
            }

            // 现在可以安全地污染并释放对象
            let p = slot.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
            unsafe {
                *p = 0;
                drop(Box::from_raw(p));
            }
        } else {
            // 对象不可见：重新发布（"插入"语义）
            slot.ptr
                .store(Box::into_raw(Box::new(MAGIC)), Ordering::Release);
            slot.visible.store(true, Ordering::Release);
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    // 读者都已退出，剩余对象可以直接释放
    for slot in slots.iter() {
        let p = slot.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

/// 测试2: 离线读者不阻塞宽限期
///
/// 四个读者中两个进入扩展静止状态；写入者推进并同步时
/// 只需等待在线的两个。
#[test]
fn test_qsbr_sync_skips_offline_readers() {
    let qsbr = Qsbr::new();
    let writer = qsbr.register();

    let r1 = qsbr.register();
    let r2 = qsbr.register();
    let r3 = qsbr.register();
    let r4 = qsbr.register();

    r3.offline();
    r4.offline();

    let target = writer.barrier();
    // 在线的读者尚未观察到新纪元
    assert!(!writer.sync(target));

    r1.checkpoint();
    r2.checkpoint();
    // 离线的 r3/r4 被跳过，不需要任何动作
    assert!(writer.sync(target));
}

/// 测试3: EBR 三槽轮换
///
/// 在暂存纪元退休的对象经过两次成功推进后变得可回收；
/// 持有旧纪元守卫的读者会把第二次推进挡住，直到它退出。
#[test]
fn test_ebr_three_slot_rotation() {
    let hits = Arc::new(AtomicUsize::new(0));
    let ebr = Ebr::new();
    let reader = ebr.register();
    let mut gc = Gc::new(ebr.clone(), drop_boxed::<Counted>);

    // 读者在退休之前进入临界区
    let guard = reader.enter();

    let retired_at = ebr.staging_epoch();
    let obj = Box::into_raw(Box::new(Counted { hits: Arc::clone(&hits) }));
    unsafe { gc.limbo(obj as *mut ()) };

    // 第一次推进成功（读者处于当前纪元）
    assert!(ebr.sync().is_some());
    assert!(!gc.try_flush());

    // 读者现在停留在旧纪元，第二次推进被挡住
    assert!(ebr.sync().is_none());
    assert_eq!(hits.load(Ordering::Relaxed), 0);

    // 读者退出后第二次推进完成，退休纪元轮换到现任位置
    drop(guard);
    assert!(ebr.sync().is_some());
    assert_eq!(ebr.incumbent_epoch(), retired_at);
    assert!(gc.try_flush());
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

/// 计数析构的测试对象；析构时污染魔数字段
struct Counted {
    hits: Arc<AtomicUsize>,
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// 带魔数的链节点，析构时先覆盖魔数再计数
struct PoisonNode {
    magic: u32,
    hits: Arc<AtomicUsize>,
}

impl Drop for PoisonNode {
    fn drop(&mut self) {
        self.magic = 0;
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// 测试4: EBR 支撑的队列在并发读取下退休大量节点
///
/// 单个写入者以随机化的节奏退休节点，读者在临界区内遍历；
/// 析构计数最终与退休计数完全一致，且没有读者解引用到
/// 已被污染（即已析构）的节点。
#[test]
fn test_gc_ebr_concurrent_retirement() {
    const RETIRES: usize = 100_000;

    let hits = Arc::new(AtomicUsize::new(0));
    let ebr = Ebr::new();
    let slot: Arc<AtomicPtr<PoisonNode>> = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let ebr = ebr.clone();
        let slot = Arc::clone(&slot);
        let stop = Arc::clone(&stop);

        readers.push(thread::spawn(move || {
            let handle = ebr.register();
            while !stop.load(Ordering::Relaxed) {
                let guard = handle.enter();
                let p = slot.load(Ordering::Acquire);
                if !p.is_null() {
                    // 节点在守卫存活期间必须仍未被析构
                    assert_eq!(unsafe { (*p).magic }, MAGIC);
                }
                drop(guard);
            }
        }));
    }

    let mut gc = Gc::new(ebr.clone(), drop_boxed::<PoisonNode>);
    for i in 0..RETIRES {
        let fresh = Box::into_raw(Box::new(PoisonNode {
            magic: MAGIC,
            hits: Arc::clone(&hits),
        }));
        let old = slot.swap(fresh, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { gc.limbo(old as *mut ()) };
        }

        // 不规则地推进和排空，让队列长度自然波动
        if i % 64 == 0 {
            let _ = ebr.sync();
            gc.try_flush();
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    // 读者都已注销，最后一个节点也可以退休并排空
    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { gc.limbo(last as *mut ()) };
    gc.flush(Duration::from_micros(50));

    assert_eq!(hits.load(Ordering::Relaxed), RETIRES);
}

/// 测试5: QSBR 支撑的队列在并发检查点下退休大量节点
#[test]
fn test_gc_qsbr_concurrent_retirement() {
    const RETIRES: usize = 50_000;

    let hits = Arc::new(AtomicUsize::new(0));
    let qsbr = Qsbr::new();
    let slot: Arc<AtomicPtr<PoisonNode>> = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..2 {
        let qsbr = qsbr.clone();
        let slot = Arc::clone(&slot);
        let stop = Arc::clone(&stop);

        readers.push(thread::spawn(move || {
            let handle = qsbr.register();
            handle.checkpoint();
            while !stop.load(Ordering::Relaxed) {
                let p = slot.load(Ordering::Acquire);
                if !p.is_null() {
                    assert_eq!(unsafe { (*p).magic }, MAGIC);
                }
                handle.checkpoint();
            }
            handle.checkpoint();
        }));
    }

    let mut gc = Gc::new(qsbr.register(), drop_boxed::<PoisonNode>);
    for i in 0..RETIRES {
        let fresh = Box::into_raw(Box::new(PoisonNode {
            magic: MAGIC,
            hits: Arc::clone(&hits),
        }));
        let old = slot.swap(fresh, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { gc.limbo(old as *mut ()) };
        }

        if i % 256 == 0 {
            gc.try_flush();
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { gc.limbo(last as *mut ()) };
    gc.flush(Duration::from_micros(50));

    assert_eq!(hits.load(Ordering::Relaxed), RETIRES);
}

/// 测试6: 64 个线程同时注册
///
/// 所有线程注册完成后注册表恰好包含 64 条互不相同的记录；
/// 并发的 CAS 插入不会丢失或重复任何记录。
#[test]
fn test_qsbr_registration_race() {
    const THREADS: usize = 64;

    let qsbr = Qsbr::new();
    let start = Arc::new(Barrier::new(THREADS));
    let registered = Arc::new(Barrier::new(THREADS));

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let qsbr = qsbr.clone();
        let start = Arc::clone(&start);
        let registered = Arc::clone(&registered);

        workers.push(thread::spawn(move || {
            start.wait();
            let handle = qsbr.register();
            handle.checkpoint();
            // 所有线程都注册完之前不许注销，防止记录被复用
            registered.wait();
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(qsbr.registered(), THREADS);
}

/// 测试7: EBR 的注册竞争
#[test]
fn test_ebr_registration_race() {
    const THREADS: usize = 64;

    let ebr = Ebr::new();
    let start = Arc::new(Barrier::new(THREADS));
    let registered = Arc::new(Barrier::new(THREADS));

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let ebr = ebr.clone();
        let start = Arc::clone(&start);
        let registered = Arc::clone(&registered);

        workers.push(thread::spawn(move || {
            start.wait();
            let handle = ebr.register();
            let _guard = handle.enter();
            registered.wait();
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ebr.registered(), THREADS);
}

/// 测试8: 注册与 sync 并发进行
///
/// 写入者持续推进纪元的同时不断有读者注册、进入临界区再注销；
/// 结束后注册表的记录数不超过并发峰值。
#[test]
fn test_registration_during_sync() {
    let ebr = Ebr::new();
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let ebr = ebr.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let _ = ebr.sync();
            }
        })
    };

    let mut churners = Vec::new();
    for _ in 0..4 {
        let ebr = ebr.clone();
        let stop = Arc::clone(&stop);
        churners.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let handle = ebr.register();
                let guard = handle.enter();
                drop(guard);
            }
        }));
    }

    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    for churner in churners {
        churner.join().unwrap();
    }

    // 停驻的记录被复用，注册表停留在并发峰值附近而不会无限增长
    assert!(ebr.registered() <= 16);
}
