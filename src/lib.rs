// Safe memory reclamation primitives for lock-free data structures:
// QSBR, EBR, and a deferred-reclamation queue over either. Writers defer
// destruction of objects readers may still observe until a grace period
// proves no reader can hold a reference.
// 用于无锁数据结构的安全内存回收原语：
// QSBR、EBR，以及叠加在两者任一之上的延迟回收队列。
// 写入者推迟销毁读者可能仍在观察的对象，
// 直到宽限期证明没有读者还能持有引用。

mod ebr;
mod gc;
mod qsbr;
mod registry;
mod sync;

pub use ebr::{Ebr, EbrGuard, EbrThread, EBR_EPOCHS};
pub use gc::{drop_boxed, Destructor, Gc, Smr};
pub use qsbr::{Epoch, Qsbr, QsbrThread};

#[cfg(all(test, not(feature = "loom")))]
mod tests;
