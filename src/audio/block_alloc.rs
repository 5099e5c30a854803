//! Lock-free 定长内存块分配器
//!
//! 设计目标：
//! - 零锁：alloc/free 只做 CAS，不会阻塞实时线程
//! - 零分配：所有块在构造时一次性预分配
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 空闲链表是带版本号的 Treiber 栈（head = tag << 32 | index），
//! 版本号避免 ABA，生产者 alloc、消费者 free 可以同时进行。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use thiserror::Error;

/// 空链接
const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// 分配器错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("block pool exhausted ({capacity} blocks of {block_size} bytes)")]
    OutOfMemory { capacity: usize, block_size: usize },
}

/// 内存块句柄
///
/// 句柄不可复制，只能通过 `BlockAllocator::free` 归还，
/// 因此同一个块不会被释放两次，也不会在释放后继续访问。
#[derive(Debug)]
#[must_use = "blocks must be returned with BlockAllocator::free"]
pub struct Block {
    index: u32,
}

impl Block {
    /// 块在池中的序号
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// 放弃句柄，只保留序号（由调用方继续负责归还）
    #[inline]
    pub(crate) fn into_raw(self) -> u32 {
        self.index
    }

    /// 从序号恢复句柄
    ///
    /// # Safety
    /// 序号必须来自 `into_raw`，且没有其他存活的句柄指向同一个块
    #[inline]
    pub(crate) unsafe fn from_raw(index: u32) -> Self {
        Self { index }
    }
}

/// 定长块内存池
pub struct BlockAllocator {
    storage: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    capacity: usize,

    /// 空闲链表链接（每块一个）
    next: Box<[AtomicU32]>,

    // 生产者和消费者都会改写 head，独占一个 cache line
    head: CachePadded<AtomicU64>,
    free_count: CachePadded<AtomicUsize>,

    /// alloc 失败次数（实时线程只计数，不打日志）
    failures: AtomicU64,

    memory_locked: AtomicBool,
}

unsafe impl Send for BlockAllocator {}
unsafe impl Sync for BlockAllocator {}

impl BlockAllocator {
    /// 创建 `capacity` 个 `block_size` 字节的块
    pub fn new(block_size: usize, capacity: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        assert!(capacity < NIL as usize, "too many blocks");

        let storage: Vec<UnsafeCell<u8>> = (0..block_size * capacity)
            .map(|_| UnsafeCell::new(0))
            .collect();

        let next: Vec<AtomicU32> = (0..capacity)
            .map(|i| {
                let link = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
                AtomicU32::new(link)
            })
            .collect();

        let first = if capacity > 0 { 0 } else { NIL };

        Self {
            storage: storage.into_boxed_slice(),
            block_size,
            capacity,
            next: next.into_boxed_slice(),
            head: CachePadded::new(AtomicU64::new(pack(0, first))),
            free_count: CachePadded::new(AtomicUsize::new(capacity)),
            failures: AtomicU64::new(0),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 分配一个块
    ///
    /// 池耗尽时立即返回 `OutOfMemory`，调用方应当丢弃这段数据。
    /// 此函数是 lock-free 的，绝不阻塞
    pub fn alloc(&self) -> Result<Block, AllocError> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let (tag, index) = unpack(head);
            if index == NIL {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(AllocError::OutOfMemory {
                    capacity: self.capacity,
                    block_size: self.block_size,
                });
            }

            let next = self.next[index as usize].load(Ordering::Relaxed);
            let new_head = pack(tag.wrapping_add(1), next);

            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                    return Ok(Block { index });
                }
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// 归还一个块
    ///
    /// 可以与另一线程的 `alloc` 并发调用，绝不阻塞
    pub fn free(&self, block: Block) {
        let index = block.into_raw();
        debug_assert!((index as usize) < self.capacity, "block from another pool");

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let (tag, top) = unpack(head);
            self.next[index as usize].store(top, Ordering::Relaxed);
            let new_head = pack(tag.wrapping_add(1), index);

            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }

        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 块大小（构造时固定）
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 池中块的总数
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲块数（并发下是估计值）
    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// alloc 失败的累计次数
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// 读取块内容
    #[inline]
    pub fn bytes(&self, block: &Block) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.block_ptr(block.index), self.block_size) }
    }

    /// 写入块内容
    ///
    /// `&mut Block` 保证同一时刻只有一个可写视图
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, block: &mut Block) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.block_ptr(block.index), self.block_size) }
    }

    /// 按序号读取块内容（队列内部使用）
    ///
    /// # Safety
    /// 调用方必须在逻辑上持有该块，且没有并发的写入
    #[inline]
    pub(crate) unsafe fn raw_bytes(&self, index: u32) -> &[u8] {
        std::slice::from_raw_parts(self.block_ptr(index), self.block_size)
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut u8 {
        let offset = index as usize * self.block_size;
        assert!(offset + self.block_size <= self.storage.len());
        // UnsafeCell<u8> 与 u8 布局相同
        UnsafeCell::raw_get(unsafe { self.storage.as_ptr().add(offset) })
    }

    /// 锁定池内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }
        if self.storage.is_empty() {
            return false;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let len = self.storage.len();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Block pool memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock block pool memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁池内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.storage.len());
        }
        log::debug!("Block pool memory unlocked");
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = BlockAllocator::new(64, 3);
        assert_eq!(pool.block_size(), 64);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(pool.free_blocks(), 0);

        let err = pool.alloc().unwrap_err();
        assert_eq!(
            err,
            AllocError::OutOfMemory {
                capacity: 3,
                block_size: 64
            }
        );
        assert_eq!(pool.failures(), 1);

        // 三个块互不相同
        assert_ne!(a.index(), b.index());
        assert_ne!(b.index(), c.index());
        assert_ne!(a.index(), c.index());

        pool.free(b);
        assert_eq!(pool.free_blocks(), 1);
        let d = pool.alloc().unwrap();

        pool.free(a);
        pool.free(c);
        pool.free(d);
        assert_eq!(pool.free_blocks(), 3);
    }

    #[test]
    fn test_block_contents() {
        let pool = BlockAllocator::new(8, 2);
        let mut a = pool.alloc().unwrap();
        let mut b = pool.alloc().unwrap();

        pool.bytes_mut(&mut a).copy_from_slice(&[1; 8]);
        pool.bytes_mut(&mut b).copy_from_slice(&[2; 8]);

        assert_eq!(pool.bytes(&a), &[1; 8]);
        assert_eq!(pool.bytes(&b), &[2; 8]);

        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_empty_pool() {
        let pool = BlockAllocator::new(16, 0);
        assert!(pool.alloc().is_err());
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn test_producer_alloc_consumer_free() {
        const ROUNDS: usize = 20_000;
        let pool = Arc::new(BlockAllocator::new(4, 8));
        let (tx, rx) = mpsc::sync_channel::<Block>(4);

        let consumer_pool = Arc::clone(&pool);
        let consumer = thread::spawn(move || {
            let mut seen = 0usize;
            for block in rx {
                let value = u32::from_ne_bytes(consumer_pool.bytes(&block).try_into().unwrap());
                assert_eq!(value as usize, seen);
                seen += 1;
                consumer_pool.free(block);
            }
            seen
        });

        let mut sent = 0usize;
        while sent < ROUNDS {
            match pool.alloc() {
                Ok(mut block) => {
                    pool.bytes_mut(&mut block)
                        .copy_from_slice(&(sent as u32).to_ne_bytes());
                    tx.send(block).unwrap();
                    sent += 1;
                }
                Err(_) => thread::yield_now(),
            }
        }
        drop(tx);

        assert_eq!(consumer.join().unwrap(), ROUNDS);
        assert_eq!(pool.free_blocks(), 8);
    }
}
