//! Lock-free Single-Producer Single-Consumer Slice Queue
//!
//! 字节流 FIFO，由定长内存块（slice）串成的单向链表构成：
//! - 生产者只追加 slice，消费者只摘除 slice，互不加锁
//! - 支持部分读：剩余不足一个 slice 时记录游标，下次从中间继续
//! - `total_bytes` 单独用原子计数维护，供阈值判断
//!
//! 链表带一个哨兵节点（head 永远指向"已消费完"的节点），
//! 消费者只有在前移 head 之后才归还旧节点，因此生产者写入的 tail
//! 永远不会被消费者释放。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::block_alloc::{Block, BlockAllocator};

/// 空链接
const NIL: u32 = u32::MAX;

/// SPSC slice 队列
pub struct SliceQueue {
    allocator: BlockAllocator,

    /// 每块一个：后继 slice
    links: Box<[AtomicU32]>,
    /// 每块一个：slice 有效字节数
    lengths: Box<[AtomicUsize]>,

    // 消费者拥有：哨兵节点 + 前端 slice 的读游标
    head: CachePadded<AtomicU32>,
    read_offset: CachePadded<AtomicUsize>,

    // 生产者拥有：最后一个 slice
    tail: CachePadded<AtomicU32>,

    // 两端都会改写
    total_bytes: CachePadded<AtomicUsize>,

    // 调试用：检测违反 SPSC 约定的调用
    reading: AtomicBool,
    writing: AtomicBool,
}

impl SliceQueue {
    /// 创建最多容纳 `max_slices` 个 slice 的队列
    pub fn new(slice_size: usize, max_slices: usize) -> Self {
        // 多出的一块作为哨兵
        let blocks = max_slices + 1;
        let allocator = BlockAllocator::new(slice_size, blocks);

        let links: Vec<AtomicU32> = (0..blocks).map(|_| AtomicU32::new(NIL)).collect();
        let lengths: Vec<AtomicUsize> = (0..blocks).map(|_| AtomicUsize::new(0)).collect();

        let stub = match allocator.alloc() {
            Ok(block) => block.into_raw(),
            Err(_) => unreachable!("pool always holds the sentinel block"),
        };

        Self {
            allocator,
            links: links.into_boxed_slice(),
            lengths: lengths.into_boxed_slice(),
            head: CachePadded::new(AtomicU32::new(stub)),
            read_offset: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicU32::new(stub)),
            total_bytes: CachePadded::new(AtomicUsize::new(0)),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
        }
    }

    /// 按字节预算创建队列
    ///
    /// 每次写入至少一个 slice 时，最坏情况下每次写入浪费不到一个 slice，
    /// 所以按预算的两倍准备 slice，再加上部分读的前端 slice 余量。
    pub fn with_byte_budget(slice_size: usize, max_bytes: usize) -> Self {
        let full = max_bytes.div_ceil(slice_size);
        Self::new(slice_size, full * 2 + 2)
    }

    /// 追加数据（生产者调用）
    ///
    /// 按 slice 大小切分（最后一段可以不满），依次入队。
    /// 分配器耗尽时在 slice 边界截断，返回实际入队的字节数。
    /// 此函数是 lock-free 的，绝不阻塞
    pub fn add_data(&self, data: &[u8]) -> usize {
        let was_writing = self.writing.swap(true, Ordering::Acquire);
        debug_assert!(!was_writing, "slice queue supports a single producer");

        let mut accepted = 0;
        for chunk in data.chunks(self.allocator.block_size()) {
            let mut block = match self.allocator.alloc() {
                Ok(block) => block,
                Err(_) => break,
            };

            self.allocator.bytes_mut(&mut block)[..chunk.len()].copy_from_slice(chunk);

            let index = block.into_raw();
            self.lengths[index as usize].store(chunk.len(), Ordering::Relaxed);
            self.links[index as usize].store(NIL, Ordering::Relaxed);

            // 先计数再发布：计数可能短暂偏大，但绝不会被消费者减成负数
            self.total_bytes.fetch_add(chunk.len(), Ordering::AcqRel);

            let tail = self.tail.load(Ordering::Relaxed);
            self.links[tail as usize].store(index, Ordering::Release);
            self.tail.store(index, Ordering::Relaxed);

            accepted += chunk.len();
        }

        self.writing.store(false, Ordering::Release);
        accepted
    }

    /// 读取数据（消费者调用）
    ///
    /// 从队首拷贝最多 `output.len()` 字节，整块消费完的 slice 归还分配器。
    /// 只有队列中字节不足时才返回少于请求的字节数。
    /// 此函数是 lock-free 的，绝不阻塞
    pub fn get_data(&self, output: &mut [u8]) -> usize {
        let was_reading = self.reading.swap(true, Ordering::Acquire);
        debug_assert!(!was_reading, "slice queue supports a single consumer");

        let mut head = self.head.load(Ordering::Relaxed);
        let mut offset = self.read_offset.load(Ordering::Relaxed);
        let mut filled = 0;

        while filled < output.len() {
            let front = self.links[head as usize].load(Ordering::Acquire);
            if front == NIL {
                break;
            }

            let len = self.lengths[front as usize].load(Ordering::Relaxed);
            // front 已经由生产者发布，消费者是唯一持有者
            let bytes = unsafe { &self.allocator.raw_bytes(front)[offset..len] };
            let n = bytes.len().min(output.len() - filled);
            output[filled..filled + n].copy_from_slice(&bytes[..n]);

            filled += n;
            offset += n;

            if offset == len {
                // front 消费完，成为新的哨兵；旧哨兵归还
                let old = head;
                head = front;
                offset = 0;
                self.allocator.free(unsafe { Block::from_raw(old) });
            }
        }

        self.head.store(head, Ordering::Relaxed);
        self.read_offset.store(offset, Ordering::Relaxed);
        if filled > 0 {
            self.total_bytes.fetch_sub(filled, Ordering::AcqRel);
        }

        self.reading.store(false, Ordering::Release);
        filled
    }

    /// 当前未消费字节数
    ///
    /// 与并发的读写存在竞争，只用于阈值判断
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// 清空队列
    ///
    /// 只能在没有并发 add_data/get_data 时调用（播放已停止）
    pub fn clear(&self) {
        debug_assert!(
            !self.reading.load(Ordering::Acquire) && !self.writing.load(Ordering::Acquire),
            "slice queue cleared while in use"
        );

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let front = self.links[head as usize].load(Ordering::Acquire);
            if front == NIL {
                break;
            }
            self.allocator.free(unsafe { Block::from_raw(head) });
            head = front;
        }

        self.head.store(head, Ordering::Release);
        self.tail.store(head, Ordering::Release);
        self.read_offset.store(0, Ordering::Release);
        self.total_bytes.store(0, Ordering::Release);
    }

    /// slice 大小
    #[inline]
    pub fn slice_size(&self) -> usize {
        self.allocator.block_size()
    }

    /// 底层分配器（用于统计）
    #[inline]
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// 锁定 slice 池内存
    pub fn lock_memory(&self) -> bool {
        self.allocator.lock_memory()
    }
}
