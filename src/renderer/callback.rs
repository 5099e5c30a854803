//! 实时拉取回调
//!
//! 后端在自己的实时线程上调用 `RenderContext::render`。
//!
//! **绝对禁止：**
//! - 锁（Mutex, RwLock）
//! - 内存分配（Vec::push, Box::new）
//! - 系统调用（I/O, 日志）
//!
//! 只允许：lock-free 队列读取、原子操作、样本转换

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::audio::{ConvertError, RenderIssue, RenderStats, SampleConverter, SampleSpec, SliceQueue};
use crate::backend::{PullCallback, PullOutcome};

/// 生产者线程与实时线程共享的状态
pub struct SharedState {
    pub queue: SliceQueue,
    /// 后端当前没有被驱动
    pub paused: CachePadded<AtomicBool>,
    /// 已入队字节数（生产者写）
    pub bytes_in: CachePadded<AtomicU64>,
    /// 已送出字节数（实时线程写）
    pub bytes_out: CachePadded<AtomicU64>,
    /// 排空模式：数据不足时播放残余数据而不是整段静音
    pub runout: AtomicBool,
    /// 入队序号：生产者入队期间为奇数
    push_seq: AtomicU64,
    pub stats: RenderStats,
}

impl SharedState {
    /// `slice_size` 即块大小，`max_bytes` 是队列最多缓存的字节数
    pub fn new(slice_size: usize, max_bytes: usize) -> Self {
        Self {
            queue: SliceQueue::with_byte_budget(slice_size, max_bytes),
            paused: CachePadded::new(AtomicBool::new(true)),
            bytes_in: CachePadded::new(AtomicU64::new(0)),
            bytes_out: CachePadded::new(AtomicU64::new(0)),
            runout: AtomicBool::new(false),
            push_seq: AtomicU64::new(0),
            stats: RenderStats::new(),
        }
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 入队并累加 `bytes_in`（生产者调用）
    ///
    /// 返回实际入队的字节数。入队期间 `push_seq` 为奇数，
    /// 实时线程据此跳过这一刻的计数检查
    pub fn enqueue(&self, data: &[u8]) -> usize {
        self.push_seq.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);

        let accepted = self.queue.add_data(data);
        self.bytes_in.fetch_add(accepted as u64, Ordering::AcqRel);

        self.push_seq.fetch_add(1, Ordering::Release);
        accepted
    }

    /// 清空队列和计数（后端必须已停止）
    pub fn reset(&self) {
        self.paused.store(true, Ordering::Release);
        self.runout.store(false, Ordering::Release);
        self.bytes_in.store(0, Ordering::Release);
        self.bytes_out.store(0, Ordering::Release);
        self.queue.clear();
    }
}

/// 每帧字节数布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    /// 队列中每帧的字节数
    pub input_bytes_per_frame: usize,
    /// 后端缓冲区中每帧的字节数
    pub output_bytes_per_frame: usize,
    /// 是否经过 16-bit → 浮点转换（伪装直通）
    pub convert: bool,
}

impl FrameLayout {
    /// 原样拷贝
    pub fn passthrough(bytes_per_frame: usize) -> Self {
        Self {
            input_bytes_per_frame: bytes_per_frame,
            output_bytes_per_frame: bytes_per_frame,
            convert: false,
        }
    }
}

/// 回调上下文
///
/// 转换器的暂存区归这个上下文所有，回调之外没有任何共享的临时缓冲
pub struct RenderContext {
    shared: Arc<SharedState>,
    layout: FrameLayout,
    converter: Option<SampleConverter>,
}

impl RenderContext {
    /// `max_request_bytes` 用于预分配转换暂存区
    pub fn new(
        shared: Arc<SharedState>,
        layout: FrameLayout,
        max_request_bytes: usize,
    ) -> Result<Self, ConvertError> {
        let converter = if layout.convert {
            Some(SampleConverter::new(
                SampleSpec::I16,
                SampleSpec::F32,
                max_request_bytes,
            )?)
        } else {
            None
        };

        Ok(Self {
            shared,
            layout,
            converter,
        })
    }

    /// 包装成后端可以持有的回调
    pub fn into_callback(mut self) -> PullCallback {
        Box::new(move |frames, output| self.render(frames, output))
    }

    /// 填充一次后端缓冲区
    ///
    /// 数据不足一次请求时输出整段静音并自我暂停，
    /// 由下一次 `add_packets` 恢复
    pub fn render(&mut self, frames: u32, output: &mut [u8]) -> PullOutcome {
        let shared = Arc::clone(&self.shared);
        let queued = shared.queue.total_bytes();
        shared.stats.on_callback(queued);

        let wanted = frames as usize * self.layout.input_bytes_per_frame;
        let out_len = (frames as usize * self.layout.output_bytes_per_frame).min(output.len());
        let output = &mut output[..out_len];

        if queued < wanted {
            if shared.runout.load(Ordering::Acquire) && queued > 0 {
                let played = self.transfer(queued, output);
                self.account(played);
                return PullOutcome::Continue;
            }

            output.fill(0);
            shared.paused.store(true, Ordering::Release);
            if !shared.runout.load(Ordering::Acquire) {
                shared.stats.record(RenderIssue::Underrun);
            }
            return PullOutcome::Pause;
        }

        let played = self.transfer(wanted, output);
        self.account(played);
        PullOutcome::Continue
    }

    /// 从队列取 `bytes` 字节写入 `output`，不足部分补静音
    fn transfer(&mut self, bytes: usize, output: &mut [u8]) -> usize {
        let queue = &self.shared.queue;

        match self.converter.as_mut() {
            None => {
                let bytes = bytes.min(output.len());
                let read = queue.get_data(&mut output[..bytes]);
                output[read..].fill(0);
                read
            }
            Some(converter) => {
                // 只取 output 装得下的部分
                let bytes = bytes.min(output.len() / converter.expansion());
                let staging = converter.input_buffer(bytes);
                let read = queue.get_data(staging);
                staging[read..].fill(0);

                let written = converter.convert(output);
                output[written..].fill(0);
                read
            }
        }
    }

    /// 更新出队计数并做一致性检查（仅诊断）
    ///
    /// 生产者正在入队时跳过检查
    fn account(&self, played: usize) {
        let shared = &self.shared;
        let bytes_out = shared.bytes_out.fetch_add(played as u64, Ordering::AcqRel) + played as u64;
        shared.stats.add_bytes_played(played as u64);

        let seq = shared.push_seq.load(Ordering::Acquire);
        if seq & 1 == 1 {
            return;
        }
        let bytes_in = shared.bytes_in.load(Ordering::Acquire);
        let actual = shared.queue.total_bytes() as i64;
        fence(Ordering::Acquire);
        if shared.push_seq.load(Ordering::Relaxed) != seq {
            return;
        }

        let expected = bytes_in as i64 - bytes_out as i64;
        if expected != actual {
            shared.stats.record(RenderIssue::AccountingMismatch {
                delta: actual - expected,
            });
        }
    }
}
