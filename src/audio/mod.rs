//! 音频核心模块
//!
//! 包含：
//! - Block Allocator: Lock-free 定长内存块池
//! - Slice Queue: 跨线程的 lock-free 字节流 FIFO
//! - Convert: 伪装直通通路的样本转换
//! - Format: 流格式与物理格式描述
//! - Stats: 渲染统计

pub mod block_alloc;
pub mod convert;
pub mod format;
pub mod slice_queue;
pub mod stats;

pub use block_alloc::{AllocError, Block, BlockAllocator};
pub use convert::{ConvertError, SampleConverter, SampleSpec};
pub use format::{AudioFormat, Codec, PassthroughMode, PhysicalFormat, SampleEncoding, StreamRequest};
pub use slice_queue::SliceQueue;
pub use stats::{RenderIssue, RenderStats, StatsReport};
