//! 渲染统计模块
//!
//! 在拉取回调中收集统计信息，采用降频采样策略减少开销。
//! 回调里不能打日志，实时线程上的问题（underrun、计数不一致）
//! 只在这里计数，由生产者线程稍后读出并记录。

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// 水位采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 实时线程上的异常（只计数，不传播）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderIssue {
    /// 队列数据不足，输出静音并自动暂停
    Underrun,
    /// bytes_in - bytes_out 与队列长度不一致（仅诊断）
    AccountingMismatch { delta: i64 },
}

/// 渲染统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct RenderStats {
    callback_count: AtomicU64,

    // 队列水位（降频采样，单位：字节）
    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    mismatch_count: AtomicU64,
    last_mismatch_delta: AtomicI64,

    bytes_played: AtomicU64,
}

impl RenderStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            mismatch_count: AtomicU64::new(0),
            last_mismatch_delta: AtomicI64::new(0),
            bytes_played: AtomicU64::new(0),
        }
    }

    /// 在拉取回调开头调用
    ///
    /// 只在采样点才记录水位
    #[inline]
    pub fn on_callback(&self, queued_bytes: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            self.water_level_buffer[idx].store(queued_bytes, Ordering::Relaxed);
        }
    }

    /// 记录实时线程上的异常
    #[inline]
    pub fn record(&self, issue: RenderIssue) {
        match issue {
            RenderIssue::Underrun => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
            }
            RenderIssue::AccountingMismatch { delta } => {
                self.last_mismatch_delta.store(delta, Ordering::Relaxed);
                self.mismatch_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 累加已送出的字节数
    #[inline]
    pub fn add_bytes_played(&self, bytes: u64) {
        self.bytes_played.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mismatch_count(&self) -> u64 {
        self.mismatch_count.load(Ordering::Relaxed)
    }

    /// 最近一次计数不一致的差值
    #[inline]
    pub fn last_mismatch_delta(&self) -> i64 {
        self.last_mismatch_delta.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_played(&self) -> u64 {
        self.bytes_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `allocator_failures` 来自 slice 池
    pub fn report(&self, allocator_failures: u64) -> StatsReport {
        let water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .map(|level| level.load(Ordering::Relaxed))
            .filter(|&level| level > 0)
            .collect();

        let water_stats = WaterLevelStats {
            min: water_levels.iter().copied().min().unwrap_or(0),
            max: water_levels.iter().copied().max().unwrap_or(0),
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            water_stats,
            underrun_count: self.underrun_count(),
            mismatch_count: self.mismatch_count(),
            allocator_failures,
            bytes_played: self.bytes_played(),
        }
    }
}

impl Default for RenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub mismatch_count: u64,
    pub allocator_failures: u64,
    pub bytes_played: u64,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Render Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(
            f,
            "Water level sample interval: every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(f, "Slice Queue Water Level:")?;
        writeln!(f, "  Min: {} bytes", self.water_stats.min)?;
        writeln!(f, "  Max: {} bytes", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Accounting mismatches: {}", self.mismatch_count)?;
        writeln!(f, "Allocator failures: {}", self.allocator_failures)?;
        writeln!(f, "Bytes played: {}", self.bytes_played)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RenderStats::new();
        stats.on_callback(100);
        stats.record(RenderIssue::Underrun);
        stats.record(RenderIssue::AccountingMismatch { delta: -12 });
        stats.add_bytes_played(4096);

        assert_eq!(stats.callback_count(), 1);
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.mismatch_count(), 1);
        assert_eq!(stats.last_mismatch_delta(), -12);
        assert_eq!(stats.bytes_played(), 4096);
    }

    #[test]
    fn test_water_level_sampling() {
        let stats = RenderStats::new();
        // 第 0、16、32 次回调被采样
        for i in 0..40usize {
            stats.on_callback(1000 + i);
        }
        let report = stats.report(0);
        assert_eq!(report.callback_count, 40);
        assert_eq!(report.water_stats.min, 1000);
        assert_eq!(report.water_stats.max, 1032);
    }

    #[test]
    fn test_report_display() {
        let stats = RenderStats::new();
        stats.record(RenderIssue::Underrun);
        let text = stats.report(3).to_string();
        assert!(text.contains("Underruns: 1"));
        assert!(text.contains("Allocator failures: 3"));
    }
}
