//! 渲染器
//!
//! 生产者（播放引擎）通过 `add_packets` 推入已经格式化好的字节，
//! 后端的实时线程通过拉取回调取走。两者之间只有 lock-free 的 slice 队列
//! 和几个原子量，控制操作（`pause` / `resume` / `stop`）只在生产者线程调用。
//!
//! 状态：
//!
//! ```text
//! Uninitialized → (initialize) → Paused ⇄ Playing → (stop) → Paused(空) → (deinitialize) → Uninitialized
//! ```
//!
//! 自动转换只有两个：`add_packets` 成功后 Paused → Playing，
//! 回调数据不足时 Playing → Paused。

pub mod callback;
pub mod negotiate;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{AudioFormat, PassthroughMode, StatsReport, StreamRequest};
use crate::backend::{BackendKind, DeviceInfo, HardwareBackend};
use crate::error::RenderError;

use callback::{RenderContext, SharedState};
pub use negotiate::{Negotiation, NegotiationState};

/// 最小音量（毫贝）
pub const MIN_VOLUME_MB: i32 = -6000;

/// 最大音量（毫贝）
pub const MAX_VOLUME_MB: i32 = 0;

/// 排空时的轮询间隔
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 毫贝转线性增益
#[inline]
pub fn millibels_to_gain(mb: i32) -> f32 {
    10f32.powf(mb as f32 / 2000.0)
}

/// 渲染器配置
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// 输出设备（名称或 ID，`None` 为默认设备）
    pub device: Option<String>,
    /// 原生直通时取得 hog 独占
    pub exclusive_mode: bool,
    /// 允许伪装直通回退
    pub allow_spoofing: bool,
    /// 锁定 slice 池内存
    pub lock_memory: bool,
    /// `wait_completion` 在预计延迟之外多等的时间
    pub drain_timeout_slack: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            device: None,
            exclusive_mode: true,
            allow_spoofing: true,
            lock_memory: false,
            drain_timeout_slack: Duration::from_millis(500),
        }
    }
}

/// 协商完成后的会话（每次 `initialize` 固定）
struct Session {
    shared: Arc<SharedState>,
    negotiation: Negotiation,
    chunk_bytes: usize,
    max_cache_bytes: usize,
    /// 一次回调消耗的队列字节数
    callback_bytes: usize,
}

/// 渲染器
pub struct Renderer {
    backend: Box<dyn HardwareBackend>,
    config: RendererConfig,
    session: Option<Session>,

    volume_mb: i32,
    muted: bool,

    // 已经记录过日志的实时线程问题
    reported_underruns: u64,
    reported_mismatches: u64,
}

impl Renderer {
    pub fn new(backend: Box<dyn HardwareBackend>, config: RendererConfig) -> Self {
        Self {
            backend,
            config,
            session: None,
            volume_mb: MAX_VOLUME_MB,
            muted: false,
            reported_underruns: 0,
            reported_mismatches: 0,
        }
    }

    /// 协商格式并进入 Paused 状态
    ///
    /// 已经初始化时先反初始化
    pub fn initialize(&mut self, request: StreamRequest) -> Result<(), RenderError> {
        if self.session.is_some() {
            self.deinitialize();
        }

        let input = request.input_format();
        if !input.is_valid() {
            return Err(RenderError::FormatUnsupported(input.to_string()));
        }

        log::info!("Initializing renderer: {:?}", request);

        let mut shared_slot = None;
        let result = negotiate::negotiate(
            self.backend.as_mut(),
            &request,
            &self.config,
            |negotiation| {
                if negotiation.chunk_bytes == 0 || negotiation.max_cache_bytes() == 0 {
                    return Err(RenderError::FormatUnsupported(format!(
                        "{:?} negotiated a zero-sized frame",
                        negotiation.mode
                    )));
                }
                let shared = Arc::new(SharedState::new(
                    negotiation.chunk_bytes,
                    negotiation.max_cache_bytes(),
                ));
                let context = RenderContext::new(
                    Arc::clone(&shared),
                    negotiation.layout,
                    negotiation.chunk_bytes,
                )?;
                shared_slot = Some(shared);
                Ok(context.into_callback())
            },
        );

        let negotiation = match result {
            Ok(negotiation) => negotiation,
            Err(e) => {
                self.backend.close();
                return Err(e);
            }
        };
        let Some(shared) = shared_slot else {
            self.backend.close();
            return Err(RenderError::InvalidState("pull callback was never built"));
        };

        if self.config.lock_memory && !shared.queue.lock_memory() {
            log::warn!("Failed to lock slice pool memory");
        }

        let chunk_bytes = negotiation.chunk_bytes;
        let max_cache_bytes = negotiation.max_cache_bytes();
        let callback_bytes =
            negotiation.callback_frames as usize * negotiation.layout.input_bytes_per_frame;
        log::info!(
            "Renderer ready: mode={:?}, chunk={} bytes, cache={} bytes",
            negotiation.mode,
            chunk_bytes,
            max_cache_bytes
        );

        self.reported_underruns = 0;
        self.reported_mismatches = 0;
        self.session = Some(Session {
            shared,
            negotiation,
            chunk_bytes,
            max_cache_bytes,
            callback_bytes,
        });

        if let Err(e) = self.apply_volume() {
            log::warn!("Failed to apply volume: {}", e);
        }
        Ok(())
    }

    /// 停止并释放后端资源；未初始化时什么也不做
    pub fn deinitialize(&mut self) {
        if self.session.is_none() {
            return;
        }

        if let Err(e) = self.stop() {
            log::warn!("Failed to stop backend: {}", e);
        }
        // close 返回后回调不会再被调用，之后才能释放共享状态
        self.backend.close();

        if let Some(report) = self.stats() {
            log::debug!("{}", report);
        }
        self.session = None;
        log::info!("Renderer deinitialized");
    }

    /// 暂停后端数据流（幂等）
    pub fn pause(&mut self) -> Result<(), RenderError> {
        let Some(session) = &self.session else {
            return Ok(());
        };

        if session
            .shared
            .paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.backend.stop()?;
            log::debug!("Renderer paused");
        }
        Ok(())
    }

    /// 恢复后端数据流（幂等）
    pub fn resume(&mut self) -> Result<(), RenderError> {
        let Some(session) = &self.session else {
            return Err(RenderError::InvalidState("renderer is not initialized"));
        };
        let shared = Arc::clone(&session.shared);

        if shared
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.backend.start() {
                shared.paused.store(true, Ordering::Release);
                return Err(e.into());
            }
            log::debug!("Renderer resumed");
        }

        self.report_realtime_issues();
        Ok(())
    }

    /// 无条件停止：后端停止，清空队列和计数
    pub fn stop(&mut self) -> Result<(), RenderError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let shared = Arc::clone(&session.shared);

        let result = self.backend.stop();
        shared.reset();
        self.report_realtime_issues();
        log::debug!("Renderer stopped");

        result.map_err(RenderError::from)
    }

    /// 推入数据，返回接受的字节数
    ///
    /// 全部接受或全部拒绝：
    /// 少于一个 chunk、缓存已满或剩余空间不够时返回 0
    pub fn add_packets(&mut self, data: &[u8]) -> usize {
        let Some(session) = &self.session else {
            return 0;
        };
        let shared = Arc::clone(&session.shared);

        if data.len() < session.chunk_bytes {
            return 0;
        }

        let queued = shared.queue.total_bytes();
        if queued >= session.max_cache_bytes || data.len() > session.max_cache_bytes - queued {
            // 回调可能在上一次入队的同时因数据不足暂停，
            // 缓存满着却没人拉取时在这里重新启动
            if shared.is_paused() && queued >= session.callback_bytes {
                if let Err(e) = self.resume() {
                    log::warn!("Failed to resume with full cache: {}", e);
                }
            }
            return 0;
        }

        shared.runout.store(false, Ordering::Release);
        let accepted = shared.enqueue(data);
        if accepted < data.len() {
            log::warn!(
                "Slice pool exhausted: accepted {} of {} bytes",
                accepted,
                data.len()
            );
        }

        if accepted > 0 {
            if let Err(e) = self.resume() {
                log::warn!("Failed to resume after add_packets: {}", e);
            }
        }
        accepted
    }

    /// 队列剩余空间（字节，估计值）
    pub fn space(&self) -> usize {
        match &self.session {
            Some(session) => session
                .max_cache_bytes
                .saturating_sub(session.shared.queue.total_bytes()),
            None => 0,
        }
    }

    /// 已缓存数据的播放时长（秒，估计值）
    pub fn delay(&self) -> f64 {
        match &self.session {
            Some(session) if session.negotiation.bytes_per_second > 0 => {
                session.shared.queue.total_bytes() as f64
                    / session.negotiation.bytes_per_second as f64
            }
            _ => 0.0,
        }
    }

    /// `add_packets` 接受的最小字节数
    pub fn chunk_len(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.chunk_bytes)
    }

    pub fn minimum_volume(&self) -> i32 {
        MIN_VOLUME_MB
    }

    pub fn maximum_volume(&self) -> i32 {
        MAX_VOLUME_MB
    }

    /// 当前音量（毫贝，静音时仍返回静音前的音量）
    pub fn current_volume(&self) -> i32 {
        self.volume_mb
    }

    /// 设置音量（毫贝）
    ///
    /// 直通模式下只记录不下发，码流不能被缩放
    pub fn set_current_volume(&mut self, mb: i32) -> Result<(), RenderError> {
        self.volume_mb = mb.clamp(MIN_VOLUME_MB, MAX_VOLUME_MB);
        if self.muted {
            return Ok(());
        }
        self.apply_volume()
    }

    /// 静音 / 取消静音
    pub fn mute(&mut self, mute: bool) -> Result<(), RenderError> {
        self.muted = mute;
        self.apply_volume()
    }

    fn apply_volume(&mut self) -> Result<(), RenderError> {
        if self.passthrough_mode().is_encoded() || self.session.is_none() {
            return Ok(());
        }

        let gain = if self.muted {
            0.0
        } else {
            millibels_to_gain(self.volume_mb)
        };
        self.backend.set_volume(gain)?;
        Ok(())
    }

    /// 排空队列后停止
    ///
    /// 最多等待 `delay()` 加上配置的余量，超时后强制停止
    pub fn wait_completion(&mut self) -> Result<(), RenderError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let shared = Arc::clone(&session.shared);

        if shared.queue.total_bytes() > 0 {
            shared.runout.store(true, Ordering::Release);
            self.resume()?;

            let timeout = Duration::from_secs_f64(self.delay()) + self.config.drain_timeout_slack;
            let deadline = Instant::now() + timeout;
            while shared.queue.total_bytes() > 0 && Instant::now() < deadline {
                thread::sleep(DRAIN_POLL_INTERVAL);
            }

            let left = shared.queue.total_bytes();
            if left > 0 {
                log::warn!("Drain timed out after {:?} with {} bytes queued", timeout, left);
            }
        }

        self.stop()
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// 后端当前是否没有被驱动（未初始化时为 true）
    pub fn is_paused(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |s| s.shared.is_paused())
    }

    pub fn passthrough_mode(&self) -> PassthroughMode {
        self.session
            .as_ref()
            .map_or(PassthroughMode::None, |s| s.negotiation.mode)
    }

    /// 声明给设备的格式
    pub fn device_format(&self) -> Option<AudioFormat> {
        self.session.as_ref().map(|s| s.negotiation.device_format)
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.session.as_ref().map(|s| &s.negotiation.device)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// 统计报告
    pub fn stats(&self) -> Option<StatsReport> {
        self.session.as_ref().map(|s| {
            s.shared
                .stats
                .report(s.shared.queue.allocator().failures())
        })
    }

    /// 已入队 / 已送出字节数
    pub fn byte_counters(&self) -> (u64, u64) {
        self.session.as_ref().map_or((0, 0), |s| {
            (
                s.shared.bytes_in.load(Ordering::Acquire),
                s.shared.bytes_out.load(Ordering::Acquire),
            )
        })
    }

    /// 把实时线程上累计的问题写到日志
    fn report_realtime_issues(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let stats = &session.shared.stats;

        let underruns = stats.underrun_count();
        if underruns > self.reported_underruns {
            log::warn!(
                "Buffer underrun: {} new (total {})",
                underruns - self.reported_underruns,
                underruns
            );
            self.reported_underruns = underruns;
        }

        let mismatches = stats.mismatch_count();
        if mismatches > self.reported_mismatches {
            log::debug!(
                "Byte accounting mismatch: {} new, last delta {}",
                mismatches - self.reported_mismatches,
                stats.last_mismatch_delta()
            );
            self.reported_mismatches = mismatches;
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{Codec, PhysicalFormat};
    use crate::backend::{NullBackend, NullDevice, NullDeviceConfig, OutputPath};

    const PCM_48K: StreamRequest = StreamRequest::Pcm {
        channels: 2,
        sample_rate: 48000,
        bits_per_sample: 16,
    };

    const AC3_48K: StreamRequest = StreamRequest::Passthrough {
        codec: Codec::Ac3,
        channels: 2,
        sample_rate: 48000,
    };

    fn ac3_stream() -> PhysicalFormat {
        PhysicalFormat {
            codec: Codec::Ac3,
            sample_rate: 48000,
            bits_per_channel: 16,
            channels: 2,
            bytes_per_packet: 6144,
            frames_per_packet: 1536,
        }
    }

    fn renderer_with(device: NullDeviceConfig, config: RendererConfig) -> (Renderer, NullDevice) {
        let backend = NullBackend::new(device);
        let handle = backend.device();
        (Renderer::new(Box::new(backend), config), handle)
    }

    fn renderer() -> (Renderer, NullDevice) {
        renderer_with(NullDeviceConfig::default(), RendererConfig::default())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_pcm_initialize() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        assert!(renderer.is_initialized());
        assert!(renderer.is_paused());
        assert_eq!(renderer.passthrough_mode(), PassthroughMode::None);
        assert_eq!(renderer.chunk_len(), 512 * 4);
        assert_eq!(renderer.space(), 192_000);
        assert_eq!(device.pcm_format(), Some(AudioFormat::new(48000, 2, 16)));
        assert_eq!(device.output_path(), Some(OutputPath::Generic));
        assert_eq!(device.start_calls(), 0);
    }

    #[test]
    fn test_short_packet_rejected() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        let chunk = renderer.chunk_len();
        assert_eq!(renderer.add_packets(&pattern(chunk - 1)), 0);
        assert_eq!(renderer.space(), 192_000);
        assert!(renderer.is_paused());
        assert_eq!(renderer.byte_counters(), (0, 0));
        assert_eq!(device.start_calls(), 0);
    }

    #[test]
    fn test_add_packets_resumes_and_pull_returns_data() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        let data = pattern(renderer.chunk_len());
        assert_eq!(renderer.add_packets(&data), data.len());
        assert!(!renderer.is_paused());
        assert_eq!(device.start_calls(), 1);

        let out = device.pull(256).unwrap();
        assert_eq!(out, data[..1024]);
        assert!(!renderer.is_paused());
        assert_eq!(renderer.byte_counters(), (2048, 1024));
    }

    #[test]
    fn test_underrun_self_pauses() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        renderer.add_packets(&pattern(renderer.chunk_len()));
        let out = device.pull(1024).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert!(renderer.is_paused());
        assert!(!device.is_running());
        assert_eq!(renderer.stats().unwrap().underrun_count, 1);

        // 自我暂停不经过 backend.stop()
        assert_eq!(device.stop_calls(), 0);

        // 新数据到来后自动恢复
        renderer.add_packets(&pattern(renderer.chunk_len()));
        assert!(!renderer.is_paused());
        assert_eq!(device.start_calls(), 2);
        assert!(device.pull(1024).unwrap().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_stop_clears_state() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        let chunk = renderer.chunk_len();
        renderer.add_packets(&pattern(chunk * 3));
        device.pull(128).unwrap();
        renderer.stop().unwrap();

        assert!(renderer.is_paused());
        assert_eq!(renderer.space(), 192_000);
        assert_eq!(renderer.byte_counters(), (0, 0));
        assert!(device.pull(128).is_none());

        assert_eq!(renderer.add_packets(&pattern(chunk)), chunk);
        assert!(!renderer.is_paused());
    }

    #[test]
    fn test_pause_resume_idempotent() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();
        renderer.add_packets(&pattern(renderer.chunk_len() * 2));
        let space = renderer.space();

        renderer.pause().unwrap();
        renderer.pause().unwrap();
        assert_eq!(device.stop_calls(), 1);

        renderer.resume().unwrap();
        renderer.resume().unwrap();
        assert_eq!(device.start_calls(), 2);

        assert_eq!(renderer.space(), space);
    }

    #[test]
    fn test_cache_limit_all_or_nothing() {
        let (mut renderer, _device) = renderer();
        renderer.initialize(PCM_48K).unwrap();

        // 一秒 = 192000 字节
        assert_eq!(renderer.add_packets(&pattern(190_000)), 190_000);
        assert_eq!(renderer.space(), 2_000);

        // 2048 > 2000：整包拒绝
        assert_eq!(renderer.add_packets(&pattern(2048)), 0);
        assert_eq!(renderer.space(), 2_000);

        // 塞满后拒绝一切
        let (mut renderer, _device) = self::renderer();
        renderer.initialize(PCM_48K).unwrap();
        assert_eq!(renderer.add_packets(&pattern(192_000)), 192_000);
        assert_eq!(renderer.space(), 0);
        assert_eq!(renderer.add_packets(&pattern(2048)), 0);
    }

    #[test]
    fn test_full_cache_restarts_stalled_output() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();
        assert_eq!(renderer.add_packets(&pattern(192_000)), 192_000);
        assert_eq!(device.start_calls(), 1);

        // 回调在最后一次入队的同时判定数据不足并暂停
        let shared = Arc::clone(&renderer.session.as_ref().unwrap().shared);
        shared.paused.store(true, Ordering::Release);

        // 缓存已满：拒绝入队，但重新启动后端
        assert_eq!(renderer.add_packets(&pattern(2048)), 0);
        assert!(!renderer.is_paused());
        assert_eq!(device.start_calls(), 2);
        assert_eq!(device.pull(512).unwrap(), pattern(192_000)[..2048]);

        // 短包不触发重启
        renderer.pause().unwrap();
        assert_eq!(renderer.add_packets(&pattern(16)), 0);
        assert_eq!(device.start_calls(), 2);
    }

    #[test]
    fn test_zero_sized_physical_format_falls_back() {
        let vbr_ac3 = PhysicalFormat {
            bytes_per_packet: 0,
            ..ac3_stream()
        };
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                physical_formats: vec![vbr_ac3],
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(AC3_48K).unwrap();
        assert_eq!(renderer.passthrough_mode(), PassthroughMode::SpoofedEncoded);
        assert!(!device.is_exclusive());
        assert_eq!(renderer.chunk_len(), 4096);

        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                physical_formats: vec![vbr_ac3],
                ..NullDeviceConfig::default()
            },
            RendererConfig {
                allow_spoofing: false,
                ..RendererConfig::default()
            },
        );
        assert!(matches!(
            renderer.initialize(AC3_48K),
            Err(RenderError::FormatUnsupported(_))
        ));
        assert!(!renderer.is_initialized());
        assert!(!device.has_callback());
    }

    #[test]
    fn test_delay() {
        let (mut renderer, _device) = renderer();
        renderer.initialize(PCM_48K).unwrap();
        renderer.add_packets(&pattern(19_200));
        assert!((renderer.delay() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_spoofed_passthrough_scenario() {
        let (mut renderer, device) = renderer();
        renderer.initialize(AC3_48K).unwrap();

        assert_eq!(renderer.passthrough_mode(), PassthroughMode::SpoofedEncoded);
        assert_eq!(renderer.device_format(), Some(AudioFormat::float32(48000, 2)));
        // 512 帧 × 8 字节（浮点立体声）
        let chunk = renderer.chunk_len();
        assert_eq!(chunk, 4096);

        let samples: Vec<i16> = (0..chunk / 2)
            .map(|i| (i as i32 * 61 - 32768).clamp(-32768, 32767) as i16)
            .collect();
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        assert_eq!(renderer.add_packets(&data), chunk);

        // 一个 chunk 的 16-bit 数据够两次 512 帧的回调
        let mut floats = Vec::new();
        for _ in 0..2 {
            let out = device.pull(512).unwrap();
            assert_eq!(out.len(), 512 * 8);
            floats.extend(
                out.chunks_exact(4)
                    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        assert!(!renderer.is_paused());
        assert_eq!(floats.len(), samples.len());
        for (f, s) in floats.iter().zip(&samples) {
            assert_eq!(*f, *s as f32 / 32768.0);
        }

        // 数据用完后下一次回调静音并暂停
        assert!(device.pull(512).unwrap().iter().all(|&b| b == 0));
        assert!(renderer.is_paused());
    }

    #[test]
    fn test_native_passthrough() {
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                physical_formats: vec![ac3_stream()],
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(AC3_48K).unwrap();

        assert_eq!(renderer.passthrough_mode(), PassthroughMode::NativeEncoded);
        assert_eq!(device.physical_format(), Some(ac3_stream()));
        assert_eq!(device.output_path(), Some(OutputPath::Physical));
        assert!(device.is_exclusive());
        assert_eq!(renderer.chunk_len(), 512 * 4);

        let data = pattern(renderer.chunk_len());
        renderer.add_packets(&data);
        assert_eq!(device.pull(512).unwrap(), data);

        renderer.deinitialize();
        assert!(!device.is_exclusive());
        assert_eq!(device.physical_format(), None);
    }

    #[test]
    fn test_native_auto_exclusive_skips_hog() {
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                physical_formats: vec![ac3_stream()],
                auto_exclusive: true,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(AC3_48K).unwrap();
        assert_eq!(renderer.passthrough_mode(), PassthroughMode::NativeEncoded);
        assert!(!device.is_exclusive());
    }

    #[test]
    fn test_native_lock_failure_falls_back_to_spoof() {
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                physical_formats: vec![ac3_stream()],
                reject_physical: true,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(AC3_48K).unwrap();
        assert_eq!(renderer.passthrough_mode(), PassthroughMode::SpoofedEncoded);
        assert!(!device.is_exclusive());
    }

    #[test]
    fn test_initialize_failures() {
        let (mut renderer, _) = renderer_with(
            NullDeviceConfig::default(),
            RendererConfig {
                allow_spoofing: false,
                ..RendererConfig::default()
            },
        );
        assert!(matches!(
            renderer.initialize(AC3_48K),
            Err(RenderError::FormatUnsupported(_))
        ));
        assert!(!renderer.is_initialized());
        assert_eq!(renderer.add_packets(&pattern(8192)), 0);

        let (mut renderer, _) = renderer_with(
            NullDeviceConfig {
                available: false,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        assert!(matches!(
            renderer.initialize(PCM_48K),
            Err(RenderError::DeviceUnavailable(_))
        ));

        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                reject_pcm: true,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        assert!(matches!(
            renderer.initialize(PCM_48K),
            Err(RenderError::FormatUnsupported(_))
        ));
        assert!(!device.has_callback());

        let (mut renderer, _) = self::renderer();
        let bad = StreamRequest::Pcm {
            channels: 0,
            sample_rate: 48000,
            bits_per_sample: 16,
        };
        assert!(renderer.initialize(bad).is_err());
    }

    #[test]
    fn test_reinitialize_and_deinitialize() {
        let (mut renderer, device) = renderer();
        renderer.initialize(PCM_48K).unwrap();
        renderer.add_packets(&pattern(renderer.chunk_len()));

        renderer.initialize(AC3_48K).unwrap();
        assert_eq!(renderer.passthrough_mode(), PassthroughMode::SpoofedEncoded);
        assert_eq!(renderer.space(), 192_000);

        renderer.deinitialize();
        renderer.deinitialize();
        assert!(!renderer.is_initialized());
        assert_eq!(renderer.chunk_len(), 0);
        assert_eq!(renderer.space(), 0);
        assert!(!device.has_callback());
        assert!(matches!(
            renderer.resume(),
            Err(RenderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_volume() {
        let (mut renderer, device) = renderer();
        assert_eq!(renderer.minimum_volume(), -6000);
        assert_eq!(renderer.maximum_volume(), 0);

        // 初始化前设置，初始化时下发
        renderer.set_current_volume(-2000).unwrap();
        renderer.initialize(PCM_48K).unwrap();
        assert!((device.volume() - 0.1).abs() < 1e-6);

        renderer.set_current_volume(-9000).unwrap();
        assert_eq!(renderer.current_volume(), MIN_VOLUME_MB);
        assert!((device.volume() - 0.001).abs() < 1e-6);

        renderer.set_current_volume(-2000).unwrap();
        renderer.mute(true).unwrap();
        assert_eq!(device.volume(), 0.0);
        assert_eq!(renderer.current_volume(), -2000);

        // 静音期间调整音量不下发
        renderer.set_current_volume(0).unwrap();
        assert_eq!(device.volume(), 0.0);

        renderer.mute(false).unwrap();
        assert!((device.volume() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_volume_ignored_in_passthrough() {
        let (mut renderer, device) = renderer();
        renderer.initialize(AC3_48K).unwrap();
        renderer.set_current_volume(-3000).unwrap();
        renderer.mute(true).unwrap();
        assert_eq!(device.volume(), 1.0);
        assert_eq!(renderer.current_volume(), -3000);
    }

    #[test]
    fn test_wait_completion_drains() {
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig {
                realtime_clock: true,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(PCM_48K).unwrap();

        // 2.5 个 chunk：最后半个 chunk 靠排空模式播出
        let data = pattern(renderer.chunk_len() * 5 / 2);
        assert_eq!(renderer.add_packets(&data), data.len());
        renderer.wait_completion().unwrap();

        assert!(renderer.is_paused());
        assert_eq!(renderer.space(), 192_000);
        assert_eq!(renderer.stats().unwrap().bytes_played, data.len() as u64);
        assert!(device.stop_calls() >= 1);
    }

    #[test]
    fn test_wait_completion_times_out() {
        let (mut renderer, device) = renderer_with(
            NullDeviceConfig::default(),
            RendererConfig {
                drain_timeout_slack: Duration::from_millis(10),
                ..RendererConfig::default()
            },
        );
        renderer.initialize(PCM_48K).unwrap();
        renderer.add_packets(&pattern(renderer.chunk_len()));

        // 没有时钟驱动回调：超时后强制停止
        let started = Instant::now();
        renderer.wait_completion().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(renderer.space(), 192_000);
        assert!(!device.is_running());
    }

    #[test]
    fn test_concurrent_producer_and_clock() {
        let (mut renderer, _device) = renderer_with(
            NullDeviceConfig {
                realtime_clock: true,
                preferred_frames: 256,
                ..NullDeviceConfig::default()
            },
            RendererConfig::default(),
        );
        renderer.initialize(PCM_48K).unwrap();

        let chunk = renderer.chunk_len();
        let mut pushed = 0;
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            if renderer.add_packets(&pattern(chunk)) > 0 {
                pushed += chunk;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(pushed > 0);

        let (bytes_in, bytes_out) = renderer.byte_counters();
        assert_eq!(bytes_in, pushed as u64);
        assert!(bytes_out <= bytes_in);
        assert_eq!(renderer.stats().unwrap().mismatch_count, 0);
        renderer.stop().unwrap();
        assert_eq!(renderer.byte_counters(), (0, 0));
    }
}
