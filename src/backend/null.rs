//! 空输出后端
//!
//! 不接任何硬件，行为与真实后端的约定一致：
//! - 回调在内部锁下执行，所以 `stop()` 返回时不会有回调在途
//! - 可选实时时钟线程，按设备采样率周期性拉取并丢弃数据
//! - `NullDevice` 句柄可以手动驱动回调、注入协商失败、检查启停次数

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    BackendError, BackendKind, DeviceInfo, HardwareBackend, OutputPath, PullCallback, PullOutcome,
};
use crate::audio::{AudioFormat, Codec, PhysicalFormat};

/// 空设备配置
#[derive(Clone, Debug)]
pub struct NullDeviceConfig {
    pub name: String,
    /// 设备是否存在
    pub available: bool,
    pub physical_formats: Vec<PhysicalFormat>,
    pub preferred_frames: u32,
    pub auto_exclusive: bool,
    /// 拒绝所有 PCM 配置
    pub reject_pcm: bool,
    /// 拒绝所有物理格式配置
    pub reject_physical: bool,
    /// 是否启动实时时钟线程
    pub realtime_clock: bool,
}

impl Default for NullDeviceConfig {
    fn default() -> Self {
        Self {
            name: "Null Output".to_string(),
            available: true,
            physical_formats: vec![PhysicalFormat {
                codec: Codec::Pcm,
                sample_rate: 48000,
                bits_per_channel: 16,
                channels: 2,
                bytes_per_packet: 4,
                frames_per_packet: 1,
            }],
            preferred_frames: 512,
            auto_exclusive: false,
            reject_pcm: false,
            reject_physical: false,
            realtime_clock: false,
        }
    }
}

#[derive(Default)]
struct NullState {
    open: bool,
    callback: Option<PullCallback>,
    path: Option<OutputPath>,
    running: bool,
    pcm_format: Option<AudioFormat>,
    physical_format: Option<PhysicalFormat>,
    exclusive: bool,
    volume: f32,
    start_calls: u32,
    stop_calls: u32,
}

impl NullState {
    /// 当前输出格式下每帧字节数
    fn bytes_per_frame(&self) -> usize {
        match (self.path, self.physical_format, self.pcm_format) {
            (Some(OutputPath::Physical), Some(physical), _) => physical.bytes_per_frame(),
            (_, _, Some(pcm)) => pcm.bytes_per_frame(),
            _ => 0,
        }
    }

    fn sample_rate(&self) -> u32 {
        match (self.path, self.physical_format, self.pcm_format) {
            (Some(OutputPath::Physical), Some(physical), _) => physical.sample_rate,
            (_, _, Some(pcm)) => pcm.sample_rate,
            _ => 48000,
        }
    }

    /// 执行一次回调；未运行时返回 false
    fn pull(&mut self, frames: u32, output: &mut [u8]) -> bool {
        if !self.running {
            return false;
        }
        let Some(callback) = self.callback.as_mut() else {
            return false;
        };

        if callback(frames, output) == PullOutcome::Pause {
            self.running = false;
        }
        true
    }
}

struct NullShared {
    config: NullDeviceConfig,
    state: Mutex<NullState>,
    clock_running: AtomicBool,
}

impl NullShared {
    fn lock(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 空输出后端
pub struct NullBackend {
    shared: Arc<NullShared>,
    clock: Option<JoinHandle<()>>,
}

impl NullBackend {
    pub fn new(config: NullDeviceConfig) -> Self {
        let state = NullState {
            volume: 1.0,
            ..NullState::default()
        };

        Self {
            shared: Arc::new(NullShared {
                config,
                state: Mutex::new(state),
                clock_running: AtomicBool::new(false),
            }),
            clock: None,
        }
    }

    /// 设备句柄（手动驱动与检查）
    pub fn device(&self) -> NullDevice {
        NullDevice {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 启动实时时钟线程
    fn spawn_clock(&mut self) {
        if self.clock.is_some() || !self.shared.config.realtime_clock {
            return;
        }

        self.shared.clock_running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let frames = self.shared.config.preferred_frames.max(1);

        let handle = thread::Builder::new()
            .name("null-audio-clock".to_string())
            .spawn(move || {
                let mut buffer = Vec::new();
                while shared.clock_running.load(Ordering::Acquire) {
                    let rate = {
                        let mut state = shared.lock();
                        let needed = frames as usize * state.bytes_per_frame();
                        if buffer.len() < needed {
                            buffer.resize(needed, 0);
                        }
                        state.pull(frames, &mut buffer[..needed]);
                        state.sample_rate()
                    };
                    let period_us = frames as u64 * 1_000_000 / rate.max(1) as u64;
                    thread::sleep(Duration::from_micros(period_us));
                }
            });

        match handle {
            Ok(handle) => self.clock = Some(handle),
            Err(e) => log::warn!("Failed to spawn null clock thread: {}", e),
        }
    }

    fn join_clock(&mut self) {
        self.shared.clock_running.store(false, Ordering::Release);
        if let Some(handle) = self.clock.take() {
            let _ = handle.join();
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new(NullDeviceConfig::default())
    }
}

impl HardwareBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn open(&mut self, device: Option<&str>) -> Result<DeviceInfo, BackendError> {
        let config = &self.shared.config;
        if !config.available {
            return Err(BackendError::DeviceUnavailable(
                device.unwrap_or("default").to_string(),
            ));
        }
        if let Some(name) = device {
            if !config.name.to_lowercase().contains(&name.to_lowercase()) {
                return Err(BackendError::DeviceUnavailable(name.to_string()));
            }
        }

        self.shared.lock().open = true;
        log::debug!("Null output opened: {}", config.name);

        Ok(DeviceInfo {
            id: 0,
            name: config.name.clone(),
            physical_formats: config.physical_formats.clone(),
            preferred_frames: config.preferred_frames,
            auto_exclusive: config.auto_exclusive,
        })
    }

    fn probe_physical_formats(&mut self) -> Result<Vec<PhysicalFormat>, BackendError> {
        if !self.shared.lock().open {
            return Err(BackendError::NotOpen);
        }
        Ok(self.shared.config.physical_formats.clone())
    }

    fn configure_pcm(&mut self, format: &AudioFormat) -> Result<(), BackendError> {
        if self.shared.config.reject_pcm {
            return Err(BackendError::FormatRejected(format.to_string()));
        }
        let mut state = self.shared.lock();
        if !state.open {
            return Err(BackendError::NotOpen);
        }
        state.pcm_format = Some(*format);
        Ok(())
    }

    fn configure_physical_format(&mut self, format: &PhysicalFormat) -> Result<(), BackendError> {
        let config = &self.shared.config;
        if config.reject_physical || !config.physical_formats.contains(format) {
            return Err(BackendError::FormatRejected(format.to_string()));
        }
        let mut state = self.shared.lock();
        if !state.open {
            return Err(BackendError::NotOpen);
        }
        state.physical_format = Some(*format);
        Ok(())
    }

    fn auto_exclusive(&self) -> bool {
        self.shared.config.auto_exclusive
    }

    fn acquire_exclusive(&mut self) -> Result<(), BackendError> {
        self.shared.lock().exclusive = true;
        Ok(())
    }

    fn release_exclusive(&mut self) {
        self.shared.lock().exclusive = false;
    }

    fn preferred_frames(&self) -> u32 {
        self.shared.config.preferred_frames
    }

    fn register_pull_callback(
        &mut self,
        path: OutputPath,
        callback: PullCallback,
    ) -> Result<(), BackendError> {
        {
            let mut state = self.shared.lock();
            if !state.open {
                return Err(BackendError::NotOpen);
            }
            state.callback = Some(callback);
            state.path = Some(path);
        }
        self.spawn_clock();
        Ok(())
    }

    fn start(&mut self) -> Result<(), BackendError> {
        let mut state = self.shared.lock();
        if state.callback.is_none() {
            return Err(BackendError::NotOpen);
        }
        state.running = true;
        state.start_calls += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let mut state = self.shared.lock();
        state.running = false;
        state.stop_calls += 1;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), BackendError> {
        self.shared.lock().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.shared.lock().volume
    }

    fn close(&mut self) {
        self.join_clock();

        let mut state = self.shared.lock();
        state.running = false;
        state.callback = None;
        state.path = None;
        state.pcm_format = None;
        state.physical_format = None;
        state.exclusive = false;
        state.open = false;
        log::debug!("Null output closed");
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.join_clock();
    }
}

/// 空设备句柄
///
/// 在测试中扮演实时线程：`pull()` 会像硬件一样调用已注册的回调
#[derive(Clone)]
pub struct NullDevice {
    shared: Arc<NullShared>,
}

impl NullDevice {
    /// 拉取 `frames` 帧；设备未运行时返回 None
    pub fn pull(&self, frames: u32) -> Option<Vec<u8>> {
        let mut state = self.shared.lock();
        let mut buffer = vec![0u8; frames as usize * state.bytes_per_frame()];
        if state.pull(frames, &mut buffer) {
            Some(buffer)
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn has_callback(&self) -> bool {
        self.shared.lock().callback.is_some()
    }

    pub fn output_path(&self) -> Option<OutputPath> {
        self.shared.lock().path
    }

    pub fn start_calls(&self) -> u32 {
        self.shared.lock().start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.shared.lock().stop_calls
    }

    pub fn pcm_format(&self) -> Option<AudioFormat> {
        self.shared.lock().pcm_format
    }

    pub fn physical_format(&self) -> Option<PhysicalFormat> {
        self.shared.lock().physical_format
    }

    pub fn is_exclusive(&self) -> bool {
        self.shared.lock().exclusive
    }

    pub fn volume(&self) -> f32 {
        self.shared.lock().volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_backend(config: NullDeviceConfig) -> (NullBackend, NullDevice) {
        let mut backend = NullBackend::new(config);
        let device = backend.device();
        backend.open(None).unwrap();
        (backend, device)
    }

    #[test]
    fn test_unavailable_device() {
        let mut backend = NullBackend::new(NullDeviceConfig {
            available: false,
            ..NullDeviceConfig::default()
        });
        assert!(matches!(
            backend.open(None),
            Err(BackendError::DeviceUnavailable(_))
        ));

        let mut backend = NullBackend::default();
        assert!(backend.open(Some("Speakers")).is_err());
        assert!(backend.open(Some("null")).is_ok());
    }

    #[test]
    fn test_pull_requires_start() {
        let (mut backend, device) = open_backend(NullDeviceConfig::default());
        backend.configure_pcm(&AudioFormat::new(48000, 2, 16)).unwrap();
        backend
            .register_pull_callback(
                OutputPath::Generic,
                Box::new(|_, out| {
                    out.fill(7);
                    PullOutcome::Continue
                }),
            )
            .unwrap();

        assert!(device.pull(4).is_none());

        backend.start().unwrap();
        assert_eq!(device.pull(4).unwrap(), vec![7u8; 16]);
        assert!(device.is_running());

        backend.stop().unwrap();
        assert!(device.pull(4).is_none());
        assert_eq!(device.start_calls(), 1);
        assert_eq!(device.stop_calls(), 1);
    }

    #[test]
    fn test_pause_outcome_halts_pulling() {
        let (mut backend, device) = open_backend(NullDeviceConfig::default());
        backend.configure_pcm(&AudioFormat::new(48000, 2, 16)).unwrap();
        backend
            .register_pull_callback(OutputPath::Generic, Box::new(|_, _| PullOutcome::Pause))
            .unwrap();
        backend.start().unwrap();

        assert!(device.pull(8).is_some());
        assert!(!device.is_running());
        assert!(device.pull(8).is_none());
    }

    #[test]
    fn test_physical_format_must_be_advertised() {
        let (mut backend, device) = open_backend(NullDeviceConfig::default());
        let ac3 = PhysicalFormat {
            codec: Codec::Ac3,
            sample_rate: 48000,
            bits_per_channel: 16,
            channels: 2,
            bytes_per_packet: 6144,
            frames_per_packet: 1536,
        };
        assert!(backend.configure_physical_format(&ac3).is_err());
        assert!(device.physical_format().is_none());
    }

    #[test]
    fn test_close_drops_callback() {
        let (mut backend, device) = open_backend(NullDeviceConfig::default());
        backend.configure_pcm(&AudioFormat::new(48000, 2, 16)).unwrap();
        backend
            .register_pull_callback(OutputPath::Generic, Box::new(|_, _| PullOutcome::Continue))
            .unwrap();
        backend.start().unwrap();
        backend.close();

        assert!(!device.has_callback());
        assert!(device.pull(16).is_none());
        assert!(backend.probe_physical_formats().is_err());
    }
}
