//! 硬件后端接口
//!
//! 渲染器只通过 `HardwareBackend` 与平台音频 API 交互：
//! 探测物理格式、配置 PCM / 物理流格式、注册拉取回调、启停、音量。
//! 渲染器不关心持有的是哪种后端。

use thiserror::Error;

use crate::audio::{AudioFormat, PhysicalFormat};

#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod null;

#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioBackend;
pub use null::{NullBackend, NullDevice, NullDeviceConfig};

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    CoreAudio,
    Wasapi,
    DirectSound,
    Alsa,
    /// 无硬件输出（测试与无头环境）
    Null,
}

/// 拉取回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// 继续按周期拉取
    Continue,
    /// 数据不足，后端应停止拉取直到下一次 `start()`
    Pause,
}

/// 回调注册的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPath {
    /// 通用 PCM 输出通路（经过系统格式转换）
    Generic,
    /// 直接挂在物理流上（压缩码流原样送出）
    Physical,
}

/// 拉取回调
///
/// 在后端的实时线程上调用：`(frame_count, out_buffer) -> PullOutcome`。
/// **绝对禁止：** 锁、分配、I/O、日志
pub type PullCallback = Box<dyn FnMut(u32, &mut [u8]) -> PullOutcome + Send + 'static>;

/// 输出设备信息
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
    pub physical_formats: Vec<PhysicalFormat>,
    /// 每次回调的首选帧数
    pub preferred_frames: u32,
    /// 平台是否自动独占（无需显式 hog）
    pub auto_exclusive: bool,
}

/// 后端错误
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no usable output device: {0}")]
    DeviceUnavailable(String),

    #[error("format rejected by device: {0}")]
    FormatRejected(String),

    #[error("backend call failed: {0}")]
    Call(String),

    #[error("backend used before open")]
    NotOpen,
}

/// 硬件后端能力接口
///
/// 约定：
/// - `stop()` 返回后不再有正在执行或新的回调，直到下一次 `start()`
/// - 回调返回 `PullOutcome::Pause` 后，后端停止调用回调（可以继续输出静音），
///   下一次 `start()` 恢复
/// - `close()` 丢弃回调、释放独占与格式，之后绝不再调用回调
pub trait HardwareBackend: Send {
    /// 后端种类
    fn kind(&self) -> BackendKind;

    /// 打开输出设备（`None` 为系统默认设备）
    fn open(&mut self, device: Option<&str>) -> Result<DeviceInfo, BackendError>;

    /// 探测设备可用的物理流格式
    fn probe_physical_formats(&mut self) -> Result<Vec<PhysicalFormat>, BackendError>;

    /// 按交织 PCM 配置通用输出通路（`format` 是声明给设备的格式）
    fn configure_pcm(&mut self, format: &AudioFormat) -> Result<(), BackendError>;

    /// 把设备锁定到指定物理流格式
    fn configure_physical_format(&mut self, format: &PhysicalFormat) -> Result<(), BackendError>;

    /// 平台是否自动独占设备
    fn auto_exclusive(&self) -> bool;

    /// 获取独占（hog）所有权
    fn acquire_exclusive(&mut self) -> Result<(), BackendError>;

    /// 释放独占所有权（未持有时什么也不做）
    fn release_exclusive(&mut self);

    /// 每次回调的首选帧数
    fn preferred_frames(&self) -> u32;

    /// 注册拉取回调（替换已有回调）
    fn register_pull_callback(
        &mut self,
        path: OutputPath,
        callback: PullCallback,
    ) -> Result<(), BackendError>;

    /// 开始拉取
    fn start(&mut self) -> Result<(), BackendError>;

    /// 停止拉取（可能短暂阻塞，只在非实时线程调用）
    fn stop(&mut self) -> Result<(), BackendError>;

    /// 线性音量 0.0 - 1.0
    fn set_volume(&mut self, volume: f32) -> Result<(), BackendError>;

    /// 当前线性音量
    fn volume(&self) -> f32;

    /// 释放全部资源
    fn close(&mut self);
}

/// 当前平台的默认后端
///
/// macOS 使用 Core Audio；其他平台使用带实时时钟的空输出
pub fn default_backend() -> Box<dyn HardwareBackend> {
    #[cfg(target_os = "macos")]
    {
        Box::new(CoreAudioBackend::new())
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(NullBackend::new(NullDeviceConfig {
            realtime_clock: true,
            ..NullDeviceConfig::default()
        }))
    }
}
