//! 格式协商状态机
//!
//! 每次 `initialize` 走一遍：
//!
//! ```text
//! Start → ProbeDevice → { NativePassthrough | Pcm } → SpoofFallback → Ready | Failed
//! ```
//!
//! - PCM 请求：配置交织 PCM，回调挂在通用输出通路
//! - 直通请求：在物理流格式中找编码相同、采样率为参考采样率的第一项，
//!   锁定该格式（必要时取得 hog 独占），回调直接挂在物理流上
//! - 原生直通失败：把 16-bit 码流伪装成 32-bit 浮点 PCM 送进通用通路

use super::callback::FrameLayout;
use super::RendererConfig;
use crate::audio::{AudioFormat, Codec, PassthroughMode, PhysicalFormat, StreamRequest};
use crate::backend::{DeviceInfo, HardwareBackend, OutputPath, PullCallback};
use crate::error::RenderError;

/// 后端未给出首选帧数时的回调帧数
const DEFAULT_CALLBACK_FRAMES: u32 = 512;

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Start,
    ProbeDevice,
    NativePassthrough,
    Pcm,
    SpoofFallback,
    Ready,
    Failed,
}

/// 协商结果
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub mode: PassthroughMode,
    pub device: DeviceInfo,
    /// 声明给设备的格式（原生直通时为物理流格式）
    pub device_format: AudioFormat,
    /// 原生直通锁定的物理格式
    pub physical_format: Option<PhysicalFormat>,
    pub path: OutputPath,
    pub layout: FrameLayout,
    /// 每次回调的帧数
    pub callback_frames: u32,
    /// `add_packets` 接受的最小字节数
    pub chunk_bytes: usize,
    /// 队列字节的消耗速率
    pub bytes_per_second: usize,
    /// 是否由渲染器取得了独占
    pub exclusive: bool,
}

impl Negotiation {
    /// 最多缓存一秒
    #[inline]
    pub fn max_cache_bytes(&self) -> usize {
        self.bytes_per_second
    }
}

/// 直通码流所在的参考采样率
pub fn reference_rate_for(sample_rate: u32) -> u32 {
    if sample_rate % 11025 == 0 {
        44100
    } else {
        48000
    }
}

/// 在物理格式中寻找可原生直通的格式
///
/// 算不出每帧字节数的格式（如 bytes_per_packet 为 0 的可变码率项）不参与匹配
pub fn find_native_format(
    formats: &[PhysicalFormat],
    codec: Codec,
    sample_rate: u32,
) -> Option<PhysicalFormat> {
    let reference = reference_rate_for(sample_rate);
    formats
        .iter()
        .find(|f| f.codec == codec && f.sample_rate == reference && f.bytes_per_frame() > 0)
        .copied()
}

struct Negotiator<'a> {
    backend: &'a mut dyn HardwareBackend,
    config: &'a RendererConfig,
    state: NegotiationState,
}

impl Negotiator<'_> {
    fn transition(&mut self, next: NegotiationState) {
        log::debug!("Negotiation: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: RenderError) -> RenderError {
        self.transition(NegotiationState::Failed);
        log::warn!("Format negotiation failed: {}", err);
        err
    }

    fn callback_frames(&self, device: &DeviceInfo) -> u32 {
        match self.backend.preferred_frames() {
            0 if device.preferred_frames > 0 => device.preferred_frames,
            0 => DEFAULT_CALLBACK_FRAMES,
            frames => frames,
        }
    }

    fn probe(&mut self) -> Result<DeviceInfo, RenderError> {
        self.transition(NegotiationState::ProbeDevice);
        self.backend
            .open(self.config.device.as_deref())
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))
    }

    fn pcm(&mut self, device: DeviceInfo, format: AudioFormat) -> Result<Negotiation, RenderError> {
        self.transition(NegotiationState::Pcm);
        self.backend
            .configure_pcm(&format)
            .map_err(|e| RenderError::FormatUnsupported(e.to_string()))?;

        let frames = self.callback_frames(&device);
        log::info!("PCM output: {}", format);

        Ok(Negotiation {
            mode: PassthroughMode::None,
            device,
            device_format: format,
            physical_format: None,
            path: OutputPath::Generic,
            layout: FrameLayout::passthrough(format.bytes_per_frame()),
            callback_frames: frames,
            chunk_bytes: frames as usize * format.bytes_per_frame(),
            bytes_per_second: format.bytes_per_second(),
            exclusive: false,
        })
    }

    fn native(
        &mut self,
        device: &DeviceInfo,
        codec: Codec,
        sample_rate: u32,
    ) -> Result<Negotiation, RenderError> {
        self.transition(NegotiationState::NativePassthrough);

        let formats = self.backend.probe_physical_formats()?;
        let physical = find_native_format(&formats, codec, sample_rate).ok_or_else(|| {
            RenderError::FormatUnsupported(format!(
                "no {} physical stream at {}Hz",
                codec,
                reference_rate_for(sample_rate)
            ))
        })?;

        let mut exclusive = false;
        if !self.backend.auto_exclusive() && self.config.exclusive_mode {
            self.backend.acquire_exclusive()?;
            exclusive = true;
        }
        if let Err(e) = self.backend.configure_physical_format(&physical) {
            if exclusive {
                self.backend.release_exclusive();
            }
            return Err(e.into());
        }

        let frames = self.callback_frames(device);
        let bytes_per_frame = physical.bytes_per_frame();
        log::info!("Native passthrough: {}", physical);

        Ok(Negotiation {
            mode: PassthroughMode::NativeEncoded,
            device: device.clone(),
            device_format: physical.as_stream_format(),
            physical_format: Some(physical),
            path: OutputPath::Physical,
            layout: FrameLayout::passthrough(bytes_per_frame),
            callback_frames: frames,
            chunk_bytes: frames as usize * bytes_per_frame,
            bytes_per_second: bytes_per_frame * physical.sample_rate as usize,
            exclusive,
        })
    }

    fn spoof(
        &mut self,
        device: DeviceInfo,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Negotiation, RenderError> {
        self.transition(NegotiationState::SpoofFallback);

        let reference = reference_rate_for(sample_rate);
        let payload = AudioFormat::new(reference, channels, 16);
        let declared = AudioFormat::float32(reference, channels);
        self.backend
            .configure_pcm(&declared)
            .map_err(|e| RenderError::FormatUnsupported(e.to_string()))?;

        let frames = self.callback_frames(&device);
        log::info!("Spoofed passthrough: 16-bit payload declared as {}", declared);

        Ok(Negotiation {
            mode: PassthroughMode::SpoofedEncoded,
            device,
            device_format: declared,
            physical_format: None,
            path: OutputPath::Generic,
            layout: FrameLayout {
                input_bytes_per_frame: payload.bytes_per_frame(),
                output_bytes_per_frame: declared.bytes_per_frame(),
                convert: true,
            },
            callback_frames: frames,
            // 按设备（浮点）字节计：一个 chunk 的 16-bit 数据够两次回调
            chunk_bytes: frames as usize * declared.bytes_per_frame(),
            bytes_per_second: payload.bytes_per_second(),
            exclusive: false,
        })
    }

    fn run<F>(&mut self, request: &StreamRequest, make_callback: F) -> Result<Negotiation, RenderError>
    where
        F: FnOnce(&Negotiation) -> Result<PullCallback, RenderError>,
    {
        let device = self.probe()?;
        log::info!(
            "Output device: {} ({} physical formats, {} frames/callback)",
            device.name,
            device.physical_formats.len(),
            device.preferred_frames
        );

        let negotiation = match *request {
            StreamRequest::Pcm { .. } => self.pcm(device, request.input_format())?,
            StreamRequest::Passthrough {
                codec,
                channels,
                sample_rate,
            } => match self.native(&device, codec, sample_rate) {
                Ok(native) => native,
                Err(e) if self.config.allow_spoofing => {
                    log::info!("Native passthrough unavailable ({}), falling back to spoofing", e);
                    self.spoof(device, channels, sample_rate)?
                }
                Err(e) => return Err(e),
            },
        };

        let callback = make_callback(&negotiation)?;
        self.backend
            .register_pull_callback(negotiation.path, callback)?;

        self.transition(NegotiationState::Ready);
        Ok(negotiation)
    }
}

/// 协商输出格式并注册拉取回调
///
/// `make_callback` 在格式确定之后、注册之前调用，用协商结果构造回调。
/// 失败时后端可能处于半配置状态，调用方负责 `close()`
pub fn negotiate<F>(
    backend: &mut dyn HardwareBackend,
    request: &StreamRequest,
    config: &RendererConfig,
    make_callback: F,
) -> Result<Negotiation, RenderError>
where
    F: FnOnce(&Negotiation) -> Result<PullCallback, RenderError>,
{
    let mut negotiator = Negotiator {
        backend,
        config,
        state: NegotiationState::Start,
    };

    match negotiator.run(request, make_callback) {
        Ok(negotiation) => Ok(negotiation),
        Err(e) => Err(negotiator.fail(e)),
    }
}
