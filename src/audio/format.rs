//! 音频格式描述
//!
//! - `AudioFormat`: 交织 PCM 流格式（渲染器队列里的字节按此解释）
//! - `PhysicalFormat`: 设备物理流格式（探测结果，可能是压缩码流）
//! - `StreamRequest`: 播放引擎请求的输出格式

use std::fmt;

/// 参考采样率（44.1kHz / 48kHz 两个系列）
///
/// 直通码流只在这两个采样率上协商物理格式
pub const REFERENCE_RATES: [u32; 2] = [44100, 48000];

/// 判断是否为参考采样率
#[inline]
pub fn is_reference_rate(rate: u32) -> bool {
    REFERENCE_RATES.contains(&rate)
}

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// 有符号整数
    SignedInteger,
    /// IEEE 浮点
    Float,
}

impl Default for SampleEncoding {
    fn default() -> Self {
        Self::SignedInteger
    }
}

/// 码流编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    /// 线性 PCM
    Pcm,
    /// Dolby Digital
    Ac3,
    /// DTS
    Dts,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcm => write!(f, "PCM"),
            Self::Ac3 => write!(f, "AC3"),
            Self::Dts => write!(f, "DTS"),
        }
    }
}

/// 交织 PCM 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// 创建整数 PCM 格式
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            encoding: SampleEncoding::SignedInteger,
        }
    }

    /// 创建 32-bit 浮点格式
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            encoding: SampleEncoding::Float,
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 每秒字节数
    #[inline]
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// 格式是否可用（非零声道/采样率，整字节位深）
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && self.channels > 0
            && self.bits_per_sample > 0
            && self.bits_per_sample % 8 == 0
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.encoding {
            SampleEncoding::SignedInteger => "int",
            SampleEncoding::Float => "float",
        };
        write!(
            f,
            "{}Hz {}ch {}bit {}",
            self.sample_rate, self.channels, self.bits_per_sample, kind
        )
    }
}

/// 设备物理流格式
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysicalFormat {
    pub codec: Codec,
    pub sample_rate: u32,
    pub bits_per_channel: u16,
    pub channels: u16,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
}

impl PhysicalFormat {
    /// 每帧字节数
    ///
    /// 压缩码流（IEC 60958 承载）按 bytes_per_packet / frames_per_packet 计算
    pub fn bytes_per_frame(&self) -> usize {
        if self.frames_per_packet == 0 {
            return (self.bits_per_channel as usize / 8) * self.channels as usize;
        }
        (self.bytes_per_packet / self.frames_per_packet) as usize
    }

    /// 作为 PCM 流格式看待（队列字节按此计数）
    pub fn as_stream_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.bits_per_channel)
    }
}

impl fmt::Display for PhysicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch {}bit ({} bytes/packet)",
            self.codec, self.sample_rate, self.channels, self.bits_per_channel, self.bytes_per_packet
        )
    }
}

/// 播放引擎请求的输出格式
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamRequest {
    /// 交织 PCM
    Pcm {
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
    },
    /// 压缩码流直通（引擎已经打包成 16-bit IEC 61937 帧）
    Passthrough {
        codec: Codec,
        channels: u16,
        sample_rate: u32,
    },
}

impl StreamRequest {
    /// 引擎推入数据的格式（队列按此计字节）
    pub fn input_format(&self) -> AudioFormat {
        match *self {
            Self::Pcm {
                channels,
                sample_rate,
                bits_per_sample,
            } => AudioFormat::new(sample_rate, channels, bits_per_sample),
            // 直通码流总是按 16-bit 字承载
            Self::Passthrough {
                channels,
                sample_rate,
                ..
            } => AudioFormat::new(sample_rate, channels, 16),
        }
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough { .. })
    }
}

/// 直通模式（每次初始化固定）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassthroughMode {
    /// 普通 PCM
    None,
    /// 设备物理流原生接收压缩码流
    NativeEncoded,
    /// 码流伪装成 32-bit 浮点 PCM 经过 PCM 通路
    SpoofedEncoded,
}

impl Default for PassthroughMode {
    fn default() -> Self {
        Self::None
    }
}

impl PassthroughMode {
    #[inline]
    pub fn is_encoded(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_sizes() {
        let format = AudioFormat::new(48000, 2, 16);
        assert_eq!(format.bytes_per_sample(), 2);
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.bytes_per_second(), 192_000);
        assert!(format.is_valid());

        let float = AudioFormat::float32(48000, 2);
        assert_eq!(float.bytes_per_frame(), 8);
        assert_eq!(float.encoding, SampleEncoding::Float);
    }

    #[test]
    fn test_invalid_format() {
        assert!(!AudioFormat::new(0, 2, 16).is_valid());
        assert!(!AudioFormat::new(48000, 0, 16).is_valid());
        assert!(!AudioFormat::new(48000, 2, 12).is_valid());
    }

    #[test]
    fn test_passthrough_input_is_16bit() {
        let request = StreamRequest::Passthrough {
            codec: Codec::Ac3,
            channels: 2,
            sample_rate: 48000,
        };
        let input = request.input_format();
        assert_eq!(input.bits_per_sample, 16);
        assert_eq!(input.bytes_per_frame(), 4);
        assert!(request.is_passthrough());
    }

    #[test]
    fn test_physical_bytes_per_frame() {
        let ac3 = PhysicalFormat {
            codec: Codec::Ac3,
            sample_rate: 48000,
            bits_per_channel: 16,
            channels: 2,
            bytes_per_packet: 6144,
            frames_per_packet: 1536,
        };
        assert_eq!(ac3.bytes_per_frame(), 4);
        assert_eq!(ac3.as_stream_format().bytes_per_second(), 192_000);
    }

    #[test]
    fn test_reference_rates() {
        assert!(is_reference_rate(44100));
        assert!(is_reference_rate(48000));
        assert!(!is_reference_rate(96000));
    }
}
