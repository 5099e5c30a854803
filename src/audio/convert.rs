//! 样本格式转换（伪装直通通路）
//!
//! 16-bit 码流以 32-bit 浮点 PCM 的身份穿过 PCM 输出通路：
//! `f = i16 / 32768.0`，线性缩放，无 dither，无削波。
//! 结果总在 [-1, 1) 内，设备再按同一比例换回 16-bit，码流保持不变。

use thiserror::Error;

use super::format::SampleEncoding;

/// 16-bit 转浮点的固定除数
const I16_SCALE: f32 = 1.0 / 32768.0;

/// 样本表示（编码 + 位深）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSpec {
    pub encoding: SampleEncoding,
    pub bits: u16,
}

impl SampleSpec {
    pub const fn new(encoding: SampleEncoding, bits: u16) -> Self {
        Self { encoding, bits }
    }

    pub const I16: SampleSpec = SampleSpec::new(SampleEncoding::SignedInteger, 16);
    pub const F32: SampleSpec = SampleSpec::new(SampleEncoding::Float, 32);

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bits as usize / 8
    }
}

/// 转换器错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConvertError {
    #[error("no conversion kernel from {from:?} to {to:?}")]
    Unsupported { from: SampleSpec, to: SampleSpec },
}

/// 转换内核
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kernel {
    I16ToF32,
}

/// 样本转换器
///
/// 只持有一个输入暂存区，大小在创建时按最大回调请求预分配
pub struct SampleConverter {
    kernel: Kernel,
    input: SampleSpec,
    output: SampleSpec,
    staging: Vec<u8>,
    staged: usize,
}

impl SampleConverter {
    /// 选择转换内核
    ///
    /// `max_input_bytes` 是暂存区的预分配大小
    pub fn new(
        input: SampleSpec,
        output: SampleSpec,
        max_input_bytes: usize,
    ) -> Result<Self, ConvertError> {
        let kernel = match (input, output) {
            (SampleSpec::I16, SampleSpec::F32) => Kernel::I16ToF32,
            (from, to) => return Err(ConvertError::Unsupported { from, to }),
        };

        Ok(Self {
            kernel,
            input,
            output,
            staging: vec![0u8; max_input_bytes],
            staged: 0,
        })
    }

    /// 输出字节数与输入字节数之比
    #[inline]
    pub fn expansion(&self) -> usize {
        self.output.bytes() / self.input.bytes()
    }

    /// 获取输入暂存区（调用方填入待转换的数据）
    ///
    /// 在实时线程上调用，从不重新分配：
    /// 请求超过预分配大小时返回的暂存区比 `min_size` 短
    pub fn input_buffer(&mut self, min_size: usize) -> &mut [u8] {
        let size = min_size.min(self.staging.len());
        self.staged = size;
        &mut self.staging[..size]
    }

    /// 转换暂存区数据写入 `output`
    ///
    /// 返回写入的字节数；受暂存区中的样本数和 `output` 长度共同限制
    pub fn convert(&mut self, output: &mut [u8]) -> usize {
        match self.kernel {
            Kernel::I16ToF32 => {
                let input = &self.staging[..self.staged];
                let mut written = 0;
                for (src, dst) in input.chunks_exact(2).zip(output.chunks_exact_mut(4)) {
                    let sample = i16::from_ne_bytes([src[0], src[1]]);
                    dst.copy_from_slice(&i16_to_f32(sample).to_ne_bytes());
                    written += 4;
                }
                written
            }
        }
    }
}

/// 单个样本的 16-bit 整数到浮点转换
#[inline(always)]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 * I16_SCALE
}
