//! 渲染器错误

use thiserror::Error;

use crate::audio::ConvertError;
use crate::backend::BackendError;

/// 渲染器错误
///
/// 实时线程上的问题（underrun、计数不一致）不在这里，
/// 它们只记入 `RenderStats`，见 `RenderIssue`。
/// 分配器耗尽同样不作为错误返回，只体现为 `add_packets` 接受的字节数变少
#[derive(Debug, Error)]
pub enum RenderError {
    /// 协商时找不到可用的输出设备
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// 设备不接受请求的格式，且没有可用的回退
    #[error("format unsupported: {0}")]
    FormatUnsupported(String),

    #[error("invalid renderer state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<ConvertError> for RenderError {
    fn from(err: ConvertError) -> Self {
        RenderError::FormatUnsupported(err.to_string())
    }
}
