//! Core Audio 后端
//!
//! - PCM / 伪装直通：AUHAL 输出单元，回调挂在输入 scope 的 render callback 上
//! - 原生直通：IOProc 直接挂在设备上，物理流锁定为压缩码流格式
//! - 独占（Hog Mode）：按进程 pid 取得，关闭时释放
//! - 关闭时恢复物理流原格式与设备原采样率

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{
    BackendError, BackendKind, DeviceInfo, HardwareBackend, OutputPath, PullCallback, PullOutcome,
};
use crate::audio::{AudioFormat, Codec, PhysicalFormat, SampleEncoding};

type AudioDeviceID = u32;
type AudioObjectID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type OSStatus = i32;
type AudioUnit = *mut c_void;
type AudioComponent = *mut c_void;
type AudioDeviceIOProcID = *mut c_void;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEVICES: AudioObjectPropertySelector = 0x64657623; // 'dev#'
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE: AudioObjectPropertySelector = 0x6E737274; // 'nsrt'
const K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE: AudioObjectPropertySelector = 0x6673697A; // 'fsiz'
const K_AUDIO_DEVICE_PROPERTY_HOG_MODE: AudioObjectPropertySelector = 0x6F696E6B; // 'oink'
const K_AUDIO_DEVICE_PROPERTY_STREAMS: AudioObjectPropertySelector = 0x73746D23; // 'stm#'
const K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT: AudioObjectPropertySelector = 0x70667420; // 'pft '
const K_AUDIO_STREAM_PROPERTY_AVAILABLE_PHYSICAL_FORMATS: AudioObjectPropertySelector = 0x70667461; // 'pfta'

const K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT: AudioObjectPropertyScope = 0x6F757470; // 'outp'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
const K_AUDIO_FORMAT_AC3: u32 = 0x61632D33; // 'ac-3'
const K_AUDIO_FORMAT_60958_AC3: u32 = 0x63616333; // 'cac3'
const K_AUDIO_FORMAT_DTS: u32 = 0x64747320; // 'dts '

const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
const K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;

const K_AUDIO_UNIT_SCOPE_GLOBAL: u32 = 0;
const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;
const K_AUDIO_UNIT_SCOPE_OUTPUT: u32 = 2;

const K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE: u32 = 2000;
const K_AUDIO_OUTPUT_UNIT_PROPERTY_ENABLE_IO: u32 = 2003;
const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;
const K_HAL_OUTPUT_PARAM_VOLUME: u32 = 14;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT: u32 = 0x6168616C; // 'ahal'
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

const NO_ERR: OSStatus = 0;

/// 未被任何进程独占
const HOG_FREE: i32 = -1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

impl AudioStreamBasicDescription {
    /// 交织 PCM 描述
    fn interleaved_pcm(format: &AudioFormat) -> Self {
        let flags = match format.encoding {
            SampleEncoding::Float => K_AUDIO_FORMAT_FLAG_IS_FLOAT,
            SampleEncoding::SignedInteger => K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER,
        };
        let bytes_per_frame = format.bytes_per_frame() as u32;

        Self {
            sample_rate: format.sample_rate as f64,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: flags | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_frame,
            channels_per_frame: format.channels as u32,
            bits_per_channel: format.bits_per_sample as u32,
            reserved: 0,
        }
    }

    /// 转成物理格式描述（不认识的编码返回 None）
    fn to_physical(&self) -> Option<PhysicalFormat> {
        let codec = match self.format_id {
            K_AUDIO_FORMAT_LINEAR_PCM => Codec::Pcm,
            K_AUDIO_FORMAT_AC3 | K_AUDIO_FORMAT_60958_AC3 => Codec::Ac3,
            K_AUDIO_FORMAT_DTS => Codec::Dts,
            _ => return None,
        };

        Some(PhysicalFormat {
            codec,
            sample_rate: self.sample_rate as u32,
            bits_per_channel: self.bits_per_channel as u16,
            channels: self.channels_per_frame as u16,
            bytes_per_packet: self.bytes_per_packet,
            frames_per_packet: self.frames_per_packet,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AudioValueRange {
    minimum: f64,
    maximum: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AudioStreamRangedDescription {
    format: AudioStreamBasicDescription,
    sample_rate_range: AudioValueRange,
}

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: RenderCallback,
    input_proc_ref_con: *mut c_void,
}

type RenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const c_void,
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus;

type IOProc = unsafe extern "C" fn(
    in_device: AudioObjectID,
    in_now: *const c_void,
    in_input_data: *const AudioBufferList,
    in_input_time: *const c_void,
    out_output_data: *mut AudioBufferList,
    in_output_time: *const c_void,
    in_client_data: *mut c_void,
) -> OSStatus;

#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyDataSize(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        out_data_size: *mut u32,
    ) -> OSStatus;

    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        io_data_size: *mut u32,
        out_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectSetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: u32,
        data: *const c_void,
    ) -> OSStatus;

    fn AudioDeviceCreateIOProcID(
        in_device: AudioDeviceID,
        in_proc: Option<IOProc>,
        in_client_data: *mut c_void,
        out_io_proc_id: *mut AudioDeviceIOProcID,
    ) -> OSStatus;

    fn AudioDeviceDestroyIOProcID(
        in_device: AudioDeviceID,
        in_io_proc_id: AudioDeviceIOProcID,
    ) -> OSStatus;

    fn AudioDeviceStart(in_device: AudioDeviceID, in_proc_id: AudioDeviceIOProcID) -> OSStatus;

    fn AudioDeviceStop(in_device: AudioDeviceID, in_proc_id: AudioDeviceIOProcID) -> OSStatus;
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(component: AudioComponent, out_instance: *mut AudioUnit)
        -> OSStatus;

    fn AudioComponentInstanceDispose(instance: AudioUnit) -> OSStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OSStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        data_size: u32,
    ) -> OSStatus;

    fn AudioUnitSetParameter(
        unit: AudioUnit,
        parameter_id: u32,
        scope: u32,
        element: u32,
        value: f32,
        buffer_offset_frames: u32,
    ) -> OSStatus;
}

fn check(status: OSStatus, what: &str) -> Result<(), BackendError> {
    if status == NO_ERR {
        Ok(())
    } else {
        Err(BackendError::Call(format!("{} (status {})", what, status)))
    }
}

fn address(
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        selector,
        scope,
        element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
    }
}

/// 读取定长属性
fn get_property<T: Copy + Default>(
    object: AudioObjectID,
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
) -> Result<T, OSStatus> {
    let address = address(selector, scope);
    let mut value = T::default();
    let mut size = mem::size_of::<T>() as u32;

    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };

    if status == NO_ERR {
        Ok(value)
    } else {
        Err(status)
    }
}

/// 读取数组属性
fn get_property_array<T: Copy + Default>(
    object: AudioObjectID,
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
) -> Result<Vec<T>, OSStatus> {
    let address = address(selector, scope);
    let mut size: u32 = 0;

    let status =
        unsafe { AudioObjectGetPropertyDataSize(object, &address, 0, ptr::null(), &mut size) };
    if status != NO_ERR {
        return Err(status);
    }

    let count = size as usize / mem::size_of::<T>();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut values = vec![T::default(); count];
    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            &address,
            0,
            ptr::null(),
            &mut size,
            values.as_mut_ptr() as *mut c_void,
        )
    };
    if status != NO_ERR {
        return Err(status);
    }

    values.truncate(size as usize / mem::size_of::<T>());
    Ok(values)
}

fn set_property<T>(
    object: AudioObjectID,
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    value: &T,
) -> OSStatus {
    let address = address(selector, scope);
    unsafe {
        AudioObjectSetPropertyData(
            object,
            &address,
            0,
            ptr::null(),
            mem::size_of::<T>() as u32,
            value as *const T as *const c_void,
        )
    }
}

/// 设备名称（通过 CFString 读取）
fn device_name(device_id: AudioDeviceID) -> String {
    use core_foundation::base::TCFType;
    use core_foundation::string::CFString;
    use coreaudio_sys::{
        kAudioObjectPropertyElementMain, kAudioObjectPropertyName,
        kAudioObjectPropertyScopeGlobal, AudioObjectGetPropertyData as sysGetPropertyData,
        AudioObjectPropertyAddress as SysPropertyAddress,
    };

    let address = SysPropertyAddress {
        mSelector: kAudioObjectPropertyName,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMain,
    };

    let mut size: u32 = mem::size_of::<*const c_void>() as u32;
    let mut cf_string_ref: *const c_void = ptr::null();

    let status = unsafe {
        sysGetPropertyData(
            device_id,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut cf_string_ref as *mut _ as *mut c_void,
        )
    };

    if status != 0 || cf_string_ref.is_null() {
        return format!("Device {}", device_id);
    }

    // 属性返回的引用归调用方所有
    let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) };
    cf_string.to_string()
}

fn default_output_device() -> Result<AudioDeviceID, BackendError> {
    let device_id: AudioDeviceID = get_property(
        K_AUDIO_OBJECT_SYSTEM_OBJECT,
        K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
        K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
    )
    .map_err(|status| BackendError::DeviceUnavailable(format!("status {}", status)))?;

    if device_id == 0 {
        return Err(BackendError::DeviceUnavailable("no default output device".into()));
    }
    Ok(device_id)
}

fn output_streams(device_id: AudioDeviceID) -> Vec<AudioObjectID> {
    get_property_array(
        device_id,
        K_AUDIO_DEVICE_PROPERTY_STREAMS,
        K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
    )
    .unwrap_or_default()
}

/// 按 ID 或名称（先精确后部分匹配）查找输出设备
fn find_output_device(query: &str) -> Result<AudioDeviceID, BackendError> {
    let devices: Vec<AudioDeviceID> = get_property_array(
        K_AUDIO_OBJECT_SYSTEM_OBJECT,
        K_AUDIO_HARDWARE_PROPERTY_DEVICES,
        K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
    )
    .map_err(|status| BackendError::DeviceUnavailable(format!("status {}", status)))?;

    let outputs: Vec<(AudioDeviceID, String)> = devices
        .into_iter()
        .filter(|&id| !output_streams(id).is_empty())
        .map(|id| (id, device_name(id)))
        .collect();

    if let Ok(id) = query.parse::<AudioDeviceID>() {
        if outputs.iter().any(|(device, _)| *device == id) {
            return Ok(id);
        }
    }

    let query = query.to_lowercase();
    outputs
        .iter()
        .find(|(_, name)| name.to_lowercase() == query)
        .or_else(|| outputs.iter().find(|(_, name)| name.to_lowercase().contains(&query)))
        .map(|(id, _)| *id)
        .ok_or_else(|| BackendError::DeviceUnavailable(query.clone()))
}

/// 自我暂停闩
///
/// 低位是暂停标记，其余位是 `start` 的代数。
/// 回调只能暂停它调用前看到的那一代，
/// 回调运行期间发生的 `start` 使这次暂停失效
struct HaltLatch(AtomicU32);

impl HaltLatch {
    const HALTED: u32 = 1;
    const EPOCH: u32 = 2;

    fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// 当前状态快照（回调开始时读取）
    #[inline]
    fn snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn is_halted(state: u32) -> bool {
        state & Self::HALTED != 0
    }

    /// 暂停快照所在的那一代，期间有过 `rearm` 时返回 false
    #[inline]
    fn halt(&self, seen: u32) -> bool {
        self.0
            .compare_exchange(seen, seen | Self::HALTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 进入新一代并清除暂停标记
    fn rearm(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(state.wrapping_add(Self::EPOCH) & !Self::HALTED)
            });
    }
}

/// 回调上下文（实时线程持有裸指针）
struct CallbackContext {
    callback: PullCallback,
    /// 回调请求暂停后只输出静音，直到下一次 start
    latch: HaltLatch,
    bytes_per_frame: usize,
}

impl CallbackContext {
    /// 填充第一个缓冲区
    ///
    /// **绝对禁止：** 锁、分配、I/O
    #[inline(always)]
    unsafe fn fill(&mut self, buffers: *mut AudioBufferList, frames: Option<u32>) {
        if buffers.is_null() || (*buffers).number_buffers == 0 {
            return;
        }

        let buffer = &mut (*buffers).buffers[0];
        if buffer.data.is_null() {
            return;
        }
        let output =
            std::slice::from_raw_parts_mut(buffer.data as *mut u8, buffer.data_byte_size as usize);

        let seen = self.latch.snapshot();
        if HaltLatch::is_halted(seen) {
            output.fill(0);
            return;
        }

        let frames = match frames {
            Some(frames) => frames,
            None if self.bytes_per_frame > 0 => (output.len() / self.bytes_per_frame) as u32,
            None => 0,
        };

        if (self.callback)(frames, output) == PullOutcome::Pause {
            self.latch.halt(seen);
        }
    }
}

/// AUHAL render callback
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    _io_action_flags: *mut u32,
    _in_time_stamp: *const c_void,
    _in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    let ctx = unsafe { &mut *(in_ref_con as *mut CallbackContext) };
    unsafe { ctx.fill(io_data, Some(in_number_frames)) };
    NO_ERR
}

/// 物理流 IOProc
unsafe extern "C" fn io_proc(
    _in_device: AudioObjectID,
    _in_now: *const c_void,
    _in_input_data: *const AudioBufferList,
    _in_input_time: *const c_void,
    out_output_data: *mut AudioBufferList,
    _in_output_time: *const c_void,
    in_client_data: *mut c_void,
) -> OSStatus {
    let ctx = &mut *(in_client_data as *mut CallbackContext);
    ctx.fill(out_output_data, None);
    NO_ERR
}

/// Core Audio 后端
pub struct CoreAudioBackend {
    device_id: AudioDeviceID,
    stream_id: Option<AudioObjectID>,
    preferred_frames: u32,

    audio_unit: AudioUnit,
    io_proc_id: AudioDeviceIOProcID,
    context: Option<Box<CallbackContext>>,
    path: Option<OutputPath>,

    pcm_format: Option<AudioFormat>,
    physical_format: Option<PhysicalFormat>,
    original_physical: Option<AudioStreamBasicDescription>,
    original_sample_rate: Option<f64>,
    hog_acquired: bool,

    running: bool,
    volume: f32,
}

// 裸指针只在持有者线程和 Core Audio 的 IO 线程之间传递
unsafe impl Send for CoreAudioBackend {}

impl CoreAudioBackend {
    pub fn new() -> Self {
        Self {
            device_id: 0,
            stream_id: None,
            preferred_frames: 0,
            audio_unit: ptr::null_mut(),
            io_proc_id: ptr::null_mut(),
            context: None,
            path: None,
            pcm_format: None,
            physical_format: None,
            original_physical: None,
            original_sample_rate: None,
            hog_acquired: false,
            running: false,
            volume: 1.0,
        }
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.device_id == 0 {
            Err(BackendError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn current_sample_rate(&self) -> Option<f64> {
        get_property(
            self.device_id,
            K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        )
        .ok()
    }

    /// 切换设备采样率（失败只记录警告，由 AUHAL 做 SRC）
    fn set_sample_rate(&mut self, rate: f64) {
        let Some(current) = self.current_sample_rate() else {
            return;
        };
        if (current - rate).abs() < 1.0 {
            return;
        }
        if self.original_sample_rate.is_none() {
            self.original_sample_rate = Some(current);
        }

        let status = set_property(
            self.device_id,
            K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            &rate,
        );
        if status != NO_ERR {
            log::warn!("Cannot set sample rate to {} Hz (status {})", rate, status);
        } else {
            log::info!("Device sample rate: {} Hz -> {} Hz", current, rate);
        }
    }

    /// 创建 AUHAL 输出单元并绑定到设备
    fn ensure_audio_unit(&mut self) -> Result<AudioUnit, BackendError> {
        if !self.audio_unit.is_null() {
            return Ok(self.audio_unit);
        }

        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };
        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &desc) };
        if component.is_null() {
            return Err(BackendError::Call("HALOutput component not found".into()));
        }

        let mut unit: AudioUnit = ptr::null_mut();
        check(
            unsafe { AudioComponentInstanceNew(component, &mut unit) },
            "AudioComponentInstanceNew",
        )?;

        let enable_io: u32 = 1;
        let status = unsafe {
            AudioUnitSetProperty(
                unit,
                K_AUDIO_OUTPUT_UNIT_PROPERTY_ENABLE_IO,
                K_AUDIO_UNIT_SCOPE_OUTPUT,
                0,
                &enable_io as *const _ as *const c_void,
                mem::size_of::<u32>() as u32,
            )
        };
        if status != NO_ERR {
            log::debug!("EnableIO not supported (status {})", status);
        }

        let status = unsafe {
            AudioUnitSetProperty(
                unit,
                K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE,
                K_AUDIO_UNIT_SCOPE_GLOBAL,
                0,
                &self.device_id as *const _ as *const c_void,
                mem::size_of::<AudioDeviceID>() as u32,
            )
        };
        if status != NO_ERR {
            unsafe { AudioComponentInstanceDispose(unit) };
            return Err(BackendError::Call(format!(
                "bind output unit to device {} (status {})",
                self.device_id, status
            )));
        }

        self.audio_unit = unit;
        Ok(unit)
    }

    fn dispose_audio_unit(&mut self) {
        if self.audio_unit.is_null() {
            return;
        }
        unsafe {
            AudioOutputUnitStop(self.audio_unit);
            AudioUnitUninitialize(self.audio_unit);
            AudioComponentInstanceDispose(self.audio_unit);
        }
        self.audio_unit = ptr::null_mut();
    }

    fn destroy_io_proc(&mut self) {
        if self.io_proc_id.is_null() {
            return;
        }
        unsafe {
            AudioDeviceStop(self.device_id, self.io_proc_id);
            AudioDeviceDestroyIOProcID(self.device_id, self.io_proc_id);
        }
        self.io_proc_id = ptr::null_mut();
    }

    fn set_hog(&self, owner: i32) -> OSStatus {
        set_property(
            self.device_id,
            K_AUDIO_DEVICE_PROPERTY_HOG_MODE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            &owner,
        )
    }
}

impl Default for CoreAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBackend for CoreAudioBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CoreAudio
    }

    fn open(&mut self, device: Option<&str>) -> Result<DeviceInfo, BackendError> {
        if self.device_id != 0 {
            self.close();
        }

        let device_id = match device {
            Some(query) => find_output_device(query)?,
            None => default_output_device()?,
        };
        self.device_id = device_id;
        self.stream_id = output_streams(device_id).first().copied();

        self.preferred_frames = get_property(
            device_id,
            K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
        )
        .unwrap_or_else(|status| {
            log::warn!("Cannot get buffer size (status {}), using default 512 frames", status);
            512
        });

        let name = device_name(device_id);
        let physical_formats = self.probe_physical_formats().unwrap_or_default();
        log::info!("Opened output device: {} (ID: {})", name, device_id);

        Ok(DeviceInfo {
            id: device_id,
            name,
            physical_formats,
            preferred_frames: self.preferred_frames,
            auto_exclusive: false,
        })
    }

    fn probe_physical_formats(&mut self) -> Result<Vec<PhysicalFormat>, BackendError> {
        self.ensure_open()?;
        let Some(stream_id) = self.stream_id else {
            return Ok(Vec::new());
        };

        let ranged: Vec<AudioStreamRangedDescription> = get_property_array(
            stream_id,
            K_AUDIO_STREAM_PROPERTY_AVAILABLE_PHYSICAL_FORMATS,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        )
        .map_err(|status| BackendError::Call(format!("available physical formats (status {})", status)))?;

        let formats: Vec<PhysicalFormat> = ranged
            .iter()
            .filter_map(|desc| desc.format.to_physical())
            .collect();
        log::debug!("Stream {} reports {} physical formats", stream_id, formats.len());
        Ok(formats)
    }

    fn configure_pcm(&mut self, format: &AudioFormat) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.set_sample_rate(format.sample_rate as f64);

        let unit = self.ensure_audio_unit()?;
        let asbd = AudioStreamBasicDescription::interleaved_pcm(format);
        let status = unsafe {
            AudioUnitSetProperty(
                unit,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &asbd as *const _ as *const c_void,
                mem::size_of::<AudioStreamBasicDescription>() as u32,
            )
        };
        if status != NO_ERR {
            return Err(BackendError::FormatRejected(format!("{} (status {})", format, status)));
        }

        self.pcm_format = Some(*format);
        log::debug!("Output unit stream format: {}", format);
        Ok(())
    }

    fn configure_physical_format(&mut self, format: &PhysicalFormat) -> Result<(), BackendError> {
        self.ensure_open()?;
        let Some(stream_id) = self.stream_id else {
            return Err(BackendError::FormatRejected("device has no output stream".into()));
        };

        let ranged: Vec<AudioStreamRangedDescription> = get_property_array(
            stream_id,
            K_AUDIO_STREAM_PROPERTY_AVAILABLE_PHYSICAL_FORMATS,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        )
        .unwrap_or_default();
        let Some(asbd) = ranged
            .iter()
            .map(|desc| desc.format)
            .find(|desc| desc.to_physical().as_ref() == Some(format))
        else {
            return Err(BackendError::FormatRejected(format.to_string()));
        };

        if self.original_physical.is_none() {
            self.original_physical = get_property(
                stream_id,
                K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT,
                K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            )
            .ok();
        }

        let status = set_property(
            stream_id,
            K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            &asbd,
        );
        if status != NO_ERR {
            return Err(BackendError::FormatRejected(format!("{} (status {})", format, status)));
        }

        self.physical_format = Some(*format);
        log::info!("Physical stream locked to {}", format);
        Ok(())
    }

    fn auto_exclusive(&self) -> bool {
        false
    }

    fn acquire_exclusive(&mut self) -> Result<(), BackendError> {
        self.ensure_open()?;
        if self.hog_acquired {
            return Ok(());
        }

        let pid = unsafe { libc::getpid() };
        let owner: i32 = get_property(
            self.device_id,
            K_AUDIO_DEVICE_PROPERTY_HOG_MODE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
        )
        .unwrap_or(HOG_FREE);

        if owner == pid {
            self.hog_acquired = true;
            return Ok(());
        }
        if owner != HOG_FREE {
            return Err(BackendError::Call(format!("device hogged by pid {}", owner)));
        }

        check(self.set_hog(pid), "acquire hog mode")?;
        self.hog_acquired = true;
        log::info!("Acquired exclusive (hog) mode");
        Ok(())
    }

    fn release_exclusive(&mut self) {
        if !self.hog_acquired {
            return;
        }
        let status = self.set_hog(HOG_FREE);
        if status != NO_ERR {
            log::warn!("Failed to release hog mode (status {})", status);
        }
        self.hog_acquired = false;
    }

    fn preferred_frames(&self) -> u32 {
        self.preferred_frames
    }

    fn register_pull_callback(
        &mut self,
        path: OutputPath,
        callback: PullCallback,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        if self.running {
            self.stop()?;
        }
        self.destroy_io_proc();

        let bytes_per_frame = match path {
            OutputPath::Physical => self.physical_format.map(|f| f.bytes_per_frame()),
            OutputPath::Generic => self.pcm_format.map(|f| f.bytes_per_frame()),
        }
        .ok_or(BackendError::NotOpen)?;

        let mut context = Box::new(CallbackContext {
            callback,
            latch: HaltLatch::new(),
            bytes_per_frame,
        });
        let context_ptr = context.as_mut() as *mut CallbackContext as *mut c_void;

        match path {
            OutputPath::Generic => {
                let unit = self.ensure_audio_unit()?;
                let callback_struct = AURenderCallbackStruct {
                    input_proc: render_callback,
                    input_proc_ref_con: context_ptr,
                };
                check(
                    unsafe {
                        AudioUnitSetProperty(
                            unit,
                            K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
                            K_AUDIO_UNIT_SCOPE_INPUT,
                            0,
                            &callback_struct as *const _ as *const c_void,
                            mem::size_of::<AURenderCallbackStruct>() as u32,
                        )
                    },
                    "set render callback",
                )?;
                check(unsafe { AudioUnitInitialize(unit) }, "AudioUnitInitialize")?;
            }
            OutputPath::Physical => {
                let mut proc_id: AudioDeviceIOProcID = ptr::null_mut();
                check(
                    unsafe {
                        AudioDeviceCreateIOProcID(
                            self.device_id,
                            Some(io_proc),
                            context_ptr,
                            &mut proc_id,
                        )
                    },
                    "AudioDeviceCreateIOProcID",
                )?;
                self.io_proc_id = proc_id;
            }
        }

        // Box 的堆地址在移动后不变，回调持有的指针保持有效
        self.context = Some(context);
        self.path = Some(path);
        Ok(())
    }

    fn start(&mut self) -> Result<(), BackendError> {
        let Some(context) = self.context.as_ref() else {
            return Err(BackendError::NotOpen);
        };
        context.latch.rearm();

        if self.running {
            return Ok(());
        }

        match self.path {
            Some(OutputPath::Physical) => check(
                unsafe { AudioDeviceStart(self.device_id, self.io_proc_id) },
                "AudioDeviceStart",
            )?,
            _ => check(unsafe { AudioOutputUnitStart(self.audio_unit) }, "AudioOutputUnitStart")?,
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        if !self.running {
            return Ok(());
        }

        // 两个 Stop 调用都等待正在执行的回调返回
        match self.path {
            Some(OutputPath::Physical) => check(
                unsafe { AudioDeviceStop(self.device_id, self.io_proc_id) },
                "AudioDeviceStop",
            )?,
            _ => check(unsafe { AudioOutputUnitStop(self.audio_unit) }, "AudioOutputUnitStop")?,
        }
        self.running = false;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), BackendError> {
        let volume = volume.clamp(0.0, 1.0);
        if !self.audio_unit.is_null() {
            check(
                unsafe {
                    AudioUnitSetParameter(
                        self.audio_unit,
                        K_HAL_OUTPUT_PARAM_VOLUME,
                        K_AUDIO_UNIT_SCOPE_GLOBAL,
                        0,
                        volume,
                        0,
                    )
                },
                "set output volume",
            )?;
        }
        self.volume = volume;
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn close(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop output: {}", e);
        }
        self.destroy_io_proc();
        self.dispose_audio_unit();
        // 回调已经不可能再被调用
        self.context = None;
        self.path = None;

        if let (Some(stream_id), Some(original)) = (self.stream_id, self.original_physical.take()) {
            let status = set_property(
                stream_id,
                K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT,
                K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
                &original,
            );
            if status != NO_ERR {
                log::warn!("Failed to restore physical format (status {})", status);
            }
        }
        self.release_exclusive();
        if let Some(rate) = self.original_sample_rate.take() {
            self.set_sample_rate(rate);
            self.original_sample_rate = None;
        }

        self.pcm_format = None;
        self.physical_format = None;
        if self.device_id != 0 {
            log::info!("Output device {} closed", self.device_id);
        }
        self.device_id = 0;
        self.stream_id = None;
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_mapping() {
        let asbd = AudioStreamBasicDescription {
            sample_rate: 48000.0,
            format_id: K_AUDIO_FORMAT_60958_AC3,
            format_flags: 0,
            bytes_per_packet: 6144,
            frames_per_packet: 1536,
            bytes_per_frame: 0,
            channels_per_frame: 2,
            bits_per_channel: 16,
            reserved: 0,
        };
        let physical = asbd.to_physical().unwrap();
        assert_eq!(physical.codec, Codec::Ac3);
        assert_eq!(physical.bytes_per_frame(), 4);

        let unknown = AudioStreamBasicDescription {
            format_id: 0x61616320, // 'aac '
            ..asbd
        };
        assert!(unknown.to_physical().is_none());
    }

    #[test]
    fn test_interleaved_float_description() {
        let asbd = AudioStreamBasicDescription::interleaved_pcm(&AudioFormat::float32(48000, 2));
        assert_eq!(asbd.format_id, K_AUDIO_FORMAT_LINEAR_PCM);
        assert_ne!(asbd.format_flags & K_AUDIO_FORMAT_FLAG_IS_FLOAT, 0);
        assert_eq!(asbd.bytes_per_frame, 8);
        assert_eq!(asbd.bits_per_channel, 32);
    }

    #[test]
    fn test_halt_latch() {
        let latch = HaltLatch::new();
        let seen = latch.snapshot();
        assert!(latch.halt(seen));
        assert!(HaltLatch::is_halted(latch.snapshot()));

        latch.rearm();
        assert!(!HaltLatch::is_halted(latch.snapshot()));
    }

    #[test]
    fn test_start_during_callback_cancels_halt() {
        let latch = HaltLatch::new();
        // 回调开始
        let seen = latch.snapshot();
        // 回调返回 Pause 之前，生产者已经 resume -> start
        latch.rearm();
        // 迟到的暂停不生效
        assert!(!latch.halt(seen));
        assert!(!HaltLatch::is_halted(latch.snapshot()));

        // 下一次回调正常暂停
        let seen = latch.snapshot();
        assert!(latch.halt(seen));
        assert!(HaltLatch::is_halted(latch.snapshot()));
    }

    #[test]
    #[ignore] // 需要音频设备
    fn test_open_default_device() {
        let mut backend = CoreAudioBackend::new();
        let info = backend.open(None).unwrap();
        println!("Device: {:?}", info);
        assert!(info.preferred_frames > 0);
        backend.close();
    }
}
