//! 过程变量取值模型及其线上编码。

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CaError, Result};

/// 定长字符串元素的字节数（含结尾 NUL）。
pub const MAX_STRING_SIZE: usize = 40;

/// 读取/事件回复在值之前携带的元数据字节数：status、severity、秒、纳秒。
pub const READING_META_SIZE: usize = 12;

/// 元素类型。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DbrType {
    String,
    Short,
    Float,
    Enum,
    Char,
    Long,
    Double,
}

impl DbrType {
    pub fn code(self) -> u16 {
        match self {
            DbrType::String => 0,
            DbrType::Short => 1,
            DbrType::Float => 2,
            DbrType::Enum => 3,
            DbrType::Char => 4,
            DbrType::Long => 5,
            DbrType::Double => 6,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => DbrType::String,
            1 => DbrType::Short,
            2 => DbrType::Float,
            3 => DbrType::Enum,
            4 => DbrType::Char,
            5 => DbrType::Long,
            6 => DbrType::Double,
            other => return Err(CaError::malformed(format!("unknown data type {other}"))),
        })
    }

    /// 单个元素的编码字节数。
    pub fn element_size(self) -> usize {
        match self {
            DbrType::String => MAX_STRING_SIZE,
            DbrType::Short | DbrType::Enum => 2,
            DbrType::Float | DbrType::Long => 4,
            DbrType::Char => 1,
            DbrType::Double => 8,
        }
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbrType::String => "STRING",
            DbrType::Short => "SHORT",
            DbrType::Float => "FLOAT",
            DbrType::Enum => "ENUM",
            DbrType::Char => "CHAR",
            DbrType::Long => "LONG",
            DbrType::Double => "DOUBLE",
        };
        f.write_str(name)
    }
}

/// 一组同类型元素。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Strings(Vec<String>),
    Shorts(Vec<i16>),
    Floats(Vec<f32>),
    Enums(Vec<u16>),
    Chars(Vec<u8>),
    Longs(Vec<i32>),
    Doubles(Vec<f64>),
}

impl Value {
    pub fn dbr_type(&self) -> DbrType {
        match self {
            Value::Strings(_) => DbrType::String,
            Value::Shorts(_) => DbrType::Short,
            Value::Floats(_) => DbrType::Float,
            Value::Enums(_) => DbrType::Enum,
            Value::Chars(_) => DbrType::Char,
            Value::Longs(_) => DbrType::Long,
            Value::Doubles(_) => DbrType::Double,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Value::Strings(v) => v.len(),
            Value::Shorts(v) => v.len(),
            Value::Floats(v) => v.len(),
            Value::Enums(v) => v.len(),
            Value::Chars(v) => v.len(),
            Value::Longs(v) => v.len(),
            Value::Doubles(v) => v.len(),
        }
    }

    /// 编码后的字节数（不含填充）。
    pub fn encoded_len(&self) -> usize {
        self.count() * self.dbr_type().element_size()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        match self {
            Value::Strings(items) => {
                for item in items {
                    put_fixed_string(dst, item);
                }
            }
            Value::Shorts(items) => items.iter().for_each(|v| dst.put_i16(*v)),
            Value::Floats(items) => items.iter().for_each(|v| dst.put_f32(*v)),
            Value::Enums(items) => items.iter().for_each(|v| dst.put_u16(*v)),
            Value::Chars(items) => dst.put_slice(items),
            Value::Longs(items) => items.iter().for_each(|v| dst.put_i32(*v)),
            Value::Doubles(items) => items.iter().for_each(|v| dst.put_f64(*v)),
        }
    }

    /// 从 `src` 解码 `count` 个 `dbr` 类型的元素。
    pub fn decode(dbr: DbrType, count: usize, src: &mut impl Buf) -> Result<Self> {
        let needed = count
            .checked_mul(dbr.element_size())
            .ok_or_else(|| CaError::malformed("element count overflows"))?;
        if src.remaining() < needed {
            return Err(CaError::malformed(format!(
                "{count} {dbr} elements need {needed} bytes, {} available",
                src.remaining()
            )));
        }
        Ok(match dbr {
            DbrType::String => Value::Strings(
                (0..count)
                    .map(|_| take_fixed_string(src))
                    .collect::<Result<_>>()?,
            ),
            DbrType::Short => Value::Shorts((0..count).map(|_| src.get_i16()).collect()),
            DbrType::Float => Value::Floats((0..count).map(|_| src.get_f32()).collect()),
            DbrType::Enum => Value::Enums((0..count).map(|_| src.get_u16()).collect()),
            DbrType::Char => {
                let mut bytes = vec![0; count];
                src.copy_to_slice(&mut bytes);
                Value::Chars(bytes)
            }
            DbrType::Long => Value::Longs((0..count).map(|_| src.get_i32()).collect()),
            DbrType::Double => Value::Doubles((0..count).map(|_| src.get_f64()).collect()),
        })
    }

    /// 首元素按 `f64` 解释；字符串尝试数值解析。
    pub fn first_as_f64(&self) -> Option<f64> {
        match self {
            Value::Strings(v) => v.first()?.trim().parse().ok(),
            Value::Shorts(v) => v.first().map(|x| f64::from(*x)),
            Value::Floats(v) => v.first().map(|x| f64::from(*x)),
            Value::Enums(v) => v.first().map(|x| f64::from(*x)),
            Value::Chars(v) => v.first().map(|x| f64::from(*x)),
            Value::Longs(v) => v.first().map(|x| f64::from(*x)),
            Value::Doubles(v) => v.first().copied(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Value::Strings(v) => join(f, v),
            Value::Shorts(v) => join(f, v),
            Value::Floats(v) => join(f, v),
            Value::Enums(v) => join(f, v),
            Value::Chars(v) => join(f, v),
            Value::Longs(v) => join(f, v),
            Value::Doubles(v) => join(f, v),
        }
    }
}

fn put_fixed_string(dst: &mut BytesMut, value: &str) {
    let mut end = value.len().min(MAX_STRING_SIZE - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    dst.put_slice(&value.as_bytes()[..end]);
    dst.put_bytes(0, MAX_STRING_SIZE - end);
}

fn take_fixed_string(src: &mut impl Buf) -> Result<String> {
    let mut raw = [0u8; MAX_STRING_SIZE];
    src.copy_to_slice(&mut raw);
    let end = raw.iter().position(|b| *b == 0).unwrap_or(MAX_STRING_SIZE);
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| CaError::malformed("string element is not valid utf-8"))
}

/// 报警条件码。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct AlarmStatus(pub u16);

impl AlarmStatus {
    pub const NO_ALARM: AlarmStatus = AlarmStatus(0);
    pub const READ: AlarmStatus = AlarmStatus(1);
    pub const WRITE: AlarmStatus = AlarmStatus(2);
    pub const HIHI: AlarmStatus = AlarmStatus(3);
    pub const HIGH: AlarmStatus = AlarmStatus(4);
    pub const LOLO: AlarmStatus = AlarmStatus(5);
    pub const LOW: AlarmStatus = AlarmStatus(6);
    pub const STATE: AlarmStatus = AlarmStatus(7);
    pub const COS: AlarmStatus = AlarmStatus(8);
    pub const COMM: AlarmStatus = AlarmStatus(9);
    pub const TIMEOUT: AlarmStatus = AlarmStatus(10);
    pub const HW_LIMIT: AlarmStatus = AlarmStatus(11);
    pub const CALC: AlarmStatus = AlarmStatus(12);
    pub const SCAN: AlarmStatus = AlarmStatus(13);
    pub const LINK: AlarmStatus = AlarmStatus(14);
    pub const SOFT: AlarmStatus = AlarmStatus(15);
    pub const BAD_SUB: AlarmStatus = AlarmStatus(16);
    pub const UDF: AlarmStatus = AlarmStatus(17);
    pub const DISABLE: AlarmStatus = AlarmStatus(18);
    pub const SIMM: AlarmStatus = AlarmStatus(19);
    pub const READ_ACCESS: AlarmStatus = AlarmStatus(20);
    pub const WRITE_ACCESS: AlarmStatus = AlarmStatus(21);

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 22] = [
            "NO_ALARM", "READ", "WRITE", "HIHI", "HIGH", "LOLO", "LOW", "STATE", "COS", "COMM",
            "TIMEOUT", "HWLIMIT", "CALC", "SCAN", "LINK", "SOFT", "BAD_SUB", "UDF", "DISABLE",
            "SIMM", "READ_ACCESS", "WRITE_ACCESS",
        ];
        NAMES.get(usize::from(self.0)).copied().unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 报警严重度。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AlarmSeverity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

impl AlarmSeverity {
    pub fn code(self) -> u16 {
        match self {
            AlarmSeverity::NoAlarm => 0,
            AlarmSeverity::Minor => 1,
            AlarmSeverity::Major => 2,
            AlarmSeverity::Invalid => 3,
        }
    }

    /// 未知取值一律视为 `Invalid`。
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => AlarmSeverity::NoAlarm,
            1 => AlarmSeverity::Minor,
            2 => AlarmSeverity::Major,
            _ => AlarmSeverity::Invalid,
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmSeverity::NoAlarm => "NO_ALARM",
            AlarmSeverity::Minor => "MINOR",
            AlarmSeverity::Major => "MAJOR",
            AlarmSeverity::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// 自 1990-01-01 UTC 起的秒数与纳秒。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimeStamp {
    pub secs: u32,
    pub nanos: u32,
}

impl TimeStamp {
    /// 时间戳纪元相对 Unix 纪元的偏移秒数。
    pub const EPOCH_OFFSET_SECS: u64 = 631_152_000;

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH
            + Duration::from_secs(Self::EPOCH_OFFSET_SECS + u64::from(self.secs))
            + Duration::from_nanos(u64::from(self.nanos))
    }

    /// 早于纪元或超出表示范围时返回 `None`。
    pub fn from_system_time(time: SystemTime) -> Option<Self> {
        let since_unix = time.duration_since(UNIX_EPOCH).ok()?;
        let secs = since_unix.as_secs().checked_sub(Self::EPOCH_OFFSET_SECS)?;
        Some(Self {
            secs: u32::try_from(secs).ok()?,
            nanos: since_unix.subsec_nanos(),
        })
    }
}

/// 带报警与时间戳的一次取值。
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub stamp: TimeStamp,
}

impl Reading {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            status: AlarmStatus::NO_ALARM,
            severity: AlarmSeverity::NoAlarm,
            stamp: TimeStamp::default(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        READING_META_SIZE + self.value.encoded_len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.status.0);
        dst.put_u16(self.severity.code());
        dst.put_u32(self.stamp.secs);
        dst.put_u32(self.stamp.nanos);
        self.value.encode(dst);
    }

    pub fn decode(dbr: DbrType, count: usize, src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < READING_META_SIZE {
            return Err(CaError::malformed("reading metadata truncated"));
        }
        let status = AlarmStatus(src.get_u16());
        let severity = AlarmSeverity::from_code(src.get_u16());
        let stamp = TimeStamp {
            secs: src.get_u32(),
            nanos: src.get_u32(),
        };
        let value = Value::decode(dbr, count, src)?;
        Ok(Self {
            value,
            status,
            severity,
            stamp,
        })
    }
}

/// 控制元数据视图在线上的数据类型码（双精度控制视图）。
pub const CONTROL_DATA_TYPE: u16 = 34;

/// 工程单位字段的定长字节数（含结尾 NUL）。
pub const MAX_UNITS_SIZE: usize = 8;

/// 一对上下限。
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Limits {
    pub lower: f64,
    pub upper: f64,
}

impl Limits {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// 两端都为 0 表示服务器未配置该范围。
    pub fn is_unset(self) -> bool {
        self.lower == 0.0 && self.upper == 0.0
    }
}

/// 通道的工程单位、显示精度与各级上下限。
///
/// 线上布局（88 字节，大端）：`status u16`、`severity u16`、`precision i16`、2 字节填充、
/// 8 字节单位、依次为显示上/下限、报警上限、警告上限、警告下限、报警下限、控制上/下限
/// 共 8 个 `f64`，最后是一个 `f64` 当前值。当前值与报警状态不在此处保留。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlInfo {
    pub units: String,
    pub precision: i16,
    /// 显示（图形）范围。
    pub display: Limits,
    pub alarm: Limits,
    pub warning: Limits,
    pub control: Limits,
}

impl ControlInfo {
    pub const ENCODED_LEN: usize = 88;

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::ENCODED_LEN);
        dst.put_u16(AlarmStatus::NO_ALARM.0);
        dst.put_u16(AlarmSeverity::NoAlarm.code());
        dst.put_i16(self.precision);
        dst.put_u16(0);
        let mut end = self.units.len().min(MAX_UNITS_SIZE - 1);
        while !self.units.is_char_boundary(end) {
            end -= 1;
        }
        dst.put_slice(&self.units.as_bytes()[..end]);
        dst.put_bytes(0, MAX_UNITS_SIZE - end);
        for limit in [
            self.display.upper,
            self.display.lower,
            self.alarm.upper,
            self.warning.upper,
            self.warning.lower,
            self.alarm.lower,
            self.control.upper,
            self.control.lower,
            0.0,
        ] {
            dst.put_f64(limit);
        }
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < Self::ENCODED_LEN {
            return Err(CaError::malformed("control metadata truncated"));
        }
        src.advance(4);
        let precision = src.get_i16();
        src.advance(2);
        let mut raw = [0u8; MAX_UNITS_SIZE];
        src.copy_to_slice(&mut raw);
        let end = raw.iter().position(|b| *b == 0).unwrap_or(MAX_UNITS_SIZE);
        let units = String::from_utf8(raw[..end].to_vec())
            .map_err(|_| CaError::malformed("units are not valid utf-8"))?;
        let display_upper = src.get_f64();
        let display_lower = src.get_f64();
        let alarm_upper = src.get_f64();
        let warning_upper = src.get_f64();
        let warning_lower = src.get_f64();
        let alarm_lower = src.get_f64();
        let control_upper = src.get_f64();
        let control_lower = src.get_f64();
        src.advance(8);
        Ok(Self {
            units,
            precision,
            display: Limits::new(display_lower, display_upper),
            alarm: Limits::new(alarm_lower, alarm_upper),
            warning: Limits::new(warning_lower, warning_upper),
            control: Limits::new(control_lower, control_upper),
        })
    }
}

/// 订阅的事件过滤掩码。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventMask(u16);

impl EventMask {
    pub const VALUE: EventMask = EventMask(1);
    pub const LOG: EventMask = EventMask(2);
    pub const ALARM: EventMask = EventMask(4);
    pub const PROPERTY: EventMask = EventMask(8);

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// 丢弃未定义的位。
    pub const fn from_bits_truncate(bits: u16) -> Self {
        EventMask(bits & 0x0f)
    }

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::VALUE | EventMask::ALARM
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}
