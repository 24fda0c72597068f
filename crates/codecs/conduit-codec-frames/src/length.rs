use bytes::{Buf, BufMut};

/// 大端无符号长度字段的宽度。
///
/// # 契约说明（What）
/// - 解码端（[`crate::FixedHeaderFilter`]）与编码端（[`crate::LengthPrefixEncoder`]）共享同一描述；
/// - 字段值只表示包体长度，不含字段自身。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LengthField {
    /// 1 字节长度。
    U8,
    /// 2 字节大端长度。
    U16,
    /// 4 字节大端长度。
    U32,
    /// 8 字节大端长度。
    U64,
}

impl LengthField {
    /// 字段占用的字节数。
    pub const fn width(self) -> usize {
        match self {
            LengthField::U8 => 1,
            LengthField::U16 => 2,
            LengthField::U32 => 4,
            LengthField::U64 => 8,
        }
    }

    /// 字段可表达的最大包体长度。
    pub const fn max_value(self) -> u64 {
        match self {
            LengthField::U8 => u8::MAX as u64,
            LengthField::U16 => u16::MAX as u64,
            LengthField::U32 => u32::MAX as u64,
            LengthField::U64 => u64::MAX,
        }
    }

    pub(crate) fn read(self, mut header: &[u8]) -> u64 {
        header.get_uint(self.width())
    }

    pub(crate) fn write(self, dst: &mut impl BufMut, value: u64) {
        dst.put_uint(value, self.width());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_follow_the_variant() {
        let widths: Vec<_> = [
            LengthField::U8,
            LengthField::U16,
            LengthField::U32,
            LengthField::U64,
        ]
        .into_iter()
        .map(LengthField::width)
        .collect();
        assert_eq!(widths, [1, 2, 4, 8]);
    }

    #[test]
    fn values_are_big_endian() {
        let mut buf = Vec::new();
        LengthField::U16.write(&mut buf, 0x0102);
        assert_eq!(buf, [0x01, 0x02]);
        assert_eq!(LengthField::U16.read(&buf), 0x0102);
        assert_eq!(LengthField::U32.read(&[0, 0, 1, 0]), 256);
    }
}
