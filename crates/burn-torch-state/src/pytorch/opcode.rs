// https://github.com/python/cpython/blob/main/Lib/pickletools.py
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    // Framing
    Proto = 0x80,
    Frame = 0x95,
    Stop = b'.',

    // Stack manipulation
    Mark = b'(',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',

    // Containers
    EmptyDict = b'}',
    EmptyList = b']',
    EmptyTuple = b')',
    EmptySet = 0x8f,
    Dict = b'd',
    List = b'l',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    FrozenSet = 0x91,
    AddItems = 0x90,
    Append = b'a',
    Appends = b'e',
    SetItem = b's',
    SetItems = b'u',

    // Scalars
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long1 = 0x8a,
    Long4 = 0x8b,
    BinFloat = b'G',
    Float = b'F',
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,

    // Strings and bytes
    BinUnicode = b'X',
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    BinString = b'T',
    ShortBinString = b'U',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    BinBytes8 = 0x8e,
    ByteArray8 = 0x96,

    // Objects
    Global = b'c',
    StackGlobal = 0x93,
    Reduce = b'R',
    NewObj = 0x81,
    Build = b'b',
    BinPersId = b'Q',

    // Memo
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    Memoize = 0x94,
    Get = b'g',
    BinGet = b'h',
    LongBinGet = b'j',
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x80 => Self::Proto,
            0x95 => Self::Frame,
            b'.' => Self::Stop,
            b'(' => Self::Mark,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'}' => Self::EmptyDict,
            b']' => Self::EmptyList,
            b')' => Self::EmptyTuple,
            0x8f => Self::EmptySet,
            b'd' => Self::Dict,
            b'l' => Self::List,
            b't' => Self::Tuple,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            0x91 => Self::FrozenSet,
            0x90 => Self::AddItems,
            b'a' => Self::Append,
            b'e' => Self::Appends,
            b's' => Self::SetItem,
            b'u' => Self::SetItems,
            b'I' => Self::Int,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'M' => Self::BinInt2,
            0x8a => Self::Long1,
            0x8b => Self::Long4,
            b'G' => Self::BinFloat,
            b'F' => Self::Float,
            b'N' => Self::None,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            b'X' => Self::BinUnicode,
            0x8c => Self::ShortBinUnicode,
            0x8d => Self::BinUnicode8,
            b'T' => Self::BinString,
            b'U' => Self::ShortBinString,
            b'B' => Self::BinBytes,
            b'C' => Self::ShortBinBytes,
            0x8e => Self::BinBytes8,
            0x96 => Self::ByteArray8,
            b'c' => Self::Global,
            0x93 => Self::StackGlobal,
            b'R' => Self::Reduce,
            0x81 => Self::NewObj,
            b'b' => Self::Build,
            b'Q' => Self::BinPersId,
            b'p' => Self::Put,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            0x94 => Self::Memoize,
            b'g' => Self::Get,
            b'h' => Self::BinGet,
            b'j' => Self::LongBinGet,
            value => return Err(value),
        })
    }
}

/// Highest pickle protocol the decoder understands.
pub const HIGHEST_PROTOCOL: u8 = 5;
