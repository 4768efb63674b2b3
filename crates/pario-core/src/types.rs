use crate::error::{PioError, Result};

/// Closed primitive type set handled by the library.
///
/// `Long` is a reserved internal tag used transiently during type
/// conversion; `Nat` ("not a type") means "use the variable's declared
/// on-disk type".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PioType {
    #[default]
    Nat = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Float = 5,
    Double = 6,
    UByte = 7,
    UShort = 8,
    UInt = 9,
    Int64 = 10,
    UInt64 = 11,
    /// Platform long; never stored on disk.
    Long = 12,
}

/// Default fill values matching the classic container conventions.
pub const FILL_BYTE: i8 = -127;
pub const FILL_CHAR: u8 = 0;
pub const FILL_SHORT: i16 = -32767;
pub const FILL_INT: i32 = -2147483647;
pub const FILL_FLOAT: f32 = 9.9692099683868690e36;
pub const FILL_DOUBLE: f64 = 9.9692099683868690e36;
pub const FILL_UBYTE: u8 = 255;
pub const FILL_USHORT: u16 = 65535;
pub const FILL_UINT: u32 = 4294967295;
pub const FILL_INT64: i64 = -9223372036854775806;
pub const FILL_UINT64: u64 = 18446744073709551614;

impl PioType {
    pub fn from_i32(v: i32) -> Result<PioType> {
        match v {
            0 => Ok(PioType::Nat),
            1 => Ok(PioType::Byte),
            2 => Ok(PioType::Char),
            3 => Ok(PioType::Short),
            4 => Ok(PioType::Int),
            5 => Ok(PioType::Float),
            6 => Ok(PioType::Double),
            7 => Ok(PioType::UByte),
            8 => Ok(PioType::UShort),
            9 => Ok(PioType::UInt),
            10 => Ok(PioType::Int64),
            11 => Ok(PioType::UInt64),
            12 => Ok(PioType::Long),
            _ => Err(PioError::BadType),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PioType::Nat => "nat",
            PioType::Byte => "byte",
            PioType::Char => "char",
            PioType::Short => "short",
            PioType::Int => "int",
            PioType::Float => "float",
            PioType::Double => "double",
            PioType::UByte => "ubyte",
            PioType::UShort => "ushort",
            PioType::UInt => "uint",
            PioType::Int64 => "int64",
            PioType::UInt64 => "uint64",
            PioType::Long => "long",
        }
    }

    /// Size of one element in the on-disk representation. This is fixed by
    /// the storage format, independent of host layout: a "short" is always
    /// 2 bytes on disk.
    pub fn disk_size(self) -> Result<usize> {
        match self {
            PioType::Byte | PioType::Char | PioType::UByte => Ok(1),
            PioType::Short | PioType::UShort => Ok(2),
            PioType::Int | PioType::UInt | PioType::Float => Ok(4),
            PioType::Double | PioType::Int64 | PioType::UInt64 => Ok(8),
            PioType::Long => Ok(8),
            PioType::Nat => Err(PioError::BadType),
        }
    }

    /// Size of one element in host memory. The memory layouts used by the
    /// public API are the fixed-width Rust primitives, so this matches the
    /// disk size on every supported host.
    pub fn mem_size(self) -> Result<usize> {
        match self {
            PioType::Long => Ok(std::mem::size_of::<libc::c_long>()),
            t => t.disk_size(),
        }
    }

    /// True for the integer family (signed or unsigned).
    pub fn is_integer(self) -> bool {
        !matches!(self, PioType::Float | PioType::Double | PioType::Nat)
    }

    /// The MPI datatype corresponding to this primitive.
    #[cfg(feature = "mpi")]
    pub fn mpi_datatype(self) -> Result<mpi::datatype::SystemDatatype> {
        use mpi::traits::Equivalence;
        match self {
            PioType::Byte => Ok(i8::equivalent_datatype()),
            PioType::Char | PioType::UByte => Ok(u8::equivalent_datatype()),
            PioType::Short => Ok(i16::equivalent_datatype()),
            PioType::UShort => Ok(u16::equivalent_datatype()),
            PioType::Int => Ok(i32::equivalent_datatype()),
            PioType::UInt => Ok(u32::equivalent_datatype()),
            PioType::Float => Ok(f32::equivalent_datatype()),
            PioType::Double => Ok(f64::equivalent_datatype()),
            PioType::Int64 | PioType::Long => Ok(i64::equivalent_datatype()),
            PioType::UInt64 => Ok(u64::equivalent_datatype()),
            PioType::Nat => Err(PioError::BadType),
        }
    }

    /// Default fill value for this type, as native-endian element bytes.
    pub fn default_fill(self) -> Result<Vec<u8>> {
        match self {
            PioType::Byte => Ok(FILL_BYTE.to_ne_bytes().to_vec()),
            PioType::Char => Ok(vec![FILL_CHAR]),
            PioType::Short => Ok(FILL_SHORT.to_ne_bytes().to_vec()),
            PioType::Int => Ok(FILL_INT.to_ne_bytes().to_vec()),
            PioType::Float => Ok(FILL_FLOAT.to_ne_bytes().to_vec()),
            PioType::Double => Ok(FILL_DOUBLE.to_ne_bytes().to_vec()),
            PioType::UByte => Ok(vec![FILL_UBYTE]),
            PioType::UShort => Ok(FILL_USHORT.to_ne_bytes().to_vec()),
            PioType::UInt => Ok(FILL_UINT.to_ne_bytes().to_vec()),
            PioType::Int64 => Ok(FILL_INT64.to_ne_bytes().to_vec()),
            PioType::UInt64 => Ok(FILL_UINT64.to_ne_bytes().to_vec()),
            PioType::Long | PioType::Nat => Err(PioError::BadType),
        }
    }
}

/// Intermediate value used on the element conversion path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
}

/// Decode element `idx` of a native-endian buffer of type `ty`.
pub fn decode_element(buf: &[u8], ty: PioType, idx: usize) -> Result<Value> {
    let sz = ty.mem_size()?;
    let off = idx * sz;
    let b = buf.get(off..off + sz).ok_or(PioError::InvalidArgument)?;
    let v = match ty {
        PioType::Byte => Value::I64(i8::from_ne_bytes([b[0]]) as i64),
        PioType::Char | PioType::UByte => Value::U64(b[0] as u64),
        PioType::Short => Value::I64(i16::from_ne_bytes([b[0], b[1]]) as i64),
        PioType::UShort => Value::U64(u16::from_ne_bytes([b[0], b[1]]) as u64),
        PioType::Int => Value::I64(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as i64),
        PioType::UInt => Value::U64(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as u64),
        PioType::Float => Value::F64(f32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f64),
        PioType::Double => Value::F64(f64::from_ne_bytes(b.try_into().unwrap())),
        PioType::Int64 | PioType::Long => Value::I64(i64::from_ne_bytes(b.try_into().unwrap())),
        PioType::UInt64 => Value::U64(u64::from_ne_bytes(b.try_into().unwrap())),
        PioType::Nat => return Err(PioError::BadType),
    };
    Ok(v)
}

/// Append one value to a native-endian buffer of type `ty`.
pub fn encode_element(out: &mut Vec<u8>, ty: PioType, v: Value) -> Result<()> {
    let i = |v: Value| -> i64 {
        match v {
            Value::I64(x) => x,
            Value::U64(x) => x as i64,
            Value::F64(x) => x as i64,
        }
    };
    let u = |v: Value| -> u64 {
        match v {
            Value::I64(x) => x as u64,
            Value::U64(x) => x,
            Value::F64(x) => x as u64,
        }
    };
    let f = |v: Value| -> f64 {
        match v {
            Value::I64(x) => x as f64,
            Value::U64(x) => x as f64,
            Value::F64(x) => x,
        }
    };
    match ty {
        PioType::Byte => out.extend_from_slice(&(i(v) as i8).to_ne_bytes()),
        PioType::Char | PioType::UByte => out.push(u(v) as u8),
        PioType::Short => out.extend_from_slice(&(i(v) as i16).to_ne_bytes()),
        PioType::UShort => out.extend_from_slice(&(u(v) as u16).to_ne_bytes()),
        PioType::Int => out.extend_from_slice(&(i(v) as i32).to_ne_bytes()),
        PioType::UInt => out.extend_from_slice(&(u(v) as u32).to_ne_bytes()),
        PioType::Float => out.extend_from_slice(&(f(v) as f32).to_ne_bytes()),
        PioType::Double => out.extend_from_slice(&f(v).to_ne_bytes()),
        PioType::Int64 | PioType::Long => out.extend_from_slice(&i(v).to_ne_bytes()),
        PioType::UInt64 => out.extend_from_slice(&u(v).to_ne_bytes()),
        PioType::Nat => return Err(PioError::BadType),
    }
    Ok(())
}

/// Convert a whole buffer of native-endian `from`-typed elements to `to`.
///
/// Returns the input unchanged when the types already match.
pub fn convert_buffer(buf: &[u8], from: PioType, to: PioType) -> Result<Vec<u8>> {
    if from == to {
        return Ok(buf.to_vec());
    }
    let from_sz = from.mem_size()?;
    if buf.len() % from_sz != 0 {
        return Err(PioError::InvalidArgument);
    }
    let n = buf.len() / from_sz;
    let mut out = Vec::with_capacity(n * to.mem_size()?);
    for i in 0..n {
        let v = decode_element(buf, from, i)?;
        encode_element(&mut out, to, v)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(PioType::Short.disk_size().unwrap(), 2);
        assert_eq!(PioType::Int.disk_size().unwrap(), 4);
        assert_eq!(PioType::Double.disk_size().unwrap(), 8);
        assert_eq!(PioType::Char.disk_size().unwrap(), 1);
        assert!(PioType::Nat.disk_size().is_err());
    }

    #[test]
    fn test_from_i32_rejects_unknown() {
        assert!(PioType::from_i32(99).is_err());
        assert_eq!(PioType::from_i32(4).unwrap(), PioType::Int);
    }

    #[test]
    fn test_convert_int_to_double() {
        let ints: Vec<u8> = [1i32, -7, 42]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let out = convert_buffer(&ints, PioType::Int, PioType::Double).unwrap();
        assert_eq!(out.len(), 24);
        let d = f64::from_ne_bytes(out[8..16].try_into().unwrap());
        assert_eq!(d, -7.0);
    }

    #[test]
    fn test_convert_identity() {
        let data: Vec<u8> = vec![1, 2, 3, 4];
        assert_eq!(
            convert_buffer(&data, PioType::Int, PioType::Int).unwrap(),
            data
        );
    }

    #[test]
    fn test_convert_short_to_int64() {
        let shorts: Vec<u8> = [-3i16, 300].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let out = convert_buffer(&shorts, PioType::Short, PioType::Int64).unwrap();
        assert_eq!(i64::from_ne_bytes(out[0..8].try_into().unwrap()), -3);
        assert_eq!(i64::from_ne_bytes(out[8..16].try_into().unwrap()), 300);
    }

    #[test]
    fn test_default_fill_sizes_match() {
        for t in [
            PioType::Byte,
            PioType::Char,
            PioType::Short,
            PioType::Int,
            PioType::Float,
            PioType::Double,
            PioType::UByte,
            PioType::UShort,
            PioType::UInt,
            PioType::Int64,
            PioType::UInt64,
        ] {
            assert_eq!(t.default_fill().unwrap().len(), t.disk_size().unwrap());
        }
    }
}
