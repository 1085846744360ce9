// The tagged machine word.
//
// Every memory cell and register holds one Value: a 32-bit payload
// plus a runtime type tag. Floats travel as their raw bit pattern, so
// a word survives any store/load sequence unchanged.
//
// Casts succeed iff the tag is in the allowed set for the cast. The
// Unknown tag is a wildcard: it permits bitwise reinterpretation, so
// images stripped of their debug type information still run.

use enumflags2::BitFlags;

use crate::error::{Error, ErrorKind, Result};


// Runtime type of a single word. The discriminants are bit flags so
// allowed-cast sets can be expressed as unions.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TypeTag {
    Unknown   = 0b0000001,
    Int       = 0b0000010,
    Bool      = 0b0000100,
    Float     = 0b0001000,
    StringId  = 0b0010000,
    CodeAddr  = 0b0100000,
    StackAddr = 0b1000000,
}

pub type TypeSet = BitFlags<TypeTag>;

impl TypeTag {
    // Persistent id used by Type debug symbols.
    pub fn id(self) -> i32 {
        match self {
            TypeTag::Unknown   => 0,
            TypeTag::Int       => 1,
            TypeTag::Bool      => 2,
            TypeTag::Float     => 3,
            TypeTag::StringId  => 4,
            TypeTag::CodeAddr  => 5,
            TypeTag::StackAddr => 6,
        }
    }

    pub fn from_id(id: i32) -> Result<TypeTag> {
        match id {
            0 => Ok(TypeTag::Unknown),
            1 => Ok(TypeTag::Int),
            2 => Ok(TypeTag::Bool),
            3 => Ok(TypeTag::Float),
            4 => Ok(TypeTag::StringId),
            5 => Ok(TypeTag::CodeAddr),
            6 => Ok(TypeTag::StackAddr),
            id => Err(Error::new(
                ErrorKind::MalformedInstruction,
                format!("unknown type tag id {}", id),
            )),
        }
    }

    // The zero word of this type, used by PUSH to initialize frame
    // slots.
    pub fn zero(self) -> Value {
        Value::from_bits(self, 0)
    }
}


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Unknown(i32),
    Int(i32),
    Bool(bool),
    Float(f32),
    StringId(i32),
    CodeAddr(i32),
    StackAddr(i32),
}

// Construct a TypeMismatch from the expected set and the actual word.
pub(crate) fn expected(expect: TypeSet, got: &Value) -> Error {
    Error::new(
        ErrorKind::TypeMismatch,
        format!("expected {:?}, got {:?}", expect, got.tag()),
    )
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Unknown(_)   => TypeTag::Unknown,
            Value::Int(_)       => TypeTag::Int,
            Value::Bool(_)      => TypeTag::Bool,
            Value::Float(_)     => TypeTag::Float,
            Value::StringId(_)  => TypeTag::StringId,
            Value::CodeAddr(_)  => TypeTag::CodeAddr,
            Value::StackAddr(_) => TypeTag::StackAddr,
        }
    }

    // The raw 32-bit payload, regardless of tag.
    pub fn bits(&self) -> i32 {
        match *self {
            Value::Unknown(v)   => v,
            Value::Int(v)       => v,
            Value::Bool(v)      => v as i32,
            Value::Float(v)     => v.to_bits() as i32,
            Value::StringId(v)  => v,
            Value::CodeAddr(v)  => v,
            Value::StackAddr(v) => v,
        }
    }

    pub fn from_bits(tag: TypeTag, bits: i32) -> Value {
        match tag {
            TypeTag::Unknown   => Value::Unknown(bits),
            TypeTag::Int       => Value::Int(bits),
            TypeTag::Bool      => Value::Bool(bits != 0),
            TypeTag::Float     => Value::Float(f32::from_bits(bits as u32)),
            TypeTag::StringId  => Value::StringId(bits),
            TypeTag::CodeAddr  => Value::CodeAddr(bits),
            TypeTag::StackAddr => Value::StackAddr(bits),
        }
    }

    // Reinterpret the payload as an integer. Allowed for every tag
    // that stores its payload verbatim; floats must convert through
    // the float2int primitive instead.
    pub fn as_int(&self) -> Result<i32> {
        match self {
            Value::Float(_) => Err(expected(
                TypeTag::Int
                    | TypeTag::Bool
                    | TypeTag::StringId
                    | TypeTag::CodeAddr
                    | TypeTag::StackAddr,
                self,
            )),
            v => Ok(v.bits()),
        }
    }

    pub fn as_float(&self) -> Result<f32> {
        match *self {
            Value::Float(v) => Ok(v),
            Value::Unknown(v) => Ok(f32::from_bits(v as u32)),
            ref v => Err(expected(BitFlags::from_flag(TypeTag::Float), v)),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Value::Bool(v) => Ok(v),
            Value::Unknown(0) => Ok(false),
            Value::Unknown(1) => Ok(true),
            ref v => Err(expected(BitFlags::from_flag(TypeTag::Bool), v)),
        }
    }
}
