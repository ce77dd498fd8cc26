//! Serde [Serializer][ser::Serializer] producing Solidity ABI encoded data.
//!
//! Encoding happens in two steps: The value is first serialized into a tree
//! of [Token]s, which knows about the static/dynamic nature of each member.
//! The tree is then flattened into 32 byte slots using the head/tail layout
//! of the ABI specification and handed to a [Writer].
//!
//! Mapping of serde data model to Solidity types:
//! - `bool`, unsigned and signed integers: `uintN`/`intN` (one slot)
//! - `serialize_bytes` with up to 32 bytes: `bytesN` (left aligned), used by
//!   [Hash][super::types::Hash], [U256][super::types::U256] and
//!   [Address][super::types::Address] (which pre-aligns itself)
//! - `str` and fields marked with [as_bytes][super::as_bytes]: `bytes`
//! - sequences (`Vec<T>`, slices): `T[]`
//! - tuples and fixed-size arrays: `T[N]` / tuple
//! - structs: tuple
//!
//! Enums, maps, floats and `Option` have no canonical representation and
//! return [Error::TypeNotRepresentable].

use super::error::{Error, Result};
use serde::{
    ser::{self, Impossible, SerializeSeq, SerializeStruct, SerializeTuple, SerializeTupleStruct},
    Serialize,
};

/// Size of a single ABI slot.
pub const SLOT_SIZE: usize = 32;

/// Name of the newtype struct used by [as_bytes][super::as_bytes] to mark its
/// content as dynamic `bytes`. The characters have no special meaning, they
/// have just been chosen in a way that normal Rust types will never have this
/// name.
pub(super) const MARK_DYNAMIC_BYTES: &str = ":$&_DYNAMIC_BYTES";

/// Receives the encoded output one slot at a time.
pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, slot: &[u8]) {
        self.extend_from_slice(slot);
    }
}

/// Intermediate representation of a serialized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A single, already aligned, slot.
    Word([u8; SLOT_SIZE]),
    /// Dynamic `bytes` or `string`.
    Bytes(Vec<u8>),
    /// Dynamic length array `T[]`.
    Array(Vec<Token>),
    /// Struct or fixed-size array, dynamic if any member is dynamic.
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Word(_) => false,
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(members) => members.iter().any(Token::is_dynamic),
        }
    }

    /// Size of the head of this token when embedded in a tuple.
    fn head_size(&self) -> usize {
        match self {
            Token::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(Token::head_size).sum()
            }
            _ => SLOT_SIZE,
        }
    }

    /// Number of bytes written by [Token::write_content].
    fn content_size(&self) -> usize {
        match self {
            Token::Word(_) => SLOT_SIZE,
            Token::Bytes(data) => SLOT_SIZE + padded_len(data.len()),
            Token::Array(members) => SLOT_SIZE + tuple_size(members),
            Token::Tuple(members) => tuple_size(members),
        }
    }

    /// Write the token itself (without an offset pointing to it).
    fn write_content<W: Writer>(&self, writer: &mut W) {
        match self {
            Token::Word(slot) => writer.write(slot),
            Token::Bytes(data) => {
                writer.write(&usize_slot(data.len()));
                for chunk in data.chunks(SLOT_SIZE) {
                    let mut slot = [0u8; SLOT_SIZE];
                    slot[..chunk.len()].copy_from_slice(chunk);
                    writer.write(&slot);
                }
            }
            Token::Array(members) => {
                writer.write(&usize_slot(members.len()));
                write_tuple(members, writer);
            }
            Token::Tuple(members) => write_tuple(members, writer),
        }
    }
}

fn padded_len(len: usize) -> usize {
    (len + SLOT_SIZE - 1) / SLOT_SIZE * SLOT_SIZE
}

fn usize_slot(value: usize) -> [u8; SLOT_SIZE] {
    let mut slot = [0u8; SLOT_SIZE];
    slot[SLOT_SIZE - 8..].copy_from_slice(&(value as u64).to_be_bytes());
    slot
}

fn tuple_size(members: &[Token]) -> usize {
    members
        .iter()
        .map(|m| {
            if m.is_dynamic() {
                SLOT_SIZE + m.content_size()
            } else {
                m.head_size()
            }
        })
        .sum()
}

/// Head/Tail encoding: static members are written in place, dynamic members
/// get an offset (relative to the start of the tuple) in the head and their
/// content in the tail.
fn write_tuple<W: Writer>(members: &[Token], writer: &mut W) {
    let mut offset: usize = members.iter().map(Token::head_size).sum();
    for m in members {
        if m.is_dynamic() {
            writer.write(&usize_slot(offset));
            offset += m.content_size();
        } else {
            m.write_content(writer);
        }
    }
    for m in members.iter().filter(|m| m.is_dynamic()) {
        m.write_content(writer);
    }
}

/// Serialize `value` into a [Token] tree.
pub fn to_token<T>(value: &T) -> Result<Token>
where
    T: Serialize + ?Sized,
{
    value.serialize(Serializer::default())
}

/// Encode `value` like `abi.encode(value)` in Solidity.
///
/// Dynamic structs are preceded by the offset `0x20`, exactly what Solidity
/// does for a single dynamic argument.
pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    let token = to_token(value)?;
    write_tuple(core::slice::from_ref(&token), writer);
    Ok(())
}

/// Encode a struct as a list of function arguments (without the outer
/// offset), as in `abi.encode(a, b, c)`.
pub fn to_fnargs_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Writer,
{
    match to_token(value)? {
        Token::Tuple(members) => write_tuple(&members, writer),
        token => write_tuple(core::slice::from_ref(&token), writer),
    }
    Ok(())
}

/// Convenience wrapper around [to_writer] returning the encoded bytes.
pub fn encode<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut out = Vec::new();
    to_writer(value, &mut out)?;
    Ok(out)
}

/// Serializer building the [Token] tree.
#[derive(Default, Clone, Copy)]
pub struct Serializer {
    /// Set while serializing the content of an [as_bytes][super::as_bytes]
    /// field, turns `serialize_bytes` into dynamic `bytes`.
    dynamic_bytes: bool,
}

impl Serializer {
    fn uint(self, value: u128) -> Result<Token> {
        let mut slot = [0u8; SLOT_SIZE];
        slot[SLOT_SIZE - 16..].copy_from_slice(&value.to_be_bytes());
        Ok(Token::Word(slot))
    }

    fn int(self, value: i128) -> Result<Token> {
        // Two's complement, sign extended to the full slot.
        let fill = if value < 0 { 0xff } else { 0x00 };
        let mut slot = [fill; SLOT_SIZE];
        slot[SLOT_SIZE - 16..].copy_from_slice(&value.to_be_bytes());
        Ok(Token::Word(slot))
    }
}

/// Collects the members of sequences, tuples and structs.
pub struct Compound {
    members: Vec<Token>,
    dynamic_length: bool,
}

impl Compound {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.members.push(value.serialize(Serializer::default())?);
        Ok(())
    }

    fn finish(self) -> Result<Token> {
        if self.dynamic_length {
            Ok(Token::Array(self.members))
        } else {
            Ok(Token::Tuple(self.members))
        }
    }
}

impl ser::Serializer for Serializer {
    type Ok = Token;
    type Error = Error;

    type SerializeSeq = Compound;
    type SerializeTuple = Compound;
    type SerializeTupleStruct = Compound;
    type SerializeTupleVariant = Impossible<Token, Error>;
    type SerializeMap = Impossible<Token, Error>;
    type SerializeStruct = Compound;
    type SerializeStructVariant = Impossible<Token, Error>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> Result<Token> {
        self.uint(v as u128)
    }

    fn serialize_i8(self, v: i8) -> Result<Token> {
        self.int(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<Token> {
        self.int(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<Token> {
        self.int(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<Token> {
        self.int(v.into())
    }

    fn serialize_i128(self, v: i128) -> Result<Token> {
        self.int(v)
    }

    fn serialize_u8(self, v: u8) -> Result<Token> {
        self.uint(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<Token> {
        self.uint(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<Token> {
        self.uint(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<Token> {
        self.uint(v.into())
    }

    fn serialize_u128(self, v: u128) -> Result<Token> {
        self.uint(v)
    }

    fn serialize_f32(self, _v: f32) -> Result<Token> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _v: f64) -> Result<Token> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _v: char) -> Result<Token> {
        Err(Error::TypeNotYetSupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<Token> {
        Ok(Token::Bytes(v.as_bytes().to_vec()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Token> {
        if self.dynamic_bytes {
            return Ok(Token::Bytes(v.to_vec()));
        }
        if v.len() > SLOT_SIZE {
            return Err(Error::TypeNotRepresentable("bytesN with N > 32"));
        }
        let mut slot = [0u8; SLOT_SIZE];
        slot[..v.len()].copy_from_slice(v);
        Ok(Token::Word(slot))
    }

    fn serialize_none(self) -> Result<Token> {
        Err(Error::TypeNotRepresentable("Option"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<Token> {
        Err(Error::TypeNotRepresentable("Option"))
    }

    fn serialize_unit(self) -> Result<Token> {
        Err(Error::TypeNotRepresentable("()"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<Token> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<Token> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<Token> {
        if name == MARK_DYNAMIC_BYTES {
            return value.serialize(Serializer {
                dynamic_bytes: true,
            });
        }
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Token> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Compound> {
        Ok(Compound {
            members: Vec::with_capacity(len.unwrap_or_default()),
            dynamic_length: true,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Compound> {
        Ok(Compound {
            members: Vec::with_capacity(len),
            dynamic_length: false,
        })
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<Compound> {
        self.serialize_tuple(len)
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::TypeNotRepresentable(name))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Compound> {
        self.serialize_tuple(len)
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::TypeNotRepresentable(name))
    }
}

impl SerializeSeq for Compound {
    type Ok = Token;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Token> {
        self.finish()
    }
}

impl SerializeTuple for Compound {
    type Ok = Token;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Token> {
        self.finish()
    }
}

impl SerializeTupleStruct for Compound {
    type Ok = Token;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Token> {
        self.finish()
    }
}

impl SerializeStruct for Compound {
    type Ok = Token;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Token> {
        self.finish()
    }
}
