//! Responses sent from server to client, serialize-only. This is a
//! completely different encoding than the client→server command lines:
//! every value becomes one `key: value\n` line, structs flatten their
//! fields, sequences concatenate.

use std::fmt::{self, Display, Write};

use serde::Serialize;
use serde::ser::{self, Impossible};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("this type cannot be represented as key: value lines")]
    Unsupported,
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

pub fn to_string<T: Serialize>(value: &T) -> Result<String, Error> {
    let mut serializer = Serializer {
        out: String::new(),
        key: None,
    };
    value.serialize(&mut serializer)?;
    Ok(serializer.out)
}

struct Serializer {
    out: String,
    /// field name of the value currently being serialized, if any
    key: Option<String>,
}

impl Serializer {
    fn emit(&mut self, value: impl Display) {
        match self.key.take() {
            Some(key) => {
                let _ = writeln!(self.out, "{key}: {value}");
            }
            None => {
                let _ = writeln!(self.out, "{value}");
            }
        }
    }
}

macro_rules! emit_int {
    ($method:ident, $ty:ty) => {
        fn $method(self, v: $ty) -> Result<(), Error> {
            self.emit(v);
            Ok(())
        }
    };
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Impossible<(), Error>;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<(), Error> {
        self.emit(if v { "1" } else { "0" });
        Ok(())
    }

    emit_int!(serialize_i8, i8);
    emit_int!(serialize_i16, i16);
    emit_int!(serialize_i32, i32);
    emit_int!(serialize_i64, i64);
    emit_int!(serialize_u8, u8);
    emit_int!(serialize_u16, u16);
    emit_int!(serialize_u32, u32);
    emit_int!(serialize_u64, u64);

    /// "accurate" times carry three places after the decimal
    fn serialize_f32(self, v: f32) -> Result<(), Error> {
        self.emit(format_args!("{v:.3}"));
        Ok(())
    }

    fn serialize_f64(self, v: f64) -> Result<(), Error> {
        self.emit(format_args!("{v:.3}"));
        Ok(())
    }

    fn serialize_char(self, v: char) -> Result<(), Error> {
        self.emit(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.emit(v);
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn serialize_none(self) -> Result<(), Error> {
        // drop the pending key, print nothing
        self.key = None;
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Error> {
        self.key = None;
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Error> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<(), Error> {
        self.emit(variant);
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, Error> {
        self.key = None;
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, Error> {
        self.key = None;
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self, Error> {
        self.key = None;
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Impossible<(), Error>, Error> {
        Err(Error::Unsupported)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, Error> {
        self.key = None;
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, Error> {
        self.key = None;
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Impossible<(), Error>, Error> {
        Err(Error::Unsupported)
    }
}

impl ser::SerializeSeq for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        self.key = Some(key.to_string());
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeMap for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Error> {
        self.key = Some(key.serialize(KeyCapture)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

/// Map keys must be plain strings.
struct KeyCapture;

impl ser::Serializer for KeyCapture {
    type Ok = String;
    type Error = Error;
    type SerializeSeq = Impossible<String, Error>;
    type SerializeTuple = Impossible<String, Error>;
    type SerializeTupleStruct = Impossible<String, Error>;
    type SerializeTupleVariant = Impossible<String, Error>;
    type SerializeMap = Impossible<String, Error>;
    type SerializeStruct = Impossible<String, Error>;
    type SerializeStructVariant = Impossible<String, Error>;

    fn serialize_str(self, v: &str) -> Result<String, Error> {
        Ok(v.to_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String, Error> {
        Ok(variant.to_string())
    }

    fn serialize_bool(self, _: bool) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_i8(self, _: i8) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_i16(self, _: i16) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_i32(self, _: i32) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_i64(self, _: i64) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_u8(self, _: u8) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_u16(self, _: u16) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_u32(self, _: u32) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_u64(self, _: u64) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_f32(self, _: f32) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_f64(self, _: f64) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_char(self, _: char) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_none(self) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_some<T: Serialize + ?Sized>(self, _: &T) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_unit(self) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: &T,
    ) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<String, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct, Error> {
        Err(Error::Unsupported)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(Error::Unsupported)
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer").field("out", &self.out).finish()
    }
}

#[cfg(test)]
mod tests;
