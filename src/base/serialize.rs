// This file is part of CATENA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// CATENA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// CATENA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with CATENA. If not, see <https://www.gnu.org/licenses/>.

//! MessagePack serialization helpers.
//!
//! Used for service messages, events and fixtures. Consensus-critical byte
//! layouts (block and transaction canonical bytes) are hand-encoded in
//! `base::schema` and never go through serde.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Trait implemented by all types that can be serialized with MessagePack format.
pub trait MessagePack<'a>: Sized + Serialize + Deserialize<'a> {
    /// Serialize using MessagePack format.
    ///
    /// # Panics
    ///
    /// Panics if the concrete type cannot be serialized using message pack.
    fn serialize(&self) -> Vec<u8> {
        rmp_serialize(self).unwrap() // Safe for core structs.
    }

    /// Deserialize using MessagePack format.
    ///
    /// # Errors
    ///
    /// Propagates the message pack decoder error.
    fn deserialize(buf: &'a [u8]) -> Result<Self> {
        rmp_deserialize(buf)
    }
}

/// Blanket implementation for types implementing `Serialize` and `Deserialize`.
impl<'a, T: Serialize + Deserialize<'a>> MessagePack<'a> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
    struct SubStruct<'a> {
        field1: u32,
        field2: &'a str,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
    struct MyStruct<'a> {
        name: &'a str,
        surname: String,
        #[serde(with = "serde_bytes")]
        a_buf: &'a [u8],
        a_vec8: Vec<u8>,
        a_map: BTreeMap<&'a str, SubStruct<'a>>,
    }

    impl<'a> MyStruct<'a> {
        fn new() -> Self {
            let mut map = BTreeMap::new();
            map.insert(
                "k1",
                SubStruct {
                    field1: 123,
                    field2: "foo",
                },
            );
            map.insert(
                "k2",
                SubStruct {
                    field1: 456,
                    field2: "bar",
                },
            );
            Self {
                name: "Ada",
                surname: "Lovelace".to_string(),
                a_buf: &[0x01, 0xFF, 0x80],
                a_vec8: vec![0x01, 0xFF, 0x80],
                a_map: map,
            }
        }
    }

    #[test]
    fn mystruct_round_trip() {
        let exp = MyStruct::new();

        let buf = rmp_serialize(&exp).unwrap();
        let st: MyStruct = rmp_deserialize(&buf).unwrap();

        assert_eq!(st, exp);
    }

    #[test]
    fn mystruct_deserialize_fail() {
        let mut buf = rmp_serialize(&MyStruct::new()).unwrap();
        buf.pop(); // remove a byte to make it fail

        let err = rmp_deserialize::<MyStruct>(&buf).unwrap_err();

        assert_eq!(err.kind, crate::ErrorKind::MalformedData);
    }
}
