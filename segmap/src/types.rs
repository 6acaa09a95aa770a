use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::error::Error;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Size/write/read contract a caller supplies for a key or value type.
///
/// The map asks for `size` first, hands `write` a buffer of exactly that
/// many bytes, and calls `read` with the same bytes on the way back out.
/// A `write` that reports a different byte count than `size` is rejected
/// as an encoding error.
/// Implementations know nothing about slots, segments or offsets.
pub trait Codec: Send + Sync {
    type Item;

    /// Number of bytes `write` will produce for `item`
    fn size(&self, item: &Self::Item) -> usize;

    /// Serialize `item` into `out`, which is exactly `size(item)` bytes long,
    /// returning the number of bytes written
    fn write(&self, item: &Self::Item, out: &mut [u8]) -> Result<usize, BoxError>;

    /// Deserialize an item from the bytes a previous `write` produced
    fn read(&self, bytes: &[u8]) -> Result<Self::Item, BoxError>;

    /// Name recorded in the map header for this codec's item type
    fn alias(&self) -> Cow<'static, str> {
        Cow::Borrowed(type_name::<Self::Item>())
    }
}

/// Codec for plain-old-data values (numbers, fixed arrays, Pod structs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Native<T>(PhantomData<T>);

impl<T> Default for Native<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec for Native<T>
where
    T: bytemuck::Pod + Send + Sync,
{
    type Item = T;

    fn size(&self, _item: &T) -> usize {
        std::mem::size_of::<T>()
    }

    fn write(&self, item: &T, out: &mut [u8]) -> Result<usize, BoxError> {
        let bytes = bytemuck::bytes_of(item);
        out.get_mut(..bytes.len())
            .ok_or("output buffer too small")?
            .copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<T, BoxError> {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(format!(
                "Invalid byte length for {}: expected {}, got {}",
                type_name::<T>(),
                std::mem::size_of::<T>(),
                bytes.len()
            )
            .into());
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// Codec for UTF-8 strings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Str;

impl Codec for Str {
    type Item = String;

    fn size(&self, item: &String) -> usize {
        item.len()
    }

    fn write(&self, item: &String, out: &mut [u8]) -> Result<usize, BoxError> {
        out.get_mut(..item.len())
            .ok_or("output buffer too small")?
            .copy_from_slice(item.as_bytes());
        Ok(item.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<String, BoxError> {
        std::str::from_utf8(bytes)
            .map(|s| s.to_owned())
            .map_err(|e| e.into())
    }
}

/// Codec for raw byte vectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bytes;

impl Codec for Bytes {
    type Item = Vec<u8>;

    fn size(&self, item: &Vec<u8>) -> usize {
        item.len()
    }

    fn write(&self, item: &Vec<u8>, out: &mut [u8]) -> Result<usize, BoxError> {
        out.get_mut(..item.len())
            .ok_or("output buffer too small")?
            .copy_from_slice(item);
        Ok(item.len())
    }

    fn read(&self, bytes: &[u8]) -> Result<Vec<u8>, BoxError> {
        Ok(bytes.to_vec())
    }
}

/// Codec for any serde type, using bincode's compact layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bincode<T>(PhantomData<fn() -> T>);

impl<T> Default for Bincode<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec for Bincode<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = T;

    fn size(&self, item: &T) -> usize {
        // serialized_size only fails for types serde cannot describe; write reports that
        bincode::serialized_size(item).map_or(0, |n| n as usize)
    }

    fn write(&self, item: &T, out: &mut [u8]) -> Result<usize, BoxError> {
        let mut cursor = std::io::Cursor::new(out);
        bincode::serialize_into(&mut cursor, item)?;
        Ok(cursor.position() as usize)
    }

    fn read(&self, bytes: &[u8]) -> Result<T, BoxError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Explicit table of short aliases for item types.
///
/// The aliases of the key and value types are written into the map header
/// when the file is created and compared on every later open, so a file
/// written with one value type cannot silently be read as another.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    aliases: HashMap<TypeId, String>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `alias` as the recorded name of item type `T`
    pub fn register<T: 'static>(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(TypeId::of::<T>(), alias.into());
        self
    }

    /// Alias recorded for the item type of `codec`
    pub fn alias_for<C>(&self, codec: &C) -> String
    where
        C: Codec,
        C::Item: 'static,
    {
        self.aliases
            .get(&TypeId::of::<C::Item>())
            .cloned()
            .unwrap_or_else(|| codec.alias().into_owned())
    }
}
