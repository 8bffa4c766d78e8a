/// CPersist decoding
/// Self-describing tagged container used by .acq, .rp and .infods files
use super::constants::*;
use super::error::{Error, ReadContext, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// A decoded CPersist value
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    Absent,
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Bytes(Vec<u8>),
    List(Vec<TaggedValue>),
    Map(HashMap<String, TaggedValue>),
}

impl TaggedValue {
    /// Look up a tag in a mapping
    pub fn get(&self, tag: &str) -> Option<&TaggedValue> {
        match self {
            TaggedValue::Map(m) => m.get(tag),
            _ => None,
        }
    }

    /// Any integer variant, widened
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            TaggedValue::I16(v) => Some(v as i64),
            TaggedValue::U16(v) => Some(v as i64),
            TaggedValue::I32(v) => Some(v as i64),
            TaggedValue::U32(v) => Some(v as i64),
            TaggedValue::I64(v) => Some(v),
            TaggedValue::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            TaggedValue::F64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            TaggedValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TaggedValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8 with trailing NULs removed
    pub fn as_str(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(nullstrip(b)).into_owned())
    }

    pub fn as_list(&self) -> Option<&[TaggedValue]> {
        match self {
            TaggedValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, TaggedValue>> {
        match self {
            TaggedValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Decoder knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Reject custom tags this decoder has no rule for instead of
    /// decoding them as nested objects
    pub strict_custom: bool,
}

/// Read and decode a CPersist file
pub fn read_cpersist(path: &Path) -> Result<TaggedValue> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    decode(&mut reader)
}

/// Decode one top-level CPersist object
///
/// Decoding stops at the outermost `EndOfParameters`. Files such as .acq carry
/// one more unnamed object after it, which is left unread.
pub fn decode<R: Read>(reader: &mut R) -> Result<TaggedValue> {
    decode_with(reader, DecodeOptions::default())
}

pub fn decode_with<R: Read>(reader: &mut R, opts: DecodeOptions) -> Result<TaggedValue> {
    read_object(reader, opts, 0)
}

fn read_object<R: Read>(reader: &mut R, opts: DecodeOptions, depth: usize) -> Result<TaggedValue> {
    if depth > CP_MAX_DEPTH {
        return Err(Error::format(format!(
            "CPersist nesting too deep (more than {} levels)",
            CP_MAX_DEPTH
        )));
    }

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).context("CPersist magic")?;
    if &magic != CPERSIST_MAGIC {
        return Err(Error::format(format!(
            "improper CPersist magic {:02x?} ({:?})",
            magic,
            String::from_utf8_lossy(&magic)
        )));
    }

    let mut map = HashMap::new();
    loop {
        let tag = String::from_utf8_lossy(&read_string(reader, "CPersist tag name")?).into_owned();
        if tag == CP_END_OF_PARAMETERS {
            break;
        }
        let type_code = read_int(reader, "CPersist type code")?;
        let mut value = read_value(reader, &tag, type_code, opts, depth + 1)?;

        // the value of _eeg_info counts the objects that follow it
        if tag == CP_EEG_INFO {
            let n = value
                .as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::format(format!("bad {} count {:?}", CP_EEG_INFO, value)))?;
            value = TaggedValue::List(read_objects(reader, n, opts, depth + 1)?);
        }

        map.insert(tag, value);
    }

    Ok(TaggedValue::Map(map))
}

fn read_value<R: Read>(
    reader: &mut R,
    tag: &str,
    type_code: i32,
    opts: DecodeOptions,
    depth: usize,
) -> Result<TaggedValue> {
    let value = match type_code {
        CP_CUSTOM => read_custom(reader, tag, opts, depth)?,
        CP_OBJECT => read_object(reader, opts, depth)?,
        CP_BINARY | CP_STRING => TaggedValue::Bytes(read_string(reader, tag)?),
        CP_DOUBLE => TaggedValue::F64(reader.read_f64::<BigEndian>().context(tag)?),
        CP_INTEGER => TaggedValue::I32(reader.read_i32::<BigEndian>().context(tag)?),
        CP_SHORT => TaggedValue::I16(reader.read_i16::<BigEndian>().context(tag)?),
        CP_USHORT => TaggedValue::U16(reader.read_u16::<BigEndian>().context(tag)?),
        CP_BOOLEAN => TaggedValue::Bool(reader.read_u8().context(tag)? != 0),
        CP_CSTR32 => TaggedValue::Bytes(read_cstr32(reader, tag)?),
        CP_STRING_LIST => {
            let n = read_count(reader, tag)?;
            let mut items = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                items.push(TaggedValue::Bytes(read_string(reader, tag)?));
            }
            TaggedValue::List(items)
        }
        CP_CSTR32_LIST => {
            let n = read_count(reader, tag)?;
            let mut items = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                items.push(TaggedValue::Bytes(read_cstr32(reader, tag)?));
            }
            TaggedValue::List(items)
        }
        // no payload on the wire
        CP_SENSOR_CLASS_LIST | CP_CTF_BOOLEAN => TaggedValue::Absent,
        CP_LONG => TaggedValue::I64(reader.read_i64::<BigEndian>().context(tag)?),
        CP_ULONG => TaggedValue::U64(reader.read_u64::<BigEndian>().context(tag)?),
        CP_UINTEGER => TaggedValue::U32(reader.read_u32::<BigEndian>().context(tag)?),
        other => return Err(Error::UnknownTagType(other)),
    };
    Ok(value)
}

fn read_custom<R: Read>(
    reader: &mut R,
    tag: &str,
    opts: DecodeOptions,
    depth: usize,
) -> Result<TaggedValue> {
    match tag {
        CP_DATA_MANAGER_START => Ok(TaggedValue::Absent),
        CP_DATASET_FILES => {
            let count = read_int(reader, tag)?;
            if count != 1 {
                log::warn!("{} has count {}, expected 1", CP_DATASET_FILES, count);
            }
            let files = read_string(reader, tag)?;
            let _unknown = reader.read_i16::<BigEndian>().context(tag)?;
            Ok(TaggedValue::Bytes(files))
        }
        CP_DISPLAY_SETS => {
            let n = read_count(reader, tag)?;
            let sets = read_objects(reader, n, opts, depth)?;
            let _trailer = read_int(reader, tag)?;
            Ok(TaggedValue::List(sets))
        }
        CP_CHANNEL_SET => read_object(reader, opts, depth),
        _ if opts.strict_custom => Err(Error::format(format!(
            "no decoding rule for custom tag {:?}",
            tag
        ))),
        _ => {
            log::debug!("decoding custom tag {:?} as a nested object", tag);
            read_object(reader, opts, depth)
        }
    }
}

fn read_objects<R: Read>(
    reader: &mut R,
    n: usize,
    opts: DecodeOptions,
    depth: usize,
) -> Result<Vec<TaggedValue>> {
    let mut objects = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        objects.push(read_object(reader, opts, depth)?);
    }
    Ok(objects)
}

fn read_int<R: Read>(reader: &mut R, what: &str) -> Result<i32> {
    reader.read_i32::<BigEndian>().context(what)
}

fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let n = read_int(reader, what)?;
    usize::try_from(n).map_err(|_| Error::format(format!("negative count {} in {}", n, what)))
}

/// Length-prefixed byte string
fn read_string<R: Read>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let len = read_count(reader, what)?;
    let mut data = Vec::with_capacity(len.min(1 << 16));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(Error::format(format!(
            "truncated string in {} ({} of {} bytes)",
            what,
            data.len(),
            len
        )));
    }
    Ok(data)
}

fn read_cstr32<R: Read>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let mut buf = [0u8; CP_CSTR32_LEN];
    reader.read_exact(&mut buf).context(what)?;
    Ok(nullstrip(&buf).to_vec())
}
