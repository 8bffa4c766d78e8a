/// CTF Constants
/// Magic strings, record sizes and type codes of the CTF dataset files

// File magics (only the first 7 bytes are compared)
pub const RES4_MAGIC_V1: &[u8; 7] = b"MEG41RS";
pub const RES4_MAGIC_V2: &[u8; 7] = b"MEG42RS";
pub const MEG4_MAGIC_V1: &[u8; 7] = b"MEG41CP";
pub const MEG4_MAGIC_V2: &[u8; 7] = b"MEG42CP";
pub const CPERSIST_MAGIC: &[u8; 4] = b"WS1_";

pub const RES4_HEADER_LEN: usize = 8;
pub const MEG4_HEADER_LEN: usize = 8;

// .res4 record sizes (bytes, no implicit alignment)
pub const GEN_RES_SIZE: usize = 1836;
pub const FILTER_INFO_SIZE: usize = 18;
pub const CHANNEL_NAME_LEN: usize = 32;
pub const SENSOR_RES_SIZE: usize = 48;
pub const COIL_REC_SIZE: usize = 80;
pub const COEFF_INFO_SIZE: usize = 1992;

pub const MAX_COILS: usize = 8;
pub const MAX_BALANCING: usize = 50;
pub const SENSOR_LABEL: usize = 31;

// Sensor types (SensorRes.type)
pub const TYPE_REF_MAG: i16 = 0;
pub const TYPE_REF_GRAD: i16 = 1;
pub const TYPE_MAG_SENS: i16 = 4;
pub const TYPE_MEG: i16 = 5; // primary MEG channel
pub const TYPE_EEG: i16 = 9;
pub const TYPE_HADC: i16 = 10;
pub const TYPE_TRIGGER: i16 = 11;
pub const TYPE_HLC: i16 = 13; // head localization
pub const TYPE_HDAC: i16 = 14;
pub const TYPE_SCLK: i16 = 17;
pub const TYPE_UADC: i16 = 18;
pub const TYPE_UPPT: i16 = 20;
pub const TYPE_HLC8: i16 = 28;
pub const TYPE_HLC4: i16 = 29;
pub const TYPE_MSTAT: i16 = 35;
pub const TYPE_MRSYN: i16 = 36;

// CPersist type codes
pub const CP_CUSTOM: i32 = 1;
pub const CP_OBJECT: i32 = 2;
pub const CP_BINARY: i32 = 3;
pub const CP_DOUBLE: i32 = 4;
pub const CP_INTEGER: i32 = 5;
pub const CP_SHORT: i32 = 6;
pub const CP_USHORT: i32 = 7;
pub const CP_BOOLEAN: i32 = 8;
pub const CP_CSTR32: i32 = 9;
pub const CP_STRING: i32 = 10;
pub const CP_STRING_LIST: i32 = 11;
pub const CP_CSTR32_LIST: i32 = 12;
pub const CP_SENSOR_CLASS_LIST: i32 = 13;
pub const CP_LONG: i32 = 14;
pub const CP_ULONG: i32 = 15;
pub const CP_UINTEGER: i32 = 16;
pub const CP_CTF_BOOLEAN: i32 = 17;

pub const CP_CSTR32_LEN: usize = 32;
pub const CP_MAX_DEPTH: usize = 64; // nested objects below the top level

// CPersist tag names with special meaning
pub const CP_END_OF_PARAMETERS: &str = "EndOfParameters";
pub const CP_DATA_MANAGER_START: &str = "DataManagerStart";
pub const CP_DATASET_FILES: &str = "DatasetFiles";
pub const CP_DISPLAY_SETS: &str = "DisplaySets";
pub const CP_CHANNEL_SET: &str = "ChannelSet";
pub const CP_EEG_INFO: &str = "_eeg_info";

/// Get human-readable sensor type name
pub fn sensor_type_name(code: i16) -> &'static str {
    match code {
        TYPE_REF_MAG => "REF_MAG",
        TYPE_REF_GRAD => "REF_GRAD",
        TYPE_MAG_SENS => "MAG_SENS",
        TYPE_MEG => "MEG",
        TYPE_EEG => "EEG",
        TYPE_HADC => "HADC",
        TYPE_TRIGGER => "TRIGGER",
        TYPE_HLC => "HLC",
        TYPE_HDAC => "HDAC",
        TYPE_SCLK => "SCLK",
        TYPE_UADC => "UADC",
        TYPE_UPPT => "UPPT",
        TYPE_HLC8 => "HLC8",
        TYPE_HLC4 => "HLC4",
        TYPE_MSTAT => "MSTAT",
        TYPE_MRSYN => "MRSYN",
        _ => "UNKNOWN",
    }
}

/// Get the CPersist name for a type code
pub fn cpersist_type_name(code: i32) -> &'static str {
    match code {
        CP_CUSTOM => "Custom",
        CP_OBJECT => "Object",
        CP_BINARY => "Binary",
        CP_DOUBLE => "Double",
        CP_INTEGER => "Integer",
        CP_SHORT => "Short",
        CP_USHORT => "UShort",
        CP_BOOLEAN => "Boolean",
        CP_CSTR32 => "CStr32",
        CP_STRING => "String",
        CP_STRING_LIST => "StringList",
        CP_CSTR32_LIST => "CStr32List",
        CP_SENSOR_CLASS_LIST => "SensorClassList",
        CP_LONG => "Long",
        CP_ULONG => "ULong",
        CP_UINTEGER => "UInteger",
        CP_CTF_BOOLEAN => "CTFBoolean",
        _ => "unknown",
    }
}

/// Truncate a fixed-width buffer at the first zero byte
pub fn nullstrip(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(i) => &bytes[..i],
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_type_name() {
        assert_eq!(sensor_type_name(TYPE_MEG), "MEG");
        assert_eq!(sensor_type_name(TYPE_REF_MAG), "REF_MAG");
        assert_eq!(sensor_type_name(TYPE_REF_GRAD), "REF_GRAD");
        assert_eq!(sensor_type_name(TYPE_EEG), "EEG");
        assert_eq!(sensor_type_name(TYPE_HLC), "HLC");
        assert_eq!(sensor_type_name(999), "UNKNOWN");
    }

    #[test]
    fn test_cpersist_type_name() {
        assert_eq!(cpersist_type_name(CP_OBJECT), "Object");
        assert_eq!(cpersist_type_name(CP_STRING_LIST), "StringList");
        assert_eq!(cpersist_type_name(CP_CTF_BOOLEAN), "CTFBoolean");
        assert_eq!(cpersist_type_name(0), "unknown");
    }

    #[test]
    fn test_nullstrip() {
        assert_eq!(nullstrip(b"MLC11-2805\0\0\0"), b"MLC11-2805");
        assert_eq!(nullstrip(b"abc\0def"), b"abc");
        assert_eq!(nullstrip(b"full"), b"full");
        assert_eq!(nullstrip(b"\0"), b"");
    }

    #[test]
    fn test_record_sizes() {
        // Sizes of the packed .res4 records
        assert_eq!(GEN_RES_SIZE, 1836);
        assert_eq!(SENSOR_RES_SIZE, 48);
        assert_eq!(COIL_REC_SIZE, 80);
        assert_eq!(
            COEFF_INFO_SIZE,
            32 + 4 + 4 + 2 + MAX_BALANCING * SENSOR_LABEL + MAX_BALANCING * 8
        );
    }
}
