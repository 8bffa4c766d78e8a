/// .res4 resource file reading and writing
/// Acquisition header, filters, channel names, sensor geometry and balancing coefficients
use super::constants::*;
use super::error::{Error, ReadContext, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

/// Fixed-capacity character field. The text is the prefix up to the first
/// zero byte; the remaining bytes are kept so a rewrite reproduces them.
#[derive(Clone, PartialEq, Eq)]
pub struct FixedStr<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedStr<N> {
    /// Build from text, truncated to the field width
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; N];
        let n = s.len().min(N);
        buf[..n].copy_from_slice(&s.as_bytes()[..n]);
        FixedStr(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        nullstrip(&self.0)
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    fn read<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut buf = [0u8; N];
        reader.read_exact(&mut buf)?;
        Ok(FixedStr(buf))
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        FixedStr([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

fn skip<R: Read>(reader: &mut R, n: usize) -> std::io::Result<()> {
    let mut pad = [0u8; 8];
    reader.read_exact(&mut pad[..n])
}

fn pad<W: Write>(writer: &mut W, n: usize) -> std::io::Result<()> {
    writer.write_all(&[0u8; 8][..n])
}

fn check_len(data: &[u8], expected: usize, what: &str) -> Result<()> {
    if data.len() < expected {
        return Err(Error::format(format!(
            "{} too short: {} bytes (expected {})",
            what,
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// General resource record at the start of every .res4 file (1836 bytes)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenRes {
    pub app_name: FixedStr<256>,
    pub data_origin: FixedStr<256>,
    pub data_desc: FixedStr<256>,
    pub num_avg: i16, // > 0 for averaged data
    pub time: FixedStr<255>,
    pub date: FixedStr<255>,
    pub num_samples: i32, // samples per trial
    pub num_channels: i16,
    pub sample_rate: f64, // Hz
    pub epoch_time: f64,  // numSamples / sampleRate * numTrials
    pub num_trials: i16,
    pub pre_trig: i32, // pre-trigger samples
    pub trials_done: i16,
    pub trials_disp: i16,
    pub save_trials: i32,
    pub trigger_data: [u8; 10],
    pub trigger_mode: i16,
    pub accept_flag: i32,
    pub runtime_disp: i16,
    pub zero_head: i32,
    pub artifact_mode: i32,
    pub run_name: FixedStr<32>,
    pub run_title: FixedStr<256>,
    pub instruments: FixedStr<32>,
    pub collect_desc: FixedStr<32>,
    pub subject_id: FixedStr<32>,
    pub operator: FixedStr<32>,
    pub sensor_filename: FixedStr<56>,
    pub rd_len: i32, // length of the run description that follows
}

impl GenRes {
    /// Parse from the packed big-endian record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_len(data, GEN_RES_SIZE, "general resource record")?;
        let mut c = Cursor::new(data);

        let app_name = FixedStr::read(&mut c)?;
        let data_origin = FixedStr::read(&mut c)?;
        let data_desc = FixedStr::read(&mut c)?;

        let num_avg = c.read_i16::<BigEndian>()?;
        let time = FixedStr::read(&mut c)?;
        let date = FixedStr::read(&mut c)?;

        let num_samples = c.read_i32::<BigEndian>()?;
        let num_channels = c.read_i16::<BigEndian>()?;
        skip(&mut c, 2)?;
        let sample_rate = c.read_f64::<BigEndian>()?;
        let epoch_time = c.read_f64::<BigEndian>()?;

        let num_trials = c.read_i16::<BigEndian>()?;
        skip(&mut c, 2)?;
        let pre_trig = c.read_i32::<BigEndian>()?;
        let trials_done = c.read_i16::<BigEndian>()?;
        let trials_disp = c.read_i16::<BigEndian>()?;

        let save_trials = c.read_i32::<BigEndian>()?;
        let mut trigger_data = [0u8; 10];
        c.read_exact(&mut trigger_data)?;
        skip(&mut c, 2)?;
        let trigger_mode = c.read_i16::<BigEndian>()?;

        skip(&mut c, 2)?;
        let accept_flag = c.read_i32::<BigEndian>()?;
        let runtime_disp = c.read_i16::<BigEndian>()?;
        skip(&mut c, 2)?;
        let zero_head = c.read_i32::<BigEndian>()?;
        let artifact_mode = c.read_i32::<BigEndian>()?;

        let run_name = FixedStr::read(&mut c)?;
        let run_title = FixedStr::read(&mut c)?;
        let instruments = FixedStr::read(&mut c)?;
        let collect_desc = FixedStr::read(&mut c)?;
        let subject_id = FixedStr::read(&mut c)?;
        let operator = FixedStr::read(&mut c)?;
        let sensor_filename = FixedStr::read(&mut c)?;
        skip(&mut c, 4)?;

        let rd_len = c.read_i32::<BigEndian>()?;
        skip(&mut c, 4)?;

        Ok(GenRes {
            app_name,
            data_origin,
            data_desc,
            num_avg,
            time,
            date,
            num_samples,
            num_channels,
            sample_rate,
            epoch_time,
            num_trials,
            pre_trig,
            trials_done,
            trials_disp,
            save_trials,
            trigger_data,
            trigger_mode,
            accept_flag,
            runtime_disp,
            zero_head,
            artifact_mode,
            run_name,
            run_title,
            instruments,
            collect_desc,
            subject_id,
            operator,
            sensor_filename,
            rd_len,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.app_name.0)?;
        w.write_all(&self.data_origin.0)?;
        w.write_all(&self.data_desc.0)?;

        w.write_i16::<BigEndian>(self.num_avg)?;
        w.write_all(&self.time.0)?;
        w.write_all(&self.date.0)?;

        w.write_i32::<BigEndian>(self.num_samples)?;
        w.write_i16::<BigEndian>(self.num_channels)?;
        pad(w, 2)?;
        w.write_f64::<BigEndian>(self.sample_rate)?;
        w.write_f64::<BigEndian>(self.epoch_time)?;

        w.write_i16::<BigEndian>(self.num_trials)?;
        pad(w, 2)?;
        w.write_i32::<BigEndian>(self.pre_trig)?;
        w.write_i16::<BigEndian>(self.trials_done)?;
        w.write_i16::<BigEndian>(self.trials_disp)?;

        w.write_i32::<BigEndian>(self.save_trials)?;
        w.write_all(&self.trigger_data)?;
        pad(w, 2)?;
        w.write_i16::<BigEndian>(self.trigger_mode)?;

        pad(w, 2)?;
        w.write_i32::<BigEndian>(self.accept_flag)?;
        w.write_i16::<BigEndian>(self.runtime_disp)?;
        pad(w, 2)?;
        w.write_i32::<BigEndian>(self.zero_head)?;
        w.write_i32::<BigEndian>(self.artifact_mode)?;

        w.write_all(&self.run_name.0)?;
        w.write_all(&self.run_title.0)?;
        w.write_all(&self.instruments.0)?;
        w.write_all(&self.collect_desc.0)?;
        w.write_all(&self.subject_id.0)?;
        w.write_all(&self.operator.0)?;
        w.write_all(&self.sensor_filename.0)?;
        pad(w, 4)?;

        w.write_i32::<BigEndian>(self.rd_len)?;
        pad(w, 4)
    }
}

/// Filter description with its parameter list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterInfo {
    pub freq: f64,
    pub class: i32,
    pub type_: i32,
    pub params: Vec<f64>, // count stored as an i16 ahead of the list
}

impl FilterInfo {
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; FILTER_INFO_SIZE];
        reader.read_exact(&mut head).context("filter record")?;
        let mut c = Cursor::new(&head[..]);

        let freq = c.read_f64::<BigEndian>()?;
        let class = c.read_i32::<BigEndian>()?;
        let type_ = c.read_i32::<BigEndian>()?;
        let nparam = c.read_i16::<BigEndian>()?;
        if nparam < 0 {
            return Err(Error::format(format!("negative filter parameter count {}", nparam)));
        }

        let mut params = Vec::with_capacity(nparam as usize);
        for _ in 0..nparam {
            params.push(reader.read_f64::<BigEndian>().context("filter parameter")?);
        }

        Ok(FilterInfo {
            freq,
            class,
            type_,
            params,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let nparam = i16::try_from(self.params.len())
            .map_err(|_| Error::format(format!("too many filter parameters: {}", self.params.len())))?;
        w.write_f64::<BigEndian>(self.freq)?;
        w.write_i32::<BigEndian>(self.class)?;
        w.write_i32::<BigEndian>(self.type_)?;
        w.write_i16::<BigEndian>(nparam)?;
        for p in &self.params {
            w.write_f64::<BigEndian>(*p)?;
        }
        Ok(())
    }
}

/// Sensor resource record (48 bytes)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorRes {
    pub type_: i16, // TYPE_* code
    pub run_num: i16,
    pub shape: i32,
    pub proper_gain: f64,
    pub q_gain: f64,
    pub io_gain: f64,
    pub io_offset: f64,
    pub num_coils: i16,
    pub grad_order: i16,
    pub stim_pol: i32,
}

impl SensorRes {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_len(data, SENSOR_RES_SIZE, "sensor record")?;
        let mut c = Cursor::new(data);
        Ok(SensorRes {
            type_: c.read_i16::<BigEndian>()?,
            run_num: c.read_i16::<BigEndian>()?,
            shape: c.read_i32::<BigEndian>()?,
            proper_gain: c.read_f64::<BigEndian>()?,
            q_gain: c.read_f64::<BigEndian>()?,
            io_gain: c.read_f64::<BigEndian>()?,
            io_offset: c.read_f64::<BigEndian>()?,
            num_coils: c.read_i16::<BigEndian>()?,
            grad_order: c.read_i16::<BigEndian>()?,
            stim_pol: c.read_i32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i16::<BigEndian>(self.type_)?;
        w.write_i16::<BigEndian>(self.run_num)?;
        w.write_i32::<BigEndian>(self.shape)?;
        w.write_f64::<BigEndian>(self.proper_gain)?;
        w.write_f64::<BigEndian>(self.q_gain)?;
        w.write_f64::<BigEndian>(self.io_gain)?;
        w.write_f64::<BigEndian>(self.io_offset)?;
        w.write_i16::<BigEndian>(self.num_coils)?;
        w.write_i16::<BigEndian>(self.grad_order)?;
        w.write_i32::<BigEndian>(self.stim_pol)
    }

    /// Scale from raw integer samples to physical units
    pub fn gain(&self) -> Result<f64> {
        let denom = self.proper_gain * self.q_gain * self.io_gain;
        if denom == 0.0 || !denom.is_finite() {
            return Err(Error::format(format!(
                "bad gain denominator {} (proper {}, q {}, io {})",
                denom, self.proper_gain, self.q_gain, self.io_gain
            )));
        }
        Ok(1.0 / denom)
    }
}

/// One coil of a sensor (80 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CoilRec {
    pub pos: [f64; 3],
    pub normal: [f64; 3],
    pub num_turns: i16,
    pub area: f64,
}

impl CoilRec {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_len(data, COIL_REC_SIZE, "coil record")?;
        let mut c = Cursor::new(data);

        let mut pos = [0.0f64; 3];
        for v in pos.iter_mut() {
            *v = c.read_f64::<BigEndian>()?;
        }
        skip(&mut c, 8)?;
        let mut normal = [0.0f64; 3];
        for v in normal.iter_mut() {
            *v = c.read_f64::<BigEndian>()?;
        }
        skip(&mut c, 8)?;
        let num_turns = c.read_i16::<BigEndian>()?;
        skip(&mut c, 6)?;
        let area = c.read_f64::<BigEndian>()?;

        Ok(CoilRec {
            pos,
            normal,
            num_turns,
            area,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for v in &self.pos {
            w.write_f64::<BigEndian>(*v)?;
        }
        pad(w, 8)?;
        for v in &self.normal {
            w.write_f64::<BigEndian>(*v)?;
        }
        pad(w, 8)?;
        w.write_i16::<BigEndian>(self.num_turns)?;
        pad(w, 6)?;
        w.write_f64::<BigEndian>(self.area)
    }
}

/// Sensor record followed by its dewar-frame and head-frame coils
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorRecord {
    pub res: SensorRes,
    pub dewar: [CoilRec; MAX_COILS],
    pub head: [CoilRec; MAX_COILS],
}

impl SensorRecord {
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; SENSOR_RES_SIZE];
        reader.read_exact(&mut buf).context("sensor record")?;
        let res = SensorRes::from_bytes(&buf)?;

        let mut coil = [0u8; COIL_REC_SIZE];
        let mut dewar = [CoilRec::default(); MAX_COILS];
        for c in dewar.iter_mut() {
            reader.read_exact(&mut coil).context("dewar coil record")?;
            *c = CoilRec::from_bytes(&coil)?;
        }
        let mut head = [CoilRec::default(); MAX_COILS];
        for c in head.iter_mut() {
            reader.read_exact(&mut coil).context("head coil record")?;
            *c = CoilRec::from_bytes(&coil)?;
        }

        Ok(SensorRecord { res, dewar, head })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.res.write_to(w)?;
        for c in self.dewar.iter().chain(self.head.iter()) {
            c.write_to(w)?;
        }
        Ok(())
    }
}

/// Balancing coefficient record (1992 bytes). Only the first `n_coeff`
/// entries of `sensor_list` and `coeffs` are meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct CoeffInfo {
    pub sensor_name: FixedStr<CHANNEL_NAME_LEN>,
    pub coef_type: FixedStr<4>, // e.g. G1BR, G2BR, G3BR
    pub n_coeff: i16,
    pub sensor_list: [FixedStr<SENSOR_LABEL>; MAX_BALANCING],
    pub coeffs: [f64; MAX_BALANCING],
}

impl Default for CoeffInfo {
    fn default() -> Self {
        CoeffInfo {
            sensor_name: FixedStr::default(),
            coef_type: FixedStr::default(),
            n_coeff: 0,
            sensor_list: std::array::from_fn(|_| FixedStr::default()),
            coeffs: [0.0; MAX_BALANCING],
        }
    }
}

impl CoeffInfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_len(data, COEFF_INFO_SIZE, "balancing record")?;
        let mut c = Cursor::new(data);

        let sensor_name = FixedStr::read(&mut c)?;
        let coef_type = FixedStr::read(&mut c)?;
        skip(&mut c, 4)?;
        let n_coeff = c.read_i16::<BigEndian>()?;
        if n_coeff < 0 || n_coeff as usize > MAX_BALANCING {
            return Err(Error::format(format!(
                "balancing record for {:?} has {} coefficients (max {})",
                sensor_name, n_coeff, MAX_BALANCING
            )));
        }

        let mut sensor_list: [FixedStr<SENSOR_LABEL>; MAX_BALANCING] =
            std::array::from_fn(|_| FixedStr::default());
        for s in sensor_list.iter_mut() {
            *s = FixedStr::read(&mut c)?;
        }
        let mut coeffs = [0.0f64; MAX_BALANCING];
        for v in coeffs.iter_mut() {
            *v = c.read_f64::<BigEndian>()?;
        }

        Ok(CoeffInfo {
            sensor_name,
            coef_type,
            n_coeff,
            sensor_list,
            coeffs,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.sensor_name.0)?;
        w.write_all(&self.coef_type.0)?;
        pad(w, 4)?;
        w.write_i16::<BigEndian>(self.n_coeff)?;
        for s in &self.sensor_list {
            w.write_all(&s.0)?;
        }
        for v in &self.coeffs {
            w.write_f64::<BigEndian>(*v)?;
        }
        Ok(())
    }

    /// Referenced sensor names paired with their coefficients
    pub fn used(&self) -> impl Iterator<Item = (&FixedStr<SENSOR_LABEL>, f64)> + '_ {
        let n = (self.n_coeff.max(0) as usize).min(MAX_BALANCING);
        self.sensor_list[..n].iter().zip(self.coeffs[..n].iter().copied())
    }
}

/// Sensor class of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    RefMag,
    RefGrad,
    MagSens,
    Meg,
    Eeg,
    Hadc,
    Trigger,
    Hlc,
    Hdac,
    Sclk,
    Uadc,
    Uppt,
    Hlc8,
    Hlc4,
    Mstat,
    Mrsyn,
    Other(i16),
}

impl From<i16> for SensorType {
    fn from(code: i16) -> Self {
        match code {
            TYPE_REF_MAG => SensorType::RefMag,
            TYPE_REF_GRAD => SensorType::RefGrad,
            TYPE_MAG_SENS => SensorType::MagSens,
            TYPE_MEG => SensorType::Meg,
            TYPE_EEG => SensorType::Eeg,
            TYPE_HADC => SensorType::Hadc,
            TYPE_TRIGGER => SensorType::Trigger,
            TYPE_HLC => SensorType::Hlc,
            TYPE_HDAC => SensorType::Hdac,
            TYPE_SCLK => SensorType::Sclk,
            TYPE_UADC => SensorType::Uadc,
            TYPE_UPPT => SensorType::Uppt,
            TYPE_HLC8 => SensorType::Hlc8,
            TYPE_HLC4 => SensorType::Hlc4,
            TYPE_MSTAT => SensorType::Mstat,
            TYPE_MRSYN => SensorType::Mrsyn,
            other => SensorType::Other(other),
        }
    }
}

impl SensorType {
    pub fn code(self) -> i16 {
        match self {
            SensorType::RefMag => TYPE_REF_MAG,
            SensorType::RefGrad => TYPE_REF_GRAD,
            SensorType::MagSens => TYPE_MAG_SENS,
            SensorType::Meg => TYPE_MEG,
            SensorType::Eeg => TYPE_EEG,
            SensorType::Hadc => TYPE_HADC,
            SensorType::Trigger => TYPE_TRIGGER,
            SensorType::Hlc => TYPE_HLC,
            SensorType::Hdac => TYPE_HDAC,
            SensorType::Sclk => TYPE_SCLK,
            SensorType::Uadc => TYPE_UADC,
            SensorType::Uppt => TYPE_UPPT,
            SensorType::Hlc8 => TYPE_HLC8,
            SensorType::Hlc4 => TYPE_HLC4,
            SensorType::Mstat => TYPE_MSTAT,
            SensorType::Mrsyn => TYPE_MRSYN,
            SensorType::Other(code) => code,
        }
    }

    /// Primary MEG sensor
    pub fn is_primary(self) -> bool {
        self == SensorType::Meg
    }

    /// Reference magnetometer or gradiometer
    pub fn is_reference(self) -> bool {
        matches!(self, SensorType::RefMag | SensorType::RefGrad)
    }

    pub fn name(self) -> &'static str {
        sensor_type_name(self.code())
    }
}

/// Per-channel view derived from the raw records
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,          // raw name, NUL-truncated
    pub friendly_name: String, // name without the -xxxx suffix
    pub sensor_type: SensorType,
    pub gain: f64, // 1 / (properGain * qGain * ioGain)
}

/// One resolved balancing term
#[derive(Debug, Clone, PartialEq)]
pub struct BalancingTerm {
    pub name: String,
    pub index: usize,
    pub coeff: f64,
}

/// Balancing coefficients of one sensor with names resolved to channel indices
#[derive(Debug, Clone, PartialEq)]
pub struct Balancing {
    pub sensor_name: String,
    pub coef_type: String,
    pub terms: Vec<BalancingTerm>,
}

/// Remove the -xxxx from a channel name
pub fn friendly_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.split('-').next().unwrap_or_default().to_string()
}

/// Contents of a .res4 file
#[derive(Debug, Clone)]
pub struct Res4 {
    // raw records
    pub gen_res: GenRes,
    pub run_desc: Vec<u8>,
    pub filters: Vec<FilterInfo>,
    pub chan_names: Vec<FixedStr<CHANNEL_NAME_LEN>>,
    pub sensors: Vec<SensorRecord>,
    pub coeff_info: Vec<CoeffInfo>,

    // derived
    pub channels: Vec<ChannelInfo>,
    pub chan_index: HashMap<String, usize>,
    pub first_primary: Option<usize>,
    pub num_primaries: usize,
    pub first_ref: Option<usize>,
    pub num_refs: usize,
    pub balancing: Option<Vec<Balancing>>, // only when reference channels exist
}

impl Res4 {
    /// Read a .res4 file
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let res4 = Self::from_reader(&mut reader)?;
        log::debug!(
            "{}: {} channels, {} trials x {} samples at {} Hz",
            path.display(),
            res4.num_channels(),
            res4.num_trials(),
            res4.num_samples(),
            res4.sample_rate()
        );
        Ok(res4)
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; RES4_HEADER_LEN];
        reader.read_exact(&mut magic).context("res4 magic")?;
        let version = &magic[..RES4_HEADER_LEN - 1];
        if version != RES4_MAGIC_V1 && version != RES4_MAGIC_V2 {
            return Err(Error::format(format!(
                "invalid .res4 magic {:02x?} ({:?})",
                magic,
                String::from_utf8_lossy(&magic)
            )));
        }

        let mut buf = vec![0u8; GEN_RES_SIZE];
        reader.read_exact(&mut buf).context("general resource record")?;
        let gen_res = GenRes::from_bytes(&buf)?;

        let rd_len = usize::try_from(gen_res.rd_len)
            .map_err(|_| Error::format(format!("negative run description length {}", gen_res.rd_len)))?;
        let mut desc = vec![0u8; rd_len];
        reader.read_exact(&mut desc).context("run description")?;
        let run_desc = nullstrip(&desc).to_vec();

        let nf = reader.read_i16::<BigEndian>().context("filter count")?;
        if nf < 0 {
            return Err(Error::format(format!("negative filter count {}", nf)));
        }
        let mut filters = Vec::with_capacity(nf as usize);
        for _ in 0..nf {
            filters.push(FilterInfo::read(reader)?);
        }

        let nchan = usize::try_from(gen_res.num_channels).map_err(|_| {
            Error::format(format!("negative channel count {}", gen_res.num_channels))
        })?;
        let mut chan_names = Vec::with_capacity(nchan);
        for _ in 0..nchan {
            chan_names.push(FixedStr::read(reader).context("channel name")?);
        }

        let mut sensors = Vec::with_capacity(nchan);
        for _ in 0..nchan {
            sensors.push(SensorRecord::read(reader)?);
        }

        let nc = reader.read_i16::<BigEndian>().context("balancing count")?;
        if nc < 0 {
            return Err(Error::format(format!("negative balancing count {}", nc)));
        }
        let mut coeff_info = Vec::with_capacity(nc as usize);
        let mut rec = vec![0u8; COEFF_INFO_SIZE];
        for _ in 0..nc {
            reader.read_exact(&mut rec).context("balancing record")?;
            coeff_info.push(CoeffInfo::from_bytes(&rec)?);
        }

        Self::from_parts(gen_res, run_desc, filters, chan_names, sensors, coeff_info)
    }

    /// Assemble from raw records, computing the derived channel tables
    pub fn from_parts(
        gen_res: GenRes,
        run_desc: Vec<u8>,
        filters: Vec<FilterInfo>,
        chan_names: Vec<FixedStr<CHANNEL_NAME_LEN>>,
        sensors: Vec<SensorRecord>,
        coeff_info: Vec<CoeffInfo>,
    ) -> Result<Self> {
        if gen_res.num_samples < 0 || gen_res.num_trials < 0 {
            return Err(Error::format(format!(
                "negative dimensions: {} trials x {} samples",
                gen_res.num_trials, gen_res.num_samples
            )));
        }
        let nchan = gen_res.num_channels.max(0) as usize;
        if chan_names.len() != nchan || sensors.len() != nchan {
            return Err(Error::format(format!(
                "header says {} channels but found {} names and {} sensor records",
                nchan,
                chan_names.len(),
                sensors.len()
            )));
        }

        let mut channels = Vec::with_capacity(nchan);
        let mut chan_index = HashMap::with_capacity(nchan);
        for (i, (name, sensor)) in chan_names.iter().zip(sensors.iter()).enumerate() {
            let friendly = friendly_name(name.as_bytes());
            if let Some(prev) = chan_index.insert(friendly.clone(), i) {
                log::warn!(
                    "channel name {:?} at index {} shadows index {}",
                    friendly,
                    i,
                    prev
                );
            }
            channels.push(ChannelInfo {
                name: name.to_string_lossy(),
                friendly_name: friendly,
                sensor_type: SensorType::from(sensor.res.type_),
                gain: sensor.res.gain()?,
            });
        }

        let (first_primary, num_primaries) = channel_run(&channels, "primary", |t| t.is_primary());
        let (first_ref, num_refs) = channel_run(&channels, "reference", |t| t.is_reference());

        let balancing = if num_refs > 0 {
            Some(resolve_balancing(&coeff_info, &chan_index)?)
        } else {
            None
        };

        Ok(Res4 {
            gen_res,
            run_desc,
            filters,
            chan_names,
            sensors,
            coeff_info,
            channels,
            chan_index,
            first_primary,
            num_primaries,
            first_ref,
            num_refs,
            balancing,
        })
    }

    /// Write a .res4 file. `gen_res.rd_len` is trusted as the run
    /// description length and is not recomputed.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn to_writer<W: Write>(&self, w: &mut W) -> Result<()> {
        let rd_len = usize::try_from(self.gen_res.rd_len).map_err(|_| {
            Error::format(format!("negative run description length {}", self.gen_res.rd_len))
        })?;
        if self.run_desc.len() > rd_len {
            return Err(Error::format(format!(
                "run description is {} bytes but rd_len is {}",
                self.run_desc.len(),
                rd_len
            )));
        }
        let nchan = self.gen_res.num_channels.max(0) as usize;
        if self.chan_names.len() != nchan || self.sensors.len() != nchan {
            return Err(Error::format(format!(
                "header says {} channels but have {} names and {} sensor records",
                nchan,
                self.chan_names.len(),
                self.sensors.len()
            )));
        }
        let nf = i16::try_from(self.filters.len())
            .map_err(|_| Error::format(format!("too many filters: {}", self.filters.len())))?;
        let nc = i16::try_from(self.coeff_info.len()).map_err(|_| {
            Error::format(format!("too many balancing records: {}", self.coeff_info.len()))
        })?;

        w.write_all(RES4_MAGIC_V2)?;
        w.write_u8(0)?;
        self.gen_res.write_to(w)?;

        w.write_all(&self.run_desc)?;
        w.write_all(&vec![0u8; rd_len - self.run_desc.len()])?;

        w.write_i16::<BigEndian>(nf)?;
        for f in &self.filters {
            f.write_to(w)?;
        }

        for name in &self.chan_names {
            w.write_all(&name.0)?;
        }
        for sensor in &self.sensors {
            sensor.write_to(w)?;
        }

        w.write_i16::<BigEndian>(nc)?;
        for ci in &self.coeff_info {
            ci.write_to(w)?;
        }
        Ok(())
    }

    pub fn num_trials(&self) -> usize {
        self.gen_res.num_trials.max(0) as usize
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.gen_res.num_samples.max(0) as usize
    }

    pub fn sample_rate(&self) -> f64 {
        self.gen_res.sample_rate
    }

    pub fn pre_trig_samples(&self) -> i32 {
        self.gen_res.pre_trig
    }

    pub fn time(&self) -> String {
        self.gen_res.time.to_string_lossy()
    }

    pub fn date(&self) -> String {
        self.gen_res.date.to_string_lossy()
    }

    pub fn run_description(&self) -> String {
        String::from_utf8_lossy(&self.run_desc).into_owned()
    }

    pub fn is_average(&self) -> bool {
        self.gen_res.num_avg > 0
    }

    /// Pre-trigger interval in seconds
    pub fn pre_trig_seconds(&self) -> f64 {
        self.gen_res.pre_trig as f64 / self.gen_res.sample_rate
    }

    /// Time in seconds of a sample within a trial, relative to the trigger
    pub fn time_point(&self, sample: i64) -> f64 {
        (sample - self.gen_res.pre_trig as i64) as f64 / self.gen_res.sample_rate
    }

    /// Sample number within a trial for a time relative to the trigger
    pub fn sample_number(&self, t: f64) -> i64 {
        ((t + self.pre_trig_seconds()) * self.gen_res.sample_rate + 0.5).floor() as i64
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.chan_index.get(name).copied()
    }

    pub fn channel_name(&self, index: usize) -> Option<&str> {
        self.channels.get(index).map(|c| c.friendly_name.as_str())
    }

    pub fn gains(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.gain).collect()
    }

    /// Friendly names of every channel of one sensor type, in channel order
    pub fn sensor_list(&self, sensor_type: SensorType) -> Vec<&str> {
        self.channels
            .iter()
            .filter(|c| c.sensor_type == sensor_type)
            .map(|c| c.friendly_name.as_str())
            .collect()
    }

    /// Indices of channels of one type whose names start with any of the prefixes
    pub fn channel_indices_by_prefix<S: AsRef<str>>(
        &self,
        prefixes: &[S],
        sensor_type: SensorType,
    ) -> Result<Vec<usize>> {
        let mut indices = Vec::new();
        for prefix in prefixes {
            let prefix = prefix.as_ref();
            let before = indices.len();
            indices.extend(
                self.channels
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.sensor_type == sensor_type && c.friendly_name.starts_with(prefix))
                    .map(|(i, _)| i),
            );
            if indices.len() == before {
                return Err(Error::format(format!("channel {} not found", prefix)));
            }
        }
        Ok(indices)
    }
}

/// First index of a channel class and the length of the contiguous run there
fn channel_run(
    channels: &[ChannelInfo],
    what: &str,
    pred: impl Fn(SensorType) -> bool,
) -> (Option<usize>, usize) {
    let Some(first) = channels.iter().position(|c| pred(c.sensor_type)) else {
        return (None, 0);
    };
    let run = channels[first..]
        .iter()
        .take_while(|c| pred(c.sensor_type))
        .count();
    let total = channels.iter().filter(|c| pred(c.sensor_type)).count();
    if total != run {
        log::warn!(
            "{} channels are not contiguous: run of {} at {}, {} in total",
            what,
            run,
            first,
            total
        );
    }
    (Some(first), run)
}

fn resolve_balancing(
    coeff_info: &[CoeffInfo],
    chan_index: &HashMap<String, usize>,
) -> Result<Vec<Balancing>> {
    let mut resolved = Vec::with_capacity(coeff_info.len());
    for ci in coeff_info {
        let sensor_name = friendly_name(ci.sensor_name.as_bytes());
        let mut terms = Vec::with_capacity(ci.n_coeff.max(0) as usize);
        for (label, coeff) in ci.used() {
            let name = friendly_name(label.as_bytes());
            let index = *chan_index
                .get(&name)
                .ok_or_else(|| Error::UnresolvedReference {
                    sensor: sensor_name.clone(),
                    reference: name.clone(),
                })?;
            terms.push(BalancingTerm { name, index, coeff });
        }
        resolved.push(Balancing {
            sensor_name,
            coef_type: ci.coef_type.to_string_lossy(),
            terms,
        });
    }
    Ok(resolved)
}
