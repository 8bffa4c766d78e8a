/// Head-coil landmarks: the .hc reader and continuous head localization
///
/// The .hc file lists the nasion, left and right coil positions in several frames:
///
/// ```text
/// measured nasion coil position relative to dewar (cm):
///     x = 6.21
///     y = 7.25
///     z = -24.3
/// ```
use super::error::{Error, Result};
use super::fid::FidFrame;
use super::meg4::Meg4;
use super::res4::Res4;
use nalgebra::Vector3;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Coordinate frame of the measured positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Dewar,
    Head,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Dewar => "dewar",
            Frame::Head => "head",
        }
    }
}

impl std::str::FromStr for Frame {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dewar" => Ok(Frame::Dewar),
            "head" => Ok(Frame::Head),
            _ => Err(Error::format(format!("bad frame value {:?}", s))),
        }
    }
}

/// Nasion, left and right landmarks in one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub nasion: Vector3<f64>,
    pub left: Vector3<f64>,
    pub right: Vector3<f64>,
}

impl Landmarks {
    /// Points in (nasion, left, right) order, as taken by [`crate::fid`]
    pub fn points(&self) -> [Vector3<f64>; 3] {
        [self.nasion, self.left, self.right]
    }

    pub fn get(&self, coil: Coil) -> &Vector3<f64> {
        match coil {
            Coil::Nasion => &self.nasion,
            Coil::Left => &self.left,
            Coil::Right => &self.right,
        }
    }
}

/// One of the three head-localization coils
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coil {
    Nasion,
    Left,
    Right,
}

impl Coil {
    pub fn name(&self) -> &'static str {
        match self {
            Coil::Nasion => "nasion",
            Coil::Left => "left",
            Coil::Right => "right",
        }
    }

    /// Continuous head-localization channels carrying the coil's x, y, z (metres)
    pub fn hlc_channels(&self) -> [&'static str; 3] {
        match self {
            Coil::Nasion => ["HLC0011", "HLC0012", "HLC0013"],
            Coil::Left => ["HLC0021", "HLC0022", "HLC0023"],
            Coil::Right => ["HLC0031", "HLC0032", "HLC0033"],
        }
    }
}

/// Match a `measured <landmark> ... <frame>` header line
fn header(line: &str, frame: Frame) -> Option<Coil> {
    let mut words = line.split_whitespace();
    if words.next() != Some("measured") {
        return None;
    }
    let which = match words.next()? {
        "nasion" => Coil::Nasion,
        "left" => Coil::Left,
        "right" => Coil::Right,
        _ => return None,
    };
    if words.any(|w| w == frame.name()) {
        Some(which)
    } else {
        None
    }
}

fn coordinate<I>(lines: &mut I, axis: &str) -> Result<f64>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let line = lines
        .next()
        .ok_or_else(|| Error::format(format!("landmark file ends before {} coordinate", axis)))??;
    let token = line
        .split_whitespace()
        .last()
        .ok_or_else(|| Error::format(format!("empty {} coordinate line", axis)))?;
    token
        .parse::<f64>()
        .map_err(|_| Error::format(format!("bad {} coordinate {:?}", axis, token)))
}

fn point<I>(lines: &mut I) -> Result<Vector3<f64>>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let x = coordinate(lines, "x")?;
    let y = coordinate(lines, "y")?;
    let z = coordinate(lines, "z")?;
    Ok(Vector3::new(x, y, z))
}

/// Read the measured landmarks of one frame
pub fn read_hc<R: BufRead>(reader: R, frame: Frame) -> Result<Landmarks> {
    let (mut nasion, mut left, mut right) = (None, None, None);

    let mut lines = reader.lines();
    while let Some(line) = lines.next() {
        let line = line?;
        match header(&line, frame) {
            Some(Coil::Nasion) => nasion = Some(point(&mut lines)?),
            Some(Coil::Left) => left = Some(point(&mut lines)?),
            Some(Coil::Right) => right = Some(point(&mut lines)?),
            None => {}
        }
    }

    let missing = |what: &str| Error::format(format!("no measured {} {} landmark", what, frame.name()));
    let landmarks = Landmarks {
        nasion: nasion.ok_or_else(|| missing("nasion"))?,
        left: left.ok_or_else(|| missing("left"))?,
        right: right.ok_or_else(|| missing("right"))?,
    };
    log::debug!("{} landmarks: {:?}", frame.name(), landmarks);
    Ok(landmarks)
}

pub fn read_hc_file(path: &Path, frame: Frame) -> Result<Landmarks> {
    let file = File::open(path)?;
    read_hc(BufReader::new(file), frame)
}

/// Track one coil over a whole trial.
///
/// The coil's head-localization channels are scaled to centimetres, mapped
/// through `frame` (dewar to head) and taken relative to the coil's position
/// in `head`. One row per sample, columns x, y, z.
pub fn head_motion(
    res4: &Res4,
    meg4: &Meg4,
    frame: &FidFrame,
    head: &Landmarks,
    trial: usize,
    coil: Coil,
) -> Result<Array2<f64>> {
    let mut axes = Vec::with_capacity(3);
    for name in coil.hlc_channels() {
        let channel = res4
            .channel_index(name)
            .ok_or_else(|| Error::UnresolvedReference {
                sensor: format!("{} coil", coil.name()),
                reference: name.to_string(),
            })?;
        axes.push(meg4.gained_segment(trial, channel, 0, 0)?);
    }

    let origin = head.get(coil);
    let mut motion = Array2::<f64>::zeros((meg4.num_samples(), 3));
    for (i, mut row) in motion.rows_mut().into_iter().enumerate() {
        let dewar = Vector3::new(axes[0][i], axes[1][i], axes[2][i]) * 100.0; // m -> cm
        let q = frame.to_frame(&dewar) - origin;
        row[0] = q[0];
        row[1] = q[1];
        row[2] = q[2];
    }
    Ok(motion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::{Cursor, Write};

    const HC: &str = "\
standard nasion coil position relative to dewar (cm):
\tx = 5.65685
\ty = 5.65685
\tz = -27.00000
measured nasion coil position relative to dewar (cm):
\tx = 6.21
\ty = 7.25
\tz = -24.3
measured left coil position relative to dewar (cm):
\tx = -4.41
\ty = 4.86
\tz = -25.7
measured right coil position relative to dewar (cm):
\tx = 5.39
\ty = -3.96
\tz = -25.1
measured nasion coil position relative to head (cm):
\tx = 8.8
\ty = 0.0
\tz = 0.0
measured left coil position relative to head (cm):
\tx = 0.0
\ty = 7.1
\tz = 0.0
measured right coil position relative to head (cm):
\tx = 0.0
\ty = -7.1
\tz = 0.0
";

    #[test]
    fn test_read_dewar_frame() {
        let lm = read_hc(Cursor::new(HC), Frame::Dewar).unwrap();
        assert_eq!(lm.nasion, Vector3::new(6.21, 7.25, -24.3));
        assert_eq!(lm.left, Vector3::new(-4.41, 4.86, -25.7));
        assert_eq!(lm.right, Vector3::new(5.39, -3.96, -25.1));
    }

    #[test]
    fn test_read_head_frame() {
        let lm = read_hc(Cursor::new(HC), Frame::Head).unwrap();
        assert_eq!(lm.points()[0], Vector3::new(8.8, 0.0, 0.0));
        assert_eq!(lm.left[1], 7.1);
        assert_eq!(lm.right[1], -7.1);
    }

    #[test]
    fn test_missing_landmark() {
        let text: String = HC.lines().take(12).map(|l| format!("{}\n", l)).collect();
        match read_hc(Cursor::new(text), Frame::Dewar) {
            Err(Error::Format(msg)) => assert!(msg.contains("right"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_short_file() {
        let text = "measured nasion coil position relative to dewar (cm):\n\tx = 1.0\n";
        assert!(matches!(
            read_hc(Cursor::new(text), Frame::Dewar),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_bad_number() {
        let text = HC.replace("x = 6.21", "x = six");
        match read_hc(Cursor::new(text), Frame::Dewar) {
            Err(Error::Format(msg)) => assert!(msg.contains("six"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_frame_from_str() {
        assert_eq!("head".parse::<Frame>().unwrap(), Frame::Head);
        assert_eq!("dewar".parse::<Frame>().unwrap(), Frame::Dewar);
        assert!("mri".parse::<Frame>().is_err());
    }

    const HLC_GAIN: f64 = 1e-6;

    /// Dataset whose HLC channels hold `positions` (dewar cm), one per coil,
    /// with the nasion coil moved 0.5 cm along dewar x from sample 2 on
    fn hlc_dataset(
        dir: &Path,
        names: &[&str],
        positions: &[Vector3<f64>; 3],
    ) -> (Res4, Meg4) {
        let mut types = vec![crate::constants::TYPE_HLC; names.len()];
        types.push(crate::constants::TYPE_MEG);
        let mut all_names = names.to_vec();
        all_names.push("MLC11-1609");
        let mut res4 = crate::res4::tests::build_res4(&all_names, &types, vec![], 1, 4);
        for ch in res4.channels.iter_mut().take(names.len()) {
            ch.gain = HLC_GAIN;
        }

        let mut bytes = b"MEG41CP\0".to_vec();
        for ch in &res4.channels {
            for s in 0..4 {
                let mut cm = 0.0;
                for (k, coil) in [Coil::Nasion, Coil::Left, Coil::Right].iter().enumerate() {
                    if let Some(axis) = coil.hlc_channels().iter().position(|n| *n == ch.name) {
                        cm = positions[k][axis];
                        if *coil == Coil::Nasion && axis == 0 && s >= 2 {
                            cm += 0.5;
                        }
                    }
                }
                let raw = (cm / 100.0 / HLC_GAIN).round() as i32;
                bytes.write_i32::<BigEndian>(raw).unwrap();
            }
        }
        let path = dir.join("run01.meg4");
        std::fs::write(&path, bytes).unwrap();
        let meg4 = Meg4::open(&res4, &path).unwrap();
        (res4, meg4)
    }

    const ALL_HLC: [&str; 9] = [
        "HLC0011", "HLC0012", "HLC0013", "HLC0021", "HLC0022", "HLC0023", "HLC0031", "HLC0032",
        "HLC0033",
    ];

    #[test]
    fn test_head_motion() {
        let dewar = read_hc(Cursor::new(HC), Frame::Dewar).unwrap();
        let frame = FidFrame::new(&dewar.nasion, &dewar.left, &dewar.right).unwrap();
        let [n, l, r] = frame.transform_all(&dewar.points());
        let head = Landmarks {
            nasion: n,
            left: l,
            right: r,
        };

        let dir = tempfile::tempdir().unwrap();
        let (res4, meg4) = hlc_dataset(dir.path(), &ALL_HLC, &dewar.points());

        let nasion = head_motion(&res4, &meg4, &frame, &head, 0, Coil::Nasion).unwrap();
        assert_eq!(nasion.dim(), (4, 3));
        let shift = frame.rotation() * Vector3::new(0.5, 0.0, 0.0);
        for s in 0..4 {
            let expected = if s >= 2 { shift } else { Vector3::zeros() };
            for a in 0..3 {
                assert!(
                    (nasion[[s, a]] - expected[a]).abs() < 1e-9,
                    "sample {} axis {}: {}",
                    s,
                    a,
                    nasion[[s, a]]
                );
            }
        }

        // the other coils stay put
        let left = head_motion(&res4, &meg4, &frame, &head, 0, Coil::Left).unwrap();
        assert!(left.iter().all(|v| v.abs() < 1e-9));

        assert!(matches!(
            head_motion(&res4, &meg4, &frame, &head, 1, Coil::Right),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_head_motion_missing_channel() {
        let dewar = read_hc(Cursor::new(HC), Frame::Dewar).unwrap();
        let frame = FidFrame::new(&dewar.nasion, &dewar.left, &dewar.right).unwrap();
        let head = read_hc(Cursor::new(HC), Frame::Head).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (res4, meg4) = hlc_dataset(dir.path(), &ALL_HLC[..8], &dewar.points());

        assert!(head_motion(&res4, &meg4, &frame, &head, 0, Coil::Left).is_ok());
        match head_motion(&res4, &meg4, &frame, &head, 0, Coil::Right) {
            Err(Error::UnresolvedReference { reference, .. }) => assert_eq!(reference, "HLC0033"),
            other => panic!("unexpected result {:?}", other.map(|m| m.dim())),
        }
    }

    #[test]
    fn test_read_hc_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(HC.as_bytes()).unwrap();
        let lm = read_hc_file(file.path(), Frame::Dewar).unwrap();
        assert_eq!(lm.nasion[0], 6.21);
    }
}
