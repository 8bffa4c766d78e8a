/// Fiducial coordinate frames and rigid alignment of fiducial triples
///
/// The fiducial (head) frame has its origin midway between the left and right
/// landmarks, +x towards the nasion, +y towards the left landmark and
/// +z = x × y.
use super::error::{Error, Result};
use nalgebra::{Matrix3, Matrix4, RowVector3, Vector3};

const MIN_AXIS_NORM: f64 = 1e-9;

/// Rotation and origin of a fiducial frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FidFrame {
    rot: Matrix3<f64>, // rows are the frame axes in source coordinates
    origin: Vector3<f64>,
}

impl FidFrame {
    /// Build the frame defined by nasion, left and right landmarks
    pub fn new(nasion: &Vector3<f64>, left: &Vector3<f64>, right: &Vector3<f64>) -> Result<Self> {
        let degenerate = || Error::DegenerateGeometry { det: 0.0 };

        let origin = (left + right) * 0.5;
        let lr = (left - right).try_normalize(MIN_AXIS_NORM).ok_or_else(degenerate)?;

        // x towards the nasion, perpendicular to the ear axis
        let n = nasion - origin;
        let x = (n - lr * n.dot(&lr))
            .try_normalize(MIN_AXIS_NORM)
            .ok_or_else(degenerate)?;

        let l = left - origin;
        let y = (l - x * l.dot(&x))
            .try_normalize(MIN_AXIS_NORM)
            .ok_or_else(degenerate)?;
        let z = x.cross(&y);

        let rot = Matrix3::from_rows(&[
            RowVector3::new(x[0], x[1], x[2]),
            RowVector3::new(y[0], y[1], y[2]),
            RowVector3::new(z[0], z[1], z[2]),
        ]);
        Ok(FidFrame { rot, origin })
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rot
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    /// Translation applied after the rotation
    pub fn translation(&self) -> Vector3<f64> {
        -(self.rot * self.origin)
    }

    /// Homogeneous 4x4 transform into the frame
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = self.rot.to_homogeneous();
        let t = self.translation();
        m[(0, 3)] = t[0];
        m[(1, 3)] = t[1];
        m[(2, 3)] = t[2];
        m
    }

    /// Map a source point into the frame
    pub fn to_frame(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rot * (p - self.origin)
    }

    /// Map a frame point back to source coordinates
    pub fn from_frame(&self, q: &Vector3<f64>) -> Vector3<f64> {
        self.rot.transpose() * q + self.origin
    }

    pub fn transform_all(&self, points: &[Vector3<f64>; 3]) -> [Vector3<f64>; 3] {
        [
            self.to_frame(&points[0]),
            self.to_frame(&points[1]),
            self.to_frame(&points[2]),
        ]
    }
}

/// Result of [`fit_rigid`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidFit {
    /// Rotation taking the first set onto the second, in the first set's fiducial frame
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub angle: f64,    // degrees
    pub distance: f64, // same units as the input points
}

impl RigidFit {
    /// Map a point of the first set (fiducial frame coordinates) towards the second
    pub fn apply(&self, q: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * q + self.translation
    }
}

/// Least-squares rotation and translation between two fiducial triples
/// (nasion, left, right), after Arun, Huang & Blostein (1987).
///
/// Both triples are expressed in the fiducial frame of the first. The first
/// is then centered by construction; the second is centered on the midpoint
/// of its left and right points, which is also the reported translation.
pub fn fit_rigid(p1: &[Vector3<f64>; 3], p2: &[Vector3<f64>; 3]) -> Result<RigidFit> {
    let frame = FidFrame::new(&p1[0], &p1[1], &p1[2])?;
    let q1 = frame.transform_all(p1);
    let mut q2 = frame.transform_all(p2);

    let c2 = (q2[1] + q2[2]) * 0.5;
    for q in q2.iter_mut() {
        *q -= c2;
    }

    let mut h = Matrix3::<f64>::zeros();
    for (a, b) in q1.iter().zip(q2.iter()) {
        h += a * b.transpose();
    }

    let rotation = rotation_from_covariance(&h)?;

    let cos_half = (0.5 * (1.0 + rotation.trace()).max(0.0).sqrt()).clamp(-1.0, 1.0);
    let angle = (2.0 * cos_half.acos()).to_degrees();
    let distance = c2.norm();

    log::info!(
        "total rotation = {:4.2} degrees, translation = {:4.2}",
        angle,
        distance
    );

    Ok(RigidFit {
        rotation,
        translation: c2,
        angle,
        distance,
    })
}

/// Orthogonal R = V Uᵀ from the SVD H = U Σ Vᵀ, repairing a reflection when
/// the smallest singular value is zero
fn rotation_from_covariance(h: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd = (*h).svd(true, true);
    let degenerate = || Error::DegenerateGeometry { det: f64::NAN };
    let u = svd.u.ok_or_else(degenerate)?;
    let mut v_t = svd.v_t.ok_or_else(degenerate)?;

    let mut r = v_t.transpose() * u.transpose();
    let det = r.determinant();
    if !(det.abs() >= 0.01) {
        return Err(Error::DegenerateGeometry { det });
    }
    if det < 0.0 {
        let (k, &smallest) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(degenerate)?;
        if smallest.abs() > 0.01 {
            return Err(Error::UnresolvableRotation {
                singular_value: smallest,
            });
        }
        let mut row = v_t.row_mut(k);
        row *= -1.0;
        r = v_t.transpose() * u.transpose();
    }
    Ok(r)
}
