//! Camera models used to cut panoramas into perspective views.
//!
//! Bearings have X pointing right, Y pointing down and Z pointing forwards.
//! Image points are in normalized image coordinates, with the same X and Y
//! directions.

use nalgebra::{Point2, Rotation3, Unit, UnitVector3, Vector3};
use std::f64::consts::{FRAC_PI_2, PI};

/// Converts between normalized image points and bearings.
pub trait CameraModel {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Extracts a bearing from a normalized image point.
    fn pixel_bearing(&self, point: Point2<f64>) -> UnitVector3<f64>;

    /// Extracts the normalized image point of a bearing.
    ///
    /// Since this might not be possible (if the bearing is behind a pinhole camera),
    /// this operation is fallible.
    fn project(&self, bearing: &UnitVector3<f64>) -> Option<Point2<f64>>;
}

/// Pinhole camera without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub width: u32,
    pub height: u32,
    /// Focal length divided by the larger image side.
    pub focal: f64,
}

impl CameraModel for PerspectiveCamera {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_bearing(&self, point: Point2<f64>) -> UnitVector3<f64> {
        Unit::new_normalize(Vector3::new(point.x / self.focal, point.y / self.focal, 1.0))
    }

    fn project(&self, bearing: &UnitVector3<f64>) -> Option<Point2<f64>> {
        if bearing.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.focal * bearing.x / bearing.z,
            self.focal * bearing.y / bearing.z,
        ))
    }
}

/// Equirectangular camera: x spans the longitude and y the latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphericalCamera {
    pub width: u32,
    pub height: u32,
}

impl CameraModel for SphericalCamera {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_bearing(&self, point: Point2<f64>) -> UnitVector3<f64> {
        let lon = point.x * 2.0 * PI;
        let lat = -point.y * 2.0 * PI;
        Unit::new_normalize(Vector3::new(
            lat.cos() * lon.sin(),
            -lat.sin(),
            lat.cos() * lon.cos(),
        ))
    }

    fn project(&self, bearing: &UnitVector3<f64>) -> Option<Point2<f64>> {
        let lon = bearing.x.atan2(bearing.z);
        let lat = (-bearing.y).atan2(bearing.x.hypot(bearing.z));
        Some(Point2::new(lon / (2.0 * PI), -lat / (2.0 * PI)))
    }
}

/// A camera placed in the world by a rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Shot<C> {
    pub name: String,
    pub camera: C,
    /// World to camera rotation.
    pub rotation: Rotation3<f64>,
}

impl<C: CameraModel> Shot<C> {
    pub fn new(name: impl Into<String>, camera: C, rotation: Rotation3<f64>) -> Self {
        Self {
            name: name.into(),
            camera,
            rotation,
        }
    }
}

/// World to camera rotation from pan, tilt and roll angles.
///
/// The world is z-up. With all angles zero the camera looks along the world y axis.
pub fn rotation_from_ptr(pan: f64, tilt: f64, roll: f64) -> Rotation3<f64> {
    let r1 = Rotation3::from_axis_angle(&Vector3::z_axis(), roll);
    let r2 = Rotation3::from_axis_angle(&Vector3::x_axis(), tilt + FRAC_PI_2);
    let r3 = Rotation3::from_axis_angle(&Vector3::z_axis(), pan);
    r1 * r2 * r3
}
