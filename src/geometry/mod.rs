//! Projection math shared by the evaluators and the optimizer.
//!
//! Everything here is generic over [`nalgebra::RealField`] where the
//! optimizer needs automatic differentiation through the projection; the
//! plain `f64` entry points wrap the generic kernels for callers that only
//! need concrete numbers.

use nalgebra::{
    Isometry3, Matrix3, Point3, RealField, Rotation3, Translation3, UnitQuaternion, Vector2,
    Vector3,
};

use crate::camera::{CameraExtrinsics, CameraIntrinsics, Resolution};

/// Points closer to the camera plane than this along the view axis cannot be
/// projected.
pub const DEGENERATE_Z: f64 = 1e-6;

/// Projection failures.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("point is on or behind the camera plane")]
    DegenerateProjection,
}

/// Rotation matrix for intrinsic XYZ Euler angles given in degrees.
///
/// The composition is `Rx * Ry * Rz`, matching the transform convention used
/// by the animation packages this library interoperates with.
pub fn euler_xyz_rotation<T: RealField>(rx_deg: T, ry_deg: T, rz_deg: T) -> Matrix3<T> {
    let deg_to_rad = T::pi() / T::from_f64(180.0).unwrap();
    let (sx, cx) = (rx_deg * deg_to_rad.clone()).sin_cos();
    let (sy, cy) = (ry_deg * deg_to_rad.clone()).sin_cos();
    let (sz, cz) = (rz_deg * deg_to_rad).sin_cos();

    let one = T::one();
    let zero = T::zero();

    let rx = Matrix3::new(
        one.clone(),
        zero.clone(),
        zero.clone(),
        zero.clone(),
        cx.clone(),
        -sx.clone(),
        zero.clone(),
        sx,
        cx,
    );
    let ry = Matrix3::new(
        cy.clone(),
        zero.clone(),
        sy.clone(),
        zero.clone(),
        one.clone(),
        zero.clone(),
        -sy,
        zero.clone(),
        cy,
    );
    let rz = Matrix3::new(
        cz.clone(),
        -sz.clone(),
        zero.clone(),
        sz,
        cz,
        zero.clone(),
        zero.clone(),
        zero,
        one,
    );

    rx * ry * rz
}

/// Rigid world transform of a camera from its translation and XYZ Euler
/// rotation in degrees.
pub fn world_transform(extrinsics: &CameraExtrinsics) -> Isometry3<f64> {
    let matrix = euler_xyz_rotation(
        extrinsics.rotation.x,
        extrinsics.rotation.y,
        extrinsics.rotation.z,
    );
    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(matrix));
    Isometry3::from_parts(
        Translation3::from(extrinsics.translation),
        rotation,
    )
}

/// Project a camera-space point to normalized device coordinates.
///
/// The camera looks down its local -Z axis. `focal_length`, the apertures
/// and the film offsets are all in millimetres; NDC spans [-1, 1] across the
/// film back. Fails with [`ProjectionError::DegenerateProjection`] when the
/// point sits on or behind the camera plane.
pub fn camera_to_ndc<T: RealField>(
    point_cam: &Vector3<T>,
    focal_length: T,
    film_aperture_h: T,
    film_aperture_v: T,
    film_offset_x: T,
    film_offset_y: T,
) -> Result<Vector2<T>, ProjectionError> {
    let z = point_cam.z.clone();
    if z.clone().abs() < T::from_f64(DEGENERATE_Z).unwrap() {
        return Err(ProjectionError::DegenerateProjection);
    }

    let x_proj = -(point_cam.x.clone() / z.clone());
    let y_proj = point_cam.y.clone() / z;

    let x_film = x_proj * focal_length.clone() + film_offset_x;
    let y_film = y_proj * focal_length + film_offset_y;

    let half = T::from_f64(0.5).unwrap();
    let ndc_x = x_film / (film_aperture_h * half.clone());
    let ndc_y = y_film / (film_aperture_v * half);
    Ok(Vector2::new(ndc_x, ndc_y))
}

/// Project a world-space point through a camera to NDC.
pub fn project_to_ndc(
    point_world: &Point3<f64>,
    camera_transform: &Isometry3<f64>,
    intrinsics: &CameraIntrinsics,
) -> Result<Vector2<f64>, ProjectionError> {
    let point_cam = camera_transform.inverse_transform_point(point_world);
    camera_to_ndc(
        &point_cam.coords,
        intrinsics.focal_length,
        intrinsics.film_aperture_h,
        intrinsics.film_aperture_v,
        intrinsics.film_offset_x,
        intrinsics.film_offset_y,
    )
}

/// NDC to pixel coordinates. Pixel Y grows downward, NDC Y grows upward.
pub fn ndc_to_pixel(ndc: &Vector2<f64>, resolution: Resolution) -> Vector2<f64> {
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    Vector2::new(
        (ndc.x + 1.0) * 0.5 * width,
        (1.0 - ndc.y) * 0.5 * height,
    )
}

/// Pixel coordinates back to NDC. Inverse of [`ndc_to_pixel`].
pub fn pixel_to_ndc(pixel: &Vector2<f64>, resolution: Resolution) -> Vector2<f64> {
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    Vector2::new(
        pixel.x / width * 2.0 - 1.0,
        1.0 - pixel.y / height * 2.0,
    )
}

/// Project a world point all the way to pixel coordinates.
pub fn project_to_pixel(
    point_world: &Point3<f64>,
    camera_transform: &Isometry3<f64>,
    intrinsics: &CameraIntrinsics,
    resolution: Resolution,
) -> Result<Vector2<f64>, ProjectionError> {
    let ndc = project_to_ndc(point_world, camera_transform, intrinsics)?;
    Ok(ndc_to_pixel(&ndc, resolution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn standard_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_length: 35.0,
            film_offset_x: 0.0,
            film_offset_y: 0.0,
            film_aperture_h: 36.0,
            film_aperture_v: 24.0,
        }
    }

    const HD: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };

    #[test]
    fn test_euler_identity_for_zero_angles() {
        let r = euler_xyz_rotation(0.0_f64, 0.0, 0.0);
        assert_relative_eq!(r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_euler_single_axis_matches_nalgebra() {
        let r = euler_xyz_rotation(0.0_f64, 90.0, 0.0);
        let expected = Rotation3::from_axis_angle(&Vector3::y_axis(), 90.0_f64.to_radians());
        assert_relative_eq!(r, *expected.matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_euler_composition_order() {
        // Rx * Ry * Rz, applied right to left.
        let r = euler_xyz_rotation(30.0_f64, 45.0, 60.0);
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), 30.0_f64.to_radians());
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), 45.0_f64.to_radians());
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), 60.0_f64.to_radians());
        assert_relative_eq!(r, *(rx * ry * rz).matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_point_on_axis_projects_to_image_center() {
        let transform = Isometry3::identity();
        let pixel = project_to_pixel(
            &Point3::new(0.0, 0.0, -10.0),
            &transform,
            &standard_intrinsics(),
            HD,
        )
        .unwrap();
        assert_relative_eq!(pixel.x, 960.0, epsilon = 1e-9);
        assert_relative_eq!(pixel.y, 540.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_depth_is_rejected() {
        let transform = Isometry3::identity();
        let err = project_to_ndc(
            &Point3::new(1.0, 1.0, 0.0),
            &transform,
            &standard_intrinsics(),
        )
        .unwrap_err();
        assert_eq!(err, ProjectionError::DegenerateProjection);

        // Just past the threshold is fine.
        assert!(project_to_ndc(
            &Point3::new(1.0, 1.0, -1e-3),
            &transform,
            &standard_intrinsics(),
        )
        .is_ok());
    }

    #[test]
    fn test_film_offset_shifts_projection() {
        let transform = Isometry3::identity();
        let mut intrinsics = standard_intrinsics();
        let centered =
            project_to_ndc(&Point3::new(0.0, 0.0, -10.0), &transform, &intrinsics).unwrap();

        intrinsics.film_offset_x = 18.0; // half the horizontal aperture
        let shifted =
            project_to_ndc(&Point3::new(0.0, 0.0, -10.0), &transform, &intrinsics).unwrap();
        assert_relative_eq!(shifted.x - centered.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(shifted.y, centered.y, epsilon = 1e-12);
    }

    #[test]
    fn test_ndc_pixel_round_trip() {
        let samples = [
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(-1.0, -1.0),
            Vector2::new(0.25, -0.75),
        ];
        for ndc in samples {
            let back = pixel_to_ndc(&ndc_to_pixel(&ndc, HD), HD);
            assert_relative_eq!(back, ndc, epsilon = 1e-12);
        }
        // NDC +Y is up; pixel +Y is down.
        let top = ndc_to_pixel(&Vector2::new(0.0, 1.0), HD);
        assert_relative_eq!(top.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_world_transform_inverse_maps_to_camera_space() {
        let extrinsics = CameraExtrinsics {
            translation: Vector3::new(5.0, -2.0, 3.0),
            rotation: Vector3::new(10.0, 20.0, 30.0),
        };
        let transform = world_transform(&extrinsics);
        let world = Point3::new(1.0, 2.0, 3.0);
        let cam = transform.inverse_transform_point(&world);

        // p_cam = R^T (p_world - t)
        let r = euler_xyz_rotation(10.0_f64, 20.0, 30.0);
        let expected = r.transpose() * (world.coords - extrinsics.translation);
        assert_relative_eq!(cam.coords, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_generic_projection_agrees_with_f64_path() {
        let point = Vector3::new(0.7, -0.4, -5.0);
        let intrinsics = standard_intrinsics();
        let generic = camera_to_ndc(
            &point,
            intrinsics.focal_length,
            intrinsics.film_aperture_h,
            intrinsics.film_aperture_v,
            intrinsics.film_offset_x,
            intrinsics.film_offset_y,
        )
        .unwrap();
        let direct =
            project_to_ndc(&Point3::from(point), &Isometry3::identity(), &intrinsics).unwrap();
        assert_relative_eq!(generic, direct, epsilon = 1e-12);
    }
}
