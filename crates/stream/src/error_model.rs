use tilestream_common::Viewpoint;

/// Maps a tile's world-space geometric error to on-screen error in pixels.
///
/// Implementations must be monotone: a larger geometric error or a smaller
/// distance never yields a smaller screen-space error.
pub trait ScreenSpaceErrorModel: Send + Sync {
    fn screen_space_error(&self, geometric_error: f64, distance: f64, viewpoint: &Viewpoint)
    -> f64;
}

impl<F> ScreenSpaceErrorModel for F
where
    F: Fn(f64, f64, &Viewpoint) -> f64 + Send + Sync,
{
    fn screen_space_error(&self, geometric_error: f64, distance: f64, viewpoint: &Viewpoint) -> f64 {
        self(geometric_error, distance, viewpoint)
    }
}

/// Perspective projection of the error onto the viewport height.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerspectiveErrorModel;

impl ScreenSpaceErrorModel for PerspectiveErrorModel {
    fn screen_space_error(&self, geometric_error: f64, distance: f64, viewpoint: &Viewpoint) -> f64 {
        if geometric_error <= 0.0 {
            return 0.0;
        }
        // Inside the bounds: any error is unbounded on screen.
        if distance <= 0.0 {
            return f64::INFINITY;
        }
        let half_fov = f64::from(viewpoint.fov_y) * 0.5;
        let sse_denominator = 2.0 * half_fov.tan();
        geometric_error * f64::from(viewpoint.viewport_height) / (distance * sse_denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp() -> Viewpoint {
        Viewpoint {
            fov_y: 90.0_f32.to_radians(),
            viewport_height: 1000.0,
            ..Viewpoint::default()
        }
    }

    #[test]
    fn perspective_error_matches_projection() {
        // tan(45deg) = 1, so sse = error * 1000 / (2 * distance).
        let sse = PerspectiveErrorModel.screen_space_error(4.0, 100.0, &vp());
        assert!((sse - 20.0).abs() < 1e-3);
    }

    #[test]
    fn perspective_error_is_monotone() {
        let m = PerspectiveErrorModel;
        let v = vp();
        assert!(m.screen_space_error(4.0, 50.0, &v) > m.screen_space_error(4.0, 100.0, &v));
        assert!(m.screen_space_error(8.0, 100.0, &v) > m.screen_space_error(4.0, 100.0, &v));
    }

    #[test]
    fn inside_bounds_is_infinite_unless_exact() {
        let m = PerspectiveErrorModel;
        assert_eq!(m.screen_space_error(1.0, 0.0, &vp()), f64::INFINITY);
        assert_eq!(m.screen_space_error(0.0, 0.0, &vp()), 0.0);
    }

    #[test]
    fn closures_are_error_models() {
        let passthrough = |error: f64, _distance: f64, _vp: &Viewpoint| error;
        assert_eq!(passthrough.screen_space_error(40.0, 1.0, &vp()), 40.0);
    }
}
