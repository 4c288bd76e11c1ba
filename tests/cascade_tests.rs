use approx::assert_relative_eq;
use penumbra::{CameraState, CascadeBounds, CascadeCalculator, Vec3, Vec4};

fn camera() -> CameraState {
    CameraState::new(
        Vec3::new(0.0, 5.0, 10.0),
        Vec3::new(0.0, -0.3, -1.0),
        60f32.to_radians(),
        16.0 / 9.0,
        0.1,
        100.0,
    )
}

#[test]
fn four_cascades_split_monotonically_up_to_far() {
    let splits = CascadeCalculator::compute_splits(4, 0.1, 100.0, 0.5);
    for pair in splits.windows(2) {
        assert!(pair[0] < pair[1], "splits not increasing: {splits:?}");
    }
    assert!(splits[0] > 0.1);
    assert_eq!(splits[3], 100.0);
}

#[test]
fn every_cascade_count_and_lambda_ends_at_far() {
    for count in 1..=4u32 {
        for lambda in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let splits = CascadeCalculator::compute_splits(count, 0.1, 100.0, lambda);
            let active = count as usize;
            assert_eq!(splits[active - 1], 100.0);
            for pair in splits[..active].windows(2) {
                assert!(pair[0] < pair[1]);
            }
            for unused in &splits[active..] {
                assert_eq!(*unused, 100.0);
            }
        }
    }
}

#[test]
fn cascades_are_deterministic() {
    let calculator = CascadeCalculator::new(0.5, 2048);
    let light = Vec3::new(-0.4, -1.0, -0.2);
    let a = calculator.compute_cascades(&camera(), light, 4);
    let b = calculator.compute_cascades(&camera(), light, 4);
    assert_eq!(a, b);
}

#[test]
fn cascade_matrices_contain_the_view_axis() {
    let camera = camera();
    let calculator = CascadeCalculator::new(0.5, 2048);
    let set = calculator.compute_cascades(&camera, Vec3::new(0.3, -1.0, 0.1), 4);

    let mut previous = camera.near;
    for (i, view_proj) in set.view_proj.iter().enumerate() {
        let split = set.splits[i];
        let distance = 0.5 * (previous + split);
        let point = camera.position + camera.direction.normalize() * distance;
        let clip = *view_proj * point.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0, "cascade {i}: {ndc:?}");
        assert!((0.0..=1.0).contains(&ndc.z), "cascade {i} depth: {}", ndc.z);
        previous = split;
    }
}

#[test]
fn splits_are_exposed_on_the_set() {
    let calculator = CascadeCalculator::new(0.0, 1024);
    let set = calculator.compute_cascades(&camera(), Vec3::NEG_Y, 2);
    let expected = CascadeCalculator::compute_splits(2, 0.1, 100.0, 0.0);
    assert_eq!(set.splits, Vec4::from_array(expected));
    assert_relative_eq!(set.splits.x, 50.05, epsilon = 1e-3);
}

#[test]
fn sphere_bounds_never_shrink_the_cascade() {
    let camera = camera();
    let light = Vec3::new(0.2, -1.0, 0.4);
    let axis = CascadeCalculator::new(0.5, 2048).compute_cascades(&camera, light, 3);
    let sphere = CascadeCalculator::new(0.5, 2048)
        .with_bounds(CascadeBounds::Sphere)
        .compute_cascades(&camera, light, 3);

    for i in 0..3 {
        // Orthographic x scale is 1 / radius.
        let axis_scale = axis.view_proj[i].x_axis.length();
        let sphere_scale = sphere.view_proj[i].x_axis.length();
        assert!(sphere_scale <= axis_scale + 1e-6);
    }
}

#[test]
fn degenerate_camera_planes_still_give_finite_cascades() {
    let calculator = CascadeCalculator::new(0.5, 2048);
    let light = Vec3::new(-0.3, -1.0, 0.2);
    for (near, far) in [(0.0, 100.0), (-1.0, 50.0), (5.0, 5.0), (10.0, 2.0)] {
        let camera = CameraState {
            near,
            far,
            ..camera()
        };
        let set = calculator.compute_cascades(&camera, light, 4);
        assert!(set.splits.is_finite(), "near {near} far {far}: {:?}", set.splits);
        for pair in set.splits.to_array().windows(2) {
            assert!(pair[0] < pair[1], "near {near} far {far}: {:?}", set.splits);
        }
        for view_proj in &set.view_proj {
            assert!(view_proj.is_finite(), "near {near} far {far}");
        }
    }
}

#[test]
fn wide_frustum_centre_sits_past_the_slice() {
    // 90 degree square frustum: sec² of the corner ray is 3, so the single
    // slice [1, 9] is centred 15 units out.
    let camera = CameraState::new(
        Vec3::ZERO,
        Vec3::NEG_Z,
        90f32.to_radians(),
        1.0,
        1.0,
        9.0,
    );
    let set = CascadeCalculator::new(0.0, 1024).compute_cascades(&camera, Vec3::NEG_Y, 1);
    let centre = set.view_proj[0].project_point3(Vec3::new(0.0, 0.0, -15.0));
    assert_relative_eq!(centre.x, 0.0, epsilon = 4.0 / 1024.0);
    assert_relative_eq!(centre.y, 0.0, epsilon = 4.0 / 1024.0);
    assert_relative_eq!(centre.z, 0.75, epsilon = 1e-3);
}
