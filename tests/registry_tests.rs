use penumbra::light::LightHandle;
use penumbra::{LightCapacity, LightError, LightKind, LightRegistry, Vec3};

fn registry_with(point_lights: u16, point_shadows: u16) -> LightRegistry {
    LightRegistry::new(LightCapacity {
        point_lights,
        point_shadows,
        directional_lights: 2,
        directional_shadows: 1,
    })
}

#[test]
fn full_pool_rejects_then_reuses_slot_with_new_generation() {
    let mut lights = registry_with(2, 2);
    let first = lights
        .create_point_light(Vec3::ZERO, 1.0, 5.0, true)
        .expect("first light");
    let second = lights
        .create_point_light(Vec3::X, 1.0, 5.0, true)
        .expect("second light");
    assert!(lights.create_point_light(Vec3::Y, 1.0, 5.0, true).is_none());
    assert_eq!(LightHandle::encode(None), u32::MAX);

    assert!(lights.remove_light(first));
    let reused = lights
        .create_point_light(Vec3::Z, 2.0, 3.0, true)
        .expect("slot freed by removal");

    assert_eq!(reused.index(), first.index());
    assert_ne!(reused.generation(), first.generation());
    assert!(!lights.is_valid(first));
    assert!(lights.is_valid(second));
    assert!(lights.is_valid(reused));
    assert_eq!(lights.point_light_count(), 2);
}

#[test]
fn stale_handle_is_rejected_everywhere() {
    let mut lights = registry_with(4, 4);
    let handle = lights
        .create_point_light(Vec3::ZERO, 1.0, 5.0, false)
        .expect("light");
    assert!(lights.remove_light(handle));

    assert!(!lights.remove_light(handle));
    assert!(lights.point_light(handle).is_none());
    assert_eq!(
        lights.set_position(handle, Vec3::ONE),
        Err(LightError::InvalidHandle)
    );
    assert_eq!(
        lights.set_brightness(handle, 3.0),
        Err(LightError::InvalidHandle)
    );
    assert!(!lights.set_shadow(handle, true));
}

#[test]
fn shadow_pool_exhaustion_creates_shadowless_light() {
    let mut lights = registry_with(4, 1);
    let shadowed = lights
        .create_point_light(Vec3::ZERO, 1.0, 5.0, true)
        .expect("light");
    let shadowless = lights
        .create_point_light(Vec3::X, 1.0, 5.0, true)
        .expect("light is created even without a shadow slot");

    assert!(lights.point_light(shadowed).unwrap().shadow_slot.is_some());
    assert!(lights.point_light(shadowless).unwrap().shadow_slot.is_none());
    assert!(lights.point_shadow_pool().is_exhausted());

    // Freeing the slot lets the second light pick it up.
    assert!(!lights.set_shadow(shadowed, false));
    assert!(lights.set_shadow(shadowless, true));
    assert!(lights.point_light(shadowless).unwrap().shadow_slot.is_some());
}

#[test]
fn removal_returns_shadow_slot_to_pool() {
    let mut lights = registry_with(4, 2);
    let a = lights.create_point_light(Vec3::ZERO, 1.0, 5.0, true).unwrap();
    let _b = lights.create_point_light(Vec3::X, 1.0, 5.0, true).unwrap();
    assert_eq!(lights.point_shadow_pool().live_count(), 2);

    lights.remove_light(a);
    assert_eq!(lights.point_shadow_pool().live_count(), 1);
    lights.remove_light(a);
    assert_eq!(lights.point_shadow_pool().live_count(), 1);
}

#[test]
fn mutators_reject_wrong_light_kind() {
    let mut lights = registry_with(4, 4);
    let sun = lights
        .create_directional_light(Vec3::new(0.0, -1.0, 0.0), 1.0, 4)
        .expect("directional light");
    let lamp = lights
        .create_point_light(Vec3::ZERO, 1.0, 5.0, false)
        .expect("point light");

    assert_eq!(
        lights.set_position(sun, Vec3::ONE),
        Err(LightError::KindMismatch {
            expected: LightKind::Point,
            found: LightKind::Directional,
        })
    );
    assert_eq!(
        lights.set_direction(lamp, Vec3::X),
        Err(LightError::KindMismatch {
            expected: LightKind::Directional,
            found: LightKind::Point,
        })
    );
    // Brightness applies to both kinds.
    assert!(lights.set_brightness(sun, 0.5).is_ok());
    assert!(lights.set_brightness(lamp, 0.5).is_ok());
}

#[test]
fn directional_direction_is_normalised_and_cascades_clamped() {
    let mut lights = registry_with(1, 1);
    let sun = lights
        .create_directional_light(Vec3::new(0.0, -10.0, 0.0), 1.0, 9)
        .expect("directional light");
    let record = lights.directional_light(sun).unwrap();
    assert!((record.direction.length() - 1.0).abs() < 1e-6);
    assert_eq!(record.num_cascades, 4);
    assert!(record.shadow_slot.is_some());

    assert!(lights
        .create_directional_light(Vec3::ZERO, 1.0, 2)
        .is_none());
    assert!(matches!(
        lights.set_cascade_count(sun, 0),
        Err(LightError::InvalidArgument(_))
    ));
    assert!(lights.set_cascade_count(sun, 2).is_ok());
    assert_eq!(lights.directional_light(sun).unwrap().num_cascades, 2);
}

#[test]
fn handle_bits_round_trip_through_u32() {
    let mut lights = registry_with(4, 4);
    let handle = lights
        .create_point_light(Vec3::ZERO, 1.0, 5.0, false)
        .unwrap();
    let bits: u32 = handle.into();
    let decoded = LightHandle::try_from(bits).expect("valid bits");
    assert_eq!(decoded, handle);
    assert!(lights.is_valid(decoded));
    assert_eq!(
        LightHandle::try_from(u32::MAX),
        Err(LightError::InvalidHandle)
    );
}

#[test]
fn clear_empties_both_pools() {
    let mut lights = registry_with(4, 4);
    lights.create_point_light(Vec3::ZERO, 1.0, 5.0, true).unwrap();
    lights
        .create_directional_light(Vec3::NEG_Y, 1.0, 3)
        .unwrap();
    lights.clear();
    assert_eq!(lights.point_light_count(), 0);
    assert_eq!(lights.directional_light_count(), 0);
    assert_eq!(lights.point_shadow_pool().live_count(), 0);
    assert_eq!(lights.directional_shadow_pool().live_count(), 0);
}

#[test]
fn point_radius_must_clear_the_shadow_near_plane() {
    let mut lights = registry_with(4, 2);
    assert!(lights.create_point_light(Vec3::ZERO, 1.0, 0.3, true).is_none());
    assert!(lights.create_point_light(Vec3::ZERO, 1.0, 0.1, false).is_none());
    assert_eq!(lights.point_light_count(), 0);

    let handle = lights
        .create_point_light(Vec3::ZERO, 1.0, 0.31, true)
        .expect("radius just past the near plane");
    assert!(matches!(
        lights.set_radius(handle, 0.2),
        Err(LightError::InvalidArgument(_))
    ));
    assert_eq!(lights.point_light(handle).unwrap().radius, 0.31);

    lights.set_radius(handle, 2.0).unwrap();
    assert_eq!(lights.point_light(handle).unwrap().radius, 2.0);
}
