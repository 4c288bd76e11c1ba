use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use penumbra::*;
use std::hint::black_box;

fn camera() -> CameraState {
    CameraState::looking_at(Vec3::new(0.0, 8.0, 20.0), Vec3::ZERO, 16.0 / 9.0)
}

fn bench_compute_cascades(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_cascades");
    let camera = camera();
    let light = Vec3::new(-0.4, -1.0, -0.3);
    for &count in &[1u32, 2, 4] {
        group.bench_with_input(BenchmarkId::new("axis", count), &count, |b, &count| {
            let calculator = CascadeCalculator::new(0.5, 2048);
            b.iter(|| calculator.compute_cascades(black_box(&camera), black_box(light), count))
        });
        group.bench_with_input(BenchmarkId::new("sphere", count), &count, |b, &count| {
            let calculator = CascadeCalculator::new(0.5, 2048).with_bounds(CascadeBounds::Sphere);
            b.iter(|| calculator.compute_cascades(black_box(&camera), black_box(light), count))
        });
    }
    group.finish();
}

fn bench_update_cascades(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_cascades");
    let camera = camera();
    let calculator = CascadeCalculator::default();
    for &lights in &[4u16, 64] {
        let mut registry = LightRegistry::new(LightCapacity {
            point_lights: 1,
            point_shadows: 1,
            directional_lights: lights,
            directional_shadows: lights,
        });
        for i in 0..lights {
            let angle = f32::from(i) * 0.1;
            registry.create_directional_light(Vec3::new(angle.cos(), -1.0, angle.sin()), 1.0, 4);
        }
        group.bench_with_input(BenchmarkId::from_parameter(lights), &lights, |b, _| {
            b.iter(|| registry.update_cascades(black_box(&camera), &calculator))
        });
    }
    group.finish();
}

fn bench_registry_churn(c: &mut Criterion) {
    c.bench_function("registry_churn", |b| {
        let mut registry = LightRegistry::new(LightCapacity::default());
        b.iter(|| {
            let handles: Vec<_> = (0..16)
                .filter_map(|i| {
                    registry.create_point_light(Vec3::splat(i as f32), 1.0, 5.0, i % 2 == 0)
                })
                .collect();
            for handle in handles {
                registry.remove_light(black_box(handle));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_compute_cascades,
    bench_update_cascades,
    bench_registry_churn
);
criterion_main!(benches);
