//! Light registry: bounded point/directional light pools and their shadow slot bookkeeping.

use glam::{Mat4, Vec3, Vec4};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::handle::{LightHandle, LightKind};
use super::pool::LightPool;
use super::slot_pool::{ShadowSlotIndex, ShadowSlotPool};
use crate::camera::CameraState;
use crate::config::{LightCapacity, MAX_CASCADES, POINT_SHADOW_NEAR};
use crate::error::LightError;
use crate::shadow::cascade::CascadeCalculator;

/// Omnidirectional light with a finite radius of influence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointLightRecord {
    pub position: Vec3,
    pub brightness: f32,
    pub radius: f32,
    pub shadow_slot: Option<ShadowSlotIndex>,
}

/// Infinitely distant light with a cascaded shadow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionalLightRecord {
    /// Unit direction the light travels in.
    pub direction: Vec3,
    pub brightness: f32,
    pub num_cascades: u32,
    pub shadow_slot: Option<ShadowSlotIndex>,
    pub cascade_splits: Vec4,
    pub cascade_view_proj: [Mat4; MAX_CASCADES],
}

impl DirectionalLightRecord {
    fn refresh_cascades(&mut self, camera: &CameraState, calculator: &CascadeCalculator) {
        let set = calculator.compute_cascades(camera, self.direction, self.num_cascades);
        self.cascade_splits = set.splits;
        self.cascade_view_proj = set.view_proj;
    }
}

/// Owner of every light and of the shadow-slot allocation state.
///
/// All handle-consuming calls validate kind, index, liveness and generation, so a
/// handle kept after `remove_light` can never reach the light that reuses its slot.
#[derive(Debug, Clone)]
pub struct LightRegistry {
    capacity: LightCapacity,
    point_lights: LightPool<PointLightRecord>,
    directional_lights: LightPool<DirectionalLightRecord>,
    point_shadows: ShadowSlotPool,
    directional_shadows: ShadowSlotPool,
}

impl Default for LightRegistry {
    fn default() -> Self {
        Self::new(LightCapacity::default())
    }
}

fn check_finite(value: Vec3, what: &'static str) -> Result<(), LightError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LightError::InvalidArgument(what))
    }
}

fn check_brightness(brightness: f32) -> Result<(), LightError> {
    if brightness.is_finite() && brightness >= 0.0 {
        Ok(())
    } else {
        Err(LightError::InvalidArgument("brightness must be finite and non-negative"))
    }
}

fn check_radius(radius: f32) -> Result<(), LightError> {
    // The cube projection degenerates at or inside its own near plane.
    if radius.is_finite() && radius > POINT_SHADOW_NEAR {
        Ok(())
    } else {
        Err(LightError::InvalidArgument("radius must exceed the point shadow near plane"))
    }
}

fn normalize_direction(direction: Vec3) -> Result<Vec3, LightError> {
    check_finite(direction, "direction must be finite")?;
    direction
        .try_normalize()
        .ok_or(LightError::InvalidArgument("direction must be non-zero"))
}

fn expect_kind(handle: LightHandle, expected: LightKind) -> Result<(), LightError> {
    if handle.kind() == expected {
        Ok(())
    } else {
        Err(LightError::KindMismatch {
            expected,
            found: handle.kind(),
        })
    }
}

impl LightRegistry {
    pub fn new(capacity: LightCapacity) -> Self {
        Self {
            capacity,
            point_lights: LightPool::with_capacity(capacity.point_lights),
            directional_lights: LightPool::with_capacity(capacity.directional_lights),
            point_shadows: ShadowSlotPool::new(capacity.point_shadows),
            directional_shadows: ShadowSlotPool::new(capacity.directional_shadows),
        }
    }

    pub fn capacity(&self) -> LightCapacity {
        self.capacity
    }

    pub fn max_point_lights(&self) -> u16 {
        self.capacity.point_lights
    }

    pub fn max_point_shadows(&self) -> u16 {
        self.capacity.point_shadows
    }

    pub fn max_directional_lights(&self) -> u16 {
        self.capacity.directional_lights
    }

    pub fn max_directional_shadows(&self) -> u16 {
        self.capacity.directional_shadows
    }

    /// Adds a point light. Returns `None` when the point pool is full or the input is
    /// unusable. A light that wants a shadow but finds the shadow pool exhausted is
    /// still created, without a shadow.
    pub fn create_point_light(
        &mut self,
        position: Vec3,
        brightness: f32,
        radius: f32,
        want_shadow: bool,
    ) -> Option<LightHandle> {
        if let Err(err) = check_finite(position, "position must be finite")
            .and(check_brightness(brightness))
            .and(check_radius(radius))
        {
            warn!("[LightRegistry] rejected point light: {err}");
            return None;
        }

        let (index, generation) = self.point_lights.insert(PointLightRecord {
            position,
            brightness,
            radius,
            shadow_slot: None,
        })?;

        if want_shadow {
            let slot = self.point_shadows.allocate(index);
            if slot.is_none() {
                warn!("[LightRegistry] point shadow pool exhausted; light {index} is shadowless");
            }
            if let Some(record) = self.point_lights.get_mut(index, generation) {
                record.shadow_slot = slot;
            }
        }

        debug!("[LightRegistry] point light {index} (gen {generation}) created");
        Some(LightHandle::new(LightKind::Point, generation, index))
    }

    /// Adds a directional light. `num_cascades == 0` creates a shadowless light; any
    /// other value is clamped to `1..=MAX_CASCADES` and requests a shadow slot.
    pub fn create_directional_light(
        &mut self,
        direction: Vec3,
        brightness: f32,
        num_cascades: u32,
    ) -> Option<LightHandle> {
        let direction = match normalize_direction(direction).and_then(|dir| {
            check_brightness(brightness)?;
            Ok(dir)
        }) {
            Ok(direction) => direction,
            Err(err) => {
                warn!("[LightRegistry] rejected directional light: {err}");
                return None;
            }
        };

        let (index, generation) = self.directional_lights.insert(DirectionalLightRecord {
            direction,
            brightness,
            num_cascades: num_cascades.clamp(1, MAX_CASCADES as u32),
            shadow_slot: None,
            cascade_splits: Vec4::ZERO,
            cascade_view_proj: [Mat4::IDENTITY; MAX_CASCADES],
        })?;

        if num_cascades > 0 {
            let slot = self.directional_shadows.allocate(index);
            if slot.is_none() {
                warn!(
                    "[LightRegistry] directional shadow pool exhausted; light {index} is shadowless"
                );
            }
            if let Some(record) = self.directional_lights.get_mut(index, generation) {
                record.shadow_slot = slot;
            }
        }

        debug!("[LightRegistry] directional light {index} (gen {generation}) created");
        Some(LightHandle::new(LightKind::Directional, generation, index))
    }

    /// Removes a light and releases its shadow slot. Stale or malformed handles are
    /// ignored and return `false`.
    pub fn remove_light(&mut self, handle: LightHandle) -> bool {
        let index = handle.index();
        let generation = handle.generation();
        match handle.kind() {
            LightKind::Point => {
                let Some(record) = self.point_lights.remove(index, generation) else {
                    return false;
                };
                if let Some(slot) = record.shadow_slot {
                    self.point_shadows.free(slot);
                }
            }
            LightKind::Directional => {
                let Some(record) = self.directional_lights.remove(index, generation) else {
                    return false;
                };
                if let Some(slot) = record.shadow_slot {
                    self.directional_shadows.free(slot);
                }
            }
        }
        debug!("[LightRegistry] {:?} light {index} (gen {generation}) removed", handle.kind());
        true
    }

    /// Removes every light and frees every shadow slot.
    pub fn clear(&mut self) {
        let handles: Vec<LightHandle> = self
            .point_lights()
            .map(|(handle, _)| handle)
            .chain(self.directional_lights().map(|(handle, _)| handle))
            .collect();
        for handle in handles {
            self.remove_light(handle);
        }
    }

    pub fn is_valid(&self, handle: LightHandle) -> bool {
        match handle.kind() {
            LightKind::Point => self.point_lights.is_valid(handle.index(), handle.generation()),
            LightKind::Directional => self
                .directional_lights
                .is_valid(handle.index(), handle.generation()),
        }
    }

    pub fn point_light(&self, handle: LightHandle) -> Option<&PointLightRecord> {
        if handle.kind() != LightKind::Point {
            return None;
        }
        self.point_lights.get(handle.index(), handle.generation())
    }

    pub fn directional_light(&self, handle: LightHandle) -> Option<&DirectionalLightRecord> {
        if handle.kind() != LightKind::Directional {
            return None;
        }
        self.directional_lights.get(handle.index(), handle.generation())
    }

    fn point_mut(&mut self, handle: LightHandle) -> Result<&mut PointLightRecord, LightError> {
        expect_kind(handle, LightKind::Point)?;
        self.point_lights
            .get_mut(handle.index(), handle.generation())
            .ok_or(LightError::InvalidHandle)
    }

    fn directional_mut(
        &mut self,
        handle: LightHandle,
    ) -> Result<&mut DirectionalLightRecord, LightError> {
        expect_kind(handle, LightKind::Directional)?;
        self.directional_lights
            .get_mut(handle.index(), handle.generation())
            .ok_or(LightError::InvalidHandle)
    }

    pub fn set_position(&mut self, handle: LightHandle, position: Vec3) -> Result<(), LightError> {
        let record = self.point_mut(handle)?;
        check_finite(position, "position must be finite")?;
        record.position = position;
        Ok(())
    }

    pub fn set_radius(&mut self, handle: LightHandle, radius: f32) -> Result<(), LightError> {
        let record = self.point_mut(handle)?;
        check_radius(radius)?;
        record.radius = radius;
        Ok(())
    }

    /// Sets the direction of a directional light; the stored value is normalised.
    pub fn set_direction(
        &mut self,
        handle: LightHandle,
        direction: Vec3,
    ) -> Result<(), LightError> {
        let record = self.directional_mut(handle)?;
        record.direction = normalize_direction(direction)?;
        Ok(())
    }

    pub fn set_cascade_count(
        &mut self,
        handle: LightHandle,
        num_cascades: u32,
    ) -> Result<(), LightError> {
        let record = self.directional_mut(handle)?;
        if num_cascades == 0 {
            return Err(LightError::InvalidArgument("cascade count must be at least 1"));
        }
        record.num_cascades = num_cascades.min(MAX_CASCADES as u32);
        Ok(())
    }

    pub fn set_brightness(
        &mut self,
        handle: LightHandle,
        brightness: f32,
    ) -> Result<(), LightError> {
        match handle.kind() {
            LightKind::Point => {
                let record = self.point_mut(handle)?;
                check_brightness(brightness)?;
                record.brightness = brightness;
            }
            LightKind::Directional => {
                let record = self.directional_mut(handle)?;
                check_brightness(brightness)?;
                record.brightness = brightness;
            }
        }
        Ok(())
    }

    /// Enables or disables the shadow of a light and returns whether it now casts one.
    pub fn set_shadow(&mut self, handle: LightHandle, enabled: bool) -> bool {
        let index = handle.index();
        let generation = handle.generation();
        let (slot, pool) = match handle.kind() {
            LightKind::Point => match self.point_lights.get_mut(index, generation) {
                Some(record) => (&mut record.shadow_slot, &mut self.point_shadows),
                None => return false,
            },
            LightKind::Directional => match self.directional_lights.get_mut(index, generation) {
                Some(record) => (&mut record.shadow_slot, &mut self.directional_shadows),
                None => return false,
            },
        };

        match (enabled, *slot) {
            (true, Some(_)) => true,
            (true, None) => {
                *slot = pool.allocate(index);
                if slot.is_none() {
                    warn!(
                        "[LightRegistry] {:?} shadow pool exhausted; light {} stays shadowless",
                        handle.kind(),
                        index
                    );
                }
                slot.is_some()
            }
            (false, Some(current)) => {
                pool.free(current);
                *slot = None;
                false
            }
            (false, None) => false,
        }
    }

    /// Live point lights with their handles, in slot order.
    pub fn point_lights(&self) -> impl Iterator<Item = (LightHandle, &PointLightRecord)> + '_ {
        self.point_lights.iter().map(|(index, generation, record)| {
            (LightHandle::new(LightKind::Point, generation, index), record)
        })
    }

    /// Live directional lights with their handles, in slot order.
    pub fn directional_lights(
        &self,
    ) -> impl Iterator<Item = (LightHandle, &DirectionalLightRecord)> + '_ {
        self.directional_lights.iter().map(|(index, generation, record)| {
            (LightHandle::new(LightKind::Directional, generation, index), record)
        })
    }

    /// Per-slot view of the point pool including free slots.
    pub fn point_slots(&self) -> impl Iterator<Item = Option<&PointLightRecord>> + '_ {
        self.point_lights.slots()
    }

    /// Per-slot view of the directional pool including free slots.
    pub fn directional_slots(&self) -> impl Iterator<Item = Option<&DirectionalLightRecord>> + '_ {
        self.directional_lights.slots()
    }

    pub fn point_light_count(&self) -> usize {
        self.point_lights.len()
    }

    pub fn directional_light_count(&self) -> usize {
        self.directional_lights.len()
    }

    pub fn point_shadow_pool(&self) -> &ShadowSlotPool {
        &self.point_shadows
    }

    pub fn directional_shadow_pool(&self) -> &ShadowSlotPool {
        &self.directional_shadows
    }

    /// Recomputes cascade splits and matrices of every live directional light.
    pub fn update_cascades(&mut self, camera: &CameraState, calculator: &CascadeCalculator) {
        let records = self.directional_lights.live_slots_mut();

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            records
                .into_par_iter()
                .for_each(|record| record.refresh_cascades(camera, calculator));
        }

        #[cfg(not(feature = "parallel"))]
        {
            for record in records {
                record.refresh_cascades(camera, calculator);
            }
        }
    }
}
